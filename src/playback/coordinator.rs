//! Cross-paragraph playback arbitration.
//!
//! The coordinator owns the per-paragraph audio queues and the only handle
//! that may start or stop playback. It enforces the two system invariants:
//! at most one audio stream plays at any instant, and each paragraph's
//! fragments are consumed in strictly ascending sequence order.
//!
//! Arbitration rules:
//! - idle + arrival at the paragraph's frontier → play immediately;
//! - playing the same paragraph → the fragment waits its turn in the queue;
//! - playing another paragraph → never preempted, never dropped: the
//!   fragment stays queued until the coordinator next goes idle and
//!   re-inspects the queues. Deferral may be indefinite.

use crate::media::AudioClip;
use crate::sequence::SequenceQueue;
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};

use super::player::{AudioPlayer, PlaybackEvent};

/// One observed autoplay trigger. The full triple deduplicates re-observed
/// signals: a single inbound event is never processed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AutoplayRequest {
    pub paragraph: u32,
    pub sequence: u32,
    pub timestamp_ms: u64,
}

/// What the coordinator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing { paragraph: u32, sequence: u32 },
}

/// Result of a manual play/pause toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Playback of the requested paragraph started.
    Started,
    /// The requested paragraph was playing and has been paused.
    Paused,
    /// Nothing cached for this paragraph; the caller should request
    /// generation through the external request interface.
    NeedsGeneration,
}

pub struct PlaybackCoordinator {
    player: Box<dyn AudioPlayer>,
    queues: BTreeMap<u32, SequenceQueue<AudioClip>>,
    state: PlaybackState,
    /// Id of the playback whose completion we are waiting for. Events with
    /// any other id are stale and ignored.
    active_playback: Option<u64>,
    next_playback_id: u64,
    seen: HashSet<AutoplayRequest>,
}

impl PlaybackCoordinator {
    pub fn new(player: Box<dyn AudioPlayer>) -> Self {
        Self {
            player,
            queues: BTreeMap::new(),
            state: PlaybackState::Idle,
            active_playback: None,
            next_playback_id: 0,
            seen: HashSet::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, PlaybackState::Idle)
    }

    /// Number of buffered fragments for a paragraph.
    pub fn queued(&self, paragraph: u32) -> usize {
        self.queues.get(&paragraph).map_or(0, SequenceQueue::len)
    }

    /// Handle one arriving audio fragment.
    pub fn on_arrival(&mut self, request: AutoplayRequest, clip: AudioClip) {
        if !self.seen.insert(request) {
            debug!(
                "duplicate autoplay signal for paragraph {} fragment {} ignored",
                request.paragraph, request.sequence
            );
            return;
        }

        let queue = self.queues.entry(request.paragraph).or_default();
        if queue.insert(request.sequence, clip) {
            debug!(
                "fragment {}:{} redelivered; payload replaced",
                request.paragraph, request.sequence
            );
        }

        match self.state {
            PlaybackState::Idle => {
                self.try_start(request.paragraph);
            }
            PlaybackState::Playing { paragraph, .. } if paragraph == request.paragraph => {
                // Same paragraph: picked up when the current fragment ends.
            }
            PlaybackState::Playing { .. } => {
                // Another paragraph owns the audio output. Never interrupt,
                // never drop: the fragment waits for the next idle rescan.
                debug!(
                    "paragraph {} fragment {} deferred behind active playback",
                    request.paragraph, request.sequence
                );
            }
        }
    }

    /// Handle a completion report from the player.
    pub fn on_player_event(&mut self, event: PlaybackEvent) {
        if self.active_playback != Some(event.playback_id()) {
            debug!("ignoring stale playback event {:?}", event.playback_id());
            return;
        }

        let (paragraph, sequence) = match event {
            PlaybackEvent::Finished {
                paragraph,
                sequence,
                ..
            } => (paragraph, sequence),
            PlaybackEvent::Failed {
                paragraph,
                sequence,
                ref message,
                ..
            } => {
                // Non-fatal: log and advance to the next queued fragment.
                warn!("playback of {paragraph}:{sequence} failed: {message}");
                (paragraph, sequence)
            }
        };

        self.active_playback = None;
        self.state = PlaybackState::Idle;

        if let Some(queue) = self.queues.get_mut(&paragraph) {
            queue.advance_past(sequence);
            // Continue this paragraph with the fragment immediately
            // following the finished one; a gap does not stall the rest.
            if let Some(next) = queue.successor(sequence).map(|item| item.sequence) {
                if next > 0 {
                    queue.advance_past(next - 1);
                }
                if self.try_start(paragraph) {
                    return;
                }
            }
        }

        // Paragraph exhausted: re-inspect the other queues for deferred work.
        self.resume_any();
    }

    /// A paragraph-scoped error for one fragment: the position is marked
    /// failed so the gap never stalls the fragments behind it.
    pub fn on_sequence_failed(&mut self, paragraph: u32, sequence: u32) {
        let Some(queue) = self.queues.get_mut(&paragraph) else {
            return;
        };
        if queue.frontier() == sequence {
            debug!("skipping failed fragment {paragraph}:{sequence}");
            queue.advance_past(sequence);
            if self.is_idle() {
                self.try_start(paragraph);
            }
        }
    }

    /// Manual play/pause of one paragraph. Takes precedence over the
    /// never-preempt rule: an explicit user action may displace another
    /// paragraph's narration.
    pub fn toggle(&mut self, paragraph: u32) -> ToggleOutcome {
        if let PlaybackState::Playing {
            paragraph: active, ..
        } = self.state
        {
            if active == paragraph {
                self.stop_current();
                return ToggleOutcome::Paused;
            }
            self.stop_current();
        }

        let Some(queue) = self.queues.get_mut(&paragraph) else {
            return ToggleOutcome::NeedsGeneration;
        };
        if queue.is_empty() {
            return ToggleOutcome::NeedsGeneration;
        }

        // Replay from the start once the paragraph has been fully consumed.
        if !queue.has_unconsumed() {
            queue.rewind();
        }
        // A manual play starts at the first cached fragment even when
        // earlier positions are missing.
        if let Some(first) = queue.first_unconsumed().map(|item| item.sequence) {
            if first > 0 {
                queue.advance_past(first - 1);
            }
        }

        if self.try_start(paragraph) {
            ToggleOutcome::Started
        } else {
            ToggleOutcome::NeedsGeneration
        }
    }

    /// Stop everything and drop all task-scoped playback state. Called on
    /// task reset.
    pub fn stop_all(&mut self) {
        self.stop_current();
        self.queues.clear();
        self.seen.clear();
    }

    fn stop_current(&mut self) {
        self.player.stop();
        self.active_playback = None;
        self.state = PlaybackState::Idle;
    }

    /// Start the paragraph's frontier fragment, if it has arrived. Fragments
    /// whose playback fails to start are skipped, not fatal.
    fn try_start(&mut self, paragraph: u32) -> bool {
        loop {
            let Some(queue) = self.queues.get(&paragraph) else {
                return false;
            };
            let Some(item) = queue.startable() else {
                return false;
            };
            let sequence = item.sequence;
            let clip = item.payload.clone();

            let playback_id = self.next_playback_id;
            self.next_playback_id += 1;

            match self.player.play(playback_id, &clip) {
                Ok(()) => {
                    self.active_playback = Some(playback_id);
                    self.state = PlaybackState::Playing {
                        paragraph,
                        sequence,
                    };
                    return true;
                }
                Err(e) => {
                    warn!("could not start {paragraph}:{sequence}: {e}; skipping");
                    if let Some(queue) = self.queues.get_mut(&paragraph) {
                        queue.advance_past(sequence);
                    }
                }
            }
        }
    }

    /// Scan all paragraphs (lowest first) for a startable fragment.
    fn resume_any(&mut self) {
        let paragraphs: Vec<u32> = self.queues.keys().copied().collect();
        for paragraph in paragraphs {
            if self.try_start(paragraph) {
                return;
            }
        }
    }
}
