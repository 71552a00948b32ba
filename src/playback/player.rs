//! Audio player seam.
//!
//! [`AudioPlayer`] starts and stops one clip at a time; completion (natural
//! end or failure) is reported asynchronously as a [`PlaybackEvent`] tagged
//! with the playback id, so a stopped clip's late event can be told apart
//! from the active one. The rodio backend lives on a dedicated thread
//! because audio output streams are not `Send`.

use crate::error::{Result, StoryloomError};
use crate::media::{AudioClip, MediaHandle};
use log::{debug, warn};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Completion report for one started clip.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The clip played to its natural end (or was stopped).
    Finished {
        playback_id: u64,
        paragraph: u32,
        sequence: u32,
    },
    /// The clip could not be played to the end.
    Failed {
        playback_id: u64,
        paragraph: u32,
        sequence: u32,
        message: String,
    },
}

impl PlaybackEvent {
    pub fn playback_id(&self) -> u64 {
        match self {
            PlaybackEvent::Finished { playback_id, .. }
            | PlaybackEvent::Failed { playback_id, .. } => *playback_id,
        }
    }
}

/// Drives at most one audio stream. Only the playback coordinator calls this.
pub trait AudioPlayer: Send {
    /// Start playing a clip, replacing whatever was playing. Completion is
    /// reported later as a [`PlaybackEvent`] carrying `playback_id`.
    fn play(&mut self, playback_id: u64, clip: &AudioClip) -> Result<()>;

    /// Stop the current clip, if any.
    fn stop(&mut self);
}

enum PlayerCommand {
    Play {
        playback_id: u64,
        paragraph: u32,
        sequence: u32,
        media: MediaHandle,
        volume: f32,
    },
    Stop,
}

/// Rodio-backed player. The output stream and sinks live on a dedicated
/// thread; this handle only passes commands across.
pub struct RodioPlayer {
    commands: mpsc::UnboundedSender<PlayerCommand>,
    volume: f32,
}

impl RodioPlayer {
    /// Spawn the playback thread against the default output device.
    pub fn new(events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || playback_thread(command_rx, events));
        Self {
            commands,
            volume: 1.0,
        }
    }

    /// Set output volume, 0.0 to 1.0.
    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume.clamp(0.0, 1.0);
        self
    }
}

impl AudioPlayer for RodioPlayer {
    fn play(&mut self, playback_id: u64, clip: &AudioClip) -> Result<()> {
        self.commands
            .send(PlayerCommand::Play {
                playback_id,
                paragraph: clip.paragraph,
                sequence: clip.sequence,
                media: clip.media.clone(),
                volume: self.volume,
            })
            .map_err(|_| StoryloomError::Playback {
                message: "playback thread terminated".to_string(),
            })
    }

    fn stop(&mut self) {
        let _ = self.commands.send(PlayerCommand::Stop);
    }
}

fn playback_thread(
    mut commands: mpsc::UnboundedReceiver<PlayerCommand>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
) {
    let stream = match rodio::OutputStreamBuilder::open_default_stream() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("no audio output device: {e}");
            // Fail every play request so the coordinator can advance.
            while let Some(command) = commands.blocking_recv() {
                if let PlayerCommand::Play {
                    playback_id,
                    paragraph,
                    sequence,
                    ..
                } = command
                {
                    let _ = events.send(PlaybackEvent::Failed {
                        playback_id,
                        paragraph,
                        sequence,
                        message: format!("no audio output device: {e}"),
                    });
                }
            }
            return;
        }
    };

    let mut current: Option<Arc<rodio::Sink>> = None;

    while let Some(command) = commands.blocking_recv() {
        match command {
            PlayerCommand::Play {
                playback_id,
                paragraph,
                sequence,
                media,
                volume,
            } => {
                if let Some(sink) = current.take() {
                    sink.stop();
                }

                let decoder = match rodio::Decoder::new(Cursor::new(media)) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        let _ = events.send(PlaybackEvent::Failed {
                            playback_id,
                            paragraph,
                            sequence,
                            message: format!("undecodable audio: {e}"),
                        });
                        continue;
                    }
                };

                let sink = Arc::new(rodio::Sink::connect_new(stream.mixer()));
                sink.set_volume(volume);
                sink.append(decoder);
                debug!("playing paragraph {paragraph} fragment {sequence}");

                // Watcher reports completion; a stop() makes it fire early
                // and the coordinator discards the stale id.
                let watcher_sink = sink.clone();
                let watcher_events = events.clone();
                std::thread::spawn(move || {
                    watcher_sink.sleep_until_end();
                    let _ = watcher_events.send(PlaybackEvent::Finished {
                        playback_id,
                        paragraph,
                        sequence,
                    });
                });

                current = Some(sink);
            }
            PlayerCommand::Stop => {
                if let Some(sink) = current.take() {
                    sink.stop();
                }
            }
        }
    }
}

#[derive(Default)]
struct MockPlayerState {
    played: Vec<(u32, u32)>,
    current: Option<(u64, u32, u32)>,
    stops: u32,
}

/// Scripted player for tests. Records every started clip; completion is
/// driven either automatically (`with_auto_complete`) or manually through
/// [`MockPlayerHandle`].
pub struct MockPlayer {
    state: Arc<Mutex<MockPlayerState>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    auto_complete: bool,
    fail_on: HashSet<(u32, u32)>,
}

impl MockPlayer {
    pub fn new(events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockPlayerState::default())),
            events,
            auto_complete: false,
            fail_on: HashSet::new(),
        }
    }

    /// Finish every clip immediately after it starts.
    pub fn with_auto_complete(mut self) -> Self {
        self.auto_complete = true;
        self
    }

    /// Make `play` return an error for one specific fragment.
    pub fn with_play_error(mut self, paragraph: u32, sequence: u32) -> Self {
        self.fail_on.insert((paragraph, sequence));
        self
    }

    /// Handle for inspecting state and finishing clips manually.
    pub fn handle(&self) -> MockPlayerHandle {
        MockPlayerHandle {
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }
}

impl AudioPlayer for MockPlayer {
    fn play(&mut self, playback_id: u64, clip: &AudioClip) -> Result<()> {
        if self.fail_on.contains(&(clip.paragraph, clip.sequence)) {
            return Err(StoryloomError::Playback {
                message: format!(
                    "scripted failure for {}:{}",
                    clip.paragraph, clip.sequence
                ),
            });
        }

        let mut state = self.state.lock().expect("mock player lock");
        state.played.push((clip.paragraph, clip.sequence));
        state.current = Some((playback_id, clip.paragraph, clip.sequence));
        drop(state);

        if self.auto_complete {
            let _ = self.events.send(PlaybackEvent::Finished {
                playback_id,
                paragraph: clip.paragraph,
                sequence: clip.sequence,
            });
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().expect("mock player lock");
        state.current = None;
        state.stops += 1;
    }
}

/// Test-side view of a [`MockPlayer`].
#[derive(Clone)]
pub struct MockPlayerHandle {
    state: Arc<Mutex<MockPlayerState>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl MockPlayerHandle {
    /// Every (paragraph, sequence) started so far, in start order.
    pub fn played(&self) -> Vec<(u32, u32)> {
        self.state.lock().expect("mock player lock").played.clone()
    }

    /// The clip currently "playing", if any.
    pub fn current(&self) -> Option<(u32, u32)> {
        self.state
            .lock()
            .expect("mock player lock")
            .current
            .map(|(_, paragraph, sequence)| (paragraph, sequence))
    }

    /// Number of stop() calls observed.
    pub fn stops(&self) -> u32 {
        self.state.lock().expect("mock player lock").stops
    }

    /// Report natural completion of the current clip.
    pub fn finish_current(&self) {
        let current = self.state.lock().expect("mock player lock").current.take();
        if let Some((playback_id, paragraph, sequence)) = current {
            let _ = self.events.send(PlaybackEvent::Finished {
                playback_id,
                paragraph,
                sequence,
            });
        }
    }

    /// Report a mid-playback failure of the current clip.
    pub fn fail_current(&self, message: &str) {
        let current = self.state.lock().expect("mock player lock").current.take();
        if let Some((playback_id, paragraph, sequence)) = current {
            let _ = self.events.send(PlaybackEvent::Failed {
                playback_id,
                paragraph,
                sequence,
                message: message.to_string(),
            });
        }
    }
}
