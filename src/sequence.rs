//! Ordered buffering of out-of-order result fragments.
//!
//! One queue exists per (paragraph, media kind). Fragments arrive in
//! arbitrary transport order and are kept sorted by their explicit sequence
//! number; a consumption watermark tracks how far playback has advanced.
//! Gaps are tolerated: a missing sequence number delays that position, it
//! never blocks already-arrived earlier items.

use std::collections::BTreeMap;
use std::time::Instant;

/// One buffered fragment. Ordering key is `sequence`, never arrival time.
#[derive(Debug, Clone)]
pub struct SequencedItem<T> {
    pub sequence: u32,
    pub payload: T,
    pub arrived_at: Instant,
}

/// Sorted fragment buffer with a consumption watermark.
#[derive(Debug)]
pub struct SequenceQueue<T> {
    items: BTreeMap<u32, SequencedItem<T>>,
    /// Highest sequence number already consumed (or skipped).
    consumed: Option<u32>,
}

impl<T> Default for SequenceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SequenceQueue<T> {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            consumed: None,
        }
    }

    /// Insert a fragment, keeping the collection sorted by sequence number.
    ///
    /// Repeated delivery of the same sequence number overwrites the previous
    /// payload (last write wins) and never duplicates. Returns true when an
    /// existing entry was replaced.
    pub fn insert(&mut self, sequence: u32, payload: T) -> bool {
        self.items
            .insert(
                sequence,
                SequencedItem {
                    sequence,
                    payload,
                    arrived_at: Instant::now(),
                },
            )
            .is_some()
    }

    /// All buffered fragments in ascending sequence order.
    pub fn items(&self) -> impl Iterator<Item = &SequencedItem<T>> {
        self.items.values()
    }

    /// The fragment stored for an exact sequence number.
    pub fn get(&self, sequence: u32) -> Option<&SequencedItem<T>> {
        self.items.get(&sequence)
    }

    /// The next sequence number eligible to start playback: one past the
    /// watermark, or 0 when nothing has been consumed yet.
    pub fn frontier(&self) -> u32 {
        match self.consumed {
            Some(sequence) => sequence.saturating_add(1),
            None => 0,
        }
    }

    /// The fragment sitting exactly at the frontier, if it has arrived.
    ///
    /// Playback may only *start* here; a fragment beyond a missing frontier
    /// position waits until the gap fills or is explicitly skipped.
    pub fn startable(&self) -> Option<&SequencedItem<T>> {
        self.items.get(&self.frontier())
    }

    /// The first unconsumed fragment strictly after `sequence`, in sequence
    /// order. Used to continue a paragraph after a fragment finishes; gaps do
    /// not stall continuation.
    pub fn successor(&self, sequence: u32) -> Option<&SequencedItem<T>> {
        self.items
            .range(sequence.saturating_add(1)..)
            .map(|(_, item)| item)
            .next()
    }

    /// The lowest unconsumed fragment, regardless of gaps before it.
    pub fn first_unconsumed(&self) -> Option<&SequencedItem<T>> {
        match self.consumed {
            Some(consumed) => self
                .items
                .range(consumed.saturating_add(1)..)
                .map(|(_, item)| item)
                .next(),
            None => self.items.values().next(),
        }
    }

    /// Advance the consumption watermark past `sequence`. The watermark only
    /// moves forward.
    pub fn advance_past(&mut self, sequence: u32) {
        self.consumed = Some(match self.consumed {
            Some(current) => current.max(sequence),
            None => sequence,
        });
    }

    /// Rewind the watermark so the paragraph replays from its first fragment.
    pub fn rewind(&mut self) {
        self.consumed = None;
    }

    /// Whether any buffered fragment is still unconsumed.
    pub fn has_unconsumed(&self) -> bool {
        match self.consumed {
            Some(consumed) => self.items.range(consumed.saturating_add(1)..).next().is_some(),
            None => !self.items.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.consumed = None;
    }
}
