//! Time-based progress estimation for operations whose completion time is
//! unknown until the result arrives.
//!
//! Each in-flight operation owns exactly one ticker. The simulated value
//! climbs monotonically toward a ceiling over the assumed window, jumps to
//! 100 when the real result arrives, and resets to 0 after a short display
//! delay. Completing or dropping the ticket cancels the ticker immediately,
//! so a resolved operation can never keep ticking.

use crate::defaults;
use crate::media::MediaKind;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One emitted progress value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub paragraph: u32,
    pub kind: MediaKind,
    pub percent: u8,
}

/// Factory for per-operation progress tickers.
pub struct ProgressEstimator {
    updates: mpsc::UnboundedSender<ProgressUpdate>,
    ceiling: u8,
    tick: Duration,
    display_delay: Duration,
}

impl ProgressEstimator {
    pub fn new(updates: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            updates,
            ceiling: defaults::PROGRESS_CEILING,
            tick: Duration::from_millis(defaults::PROGRESS_TICK_MS),
            display_delay: Duration::from_millis(defaults::PROGRESS_DISPLAY_DELAY_MS),
        }
    }

    pub fn with_ceiling(mut self, ceiling: u8) -> Self {
        self.ceiling = ceiling.min(99);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_display_delay(mut self, delay: Duration) -> Self {
        self.display_delay = delay;
        self
    }

    /// Start one owned ticker for an operation assumed to take `window`.
    pub fn start(&self, paragraph: u32, kind: MediaKind, window: Duration) -> ProgressTicket {
        let updates = self.updates.clone();
        let ceiling = self.ceiling;
        let tick = self.tick;

        let ticker = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick doubles as the initial 0% emission.
            interval.tick().await;
            let _ = updates.send(ProgressUpdate {
                paragraph,
                kind,
                percent: 0,
            });

            let mut last = 0u8;
            loop {
                interval.tick().await;
                let ratio = started.elapsed().as_secs_f64() / window.as_secs_f64().max(f64::EPSILON);
                let percent = ((ratio * 100.0) as u8).min(ceiling);
                if percent != last {
                    last = percent;
                    let _ = updates.send(ProgressUpdate {
                        paragraph,
                        kind,
                        percent,
                    });
                }
                if percent >= ceiling {
                    // Parked at the ceiling until the real result arrives.
                    return;
                }
            }
        });

        ProgressTicket {
            paragraph,
            kind,
            ticker,
            updates: self.updates.clone(),
            display_delay: self.display_delay,
        }
    }
}

/// Handle for one in-flight operation's ticker.
pub struct ProgressTicket {
    paragraph: u32,
    kind: MediaKind,
    ticker: JoinHandle<()>,
    updates: mpsc::UnboundedSender<ProgressUpdate>,
    display_delay: Duration,
}

impl ProgressTicket {
    /// The real result arrived: stop the ticker, jump to 100, reset to 0
    /// after the display delay.
    pub fn complete(self) {
        self.ticker.abort();
        let _ = self.updates.send(ProgressUpdate {
            paragraph: self.paragraph,
            kind: self.kind,
            percent: 100,
        });

        let updates = self.updates.clone();
        let paragraph = self.paragraph;
        let kind = self.kind;
        let delay = self.display_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = updates.send(ProgressUpdate {
                paragraph,
                kind,
                percent: 0,
            });
        });
    }

    /// Abandon the operation silently (task reset or remote error).
    pub fn cancel(self) {
        // Drop aborts the ticker.
    }
}

impl Drop for ProgressTicket {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}
