//! storyloom - streaming story-to-media client
//!
//! Submits long-form text to a remote generation service and coordinates the
//! results that stream back out of order: narrated audio fragments,
//! illustrative images, and video clips, reassembled per paragraph, cached
//! for replay, and played back without overlapping narration.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod defaults;
pub mod error;
pub mod fallback;
pub mod media;
pub mod playback;
pub mod progress;
pub mod protocol;
pub mod router;
pub mod sequence;
pub mod session;

// Core seams (transport → session → playback)
pub use connection::manager::{ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionStatus};
pub use connection::transport::{MockRemote, MockTransport, Transport, TransportLink, WsTransport};
pub use fallback::{GenerationService, HttpGenerationClient};
pub use playback::coordinator::{AutoplayRequest, PlaybackCoordinator, PlaybackState, ToggleOutcome};
pub use playback::player::{AudioPlayer, MockPlayer, MockPlayerHandle, PlaybackEvent, RodioPlayer};

// Session
pub use session::{Session, SessionCommand, SessionHandle, SessionUpdate};

// Data model
pub use cache::{CacheUpdate, ResultCache};
pub use media::{AudioClip, ImageVariant, MediaHandle, MediaKind, ResourceTracker, VideoRef};
pub use progress::{ProgressEstimator, ProgressTicket, ProgressUpdate};
pub use protocol::{ClientRequest, FrameKind, ServerFrame, parse_frame};
pub use router::{MessageRouter, SubscriptionId};
pub use sequence::{SequenceQueue, SequencedItem};

// Error handling
pub use error::{Result, StoryloomError};

// Config
pub use config::Config;

/// Milliseconds since the Unix epoch, used to stamp autoplay triggers.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic_enough() {
        let first = now_ms();
        let second = now_ms();
        assert!(second >= first);
        // Sanity: a plausible 21st-century timestamp, not 0.
        assert!(first > 1_500_000_000_000);
    }
}
