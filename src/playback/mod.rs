//! Audio playback: the player seam and the cross-paragraph coordinator.

pub mod coordinator;
pub mod player;

pub use coordinator::{AutoplayRequest, PlaybackCoordinator, PlaybackState, ToggleOutcome};
pub use player::{AudioPlayer, MockPlayer, MockPlayerHandle, PlaybackEvent, RodioPlayer};
