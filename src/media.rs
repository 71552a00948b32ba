//! Decoded media references and the task-scoped resource tracker.
//!
//! Binary media arriving over the stream is decoded once at the boundary and
//! wrapped in a shared [`MediaHandle`]. Handles for one task are registered
//! with that task's [`ResourceTracker`], which makes the release discipline
//! observable: after a task reset no handle registered for the old task may
//! remain live.

use crate::error::{Result, StoryloomError};
use crate::protocol::{AudioPayload, ImagePayload};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The kind of generated media a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaKind {
    Audio,
    Image,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Image => f.write_str("image"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Shared reference to one decoded binary media resource.
///
/// Cloning is cheap; the underlying bytes are freed when the last handle is
/// dropped, which for cached media happens at task reset.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    id: u64,
    bytes: Arc<Vec<u8>>,
}

impl MediaHandle {
    /// Tracker id of this resource.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the decoded payload in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for MediaHandle {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Tracks every binary media resource allocated for the current task.
///
/// Registration hands out the only strong references; the tracker itself
/// keeps weak ones, so [`ResourceTracker::live_count`] reports exactly the
/// resources still reachable somewhere in the task state.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    live: Mutex<HashMap<u64, Weak<Vec<u8>>>>,
    next_id: AtomicU64,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register freshly decoded bytes, returning their shared handle.
    pub fn register(&self, bytes: Vec<u8>) -> MediaHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = Arc::new(bytes);
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, Arc::downgrade(&bytes));
        }
        MediaHandle { id, bytes }
    }

    /// Number of registered resources still alive.
    pub fn live_count(&self) -> usize {
        match self.live.lock() {
            Ok(mut live) => {
                live.retain(|_, weak| weak.strong_count() > 0);
                live.len()
            }
            Err(_) => 0,
        }
    }

    /// Forget all registrations. Called after a reset has dropped the task's
    /// cached handles; anything still live at that point is a leak.
    pub fn clear(&self) {
        if let Ok(mut live) = self.live.lock() {
            live.clear();
        }
    }
}

/// One narrated audio fragment, decoded and ready for playback.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub paragraph: u32,
    pub sequence: u32,
    pub media: MediaHandle,
}

/// One illustrative image variant of a paragraph's carousel.
#[derive(Debug, Clone)]
pub struct ImageVariant {
    pub paragraph: u32,
    pub format: String,
    pub media: MediaHandle,
}

/// Finished video clip. The service serves video by URL, not inline bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRef {
    pub paragraph: u32,
    pub url: String,
}

/// Decode the audio payload of a `tts_result` frame.
pub fn decode_audio(
    tracker: &ResourceTracker,
    paragraph: u32,
    sequence: u32,
    payload: &AudioPayload,
) -> Result<AudioClip> {
    let bytes = BASE64
        .decode(payload.data.as_bytes())
        .map_err(|e| StoryloomError::Decode {
            paragraph,
            message: format!("audio fragment {sequence}: {e}"),
        })?;
    if bytes.is_empty() {
        return Err(StoryloomError::Decode {
            paragraph,
            message: format!("audio fragment {sequence}: empty payload"),
        });
    }
    Ok(AudioClip {
        paragraph,
        sequence,
        media: tracker.register(bytes),
    })
}

/// Decode every image variant of an `image_result` frame.
pub fn decode_images(
    tracker: &ResourceTracker,
    paragraph: u32,
    payload: &ImagePayload,
) -> Result<Vec<ImageVariant>> {
    let format = payload.output_format.clone().unwrap_or_else(|| "png".to_string());
    let mut variants = Vec::with_capacity(payload.data.len());
    for (index, datum) in payload.data.iter().enumerate() {
        let bytes = BASE64
            .decode(datum.b64_json.as_bytes())
            .map_err(|e| StoryloomError::Decode {
                paragraph,
                message: format!("image variant {index}: {e}"),
            })?;
        variants.push(ImageVariant {
            paragraph,
            format: format.clone(),
            media: tracker.register(bytes),
        });
    }
    Ok(variants)
}
