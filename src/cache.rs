//! Task-lifetime store of the latest complete result per paragraph per media
//! kind.
//!
//! The cache is the source of truth for re-render and replay: the UI reads
//! it, the session is its only writer. Values are keyed per sequence number,
//! so a lower sequence number can never overwrite a higher one that already
//! arrived; repeated delivery of the same sequence number overwrites in
//! place. `reset` drops every cached media handle, which is what releases the
//! task's binary resources.

use crate::media::{AudioClip, ImageVariant, MediaKind, VideoRef};
use log::debug;
use std::collections::BTreeMap;

/// Notification that one (paragraph, kind) slot changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUpdate {
    pub paragraph: u32,
    pub kind: MediaKind,
}

/// Callback invoked after every write, consumed by the UI layer.
pub type UpdateNotifier = Box<dyn Fn(CacheUpdate) + Send + Sync>;

/// Media cached for one paragraph.
#[derive(Debug, Default)]
pub struct ParagraphMedia {
    audio: BTreeMap<u32, AudioClip>,
    images: BTreeMap<u32, Vec<ImageVariant>>,
    video: Option<VideoRef>,
}

impl ParagraphMedia {
    /// Narration fragments in sequence order.
    pub fn audio(&self) -> impl Iterator<Item = &AudioClip> {
        self.audio.values()
    }

    /// All image variants, flattened in sequence order. The displayed
    /// carousel index is UI state, not cache state.
    pub fn images(&self) -> impl Iterator<Item = &ImageVariant> {
        self.images.values().flatten()
    }

    pub fn video(&self) -> Option<&VideoRef> {
        self.video.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.images.is_empty() && self.video.is_none()
    }

    fn media_handles(&self) -> usize {
        self.audio.len() + self.images.values().map(Vec::len).sum::<usize>()
    }
}

#[derive(Default)]
pub struct ResultCache {
    paragraphs: BTreeMap<u32, ParagraphMedia>,
    notifier: Option<UpdateNotifier>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the cache-updated notifier.
    pub fn with_notifier(mut self, notifier: UpdateNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Create an empty entry for a new paragraph unit.
    pub fn create_paragraph(&mut self, paragraph: u32) {
        self.paragraphs.entry(paragraph).or_default();
    }

    /// Paragraph numbers with entries, in order.
    pub fn paragraph_numbers(&self) -> Vec<u32> {
        self.paragraphs.keys().copied().collect()
    }

    pub fn paragraph(&self, paragraph: u32) -> Option<&ParagraphMedia> {
        self.paragraphs.get(&paragraph)
    }

    /// Store one narration fragment. Same sequence number overwrites.
    pub fn insert_audio(&mut self, clip: AudioClip) {
        let paragraph = clip.paragraph;
        self.paragraphs
            .entry(paragraph)
            .or_default()
            .audio
            .insert(clip.sequence, clip);
        self.notify(paragraph, MediaKind::Audio);
    }

    /// Store a paragraph's image variants for one sequence position.
    pub fn insert_images(&mut self, paragraph: u32, sequence: u32, variants: Vec<ImageVariant>) {
        self.paragraphs
            .entry(paragraph)
            .or_default()
            .images
            .insert(sequence, variants);
        self.notify(paragraph, MediaKind::Image);
    }

    /// Store a paragraph's finished video reference.
    pub fn insert_video(&mut self, video: VideoRef) {
        let paragraph = video.paragraph;
        self.paragraphs.entry(paragraph).or_default().video = Some(video);
        self.notify(paragraph, MediaKind::Video);
    }

    /// Narration fragments of one paragraph, in sequence order.
    pub fn audio(&self, paragraph: u32) -> Vec<&AudioClip> {
        self.paragraphs
            .get(&paragraph)
            .map(|media| media.audio().collect())
            .unwrap_or_default()
    }

    /// Image variants of one paragraph, flattened in sequence order.
    pub fn images(&self, paragraph: u32) -> Vec<&ImageVariant> {
        self.paragraphs
            .get(&paragraph)
            .map(|media| media.images().collect())
            .unwrap_or_default()
    }

    pub fn video(&self, paragraph: u32) -> Option<&VideoRef> {
        self.paragraphs
            .get(&paragraph)
            .and_then(ParagraphMedia::video)
    }

    /// Discard every entry, dropping all cached media handles. Must run
    /// before a new task's entries are created so no resource leaks across
    /// tasks.
    pub fn reset(&mut self) {
        let released: usize = self
            .paragraphs
            .values()
            .map(ParagraphMedia::media_handles)
            .sum();
        self.paragraphs.clear();
        debug!("cache reset; released {released} media handles");
    }

    fn notify(&self, paragraph: u32, kind: MediaKind) {
        if let Some(notifier) = &self.notifier {
            notifier(CacheUpdate { paragraph, kind });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ResourceTracker;
    use std::sync::{Arc, Mutex};

    fn clip(tracker: &ResourceTracker, paragraph: u32, sequence: u32, bytes: &[u8]) -> AudioClip {
        AudioClip {
            paragraph,
            sequence,
            media: tracker.register(bytes.to_vec()),
        }
    }

    fn variant(tracker: &ResourceTracker, paragraph: u32, bytes: &[u8]) -> ImageVariant {
        ImageVariant {
            paragraph,
            format: "png".to_string(),
            media: tracker.register(bytes.to_vec()),
        }
    }

    #[test]
    fn test_created_paragraph_starts_empty() {
        let mut cache = ResultCache::new();
        cache.create_paragraph(1);

        assert_eq!(cache.paragraph_numbers(), vec![1]);
        assert!(cache.paragraph(1).unwrap().is_empty());
        assert!(cache.audio(1).is_empty());
        assert!(cache.images(1).is_empty());
        assert!(cache.video(1).is_none());
    }

    #[test]
    fn test_audio_ordered_by_sequence_not_arrival() {
        let tracker = ResourceTracker::new();
        let mut cache = ResultCache::new();

        cache.insert_audio(clip(&tracker, 1, 2, b"third"));
        cache.insert_audio(clip(&tracker, 1, 0, b"first"));
        cache.insert_audio(clip(&tracker, 1, 1, b"second"));

        let order: Vec<u32> = cache.audio(1).iter().map(|c| c.sequence).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_idempotent_writes() {
        let tracker = ResourceTracker::new();
        let mut cache = ResultCache::new();

        cache.insert_audio(clip(&tracker, 1, 0, b"take one"));
        cache.insert_audio(clip(&tracker, 1, 0, b"take two"));

        let clips = cache.audio(1);
        assert_eq!(clips.len(), 1, "same sequence never duplicates");
        assert_eq!(clips[0].media.as_ref(), b"take two", "last write wins");
    }

    #[test]
    fn test_lower_sequence_never_overwrites_higher() {
        let tracker = ResourceTracker::new();
        let mut cache = ResultCache::new();

        cache.insert_audio(clip(&tracker, 1, 3, b"late fragment"));
        cache.insert_audio(clip(&tracker, 1, 1, b"early fragment"));

        let clips = cache.audio(1);
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[1].sequence, 3);
        assert_eq!(clips[1].media.as_ref(), b"late fragment");
    }

    #[test]
    fn test_image_carousel_flattened_in_order() {
        let tracker = ResourceTracker::new();
        let mut cache = ResultCache::new();

        cache.insert_images(
            1,
            1,
            vec![variant(&tracker, 1, b"b1"), variant(&tracker, 1, b"b2")],
        );
        cache.insert_images(1, 0, vec![variant(&tracker, 1, b"a1")]);

        let images = cache.images(1);
        let bytes: Vec<&[u8]> = images.iter().map(|v| v.media.as_ref()).collect();
        assert_eq!(bytes, vec![b"a1" as &[u8], b"b1", b"b2"]);
    }

    #[test]
    fn test_video_overwrite() {
        let mut cache = ResultCache::new();
        cache.insert_video(VideoRef {
            paragraph: 1,
            url: "https://cdn/old.mp4".to_string(),
        });
        cache.insert_video(VideoRef {
            paragraph: 1,
            url: "https://cdn/new.mp4".to_string(),
        });

        assert_eq!(cache.video(1).unwrap().url, "https://cdn/new.mp4");
    }

    #[test]
    fn test_paragraph_isolation() {
        let tracker = ResourceTracker::new();
        let mut cache = ResultCache::new();

        cache.insert_audio(clip(&tracker, 1, 0, b"one"));
        cache.insert_audio(clip(&tracker, 2, 0, b"two"));

        assert_eq!(cache.audio(1).len(), 1);
        assert_eq!(cache.audio(2).len(), 1);
        assert_eq!(cache.audio(1)[0].media.as_ref(), b"one");
    }

    #[test]
    fn test_reset_releases_all_media() {
        let tracker = ResourceTracker::new();
        let mut cache = ResultCache::new();

        cache.insert_audio(clip(&tracker, 1, 0, b"audio"));
        cache.insert_images(1, 0, vec![variant(&tracker, 1, b"image")]);
        cache.insert_video(VideoRef {
            paragraph: 1,
            url: "https://cdn/v.mp4".to_string(),
        });
        assert_eq!(tracker.live_count(), 2);

        cache.reset();
        assert!(cache.paragraph_numbers().is_empty());
        assert_eq!(
            tracker.live_count(),
            0,
            "no cached media handle survives reset"
        );
    }

    #[test]
    fn test_notifier_fires_per_write() {
        let tracker = ResourceTracker::new();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let mut cache = ResultCache::new().with_notifier(Box::new(move |update| {
            sink.lock().unwrap().push(update);
        }));

        cache.insert_audio(clip(&tracker, 1, 0, b"a"));
        cache.insert_images(2, 0, vec![variant(&tracker, 2, b"i")]);
        cache.insert_video(VideoRef {
            paragraph: 3,
            url: "u".to_string(),
        });

        let seen = updates.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                CacheUpdate {
                    paragraph: 1,
                    kind: MediaKind::Audio
                },
                CacheUpdate {
                    paragraph: 2,
                    kind: MediaKind::Image
                },
                CacheUpdate {
                    paragraph: 3,
                    kind: MediaKind::Video
                },
            ]
        );
    }
}
