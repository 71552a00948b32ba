//! Composition root: the live generation-stream session.
//!
//! One session owns all task-scoped state — the result cache, the playback
//! coordinator with its sequence queues, the autoplay dedup set, progress
//! tickets, and pending per-request futures — and processes every event in a
//! single cooperative loop: inbound frames, playback completions, progress
//! ticks, fallback results, connection-status changes, and user commands.
//! Nothing mutates task state from outside this loop.

use crate::cache::{CacheUpdate, ResultCache};
use crate::config::Config;
use crate::connection::manager::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionStatus,
};
use crate::connection::transport::Transport;
use crate::error::{Result, StoryloomError};
use crate::fallback::GenerationService;
use crate::media::{
    AudioClip, ImageVariant, MediaKind, ResourceTracker, VideoRef, decode_audio, decode_images,
};
use crate::playback::coordinator::{
    AutoplayRequest, PlaybackCoordinator, PlaybackState, ToggleOutcome,
};
use crate::playback::player::{AudioPlayer, PlaybackEvent};
use crate::progress::{ProgressEstimator, ProgressTicket, ProgressUpdate};
use crate::protocol::{AudioPayload, ClientRequest, FrameKind, ImagePayload, ServerFrame};
use crate::router::MessageRouter;
use crate::{defaults, now_ms};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Outward event stream consumed by the UI layer.
#[derive(Debug)]
pub enum SessionUpdate {
    Connection(ConnectionStatus),
    CacheUpdated(CacheUpdate),
    Progress(ProgressUpdate),
    Status {
        paragraph: Option<u32>,
        message: String,
    },
    ParagraphError {
        paragraph: Option<u32>,
        message: String,
    },
    Playback(PlaybackState),
    TaskComplete,
}

/// Commands accepted by the session loop.
pub enum SessionCommand {
    Submit {
        paragraphs: Vec<String>,
    },
    ToggleAudio {
        paragraph: u32,
    },
    RequestVideo {
        paragraph: u32,
        reply: oneshot::Sender<Result<VideoRef>>,
    },
    Reset,
    Reconnect,
    Shutdown,
}

/// Cheap cloneable handle for driving a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    cache: Arc<Mutex<ResultCache>>,
    connection: ConnectionHandle,
}

impl SessionHandle {
    /// Submit a new task: one generation request per paragraph. Any previous
    /// task is reset first.
    pub async fn submit(&self, paragraphs: Vec<String>) -> Result<()> {
        self.command(SessionCommand::Submit { paragraphs }).await
    }

    /// Manually play or pause one paragraph's narration.
    pub async fn toggle_audio(&self, paragraph: u32) -> Result<()> {
        self.command(SessionCommand::ToggleAudio { paragraph }).await
    }

    /// Request a video clip for one paragraph. Resolves when the matching
    /// result (or error) frame arrives; a task reset aborts it.
    pub async fn request_video(&self, paragraph: u32) -> Result<VideoRef> {
        let (reply, reply_rx) = oneshot::channel();
        self.command(SessionCommand::RequestVideo { paragraph, reply })
            .await?;
        reply_rx.await.map_err(|_| StoryloomError::TaskReset)?
    }

    /// Discard the current task and release its resources.
    pub async fn reset(&self) -> Result<()> {
        self.command(SessionCommand::Reset).await
    }

    /// Manually restart a connection that reached the terminal failed state.
    pub async fn reconnect(&self) -> Result<()> {
        self.command(SessionCommand::Reconnect).await
    }

    /// Stop the session and close the connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.command(SessionCommand::Shutdown).await
    }

    /// Shared view of the result cache. The session is the only writer;
    /// readers take brief lock guards to render from it.
    pub fn cache(&self) -> Arc<Mutex<ResultCache>> {
        self.cache.clone()
    }

    /// Current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| StoryloomError::Other("session terminated".to_string()))
    }
}

/// Result of a one-shot fallback call, tagged with the task generation it
/// was issued for so results of an abandoned task are dropped.
struct FallbackResult {
    generation: u64,
    paragraph: u32,
    payload: FallbackPayload,
}

enum FallbackPayload {
    Audio(Result<Vec<u8>>),
    Images(Result<Vec<Vec<u8>>>),
    Video(Result<String>),
}

pub struct Session {
    manager: Option<ConnectionManager>,
    connection: ConnectionHandle,
    frame_rx: mpsc::UnboundedReceiver<ServerFrame>,
    status_rx: watch::Receiver<ConnectionStatus>,
    commands: mpsc::Receiver<SessionCommand>,
    router: Arc<MessageRouter>,
    routed_rx: mpsc::UnboundedReceiver<ServerFrame>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    progress_rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    fallback_rx: mpsc::UnboundedReceiver<FallbackResult>,
    fallback_tx: mpsc::UnboundedSender<FallbackResult>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    cache: Arc<Mutex<ResultCache>>,
    coordinator: PlaybackCoordinator,
    estimator: ProgressEstimator,
    tracker: Arc<ResourceTracker>,
    fallback: Option<Arc<dyn GenerationService>>,
    autoplay: bool,
    paragraphs: BTreeMap<u32, String>,
    tickets: HashMap<(u32, MediaKind), ProgressTicket>,
    pending_videos: HashMap<u32, oneshot::Sender<Result<VideoRef>>>,
    task_id: String,
    task_counter: u64,
    generation: u64,
    image_window: Duration,
    video_window: Duration,
}

impl Session {
    /// Wire up a session over the given transport and player backend.
    ///
    /// The player constructor receives the completion-event sender the
    /// backend must report through.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        player: impl FnOnce(mpsc::UnboundedSender<PlaybackEvent>) -> Box<dyn AudioPlayer>,
        fallback: Option<Arc<dyn GenerationService>>,
    ) -> (
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionUpdate>,
    ) {
        let (manager, connection, frame_rx) =
            ConnectionManager::new(transport, ConnectionConfig::from(&config.connection));
        let status_rx = connection.status_stream();

        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(defaults::REQUEST_BUFFER);
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        let (routed_tx, routed_rx) = mpsc::unbounded_channel();

        let cache_updates = updates.clone();
        let cache = Arc::new(Mutex::new(ResultCache::new().with_notifier(Box::new(
            move |update| {
                let _ = cache_updates.send(SessionUpdate::CacheUpdated(update));
            },
        ))));

        // The session's own consumption of frames is a set of router
        // subscriptions like any other component's; the router stays the
        // sole fan-out point.
        let router = Arc::new(MessageRouter::new());
        for kind in FrameKind::ROUTABLE {
            let forward = routed_tx.clone();
            router.subscribe(
                kind,
                Arc::new(move |frame| {
                    forward
                        .send(frame.clone())
                        .map_err(|_| StoryloomError::Other("session loop gone".to_string()))
                }),
            );
        }

        let coordinator = PlaybackCoordinator::new(player(playback_tx.clone()));
        let estimator = ProgressEstimator::new(progress_tx);

        let handle = SessionHandle {
            commands: command_tx,
            cache: cache.clone(),
            connection: connection.clone(),
        };

        (
            Self {
                manager: Some(manager),
                connection,
                frame_rx,
                status_rx,
                commands,
                router,
                routed_rx,
                playback_rx,
                progress_rx,
                fallback_rx,
                fallback_tx,
                updates,
                cache,
                coordinator,
                estimator,
                tracker: Arc::new(ResourceTracker::new()),
                fallback,
                autoplay: config.playback.autoplay,
                paragraphs: BTreeMap::new(),
                tickets: HashMap::new(),
                pending_videos: HashMap::new(),
                task_id: String::new(),
                task_counter: 0,
                generation: 0,
                image_window: Duration::from_secs(defaults::IMAGE_PROGRESS_WINDOW_SECS),
                video_window: Duration::from_secs(defaults::VIDEO_PROGRESS_WINDOW_SECS),
            },
            handle,
            updates_rx,
        )
    }

    /// Subscribe an external tap on the inbound frame stream, e.g. a UI
    /// status listener.
    pub fn router(&self) -> Arc<MessageRouter> {
        self.router.clone()
    }

    /// Process events until shutdown. Run this on its own task.
    pub async fn run(mut self) {
        if let Some(manager) = self.manager.take() {
            tokio::spawn(manager.run());
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => {
                        let _ = self.connection.shutdown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                frame = self.frame_rx.recv() => match frame {
                    Some(frame) => {
                        self.router.dispatch(&frame);
                    }
                    // Connection manager terminated.
                    None => break,
                },

                routed = self.routed_rx.recv() => {
                    if let Some(frame) = routed {
                        self.handle_frame(frame);
                    }
                },

                event = self.playback_rx.recv() => {
                    if let Some(event) = event {
                        self.coordinator.on_player_event(event);
                        self.emit(SessionUpdate::Playback(self.coordinator.state()));
                    }
                },

                update = self.progress_rx.recv() => {
                    if let Some(update) = update {
                        self.emit(SessionUpdate::Progress(update));
                    }
                },

                result = self.fallback_rx.recv() => {
                    if let Some(result) = result {
                        self.handle_fallback(result);
                    }
                },

                changed = self.status_rx.changed() => match changed {
                    Ok(()) => {
                        let status = self.status_rx.borrow().clone();
                        self.emit(SessionUpdate::Connection(status));
                    }
                    Err(_) => break,
                },
            }
        }
        debug!("session loop ended");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Submit { paragraphs } => self.submit(paragraphs).await,
            SessionCommand::ToggleAudio { paragraph } => self.toggle_audio(paragraph).await,
            SessionCommand::RequestVideo { paragraph, reply } => {
                self.request_video(paragraph, reply).await
            }
            SessionCommand::Reset => self.reset_task(),
            SessionCommand::Reconnect => {
                if let Err(e) = self.connection.reconnect().await {
                    warn!("reconnect request failed: {e}");
                }
            }
            // Handled in the loop.
            SessionCommand::Shutdown => {}
        }
    }

    async fn submit(&mut self, texts: Vec<String>) {
        self.reset_task();
        self.task_counter += 1;
        self.task_id = format!("task-{}", self.task_counter);
        info!(
            "submitting {} paragraphs as {}",
            texts.len(),
            self.task_id
        );

        for (index, text) in texts.into_iter().enumerate() {
            let paragraph = index as u32 + 1;
            self.with_cache(|cache| cache.create_paragraph(paragraph));
            self.paragraphs.insert(paragraph, text);
        }

        let numbers: Vec<u32> = self.paragraphs.keys().copied().collect();
        for paragraph in numbers {
            self.begin_narration(paragraph).await;
        }
    }

    /// Dispatch one paragraph's narration+image generation over whichever
    /// transport is available.
    async fn begin_narration(&mut self, paragraph: u32) {
        let Some(text) = self.paragraphs.get(&paragraph).cloned() else {
            return;
        };

        if self.connection.is_connected() {
            self.start_ticket(paragraph, MediaKind::Image, self.image_window);
            let request = ClientRequest::Tts {
                text,
                paragraph_number: paragraph,
            };
            if let Err(e) = self.connection.send(request).await {
                self.cancel_ticket(paragraph, MediaKind::Image);
                self.paragraph_error(Some(paragraph), format!("request failed: {e}"));
            }
        } else if let Some(service) = self.fallback.clone() {
            debug!("stream unavailable; using one-shot fallback for paragraph {paragraph}");
            self.start_ticket(paragraph, MediaKind::Image, self.image_window);
            let sink = self.fallback_tx.clone();
            let generation = self.generation;
            let task_id = self.task_id.clone();
            tokio::spawn(async move {
                let audio = service.synthesize_audio(&task_id, &text, paragraph).await;
                let _ = sink.send(FallbackResult {
                    generation,
                    paragraph,
                    payload: FallbackPayload::Audio(audio),
                });
                let images = service.generate_images(&task_id, &text, paragraph).await;
                let _ = sink.send(FallbackResult {
                    generation,
                    paragraph,
                    payload: FallbackPayload::Images(images),
                });
            });
        } else {
            self.paragraph_error(
                Some(paragraph),
                "not connected and no fallback service configured".to_string(),
            );
        }
    }

    async fn toggle_audio(&mut self, paragraph: u32) {
        match self.coordinator.toggle(paragraph) {
            ToggleOutcome::Started | ToggleOutcome::Paused => {
                self.emit(SessionUpdate::Playback(self.coordinator.state()));
            }
            ToggleOutcome::NeedsGeneration => {
                info!("paragraph {paragraph} has no cached narration; requesting generation");
                self.begin_narration(paragraph).await;
            }
        }
    }

    async fn request_video(
        &mut self,
        paragraph: u32,
        reply: oneshot::Sender<Result<VideoRef>>,
    ) {
        if self.pending_videos.contains_key(&paragraph) {
            let _ = reply.send(Err(StoryloomError::Generation {
                paragraph: Some(paragraph),
                message: "video generation already in flight".to_string(),
            }));
            return;
        }

        let image_base64 = self
            .with_cache(|cache| {
                cache
                    .images(paragraph)
                    .first()
                    .map(|variant| BASE64.encode(variant.media.as_ref()))
            })
            .flatten();
        let Some(image_base64) = image_base64 else {
            let _ = reply.send(Err(StoryloomError::Generation {
                paragraph: Some(paragraph),
                message: "no image available for this paragraph yet".to_string(),
            }));
            return;
        };
        let Some(text) = self.paragraphs.get(&paragraph).cloned() else {
            let _ = reply.send(Err(StoryloomError::Generation {
                paragraph: Some(paragraph),
                message: "unknown paragraph".to_string(),
            }));
            return;
        };

        self.start_ticket(paragraph, MediaKind::Video, self.video_window);

        if self.connection.is_connected() {
            let request = ClientRequest::Video {
                task_id: self.task_id.clone(),
                text,
                paragraph_number: paragraph,
                image_base64,
            };
            match self.connection.send(request).await {
                Ok(()) => {
                    self.pending_videos.insert(paragraph, reply);
                }
                Err(e) => {
                    self.cancel_ticket(paragraph, MediaKind::Video);
                    let _ = reply.send(Err(e));
                }
            }
        } else if let Some(service) = self.fallback.clone() {
            self.pending_videos.insert(paragraph, reply);
            let sink = self.fallback_tx.clone();
            let generation = self.generation;
            let task_id = self.task_id.clone();
            tokio::spawn(async move {
                let video = service
                    .generate_video(&task_id, &text, paragraph, &image_base64)
                    .await;
                let _ = sink.send(FallbackResult {
                    generation,
                    paragraph,
                    payload: FallbackPayload::Video(video),
                });
            });
        } else {
            self.cancel_ticket(paragraph, MediaKind::Video);
            let _ = reply.send(Err(StoryloomError::NotConnected));
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Status {
                message,
                paragraph_number,
            } => {
                self.emit(SessionUpdate::Status {
                    paragraph: paragraph_number,
                    message: message.unwrap_or_default(),
                });
            }
            ServerFrame::TtsResult {
                data,
                paragraph_number,
                sequence_number,
            } => self.on_audio_payload(paragraph_number, sequence_number, &data),
            ServerFrame::ImageResult {
                data,
                paragraph_number,
                sequence_number,
            } => self.on_image_payload(paragraph_number, sequence_number, &data),
            ServerFrame::VideoResult {
                video_url,
                paragraph_number,
            } => self.on_video_result(paragraph_number, video_url),
            ServerFrame::VideoProgress {
                progress,
                paragraph_number,
            } => {
                // Real progress supersedes the simulated ramp.
                self.emit(SessionUpdate::Progress(ProgressUpdate {
                    paragraph: paragraph_number,
                    kind: MediaKind::Video,
                    percent: progress.min(100),
                }));
            }
            ServerFrame::Error {
                message,
                paragraph_number,
                sequence_number,
            } => self.on_remote_error(paragraph_number, sequence_number, message),
            ServerFrame::Complete { message } => {
                info!("task {} complete: {message:?}", self.task_id);
                self.emit(SessionUpdate::TaskComplete);
            }
            // Consumed by the connection manager; never routed here.
            ServerFrame::Pong => {}
        }
    }

    fn on_audio_payload(&mut self, paragraph: u32, sequence: u32, payload: &AudioPayload) {
        match decode_audio(&self.tracker, paragraph, sequence, payload) {
            Ok(clip) => self.on_audio_clip(clip),
            Err(e) => {
                warn!("{e}");
                self.paragraph_error(Some(paragraph), e.to_string());
            }
        }
    }

    fn on_audio_clip(&mut self, clip: AudioClip) {
        let paragraph = clip.paragraph;
        let sequence = clip.sequence;
        self.with_cache(|cache| cache.insert_audio(clip.clone()));

        if self.autoplay {
            let request = AutoplayRequest {
                paragraph,
                sequence,
                timestamp_ms: now_ms(),
            };
            self.coordinator.on_arrival(request, clip);
            self.emit(SessionUpdate::Playback(self.coordinator.state()));
        }
    }

    fn on_image_payload(&mut self, paragraph: u32, sequence: u32, payload: &ImagePayload) {
        match decode_images(&self.tracker, paragraph, payload) {
            Ok(variants) => {
                self.with_cache(|cache| cache.insert_images(paragraph, sequence, variants));
                self.complete_ticket(paragraph, MediaKind::Image);
            }
            Err(e) => {
                warn!("{e}");
                self.paragraph_error(Some(paragraph), e.to_string());
            }
        }
    }

    fn on_video_result(&mut self, paragraph: u32, url: String) {
        let video = VideoRef { paragraph, url };
        self.with_cache(|cache| cache.insert_video(video.clone()));
        self.complete_ticket(paragraph, MediaKind::Video);
        if let Some(reply) = self.pending_videos.remove(&paragraph) {
            let _ = reply.send(Ok(video));
        }
    }

    fn on_remote_error(
        &mut self,
        paragraph: Option<u32>,
        sequence: Option<u32>,
        message: String,
    ) {
        warn!(
            "remote generation error (paragraph {paragraph:?}, sequence {sequence:?}): {message}"
        );

        if let Some(paragraph) = paragraph {
            match sequence {
                // A single narration fragment failed: skip its position so
                // the fragments behind it can still play.
                Some(sequence) => {
                    self.coordinator.on_sequence_failed(paragraph, sequence);
                    self.emit(SessionUpdate::Playback(self.coordinator.state()));
                }
                // Paragraph-level failure: stop pretending progress.
                None => self.cancel_ticket(paragraph, MediaKind::Image),
            }

            // Resolve the pending one-shot video future, if any, so no stale
            // waiter survives for a later request with the same number.
            if let Some(reply) = self.pending_videos.remove(&paragraph) {
                self.cancel_ticket(paragraph, MediaKind::Video);
                let _ = reply.send(Err(StoryloomError::Generation {
                    paragraph: Some(paragraph),
                    message: message.clone(),
                }));
            }
        }

        self.paragraph_error(paragraph, message);
    }

    fn handle_fallback(&mut self, result: FallbackResult) {
        if result.generation != self.generation {
            debug!(
                "dropping fallback result for paragraph {} from an abandoned task",
                result.paragraph
            );
            return;
        }
        let paragraph = result.paragraph;

        match result.payload {
            FallbackPayload::Audio(Ok(bytes)) => {
                let clip = AudioClip {
                    paragraph,
                    sequence: 0,
                    media: self.tracker.register(bytes),
                };
                self.on_audio_clip(clip);
            }
            FallbackPayload::Audio(Err(e)) => {
                self.paragraph_error(Some(paragraph), e.to_string());
            }
            FallbackPayload::Images(Ok(images)) => {
                let variants: Vec<ImageVariant> = images
                    .into_iter()
                    .map(|bytes| ImageVariant {
                        paragraph,
                        format: "png".to_string(),
                        media: self.tracker.register(bytes),
                    })
                    .collect();
                self.with_cache(|cache| cache.insert_images(paragraph, 0, variants));
                self.complete_ticket(paragraph, MediaKind::Image);
            }
            FallbackPayload::Images(Err(e)) => {
                self.cancel_ticket(paragraph, MediaKind::Image);
                self.paragraph_error(Some(paragraph), e.to_string());
            }
            FallbackPayload::Video(Ok(url)) => self.on_video_result(paragraph, url),
            FallbackPayload::Video(Err(e)) => {
                self.cancel_ticket(paragraph, MediaKind::Video);
                if let Some(reply) = self.pending_videos.remove(&paragraph) {
                    let _ = reply.send(Err(StoryloomError::Generation {
                        paragraph: Some(paragraph),
                        message: e.to_string(),
                    }));
                }
                self.paragraph_error(Some(paragraph), e.to_string());
            }
        }
    }

    /// The single cancellation primitive: stop playback, drop timers,
    /// release cached media, clear queues and the dedup set, abort pending
    /// request futures.
    fn reset_task(&mut self) {
        self.generation += 1;
        self.coordinator.stop_all();

        for (_, ticket) in self.tickets.drain() {
            ticket.cancel();
        }
        for (_, reply) in self.pending_videos.drain() {
            let _ = reply.send(Err(StoryloomError::TaskReset));
        }

        self.with_cache(|cache| cache.reset());
        self.paragraphs.clear();

        let live = self.tracker.live_count();
        if live > 0 {
            // A clip handed to the audio backend may outlive the reset by a
            // moment; everything task-owned is gone.
            debug!("{live} media handles still referenced outside task state");
        }
        self.tracker.clear();

        self.emit(SessionUpdate::Playback(PlaybackState::Idle));
    }

    fn start_ticket(&mut self, paragraph: u32, kind: MediaKind, window: Duration) {
        let ticket = self.estimator.start(paragraph, kind, window);
        if let Some(old) = self.tickets.insert((paragraph, kind), ticket) {
            old.cancel();
        }
    }

    fn complete_ticket(&mut self, paragraph: u32, kind: MediaKind) {
        if let Some(ticket) = self.tickets.remove(&(paragraph, kind)) {
            ticket.complete();
        }
    }

    fn cancel_ticket(&mut self, paragraph: u32, kind: MediaKind) {
        if let Some(ticket) = self.tickets.remove(&(paragraph, kind)) {
            ticket.cancel();
        }
    }

    fn paragraph_error(&self, paragraph: Option<u32>, message: String) {
        self.emit(SessionUpdate::ParagraphError { paragraph, message });
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut ResultCache) -> R) -> Option<R> {
        match self.cache.lock() {
            Ok(mut cache) => Some(f(&mut cache)),
            Err(_) => {
                error!("result cache lock poisoned");
                None
            }
        }
    }
}
