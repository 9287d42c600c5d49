//! # Playback Manager
//!
//! The session controller. It resolves play requests into queue entries,
//! runs the negotiation cycle for each item, hands streams to renderers and
//! keeps the reporter, the queue and the event bus in step with what the
//! renderers do.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ─► Resolving ─► Negotiating ─► Starting ─► Playing ─► Stopped
//!                           ▲                        │
//!                           └──── ChangingStream ◄───┘   (track, seek, retry)
//!
//!            Negotiating / Starting / Playing ─► Error
//! ```
//!
//! ## Concurrency
//!
//! All state sits behind one `parking_lot::Mutex` that is never held across
//! an `.await`. Every negotiation cycle takes a generation token from the
//! renderer's session; when a cycle resumes after a collaborator call it
//! re-checks the token and drops its result if a newer cycle started in the
//! meantime.
//!
//! ## Error recovery
//!
//! A renderer error on a source that supports transcoding triggers one
//! renegotiation with direct play, direct stream and stream copy disabled.
//! A second error on the same item is terminal: a `PlaybackError` event is
//! published and the item is stopped with `failed` set.

use crate::error::{PlaybackError, Result};
use crate::negotiator::{url_item_descriptor, NegotiationRequest, SourceNegotiator};
use crate::queue::PlayQueue;
use crate::registry::{RegisteredRenderer, RendererRegistry};
use crate::reporter::{next_media_type, ProgressReporter, ProgressTimer};
use crate::resolver::{ItemResolver, PlayOptions, ResolvedItems};
use crate::session::{PlayState, PlaybackPhase, PlayerState, RendererSession};
use crate::ticks::{ticks_from_duration, ticks_from_millis, ticks_to_duration, TICKS_PER_SECOND};
use crate::tracks::{
    auto_set_next_tracks, is_audio_stream_supported, track_has_secondary_subtitle_support,
    PreviousTracks, NO_STREAM,
};
use bridge_traits::{
    BridgeError, CatalogClient, Clock, ItemKind, ItemPlayOptions, MediaStream, MediaType,
    PlayMethod, PlayRequest, PlayableItem, ProgressEvent, QueueEntry, QueueItemRef, Renderer,
    RendererDescriptor, RendererErrorKind, RendererEvent, RepeatMode, ShuffleMode,
    StreamDescriptor, StreamKind, SubtitleDeliveryMethod,
};
use core_runtime::config::{CoreConfig, PlaybackSettings};
use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent, QueueEvent, Receiver, StateChange};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};

/// Stepping back within this distance of a chapter start goes to the
/// chapter before it.
const PREVIOUS_CHAPTER_GRACE_TICKS: i64 = 10 * TICKS_PER_SECOND;

/// Queue update applied once a play attempt reaches the renderer.
#[derive(Debug)]
enum QueueCommit {
    Replace { entries: Vec<QueueEntry>, index: usize },
    Select(String),
}

impl QueueCommit {
    fn apply(self, queue: &mut PlayQueue) {
        match self {
            QueueCommit::Replace { entries, index } => {
                queue.set_playlist(entries);
                queue.set_playlist_index(index);
            }
            QueueCommit::Select(slot_id) => {
                queue.set_playlist_item(&slot_id);
            }
        }
    }
}

/// Parameters a renegotiation changes on the running stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct StreamChange {
    audio_stream_index: Option<i32>,
    subtitle_stream_index: Option<i32>,
    max_streaming_bitrate: Option<u64>,
    transcode_only: bool,
}

impl StreamChange {
    fn transcode_only() -> Self {
        Self {
            transcode_only: true,
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct ManagerState {
    registry: RendererRegistry,
    queue: PlayQueue,
    sessions: HashMap<String, RendererSession>,
    timers: HashMap<String, ProgressTimer>,
    /// The next stream to start is the first of a `play` request.
    pending_first_item: bool,
}

impl ManagerState {
    fn session_mut(&mut self, renderer_id: &str) -> &mut RendererSession {
        self.sessions.entry(renderer_id.to_string()).or_default()
    }

    fn current_session(&self) -> Option<(&RegisteredRenderer, &RendererSession)> {
        let renderer = self.registry.current()?;
        let session = self.sessions.get(renderer.id())?;
        Some((renderer, session))
    }

    /// The renderer a stop applies to: the current one, or the one a
    /// pending negotiation is running on.
    fn stop_target(&self) -> Option<RegisteredRenderer> {
        if let Some(current) = self.registry.current() {
            return Some(current.clone());
        }
        self.sessions
            .iter()
            .filter(|(_, session)| session.phase.is_in_flight())
            .find_map(|(id, _)| self.registry.get_renderer(id).cloned())
    }

    fn previous_tracks(&self) -> Option<PreviousTracks> {
        let (_, session) = self.current_session()?;
        let source = session.media_source()?;
        Some(PreviousTracks::from_source(
            source,
            session.audio_stream_index,
            session.subtitle_stream_index,
            session.secondary_subtitle_stream_index,
        ))
    }

    fn snapshot(&self, renderer: Option<&RegisteredRenderer>) -> PlayerState {
        let now_playing_queue = self
            .queue
            .entries()
            .iter()
            .map(|e| QueueItemRef {
                item_id: e.item.id.clone(),
                slot_id: e.slot_id.clone(),
            })
            .collect();

        let mut play_state = PlayState {
            repeat_mode: self.queue.repeat_mode(),
            shuffle_mode: self.queue.shuffle_mode(),
            playlist_item_id: self.queue.current_slot_id().map(str::to_string),
            ..PlayState::default()
        };

        let Some(renderer) = renderer else {
            return PlayerState {
                play_state,
                now_playing_queue,
                ..PlayerState::default()
            };
        };

        let output: &dyn Renderer = renderer.renderer.as_ref();
        play_state.is_paused = output.is_paused();
        play_state.volume = output.volume();
        play_state.is_muted = output.is_muted();

        let Some(session) = self.sessions.get(renderer.id()) else {
            return PlayerState {
                renderer_id: Some(renderer.id().to_string()),
                play_state,
                now_playing_queue,
                ..PlayerState::default()
            };
        };

        let stream = session.stream.as_ref();
        let media_source = session.media_source().cloned();
        play_state.position_ticks = session.position_ticks(output);
        play_state.can_seek = stream.is_some() && session.can_seek(output);
        play_state.play_method = stream.map(|s| s.play_method);
        play_state.play_session_id = stream.and_then(|s| s.play_session_id.clone());
        play_state.live_stream_id = stream.and_then(|s| s.live_stream_id.clone());
        play_state.media_source_id = media_source.as_ref().map(|s| s.id.clone());
        play_state.audio_stream_index = session.audio_stream_index;
        play_state.subtitle_stream_index = session.subtitle_stream_index;
        play_state.secondary_subtitle_stream_index = session.secondary_subtitle_stream_index;
        play_state.max_streaming_bitrate = session.max_streaming_bitrate;
        play_state.playback_start_time_ticks = session.playback_start_time_ticks;

        PlayerState {
            renderer_id: Some(renderer.id().to_string()),
            phase: session.phase,
            item: stream.map(|s| s.item.clone()),
            media_source,
            play_state,
            now_playing_queue,
        }
    }
}

struct Inner {
    catalog: Arc<dyn CatalogClient>,
    clock: Arc<dyn Clock>,
    negotiator: SourceNegotiator,
    resolver: ItemResolver,
    reporter: ProgressReporter,
    events: EventBus,
    settings: PlaybackSettings,
    state: Mutex<ManagerState>,
}

/// Entry point for view layers and renderers.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct PlaybackManager {
    inner: Arc<Inner>,
}

impl PlaybackManager {
    pub fn new(config: &CoreConfig, events: EventBus) -> Self {
        let settings = config.playback.clone();
        let catalog = config.catalog_client.clone();

        let negotiator =
            SourceNegotiator::new(catalog.clone(), settings.enable_remote_video_direct_play);
        let resolver = ItemResolver::new(
            catalog.clone(),
            settings.item_limit,
            settings.enable_next_episode_auto_play,
            settings.enable_cinema_mode,
        );
        let reporter = ProgressReporter::new(config.reporting_client.clone(), events.clone());

        let state = ManagerState {
            registry: RendererRegistry::new(),
            queue: PlayQueue::new(settings.shuffle_seed),
            sessions: HashMap::new(),
            timers: HashMap::new(),
            pending_first_item: false,
        };

        Self {
            inner: Arc::new(Inner {
                catalog,
                clock: config.clock.clone(),
                negotiator,
                resolver,
                reporter,
                events,
                settings,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Renderers
    // ========================================================================

    pub fn register_renderer(&self, renderer: Arc<dyn Renderer>) -> RendererDescriptor {
        self.inner.state.lock().registry.register_renderer(renderer)
    }

    pub fn unregister_renderer(&self, renderer_id: &str) {
        let mut state = self.inner.state.lock();
        state.timers.remove(renderer_id);
        state.sessions.remove(renderer_id);
        if state.registry.unregister_renderer(renderer_id) {
            self.inner.events.emit_playback(PlaybackEvent::PlayerChange {
                previous: Some(renderer_id.to_string()),
                current: None,
            });
        }
    }

    pub fn renderers(&self) -> Vec<RendererDescriptor> {
        self.inner
            .state
            .lock()
            .registry
            .renderers()
            .iter()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn current_renderer(&self) -> Option<RendererDescriptor> {
        self.inner
            .state
            .lock()
            .registry
            .current()
            .map(|r| r.descriptor.clone())
    }

    /// Make a registered renderer the active one, or clear it with `None`.
    pub fn set_active_renderer(&self, renderer_id: Option<&str>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if let Some(id) = renderer_id {
            if state.registry.get_renderer(id).is_none() {
                return Err(PlaybackError::PlayerNotFound);
            }
        }
        self.set_current_locked(&mut state, renderer_id);
        Ok(())
    }

    fn set_current_locked(&self, state: &mut ManagerState, renderer_id: Option<&str>) {
        if let Some(previous) = state.registry.set_current(renderer_id) {
            debug!(?previous, current = ?renderer_id, "Active renderer changed");
            self.inner.events.emit_playback(PlaybackEvent::PlayerChange {
                previous,
                current: renderer_id.map(str::to_string),
            });
        }
    }

    fn current(&self) -> Result<RegisteredRenderer> {
        self.inner
            .state
            .lock()
            .registry
            .current()
            .cloned()
            .ok_or(PlaybackError::NoActivePlayer)
    }

    /// Current renderer when it keeps its own playlist.
    fn self_managed_current(&self) -> Option<RegisteredRenderer> {
        self.inner
            .state
            .lock()
            .registry
            .current()
            .filter(|r| !r.is_local_playlist_managed())
            .cloned()
    }

    // ========================================================================
    // Play
    // ========================================================================

    /// Resolve `options` into a queue and start its first item.
    #[instrument(skip(self, options), fields(ids = options.ids.len(), items = options.items.len()))]
    pub async fn play(&self, options: PlayOptions) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            let supports_progress = renderer.descriptor.capabilities.supports_progress;
            let resolved = self.inner.resolver.resolve(&options, supports_progress).await?;
            return forward_play_request(&renderer, resolved, &options).await;
        }

        {
            let mut state = self.inner.state.lock();
            if let Some(renderer) = state.registry.current().map(|r| r.id().to_string()) {
                let session = state.session_mut(&renderer);
                if !session.started {
                    session.phase = PlaybackPhase::Resolving;
                }
            }
        }

        let roots = if options.items.is_empty() {
            self.inner.resolver.items_for_playback(&options.ids).await?
        } else {
            options.items.clone()
        };

        let supports_progress = roots
            .first()
            .and_then(|first| {
                self.inner
                    .state
                    .lock()
                    .registry
                    .select_renderer(first, &options.item_options(), false)
            })
            .map(|r| r.descriptor.capabilities.supports_progress)
            .unwrap_or(true);

        let translated = self
            .inner
            .resolver
            .translate_items(roots, &options, supports_progress)
            .await?;
        let resolved = self.inner.resolver.with_additional_parts(translated).await;

        self.play_with_intros(resolved, options).await
    }

    async fn play_with_intros(&self, resolved: ResolvedItems, options: PlayOptions) -> Result<()> {
        let ResolvedItems { items, start_index } = resolved;
        let start_index = start_index.filter(|i| *i < items.len()).unwrap_or(0);

        let Some(first) = items.get(start_index).cloned() else {
            let err = PlaybackError::NoMediaSource("empty play request".to_string());
            self.cancel_playback(None, &err);
            return Err(err);
        };

        if matches!(first.media_type, MediaType::Photo | MediaType::Book) {
            return self.play_other(items, start_index, &options).await;
        }

        let intro_options = PlayOptions {
            start_index: Some(start_index),
            ..options.clone()
        };
        let intros = self.inner.resolver.intros(&first, &intro_options).await;
        let start = if intros.is_empty() { start_index } else { 0 };

        let intro_play_options = ItemPlayOptions {
            fullscreen: options.fullscreen,
            ..ItemPlayOptions::default()
        };
        let mut entries: Vec<QueueEntry> = intros
            .into_iter()
            .map(|intro| QueueEntry::new(intro).with_play_options(intro_play_options.clone()))
            .collect();
        entries.extend(items.into_iter().enumerate().map(|(index, item)| {
            let entry = QueueEntry::new(item);
            if index == start_index {
                entry.with_play_options(options.item_options())
            } else {
                entry
            }
        }));

        let entry = entries[start].clone();
        let play_options = entry.play_options.clone().unwrap_or_default();
        self.inner.state.lock().pending_first_item = true;

        self.play_internal(
            entry.item,
            play_options,
            QueueCommit::Replace {
                entries,
                index: start,
            },
        )
        .await
    }

    /// Photos and books go to a renderer that shows the whole set itself.
    async fn play_other(
        &self,
        items: Vec<PlayableItem>,
        start_index: usize,
        options: &PlayOptions,
    ) -> Result<()> {
        let renderer = {
            let mut state = self.inner.state.lock();
            let renderer = items.get(start_index).and_then(|item| {
                state
                    .registry
                    .select_renderer(item, &options.item_options(), false)
            });
            if let Some(renderer) = renderer.as_ref() {
                self.set_current_locked(&mut state, Some(renderer.id()));
            }
            renderer
        };

        let Some(renderer) = renderer else {
            let err = PlaybackError::PlayerNotFound;
            self.cancel_playback(items.get(start_index), &err);
            return Err(err);
        };

        forward_play_request(
            &renderer,
            ResolvedItems {
                items,
                start_index: Some(start_index),
            },
            options,
        )
        .await
    }

    async fn play_internal(
        &self,
        item: PlayableItem,
        options: ItemPlayOptions,
        commit: QueueCommit,
    ) -> Result<()> {
        if item.is_placeholder {
            let err = PlaybackError::PlaceholderItem(item.id.clone().unwrap_or_default());
            self.cancel_playback(Some(&item), &err);
            return Err(err);
        }

        let max_bitrate = self
            .inner
            .negotiator
            .detect_max_bitrate(
                &item,
                self.inner.settings.enable_bitrate_detection,
                self.inner.settings.max_streaming_bitrate,
            )
            .await;

        let delay = self.inner.settings.play_start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.play_after_bitrate_detect(item, options, max_bitrate, commit)
            .await
    }

    async fn play_after_bitrate_detect(
        &self,
        item: PlayableItem,
        options: ItemPlayOptions,
        max_bitrate: u64,
        commit: QueueCommit,
    ) -> Result<()> {
        let (renderer, active, previous_tracks) = {
            let state = self.inner.state.lock();
            let renderer = state.registry.select_renderer(&item, &options, false);
            let active = state
                .current_session()
                .filter(|(_, session)| session.started)
                .map(|(renderer, _)| renderer.clone());
            (renderer, active, state.previous_tracks())
        };

        let Some(renderer) = renderer else {
            let err = PlaybackError::PlayerNotFound;
            self.cancel_playback(Some(&item), &err);
            return Err(err);
        };

        if let Some(active) = active {
            self.inner
                .state
                .lock()
                .session_mut(active.id())
                .play_next_after_ended = false;
            self.on_playback_changing(&active, &renderer, &item).await;
        }

        let generation = {
            let mut state = self.inner.state.lock();
            let session = state.session_mut(renderer.id());
            session.reset_for_new_item();
            session.max_streaming_bitrate = Some(max_bitrate);
            session.begin_attempt(PlaybackPhase::Negotiating)
        };

        if !item.is_server_item() || item.kind == ItemKind::Book {
            return match url_item_descriptor(&item, options.fullscreen) {
                Ok(descriptor) => {
                    self.start_stream(&renderer, generation, descriptor, commit)
                        .await
                }
                Err(e) => self.fail_attempt(&renderer, generation, Some(&item), e),
            };
        }

        let media_streams = self.media_streams_for(&item, &options).await;

        if !renderer.is_local_playlist_managed() {
            self.set_current_locked(&mut self.inner.state.lock(), Some(renderer.id()));
            let request = PlayRequest {
                items: vec![item],
                start_index: 0,
                start_position_ticks: options.start_position_ticks,
                media_source_id: options.media_source_id.clone(),
                audio_stream_index: options.audio_stream_index,
                subtitle_stream_index: options.subtitle_stream_index,
                shuffle: false,
                fullscreen: options.fullscreen,
            };
            return renderer
                .renderer
                .play_request(request)
                .await
                .map_err(renderer_error);
        }

        let mut request = NegotiationRequest {
            media_source_id: options.media_source_id.clone(),
            start_position_ticks: options.start_position_ticks,
            audio_stream_index: options.audio_stream_index,
            subtitle_stream_index: options.subtitle_stream_index,
            max_streaming_bitrate: Some(max_bitrate),
            fullscreen: options.fullscreen,
            ..NegotiationRequest::default()
        };

        if let Some(previous) = previous_tracks.as_ref() {
            let selection = auto_set_next_tracks(
                previous,
                &media_streams,
                self.inner.settings.remember_audio_selections,
                self.inner.settings.remember_subtitle_selections,
            );
            request.audio_stream_index = request.audio_stream_index.or(selection.audio);
            request.subtitle_stream_index = request.subtitle_stream_index.or(selection.subtitle);
            request.secondary_subtitle_stream_index = selection.secondary_subtitle;

            if selection.forces_stream() && request.media_source_id.is_none() {
                request.media_source_id = item.id.clone();
            }
        }

        match self
            .inner
            .negotiator
            .negotiate(&renderer, &item, &request)
            .await
        {
            Ok(descriptor) => {
                self.start_stream(&renderer, generation, descriptor, commit)
                    .await
            }
            Err(e) => self.fail_attempt(&renderer, generation, Some(&item), e),
        }
    }

    /// Streams of the source about to be negotiated, for track continuity.
    async fn media_streams_for(
        &self,
        item: &PlayableItem,
        options: &ItemPlayOptions,
    ) -> Vec<MediaStream> {
        if item.kind == ItemKind::TvChannel {
            return Vec::new();
        }
        if !item.media_streams.is_empty() && options.media_source_id.is_none() {
            return item.media_streams.clone();
        }

        let Some(lookup) = options.media_source_id.as_ref().or(item.id.as_ref()) else {
            return Vec::new();
        };
        match self.inner.catalog.get_item(lookup).await {
            Ok(full) => full.media_streams,
            Err(e) => {
                debug!(item_id = %lookup, error = %e, "Media streams unavailable");
                Vec::new()
            }
        }
    }

    async fn start_stream(
        &self,
        renderer: &RegisteredRenderer,
        generation: u64,
        descriptor: StreamDescriptor,
        commit: QueueCommit,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let session = state.session_mut(renderer.id());
            if !session.is_current(generation) {
                debug!(renderer = %renderer.id(), "Superseded before start");
                return Ok(());
            }
            session.phase = PlaybackPhase::Starting;
            session.is_changing_stream = false;
            commit.apply(&mut state.queue);
        }

        info!(
            renderer = %renderer.id(),
            item_id = ?descriptor.item.id,
            play_method = %descriptor.play_method,
            play_session_id = ?descriptor.play_session_id,
            "Starting stream"
        );

        match renderer.renderer.play(descriptor.clone()).await {
            Ok(()) if self.stopped_since(renderer.id(), generation) => {
                self.discard_stream(renderer).await;
                Ok(())
            }
            Ok(()) => {
                self.on_playback_started(renderer, generation, descriptor)
                    .await
            }
            Err(e) => {
                warn!(renderer = %renderer.id(), error = %e, "Renderer refused stream");
                self.handle_stream_error(
                    renderer.clone(),
                    generation,
                    descriptor,
                    RendererErrorKind::Other,
                )
                .await
            }
        }
    }

    fn is_current(&self, renderer_id: &str, generation: u64) -> bool {
        self.inner
            .state
            .lock()
            .session_mut(renderer_id)
            .is_current(generation)
    }

    /// `stop` superseded `generation` while its stream was handed over.
    fn stopped_since(&self, renderer_id: &str, generation: u64) -> bool {
        let mut state = self.inner.state.lock();
        let session = state.session_mut(renderer_id);
        !session.is_current(generation) && session.phase == PlaybackPhase::Stopped
    }

    async fn discard_stream(&self, renderer: &RegisteredRenderer) {
        debug!(renderer = %renderer.id(), "Stream arrived after stop");
        if let Err(e) = renderer.renderer.stop(true).await {
            debug!(renderer = %renderer.id(), error = %e, "Renderer teardown failed");
        }
    }

    async fn on_playback_started(
        &self,
        renderer: &RegisteredRenderer,
        generation: u64,
        descriptor: StreamDescriptor,
    ) -> Result<()> {
        let (snapshot, is_first_item) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if !state.session_mut(renderer.id()).is_current(generation) {
                return Ok(());
            }

            self.set_current_locked(state, Some(renderer.id()));

            let now = self.inner.clock.now();
            let session = state.session_mut(renderer.id());
            session.audio_stream_index = descriptor.audio_stream_index;
            session.subtitle_stream_index = descriptor.subtitle_stream_index;
            session.secondary_subtitle_stream_index = descriptor
                .media_source
                .as_ref()
                .and_then(|s| s.default_secondary_subtitle_stream_index);
            session.playback_start_time_ticks =
                Some(ticks_from_millis(now.timestamp_millis()));
            session.last_live_stream_refresh = Some(now);
            session.stream = Some(descriptor.clone());
            session.started = true;
            session.ended = false;
            session.is_changing_stream = false;
            session.play_next_after_ended = true;
            session.phase = PlaybackPhase::Playing;

            let is_first_item = std::mem::take(&mut state.pending_first_item);
            (state.snapshot(Some(renderer)), is_first_item)
        };

        info!(
            renderer = %renderer.id(),
            item_id = ?descriptor.item.id,
            play_method = %descriptor.play_method,
            "Playback started"
        );

        self.inner.reporter.report_start(&snapshot).await;
        self.inner.events.emit_playback(PlaybackEvent::PlaybackStart {
            renderer_id: renderer.id().to_string(),
            item_id: descriptor.item.id.clone(),
            play_method: Some(descriptor.play_method),
            play_session_id: descriptor.play_session_id.clone(),
            is_first_item,
            fullscreen: descriptor.fullscreen,
        });

        self.start_progress_timer(renderer.id(), generation);
        Ok(())
    }

    /// Stop `active` because another item is about to play.
    async fn on_playback_changing(
        &self,
        active: &RegisteredRenderer,
        next_renderer: &RegisteredRenderer,
        next_item: &PlayableItem,
    ) {
        let snapshot = {
            let mut state = self.inner.state.lock();
            state.timers.remove(active.id());
            let snapshot = state.snapshot(Some(active));
            let session = state.session_mut(active.id());
            session.started = false;
            session.ended = true;
            session.phase = PlaybackPhase::Stopped;
            snapshot
        };

        let destroy = active.id() != next_renderer.id();
        if let Err(e) = active.renderer.stop(destroy).await {
            debug!(renderer = %active.id(), error = %e, "Stop before change failed");
        }
        self.inner
            .state
            .lock()
            .session_mut(active.id())
            .reset_for_new_item();

        if active.is_local_playlist_managed() {
            self.inner
                .reporter
                .report_stop(&snapshot, Some(next_item), false)
                .await;
        }

        self.inner.events.emit_playback(PlaybackEvent::PlaybackStop {
            renderer_id: active.id().to_string(),
            item_id: snapshot.item_id().map(str::to_string),
            position_ticks: snapshot.play_state.position_ticks,
            next_item_id: next_item.id.clone(),
            next_media_type: Some(next_item.media_type),
        });
    }

    /// The stream on `renderer_id` ended, was stopped, or failed for good.
    async fn on_playback_stopped(&self, renderer_id: &str, failed: bool) -> Result<()> {
        let (renderer, snapshot, next, teardown) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let Some(renderer) = state.registry.get_renderer(renderer_id).cloned() else {
                return Ok(());
            };
            let Some(session) = state.sessions.get(renderer_id) else {
                return Ok(());
            };
            if session.is_changing_stream || !session.started {
                return Ok(());
            }
            let play_next = session.play_next_after_ended && !failed;

            state.timers.remove(renderer_id);

            let next = if play_next && renderer.is_local_playlist_managed() {
                state.queue.get_next_item().map(|(_, entry)| entry.clone())
            } else {
                None
            };

            let mut snapshot = state.snapshot(Some(&renderer));
            if !renderer.descriptor.capabilities.supports_progress
                && snapshot.play_state.position_ticks.unwrap_or(0) == 0
            {
                snapshot.play_state.position_ticks =
                    snapshot.item.as_ref().and_then(|item| item.run_time_ticks);
            }

            let session = state.session_mut(renderer_id);
            session.started = false;
            session.ended = true;
            session.phase = PlaybackPhase::Stopped;

            if next.is_none() {
                state.queue.clear_current();
            }

            let teardown = next
                .as_ref()
                .and_then(|entry| {
                    state.registry.select_renderer(
                        &entry.item,
                        &entry.play_options.clone().unwrap_or_default(),
                        false,
                    )
                })
                .map(|next_renderer| next_renderer.id() != renderer_id)
                .unwrap_or(true);

            (renderer, snapshot, next, teardown)
        };

        info!(
            renderer = %renderer_id,
            item_id = ?snapshot.item_id(),
            position_ticks = ?snapshot.play_state.position_ticks,
            failed,
            "Playback stopped"
        );

        let next_item = next.as_ref().map(|entry| &entry.item);
        self.inner
            .reporter
            .report_stop(&snapshot, next_item, failed)
            .await;
        self.inner.events.emit_playback(PlaybackEvent::PlaybackStop {
            renderer_id: renderer_id.to_string(),
            item_id: snapshot.item_id().map(str::to_string),
            position_ticks: snapshot.play_state.position_ticks,
            next_item_id: next_item.and_then(|item| item.id.clone()),
            next_media_type: next_media_type(next_item),
        });

        if teardown {
            if let Err(e) = renderer.renderer.stop(true).await {
                debug!(renderer = %renderer_id, error = %e, "Renderer teardown failed");
            }
            let mut state = self.inner.state.lock();
            state.session_mut(renderer_id).reset_for_new_item();
            self.set_current_locked(&mut state, None);
        }

        if let Some(next) = next {
            let auto_play = self.inner.settings.enable_next_episode_auto_play
                || next.item.media_type != MediaType::Video;
            if auto_play {
                return self.next_track().await;
            }
        }

        Ok(())
    }

    /// Renderer failure on `failed`: retry once with a full transcode, or
    /// give up.
    fn handle_stream_error(
        &self,
        renderer: RegisteredRenderer,
        generation: u64,
        failed: StreamDescriptor,
        kind: RendererErrorKind,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let retry_at = {
                let mut state = self.inner.state.lock();
                let session = state.session_mut(renderer.id());
                if !session.is_current(generation) {
                    return Ok(());
                }

                let url = failed.url.to_ascii_lowercase();
                let copy_disabled = session.transcode_fallback_used
                    || (url.contains("allowvideostreamcopy=false")
                        && url.contains("allowaudiostreamcopy=false"));
                let transcodable = failed
                    .media_source
                    .as_ref()
                    .map(|s| s.supports_transcoding)
                    .unwrap_or(false);

                if transcodable && !copy_disabled {
                    session.transcode_fallback_used = true;
                    let position = if session.started {
                        session.position_ticks(renderer.renderer.as_ref())
                    } else {
                        failed.start_position_ticks
                    };
                    if session.stream.is_none() {
                        session.stream = Some(failed.clone());
                    }
                    Some(position.unwrap_or(0))
                } else {
                    session.phase = PlaybackPhase::Error;
                    None
                }
            };

            if let Some(ticks) = retry_at {
                info!(
                    renderer = %renderer.id(),
                    item_id = ?failed.item.id,
                    error_kind = kind.as_str(),
                    position_ticks = ticks,
                    "Retrying with transcoding"
                );
                return self
                    .change_stream(&renderer, ticks, StreamChange::transcode_only())
                    .await;
            }

            warn!(
                renderer = %renderer.id(),
                item_id = ?failed.item.id,
                error_kind = kind.as_str(),
                "Playback failed"
            );
            self.inner.events.emit_playback(PlaybackEvent::PlaybackError {
                renderer_id: Some(renderer.id().to_string()),
                error_key: PlaybackError::NoCompatibleStream.localization_key(),
            });

            let started = {
                let mut state = self.inner.state.lock();
                let session = state.session_mut(renderer.id());
                if !session.started {
                    session.reset_for_new_item();
                }
                session.started
            };

            if started {
                self.on_playback_stopped(renderer.id(), true).await
            } else {
                Err(PlaybackError::Renderer(format!(
                    "stream failed: {}",
                    kind.as_str()
                )))
            }
        })
    }

    /// Apply `change` at `ticks`: a native seek when nothing else changes
    /// and the stream allows it, a renegotiation otherwise.
    async fn change_stream(
        &self,
        renderer: &RegisteredRenderer,
        ticks: i64,
        change: StreamChange,
    ) -> Result<()> {
        enum Plan {
            Seek(i64),
            Renegotiate {
                generation: u64,
                request: NegotiationRequest,
                previous: StreamDescriptor,
                was_started: bool,
            },
        }

        let plan = {
            let mut state = self.inner.state.lock();
            let session = state.session_mut(renderer.id());
            let previous = session.stream.clone().ok_or(PlaybackError::NoActivePlayer)?;

            let native_seek = renderer.descriptor.capabilities.supports_native_seek
                && session.can_seek(renderer.renderer.as_ref());
            if change.is_empty() && native_seek {
                Plan::Seek(previous.transcoding_offset_ticks)
            } else {
                let was_started = session.started;
                let generation = session.begin_attempt(PlaybackPhase::ChangingStream);
                session.is_changing_stream = true;

                let mut request = NegotiationRequest {
                    media_source_id: previous.media_source.as_ref().map(|s| s.id.clone()),
                    live_stream_id: previous.live_stream_id.clone(),
                    start_position_ticks: Some(ticks),
                    audio_stream_index: change
                        .audio_stream_index
                        .or(session.audio_stream_index),
                    subtitle_stream_index: change
                        .subtitle_stream_index
                        .or(session.subtitle_stream_index),
                    max_streaming_bitrate: change
                        .max_streaming_bitrate
                        .or(session.max_streaming_bitrate),
                    fullscreen: previous.fullscreen,
                    ..NegotiationRequest::default()
                };
                if change.transcode_only {
                    request = request.transcode_only();
                }

                Plan::Renegotiate {
                    generation,
                    request,
                    previous,
                    was_started,
                }
            }
        };

        let (generation, request, previous, was_started) = match plan {
            Plan::Seek(offset) => {
                let local = (ticks - offset).max(0);
                return renderer
                    .renderer
                    .set_current_time(ticks_to_duration(local))
                    .await
                    .map_err(renderer_error);
            }
            Plan::Renegotiate {
                generation,
                request,
                previous,
                was_started,
            } => (generation, request, previous, was_started),
        };

        debug!(
            renderer = %renderer.id(),
            position_ticks = ticks,
            retry = request.is_retry(),
            "Renegotiating stream"
        );

        let descriptor = match self
            .inner
            .negotiator
            .renegotiate(renderer, &previous.item, &request)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(e) => return self.fail_attempt(renderer, generation, Some(&previous.item), e),
        };

        {
            let mut state = self.inner.state.lock();
            let session = state.session_mut(renderer.id());
            if !session.is_current(generation) {
                return Ok(());
            }
            session.audio_stream_index = descriptor.audio_stream_index;
            session.subtitle_stream_index = descriptor.subtitle_stream_index;
            session.max_streaming_bitrate = request.max_streaming_bitrate;
        }

        self.change_stream_to_url(renderer, generation, previous, descriptor, was_started)
            .await
    }

    async fn change_stream_to_url(
        &self,
        renderer: &RegisteredRenderer,
        generation: u64,
        previous: StreamDescriptor,
        descriptor: StreamDescriptor,
        was_started: bool,
    ) -> Result<()> {
        if previous.media_type == MediaType::Video {
            if let Some(play_session_id) = previous.play_session_id.as_deref() {
                if let Err(e) = self.inner.catalog.stop_active_encodings(play_session_id).await {
                    debug!(play_session_id, error = %e, "Stopping encodings failed");
                }
            }
        }

        if !self.is_current(renderer.id(), generation) {
            return Ok(());
        }

        match renderer.renderer.play(descriptor.clone()).await {
            Ok(()) if self.stopped_since(renderer.id(), generation) => {
                self.discard_stream(renderer).await;
                Ok(())
            }
            Ok(()) if !was_started => {
                self.on_playback_started(renderer, generation, descriptor)
                    .await
            }
            Ok(()) => {
                let snapshot = {
                    let mut state = self.inner.state.lock();
                    let session = state.session_mut(renderer.id());
                    if !session.is_current(generation) {
                        return Ok(());
                    }
                    session.stream = Some(descriptor);
                    session.is_changing_stream = false;
                    session.started = true;
                    session.ended = false;
                    session.phase = PlaybackPhase::Playing;
                    state.snapshot(Some(renderer))
                };

                self.inner
                    .reporter
                    .report_progress(&snapshot, ProgressEvent::TimeUpdate)
                    .await;
                self.start_progress_timer(renderer.id(), generation);
                Ok(())
            }
            Err(e) => {
                warn!(renderer = %renderer.id(), error = %e, "Renderer refused changed stream");
                {
                    let mut state = self.inner.state.lock();
                    let session = state.session_mut(renderer.id());
                    if session.is_current(generation) {
                        session.is_changing_stream = false;
                    }
                }
                self.handle_stream_error(
                    renderer.clone(),
                    generation,
                    descriptor,
                    RendererErrorKind::Other,
                )
                .await
            }
        }
    }

    /// Abandon a negotiation cycle. Stale cycles and silent errors end
    /// quietly.
    fn fail_attempt(
        &self,
        renderer: &RegisteredRenderer,
        generation: u64,
        item: Option<&PlayableItem>,
        err: PlaybackError,
    ) -> Result<()> {
        let stale = {
            let mut state = self.inner.state.lock();
            let session = state.session_mut(renderer.id());
            if session.is_current(generation) {
                session.is_changing_stream = false;
                session.phase = PlaybackPhase::Error;
                false
            } else {
                true
            }
        };

        if stale || err.is_silent() {
            return Ok(());
        }

        self.cancel_playback(item, &err);
        Err(err)
    }

    fn cancel_playback(&self, item: Option<&PlayableItem>, err: &PlaybackError) {
        let error_key = err.localization_key();
        warn!(item_id = ?item.and_then(|i| i.id.as_deref()), error = %err, "Playback cancelled");

        self.inner.events.emit_playback(PlaybackEvent::PlaybackError {
            renderer_id: None,
            error_key: error_key.clone(),
        });
        self.inner.events.emit_playback(PlaybackEvent::PlaybackCancelled {
            item_id: item.and_then(|i| i.id.clone()),
            error_key,
        });
    }

    // ========================================================================
    // Progress
    // ========================================================================

    fn start_progress_timer(&self, renderer_id: &str, generation: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = renderer_id.to_string();

        let timer = ProgressTimer::start(self.inner.settings.progress_interval, move || {
            let weak = weak.clone();
            let id = id.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        PlaybackManager { inner }
                            .on_progress_tick(&id, generation)
                            .await
                    }
                    None => false,
                }
            }
        });

        self.inner
            .state
            .lock()
            .timers
            .insert(renderer_id.to_string(), timer);
    }

    /// One tick of the progress timer. Returns `false` to end the timer.
    async fn on_progress_tick(&self, renderer_id: &str, generation: u64) -> bool {
        let (snapshot, live_stream_id) = {
            let state = self.inner.state.lock();
            let Some(renderer) = state.registry.get_renderer(renderer_id) else {
                return false;
            };
            let Some(session) = state.sessions.get(renderer_id) else {
                return false;
            };
            if !session.is_current(generation) || !session.started || session.ended {
                return false;
            }
            if session.is_changing_stream {
                return true;
            }

            let now = self.inner.clock.now();
            let refresh_due = session
                .last_live_stream_refresh
                .map(|last| {
                    (now - last).to_std().unwrap_or_default()
                        >= self.inner.settings.live_stream_refresh_interval
                })
                .unwrap_or(true);
            let live_stream_id = session
                .stream
                .as_ref()
                .and_then(|s| s.live_stream_id.clone())
                .filter(|_| refresh_due);

            (state.snapshot(Some(renderer)), live_stream_id)
        };

        self.inner
            .reporter
            .report_progress(&snapshot, ProgressEvent::TimeUpdate)
            .await;

        if let Some(live_stream_id) = live_stream_id {
            self.refresh_live_stream(renderer_id, generation, &live_stream_id)
                .await;
        }
        true
    }

    async fn refresh_live_stream(&self, renderer_id: &str, generation: u64, live_stream_id: &str) {
        let refreshed = self
            .inner
            .catalog
            .get_live_stream_media_info(live_stream_id)
            .await;

        let mut state = self.inner.state.lock();
        let session = state.session_mut(renderer_id);
        if !session.is_current(generation) {
            return;
        }
        session.last_live_stream_refresh = Some(self.inner.clock.now());

        match refreshed {
            Ok(info) => {
                if let Some(source) = session
                    .stream
                    .as_mut()
                    .and_then(|s| s.media_source.as_mut())
                {
                    source.media_streams = info.media_streams;
                }
                debug!(renderer = %renderer_id, live_stream_id, "Live stream refreshed");
                self.inner
                    .events
                    .emit_playback(PlaybackEvent::LiveStreamRefreshed {
                        renderer_id: renderer_id.to_string(),
                        live_stream_id: live_stream_id.to_string(),
                    });
                self.inner
                    .events
                    .emit_playback(PlaybackEvent::MediaStreamsChange {
                        renderer_id: renderer_id.to_string(),
                    });
            }
            Err(e) => {
                debug!(live_stream_id, error = %e, "Live stream refresh failed");
            }
        }
    }

    /// Progress report for the current renderer outside the timer.
    async fn report_current(&self, event: ProgressEvent) {
        let snapshot = {
            let state = self.inner.state.lock();
            match state.current_session() {
                Some((renderer, session)) if session.started && !session.ended => {
                    state.snapshot(Some(renderer))
                }
                _ => return,
            }
        };
        self.inner.reporter.report_progress(&snapshot, event).await;
    }

    // ========================================================================
    // Renderer callbacks
    // ========================================================================

    /// Entry point for renderer notifications. Events from renderers that
    /// are not active, or that arrive while the stream is being replaced,
    /// are ignored.
    #[instrument(skip(self))]
    pub async fn handle_renderer_event(
        &self,
        renderer_id: &str,
        event: RendererEvent,
    ) -> Result<()> {
        let (renderer, changing, generation, stream) = {
            let state = self.inner.state.lock();
            let Some((renderer, session)) = state
                .current_session()
                .filter(|(renderer, _)| renderer.id() == renderer_id)
            else {
                debug!("Event from inactive renderer ignored");
                return Ok(());
            };
            (
                renderer.clone(),
                session.is_changing_stream,
                session.generation,
                session.stream.clone(),
            )
        };

        match event {
            RendererEvent::TimeUpdate => Ok(()),
            RendererEvent::Paused => {
                self.emit_state_change(renderer_id, StateChange::Paused);
                self.report_current(ProgressEvent::Pause).await;
                Ok(())
            }
            RendererEvent::Unpaused => {
                self.emit_state_change(renderer_id, StateChange::Unpaused);
                self.report_current(ProgressEvent::Unpause).await;
                Ok(())
            }
            RendererEvent::VolumeChanged => {
                self.report_current(ProgressEvent::VolumeChange).await;
                Ok(())
            }
            RendererEvent::Seeked => {
                let position_ticks = self.current_time().unwrap_or(0);
                self.emit_state_change(renderer_id, StateChange::Seeked { position_ticks });
                self.report_current(ProgressEvent::TimeUpdate).await;
                Ok(())
            }
            RendererEvent::Ended | RendererEvent::Stopped => {
                if changing {
                    return Ok(());
                }
                self.on_playback_stopped(renderer_id, false).await
            }
            RendererEvent::Error { kind } => {
                let Some(stream) = stream.filter(|_| !changing) else {
                    return Ok(());
                };
                self.handle_stream_error(renderer, generation, stream, kind)
                    .await
            }
        }
    }

    fn emit_state_change(&self, renderer_id: &str, change: StateChange) {
        self.inner.events.emit_playback(PlaybackEvent::StateChange {
            renderer_id: renderer_id.to_string(),
            change,
        });
    }

    // ========================================================================
    // Transport
    // ========================================================================

    pub async fn pause(&self) -> Result<()> {
        self.current()?.renderer.pause().await.map_err(renderer_error)
    }

    pub async fn unpause(&self) -> Result<()> {
        self.current()?
            .renderer
            .unpause()
            .await
            .map_err(renderer_error)
    }

    pub async fn play_pause(&self) -> Result<()> {
        let renderer = self.current()?;
        let result = if renderer.renderer.is_paused() {
            renderer.renderer.unpause().await
        } else {
            renderer.renderer.pause().await
        };
        result.map_err(renderer_error)
    }

    /// Stop the current item without advancing.
    ///
    /// Any negotiation cycle still running on the renderer is superseded:
    /// its stream never starts and it reports nothing.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let (renderer, started) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let renderer = state.stop_target().ok_or(PlaybackError::NoActivePlayer)?;
            state.pending_first_item = false;

            let session = state.session_mut(renderer.id());
            session.play_next_after_ended = false;
            session.is_changing_stream = false;
            session.begin_attempt(PlaybackPhase::Stopped);
            if !session.started {
                session.reset_for_new_item();
            }
            (renderer, session.started)
        };

        if !renderer.is_local_playlist_managed() || !started {
            return renderer.renderer.stop(true).await.map_err(renderer_error);
        }

        self.on_playback_stopped(renderer.id(), false).await
    }

    /// Seek to an absolute position in ticks.
    #[instrument(skip(self))]
    pub async fn seek(&self, ticks: i64) -> Result<()> {
        let ticks = ticks.max(0);
        let renderer = self.current()?;

        if !renderer.is_local_playlist_managed() {
            return renderer
                .renderer
                .set_current_time(ticks_to_duration(ticks))
                .await
                .map_err(renderer_error);
        }

        self.change_stream(&renderer, ticks, StreamChange::default())
            .await
    }

    pub async fn seek_relative(&self, offset_ticks: i64) -> Result<()> {
        let position = self.current_time().unwrap_or(0);
        self.seek(position + offset_ticks).await
    }

    pub async fn seek_percent(&self, percent: f64) -> Result<()> {
        let duration = self.duration().ok_or(PlaybackError::NoActivePlayer)?;
        let percent = percent.clamp(0.0, 100.0);
        self.seek((duration as f64 * percent / 100.0) as i64).await
    }

    pub async fn fast_forward(&self) -> Result<()> {
        self.seek_relative(ticks_from_duration(self.inner.settings.fast_forward_step))
            .await
    }

    pub async fn rewind(&self) -> Result<()> {
        self.seek_relative(-ticks_from_duration(self.inner.settings.rewind_step))
            .await
    }

    /// Jump to the next chapter, or the next track past the last one.
    pub async fn next_chapter(&self) -> Result<()> {
        let position = self.current_time().unwrap_or(0);
        let next = self
            .current_item()
            .and_then(|item| {
                item.chapters
                    .iter()
                    .map(|c| c.start_position_ticks)
                    .find(|start| *start > position)
            });

        match next {
            Some(start) => self.seek(start).await,
            None => self.next_track().await,
        }
    }

    pub async fn previous_chapter(&self) -> Result<()> {
        let position = (self.current_time().unwrap_or(0) - PREVIOUS_CHAPTER_GRACE_TICKS).max(0);
        let previous = self.current_item().and_then(|item| {
            item.chapters
                .iter()
                .map(|c| c.start_position_ticks)
                .filter(|start| *start <= position)
                .last()
        });

        match previous {
            Some(start) => self.seek(start).await,
            None => self.previous_track().await,
        }
    }

    // ========================================================================
    // Queue navigation
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn next_track(&self) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer.renderer.next_track().await.map_err(renderer_error);
        }

        let next = self
            .inner
            .state
            .lock()
            .queue
            .get_next_item()
            .map(|(_, entry)| entry.clone());
        let Some(entry) = next else {
            debug!("End of queue");
            return Ok(());
        };

        let options = entry.play_options.clone().unwrap_or_default();
        self.play_internal(entry.item, options, QueueCommit::Select(entry.slot_id))
            .await
    }

    /// Play the previous entry from its beginning.
    #[instrument(skip(self))]
    pub async fn previous_track(&self) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .previous_track()
                .await
                .map_err(renderer_error);
        }

        let previous = self
            .inner
            .state
            .lock()
            .queue
            .get_previous_item()
            .map(|(_, entry)| entry.clone());
        let Some(entry) = previous else {
            return Ok(());
        };

        let options = ItemPlayOptions {
            start_position_ticks: Some(0),
            ..entry.play_options.clone().unwrap_or_default()
        };
        self.play_internal(entry.item, options, QueueCommit::Select(entry.slot_id))
            .await
    }

    pub async fn set_current_playlist_item(&self, slot_id: &str) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .set_current_playlist_item(slot_id)
                .await
                .map_err(renderer_error);
        }

        let entry = self
            .inner
            .state
            .lock()
            .queue
            .entry(slot_id)
            .cloned()
            .ok_or_else(|| PlaybackError::QueueItemNotFound(slot_id.to_string()))?;

        let options = entry.play_options.clone().unwrap_or_default();
        self.play_internal(entry.item, options, QueueCommit::Select(entry.slot_id))
            .await
    }

    pub async fn queue(&self, options: PlayOptions) -> Result<()> {
        self.queue_items(options, false).await
    }

    pub async fn queue_next(&self, options: PlayOptions) -> Result<()> {
        self.queue_items(options, true).await
    }

    async fn queue_items(&self, options: PlayOptions, next: bool) -> Result<()> {
        let current = self.inner.state.lock().registry.current().cloned();
        let Some(current) = current else {
            return self.play(options).await;
        };

        let resolved = self
            .inner
            .resolver
            .resolve(&options, current.descriptor.capabilities.supports_progress)
            .await?;

        if !current.is_local_playlist_managed() {
            return current
                .renderer
                .queue(resolved.items, next)
                .await
                .map_err(renderer_error);
        }

        let entries: Vec<QueueEntry> = resolved.items.into_iter().map(QueueEntry::new).collect();
        let slot_ids = {
            let mut state = self.inner.state.lock();
            if next {
                state.queue.queue_next(entries)
            } else {
                state.queue.queue(entries)
            }
        };

        debug!(count = slot_ids.len(), next, "Queued items");
        self.inner
            .events
            .emit_queue(QueueEvent::PlaylistItemAdd { slot_ids });
        Ok(())
    }

    pub async fn remove_from_playlist(&self, slot_ids: &[String]) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .remove_from_playlist(slot_ids)
                .await
                .map_err(renderer_error);
        }

        let (removed, removed_current, remaining) = {
            let mut state = self.inner.state.lock();
            let (removed, removed_current) = state.queue.remove_from_playlist(slot_ids);
            (removed, removed_current, !state.queue.is_empty())
        };

        if !removed.is_empty() {
            self.inner
                .events
                .emit_queue(QueueEvent::PlaylistItemRemove { slot_ids: removed });
        }

        if removed_current {
            if remaining {
                return self.next_track().await;
            }
            if self.current_renderer().is_some() {
                return self.stop().await;
            }
        }
        Ok(())
    }

    pub async fn move_playlist_item(&self, slot_id: &str, new_index: usize) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .move_playlist_item(slot_id, new_index)
                .await
                .map_err(renderer_error);
        }

        let moved = self
            .inner
            .state
            .lock()
            .queue
            .move_playlist_item(slot_id, new_index);
        if let Some(new_index) = moved {
            self.inner.events.emit_queue(QueueEvent::PlaylistItemMove {
                slot_id: slot_id.to_string(),
                new_index,
            });
        }
        Ok(())
    }

    /// Empty the queue, keeping the playing entry unless
    /// `clear_playing_item` is set.
    pub fn clear_queue(&self, clear_playing_item: bool) {
        let removed = self.inner.state.lock().queue.clear(!clear_playing_item);
        if !removed.is_empty() {
            self.inner
                .events
                .emit_queue(QueueEvent::PlaylistItemRemove { slot_ids: removed });
        }
        self.inner.events.emit_queue(QueueEvent::QueueCleared);
    }

    pub async fn set_repeat_mode(&self, mode: RepeatMode) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .set_repeat_mode(mode)
                .await
                .map_err(renderer_error);
        }

        self.inner.state.lock().queue.set_repeat_mode(mode);
        self.inner
            .events
            .emit_queue(QueueEvent::RepeatModeChange { mode });
        self.report_current(ProgressEvent::RepeatModeChange).await;
        Ok(())
    }

    pub async fn set_shuffle_mode(&self, mode: ShuffleMode) -> Result<()> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .set_shuffle_mode(mode)
                .await
                .map_err(renderer_error);
        }

        self.inner.state.lock().queue.set_shuffle_mode(mode);
        self.inner
            .events
            .emit_queue(QueueEvent::ShuffleModeChange { mode });
        self.report_current(ProgressEvent::ShuffleQueueModeChange)
            .await;
        Ok(())
    }

    pub async fn toggle_queue_shuffle_mode(&self) -> Result<()> {
        let mode = match self.inner.state.lock().queue.shuffle_mode() {
            ShuffleMode::Sorted => ShuffleMode::Shuffle,
            ShuffleMode::Shuffle => ShuffleMode::Sorted,
        };
        self.set_shuffle_mode(mode).await
    }

    // ========================================================================
    // Tracks
    // ========================================================================

    /// Switch audio tracks, in place when the renderer can decode the track
    /// from the current source, by renegotiating otherwise.
    #[instrument(skip(self))]
    pub async fn set_audio_stream_index(&self, index: i32) -> Result<()> {
        let renderer = self.current()?;
        if !renderer.is_local_playlist_managed() {
            return renderer
                .renderer
                .set_audio_stream_index(index)
                .await
                .map_err(renderer_error);
        }

        let (stream, ticks) = self.current_stream(&renderer)?;
        let switchable = stream.play_method != PlayMethod::Transcode
            && renderer.descriptor.capabilities.supports_audio_stream_switching;

        let in_place = if switchable {
            let profile = self
                .inner
                .negotiator
                .device_profile(&renderer, &stream.item, false)
                .await?;
            stream
                .media_source
                .as_ref()
                .map(|source| is_audio_stream_supported(source, index, &profile))
                .unwrap_or(false)
        } else {
            false
        };

        if in_place {
            renderer
                .renderer
                .set_audio_stream_index(index)
                .await
                .map_err(renderer_error)?;
        } else {
            self.change_stream(
                &renderer,
                ticks,
                StreamChange {
                    audio_stream_index: Some(index),
                    ..StreamChange::default()
                },
            )
            .await?;
        }

        self.inner
            .state
            .lock()
            .session_mut(renderer.id())
            .audio_stream_index = Some(index);
        self.inner
            .events
            .emit_playback(PlaybackEvent::AudioTrackChange {
                renderer_id: renderer.id().to_string(),
                index,
            });
        self.report_current(ProgressEvent::AudioTrackChange).await;
        Ok(())
    }

    /// Switch subtitles; `-1` turns them off.
    ///
    /// External tracks, and embedded ones while not transcoding, are shown
    /// by the renderer itself. Anything else is burnt in by the server and
    /// needs a new stream, as does dropping a burnt-in track.
    #[instrument(skip(self))]
    pub async fn set_subtitle_stream_index(&self, index: i32) -> Result<()> {
        let renderer = self.current()?;
        if !renderer.is_local_playlist_managed() {
            return renderer
                .renderer
                .set_subtitle_stream_index(index)
                .await
                .map_err(renderer_error);
        }

        let (stream, ticks) = self.current_stream(&renderer)?;
        let current_index = self
            .inner
            .state
            .lock()
            .session_mut(renderer.id())
            .subtitle_stream_index;
        let is_transcoding = stream.play_method == PlayMethod::Transcode;

        let lookup = |i: Option<i32>| {
            i.filter(|i| *i >= 0).and_then(|i| {
                stream
                    .media_source
                    .as_ref()
                    .and_then(|s| s.stream(StreamKind::Subtitle, i))
                    .cloned()
            })
        };
        let current_stream = lookup(current_index);
        let new_stream = lookup(Some(index));

        let shown_by_renderer = |s: &MediaStream| match s.effective_delivery_method() {
            SubtitleDeliveryMethod::External => true,
            SubtitleDeliveryMethod::Embed => !is_transcoding,
            _ => false,
        };
        let burnt_in = |s: &MediaStream| match s.effective_delivery_method() {
            SubtitleDeliveryMethod::Encode => true,
            SubtitleDeliveryMethod::Embed => is_transcoding,
            _ => false,
        };

        let change_to = |subtitle: i32| StreamChange {
            subtitle_stream_index: Some(subtitle),
            ..StreamChange::default()
        };

        let mut selected = NO_STREAM;
        match (current_stream.as_ref(), new_stream.as_ref()) {
            (Some(current), None) => {
                if burnt_in(current) {
                    self.change_stream(&renderer, ticks, change_to(NO_STREAM))
                        .await?;
                }
            }
            (None, Some(new)) => {
                if shown_by_renderer(new) {
                    selected = index;
                } else {
                    self.change_stream(&renderer, ticks, change_to(index))
                        .await?;
                }
            }
            (Some(current), Some(new)) => {
                if shown_by_renderer(new) {
                    selected = index;
                    let current_client_side = matches!(
                        current.effective_delivery_method(),
                        SubtitleDeliveryMethod::External | SubtitleDeliveryMethod::Embed
                    );
                    if !current_client_side {
                        self.change_stream(&renderer, ticks, change_to(NO_STREAM))
                            .await?;
                    }
                } else {
                    self.change_stream(&renderer, ticks, change_to(index))
                        .await?;
                }
            }
            (None, None) => {}
        }

        renderer
            .renderer
            .set_subtitle_stream_index(selected)
            .await
            .map_err(renderer_error)?;

        let drop_secondary = selected == NO_STREAM
            || !new_stream
                .as_ref()
                .map(track_has_secondary_subtitle_support)
                .unwrap_or(false);
        if drop_secondary && renderer.descriptor.capabilities.supports_secondary_subtitles {
            if let Err(e) = renderer
                .renderer
                .set_secondary_subtitle_stream_index(NO_STREAM)
                .await
            {
                debug!(error = %e, "Clearing secondary subtitles failed");
            }
        }

        {
            let mut state = self.inner.state.lock();
            let session = state.session_mut(renderer.id());
            session.subtitle_stream_index = Some(index);
            if drop_secondary {
                session.secondary_subtitle_stream_index = Some(NO_STREAM);
            }
        }

        self.inner
            .events
            .emit_playback(PlaybackEvent::SubtitleTrackChange {
                renderer_id: renderer.id().to_string(),
                index,
            });
        self.report_current(ProgressEvent::SubtitleTrackChange)
            .await;
        Ok(())
    }

    /// Show a second subtitle track. Ignored unless the renderer supports
    /// it and the track is an external text format other than ASS/SSA.
    pub async fn set_secondary_subtitle_stream_index(&self, index: i32) -> Result<()> {
        let renderer = self.current()?;
        let (stream, _) = self.current_stream(&renderer)?;

        if index != NO_STREAM {
            let supported = renderer.descriptor.capabilities.supports_secondary_subtitles
                && stream
                    .media_source
                    .as_ref()
                    .and_then(|s| s.stream(StreamKind::Subtitle, index))
                    .map(track_has_secondary_subtitle_support)
                    .unwrap_or(false);
            if !supported {
                debug!(index, "Secondary subtitle not supported");
                return Ok(());
            }
        }

        renderer
            .renderer
            .set_secondary_subtitle_stream_index(index)
            .await
            .map_err(renderer_error)?;
        self.inner
            .state
            .lock()
            .session_mut(renderer.id())
            .secondary_subtitle_stream_index = Some(index);
        Ok(())
    }

    /// Cycle to the next audio track, wrapping around.
    pub async fn change_audio_stream(&self) -> Result<()> {
        let (streams, current) = self.stream_cycle(StreamKind::Audio, |s| s.audio_stream_index)?;
        if streams.len() <= 1 {
            return Ok(());
        }

        let position = current.and_then(|c| streams.iter().position(|i| *i == c));
        let next = match position {
            Some(p) => streams[(p + 1) % streams.len()],
            None => streams[0],
        };
        self.set_audio_stream_index(next).await
    }

    /// Cycle to the next subtitle track; past the last one subtitles turn
    /// off.
    pub async fn change_subtitle_stream(&self) -> Result<()> {
        let (streams, current) =
            self.stream_cycle(StreamKind::Subtitle, |s| s.subtitle_stream_index)?;
        if streams.is_empty() {
            return Ok(());
        }

        let next = match current.and_then(|c| streams.iter().position(|i| *i == c)) {
            Some(p) => streams.get(p + 1).copied().unwrap_or(NO_STREAM),
            None => streams[0],
        };
        self.set_subtitle_stream_index(next).await
    }

    fn stream_cycle(
        &self,
        kind: StreamKind,
        current: impl Fn(&RendererSession) -> Option<i32>,
    ) -> Result<(Vec<i32>, Option<i32>)> {
        let state = self.inner.state.lock();
        let (_, session) = state
            .current_session()
            .ok_or(PlaybackError::NoActivePlayer)?;
        let streams: Vec<i32> = session
            .media_source()
            .map(|s| s.streams_of(kind).map(|m| m.index).collect())
            .unwrap_or_default();
        Ok((streams, current(session)))
    }

    /// Lower or raise the bitrate ceiling; always renegotiates.
    pub async fn set_max_streaming_bitrate(&self, bitrate: u64) -> Result<()> {
        let renderer = self.current()?;
        let (_, ticks) = self.current_stream(&renderer)?;
        self.change_stream(
            &renderer,
            ticks,
            StreamChange {
                max_streaming_bitrate: Some(bitrate),
                ..StreamChange::default()
            },
        )
        .await
    }

    fn current_stream(&self, renderer: &RegisteredRenderer) -> Result<(StreamDescriptor, i64)> {
        let mut state = self.inner.state.lock();
        let session = state.session_mut(renderer.id());
        let stream = session.stream.clone().ok_or(PlaybackError::NoActivePlayer)?;
        let ticks = session
            .position_ticks(renderer.renderer.as_ref())
            .unwrap_or(0);
        Ok((stream, ticks))
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn get_player_state(&self) -> PlayerState {
        let state = self.inner.state.lock();
        let renderer = state.registry.current().cloned();
        state.snapshot(renderer.as_ref())
    }

    /// Entries of the play queue, or of the renderer's own playlist.
    pub async fn get_playlist(&self) -> Result<Vec<QueueEntry>> {
        if let Some(renderer) = self.self_managed_current() {
            return renderer
                .renderer
                .get_playlist()
                .await
                .map_err(renderer_error);
        }
        Ok(self.inner.state.lock().queue.entries().to_vec())
    }

    pub fn current_playlist_item_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .queue
            .current_slot_id()
            .map(str::to_string)
    }

    pub fn current_item(&self) -> Option<PlayableItem> {
        let state = self.inner.state.lock();
        let (_, session) = state.current_session()?;
        session.stream.as_ref().map(|s| s.item.clone())
    }

    /// Position of the current stream in ticks.
    pub fn current_time(&self) -> Option<i64> {
        let state = self.inner.state.lock();
        let (renderer, session) = state.current_session()?;
        session.position_ticks(renderer.renderer.as_ref())
    }

    /// Length of the current item in ticks: the source's runtime, the
    /// item's, or what the renderer reports.
    pub fn duration(&self) -> Option<i64> {
        let state = self.inner.state.lock();
        let (renderer, session) = state.current_session()?;
        let stream = session.stream.as_ref()?;

        stream
            .media_source
            .as_ref()
            .and_then(|s| s.run_time_ticks)
            .or(stream.item.run_time_ticks)
            .or_else(|| renderer.renderer.duration().map(ticks_from_duration))
    }

    pub fn phase(&self) -> PlaybackPhase {
        let state = self.inner.state.lock();
        state
            .current_session()
            .map(|(_, session)| session.phase)
            .unwrap_or_default()
    }
}

async fn forward_play_request(
    renderer: &RegisteredRenderer,
    resolved: ResolvedItems,
    options: &PlayOptions,
) -> Result<()> {
    let request = PlayRequest {
        items: resolved.items,
        start_index: resolved.start_index.unwrap_or(0),
        start_position_ticks: options.start_position_ticks,
        media_source_id: options.media_source_id.clone(),
        audio_stream_index: options.audio_stream_index,
        subtitle_stream_index: options.subtitle_stream_index,
        shuffle: options.shuffle,
        fullscreen: options.fullscreen,
    };

    debug!(renderer = %renderer.id(), count = request.items.len(), "Forwarding play request");
    renderer
        .renderer
        .play_request(request)
        .await
        .map_err(renderer_error)
}

fn renderer_error(err: BridgeError) -> PlaybackError {
    PlaybackError::Renderer(err.to_string())
}
