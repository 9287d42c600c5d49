//! # Event Bus System
//!
//! Lifecycle events published by the playback core through
//! `tokio::sync::broadcast`. View layers subscribe to these instead of
//! polling the controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    emit     ┌───────────┐   subscribe   ┌────────────┐
//! │ PlaybackManager  ├────────────>│           ├──────────────>│ Now playing│
//! └──────────────────┘             │ EventBus  │               └────────────┘
//! ┌──────────────────┐    emit     │ (broadcast│   subscribe   ┌────────────┐
//! │ ProgressReporter ├────────────>│  channel) ├──────────────>│ Queue view │
//! └──────────────────┘             └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, PlaybackEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(64);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Playback(PlaybackEvent::ReportPlayback { success: true }))
//!     .ok();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.name(), "reportplayback");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep reading.
//! - **`RecvError::Closed`**: the bus was dropped; the core is shutting down.
//!
//! Emitting with no subscribers is not an error for the core; callers
//! ignore the `SendError`.

use bridge_traits::{MediaType, PlayMethod, RepeatMode, ShuffleMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Playback(PlaybackEvent),
    Queue(QueueEvent),
}

impl CoreEvent {
    /// Wire name used by view layers (`playbackstart`, `playlistitemadd`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::Playback(e) => e.name(),
            CoreEvent::Queue(e) => e.name(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Playback(PlaybackEvent::PlaybackError { .. }) => EventSeverity::Error,
            CoreEvent::Playback(PlaybackEvent::ReportPlayback { success: false }) => {
                EventSeverity::Warning
            }
            CoreEvent::Playback(PlaybackEvent::PlaybackStart { .. })
            | CoreEvent::Playback(PlaybackEvent::PlaybackStop { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Playback Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    /// A stream started on a renderer.
    PlaybackStart {
        renderer_id: String,
        item_id: Option<String>,
        play_method: Option<PlayMethod>,
        play_session_id: Option<String>,
        is_first_item: bool,
        fullscreen: bool,
    },
    /// A play-through ended, by request, naturally, or because something
    /// else replaced it.
    PlaybackStop {
        renderer_id: String,
        item_id: Option<String>,
        position_ticks: Option<i64>,
        next_item_id: Option<String>,
        next_media_type: Option<MediaType>,
    },
    /// Terminal failure. `error_key` is the localization key to display.
    PlaybackError {
        renderer_id: Option<String>,
        error_key: String,
    },
    /// A play request was abandoned before anything started.
    PlaybackCancelled {
        item_id: Option<String>,
        error_key: String,
    },
    /// The active renderer changed.
    PlayerChange {
        previous: Option<String>,
        current: Option<String>,
    },
    /// Outcome of one report to the reporting collaborator.
    ReportPlayback { success: bool },
    /// Stream metadata of the active source changed (live stream refresh).
    MediaStreamsChange { renderer_id: String },
    /// Live media info was re-polled for an open live stream.
    LiveStreamRefreshed {
        renderer_id: String,
        live_stream_id: String,
    },
    StateChange {
        renderer_id: String,
        change: StateChange,
    },
    AudioTrackChange {
        renderer_id: String,
        index: i32,
    },
    SubtitleTrackChange {
        renderer_id: String,
        index: i32,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StateChange {
    Paused,
    Unpaused,
    Seeked { position_ticks: i64 },
}

impl StateChange {
    fn name(&self) -> &'static str {
        match self {
            StateChange::Paused => "pause",
            StateChange::Unpaused => "unpause",
            StateChange::Seeked { .. } => "seek",
        }
    }
}

impl PlaybackEvent {
    fn name(&self) -> &'static str {
        match self {
            PlaybackEvent::PlaybackStart { .. } => "playbackstart",
            PlaybackEvent::PlaybackStop { .. } => "playbackstop",
            PlaybackEvent::PlaybackError { .. } => "playbackerror",
            PlaybackEvent::PlaybackCancelled { .. } => "playbackcancelled",
            PlaybackEvent::PlayerChange { .. } => "playerchange",
            PlaybackEvent::ReportPlayback { .. } => "reportplayback",
            PlaybackEvent::MediaStreamsChange { .. } => "mediastreamschange",
            PlaybackEvent::LiveStreamRefreshed { .. } => "livestreamrefreshed",
            PlaybackEvent::StateChange { change, .. } => change.name(),
            PlaybackEvent::AudioTrackChange { .. } => "audiotrackchange",
            PlaybackEvent::SubtitleTrackChange { .. } => "subtitletrackchange",
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    PlaylistItemAdd { slot_ids: Vec<String> },
    PlaylistItemRemove { slot_ids: Vec<String> },
    PlaylistItemMove { slot_id: String, new_index: usize },
    RepeatModeChange { mode: RepeatMode },
    ShuffleModeChange { mode: ShuffleMode },
    QueueCleared,
}

impl QueueEvent {
    fn name(&self) -> &'static str {
        match self {
            QueueEvent::PlaylistItemAdd { .. } => "playlistitemadd",
            QueueEvent::PlaylistItemRemove { .. } => "playlistitemremove",
            QueueEvent::PlaylistItemMove { .. } => "playlistitemmove",
            QueueEvent::RepeatModeChange { .. } => "repeatmodechange",
            QueueEvent::ShuffleModeChange { .. } => "shufflequeuemodechange",
            QueueEvent::QueueCleared => "queuecleared",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast channel shared by everything that publishes lifecycle events.
///
/// Cloning the bus clones the sender; every `subscribe()` creates an
/// independent receiver that only sees events emitted after it subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of receivers, or an error when nobody listens.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn emit_playback(&self, event: PlaybackEvent) {
        let _ = self.emit(CoreEvent::Playback(event));
    }

    pub fn emit_queue(&self, event: QueueEvent) {
        let _ = self.emit(CoreEvent::Queue(event));
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver with an optional predicate.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::new(16);
/// let queue_only = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Queue(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Only events whose wire name matches one of `names`.
    pub fn named(self, names: &'static [&'static str]) -> Self {
        self.filter(move |event| names.contains(&event.name()))
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map(|f| f(event)).unwrap_or(true)
    }

    /// Waits for the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Returns `None` when no matching event is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }

    /// Drains every buffered event that passes the filter.
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Some(Ok(event)) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stop_event(next: Option<&str>) -> CoreEvent {
        CoreEvent::Playback(PlaybackEvent::PlaybackStop {
            renderer_id: "local-video".to_string(),
            item_id: Some("movie-1".to_string()),
            position_ticks: Some(12_000_000),
            next_item_id: next.map(str::to_string),
            next_media_type: next.map(|_| MediaType::Video),
        })
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_an_error() {
        let bus = EventBus::new(8);
        assert!(bus.emit(stop_event(None)).is_err());
        // The convenience emitters swallow it.
        bus.emit_queue(QueueEvent::QueueCleared);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(stop_event(Some("movie-2"))).unwrap();

        assert_eq!(first.recv().await.unwrap(), stop_event(Some("movie-2")));
        assert_eq!(second.recv().await.unwrap(), stop_event(Some("movie-2")));
    }

    #[tokio::test]
    async fn test_stream_filter_by_name() {
        let bus = EventBus::new(8);
        let mut stream = EventStream::new(bus.subscribe()).named(&["playlistitemremove"]);

        bus.emit_queue(QueueEvent::PlaylistItemAdd {
            slot_ids: vec!["playlistItem0".to_string()],
        });
        bus.emit_queue(QueueEvent::PlaylistItemRemove {
            slot_ids: vec!["playlistItem0".to_string()],
        });

        let event = stream.recv().await.unwrap();
        assert_eq!(event.name(), "playlistitemremove");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for _ in 0..4 {
            bus.emit_playback(PlaybackEvent::ReportPlayback { success: true });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_severity() {
        let error = CoreEvent::Playback(PlaybackEvent::PlaybackError {
            renderer_id: None,
            error_key: "PlaybackErrorNoCompatibleStream".to_string(),
        });
        assert_eq!(error.severity(), EventSeverity::Error);
        assert_eq!(
            CoreEvent::Playback(PlaybackEvent::ReportPlayback { success: false }).severity(),
            EventSeverity::Warning
        );
        assert_eq!(stop_event(None).severity(), EventSeverity::Info);
    }

    #[test]
    fn test_serde_shape() {
        let event = CoreEvent::Queue(QueueEvent::PlaylistItemMove {
            slot_id: "playlistItem3".to_string(),
            new_index: 0,
        });
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "Queue");
        assert_eq!(json["payload"]["event"], "PlaylistItemMove");
        assert_eq!(json["payload"]["slot_id"], "playlistItem3");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
