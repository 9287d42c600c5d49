//! Renderer ("player") contract.
//!
//! A renderer turns a [`StreamDescriptor`] into audible or visible output.
//! Local renderers run in-process; remote renderers proxy commands over a
//! control channel and usually manage their own playlist. Optional
//! capabilities are declared once through [`RendererCapabilities`] and read
//! by the registry at registration time instead of being probed per call.
//!
//! Renderers report what happens to the stream (it started, ended, failed)
//! back to the playback manager through its `handle_renderer_event` entry
//! point using [`RendererEvent`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::media::{DeviceProfile, MediaProtocol, MediaType, PlayableItem};
use crate::playback::{
    ItemPlayOptions, PlayRequest, QueueEntry, RepeatMode, ShuffleMode, StreamDescriptor,
};

/// Optional capabilities a renderer declares up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendererCapabilities {
    /// The renderer keeps its own playlist; queue operations are forwarded.
    pub supports_own_playlist: bool,
    /// The renderer can seek inside whatever it is currently playing.
    pub supports_native_seek: bool,
    /// Audio tracks can be switched without a new stream.
    pub supports_audio_stream_switching: bool,
    pub supports_secondary_subtitles: bool,
    /// The renderer exposes a meaningful position; when false, stop
    /// reports fall back to the item runtime.
    pub supports_progress: bool,
    /// Audio items skip playback info and stream from the catalog's
    /// universal audio endpoint.
    pub supports_universal_audio: bool,
    /// Remuxed streams are playable. When false, every negotiation asks
    /// the catalog for direct play or a transcode only.
    pub supports_direct_stream: bool,
}

impl Default for RendererCapabilities {
    fn default() -> Self {
        Self {
            supports_own_playlist: false,
            supports_native_seek: true,
            supports_audio_stream_switching: false,
            supports_secondary_subtitles: false,
            supports_progress: true,
            supports_universal_audio: false,
            supports_direct_stream: true,
        }
    }
}

/// Capability record captured when a renderer registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendererDescriptor {
    pub id: String,
    pub name: String,
    pub media_types: Vec<MediaType>,
    /// Lower values win automatic selection.
    pub priority: i32,
    /// In-process renderers qualify for automatic selection.
    pub is_local: bool,
    pub capabilities: RendererCapabilities,
}

impl RendererDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            media_types: Vec::new(),
            priority: 0,
            is_local: true,
            capabilities: RendererCapabilities::default(),
        }
    }

    pub fn with_media_types(mut self, media_types: impl IntoIterator<Item = MediaType>) -> Self {
        self.media_types = media_types.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn remote(mut self) -> Self {
        self.is_local = false;
        self
    }

    pub fn with_capabilities(mut self, capabilities: RendererCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether the core's queue drives this renderer.
    pub fn uses_local_playlist(&self) -> bool {
        !self.capabilities.supports_own_playlist && self.is_local
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendererErrorKind {
    MediaDecodeError,
    MediaNotSupported,
    NetworkError,
    Other,
}

impl RendererErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RendererErrorKind::MediaDecodeError => "mediadecodeerror",
            RendererErrorKind::MediaNotSupported => "medianotsupported",
            RendererErrorKind::NetworkError => "network",
            RendererErrorKind::Other => "other",
        }
    }
}

/// Notifications a renderer sends about its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RendererEvent {
    TimeUpdate,
    Paused,
    Unpaused,
    VolumeChanged,
    Seeked,
    /// Reached the end of the stream on its own.
    Ended,
    /// Stopped by a command or externally.
    Stopped,
    Error { kind: RendererErrorKind },
}

#[async_trait]
pub trait Renderer: Send + Sync {
    fn descriptor(&self) -> RendererDescriptor;

    fn can_play_media_type(&self, media_type: MediaType) -> bool {
        self.descriptor().media_types.contains(&media_type)
    }

    /// Item-specific check for catalog items.
    fn can_play_item(&self, _item: &PlayableItem, _options: &ItemPlayOptions) -> bool {
        true
    }

    /// Scheme check for URL items.
    fn can_play_url(&self, _url: &str) -> bool {
        false
    }

    /// Capability profile for `item`. `is_retry` is set when negotiating
    /// the transcoding fallback after an error.
    async fn get_device_profile(&self, item: &PlayableItem, is_retry: bool)
        -> Result<DeviceProfile>;

    /// Whether the catalog may probe `item` while answering playback info.
    fn enable_media_probe(&self, _item: &PlayableItem) -> bool {
        true
    }

    /// Protocols the renderer fetches itself, when it narrows them down.
    fn direct_play_protocols(&self) -> Option<Vec<MediaProtocol>> {
        None
    }

    async fn play(&self, stream: StreamDescriptor) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn unpause(&self) -> Result<()>;

    /// Stop output. `destroy` releases the renderer's resources.
    async fn stop(&self, destroy: bool) -> Result<()>;

    async fn set_current_time(&self, position: Duration) -> Result<()>;

    /// Position in the renderer's own clock.
    fn current_time(&self) -> Option<Duration>;

    fn duration(&self) -> Option<Duration>;

    fn is_paused(&self) -> bool;

    /// Whether the current stream is seekable. Defaults to the declared
    /// native-seek capability.
    fn is_seekable(&self) -> bool {
        self.descriptor().capabilities.supports_native_seek
    }

    fn volume(&self) -> Option<u8> {
        None
    }

    fn is_muted(&self) -> bool {
        false
    }

    async fn set_audio_stream_index(&self, _index: i32) -> Result<()> {
        Err(BridgeError::Unsupported("set_audio_stream_index".to_string()))
    }

    /// Select a sidecar/embedded subtitle; `-1` hides subtitles.
    async fn set_subtitle_stream_index(&self, _index: i32) -> Result<()> {
        Ok(())
    }

    async fn set_secondary_subtitle_stream_index(&self, _index: i32) -> Result<()> {
        Err(BridgeError::Unsupported(
            "set_secondary_subtitle_stream_index".to_string(),
        ))
    }

    // Playlist operations for renderers declaring `supports_own_playlist`.

    async fn play_request(&self, _request: PlayRequest) -> Result<()> {
        Err(BridgeError::Unsupported("play_request".to_string()))
    }

    async fn queue(&self, _items: Vec<PlayableItem>, _next: bool) -> Result<()> {
        Err(BridgeError::Unsupported("queue".to_string()))
    }

    async fn next_track(&self) -> Result<()> {
        Err(BridgeError::Unsupported("next_track".to_string()))
    }

    async fn previous_track(&self) -> Result<()> {
        Err(BridgeError::Unsupported("previous_track".to_string()))
    }

    async fn get_playlist(&self) -> Result<Vec<QueueEntry>> {
        Err(BridgeError::Unsupported("get_playlist".to_string()))
    }

    async fn set_current_playlist_item(&self, _slot_id: &str) -> Result<()> {
        Err(BridgeError::Unsupported("set_current_playlist_item".to_string()))
    }

    async fn remove_from_playlist(&self, _slot_ids: &[String]) -> Result<()> {
        Err(BridgeError::Unsupported("remove_from_playlist".to_string()))
    }

    async fn move_playlist_item(&self, _slot_id: &str, _new_index: usize) -> Result<()> {
        Err(BridgeError::Unsupported("move_playlist_item".to_string()))
    }

    async fn set_repeat_mode(&self, _mode: RepeatMode) -> Result<()> {
        Err(BridgeError::Unsupported("set_repeat_mode".to_string()))
    }

    async fn set_shuffle_mode(&self, _mode: ShuffleMode) -> Result<()> {
        Err(BridgeError::Unsupported("set_shuffle_mode".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_playlist_management() {
        let local = RendererDescriptor::new("html-video", "Browser video");
        assert!(local.uses_local_playlist());

        let remote = RendererDescriptor::new("cast", "Living room").remote();
        assert!(!remote.uses_local_playlist());

        let self_managed = RendererDescriptor::new("jukebox", "Jukebox").with_capabilities(
            RendererCapabilities {
                supports_own_playlist: true,
                ..RendererCapabilities::default()
            },
        );
        assert!(!self_managed.uses_local_playlist());
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(RendererErrorKind::MediaDecodeError.as_str(), "mediadecodeerror");
        assert_eq!(RendererErrorKind::NetworkError.as_str(), "network");
    }
}
