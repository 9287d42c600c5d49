//! Catalog and streaming collaborator.
//!
//! The catalog client owns every network call the playback core needs:
//! item lookups, playback info negotiation, live stream management and the
//! coordinates of the active server endpoint. How requests travel over the
//! wire is up to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::media::{DeviceProfile, ItemKind, MediaProtocol, MediaSource, MediaType, PlayableItem};

/// Error code the catalog returns when no source fits the device profile.
pub const NO_COMPATIBLE_STREAM: &str = "NoCompatibleStream";

/// Item query used to expand folders, playlists, artists and genres.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuery {
    pub ids: Vec<String>,
    pub parent_id: Option<String>,
    pub artist_ids: Vec<String>,
    pub genre_ids: Vec<String>,
    pub studio_ids: Vec<String>,
    pub include_item_kinds: Vec<ItemKind>,
    pub media_types: Vec<MediaType>,
    pub recursive: bool,
    pub exclude_folders: bool,
    pub unplayed_only: bool,
    /// Sort fields in priority order. Ignored when `random` is set.
    pub sort_by: Vec<String>,
    pub random: bool,
    pub limit: Option<u32>,
}

/// Episode listing for a series or one of its seasons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeQuery {
    pub series_id: String,
    pub season_id: Option<String>,
    pub start_item_id: Option<String>,
    pub limit: Option<u32>,
    pub random: bool,
}

/// Parameters of a playback info negotiation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackInfoRequest {
    pub item_id: String,
    pub device_profile: DeviceProfile,
    pub media_source_id: Option<String>,
    pub live_stream_id: Option<String>,
    pub start_time_ticks: Option<i64>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub secondary_subtitle_stream_index: Option<i32>,
    pub max_streaming_bitrate: Option<u64>,
    pub enable_direct_play: Option<bool>,
    pub enable_direct_stream: Option<bool>,
    pub allow_video_stream_copy: Option<bool>,
    pub allow_audio_stream_copy: Option<bool>,
    /// `Some(false)` asks the catalog not to probe the media.
    pub enable_media_probe: Option<bool>,
    pub direct_play_protocols: Option<Vec<MediaProtocol>>,
    pub is_playback: bool,
    pub auto_open_live_stream: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackInfoResponse {
    pub media_sources: Vec<MediaSource>,
    pub play_session_id: Option<String>,
    /// Present when the server refused the request.
    pub error_code: Option<String>,
}

/// Request to open a live-stream style source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStreamRequest {
    pub item_id: String,
    pub open_token: Option<String>,
    pub play_session_id: Option<String>,
    pub device_profile: DeviceProfile,
    pub start_time_ticks: Option<i64>,
    pub max_streaming_bitrate: Option<u64>,
    pub enable_direct_play: Option<bool>,
    pub enable_direct_stream: Option<bool>,
    pub allow_video_stream_copy: Option<bool>,
    pub allow_audio_stream_copy: Option<bool>,
}

/// Where the client sits relative to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub is_in_network: bool,
    pub is_local: bool,
}

/// Coordinates used to build stream and subtitle URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Base address, e.g. `https://media.example.org/`.
    pub base_url: String,
    pub device_id: String,
    pub access_token: Option<String>,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Address, device id and token of the active connection.
    fn server_endpoint(&self) -> ServerEndpoint;

    async fn get_item(&self, item_id: &str) -> Result<PlayableItem>;

    async fn resolve_items(&self, query: ItemQuery) -> Result<Vec<PlayableItem>>;

    async fn get_episodes(&self, query: EpisodeQuery) -> Result<Vec<PlayableItem>>;

    async fn get_playback_info(&self, request: PlaybackInfoRequest)
        -> Result<PlaybackInfoResponse>;

    async fn get_endpoint_info(&self) -> Result<EndpointInfo>;

    /// Open a source flagged `requires_opening`. Returns the opened source,
    /// which carries a live stream id.
    async fn open_live_stream(&self, _request: LiveStreamRequest) -> Result<MediaSource> {
        Err(BridgeError::Unsupported("open_live_stream".to_string()))
    }

    /// Fresh stream metadata for an open live stream.
    async fn get_live_stream_media_info(&self, _live_stream_id: &str) -> Result<MediaSource> {
        Err(BridgeError::Unsupported("get_live_stream_media_info".to_string()))
    }

    /// Remaining parts of a multi-part movie or episode.
    async fn get_additional_parts(&self, _item_id: &str) -> Result<Vec<PlayableItem>> {
        Ok(Vec::new())
    }

    /// Trailers or pre-rolls played before a video.
    async fn get_intros(&self, _item_id: &str) -> Result<Vec<PlayableItem>> {
        Ok(Vec::new())
    }

    /// Measured bandwidth to the server in bits per second.
    async fn detect_bitrate(&self) -> Result<u64> {
        Err(BridgeError::Unsupported("detect_bitrate".to_string()))
    }

    /// Ask the server to kill transcodes belonging to a play session.
    async fn stop_active_encodings(&self, _play_session_id: &str) -> Result<()> {
        Ok(())
    }
}
