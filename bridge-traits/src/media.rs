//! Catalog data model shared between the playback core and its collaborators.
//!
//! These types describe what a catalog reports about an item: the item
//! itself, the physical representations it can be streamed from, and the
//! individual audio/video/subtitle streams inside each representation.
//! The wire format used to fetch them is owned by the catalog client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Broad media category used for renderer selection and URL building.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Photo,
    Book,
    #[default]
    Unknown,
}

impl MediaType {
    /// Lower-case name, as used in mime types (`audio/mp4`).
    pub fn as_lowercase(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Photo => "photo",
            MediaType::Book => "book",
            MediaType::Unknown => "unknown",
        }
    }

    /// Whether the item is streamed through source negotiation.
    pub fn is_streamable(&self) -> bool {
        matches!(self, MediaType::Audio | MediaType::Video)
    }
}

/// Catalog entity kind. Drives how a play request root is expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ItemKind {
    Movie,
    Episode,
    Series,
    Season,
    Audio,
    AudioBook,
    MusicAlbum,
    MusicArtist,
    MusicGenre,
    MusicVideo,
    Genre,
    Studio,
    Playlist,
    PhotoAlbum,
    Photo,
    Folder,
    CollectionFolder,
    BoxSet,
    Program,
    TvChannel,
    Trailer,
    Book,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocationType {
    #[default]
    FileSystem,
    Remote,
    Virtual,
}

/// Per-user progress as reported by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserItemData {
    pub played: bool,
    pub playback_position_ticks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub start_position_ticks: i64,
    pub name: Option<String>,
}

/// A catalog entity the core can be asked to play.
///
/// Items without an `id` are treated as plain URL items: they bypass source
/// negotiation and are never reported to the reporting collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayableItem {
    pub id: Option<String>,
    pub server_id: Option<String>,
    pub name: Option<String>,
    pub kind: ItemKind,
    pub media_type: MediaType,
    pub is_folder: bool,
    pub collection_type: Option<String>,
    pub parent_id: Option<String>,
    pub series_id: Option<String>,
    pub season_id: Option<String>,
    pub channel_id: Option<String>,
    pub run_time_ticks: Option<i64>,
    /// Number of parts for multi-part movies and episodes.
    pub part_count: Option<u32>,
    pub location_type: LocationType,
    pub is_placeholder: bool,
    /// `InProgress` for recordings that are still being written.
    pub status: Option<String>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub user_data: Option<UserItemData>,
    pub chapters: Vec<Chapter>,
    /// Streams of the default media source, when the catalog includes them.
    pub media_streams: Vec<MediaStream>,
}

impl PlayableItem {
    pub fn new(id: impl Into<String>, kind: ItemKind, media_type: MediaType) -> Self {
        Self {
            id: Some(id.into()),
            kind,
            media_type,
            ..Default::default()
        }
    }

    /// Item that points at an arbitrary URL rather than a catalog entry.
    pub fn from_url(url: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            url: Some(url.into()),
            media_type,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_series(mut self, series_id: impl Into<String>) -> Self {
        self.series_id = Some(series_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_run_time_ticks(mut self, ticks: i64) -> Self {
        self.run_time_ticks = Some(ticks);
        self
    }

    pub fn with_user_data(mut self, played: bool, playback_position_ticks: i64) -> Self {
        self.user_data = Some(UserItemData {
            played,
            playback_position_ticks,
        });
        self
    }

    /// True when the item is backed by the catalog.
    pub fn is_server_item(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_played(&self) -> bool {
        self.user_data.as_ref().map(|d| d.played).unwrap_or(false)
    }

    /// URL used when the item is played without negotiation.
    pub fn direct_url(&self) -> Option<&str> {
        self.url.as_deref().or(self.path.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaProtocol {
    #[default]
    File,
    Http,
    Rtmp,
    Rtsp,
    Udp,
    Rtp,
    Ftp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoType {
    VideoFile,
    Iso,
    Dvd,
    BluRay,
    HdDvd,
}

impl VideoType {
    /// Disc structures copied to a folder. They are always offered for
    /// direct play even when the catalog does not flag them as such.
    pub fn is_folder_rip(&self) -> bool {
        matches!(self, VideoType::Dvd | VideoType::BluRay | VideoType::HdDvd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
    EmbeddedImage,
    Data,
    Lyric,
}

/// How a subtitle stream reaches the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtitleDeliveryMethod {
    /// Burned into the video by the transcoder.
    Encode,
    /// Muxed into the container the renderer receives.
    Embed,
    /// Fetched separately as a sidecar file.
    External,
    /// Delivered as a segmented-manifest rendition.
    Hls,
    Drop,
}

/// One elementary stream inside a media source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStream {
    pub index: i32,
    pub kind: Option<StreamKind>,
    pub codec: Option<String>,
    pub language: Option<String>,
    pub display_title: Option<String>,
    pub is_default: bool,
    pub is_external: bool,
    pub is_external_url: bool,
    pub delivery_method: Option<SubtitleDeliveryMethod>,
    pub delivery_url: Option<String>,
}

impl MediaStream {
    pub fn new(index: i32, kind: StreamKind) -> Self {
        Self {
            index,
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_display_title(mut self, title: impl Into<String>) -> Self {
        self.display_title = Some(title.into());
        self
    }

    pub fn with_delivery(mut self, method: SubtitleDeliveryMethod) -> Self {
        self.delivery_method = Some(method);
        self
    }

    pub fn with_delivery_url(mut self, url: impl Into<String>) -> Self {
        self.delivery_url = Some(url.into());
        self
    }

    pub fn external(mut self) -> Self {
        self.is_external = true;
        self
    }

    pub fn is_kind(&self, kind: StreamKind) -> bool {
        self.kind == Some(kind)
    }

    /// Effective delivery method. Streams without an explicit method are
    /// external when flagged as such and embedded otherwise.
    pub fn effective_delivery_method(&self) -> SubtitleDeliveryMethod {
        match self.delivery_method {
            Some(method) => method,
            None if self.is_external => SubtitleDeliveryMethod::External,
            None => SubtitleDeliveryMethod::Embed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodingSubProtocol {
    Http,
    Hls,
}

/// One streamable representation of an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSource {
    pub id: String,
    pub path: Option<String>,
    pub protocol: MediaProtocol,
    pub container: Option<String>,
    pub bitrate: Option<u64>,
    pub run_time_ticks: Option<i64>,
    pub etag: Option<String>,
    pub is_remote: bool,
    pub video_type: Option<VideoType>,
    pub supports_direct_play: bool,
    pub supports_direct_stream: bool,
    pub supports_transcoding: bool,
    pub requires_opening: bool,
    pub open_token: Option<String>,
    pub live_stream_id: Option<String>,
    pub required_http_headers: HashMap<String, String>,
    /// Already-resolved URL. Set for audio sources that skip URL building.
    pub stream_url: Option<String>,
    pub transcoding_url: Option<String>,
    pub transcoding_sub_protocol: Option<TranscodingSubProtocol>,
    pub transcoding_container: Option<String>,
    pub media_streams: Vec<MediaStream>,
    pub default_audio_stream_index: Option<i32>,
    pub default_subtitle_stream_index: Option<i32>,
    pub default_secondary_subtitle_stream_index: Option<i32>,
}

impl MediaSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &MediaStream> {
        self.media_streams.iter().filter(move |s| s.is_kind(kind))
    }

    pub fn stream(&self, kind: StreamKind, index: i32) -> Option<&MediaStream> {
        self.streams_of(kind).find(|s| s.index == index)
    }
}

/// Container/codec pair a renderer accepts without conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectPlayProfile {
    /// Comma separated container list; empty accepts any.
    pub container: String,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub kind: Option<MediaType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodingProfile {
    pub container: String,
    pub kind: Option<MediaType>,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub protocol: Option<TranscodingSubProtocol>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleProfile {
    pub format: String,
    pub method: SubtitleDeliveryMethod,
}

/// Declarative description of what a renderer can accept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: Option<String>,
    pub max_streaming_bitrate: Option<u64>,
    pub direct_play_profiles: Vec<DirectPlayProfile>,
    pub transcoding_profiles: Vec<TranscodingProfile>,
    pub subtitle_profiles: Vec<SubtitleProfile>,
}
