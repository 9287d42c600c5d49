//! Playback vocabulary shared by the core and renderer implementations.
//!
//! A [`StreamDescriptor`] is the negotiated, ready-to-play result of one
//! playback attempt. Renderers receive it through
//! [`Renderer::play`](crate::renderer::Renderer::play) and must treat it as
//! immutable; any change of track, position or bitrate that the renderer
//! cannot apply on its own produces a brand new descriptor.

use crate::media::{MediaSource, MediaType, PlayableItem};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the renderer receives the media bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayMethod {
    /// Original file, byte for byte.
    DirectPlay,
    /// Original codecs repackaged into another container.
    DirectStream,
    /// Re-encoded by the server.
    Transcode,
}

impl fmt::Display for PlayMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayMethod::DirectPlay => "DirectPlay",
            PlayMethod::DirectStream => "DirectStream",
            PlayMethod::Transcode => "Transcode",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    RepeatNone,
    RepeatAll,
    RepeatOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShuffleMode {
    #[default]
    Sorted,
    Shuffle,
}

/// Sidecar subtitle track the renderer loads next to the main stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextTrack {
    pub url: String,
    pub language: String,
    pub is_default: bool,
    pub index: i32,
    pub format: Option<String>,
}

/// Per-item options attached when an item is placed into the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPlayOptions {
    pub fullscreen: bool,
    pub start_position_ticks: Option<i64>,
    pub media_source_id: Option<String>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
}

impl Default for ItemPlayOptions {
    fn default() -> Self {
        Self {
            fullscreen: true,
            start_position_ticks: None,
            media_source_id: None,
            audio_stream_index: None,
            subtitle_stream_index: None,
        }
    }
}

/// One slot of a play queue.
///
/// `slot_id` is generated by the queue when the entry is inserted and is
/// distinct from the catalog id, so the same item may appear twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub slot_id: String,
    pub item: PlayableItem,
    pub play_options: Option<ItemPlayOptions>,
}

impl QueueEntry {
    /// Entry not yet placed in a queue; the queue assigns the slot id.
    pub fn new(item: PlayableItem) -> Self {
        Self {
            slot_id: String::new(),
            item,
            play_options: None,
        }
    }

    pub fn with_play_options(mut self, options: ItemPlayOptions) -> Self {
        self.play_options = Some(options);
        self
    }

    pub fn has_slot_id(&self) -> bool {
        !self.slot_id.is_empty()
    }
}

/// Play request forwarded to renderers that manage their own playlist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayRequest {
    pub items: Vec<PlayableItem>,
    pub start_index: usize,
    pub start_position_ticks: Option<i64>,
    pub media_source_id: Option<String>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub shuffle: bool,
    pub fullscreen: bool,
}

/// Ready-to-play result of one negotiation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub url: String,
    pub mime_type: Option<String>,
    pub play_method: PlayMethod,
    pub media_type: MediaType,
    pub item: PlayableItem,
    /// `None` for URL items that never went through negotiation.
    pub media_source: Option<MediaSource>,
    /// Server-side offset of a continuous transcode. The renderer's own
    /// clock starts at zero, so the real position is clock + offset.
    pub transcoding_offset_ticks: i64,
    pub start_position_ticks: Option<i64>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub play_session_id: Option<String>,
    pub live_stream_id: Option<String>,
    pub text_tracks: Vec<TextTrack>,
    pub title: Option<String>,
    pub fullscreen: bool,
}

impl StreamDescriptor {
    /// Whether the url is a segmented manifest the renderer can seek in.
    pub fn is_segmented_manifest(&self) -> bool {
        self.url.to_ascii_lowercase().contains(".m3u8")
    }
}
