//! Reporting collaborator.
//!
//! Receives playback telemetry (start, periodic progress, stop). Failures
//! are swallowed by the core: reporting never gates playback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::media::MediaType;
use crate::playback::{PlayMethod, RepeatMode, ShuffleMode};

/// Reason attached to a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressEvent {
    TimeUpdate,
    Pause,
    Unpause,
    VolumeChange,
    RepeatModeChange,
    ShuffleQueueModeChange,
    AudioTrackChange,
    SubtitleTrackChange,
    PlaybackRateChange,
}

impl ProgressEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressEvent::TimeUpdate => "timeupdate",
            ProgressEvent::Pause => "pause",
            ProgressEvent::Unpause => "unpause",
            ProgressEvent::VolumeChange => "volumechange",
            ProgressEvent::RepeatModeChange => "repeatmodechange",
            ProgressEvent::ShuffleQueueModeChange => "shufflequeuemodechange",
            ProgressEvent::AudioTrackChange => "audiotrackchange",
            ProgressEvent::SubtitleTrackChange => "subtitletrackchange",
            ProgressEvent::PlaybackRateChange => "playbackrateupdate",
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue slot as it appears in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItemRef {
    pub item_id: Option<String>,
    pub slot_id: String,
}

/// Snapshot of a play-through sent with every report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackReport {
    pub item_id: Option<String>,
    pub media_source_id: Option<String>,
    pub play_session_id: Option<String>,
    pub live_stream_id: Option<String>,
    pub position_ticks: Option<i64>,
    /// When the stream started, in ticks since the Unix epoch.
    pub playback_start_time_ticks: Option<i64>,
    pub is_paused: bool,
    pub is_muted: bool,
    pub volume_level: Option<u8>,
    pub can_seek: bool,
    pub play_method: Option<PlayMethod>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub secondary_subtitle_stream_index: Option<i32>,
    pub max_streaming_bitrate: Option<u64>,
    pub repeat_mode: RepeatMode,
    pub shuffle_mode: ShuffleMode,
    pub playlist_item_id: Option<String>,
    pub now_playing_queue: Vec<QueueItemRef>,
}

/// What follows a stopped item, if anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextItemInfo {
    pub item_id: Option<String>,
    pub media_type: MediaType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStopReport {
    pub report: PlaybackReport,
    pub next_item: Option<NextItemInfo>,
    /// Set when playback ended because of an error.
    pub failed: bool,
}

#[async_trait]
pub trait ReportingClient: Send + Sync {
    async fn report_start(&self, report: PlaybackReport) -> Result<()>;

    async fn report_progress(&self, report: PlaybackReport, event: ProgressEvent) -> Result<()>;

    async fn report_stop(&self, report: PlaybackStopReport) -> Result<()>;
}
