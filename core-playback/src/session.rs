//! Per-renderer session state and the player state snapshot.
//!
//! A [`RendererSession`] lives as long as its renderer is registered. Each
//! negotiation cycle bumps its `generation`; asynchronous completions carry
//! the generation they were issued for and become no-ops once it moved on.

use crate::ticks::ticks_from_duration;
use bridge_traits::{
    MediaSource, PlayMethod, PlayableItem, QueueItemRef, Renderer, RepeatMode, ShuffleMode,
    StreamDescriptor,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a renderer is in the play-through lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackPhase {
    #[default]
    Idle,
    Resolving,
    Negotiating,
    Starting,
    Playing,
    ChangingStream,
    Stopped,
    Error,
}

impl PlaybackPhase {
    /// A negotiation cycle is running and has not reached the renderer.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PlaybackPhase::Negotiating | PlaybackPhase::Starting | PlaybackPhase::ChangingStream
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RendererSession {
    pub phase: PlaybackPhase,
    pub stream: Option<StreamDescriptor>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub secondary_subtitle_stream_index: Option<i32>,
    pub max_streaming_bitrate: Option<u64>,
    /// Set while a renegotiation replaces the stream; stop and error
    /// callbacks of the outgoing stream are ignored meanwhile.
    pub is_changing_stream: bool,
    pub started: bool,
    pub ended: bool,
    /// Auto-advance when the stream ends on its own.
    pub play_next_after_ended: bool,
    /// The transcoding fallback was already taken for this item.
    pub transcode_fallback_used: bool,
    pub playback_start_time_ticks: Option<i64>,
    pub last_live_stream_refresh: Option<DateTime<Utc>>,
    pub generation: u64,
}

impl RendererSession {
    /// Begin a new negotiation cycle and return its token.
    pub fn begin_attempt(&mut self, phase: PlaybackPhase) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.phase = phase;
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Reset everything tied to the item that was playing.
    pub fn reset_for_new_item(&mut self) {
        self.stream = None;
        self.started = false;
        self.ended = false;
        self.is_changing_stream = false;
        self.transcode_fallback_used = false;
        self.last_live_stream_refresh = None;
    }

    pub fn media_source(&self) -> Option<&MediaSource> {
        self.stream.as_ref().and_then(|s| s.media_source.as_ref())
    }

    pub fn is_transcoding(&self) -> bool {
        self.stream
            .as_ref()
            .map(|s| s.play_method == PlayMethod::Transcode)
            .unwrap_or(false)
    }

    /// Position on the server timeline: renderer clock plus the offset of a
    /// continuous transcode.
    pub fn position_ticks(&self, renderer: &dyn Renderer) -> Option<i64> {
        let offset = self
            .stream
            .as_ref()
            .map(|s| s.transcoding_offset_ticks)
            .unwrap_or(0);
        renderer
            .current_time()
            .map(|time| ticks_from_duration(time) + offset)
    }

    /// Seekability of the current stream.
    ///
    /// Segmented manifests always seek; otherwise the renderer decides,
    /// and a continuous transcode the renderer cannot seek in needs a new
    /// stream. Direct streams seek when their length is known.
    pub fn can_seek(&self, renderer: &dyn Renderer) -> bool {
        if self
            .stream
            .as_ref()
            .map(StreamDescriptor::is_segmented_manifest)
            .unwrap_or(false)
        {
            return true;
        }
        if renderer.is_seekable() {
            return true;
        }
        if self.is_transcoding() {
            return false;
        }
        renderer.duration().is_some()
    }
}

/// Position and track state of the active renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayState {
    pub position_ticks: Option<i64>,
    pub is_paused: bool,
    pub can_seek: bool,
    pub play_method: Option<PlayMethod>,
    pub play_session_id: Option<String>,
    pub live_stream_id: Option<String>,
    pub media_source_id: Option<String>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub secondary_subtitle_stream_index: Option<i32>,
    pub max_streaming_bitrate: Option<u64>,
    pub repeat_mode: RepeatMode,
    pub shuffle_mode: ShuffleMode,
    pub playlist_item_id: Option<String>,
    pub playback_start_time_ticks: Option<i64>,
    pub volume: Option<u8>,
    pub is_muted: bool,
}

/// Snapshot returned by `PlaybackManager::get_player_state` and used to
/// build every report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub renderer_id: Option<String>,
    pub phase: PlaybackPhase,
    pub item: Option<PlayableItem>,
    pub media_source: Option<MediaSource>,
    pub play_state: PlayState,
    pub now_playing_queue: Vec<QueueItemRef>,
}

impl PlayerState {
    pub fn item_id(&self) -> Option<&str> {
        self.item.as_ref().and_then(|i| i.id.as_deref())
    }

    /// Only catalog items are reported.
    pub fn is_reportable(&self) -> bool {
        self.item
            .as_ref()
            .map(PlayableItem::is_server_item)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result;
    use bridge_traits::{DeviceProfile, ItemKind, MediaType, RendererDescriptor};
    use std::time::Duration;

    struct ClockRenderer {
        time: Option<Duration>,
        seekable: bool,
        duration: Option<Duration>,
    }

    #[async_trait]
    impl Renderer for ClockRenderer {
        fn descriptor(&self) -> RendererDescriptor {
            RendererDescriptor::new("clock", "Clock")
        }

        async fn get_device_profile(&self, _: &PlayableItem, _: bool) -> Result<DeviceProfile> {
            Ok(DeviceProfile::default())
        }

        async fn play(&self, _stream: StreamDescriptor) -> Result<()> {
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            Ok(())
        }

        async fn unpause(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _destroy: bool) -> Result<()> {
            Ok(())
        }

        async fn set_current_time(&self, _position: Duration) -> Result<()> {
            Ok(())
        }

        fn current_time(&self) -> Option<Duration> {
            self.time
        }

        fn duration(&self) -> Option<Duration> {
            self.duration
        }

        fn is_paused(&self) -> bool {
            false
        }

        fn is_seekable(&self) -> bool {
            self.seekable
        }
    }

    fn stream(url: &str, play_method: PlayMethod, offset: i64) -> StreamDescriptor {
        let item = PlayableItem::new("movie", ItemKind::Movie, MediaType::Video);
        StreamDescriptor {
            url: url.to_string(),
            mime_type: None,
            play_method,
            media_type: MediaType::Video,
            item,
            media_source: None,
            transcoding_offset_ticks: offset,
            start_position_ticks: None,
            audio_stream_index: None,
            subtitle_stream_index: None,
            play_session_id: None,
            live_stream_id: None,
            text_tracks: Vec::new(),
            title: None,
            fullscreen: true,
        }
    }

    #[test]
    fn test_generation_supersedes() {
        let mut session = RendererSession::default();
        let first = session.begin_attempt(PlaybackPhase::Negotiating);
        let second = session.begin_attempt(PlaybackPhase::Negotiating);

        assert!(!session.is_current(first));
        assert!(session.is_current(second));
    }

    #[test]
    fn test_in_flight_phases() {
        assert!(PlaybackPhase::Negotiating.is_in_flight());
        assert!(PlaybackPhase::ChangingStream.is_in_flight());
        assert!(!PlaybackPhase::Playing.is_in_flight());
        assert!(!PlaybackPhase::Stopped.is_in_flight());
    }

    #[test]
    fn test_position_includes_transcoding_offset() {
        let renderer = ClockRenderer {
            time: Some(Duration::from_secs(5)),
            seekable: false,
            duration: None,
        };
        let session = RendererSession {
            stream: Some(stream("https://h/v.mkv", PlayMethod::Transcode, 600_000_000)),
            ..RendererSession::default()
        };

        assert_eq!(session.position_ticks(&renderer), Some(650_000_000));
    }

    #[test]
    fn test_can_seek() {
        let stuck = ClockRenderer {
            time: None,
            seekable: false,
            duration: Some(Duration::from_secs(60)),
        };

        let segmented = RendererSession {
            stream: Some(stream("https://h/master.m3u8", PlayMethod::Transcode, 0)),
            ..RendererSession::default()
        };
        assert!(segmented.can_seek(&stuck));

        let transcoding = RendererSession {
            stream: Some(stream("https://h/stream.mkv", PlayMethod::Transcode, 0)),
            ..RendererSession::default()
        };
        assert!(!transcoding.can_seek(&stuck));

        let direct = RendererSession {
            stream: Some(stream("https://h/file.mkv", PlayMethod::DirectPlay, 0)),
            ..RendererSession::default()
        };
        assert!(direct.can_seek(&stuck));
    }
}
