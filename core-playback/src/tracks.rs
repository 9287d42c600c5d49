//! # Track Selection
//!
//! Carries audio and subtitle choices over from one queue item to the next
//! and answers the per-track capability questions asked when a track is
//! switched mid-stream.
//!
//! Continuity scoring compares every candidate stream of the new item with
//! the stream that was active on the previous one:
//!
//! | Match                                   | Score |
//! |-----------------------------------------|-------|
//! | same codec                              | +1    |
//! | same position among streams of its kind | +1    |
//! | same display title                      | +2    |
//! | same language (other than `und`)        | +2    |
//!
//! The best candidate wins only when it reaches [`CONTINUITY_THRESHOLD`];
//! otherwise the new source keeps its own default.

use bridge_traits::{
    DeviceProfile, MediaSource, MediaStream, MediaType, StreamKind, SubtitleDeliveryMethod,
};
use tracing::debug;

/// Minimum score a candidate needs to replace the source default.
pub const CONTINUITY_THRESHOLD: u32 = 3;

/// Index meaning "no stream selected".
pub const NO_STREAM: i32 = -1;

/// Track indices forced onto the next item. `None` keeps the source default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSelection {
    pub audio: Option<i32>,
    pub subtitle: Option<i32>,
    pub secondary_subtitle: Option<i32>,
}

impl TrackSelection {
    /// Whether the audio or primary subtitle index is forced.
    pub fn forces_stream(&self) -> bool {
        self.audio.is_some() || self.subtitle.is_some()
    }
}

/// What was playing before the queue advanced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviousTracks {
    pub media_streams: Vec<MediaStream>,
    pub audio: Option<i32>,
    pub subtitle: Option<i32>,
    pub secondary_subtitle: Option<i32>,
}

impl PreviousTracks {
    pub fn from_source(
        source: &MediaSource,
        audio: Option<i32>,
        subtitle: Option<i32>,
        secondary_subtitle: Option<i32>,
    ) -> Self {
        Self {
            media_streams: source.media_streams.clone(),
            audio,
            subtitle,
            secondary_subtitle,
        }
    }
}

/// Pick indices for `candidates` that continue the previous selection.
pub fn auto_set_next_tracks(
    previous: &PreviousTracks,
    candidates: &[MediaStream],
    remember_audio: bool,
    remember_subtitles: bool,
) -> TrackSelection {
    let mut selection = TrackSelection::default();

    if remember_audio {
        if let Some(index) = previous.audio {
            selection.audio =
                rank_stream_type(index, &previous.media_streams, candidates, StreamKind::Audio);
        }
    }

    if remember_subtitles {
        if let Some(index) = previous.subtitle {
            selection.subtitle =
                rank_stream_type(index, &previous.media_streams, candidates, StreamKind::Subtitle);
        }
        if let Some(index) = previous.secondary_subtitle {
            selection.secondary_subtitle =
                rank_stream_type(index, &previous.media_streams, candidates, StreamKind::Subtitle);
        }
    }

    selection
}

/// Best continuation of `previous_index` among `candidates` of `kind`.
///
/// Subtitles that were switched off stay off. `None` means the threshold
/// was not met and the source default applies.
pub fn rank_stream_type(
    previous_index: i32,
    previous_streams: &[MediaStream],
    candidates: &[MediaStream],
    kind: StreamKind,
) -> Option<i32> {
    if previous_index == NO_STREAM {
        return (kind == StreamKind::Subtitle).then_some(NO_STREAM);
    }

    let previous = previous_streams.iter().find(|s| s.index == previous_index)?;
    let previous_position = previous_streams
        .iter()
        .filter(|s| s.is_kind(kind))
        .take_while(|s| s.index != previous_index)
        .count();

    let mut best: Option<(i32, u32)> = None;
    for (position, candidate) in candidates.iter().filter(|s| s.is_kind(kind)).enumerate() {
        let score = continuity_score(previous, previous_position, candidate, position);
        debug!(?kind, index = candidate.index, score, "Scored stream");

        let best_score = best.map(|(_, score)| score).unwrap_or(0);
        if score > best_score && score >= CONTINUITY_THRESHOLD {
            best = Some((candidate.index, score));
        }
    }

    best.map(|(index, _)| index)
}

fn continuity_score(
    previous: &MediaStream,
    previous_position: usize,
    candidate: &MediaStream,
    position: usize,
) -> u32 {
    let mut score = 0;

    if previous.codec == candidate.codec {
        score += 1;
    }
    if previous_position == position {
        score += 1;
    }
    if previous.display_title.is_some() && previous.display_title == candidate.display_title {
        score += 2;
    }
    if let Some(language) = previous.language.as_deref() {
        if language != "und" && Some(language) == candidate.language.as_deref() {
            score += 2;
        }
    }

    score
}

/// Whether the renderer can switch to audio stream `index` of `source`
/// without a new transcode.
pub fn is_audio_stream_supported(
    source: &MediaSource,
    index: i32,
    profile: &DeviceProfile,
) -> bool {
    let Some(stream) = source.stream(StreamKind::Audio, index) else {
        return false;
    };

    let container = source
        .container
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let codec = stream
        .codec
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if codec.is_empty() {
        return false;
    }

    profile.direct_play_profiles.iter().any(|p| {
        p.kind == Some(MediaType::Video)
            && list_includes_any(&p.container, &container)
            && list_includes_any(p.audio_codec.as_deref().unwrap_or_default(), &codec)
    })
}

/// A track can take part in a primary/secondary subtitle pair when it is an
/// external sidecar that is not SSA/ASS.
pub fn track_has_secondary_subtitle_support(stream: &MediaStream) -> bool {
    let format = stream
        .codec
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();

    format != "ssa"
        && format != "ass"
        && stream.effective_delivery_method() == SubtitleDeliveryMethod::External
}

/// Fold a continued secondary subtitle into `source` and drop pairs the
/// renderer cannot show.
///
/// A secondary subtitle without a primary one is promoted to primary.
pub fn reconcile_secondary_subtitle(
    source: &mut MediaSource,
    secondary_override: Option<i32>,
    renderer_supports_secondary: bool,
) {
    if let Some(index) = secondary_override {
        source.default_secondary_subtitle_stream_index = Some(index);
    }

    let has_primary = source
        .default_subtitle_stream_index
        .map(|i| i >= 0)
        .unwrap_or(false);
    if !has_primary {
        if let Some(secondary) = source.default_secondary_subtitle_stream_index {
            source.default_subtitle_stream_index = Some(secondary);
        }
        source.default_secondary_subtitle_stream_index = Some(NO_STREAM);
    }

    let supported = |index: Option<i32>| {
        index
            .and_then(|i| source.stream(StreamKind::Subtitle, i))
            .map(track_has_secondary_subtitle_support)
            .unwrap_or(false)
    };

    if !renderer_supports_secondary
        || !supported(source.default_subtitle_stream_index)
        || !supported(source.default_secondary_subtitle_stream_index)
    {
        source.default_secondary_subtitle_stream_index = Some(NO_STREAM);
    }
}

/// Comma separated `list` contains one of the comma separated `values`.
/// An empty list accepts everything.
fn list_includes_any(list: &str, values: &str) -> bool {
    let list = list.to_ascii_lowercase();
    if list.trim().is_empty() {
        return true;
    }

    let entries: Vec<&str> = list.split(',').map(str::trim).collect();
    values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .any(|v| entries.contains(&v))
}
