//! # Progress/Event Reporter
//!
//! Turns [`PlayerState`] snapshots into reports for the
//! [`ReportingClient`] and drives the periodic progress timer.
//!
//! Reporting is best-effort: failures are logged, a
//! `ReportPlayback { success: false }` event is published, and playback
//! carries on. Items that do not come from the catalog are never reported.

use crate::session::PlayerState;
use bridge_traits::{
    MediaType, NextItemInfo, PlaybackReport, PlaybackStopReport, PlayableItem, ProgressEvent,
    ReportingClient,
};
use core_runtime::events::{EventBus, PlaybackEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ProgressReporter {
    client: Arc<dyn ReportingClient>,
    events: EventBus,
}

impl ProgressReporter {
    pub fn new(client: Arc<dyn ReportingClient>, events: EventBus) -> Self {
        Self { client, events }
    }

    pub fn build_report(state: &PlayerState) -> PlaybackReport {
        let play_state = &state.play_state;
        PlaybackReport {
            item_id: state.item_id().map(str::to_string),
            media_source_id: play_state.media_source_id.clone(),
            play_session_id: play_state.play_session_id.clone(),
            live_stream_id: play_state.live_stream_id.clone(),
            position_ticks: play_state.position_ticks,
            playback_start_time_ticks: play_state.playback_start_time_ticks,
            is_paused: play_state.is_paused,
            is_muted: play_state.is_muted,
            volume_level: play_state.volume,
            can_seek: play_state.can_seek,
            play_method: play_state.play_method,
            audio_stream_index: play_state.audio_stream_index,
            subtitle_stream_index: play_state.subtitle_stream_index,
            secondary_subtitle_stream_index: play_state.secondary_subtitle_stream_index,
            max_streaming_bitrate: play_state.max_streaming_bitrate,
            repeat_mode: play_state.repeat_mode,
            shuffle_mode: play_state.shuffle_mode,
            playlist_item_id: play_state.playlist_item_id.clone(),
            now_playing_queue: state.now_playing_queue.clone(),
        }
    }

    /// Returns whether a report was sent and accepted.
    pub async fn report_start(&self, state: &PlayerState) -> bool {
        if !state.is_reportable() {
            return false;
        }

        let result = self.client.report_start(Self::build_report(state)).await;
        self.finish("start", state, result)
    }

    pub async fn report_progress(&self, state: &PlayerState, event: ProgressEvent) -> bool {
        if !state.is_reportable() {
            return false;
        }

        let result = self
            .client
            .report_progress(Self::build_report(state), event)
            .await;
        self.finish(event.as_str(), state, result)
    }

    pub async fn report_stop(
        &self,
        state: &PlayerState,
        next_item: Option<&PlayableItem>,
        failed: bool,
    ) -> bool {
        if !state.is_reportable() {
            return false;
        }

        let report = PlaybackStopReport {
            report: Self::build_report(state),
            next_item: next_item.map(|item| NextItemInfo {
                item_id: item.id.clone(),
                media_type: item.media_type,
            }),
            failed,
        };

        let result = self.client.report_stop(report).await;
        self.finish("stop", state, result)
    }

    fn finish(
        &self,
        kind: &'static str,
        state: &PlayerState,
        result: bridge_traits::error::Result<()>,
    ) -> bool {
        let success = match result {
            Ok(()) => {
                debug!(report = kind, item_id = ?state.item_id(), "Playback reported");
                true
            }
            Err(e) => {
                warn!(report = kind, item_id = ?state.item_id(), error = %e, "Playback report failed");
                false
            }
        };

        self.events
            .emit_playback(PlaybackEvent::ReportPlayback { success });
        success
    }
}

/// What a stop report says follows the stopped item.
pub fn next_media_type(next_item: Option<&PlayableItem>) -> Option<MediaType> {
    next_item.map(|item| item.media_type)
}

/// Periodic progress callback running on its own task.
///
/// The first tick fires one `interval` after start. The loop ends when the
/// callback returns `false`, on [`ProgressTimer::stop`], or when the timer
/// is dropped.
#[derive(Debug)]
pub struct ProgressTimer {
    cancel: CancellationToken,
}

impl ProgressTimer {
    pub fn start<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            debug!("Progress timer finished");
        });

        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
