//! # Core Configuration Module
//!
//! Builder-based configuration for the playback core.
//!
//! ## Overview
//!
//! `CoreConfig` carries the injected collaborators and the playback tuning
//! knobs. The builder fails fast: the core refuses to start without a
//! catalog client and a reporting client, and says which one is missing.
//!
//! ## Required Dependencies
//!
//! - `CatalogClient` - item resolution and playback info negotiation
//! - `ReportingClient` - start/progress/stop telemetry
//!
//! ## Optional Dependencies
//!
//! - `Clock` - defaults to [`SystemClock`]
//! - `LoggerSink` - forwards tracing events to host logging
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, PlaybackSettings};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .catalog_client(Arc::new(MyCatalog))
//!     .reporting_client(Arc::new(MyReporter))
//!     .playback(PlaybackSettings::default().with_cinema_mode(true))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use crate::logging::LoggingConfig;
use bridge_traits::{CatalogClient, Clock, LoggerSink, ReportingClient, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs for the playback manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Interval between `timeupdate` progress reports.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: Duration,

    /// How often media info of an open live stream is re-polled.
    #[serde(default = "default_live_stream_refresh_interval")]
    pub live_stream_refresh_interval: Duration,

    /// Bitrate ceiling in bits per second when detection is off or fails.
    #[serde(default = "default_max_streaming_bitrate")]
    pub max_streaming_bitrate: u64,

    #[serde(default = "default_true")]
    pub enable_bitrate_detection: bool,

    /// Delay inserted after bitrate detection before committing play.
    #[serde(default)]
    pub play_start_delay: Duration,

    /// Play catalog intros before the first video.
    #[serde(default)]
    pub enable_cinema_mode: bool,

    #[serde(default = "default_true")]
    pub enable_next_episode_auto_play: bool,

    #[serde(default = "default_true")]
    pub remember_audio_selections: bool,

    #[serde(default = "default_true")]
    pub remember_subtitle_selections: bool,

    /// Whether sources flagged remote may still direct play.
    #[serde(default = "default_true")]
    pub enable_remote_video_direct_play: bool,

    /// Upper bound on items fetched when expanding a folder-like root.
    #[serde(default = "default_item_limit")]
    pub item_limit: u32,

    #[serde(default = "default_fast_forward_step")]
    pub fast_forward_step: Duration,

    #[serde(default = "default_rewind_step")]
    pub rewind_step: Duration,

    /// Fixed seed for queue shuffling. `None` seeds from entropy.
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_live_stream_refresh_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_max_streaming_bitrate() -> u64 {
    140_000_000
}

fn default_true() -> bool {
    true
}

fn default_item_limit() -> u32 {
    300
}

fn default_fast_forward_step() -> Duration {
    Duration::from_secs(15)
}

fn default_rewind_step() -> Duration {
    Duration::from_secs(10)
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            progress_interval: default_progress_interval(),
            live_stream_refresh_interval: default_live_stream_refresh_interval(),
            max_streaming_bitrate: default_max_streaming_bitrate(),
            enable_bitrate_detection: true,
            play_start_delay: Duration::ZERO,
            enable_cinema_mode: false,
            enable_next_episode_auto_play: true,
            remember_audio_selections: true,
            remember_subtitle_selections: true,
            enable_remote_video_direct_play: true,
            item_limit: default_item_limit(),
            fast_forward_step: default_fast_forward_step(),
            rewind_step: default_rewind_step(),
            shuffle_seed: None,
        }
    }
}

impl PlaybackSettings {
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_max_streaming_bitrate(mut self, bitrate: u64) -> Self {
        self.max_streaming_bitrate = bitrate;
        self
    }

    pub fn with_bitrate_detection(mut self, enabled: bool) -> Self {
        self.enable_bitrate_detection = enabled;
        self
    }

    pub fn with_play_start_delay(mut self, delay: Duration) -> Self {
        self.play_start_delay = delay;
        self
    }

    pub fn with_cinema_mode(mut self, enabled: bool) -> Self {
        self.enable_cinema_mode = enabled;
        self
    }

    pub fn with_next_episode_auto_play(mut self, enabled: bool) -> Self {
        self.enable_next_episode_auto_play = enabled;
        self
    }

    pub fn with_remote_video_direct_play(mut self, enabled: bool) -> Self {
        self.enable_remote_video_direct_play = enabled;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.progress_interval.is_zero() {
            return Err(Error::Config(
                "Progress interval must be greater than zero".to_string(),
            ));
        }

        if self.live_stream_refresh_interval.is_zero() {
            return Err(Error::Config(
                "Live stream refresh interval must be greater than zero".to_string(),
            ));
        }

        if self.item_limit == 0 {
            return Err(Error::Config(
                "Item limit must be greater than 0".to_string(),
            ));
        }

        if self.max_streaming_bitrate == 0 {
            return Err(Error::Config(
                "Max streaming bitrate must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Core configuration for the playback core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    pub catalog_client: Arc<dyn CatalogClient>,
    pub reporting_client: Arc<dyn ReportingClient>,
    pub clock: Arc<dyn Clock>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    /// Logging is initialised by the service when present.
    pub logging: Option<LoggingConfig>,
    pub event_buffer_size: usize,
    pub playback: PlaybackSettings,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("catalog_client", &"CatalogClient { ... }")
            .field("reporting_client", &"ReportingClient { ... }")
            .field("clock", &"Clock { ... }")
            .field(
                "logger_sink",
                &self.logger_sink.as_ref().map(|_| "LoggerSink { ... }"),
            )
            .field("logging", &self.logging)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("playback", &self.playback)
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        self.playback.validate()
    }
}

fn catalog_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "CatalogClient".to_string(),
        message: "CatalogClient implementation is required to resolve items and negotiate \
                 playback info. Inject the host's server API client with .catalog_client()."
            .to_string(),
    }
}

fn reporting_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "ReportingClient".to_string(),
        message: "ReportingClient implementation is required for playback start/progress/stop \
                 reports. Inject one with .reporting_client(); a no-op implementation is \
                 acceptable when telemetry is not wanted."
            .to_string(),
    }
}

/// Builder for [`CoreConfig`].
#[derive(Default)]
pub struct CoreConfigBuilder {
    catalog_client: Option<Arc<dyn CatalogClient>>,
    reporting_client: Option<Arc<dyn ReportingClient>>,
    clock: Option<Arc<dyn Clock>>,
    logger_sink: Option<Arc<dyn LoggerSink>>,
    logging: Option<LoggingConfig>,
    event_buffer_size: Option<usize>,
    playback: Option<PlaybackSettings>,
}

impl CoreConfigBuilder {
    /// Sets the catalog client (required).
    pub fn catalog_client(mut self, client: Arc<dyn CatalogClient>) -> Self {
        self.catalog_client = Some(client);
        self
    }

    /// Sets the reporting client (required).
    pub fn reporting_client(mut self, client: Arc<dyn ReportingClient>) -> Self {
        self.reporting_client = Some(client);
        self
    }

    /// Overrides the time source. Tests inject a [`bridge_traits::ManualClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Default: 256 events per subscriber.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn playback(mut self, settings: PlaybackSettings) -> Self {
        self.playback = Some(settings);
        self
    }

    /// Builds the final `CoreConfig`.
    ///
    /// # Errors
    ///
    /// - `CapabilityMissing` when the catalog or reporting client is absent
    /// - `Config` when a setting is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let catalog_client = self
            .catalog_client
            .ok_or_else(catalog_client_missing_error)?;
        let reporting_client = self
            .reporting_client
            .ok_or_else(reporting_client_missing_error)?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        // A sink given directly also feeds the logging layer.
        let logging = match (self.logging, &self.logger_sink) {
            (Some(logging), Some(sink)) if logging.logger_sink.is_none() => {
                Some(logging.with_logger_sink(sink.clone()))
            }
            (logging, _) => logging,
        };

        let config = CoreConfig {
            catalog_client,
            reporting_client,
            clock,
            logger_sink: self.logger_sink,
            logging,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            playback: self.playback.unwrap_or_default(),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{
        EndpointInfo, EpisodeQuery, ItemQuery, PlayableItem, PlaybackInfoRequest,
        PlaybackInfoResponse, PlaybackReport, PlaybackStopReport, ProgressEvent, ServerEndpoint,
    };

    struct MockCatalog;

    #[async_trait]
    impl CatalogClient for MockCatalog {
        fn server_endpoint(&self) -> ServerEndpoint {
            ServerEndpoint {
                base_url: "http://media.local:8096".to_string(),
                device_id: "device".to_string(),
                access_token: Some("token".to_string()),
            }
        }

        async fn get_item(&self, item_id: &str) -> BridgeResult<PlayableItem> {
            Ok(PlayableItem::new(
                item_id,
                bridge_traits::ItemKind::Audio,
                bridge_traits::MediaType::Audio,
            ))
        }

        async fn resolve_items(&self, _query: ItemQuery) -> BridgeResult<Vec<PlayableItem>> {
            Ok(Vec::new())
        }

        async fn get_episodes(&self, _query: EpisodeQuery) -> BridgeResult<Vec<PlayableItem>> {
            Ok(Vec::new())
        }

        async fn get_playback_info(
            &self,
            _request: PlaybackInfoRequest,
        ) -> BridgeResult<PlaybackInfoResponse> {
            Ok(PlaybackInfoResponse::default())
        }

        async fn get_endpoint_info(&self) -> BridgeResult<EndpointInfo> {
            Ok(EndpointInfo::default())
        }
    }

    struct MockReporter;

    #[async_trait]
    impl ReportingClient for MockReporter {
        async fn report_start(&self, _report: PlaybackReport) -> BridgeResult<()> {
            Ok(())
        }

        async fn report_progress(
            &self,
            _report: PlaybackReport,
            _event: ProgressEvent,
        ) -> BridgeResult<()> {
            Ok(())
        }

        async fn report_stop(&self, _report: PlaybackStopReport) -> BridgeResult<()> {
            Ok(())
        }
    }

    fn complete_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .catalog_client(Arc::new(MockCatalog))
            .reporting_client(Arc::new(MockReporter))
    }

    #[test]
    fn test_builder_requires_catalog_client() {
        let result = CoreConfig::builder()
            .reporting_client(Arc::new(MockReporter))
            .build();

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("CatalogClient"));
        assert!(err_msg.contains(".catalog_client()"));
    }

    #[test]
    fn test_builder_requires_reporting_client() {
        let result = CoreConfig::builder()
            .catalog_client(Arc::new(MockCatalog))
            .build();

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            Error::CapabilityMissing { ref capability, .. } if capability == "ReportingClient"
        ));
    }

    #[test]
    fn test_builder_defaults() {
        let config = complete_builder().build().unwrap();

        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
        assert_eq!(config.playback, PlaybackSettings::default());
        assert!(config.logger_sink.is_none());
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_playback_settings_defaults() {
        let settings = PlaybackSettings::default();
        assert_eq!(settings.progress_interval, Duration::from_secs(10));
        assert_eq!(settings.live_stream_refresh_interval, Duration::from_secs(600));
        assert_eq!(settings.max_streaming_bitrate, 140_000_000);
        assert_eq!(settings.item_limit, 300);
        assert_eq!(settings.fast_forward_step, Duration::from_secs(15));
        assert_eq!(settings.rewind_step, Duration::from_secs(10));
        assert!(settings.enable_next_episode_auto_play);
        assert!(!settings.enable_cinema_mode);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let result = complete_builder()
            .playback(PlaybackSettings::default().with_progress_interval(Duration::ZERO))
            .build();
        assert!(result.unwrap_err().to_string().contains("Progress interval"));

        let result = complete_builder().event_buffer_size(0).build();
        assert!(result.unwrap_err().to_string().contains("Event buffer size"));

        let settings = PlaybackSettings {
            item_limit: 0,
            ..PlaybackSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_logger_sink_feeds_logging_config() {
        let sink: Arc<dyn LoggerSink> = Arc::new(bridge_traits::ConsoleLogger::default());
        let config = complete_builder()
            .logger_sink(sink)
            .logging(LoggingConfig::default())
            .build()
            .unwrap();

        let logging = config.logging.unwrap();
        assert!(logging.logger_sink.is_some());
    }

    #[test]
    fn test_settings_deserialize_with_missing_fields() {
        let settings: PlaybackSettings =
            serde_json::from_str(r#"{ "enable_cinema_mode": true, "shuffle_seed": 7 }"#).unwrap();

        assert!(settings.enable_cinema_mode);
        assert_eq!(settings.shuffle_seed, Some(7));
        assert_eq!(settings.item_limit, 300);
        assert!(settings.remember_audio_selections);
    }

    #[test]
    fn test_config_is_cloneable() {
        let config = complete_builder()
            .playback(PlaybackSettings::default().with_shuffle_seed(42))
            .build()
            .unwrap();

        let cloned = config.clone();
        assert_eq!(cloned.playback.shuffle_seed, Some(42));
        assert!(format!("{:?}", cloned).contains("CatalogClient { ... }"));
    }
}
