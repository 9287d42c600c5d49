//! Core service façade and bootstrap helpers.
//!
//! Hosts build a [`CoreConfig`] with their catalog and reporting clients,
//! hand it to [`bootstrap`], register their renderers and drive playback
//! through [`CoreService::playback`]. Lifecycle events are available from
//! [`CoreService::subscribe`].

pub mod error;

pub use error::{CoreError, Result};

use bridge_traits::{Renderer, RendererDescriptor};
use core_playback::PlaybackManager;
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use core_runtime::logging::init_logging;
use std::sync::Arc;
use tracing::info;

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    playback: PlaybackManager,
}

impl CoreService {
    /// Create a service from a validated configuration. Logging is left to
    /// the caller; use [`bootstrap`] to install it as well.
    pub fn new(config: CoreConfig) -> Self {
        let events = EventBus::new(config.event_buffer_size);
        let playback = PlaybackManager::new(&config, events);
        Self {
            config: Arc::new(config),
            playback,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The session controller.
    pub fn playback(&self) -> &PlaybackManager {
        &self.playback
    }

    pub fn register_renderer(&self, renderer: Arc<dyn Renderer>) -> RendererDescriptor {
        self.playback.register_renderer(renderer)
    }

    /// New subscription to playback and queue events.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.playback.subscribe())
    }
}

/// Install logging when the configuration asks for it and build the
/// service.
///
/// ```ignore
/// let config = CoreConfig::builder()
///     .catalog_client(catalog)
///     .reporting_client(reporting)
///     .logging(LoggingConfig::default())
///     .build()?;
/// let core = core_service::bootstrap(config)?;
/// core.register_renderer(Arc::new(VideoElementRenderer::new()));
/// ```
pub fn bootstrap(config: CoreConfig) -> Result<CoreService> {
    if let Some(logging) = config.logging.clone() {
        init_logging(logging)?;
    }

    let service = CoreService::new(config);
    info!(
        event_buffer_size = service.config.event_buffer_size,
        progress_interval_ms = service.config.playback.progress_interval.as_millis() as u64,
        "Core service initialised"
    );
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{
        CatalogClient, DeviceProfile, EndpointInfo, EpisodeQuery, ItemQuery, MediaType,
        PlayableItem, PlaybackInfoRequest, PlaybackInfoResponse, PlaybackReport,
        PlaybackStopReport, ProgressEvent, ReportingClient, ServerEndpoint, StreamDescriptor,
    };
    use core_playback::PlaybackError;
    use core_runtime::events::{CoreEvent, PlaybackEvent};
    use mockall::mock;
    use std::time::Duration;

    mock! {
        Catalog {}

        #[async_trait]
        impl CatalogClient for Catalog {
            fn server_endpoint(&self) -> ServerEndpoint;
            async fn get_item(&self, item_id: &str) -> BridgeResult<PlayableItem>;
            async fn resolve_items(&self, query: ItemQuery) -> BridgeResult<Vec<PlayableItem>>;
            async fn get_episodes(&self, query: EpisodeQuery) -> BridgeResult<Vec<PlayableItem>>;
            async fn get_playback_info(&self, request: PlaybackInfoRequest) -> BridgeResult<PlaybackInfoResponse>;
            async fn get_endpoint_info(&self) -> BridgeResult<EndpointInfo>;
        }
    }

    mock! {
        Reporting {}

        #[async_trait]
        impl ReportingClient for Reporting {
            async fn report_start(&self, report: PlaybackReport) -> BridgeResult<()>;
            async fn report_progress(&self, report: PlaybackReport, event: ProgressEvent) -> BridgeResult<()>;
            async fn report_stop(&self, report: PlaybackStopReport) -> BridgeResult<()>;
        }
    }

    mock! {
        Output {}

        #[async_trait]
        impl Renderer for Output {
            fn descriptor(&self) -> RendererDescriptor;
            async fn get_device_profile(&self, item: &PlayableItem, is_retry: bool) -> BridgeResult<DeviceProfile>;
            async fn play(&self, stream: StreamDescriptor) -> BridgeResult<()>;
            async fn pause(&self) -> BridgeResult<()>;
            async fn unpause(&self) -> BridgeResult<()>;
            async fn stop(&self, destroy: bool) -> BridgeResult<()>;
            async fn set_current_time(&self, position: Duration) -> BridgeResult<()>;
            fn current_time(&self) -> Option<Duration>;
            fn duration(&self) -> Option<Duration>;
            fn is_paused(&self) -> bool;
        }
    }

    fn config() -> CoreConfig {
        CoreConfig::builder()
            .catalog_client(Arc::new(MockCatalog::new()))
            .reporting_client(Arc::new(MockReporting::new()))
            .event_buffer_size(32)
            .build()
            .unwrap()
    }

    fn audio_renderer() -> MockOutput {
        let mut renderer = MockOutput::new();
        renderer
            .expect_descriptor()
            .returning(|| RendererDescriptor::new("audio", "Audio").with_media_types([MediaType::Audio]));
        renderer
    }

    #[tokio::test]
    async fn test_bootstrap_without_logging() {
        let service = bootstrap(config()).unwrap();

        assert_eq!(service.config().event_buffer_size, 32);
        assert!(service.playback().current_renderer().is_none());
        assert!(service.playback().renderers().is_empty());
    }

    #[tokio::test]
    async fn test_renderer_selection_is_published() {
        let service = CoreService::new(config());
        let mut events = service.subscribe();

        let descriptor = service.register_renderer(Arc::new(audio_renderer()));
        assert_eq!(descriptor.id, "audio");

        service.playback().set_active_renderer(Some("audio")).unwrap();

        assert_eq!(
            events.drain(),
            vec![CoreEvent::Playback(PlaybackEvent::PlayerChange {
                previous: None,
                current: Some("audio".to_string()),
            })]
        );
    }

    #[tokio::test]
    async fn test_clones_share_playback_state() {
        let service = CoreService::new(config());
        let clone = service.clone();

        clone.register_renderer(Arc::new(audio_renderer()));
        assert_eq!(service.playback().renderers().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_renderer_is_an_error() {
        let service = CoreService::new(config());

        let err: CoreError = service
            .playback()
            .set_active_renderer(Some("missing"))
            .unwrap_err()
            .into();

        assert!(matches!(err, CoreError::Playback(PlaybackError::PlayerNotFound)));
    }

    #[test]
    fn test_runtime_errors_convert() {
        let err: CoreError = core_runtime::Error::Config("progress interval is zero".to_string()).into();
        assert!(err.to_string().contains("progress interval is zero"));
    }
}
