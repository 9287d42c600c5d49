//! # Collaborator Traits
//!
//! Contracts between the playback core and the components it orchestrates
//! but does not own.
//!
//! ## Overview
//!
//! The playback core is a pure in-memory orchestrator. Everything that
//! touches the network, the screen or the speakers is injected through the
//! traits defined here, and hosts provide implementations that fit their
//! platform.
//!
//! ## Traits
//!
//! ### Catalog & Telemetry
//! - [`CatalogClient`](catalog::CatalogClient) - Item lookups, playback info negotiation, live streams
//! - [`ReportingClient`](reporting::ReportingClient) - Start/progress/stop reporting
//!
//! ### Output
//! - [`Renderer`](renderer::Renderer) - Local or remote player with declared capabilities
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Fail-Fast Strategy
//!
//! The core refuses to start when a required collaborator is missing:
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .catalog_client(catalog)
//!     .build()?; // Err(CapabilityMissing { capability: "ReportingClient", .. })
//! ```
//!
//! ## Error Handling
//!
//! All traits use [`BridgeError`](error::BridgeError). Implementations
//! should map their own failures onto it with actionable messages, and
//! return [`BridgeError::Unsupported`] for optional operations they do not
//! implement.
//!
//! ## Thread Safety
//!
//! Every trait requires `Send + Sync` so implementations can be shared
//! behind `Arc` across tokio tasks.

pub mod catalog;
pub mod error;
pub mod media;
pub mod playback;
pub mod renderer;
pub mod reporting;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use catalog::{
    CatalogClient, EndpointInfo, EpisodeQuery, ItemQuery, LiveStreamRequest, PlaybackInfoRequest,
    PlaybackInfoResponse, ServerEndpoint, NO_COMPATIBLE_STREAM,
};
pub use media::{
    Chapter, DeviceProfile, DirectPlayProfile, ItemKind, LocationType, MediaProtocol, MediaSource,
    MediaStream, MediaType, PlayableItem, StreamKind, SubtitleDeliveryMethod,
    TranscodingSubProtocol, UserItemData, VideoType,
};
pub use playback::{
    ItemPlayOptions, PlayMethod, PlayRequest, QueueEntry, RepeatMode, ShuffleMode,
    StreamDescriptor, TextTrack,
};
pub use renderer::{
    Renderer, RendererCapabilities, RendererDescriptor, RendererErrorKind, RendererEvent,
};
pub use reporting::{
    NextItemInfo, PlaybackReport, PlaybackStopReport, ProgressEvent, QueueItemRef,
    ReportingClient,
};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
