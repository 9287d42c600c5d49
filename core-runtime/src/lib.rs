//! # Core Runtime Module
//!
//! Ambient infrastructure shared by the playback crates:
//! - Logging and tracing bootstrap with secret redaction
//! - Configuration builder with fail-fast collaborator checks
//! - Event bus for playback and queue lifecycle events
//!
//! ## Overview
//!
//! Nothing in here knows how a stream is negotiated. The playback crate
//! publishes onto the [`events::EventBus`], reads its tuning from
//! [`config::PlaybackSettings`] and logs through `tracing`; hosts install a
//! subscriber with [`logging::init_logging`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder, PlaybackSettings};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventStream, PlaybackEvent, QueueEvent};
