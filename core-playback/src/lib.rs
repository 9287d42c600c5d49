//! # Playback Orchestration
//!
//! Client-side control plane for media playback against a catalog server.
//!
//! ## Overview
//!
//! This crate handles:
//! - The play queue with repeat and shuffle modes ([`queue`])
//! - Renderer registration and selection ([`registry`])
//! - Source negotiation: direct play, direct stream or transcode ([`negotiator`])
//! - Track continuity between queue items ([`tracks`])
//! - Expansion of play requests into playable items ([`resolver`])
//! - The session controller state machine ([`manager`])
//! - Best-effort progress reporting ([`reporter`])
//!
//! Renderers, the catalog and the reporting endpoint are collaborators
//! defined in `bridge-traits`; nothing here touches a network or a decoder.
//!
//! ## Usage
//!
//! ```ignore
//! use core_playback::{PlaybackManager, PlayOptions};
//!
//! let manager = PlaybackManager::new(&config, events);
//! manager.register_renderer(Arc::new(MyVideoRenderer::new()));
//! manager.play(PlayOptions::ids(["episode-1"])).await?;
//! ```

pub mod error;
pub mod manager;
pub mod negotiator;
pub mod queue;
pub mod registry;
pub mod reporter;
pub mod resolver;
pub mod session;
pub mod ticks;
pub mod tracks;

pub use error::{PlaybackError, Result};
pub use manager::PlaybackManager;
pub use negotiator::{NegotiationRequest, SelectedSource, SourceNegotiator};
pub use queue::PlayQueue;
pub use registry::{RegisteredRenderer, RendererRegistry};
pub use reporter::{ProgressReporter, ProgressTimer};
pub use resolver::{ItemResolver, PlayOptions, ResolvedItems};
pub use session::{PlayState, PlaybackPhase, PlayerState, RendererSession};
pub use tracks::{auto_set_next_tracks, PreviousTracks, TrackSelection, NO_STREAM};
