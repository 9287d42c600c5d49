//! Workspace entry crate.
//!
//! Host applications can depend on `playback-core-workspace` to pull in the
//! service façade and the playback orchestrator without wiring each crate
//! individually.

pub use core_playback as playback;
pub use core_service::{bootstrap, CoreError, CoreService, Result};
