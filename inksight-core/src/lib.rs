//! Hybrid access, change-detection, and incremental-sync core for InkSight.
//!
//! Components are layered leaves-first: the Device and Cloud Channels (A, B)
//! and the Reachability Prober (C) have no dependencies on the rest of the
//! crate; the File Monitor (D) depends on the Device Channel; the Hybrid
//! Router (E) depends on A, B, and C; the Sync Engine (F) depends on E and
//! the Conflict Resolver (G); the Transform Coordinator (H) depends on F.

pub mod cloud_channel;
pub mod conflict;
pub mod device_channel;
pub mod error;
pub mod model;
pub mod monitor;
pub mod prober;
pub mod router;
pub mod selector;
pub mod source;
pub mod sync_engine;
pub mod transform;

pub use error::{CoreError, Result};
