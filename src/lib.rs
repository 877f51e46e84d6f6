//! Offline-first data layer for rental-property bookkeeping.
//!
//! Reads go through a two-tier cache and fall back to the last stored
//! snapshot when the network is down. Writes made offline are applied
//! locally, queued, and replayed in order once connectivity returns.

pub mod admin;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod db;
pub mod error;
pub mod facade;
pub mod invalidation;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod resource;
pub mod sync;

pub use cache::{CacheResult, CacheSource};
pub use config::Config;
pub use context::{OfflineContext, Services};
pub use error::{OfflineError, Result};
pub use facade::OfflineResource;
pub use resource::{Operation, ResourceKind};
pub use sync::{SyncCoordinator, SyncResult};
