//! cirrus reconciliation controller.
//!
//! Converges stored entities toward their external reality. Handlers are
//! registered per [`EntityKind`](cirrus_store::EntityKind); work arrives
//! either from API writes through a [`Watcher`] or from the periodic
//! per-organization resync, and is processed by a fixed pool of workers.

pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
mod job;
mod locks;
pub mod sync;
pub mod watcher;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::ControllerError;
pub use handler::{Action, EntityHandler};
pub use sync::default_sync;
pub use watcher::Watcher;
