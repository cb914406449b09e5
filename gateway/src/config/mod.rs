//! Configuration management for the gateway: loading, validating, holding and watching the config file.
//!
//! Raw file types live in [`types`]; validated per-domain types in [`domain`]
//! and [`schedule`]. The active snapshot is owned by [`ConfigStore`].

mod domain;
mod loader;
mod schedule;
mod store;
mod types;
mod watcher;

pub use domain::*;
pub use loader::*;
pub use schedule::*;
pub use store::*;
pub use types::*;
pub use watcher::*;
