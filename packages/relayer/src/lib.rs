//! Bridge relayer coordination core
//!
//! Watches source chains for confirmed deposits, turns them into proposals,
//! votes on destination chains and executes proposals once they pass.

pub mod api;
pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod confirmation;
pub mod connector;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod proposal;
pub mod shutdown;
pub mod testing;
pub mod tracker;
pub mod types;
pub mod watchers;
pub mod writers;

pub use crate::config::Config;
pub use crate::coordinator::{Coordinator, CoordinatorConfig};
pub use crate::error::{RelayerError, Result};
