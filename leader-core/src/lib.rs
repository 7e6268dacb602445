//! Leader Core - leader-elected work coordinator
//!
//! This crate guarantees that cluster-wide singleton jobs run on exactly
//! one backend process at a time:
//! - Campaigning through a lease-backed election primitive
//! - Running submitted work only while leading
//! - Cancelling a generation's work when leadership is lost
//! - Draining old work before a new leadership generation starts

pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod metrics;
pub mod task;

pub use config::{CampaignRetry, CoordinatorConfig};
pub use coordinator::{Coordinator, LeadershipState, Supervisor, Work, WorkHandle};
pub use election::{Election, ElectionBackend, MemoryBackend, Session};
pub use error::{LeaderError, Result, TaskError};
pub use task::{leader_task, with_timeout, LeaderTask};

/// Default election key prefix
pub const DEFAULT_KEY_PREFIX: &str = config::DEFAULT_KEY_PREFIX;
