//! Leader-elected work coordination
//!
//! Runs cluster-singleton work on exactly one backend process at a time.

pub mod leader;
pub mod supervisor;
pub mod work;

pub use leader::Coordinator;
pub use supervisor::{LeadershipState, Supervisor, SupervisorStatus};
pub use work::{Work, WorkHandle};
