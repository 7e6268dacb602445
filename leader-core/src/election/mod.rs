//! Election primitive boundary
//!
//! The coordinator does not implement consensus. It consumes a
//! lease-backed election supplied by the storage layer through these
//! traits. [`memory::MemoryBackend`] is an in-process implementation.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;

pub use memory::MemoryBackend;

/// Client able to open lease-backed sessions
#[async_trait]
pub trait ElectionBackend: Send + Sync {
    /// Open an auto-renewing session whose lease lapses `ttl` after the owner dies
    async fn open_session(&self, ttl: Duration) -> Result<Arc<dyn Session>>;
}

/// A lease-backed session; losing it forfeits any leadership it holds
#[async_trait]
pub trait Session: Send + Sync {
    /// Lease identifier backing this session
    fn lease_id(&self) -> u64;

    /// Election handle for the key under `prefix`
    fn election(&self, prefix: &str) -> Arc<dyn Election>;

    /// Revoke the lease and release everything attached to it
    async fn close(&self) -> Result<()>;
}

/// Campaign, observe and resign over one election key
///
/// Dropping a pending `campaign` future cancels it; implementations must
/// withdraw the candidacy in that case.
#[async_trait]
pub trait Election: Send + Sync {
    /// Block until `value` is the recognized leader value for the key
    async fn campaign(&self, value: &str) -> Result<()>;

    /// Current leader value, replayed on subscribe and updated on change
    ///
    /// The stream ends (sender dropped) when the backend shuts down.
    fn observe(&self) -> watch::Receiver<Option<String>>;

    /// Release this session's claim on the key, if held
    async fn resign(&self) -> Result<()>;

    /// Leader value at this instant
    fn leader(&self) -> Option<String> {
        let rx = self.observe();
        let leader = rx.borrow().clone();
        leader
    }
}
