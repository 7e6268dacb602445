//! In-process election backend
//!
//! Models lease-backed sessions and a revision-ordered candidate queue
//! per key: the oldest live candidate is the leader. Used by tests, the
//! demo binary, and single-process deployments with embedded storage.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Election, ElectionBackend, Session};
use crate::error::{LeaderError, Result};

/// Lease lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// Renewing normally
    Active,
    /// Closed by its owner
    Revoked,
    /// Lapsed without being closed
    Expired,
}

#[derive(Debug)]
struct Lease {
    status: LeaseStatus,
    ttl: Duration,
}

#[derive(Debug)]
struct Candidate {
    lease_id: u64,
    value: String,
}

/// State of a single election key
struct KeyState {
    /// Ordered by creation; the head is the leader
    candidates: Vec<Candidate>,
    leader_tx: watch::Sender<Option<String>>,
    /// Bumped on every mutation so waiting campaigns re-check their position
    revision_tx: watch::Sender<u64>,
}

impl KeyState {
    fn new() -> Self {
        let (leader_tx, _) = watch::channel(None);
        let (revision_tx, _) = watch::channel(0);
        Self {
            candidates: Vec::new(),
            leader_tx,
            revision_tx,
        }
    }

    fn position(&self, lease_id: u64) -> Option<usize> {
        self.candidates.iter().position(|c| c.lease_id == lease_id)
    }

    fn remove_where<F>(&mut self, predicate: F) -> bool
    where
        F: Fn(&Candidate) -> bool,
    {
        let before = self.candidates.len();
        self.candidates.retain(|c| !predicate(c));
        let removed = self.candidates.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    fn publish(&self) {
        let leader = self.candidates.first().map(|c| c.value.clone());
        self.leader_tx.send_if_modified(|current| {
            if *current != leader {
                *current = leader;
                true
            } else {
                false
            }
        });
        self.revision_tx.send_modify(|rev| *rev += 1);
    }
}

#[derive(Default)]
struct BackendState {
    closed: bool,
    leases: HashMap<u64, Lease>,
    keys: HashMap<String, KeyState>,
}

impl BackendState {
    fn key_mut(&mut self, prefix: &str) -> &mut KeyState {
        self.keys.entry(prefix.to_string()).or_insert_with(KeyState::new)
    }

    fn check_lease(&self, lease_id: u64) -> Result<()> {
        if self.closed {
            return Err(LeaderError::ElectionClosed);
        }
        match self.leases.get(&lease_id).map(|l| l.status) {
            Some(LeaseStatus::Active) => Ok(()),
            _ => Err(LeaderError::SessionExpired { lease_id }),
        }
    }

    fn end_lease(&mut self, lease_id: u64, status: LeaseStatus) -> bool {
        let Some(lease) = self.leases.get_mut(&lease_id) else {
            return false;
        };
        if lease.status != LeaseStatus::Active {
            return false;
        }
        lease.status = status;
        for key in self.keys.values_mut() {
            key.remove_where(|c| c.lease_id == lease_id);
        }
        true
    }
}

struct Shared {
    state: Mutex<BackendState>,
    next_lease: AtomicU64,
    injected_failures: AtomicU32,
}

/// In-memory election backend
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BackendState::default()),
                next_lease: AtomicU64::new(1),
                injected_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Current leader value for the election under `prefix`
    pub fn leader(&self, prefix: &str) -> Option<String> {
        let state = self.shared.state.lock();
        state
            .keys
            .get(prefix)
            .and_then(|k| k.candidates.first().map(|c| c.value.clone()))
    }

    /// Candidate values queued under `prefix`, leader first
    pub fn candidates(&self, prefix: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        state
            .keys
            .get(prefix)
            .map(|k| k.candidates.iter().map(|c| c.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Status of a lease, if it was ever granted
    pub fn lease_status(&self, lease_id: u64) -> Option<LeaseStatus> {
        self.shared.state.lock().leases.get(&lease_id).map(|l| l.status)
    }

    /// TTL a lease was granted with
    pub fn lease_ttl(&self, lease_id: u64) -> Option<Duration> {
        self.shared.state.lock().leases.get(&lease_id).map(|l| l.ttl)
    }

    /// Number of sessions whose lease is still active
    pub fn active_sessions(&self) -> usize {
        self.shared
            .state
            .lock()
            .leases
            .values()
            .filter(|l| l.status == LeaseStatus::Active)
            .count()
    }

    /// Let a lease lapse as if its owner crashed
    pub fn expire_session(&self, lease_id: u64) -> bool {
        let expired = self.shared.state.lock().end_lease(lease_id, LeaseStatus::Expired);
        if expired {
            warn!("Lease {} expired", lease_id);
        }
        expired
    }

    /// Drop every candidacy with `value` under `prefix` while keeping its session
    pub fn evict(&self, prefix: &str, value: &str) -> bool {
        let mut state = self.shared.state.lock();
        let evicted = state
            .keys
            .get_mut(prefix)
            .is_some_and(|key| key.remove_where(|c| c.value == value));
        if evicted {
            info!("Evicted candidate {} from {}", value, prefix);
        }
        evicted
    }

    /// Make the next `count` campaign calls fail
    pub fn inject_campaign_failures(&self, count: u32) {
        self.shared.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Shut the backend down, ending every observer stream
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        for lease in state.leases.values_mut() {
            if lease.status == LeaseStatus::Active {
                lease.status = LeaseStatus::Revoked;
            }
        }
        state.keys.clear();
        info!("Memory election backend closed");
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ElectionBackend for MemoryBackend {
    async fn open_session(&self, ttl: Duration) -> Result<Arc<dyn Session>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(LeaderError::SessionFailed {
                reason: "election backend closed".into(),
            });
        }

        let lease_id = self.shared.next_lease.fetch_add(1, Ordering::Relaxed);
        state.leases.insert(
            lease_id,
            Lease {
                status: LeaseStatus::Active,
                ttl,
            },
        );
        debug!("Granted lease {} (ttl {:?})", lease_id, ttl);

        Ok(Arc::new(MemorySession {
            shared: self.shared.clone(),
            lease_id,
        }))
    }
}

/// Session on a [`MemoryBackend`]
pub struct MemorySession {
    shared: Arc<Shared>,
    lease_id: u64,
}

#[async_trait]
impl Session for MemorySession {
    fn lease_id(&self) -> u64 {
        self.lease_id
    }

    fn election(&self, prefix: &str) -> Arc<dyn Election> {
        Arc::new(MemoryElection {
            shared: self.shared.clone(),
            lease_id: self.lease_id,
            prefix: prefix.to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.end_lease(self.lease_id, LeaseStatus::Revoked) {
            debug!("Revoked lease {}", self.lease_id);
        }
        Ok(())
    }
}

/// Election handle bound to one session and key
pub struct MemoryElection {
    shared: Arc<Shared>,
    lease_id: u64,
    prefix: String,
}

impl MemoryElection {
    fn take_injected_failure(&self) -> bool {
        self.shared
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn withdraw(&self) {
        let mut state = self.shared.state.lock();
        if let Some(key) = state.keys.get_mut(&self.prefix) {
            key.remove_where(|c| c.lease_id == self.lease_id);
        }
    }
}

/// Withdraws a candidacy when a campaign is abandoned
struct Candidacy<'a> {
    election: &'a MemoryElection,
    armed: bool,
}

impl Drop for Candidacy<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.election.withdraw();
        }
    }
}

#[async_trait]
impl Election for MemoryElection {
    async fn campaign(&self, value: &str) -> Result<()> {
        if self.take_injected_failure() {
            return Err(LeaderError::Campaign {
                node: value.to_string(),
                reason: "injected failure".into(),
            });
        }

        let mut revision_rx = {
            let mut state = self.shared.state.lock();
            state.check_lease(self.lease_id)?;
            let key = state.key_mut(&self.prefix);
            match key.position(self.lease_id) {
                Some(idx) => key.candidates[idx].value = value.to_string(),
                None => key.candidates.push(Candidate {
                    lease_id: self.lease_id,
                    value: value.to_string(),
                }),
            }
            key.publish();
            key.revision_tx.subscribe()
        };

        let mut candidacy = Candidacy {
            election: self,
            armed: true,
        };

        loop {
            {
                let mut state = self.shared.state.lock();
                if let Err(e) = state.check_lease(self.lease_id) {
                    candidacy.armed = false;
                    return Err(e);
                }
                let position = state
                    .keys
                    .get(&self.prefix)
                    .and_then(|key| key.position(self.lease_id));
                match position {
                    Some(0) => {
                        candidacy.armed = false;
                        return Ok(());
                    }
                    Some(_) => {}
                    None => {
                        candidacy.armed = false;
                        return Err(LeaderError::Campaign {
                            node: value.to_string(),
                            reason: "candidacy revoked while waiting".into(),
                        });
                    }
                }
            }

            if revision_rx.changed().await.is_err() {
                candidacy.armed = false;
                return Err(LeaderError::ElectionClosed);
            }
        }
    }

    fn observe(&self) -> watch::Receiver<Option<String>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            let (_tx, rx) = watch::channel(None);
            return rx;
        }
        state.key_mut(&self.prefix).leader_tx.subscribe()
    }

    async fn resign(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(LeaderError::ElectionClosed);
        }
        if let Some(key) = state.keys.get_mut(&self.prefix) {
            if key.remove_where(|c| c.lease_id == self.lease_id) {
                debug!("Lease {} resigned from {}", self.lease_id, self.prefix);
            }
        }
        Ok(())
    }

    fn leader(&self) -> Option<String> {
        let state = self.shared.state.lock();
        state
            .keys
            .get(&self.prefix)
            .and_then(|k| k.candidates.first().map(|c| c.value.clone()))
    }
}
