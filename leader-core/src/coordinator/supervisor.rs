//! Leadership supervisor
//!
//! Campaigns for leadership, follows the observed leader, and runs
//! submitted work only while this node leads. Leadership is published
//! as a [`LeadershipState`] on a watch channel; each `Leading` value
//! carries a generation number and the worker runs exactly one intake
//! loop per generation.
//!
//! Ordering rules:
//! - a new generation starts only after all work from earlier
//!   generations has finished (drain barrier);
//! - once a generation ends its intake loop stops accepting work and its
//!   cancellation token fires, already running tasks finish on their own.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::work::Work;
use crate::config::{CampaignRetry, CoordinatorConfig};
use crate::election::Election;
use crate::error::{LeaderError, Result};
use crate::metrics::LeaderMetrics;

/// Leadership state of one supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// Constructed, or out of the election after giving up
    Idle,
    /// Waiting to win the election
    Campaigning,
    /// Leading; work submitted now runs in this generation
    Leading { generation: u64 },
    /// Stopped for good
    Stopped,
}

impl LeadershipState {
    pub fn is_leading(&self) -> bool {
        matches!(self, LeadershipState::Leading { .. })
    }
}

/// Point-in-time view of a supervisor, used for status logging
#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub node_name: String,
    pub leader_name: String,
    pub state: LeadershipState,
    pub work_performed: u64,
    pub work_in_flight: usize,
}

/// Runs leader-only work for one election session
pub struct Supervisor {
    node_name: String,
    election: Arc<dyn Election>,
    leader_name: RwLock<String>,
    state_tx: watch::Sender<LeadershipState>,
    generation: AtomicU64,
    work_tx: mpsc::Sender<Work>,
    work_rx: Mutex<Option<mpsc::Receiver<Work>>>,
    in_flight_tx: watch::Sender<usize>,
    attained_tx: watch::Sender<bool>,
    log_interval_tx: watch::Sender<Duration>,
    campaign_retry: CampaignRetry,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    metrics: LeaderMetrics,
}

impl Supervisor {
    /// Create a supervisor campaigning on `election`
    pub fn new(election: Arc<dyn Election>, config: &CoordinatorConfig) -> Self {
        let (work_tx, work_rx) = mpsc::channel(config.work_queue_depth.max(1));
        let (state_tx, _) = watch::channel(LeadershipState::Idle);
        let (in_flight_tx, _) = watch::channel(0);
        let (attained_tx, _) = watch::channel(false);
        let (log_interval_tx, _) = watch::channel(config.log_interval);

        Self {
            node_name: format!("{}-{}", config.node_prefix, Uuid::new_v4()),
            election,
            leader_name: RwLock::new(String::new()),
            state_tx,
            generation: AtomicU64::new(0),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            in_flight_tx,
            attained_tx,
            log_interval_tx,
            campaign_retry: config.campaign_retry.clone(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            metrics: LeaderMetrics::new(),
        }
    }

    /// Spawn the campaign, observer, worker and status reporter
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let work_rx = self.work_rx.lock().take().ok_or_else(|| LeaderError::Internal {
            message: format!("supervisor {} already started", self.node_name),
        })?;

        info!("Supervisor {} starting", self.node_name);

        self.tasks.spawn(self.clone().campaign());
        self.tasks.spawn(self.clone().observer());
        self.tasks.spawn(self.clone().worker(work_rx));
        self.tasks.spawn(self.clone().report_status());
        Ok(())
    }

    /// Submit work, waiting for space in the work queue
    ///
    /// Returns once the work is queued, even on a follower. The result
    /// arrives on the work's handle after this node leads and runs it.
    pub async fn exec(&self, work: Work) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(LeaderError::ShuttingDown);
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(LeaderError::ShuttingDown),
            sent = self.work_tx.send(work) => sent.map_err(|_| LeaderError::ShuttingDown),
        }
    }

    /// Stop all loops, wait for running work, then resign
    ///
    /// Blocks for as long as any task ignores its cancellation token.
    pub async fn stop(&self) -> Result<()> {
        info!("Supervisor {} stopping", self.node_name);

        self.shutdown.cancel();
        let previous = self.state_tx.send_replace(LeadershipState::Stopped);

        self.tasks.close();
        self.tasks.wait().await;

        let mut in_flight = self.in_flight_tx.subscribe();
        let _ = in_flight.wait_for(|count| *count == 0).await;
        self.metrics.is_leader.set(0);

        if let Err(e) = self.election.resign().await {
            error!("Supervisor {} failed to resign: {}", self.node_name, e);
            return Err(LeaderError::Resign {
                reason: e.to_string(),
            });
        }

        info!(
            "Supervisor {} stopped (was {:?}, {} work items performed)",
            self.node_name,
            previous,
            self.metrics.work_performed.get()
        );
        Ok(())
    }

    /// Wait until this node has led at least once
    pub async fn wait_leader(&self) {
        let mut attained = self.attained_tx.subscribe();
        let _ = attained.wait_for(|attained| *attained).await;
    }

    /// True when the most recently observed leader is this node
    pub fn is_leader(&self) -> bool {
        *self.leader_name.read() == self.node_name
    }

    /// True while a leadership generation is active
    pub fn is_leading(&self) -> bool {
        self.state().is_leading()
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Most recently observed leader, empty before any winner is known
    pub fn leader_name(&self) -> String {
        self.leader_name.read().clone()
    }

    pub fn state(&self) -> LeadershipState {
        *self.state_tx.borrow()
    }

    /// Subscribe to leadership transitions
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_tx.subscribe()
    }

    /// Work items completed on this node
    pub fn work_performed(&self) -> u64 {
        self.metrics.work_performed.get()
    }

    pub fn work_in_flight(&self) -> usize {
        *self.in_flight_tx.borrow()
    }

    pub fn metrics(&self) -> &LeaderMetrics {
        &self.metrics
    }

    /// Change the status log interval; zero disables the reporter
    pub fn set_log_interval(&self, interval: Duration) {
        self.log_interval_tx.send_replace(interval);
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            node_name: self.node_name.clone(),
            leader_name: self.leader_name(),
            state: self.state(),
            work_performed: self.work_performed(),
            work_in_flight: self.work_in_flight(),
        }
    }

    /// Move to `next` unless stopped
    fn transition(&self, next: LeadershipState) {
        self.state_tx.send_if_modified(|state| {
            if *state == LeadershipState::Stopped || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn campaign(self: Arc<Self>) {
        let mut failures = 0u32;

        loop {
            self.transition(LeadershipState::Campaigning);
            debug!("Supervisor {} campaigning", self.node_name);

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                result = self.election.campaign(&self.node_name) => result,
            };

            if let Err(e) = result {
                failures += 1;
                self.metrics.campaign_failures.inc();

                // Neither clears on this session; only a new session can campaign again.
                if matches!(e, LeaderError::ElectionClosed | LeaderError::SessionExpired { .. }) {
                    error!(
                        "Campaign for {} cannot continue, leaving the election: {}",
                        self.node_name, e
                    );
                    self.transition(LeadershipState::Idle);
                    return;
                }

                match self.campaign_retry.delay_for(failures) {
                    Some(delay) => {
                        warn!(
                            "Campaign attempt {} for {} failed: {}. Retrying in {:?}",
                            failures, self.node_name, e, delay
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    None => {
                        error!(
                            "Campaign for {} failed after {} attempts, leaving the election: {}",
                            self.node_name, failures, e
                        );
                        self.transition(LeadershipState::Idle);
                        return;
                    }
                }
            }

            failures = 0;
            *self.leader_name.write() = self.node_name.clone();
            self.attained_tx.send_replace(true);
            info!("Supervisor {} won the election", self.node_name);

            // Drain barrier: nothing from an earlier generation may still run.
            let mut in_flight = self.in_flight_tx.subscribe();
            let drained = async {
                let _ = in_flight.wait_for(|count| *count == 0).await;
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = drained => {}
            }

            match self.promote() {
                Some(generation) => {
                    self.metrics.generations.inc();
                    info!(
                        "Supervisor {} leading generation {}",
                        self.node_name, generation
                    );
                    return;
                }
                None if self.shutdown.is_cancelled() => return,
                None => {
                    warn!(
                        "Supervisor {} lost leadership while draining, campaigning again",
                        self.node_name
                    );
                }
            }
        }
    }

    /// Publish a new generation if the election still names this node
    fn promote(&self) -> Option<u64> {
        let mut promoted = None;
        self.state_tx.send_if_modified(|state| {
            if *state == LeadershipState::Stopped {
                return false;
            }
            if self.election.leader().as_deref() != Some(self.node_name.as_str()) {
                return false;
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = LeadershipState::Leading { generation };
            self.metrics.is_leader.set(1);
            promoted = Some(generation);
            true
        });
        promoted
    }

    async fn observer(self: Arc<Self>) {
        let mut leader_rx = self.election.observe();

        loop {
            let observed = leader_rx.borrow_and_update().clone();
            self.follow(observed, &leader_rx);

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                changed = leader_rx.changed() => {
                    if changed.is_err() {
                        self.election_lost();
                        return;
                    }
                }
            }
        }
    }

    /// Record the observed leader and step down if it is someone else
    fn follow(self: &Arc<Self>, observed: Option<String>, leader_rx: &watch::Receiver<Option<String>>) {
        let leader = observed.unwrap_or_default();
        *self.leader_name.write() = leader.clone();

        if leader == self.node_name {
            return;
        }

        let mut demoted = None;
        self.state_tx.send_if_modified(|state| {
            let LeadershipState::Leading { generation } = *state else {
                return false;
            };
            // A newer observation is pending; act on that one instead.
            if leader_rx.has_changed().unwrap_or(false) {
                return false;
            }
            *state = LeadershipState::Campaigning;
            self.metrics.is_leader.set(0);
            demoted = Some(generation);
            true
        });

        if let Some(generation) = demoted {
            self.metrics.demotions.inc();
            warn!(
                "Supervisor {} lost leadership of generation {} to {:?}",
                self.node_name, generation, leader
            );
            self.tasks.spawn(self.clone().campaign());
        }
    }

    fn election_lost(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        error!(
            "Election stream for {} ended, leaving the election",
            self.node_name
        );
        let mut was_leading = false;
        self.state_tx.send_if_modified(|state| {
            if matches!(*state, LeadershipState::Stopped | LeadershipState::Idle) {
                return false;
            }
            was_leading = state.is_leading();
            *state = LeadershipState::Idle;
            self.metrics.is_leader.set(0);
            true
        });
        if was_leading {
            self.metrics.demotions.inc();
        }
    }

    async fn worker(self: Arc<Self>, mut work_rx: mpsc::Receiver<Work>) {
        let mut state_rx = self.state_tx.subscribe();
        let mut last_generation = 0;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                next = next_generation(&mut state_rx, last_generation) => next,
            };
            let Some(generation) = next else {
                break;
            };

            // Work received late in the previous generation is counted by now.
            let mut in_flight = self.in_flight_tx.subscribe();
            let drained = async {
                let _ = in_flight.wait_for(|count| *count == 0).await;
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = drained => {}
            }

            last_generation = generation;
            self.process_work(generation, &mut work_rx, &mut state_rx).await;
        }

        // Queued work is dropped with the receiver and reports a shutdown.
        work_rx.close();
        debug!("Supervisor {} worker exited", self.node_name);
    }

    async fn process_work(
        self: &Arc<Self>,
        generation: u64,
        work_rx: &mut mpsc::Receiver<Work>,
        state_rx: &mut watch::Receiver<LeadershipState>,
    ) {
        let work_token = self.shutdown.child_token();
        let _cancel_on_exit = work_token.clone().drop_guard();
        debug!(
            "Supervisor {} accepting work for generation {}",
            self.node_name, generation
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                changed = state_rx.changed() => {
                    let current = changed.ok().map(|_| *state_rx.borrow_and_update());
                    if current != Some(LeadershipState::Leading { generation }) {
                        break;
                    }
                }
                work = work_rx.recv() => match work {
                    Some(work) => self.spawn_work(generation, work, work_token.clone()),
                    None => break,
                },
            }
        }

        debug!(
            "Supervisor {} generation {} ended with {} work items in flight",
            self.node_name,
            generation,
            self.work_in_flight()
        );
    }

    fn spawn_work(self: &Arc<Self>, generation: u64, work: Work, token: CancellationToken) {
        let queued_for = work.queued_for();
        let Some((task, completion)) = work.into_parts() else {
            return;
        };

        let in_flight = InFlight::enter(self.clone());
        tokio::spawn(async move {
            let id = completion.id();
            debug!(
                "Work {} started in generation {} after {:?} queued",
                id, generation, queued_for
            );

            let started = Instant::now();
            let result = task(token).await;
            let elapsed = started.elapsed();

            if let Err(e) = &result {
                debug!("Work {} failed after {:?}: {}", id, elapsed, e);
            } else {
                debug!("Work {} completed in {:?}", id, elapsed);
            }

            in_flight.record(elapsed);
            completion.complete(result);
            drop(in_flight);
        });
    }

    async fn report_status(self: Arc<Self>) {
        let mut interval_rx = self.log_interval_tx.subscribe();

        loop {
            let period = *interval_rx.borrow_and_update();
            if period.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        let status = self.status();
                        info!(
                            "Leader status: node={} leader={:?} state={:?} performed={} in_flight={}",
                            status.node_name,
                            status.leader_name,
                            status.state,
                            status.work_performed,
                            status.work_in_flight
                        );
                    }
                }
            }
        }
    }
}

/// Wait for a `Leading` state newer than `after`; `None` once stopped
async fn next_generation(
    state_rx: &mut watch::Receiver<LeadershipState>,
    after: u64,
) -> Option<u64> {
    let state = state_rx
        .wait_for(|state| match state {
            LeadershipState::Stopped => true,
            LeadershipState::Leading { generation } => *generation > after,
            _ => false,
        })
        .await
        .ok()
        .map(|state| *state)?;

    match state {
        LeadershipState::Leading { generation } => Some(generation),
        _ => None,
    }
}

/// Accounts one running work item; releases the drain barrier on drop
struct InFlight {
    supervisor: Arc<Supervisor>,
}

impl InFlight {
    fn enter(supervisor: Arc<Supervisor>) -> Self {
        supervisor.in_flight_tx.send_modify(|count| *count += 1);
        supervisor.metrics.work_in_flight.inc();
        Self { supervisor }
    }

    fn record(&self, elapsed: Duration) {
        self.supervisor.metrics.work_performed.inc();
        self.supervisor.metrics.work_duration.observe(elapsed);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.supervisor.metrics.work_in_flight.dec();
        self.supervisor.in_flight_tx.send_modify(|count| *count -= 1);
    }
}
