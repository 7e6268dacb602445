//! Coordinator facade
//!
//! Owns at most one supervisor and the session behind it, and exposes
//! the synchronous-looking API other daemons use: `run` a task on the
//! cluster leader and wait for its result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::supervisor::{Supervisor, SupervisorStatus};
use super::work::Work;
use crate::config::CoordinatorConfig;
use crate::election::{ElectionBackend, Session};
use crate::error::{LeaderError, Result, TaskError};
use crate::task::{leader_task, LeaderTask};

#[derive(Default)]
struct CoordinatorState {
    supervisor: Option<Arc<Supervisor>>,
    session: Option<Arc<dyn Session>>,
    overridden: bool,
}

/// Leader-elected work coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    /// Create an uninitialized coordinator
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(CoordinatorState::default()),
        })
    }

    /// Create a coordinator that runs every task locally, without an election
    pub fn overridden() -> Self {
        Self {
            config: CoordinatorConfig::default(),
            state: Mutex::new(CoordinatorState {
                overridden: true,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Open a session on `backend` and start campaigning
    pub async fn initialize(&self, backend: &dyn ElectionBackend) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.supervisor.is_some() {
            return Err(LeaderError::AlreadyInitialized);
        }

        let session = backend
            .open_session(self.config.session_ttl)
            .await
            .map_err(|e| match e {
                LeaderError::SessionFailed { .. } => e,
                other => LeaderError::SessionFailed {
                    reason: other.to_string(),
                },
            })?;

        let election = session.election(&self.config.key_prefix);
        let supervisor = Arc::new(Supervisor::new(election, &self.config));
        if let Err(e) = supervisor.start() {
            let _ = session.close().await;
            return Err(e);
        }

        info!(
            "Leader coordinator initialized as {} on lease {} under {}",
            supervisor.node_name(),
            session.lease_id(),
            self.config.key_prefix
        );

        state.supervisor = Some(supervisor);
        state.session = Some(session);
        Ok(())
    }

    /// Run every task directly on the caller, bypassing the election
    ///
    /// Meant for tests that do not need real coordination.
    pub async fn override_coordination(&self) {
        let mut state = self.state.lock().await;
        if !state.overridden {
            warn!("Leader coordination overridden, tasks run locally");
        }
        state.overridden = true;
    }

    /// Run `f` on the cluster leader and wait for its result
    pub async fn run<F, Fut, E>(&self, f: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<TaskError> + 'static,
    {
        self.run_task(leader_task(f)).await
    }

    /// Run a boxed task on the cluster leader and wait for its result
    ///
    /// Blocks until this node leads and the task has finished. There is
    /// no deadline; bound the task itself (see [`crate::task::with_timeout`]).
    pub async fn run_task(&self, task: LeaderTask) -> Result<()> {
        let supervisor = {
            let state = self.state.lock().await;
            if state.overridden {
                None
            } else {
                Some(state.supervisor.clone().ok_or(LeaderError::NotInitialized)?)
            }
        };

        let Some(supervisor) = supervisor else {
            return task(CancellationToken::new())
                .await
                .map_err(LeaderError::from_task_error);
        };

        let (work, handle) = Work::new(task);
        debug!("Submitting work {} to {}", work.id(), supervisor.node_name());
        supervisor.exec(work).await?;
        handle.into_result().await
    }

    /// Stop the supervisor, resign and close the session
    ///
    /// Further `run` calls fail with [`LeaderError::NotInitialized`] until
    /// the coordinator is initialized again.
    pub async fn resign(&self) -> Result<()> {
        let (supervisor, session) = {
            let mut state = self.state.lock().await;
            (state.supervisor.take(), state.session.take())
        };

        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        let stopped = supervisor.stop().await;

        if let Some(session) = session {
            if let Err(e) = session.close().await {
                error!("Failed to close election session: {}", e);
                return stopped.and(Err(e));
            }
        }

        info!("Leader coordinator {} resigned", supervisor.node_name());
        stopped
    }

    /// Change how often the supervisor logs its status
    pub async fn set_log_interval(&self, interval: Duration) -> Result<()> {
        self.supervisor().await?.set_log_interval(interval);
        Ok(())
    }

    /// Wait until this node has led at least once
    pub async fn wait_leader(&self) -> Result<()> {
        self.supervisor().await?.wait_leader().await;
        Ok(())
    }

    /// True when this node is the observed leader
    pub async fn is_leader(&self) -> bool {
        match self.supervisor().await {
            Ok(supervisor) => supervisor.is_leader(),
            Err(_) => false,
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.supervisor.is_some()
    }

    pub async fn status(&self) -> Result<SupervisorStatus> {
        Ok(self.supervisor().await?.status())
    }

    /// Current supervisor
    pub async fn supervisor(&self) -> Result<Arc<Supervisor>> {
        self.state
            .lock()
            .await
            .supervisor
            .clone()
            .ok_or(LeaderError::NotInitialized)
    }
}
