//! Units of leader-only work
//!
//! A [`Work`] travels to the supervisor; the matching [`WorkHandle`] stays
//! with the submitter and yields the single result.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;

use crate::error::{LeaderError, Result};
use crate::task::{LeaderTask, TaskResult};

/// Process-local work ids
///
/// Ids are for log correlation only: they restart with the process, are
/// not unique across nodes, and are never persisted.
static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

/// A task waiting to run on the leader
pub struct Work {
    id: u64,
    task: Option<LeaderTask>,
    result_tx: Option<oneshot::Sender<TaskResult>>,
    submitted_at: Instant,
}

impl Work {
    /// Wrap `task` with the next id and an empty result slot
    pub fn new(task: LeaderTask) -> (Work, WorkHandle) {
        let id = NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();

        let work = Work {
            id,
            task: Some(task),
            result_tx: Some(result_tx),
            submitted_at: Instant::now(),
        };
        let handle = WorkHandle {
            id,
            result_rx: Some(result_rx),
            outcome: None,
        };
        (work, handle)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the work was created
    pub fn queued_for(&self) -> std::time::Duration {
        self.submitted_at.elapsed()
    }

    /// Split into the task and the sender that completes it
    pub(crate) fn into_parts(mut self) -> Option<(LeaderTask, WorkCompletion)> {
        let task = self.task.take()?;
        let result_tx = self.result_tx.take()?;
        Some((
            task,
            WorkCompletion {
                id: self.id,
                result_tx,
            },
        ))
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        // Never executed: the supervisor went away with this work queued.
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(Err(LeaderError::ShuttingDown.into()));
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("pending", &self.task.is_some())
            .finish()
    }
}

/// Write side of a work item's result slot
pub(crate) struct WorkCompletion {
    id: u64,
    result_tx: oneshot::Sender<TaskResult>,
}

impl WorkCompletion {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Deliver the one result; a vanished submitter is not an error
    pub(crate) fn complete(self, result: TaskResult) {
        let _ = self.result_tx.send(result);
    }
}

/// Caller side of a submitted work item
#[derive(Debug)]
pub struct WorkHandle {
    id: u64,
    result_rx: Option<oneshot::Receiver<TaskResult>>,
    outcome: Option<Result<()>>,
}

impl WorkHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the result, returning the error if the work failed
    ///
    /// The first completed call memoizes the outcome; later calls return it
    /// without waiting. Cancel-safe.
    pub async fn err(&mut self) -> Option<&LeaderError> {
        if self.outcome.is_none() {
            let outcome = match self.result_rx.as_mut() {
                Some(rx) => resolve(self.id, rx.await),
                None => Err(LeaderError::WorkAbandoned { id: self.id }),
            };
            self.result_rx = None;
            self.outcome = Some(outcome);
        }
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().err())
    }

    /// Wait for the result, taking ownership of it
    pub async fn into_result(mut self) -> Result<()> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.result_rx.take() {
            Some(rx) => resolve(self.id, rx.await),
            None => Err(LeaderError::WorkAbandoned { id: self.id }),
        }
    }

    /// True once a result has been received
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }
}

fn resolve(id: u64, received: std::result::Result<TaskResult, oneshot::error::RecvError>) -> Result<()> {
    match received {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(LeaderError::from_task_error(err)),
        Err(_) => Err(LeaderError::WorkAbandoned { id }),
    }
}
