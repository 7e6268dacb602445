//! Leader task contract
//!
//! A task receives the cancellation token of the leadership generation it
//! runs in. It must return promptly once that token is cancelled; the
//! coordinator never aborts a task and `stop` waits for every task to
//! finish.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{LeaderError, TaskError};

/// Outcome of a leader task
pub type TaskResult = std::result::Result<(), TaskError>;

/// Boxed future returned by a leader task
pub type TaskFuture = BoxFuture<'static, TaskResult>;

/// Unit of leader-only work
pub type LeaderTask = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send + 'static>;

/// Box a closure as a [`LeaderTask`]
pub fn leader_task<F, Fut, E>(f: F) -> LeaderTask
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<TaskError> + 'static,
{
    Box::new(move |token| async move { f(token).await.map_err(Into::into) }.boxed())
}

/// Cancel `task` if it runs longer than `timeout`
///
/// The task is still awaited after cancellation so it never outlives the
/// in-flight accounting of its generation.
pub fn with_timeout(timeout: Duration, task: LeaderTask) -> LeaderTask {
    Box::new(move |token: CancellationToken| {
        async move {
            let child = token.child_token();
            let fut = task(child.clone());
            tokio::pin!(fut);

            tokio::select! {
                result = &mut fut => result,
                _ = tokio::time::sleep(timeout) => {
                    child.cancel();
                    let _ = fut.await;
                    Err(LeaderError::TaskTimeout { timeout }.into())
                }
            }
        }
        .boxed()
    })
}

/// Wait for cancellation and report it as the task's error
pub async fn until_cancelled(token: CancellationToken) -> TaskResult {
    token.cancelled().await;
    Err(LeaderError::Cancelled.into())
}
