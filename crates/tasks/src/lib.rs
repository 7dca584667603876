//! Bounded task groups.
//!
//! A [`TaskGroup`] runs fallible futures on the tokio runtime with a fixed concurrency limit and
//! remembers the first failure. Spawning waits for a free slot, which gives callers back-pressure.
//! Dropping a group aborts its remaining tasks.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

use crate::metrics::TaskGroupMetrics;
use std::{any::Any, fmt, future::Future};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

mod metrics;

/// Default number of concurrent tasks of a [`TaskGroup`].
pub const DEFAULT_TASK_GROUP_LIMIT: usize = 250;

/// Failure of a task of a [`TaskGroup`].
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// The task returned an error.
    #[error(transparent)]
    Failed(E),
    /// The task panicked.
    #[error("task of group {group} panicked: {message}")]
    Panicked {
        /// Group name.
        group: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },
}

impl<E> TaskError<E> {
    /// Returns the task error, or `None` if the task panicked.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Panicked { .. } => None,
        }
    }

    fn panicked(group: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .unwrap_or_else(|| "unknown panic payload".to_string()),
        };
        Self::Panicked { group, message }
    }
}

/// A set of concurrently running fallible tasks that returns the first error.
pub struct TaskGroup<E> {
    name: &'static str,
    limit: usize,
    tasks: JoinSet<Result<(), E>>,
    first_error: Option<TaskError<E>>,
    metrics: TaskGroupMetrics,
}

impl<E> fmt::Debug for TaskGroup<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("running", &self.tasks.len())
            .field("failed", &self.first_error.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: Send + 'static> TaskGroup<E> {
    /// Creates a group running at most `limit` tasks at once. A zero limit is raised to one.
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit: limit.max(1),
            tasks: JoinSet::new(),
            first_error: None,
            metrics: TaskGroupMetrics::new_with_labels(&[("group", name)]),
        }
    }

    /// Number of tasks still running or not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no task is running.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns `true` if a task has failed.
    pub const fn has_failed(&self) -> bool {
        self.first_error.is_some()
    }

    /// Spawns `task`, first waiting for a free slot if the group is at its limit.
    ///
    /// Once a task has failed, new tasks are dropped without running.
    pub async fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        while self.tasks.len() >= self.limit {
            self.join_next().await;
        }
        self.reap();
        if self.has_failed() {
            debug!(target: "backfill::tasks", group = self.name, "Group failed, dropping task");
            return
        }
        self.metrics.inc_spawned();
        self.tasks.spawn(task);
    }

    /// Records the outcome of every task that already finished, without waiting.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }
    }

    /// Reaps finished tasks and takes the first failure, if any. Further spawns are accepted
    /// again afterwards.
    pub fn take_error(&mut self) -> Option<TaskError<E>> {
        self.reap();
        self.first_error.take()
    }

    /// Waits for every task and returns the first failure, if any.
    pub async fn wait(mut self) -> Result<(), TaskError<E>> {
        while self.join_next().await {}
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Joins one task. Returns `false` if the group is empty.
    async fn join_next(&mut self) -> bool {
        match self.tasks.join_next().await {
            Some(result) => {
                self.record(result);
                true
            }
            None => false,
        }
    }

    fn record(&mut self, result: Result<Result<(), E>, JoinError>) {
        let err = match result {
            Ok(Ok(())) => {
                self.metrics.inc_finished();
                return
            }
            Ok(Err(err)) => TaskError::Failed(err),
            Err(join_err) if join_err.is_panic() => {
                error!(target: "backfill::tasks", group = self.name, "Task panicked");
                TaskError::panicked(self.name, join_err.into_panic())
            }
            // aborted
            Err(_) => return,
        };
        self.metrics.inc_failed();
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}
