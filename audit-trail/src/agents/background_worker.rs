//! Background task supervision
//!
//! Every long-running pipeline task (emitter dispatcher, queue workers,
//! deduplication sweep) runs under a [`BackgroundWorker`] instead of a bare
//! `tokio::spawn`:
//!
//! - **Named task tracking**: each task has a unique id for monitoring
//! - **Graceful shutdown**: tasks are cancelled and awaited on shutdown
//! - **Status monitoring**: query a task's status at any time
//! - **Cancellation support**: individual tasks can be cancelled on demand
//!
//! # Example
//!
//! ```rust,ignore
//! let worker = BackgroundWorker::new();
//!
//! worker.submit("dedup-sweep", move || async move {
//!     dedup.run_sweeper(Duration::from_secs(60)).await
//! })?;
//!
//! assert_eq!(worker.get_task_status("dedup-sweep").await, TaskStatus::Running);
//! worker.shutdown().await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// How long shutdown and cancellation wait for a task to finish
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of a background task
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskStatus {
    /// Unknown task
    #[default]
    Pending,
    Running,
    Completed,
    /// Task returned an error
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Tracking information for a task
#[derive(Debug)]
struct TaskInfo {
    join_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancellation_token: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
}

/// Supervisor for named background tasks
///
/// Cheap to clone; clones share the same task map.
#[derive(Clone, Debug, Default)]
pub struct BackgroundWorker {
    tasks: Arc<DashMap<String, TaskInfo>>,
    /// Parent of every task's cancellation token
    root_token: CancellationToken,
}

impl BackgroundWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and track a task
    ///
    /// Fails with [`Error::AlreadyRegistered`] while a task with the same id is
    /// still running. A finished task's id may be reused.
    pub fn submit<F, Fut>(&self, task_id: impl Into<String>, work: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let task_id = task_id.into();
        if self.root_token.is_cancelled() {
            return Err(Error::Internal(format!(
                "background worker is shut down, cannot start '{}'",
                task_id
            )));
        }

        // The entry guard is held until the task is tracked, so concurrent
        // submits of one id cannot both spawn
        let entry = self.tasks.entry(task_id.clone());
        if let Entry::Occupied(existing) = &entry {
            let running = existing
                .get()
                .status
                .try_lock()
                .map(|s| !s.is_finished())
                .unwrap_or(true);
            if running {
                return Err(Error::AlreadyRegistered(format!(
                    "background task '{}'",
                    task_id
                )));
            }
        }

        let cancel_token = self.root_token.child_token();
        let status = Arc::new(Mutex::new(TaskStatus::Running));
        let handle = spawn_tracked(task_id.clone(), cancel_token.clone(), status.clone(), work);

        entry.insert(TaskInfo {
            join_handle: Arc::new(Mutex::new(Some(handle))),
            cancellation_token: cancel_token,
            status,
        });

        tracing::info!(task_id = %task_id, "Background task submitted");
        Ok(())
    }

    /// Cancel one task and wait up to 5 seconds for it to stop
    pub async fn cancel(&self, task_id: &str) {
        let Some((token, join_handle)) = self
            .tasks
            .get(task_id)
            .map(|t| (t.cancellation_token.clone(), t.join_handle.clone()))
        else {
            tracing::warn!(task_id, "Task not found for cancellation");
            return;
        };

        token.cancel();
        tracing::info!(task_id, "Task cancellation requested");

        let handle = join_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(STOP_TIMEOUT, handle).await;
        }
    }

    /// Current status; `Pending` for unknown ids
    pub async fn get_task_status(&self, task_id: &str) -> TaskStatus {
        let status = self.tasks.get(task_id).map(|t| t.status.clone());
        match status {
            Some(status) => status.lock().await.clone(),
            None => TaskStatus::Pending,
        }
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub async fn running_task_count(&self) -> usize {
        let mut count = 0;
        for status in self.statuses() {
            if *status.lock().await == TaskStatus::Running {
                count += 1;
            }
        }
        count
    }

    #[must_use]
    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Remove completed, failed and cancelled tasks from tracking
    pub async fn cleanup_finished_tasks(&self) {
        let entries: Vec<(String, Arc<Mutex<TaskStatus>>)> = self
            .tasks
            .iter()
            .map(|e| (e.key().clone(), e.status.clone()))
            .collect();

        for (task_id, status) in entries {
            if status.lock().await.is_finished() {
                self.tasks.remove(&task_id);
            }
        }
    }

    /// Cancel every task and wait for each to stop
    pub async fn shutdown(&self) {
        let handles: Vec<(String, Arc<Mutex<Option<JoinHandle<()>>>>)> = self
            .tasks
            .iter()
            .map(|e| (e.key().clone(), e.join_handle.clone()))
            .collect();

        self.root_token.cancel();
        if handles.is_empty() {
            tracing::info!("BackgroundWorker stopping with no active tasks");
            return;
        }

        tracing::info!(
            task_count = handles.len(),
            "BackgroundWorker stopping, cancelling all tasks..."
        );

        for (task_id, join_handle) in handles {
            let handle = join_handle.lock().await.take();
            let Some(handle) = handle else { continue };
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(task_id = %task_id, "Task shutdown complete");
                }
                Ok(Err(e)) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    tracing::warn!(task_id = %task_id, "Task shutdown timed out");
                }
            }
        }

        tracing::info!("All background tasks stopped");
    }

    fn statuses(&self) -> Vec<Arc<Mutex<TaskStatus>>> {
        self.tasks.iter().map(|e| e.status.clone()).collect()
    }
}

fn spawn_tracked<F, Fut>(
    task_id: String,
    cancel_token: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
    work: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            biased;

            () = cancel_token.cancelled() => {
                tracing::debug!(task_id = %task_id, "Task cancelled");
                *status.lock().await = TaskStatus::Cancelled;
            }
            result = work() => {
                match result {
                    Ok(()) => {
                        tracing::debug!(task_id = %task_id, "Task completed successfully");
                        *status.lock().await = TaskStatus::Completed;
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "Task failed");
                        *status.lock().await = TaskStatus::Failed(e.to_string());
                    }
                }
            }
        }
    })
}
