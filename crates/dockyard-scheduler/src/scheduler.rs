//! Bounded, FIFO build scheduler.
//!
//! At most `max_concurrent` build tasks run at once; the rest wait in
//! submission order. A finished task frees its slot and immediately triggers
//! another dispatch pass.

use dockyard_core::{Error, ResourceId, Result};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::task::BuildTask;

/// Live view of a queued or running task, used by log readers.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub deployment_id: ResourceId,
    pub service_id: ResourceId,
    log_path: PathBuf,
    finished: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether the task has completed. A task whose bookkeeping vanished
    /// without signalling counts as finished.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow() || self.finished.has_changed().is_err()
    }

    /// Resolve once the task has completed.
    pub async fn wait_finished(&mut self) {
        while !self.is_finished() {
            if self.finished.changed().await.is_err() {
                return;
            }
        }
    }
}

struct Queued {
    task: BuildTask,
    reply: oneshot::Sender<Result<String>>,
    done: watch::Sender<bool>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Queued>,
    /// Every queued or running task.
    handles: HashMap<ResourceId, TaskHandle>,
    running: usize,
}

struct Inner {
    max_concurrent: usize,
    state: Mutex<SchedulerState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start queued tasks while slots are free. Holding the state lock for
    /// the whole pass makes concurrent triggers serialize, so the bound
    /// holds no matter how many completions race.
    fn dispatch(self: &Arc<Self>) {
        let mut state = self.lock();
        while state.running < self.max_concurrent {
            let Some(queued) = state.queue.pop_front() else {
                break;
            };
            state.running += 1;
            debug!(
                deployment_id = %queued.task.deployment_id(),
                running = state.running,
                queued = state.queue.len(),
                "Dispatching build"
            );
            tokio::spawn(Arc::clone(self).run(queued));
        }
    }

    async fn run(self: Arc<Self>, queued: Queued) {
        let Queued { task, reply, done } = queued;
        let deployment_id = task.deployment_id();

        // A panicking backend must not take the slot down with it.
        let result = match tokio::spawn(task.run()).await {
            Ok(result) => result,
            Err(e) => {
                error!(deployment_id = %deployment_id, error = %e, "Build task aborted");
                Err(Error::Internal(format!(
                    "build {} aborted: {}",
                    deployment_id, e
                )))
            }
        };
        if let Err(e) = &result {
            warn!(deployment_id = %deployment_id, error = %e, "Build task failed");
        }

        {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            state.handles.remove(&deployment_id);
        }
        let _ = done.send(true);
        let _ = reply.send(result);

        self.dispatch();
    }
}

#[derive(Clone)]
pub struct BuildScheduler {
    inner: Arc<Inner>,
}

impl BuildScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Queue `task`. The returned future resolves with the built image or
    /// the task's error. Submitting a deployment that is already queued or
    /// running is rejected.
    pub fn submit(
        &self,
        task: BuildTask,
    ) -> Result<impl Future<Output = Result<String>> + Send + 'static> {
        let deployment_id = task.deployment_id();
        let (reply, receiver) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.handles.contains_key(&deployment_id) {
                return Err(Error::Conflict(format!(
                    "deployment {} is already scheduled",
                    deployment_id
                )));
            }

            let (done, finished) = watch::channel(false);
            state.handles.insert(
                deployment_id,
                TaskHandle {
                    deployment_id,
                    service_id: task.service_id(),
                    log_path: task.log_path().to_path_buf(),
                    finished,
                },
            );
            state.queue.push_back(Queued { task, reply, done });
            info!(
                deployment_id = %deployment_id,
                queued = state.queue.len(),
                running = state.running,
                "Build queued"
            );
        }

        self.inner.dispatch();

        Ok(async move {
            receiver
                .await
                .map_err(|_| Error::Internal(format!("build {} was dropped", deployment_id)))?
        })
    }

    /// Handle of a queued or running task.
    pub fn lookup(&self, deployment_id: ResourceId) -> Option<TaskHandle> {
        self.inner.lock().handles.get(&deployment_id).cloned()
    }

    /// (running, queued) task counts.
    pub fn load(&self) -> (usize, usize) {
        let state = self.inner.lock();
        (state.running, state.queue.len())
    }
}
