//! Shared state behind the IPC server.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::models::lock;
use crate::models::task::TraceTask;
use crate::orchestrator::engine::TraceEngine;

/// Stop attempts per task during shutdown.
const STOP_ATTEMPTS: u32 = 100;
/// Pause between shutdown stop attempts.
const STOP_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Tasks created through the IPC surface, keyed by task id.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: Mutex<HashMap<String, TraceTask>>,
}

impl TaskTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `task`.
    pub fn insert(&self, task: TraceTask) {
        lock(&self.tasks).insert(task.id().to_owned(), task);
    }

    /// Look up a tracked task.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<TraceTask> {
        lock(&self.tasks).get(task_id).cloned()
    }

    /// Stop tracking a task.
    pub fn remove(&self, task_id: &str) -> Option<TraceTask> {
        lock(&self.tasks).remove(task_id)
    }

    /// Every tracked task, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceTask> {
        let mut tasks: Vec<TraceTask> = lock(&self.tasks).values().cloned().collect();
        tasks.sort_by_key(TraceTask::created_at);
        tasks
    }
}

/// State shared by every IPC connection.
#[derive(Debug)]
pub struct AppState {
    /// Engine running the tasks.
    pub engine: TraceEngine,
    /// Tasks created over IPC.
    pub tasks: TaskTable,
    /// Local socket name.
    pub ipc_name: String,
    /// Shared secret required on every request, when set.
    pub ipc_auth_token: Option<String>,
}

impl AppState {
    /// Create state for `engine` with an empty task table.
    #[must_use]
    pub fn new(engine: TraceEngine, ipc_name: String, ipc_auth_token: Option<String>) -> Self {
        Self {
            engine,
            tasks: TaskTable::new(),
            ipc_name,
            ipc_auth_token,
        }
    }

    /// Stop every task the engine still has a channel for.
    ///
    /// Stops run one after another; the engine admits a single stop at a
    /// time, so a task is retried while another stop holds the gate.
    pub async fn stop_all(&self) -> usize {
        let registered = self.engine.registered_task_ids();
        let mut stopped = 0;
        for task_id in registered {
            let Some(task) = self.tasks.get(&task_id) else {
                warn!(task_id = %task_id, "registered task is not tracked over IPC, skipping");
                continue;
            };
            if self.stop_until_released(&task).await {
                self.tasks.remove(&task_id);
                stopped += 1;
            } else {
                warn!(task_id = %task_id, "task still registered after repeated stops");
            }
        }
        info!(stopped, "registered tasks stopped");
        stopped
    }

    async fn stop_until_released(&self, task: &TraceTask) -> bool {
        for _ in 0..STOP_ATTEMPTS {
            self.engine.stop(task).await;
            if !self.engine.is_registered(task) {
                return true;
            }
            tokio::time::sleep(STOP_RETRY_DELAY).await;
        }
        false
    }
}
