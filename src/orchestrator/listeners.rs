//! Task start/stop observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::models::lock;
use crate::models::task::TraceTask;

/// Observer of committed task lifecycle transitions.
pub trait TaskListener: Send + Sync {
    /// A task's agent acknowledged readiness.
    fn on_task_start(&self, task: &TraceTask);

    /// A task's shutdown sequence ran.
    fn on_task_stop(&self, task: &TraceTask);
}

/// Lock-guarded listener set with isolated fan-out.
///
/// Subscribe, unsubscribe and both notifications are mutually exclusive.
/// Delivery follows subscription order; a panicking listener is logged and
/// skipped so the remaining listeners are still notified.
#[derive(Default)]
pub struct ListenerHub {
    listeners: Mutex<Vec<Arc<dyn TaskListener>>>,
}

impl ListenerHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener`; subscribing the same listener twice is a no-op.
    pub fn subscribe(&self, listener: Arc<dyn TaskListener>) {
        let mut listeners = lock(&self.listeners);
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove `listener` if present.
    pub fn unsubscribe(&self, listener: &Arc<dyn TaskListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Number of subscribed listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Whether no listener is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.listeners).is_empty()
    }

    /// Notify every listener that `task` started.
    pub fn notify_start(&self, task: &TraceTask) {
        self.fan_out(task, "start", |l, t| l.on_task_start(t));
    }

    /// Notify every listener that `task` stopped.
    pub fn notify_stop(&self, task: &TraceTask) {
        self.fan_out(task, "stop", |l, t| l.on_task_stop(t));
    }

    fn fan_out<F>(&self, task: &TraceTask, transition: &str, deliver: F)
    where
        F: Fn(&dyn TaskListener, &TraceTask),
    {
        let listeners = lock(&self.listeners);
        for (index, listener) in listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref(), task)));
            if outcome.is_err() {
                warn!(task_id = %task.id(), transition, index, "task listener panicked");
            }
        }
    }
}

/// Listener that records lifecycle transitions in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl TaskListener for LoggingListener {
    fn on_task_start(&self, task: &TraceTask) {
        info!(
            task_id = %task.id(),
            pid = task.pid(),
            instr_classes = task.instr_classes(),
            "task started"
        );
    }

    fn on_task_stop(&self, task: &TraceTask) {
        info!(task_id = %task.id(), pid = task.pid(), "task stopped");
    }
}
