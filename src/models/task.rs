//! Trace task model and lifecycle helpers.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::command::AgentCommand;
use super::lock;
use crate::compiler::DiagnosticSink;

/// System property carrying an explicit agent port for a task.
pub const PORT_PROPERTY: &str = "agent.port";

/// Capacity of the per-task event broadcast buffer.
const EVENT_BUFFER: usize = 256;

/// Lifecycle state of a trace task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task created, nothing attempted yet.
    Created,
    /// Script is being compiled.
    Compiling,
    /// Script compiled; agent not yet acknowledged.
    Compiled,
    /// Agent is retransforming loaded classes.
    Instrumenting,
    /// Agent acknowledged the payload; session is live.
    Running,
    /// Session shut down.
    Stopped,
}

/// Observable happenings on a task, fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task moved to a new lifecycle state.
    StateChanged(TaskState),
    /// A compiler diagnostic line.
    Diagnostic(String),
    /// A command received from the agent.
    Command(AgentCommand),
}

/// Caller-editable inputs of a task, snapshotted at each start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskConfig {
    /// Tracing script source text.
    pub script: String,
    /// Classpath handed to the compiler.
    pub classpath: Vec<PathBuf>,
    /// Allow unsafe script constructs.
    pub unsafe_mode: bool,
    /// Target runtime properties (e.g., `java.home`, `os.name`).
    pub system_properties: HashMap<String, String>,
    /// Arguments passed to the script on submission.
    pub args: Vec<String>,
}

struct TaskInner {
    id: String,
    pid: u32,
    created_at: DateTime<Utc>,
    config: Mutex<TaskConfig>,
    state: Mutex<TaskState>,
    instr_classes: AtomicU32,
    events: broadcast::Sender<TaskEvent>,
}

/// One requested instrumentation session against a target process.
///
/// Cheap to clone; all clones refer to the same task. Equality and hashing
/// use the task identifier only.
#[derive(Clone)]
pub struct TraceTask {
    inner: Arc<TaskInner>,
}

impl TraceTask {
    /// Construct a task for `pid` with a generated identifier.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4().to_string(),
                pid,
                created_at: Utc::now(),
                config: Mutex::new(TaskConfig::default()),
                state: Mutex::new(TaskState::Created),
                instr_classes: AtomicU32::new(0),
                events,
            }),
        }
    }

    /// Unique task identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Target process identifier.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        *lock(&self.inner.state)
    }

    /// Number of classes announced by the last retransformation.
    #[must_use]
    pub fn instr_classes(&self) -> u32 {
        self.inner.instr_classes.load(Ordering::SeqCst)
    }

    /// Snapshot of the caller-editable inputs.
    #[must_use]
    pub fn config(&self) -> TaskConfig {
        lock(&self.inner.config).clone()
    }

    /// Replace the script source.
    pub fn set_script(&self, script: impl Into<String>) {
        lock(&self.inner.config).script = script.into();
    }

    /// Replace the compile classpath.
    pub fn set_classpath(&self, classpath: Vec<PathBuf>) {
        lock(&self.inner.config).classpath = classpath;
    }

    /// Toggle unsafe mode.
    pub fn set_unsafe(&self, unsafe_mode: bool) {
        lock(&self.inner.config).unsafe_mode = unsafe_mode;
    }

    /// Set one target system property.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.inner.config)
            .system_properties
            .insert(key.into(), value.into());
    }

    /// Replace the script arguments.
    pub fn set_args(&self, args: Vec<String>) {
        lock(&self.inner.config).args = args;
    }

    /// Explicit agent port from [`PORT_PROPERTY`], if set and valid.
    #[must_use]
    pub fn port_override(&self) -> Option<u16> {
        lock(&self.inner.config)
            .system_properties
            .get(PORT_PROPERTY)
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// Subscribe to this task's events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn set_state(&self, next: TaskState) {
        {
            let mut state = lock(&self.inner.state);
            if *state == next {
                return;
            }
            *state = next;
        }
        debug!(task_id = %self.id(), state = ?next, "task state changed");
        self.publish(TaskEvent::StateChanged(next));
    }

    pub(crate) fn set_instr_classes(&self, count: u32) {
        self.inner.instr_classes.store(count, Ordering::SeqCst);
    }

    /// Forward an agent command to subscribers.
    pub(crate) fn dispatch(&self, command: AgentCommand) {
        self.publish(TaskEvent::Command(command));
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl DiagnosticSink for TraceTask {
    fn report(&self, line: &str) {
        debug!(task_id = %self.id(), diagnostic = line, "compiler diagnostic");
        self.publish(TaskEvent::Diagnostic(line.to_owned()));
    }
}

impl PartialEq for TraceTask {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for TraceTask {}

impl Hash for TraceTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for TraceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceTask")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
