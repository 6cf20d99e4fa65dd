//! Trace task lifecycle engine.
//!
//! # Start protocol
//!
//! 1. Compile the script (`Compiling` → `Compiled`); diagnostics go to the
//!    task.
//! 2. Spawn a background session: pick the agent port, reuse the registered
//!    channel or open a new one, attach, wait for the agent to listen, and
//!    submit the payload.
//! 3. The session pumps agent commands through [`ReadyTracker`]. The first
//!    success after a retransformation-start registers the channel, marks the
//!    task `Running`, and releases the caller with `true`. An exit (or a lost
//!    connection) before that releases it with `false`.
//! 4. The caller waits on a one-shot completion; start listeners fire only
//!    after a `true` outcome.
//!
//! # Stop protocol
//!
//! Stops are serialized by one engine-wide gate. The winner removes the
//! registered channel, sends exit, waits briefly, closes it, marks the task
//! `Stopped`, and notifies stop listeners. A stop that finds the gate held
//! returns `true` without acting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::agent::channel::TcpChannelFactory;
use crate::compiler::{CompileRequest, DiagnosticSink, ExternalCompiler, ScriptCompiler};
use crate::config::{GlobalConfig, TimingConfig, TraceSettings};
use crate::driver::{AgentChannel, AttachRequest, ChannelFactory, Endpoint};
use crate::environment::artifacts::{ArtifactLocator, Artifacts};
use crate::environment::eligibility::{EligibilityProvider, NullEligibility, ProcessEligibility};
use crate::environment::toolchain::{ambient_properties, locate_aux_library};
use crate::models::command::AgentCommand;
use crate::models::task::{TaskState, TraceTask};
use crate::orchestrator::listeners::{ListenerHub, TaskListener};
use crate::orchestrator::reaction::{Reaction, ReadyTracker};
use crate::orchestrator::registry::SessionRegistry;
use crate::port;
use crate::Result;

/// Tunables shared by every task the engine runs.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Settle delays, ready timeout, and fallback port.
    pub timings: TimingConfig,
    /// Debug and class dump settings passed to agents.
    pub trace: TraceSettings,
    /// Host properties used when a task carries no toolchain hints.
    pub ambient_properties: HashMap<String, String>,
}

/// Collaborators an engine is assembled from.
pub struct EngineParts {
    /// Resolved agent and client artifacts.
    pub artifacts: Artifacts,
    /// Script compiler.
    pub compiler: Arc<dyn ScriptCompiler>,
    /// Opens agent channels.
    pub channels: Arc<dyn ChannelFactory>,
    /// Target eligibility; `None` makes every pid ineligible.
    pub eligibility: Option<Arc<dyn EligibilityProvider>>,
    /// Engine-wide tunables.
    pub options: EngineOptions,
}

struct EngineInner {
    artifacts: Artifacts,
    compiler: Arc<dyn ScriptCompiler>,
    channels: Arc<dyn ChannelFactory>,
    eligibility: Arc<dyn EligibilityProvider>,
    options: EngineOptions,
    registry: SessionRegistry,
    listeners: ListenerHub,
    stopping: AtomicBool,
}

/// Coordinates trace tasks: creation, start, stop, and events.
///
/// Cheap to clone; clones share the registry, listeners, and stop gate.
#[derive(Clone)]
pub struct TraceEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TraceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEngine")
            .field("artifacts", &self.inner.artifacts)
            .field("registered", &self.inner.registry.len())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl TraceEngine {
    /// Assemble an engine from explicit collaborators.
    #[must_use]
    pub fn new(parts: EngineParts) -> Self {
        let eligibility = parts.eligibility.unwrap_or_else(|| {
            warn!("no eligibility provider installed, no process will be traceable");
            Arc::new(NullEligibility)
        });

        Self {
            inner: Arc::new(EngineInner {
                artifacts: parts.artifacts,
                compiler: parts.compiler,
                channels: parts.channels,
                eligibility,
                options: parts.options,
                registry: SessionRegistry::new(),
                listeners: ListenerHub::new(),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Build the production engine: external compiler, TCP channels, and
    /// process eligibility.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the agent or client artifact is missing.
    /// - `AppError::Config` if the eligibility pattern is invalid.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let locator = ArtifactLocator::new(config.artifact_dirs.clone());
        let artifacts =
            Artifacts::resolve(&locator, &config.agent_artifact, &config.client_artifact)?;
        info!(
            agent = %artifacts.agent_path.display(),
            client = %artifacts.client_path.display(),
            "artifacts resolved"
        );

        let compiler = ExternalCompiler::new(config.compiler.clone(), artifacts.client_path.clone());
        let eligibility = ProcessEligibility::new(&config.eligibility.command_pattern)?;
        let java_home = config.ambient_java_home();

        Ok(Self::new(EngineParts {
            artifacts,
            compiler: Arc::new(compiler),
            channels: Arc::new(TcpChannelFactory::new(config.attach.clone())),
            eligibility: Some(Arc::new(eligibility)),
            options: EngineOptions {
                timings: config.timings.clone(),
                trace: config.trace.clone(),
                ambient_properties: ambient_properties(java_home.as_deref()),
            },
        }))
    }

    /// Create a task for `pid`, or `None` if the process is not traceable.
    #[must_use]
    pub fn create_task(&self, pid: u32) -> Option<TraceTask> {
        if self.inner.eligibility.can_be_traced(pid) {
            let task = TraceTask::new(pid);
            debug!(task_id = task.id(), pid, "trace task created");
            Some(task)
        } else {
            debug!(pid, "process is not traceable");
            None
        }
    }

    /// Compile, deploy, and wait until `task`'s agent is ready.
    ///
    /// Returns `true` once the agent reports ready; `false` on compile,
    /// attach, or submit failure, on agent exit before ready, or when the
    /// configured ready timeout elapses.
    pub async fn start(&self, task: &TraceTask) -> bool {
        let span = info_span!("start_task", task_id = task.id(), pid = task.pid());
        async {
            let started = self.start_inner(task).await;
            if started {
                info!("trace task started");
                self.inner.listeners.notify_start(task);
            } else {
                warn!("trace task failed to start");
            }
            started
        }
        .instrument(span)
        .await
    }

    /// Stop `task`'s agent session.
    ///
    /// Always returns `true`. When another stop holds the engine-wide gate
    /// this call does nothing.
    pub async fn stop(&self, task: &TraceTask) -> bool {
        let span = info_span!("stop_task", task_id = task.id(), pid = task.pid());
        async {
            let Some(_gate) = StopGate::try_acquire(&self.inner.stopping) else {
                debug!("another stop is in progress, skipping");
                return true;
            };

            self.shutdown_channel(task).await;
            task.set_state(TaskState::Stopped);
            info!("trace task stopped");
            self.inner.listeners.notify_stop(task);
            true
        }
        .instrument(span)
        .await
    }

    /// Fire a named (or anonymous) event in `task`'s running script.
    ///
    /// Silently ignored when the task has no registered channel.
    pub async fn send_event(&self, task: &TraceTask, name: Option<&str>) {
        match self.inner.registry.get(task.id()) {
            Some(channel) => {
                debug!(task_id = task.id(), event = ?name, "sending event");
                channel.send_event(name).await;
            }
            None => {
                debug!(task_id = task.id(), event = ?name, "no agent channel registered, event dropped");
            }
        }
    }

    /// Register a lifecycle listener; registering the same listener twice
    /// has no effect.
    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.inner.listeners.subscribe(listener);
    }

    /// Remove a lifecycle listener.
    pub fn remove_listener(&self, listener: &Arc<dyn TaskListener>) {
        self.inner.listeners.unsubscribe(listener);
    }

    /// Whether `task` has a registered, ready agent channel.
    #[must_use]
    pub fn is_registered(&self, task: &TraceTask) -> bool {
        self.inner.registry.contains(task.id())
    }

    /// Ids of every task with a registered channel.
    #[must_use]
    pub fn registered_task_ids(&self) -> Vec<String> {
        self.inner.registry.task_ids()
    }

    /// Resolved agent and client artifacts.
    #[must_use]
    pub fn artifacts(&self) -> &Artifacts {
        &self.inner.artifacts
    }

    async fn start_inner(&self, task: &TraceTask) -> bool {
        let config = task.config();
        let aux_classpath = locate_aux_library(
            &config.system_properties,
            &self.inner.options.ambient_properties,
            Path::exists,
        );

        task.set_state(TaskState::Compiling);
        let request = CompileRequest {
            script: config.script,
            classpath: config.classpath,
            unsafe_mode: config.unsafe_mode,
            aux_classpath: aux_classpath.clone(),
        };
        let payload = match self.inner.compiler.compile(&request, task).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "script compilation failed");
                task.report(&err.to_string());
                return false;
            }
        };
        task.set_state(TaskState::Compiled);
        debug!(bytes = payload.len(), "script compiled");

        let (tx, rx) = oneshot::channel();
        let session = StartSession {
            engine: self.clone(),
            task: task.clone(),
            payload,
            args: config.args,
            aux_classpath,
            unsafe_mode: config.unsafe_mode,
            completion: Completion(Some(tx)),
        };
        tokio::spawn(session.run().instrument(Span::current()));

        let outcome = match self.inner.options.timings.ready_timeout() {
            None => rx.await,
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, rx).await {
                    outcome
                } else {
                    warn!(?limit, "agent did not become ready in time");
                    return false;
                }
            }
        };

        outcome.unwrap_or_else(|_| {
            warn!("start session ended without an outcome");
            false
        })
    }

    async fn shutdown_channel(&self, task: &TraceTask) {
        let Some(channel) = self.inner.registry.remove(task.id()) else {
            debug!("no agent channel registered");
            return;
        };

        match channel.send_exit(0).await {
            Ok(()) => tokio::time::sleep(self.inner.options.timings.exit_settle()).await,
            Err(err) => debug!(%err, "exit request failed, closing anyway"),
        }
        channel.close().await;
        debug!(endpoint = %channel.endpoint(), "agent channel released");
    }
}

/// Engine-wide stop gate; only the holder may run a stop sequence.
struct StopGate<'a>(&'a AtomicBool);

impl<'a> StopGate<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for StopGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One-shot start outcome; resolved at most once.
struct Completion(Option<oneshot::Sender<bool>>);

impl Completion {
    fn resolve(&mut self, started: bool) {
        if let Some(tx) = self.0.take() {
            if tx.send(started).is_err() {
                debug!(started, "start caller is no longer waiting");
            }
        }
    }

    fn is_abandoned(&self) -> bool {
        self.0.as_ref().is_some_and(oneshot::Sender::is_closed)
    }
}

/// Background half of a start: deploy the payload and pump agent commands.
struct StartSession {
    engine: TraceEngine,
    task: TraceTask,
    payload: Vec<u8>,
    args: Vec<String>,
    aux_classpath: Option<PathBuf>,
    unsafe_mode: bool,
    completion: Completion,
}

impl StartSession {
    async fn run(mut self) {
        let inner = Arc::clone(&self.engine.inner);

        let (channel, reused) = match inner.registry.get(self.task.id()) {
            Some(existing) => {
                debug!(endpoint = %existing.endpoint(), "reusing registered agent channel");
                (existing, true)
            }
            None => {
                let port = self
                    .task
                    .port_override()
                    .unwrap_or_else(|| port::allocate(inner.options.timings.fallback_port));
                (inner.channels.open(Endpoint::local(port), &inner.options.trace), false)
            }
        };

        let request = AttachRequest {
            pid: self.task.pid(),
            agent_path: inner.artifacts.agent_path.clone(),
            aux_classpath: self.aux_classpath.take(),
            unsafe_mode: self.unsafe_mode,
            extra_options: None,
        };

        if let Err(err) = channel.attach(&request).await {
            warn!(%err, "agent attach failed");
            self.task.report(&err.to_string());
            self.completion.resolve(false);
            return;
        }

        tokio::time::sleep(inner.options.timings.attach_settle()).await;

        let commands = match channel.submit(&self.payload, &self.args).await {
            Ok(commands) => commands,
            Err(err) => {
                warn!(%err, "payload submission failed");
                self.task.report(&err.to_string());
                if !reused {
                    channel.close().await;
                }
                self.completion.resolve(false);
                return;
            }
        };
        debug!(endpoint = %channel.endpoint(), "payload submitted, awaiting agent");

        self.pump(commands, &channel).await;

        self.completion.resolve(false);
        self.finish(&channel).await;
    }

    async fn pump(
        &mut self,
        mut commands: mpsc::Receiver<AgentCommand>,
        channel: &Arc<dyn AgentChannel>,
    ) {
        let registry = &self.engine.inner.registry;
        let mut tracker = ReadyTracker::default();

        while let Some(command) = commands.recv().await {
            debug!(kind = command.kind(), "agent command received");
            match tracker.react(&command) {
                Reaction::Ready if self.completion.is_abandoned() => {
                    warn!("agent became ready after the caller gave up, closing");
                    self.task.dispatch(command);
                    channel.close().await;
                    continue;
                }
                Reaction::Ready => {
                    if let Some(replaced) = registry.insert(self.task.id(), Arc::clone(channel)) {
                        if !Arc::ptr_eq(&replaced, channel) {
                            warn!(endpoint = %replaced.endpoint(), "replacing live agent channel");
                            replaced.close().await;
                        }
                    }
                    self.task.set_state(TaskState::Running);
                    self.completion.resolve(true);
                }
                Reaction::Exit { code } => {
                    info!(code, "agent exited");
                    self.completion.resolve(false);
                    self.engine.stop(&self.task).await;
                    // Stop only releases registered channels.
                    channel.close().await;
                }
                Reaction::Retransforming { num_classes } => {
                    debug!(num_classes, "agent retransforming classes");
                    self.task.set_instr_classes(num_classes);
                    self.task.set_state(TaskState::Instrumenting);
                }
                Reaction::Forward => {}
            }
            self.task.dispatch(command);
        }
    }

    /// Runs once the command queue closes.
    async fn finish(&self, channel: &Arc<dyn AgentChannel>) {
        let registry = &self.engine.inner.registry;
        if registry.is_registered_with(self.task.id(), channel) {
            // A connected channel means a newer submit took over the route.
            if !channel.is_connected() {
                warn!("agent connection lost, stopping task");
                self.engine.stop(&self.task).await;
            }
        } else {
            channel.close().await;
        }
    }
}
