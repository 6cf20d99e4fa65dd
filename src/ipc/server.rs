//! Local IPC server for `trace-engine-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the engine.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "start", "pid": 4242, "script": "...", "classpath": ["/app/lib"], "unsafe": false}
//! {"command": "event", "task_id": "…", "name": "dump"}
//! {"command": "stop", "task_id": "…"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: task …"}
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::ipc::state::AppState;
use crate::models::task::TraceTask;
use crate::{AppError, Result};

/// Inbound IPC request from `trace-engine-ctl`.
#[derive(Debug, Default, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Target process (for `start`).
    pid: Option<u32>,
    /// Script source text (for `start`).
    script: Option<String>,
    /// Compile classpath (for `start`).
    #[serde(default)]
    classpath: Vec<PathBuf>,
    /// Compile in unsafe mode (for `start`).
    #[serde(default, rename = "unsafe")]
    unsafe_mode: bool,
    /// Task property overrides (for `start`).
    #[serde(default)]
    properties: HashMap<String, String>,
    /// Script arguments (for `start`).
    #[serde(default)]
    args: Vec<String>,
    /// Task identifier (for `stop`, `event`).
    task_id: Option<String>,
    /// Event name (for `event`).
    name: Option<String>,
    /// Shared-secret authentication token.
    auth_token: Option<String>,
}

/// Outbound IPC response to `trace-engine-ctl`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(err: &AppError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, Arc::clone(&state)));
                            }
                            Err(err) => warn!(%err, "IPC accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<AppState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = dispatch_line(&state, &line).await;
            let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
            });
            response_line.push('\n');

            if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                warn!(%err, "failed to write ipc response");
                break;
            }
        }

        debug!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Parse one request line, authenticate it, and run the command.
pub async fn dispatch_line(state: &AppState, line: &str) -> IpcResponse {
    let request = match serde_json::from_str::<IpcRequest>(line.trim()) {
        Ok(request) => request,
        Err(err) => return IpcResponse::failure(&AppError::Ipc(format!("invalid json: {err}"))),
    };

    let span = info_span!("ipc_command", command = %request.command);
    match dispatch_command(&request, state).instrument(span).await {
        Ok(data) => IpcResponse::success(data),
        Err(err) => {
            warn!(command = %request.command, %err, "IPC command failed");
            IpcResponse::failure(&err)
        }
    }
}

async fn dispatch_command(request: &IpcRequest, state: &AppState) -> Result<serde_json::Value> {
    if let Some(ref expected) = state.ipc_auth_token {
        match request.auth_token {
            Some(ref provided) if provided == expected => {}
            _ => return Err(AppError::Unauthorized("invalid auth token".into())),
        }
    }

    match request.command.as_str() {
        "list" => Ok(handle_list(state)),
        "start" => handle_start(request, state).await,
        "stop" => handle_stop(request, state).await,
        "event" => handle_event(request, state).await,
        other => Err(AppError::Ipc(format!("unknown command: {other}"))),
    }
}

fn describe(task: &TraceTask, state: &AppState) -> serde_json::Value {
    json!({
        "task_id": task.id(),
        "pid": task.pid(),
        "state": task.state(),
        "instr_classes": task.instr_classes(),
        "registered": state.engine.is_registered(task),
        "created_at": task.created_at().to_rfc3339(),
    })
}

fn handle_list(state: &AppState) -> serde_json::Value {
    let items: Vec<serde_json::Value> = state
        .tasks
        .snapshot()
        .iter()
        .map(|task| describe(task, state))
        .collect();
    json!({ "tasks": items })
}

async fn handle_start(request: &IpcRequest, state: &AppState) -> Result<serde_json::Value> {
    let pid = request
        .pid
        .ok_or_else(|| AppError::Ipc("missing required 'pid' field".into()))?;
    let script = request
        .script
        .as_ref()
        .ok_or_else(|| AppError::Ipc("missing required 'script' field".into()))?;

    let task = state
        .engine
        .create_task(pid)
        .ok_or_else(|| AppError::NotFound(format!("process {pid} is not traceable")))?;

    task.set_script(script.clone());
    task.set_classpath(request.classpath.clone());
    task.set_unsafe(request.unsafe_mode);
    task.set_args(request.args.clone());
    for (key, value) in &request.properties {
        task.set_property(key.clone(), value.clone());
    }

    state.tasks.insert(task.clone());
    if state.engine.start(&task).await {
        info!(task_id = task.id(), pid, "task started via IPC");
        Ok(describe(&task, state))
    } else {
        state.tasks.remove(task.id());
        Err(AppError::Agent(format!("task {} for pid {pid} failed to start", task.id())))
    }
}

async fn handle_stop(request: &IpcRequest, state: &AppState) -> Result<serde_json::Value> {
    let task = lookup_task(request, state)?;
    state.engine.stop(&task).await;
    if state.engine.is_registered(&task) {
        return Err(AppError::Agent(format!(
            "another stop is in progress, retry stopping task {}",
            task.id()
        )));
    }
    state.tasks.remove(task.id());
    info!(task_id = task.id(), "task stopped via IPC");
    Ok(describe(&task, state))
}

async fn handle_event(request: &IpcRequest, state: &AppState) -> Result<serde_json::Value> {
    let task = lookup_task(request, state)?;
    state.engine.send_event(&task, request.name.as_deref()).await;
    Ok(json!({ "task_id": task.id(), "event": request.name }))
}

fn lookup_task(request: &IpcRequest, state: &AppState) -> Result<TraceTask> {
    let task_id = request
        .task_id
        .as_ref()
        .ok_or_else(|| AppError::Ipc("missing required 'task_id' field".into()))?;
    state
        .tasks
        .get(task_id)
        .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))
}
