//! Agent reader task.
//!
//! Reads newline-delimited JSON from the agent socket, parses each line into
//! an [`AgentCommand`], and forwards it to whichever session queue is
//! currently routed on the channel.
//!
//! # Known inbound methods
//!
//! | Method              | Maps to                                         |
//! |---------------------|-------------------------------------------------|
//! | `success`           | [`AgentCommand::Success`]                       |
//! | `exit`              | [`AgentCommand::Exit`]                          |
//! | `retransform/start` | [`AgentCommand::RetransformationStart`]         |
//! | `retransform/end`   | [`AgentCommand::RetransformationEnd`]           |
//! | `message`           | [`AgentCommand::Message`]                       |
//! | `error`             | [`AgentCommand::Error`]                         |
//! | *(any other)*       | [`AgentCommand::Other`]                         |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::codec::AgentCodec;
use crate::models::command::AgentCommand;
use crate::models::lock;
use crate::{AppError, Result};

/// Slot holding the sender of the session queue currently receiving commands.
pub type CommandRoute = Arc<Mutex<Option<mpsc::Sender<AgentCommand>>>>;

#[derive(Debug, Deserialize)]
struct Envelope {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ExitParams {
    #[serde(default)]
    code: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetransformParams {
    num_classes: u32,
}

#[derive(Debug, Deserialize)]
struct MessageParams {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorParams {
    message: String,
}

/// Parse one NDJSON line from an agent into an [`AgentCommand`].
///
/// - `Ok(Some(command))` for any well-formed envelope, including unknown
///   methods which become [`AgentCommand::Other`].
/// - `Ok(None)` for blank lines.
///
/// # Errors
///
/// - [`AppError::Agent`]`("malformed json: …")` when the line is not JSON.
/// - [`AppError::Agent`]`("missing required field: …")` when a known method
///   lacks a required parameter.
pub fn parse_inbound_line(line: &str) -> Result<Option<AgentCommand>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let envelope: Envelope =
        serde_json::from_str(line).map_err(|e| AppError::Agent(format!("malformed json: {e}")))?;

    let command = match envelope.method.as_str() {
        "success" => AgentCommand::Success,
        "exit" => {
            let code = if envelope.params.is_null() {
                0
            } else {
                params::<ExitParams>("exit", envelope.params)?.code
            };
            AgentCommand::Exit { code }
        }
        "retransform/start" => {
            let p: RetransformParams = params("retransform/start", envelope.params)?;
            AgentCommand::RetransformationStart {
                num_classes: p.num_classes,
            }
        }
        "retransform/end" => AgentCommand::RetransformationEnd,
        "message" => {
            let p: MessageParams = params("message", envelope.params)?;
            AgentCommand::Message { text: p.text }
        }
        "error" => {
            let p: ErrorParams = params("error", envelope.params)?;
            AgentCommand::Error { message: p.message }
        }
        other => AgentCommand::Other {
            method: other.to_owned(),
        },
    };

    Ok(Some(command))
}

/// Agent reader task.
///
/// Each decoded command is delivered to the sender currently held in
/// `route`. When the stream ends (EOF, I/O error, or `cancel`), `connected`
/// is cleared and the route is emptied so the session queue closes.
///
/// Malformed lines and lines over
/// [`MAX_LINE_BYTES`](crate::agent::codec::MAX_LINE_BYTES) are logged and
/// skipped.
pub async fn run_reader<R>(
    label: String,
    stream: R,
    route: CommandRoute,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, AgentCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(endpoint = %label, "agent reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(endpoint = %label, "agent reader: EOF detected");
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(endpoint = %label, error = %e, "agent reader: IO error, stopping");
                        break;
                    }

                    Some(Ok(line)) => match parse_inbound_line(&line) {
                        Ok(Some(command)) => deliver(&label, &route, command).await,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(endpoint = %label, error = %e, raw_line = %line, "agent reader: parse error, skipping line");
                        }
                    },
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    lock(&route).take();
}

async fn deliver(label: &str, route: &CommandRoute, command: AgentCommand) {
    let Some(tx) = lock(route).clone() else {
        debug!(endpoint = %label, kind = command.kind(), "agent reader: no session routed, dropping command");
        return;
    };

    if tx.send(command).await.is_err() {
        debug!(endpoint = %label, "agent reader: session queue closed");
    }
}

fn params<T: serde::de::DeserializeOwned>(method: &str, raw: serde_json::Value) -> Result<T> {
    serde_json::from_value(raw)
        .map_err(|e| AppError::Agent(format!("missing required field: {method} params: {e}")))
}
