//! TCP implementation of [`AgentChannel`].
//!
//! # Connection lifecycle
//!
//! 1. [`attach`](AgentChannel::attach) runs the host attach tool; the agent
//!    starts listening on the endpoint port.
//! 2. [`submit`](AgentChannel::submit) connects (first time only), spawns the
//!    reader task, routes inbound commands to a fresh session queue, and
//!    writes the `instrument` request.
//! 3. `send_exit` / `send_event` write control requests on the same socket.
//! 4. [`close`](AgentChannel::close) cancels the reader and shuts the write
//!    half down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::attach::run_attach;
use crate::agent::reader::{run_reader, CommandRoute};
use crate::agent::writer::{write_request, Outbound};
use crate::config::{AttachConfig, TraceSettings};
use crate::driver::{AgentChannel, AttachRequest, ChannelFactory, Endpoint};
use crate::models::command::AgentCommand;
use crate::models::lock;
use crate::{AppError, Result};

/// Capacity of each session's inbound command queue.
const COMMAND_BUFFER: usize = 64;

/// Bound on establishing the TCP connection to the agent.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent connection over a loopback TCP socket.
#[derive(Debug)]
pub struct TcpAgentChannel {
    endpoint: Endpoint,
    settings: TraceSettings,
    attach: AttachConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    route: CommandRoute,
    connected: Arc<AtomicBool>,
    submitted: AtomicBool,
    reader_cancel: Mutex<Option<CancellationToken>>,
}

impl TcpAgentChannel {
    /// Create an unconnected channel.
    #[must_use]
    pub fn new(endpoint: Endpoint, settings: TraceSettings, attach: AttachConfig) -> Self {
        Self {
            endpoint,
            settings,
            attach,
            writer: tokio::sync::Mutex::new(None),
            route: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            submitted: AtomicBool::new(false),
            reader_cancel: Mutex::new(None),
        }
    }

    /// Debug and dump settings this channel attaches with.
    #[must_use]
    pub fn settings(&self) -> &TraceSettings {
        &self.settings
    }

    async fn connect(&self) -> Result<()> {
        let address = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| {
                AppError::Agent(format!(
                    "connect to {} timed out after {CONNECT_TIMEOUT:?}",
                    self.endpoint
                ))
            })?
            .map_err(|err| AppError::Agent(format!("connect to {} failed: {err}", self.endpoint)))?;

        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();

        *self.writer.lock().await = Some(write_half);
        *lock(&self.reader_cancel) = Some(cancel.clone());
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(run_reader(
            self.endpoint.to_string(),
            read_half,
            Arc::clone(&self.route),
            Arc::clone(&self.connected),
            cancel,
        ));

        info!(endpoint = %self.endpoint, "connected to agent");
        Ok(())
    }

    async fn write(&self, request: Outbound<'_>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(AppError::Agent(format!(
                "write failed: not connected to {}",
                self.endpoint
            )));
        };

        write_request(writer, &request).await.map_err(|err| {
            AppError::Agent(format!(
                "write of {} to {} failed: {err}",
                request.method(),
                self.endpoint
            ))
        })
    }
}

impl AgentChannel for TcpAgentChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn attach<'a>(&'a self, request: &'a AttachRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.is_connected() {
                debug!(endpoint = %self.endpoint, pid = request.pid, "agent already attached, skipping attach");
                return Ok(());
            }
            run_attach(&self.attach, &self.endpoint, &self.settings, request).await
        })
    }

    fn submit<'a>(
        &'a self,
        payload: &'a [u8],
        args: &'a [String],
    ) -> BoxFuture<'a, Result<mpsc::Receiver<AgentCommand>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(COMMAND_BUFFER);

            // Route before connecting so no early command is dropped. Replacing
            // an older sender closes the previous session queue.
            *lock(&self.route) = Some(tx);

            if !self.is_connected() {
                if let Err(err) = self.connect().await {
                    lock(&self.route).take();
                    return Err(err);
                }
            }

            self.write(Outbound::Instrument {
                code: payload,
                args,
            })
            .await?;

            self.submitted.store(true, Ordering::SeqCst);
            debug!(endpoint = %self.endpoint, bytes = payload.len(), "payload submitted");
            Ok(rx)
        })
    }

    fn send_exit(&self, code: i32) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.write(Outbound::Exit { code }).await })
    }

    fn send_event<'a>(&'a self, name: Option<&'a str>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = self.write(Outbound::Event { name }).await {
                warn!(endpoint = %self.endpoint, event = ?name, %err, "failed to send event");
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(cancel) = lock(&self.reader_cancel).take() {
                cancel.cancel();
            }

            if let Some(mut writer) = self.writer.lock().await.take() {
                if let Err(err) = writer.shutdown().await {
                    debug!(endpoint = %self.endpoint, %err, "agent socket shutdown failed");
                }
            }

            self.connected.store(false, Ordering::SeqCst);
            lock(&self.route).take();
            debug!(endpoint = %self.endpoint, "agent channel closed");
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::SeqCst)
    }
}

/// Opens [`TcpAgentChannel`]s sharing one attach configuration.
#[derive(Debug, Clone)]
pub struct TcpChannelFactory {
    attach: AttachConfig,
}

impl TcpChannelFactory {
    /// Create a factory using `attach` for every channel.
    #[must_use]
    pub fn new(attach: AttachConfig) -> Self {
        Self { attach }
    }
}

impl ChannelFactory for TcpChannelFactory {
    fn open(&self, endpoint: Endpoint, settings: &TraceSettings) -> Arc<dyn AgentChannel> {
        Arc::new(TcpAgentChannel::new(
            endpoint,
            settings.clone(),
            self.attach.clone(),
        ))
    }
}
