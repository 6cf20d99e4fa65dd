//! Transport-agnostic agent channel abstraction.
//!
//! The [`AgentChannel`] trait decouples the task lifecycle coordinator from
//! the wire connection to an attached agent. The coordinator only ever talks
//! to agents through this trait; the TCP implementation lives in
//! [`crate::agent::channel`], and tests substitute scripted fakes.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::TraceSettings;
use crate::models::command::AgentCommand;
use crate::Result;

/// Network location of an agent's command listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Loopback endpoint on `port`.
    #[must_use]
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything the host environment needs to load an agent into a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    /// Target process identifier.
    pub pid: u32,
    /// Installed agent artifact.
    pub agent_path: PathBuf,
    /// Auxiliary compiler library on the target host, if located.
    pub aux_classpath: Option<PathBuf>,
    /// Whether the script was compiled in unsafe mode.
    pub unsafe_mode: bool,
    /// Extra agent options appended verbatim.
    pub extra_options: Option<String>,
}

/// One live connection to one agent instance.
///
/// All operations perform network or process I/O. Commands delivered through
/// the receiver returned by [`submit`](AgentChannel::submit) arrive in the
/// order the agent emitted them; the receiver closes when the connection ends
/// or when a later `submit` takes over the routing.
pub trait AgentChannel: Send + Sync {
    /// Where the agent listens.
    fn endpoint(&self) -> &Endpoint;

    /// Load the agent into the target process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Attach`](crate::AppError::Attach) when the host
    /// environment refuses or fails to load the agent.
    fn attach<'a>(&'a self, request: &'a AttachRequest) -> BoxFuture<'a, Result<()>>;

    /// Transmit a compiled payload and start receiving agent commands.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) if the connection
    /// cannot be established or the payload cannot be written.
    fn submit<'a>(
        &'a self,
        payload: &'a [u8],
        args: &'a [String],
    ) -> BoxFuture<'a, Result<mpsc::Receiver<AgentCommand>>>;

    /// Ask the agent to shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Agent`](crate::AppError::Agent) if the request
    /// cannot be written.
    fn send_exit(&self, code: i32) -> BoxFuture<'_, Result<()>>;

    /// Fire an out-of-band event; failures are logged, never returned.
    fn send_event<'a>(&'a self, name: Option<&'a str>) -> BoxFuture<'a, ()>;

    /// Release the connection. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Whether the underlying connection is still open.
    fn is_connected(&self) -> bool;

    /// Whether a payload submission has completed on this channel.
    fn is_submitted(&self) -> bool;
}

/// Creates fresh channels for tasks that have no registered handle.
pub trait ChannelFactory: Send + Sync {
    /// Build an unconnected channel for `endpoint`.
    fn open(&self, endpoint: Endpoint, settings: &TraceSettings) -> Arc<dyn AgentChannel>;
}
