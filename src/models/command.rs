//! Commands received asynchronously from an attached agent.

use serde::Serialize;

/// One protocol message emitted by the agent.
///
/// Only `Success`, `Exit` and `RetransformationStart` drive the task state
/// machine; every variant is forwarded to the task's event sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Acknowledgment of the last submitted request.
    Success,
    /// The agent is shutting down.
    Exit {
        /// Exit code reported by the agent.
        code: i32,
    },
    /// The agent began re-instrumenting already-loaded classes.
    RetransformationStart {
        /// Number of classes about to be retransformed.
        num_classes: u32,
    },
    /// Retransformation of loaded classes finished.
    RetransformationEnd,
    /// Output produced by the running script.
    Message {
        /// Message text.
        text: String,
    },
    /// Agent-side failure report.
    Error {
        /// Error description.
        message: String,
    },
    /// A command this layer does not interpret.
    Other {
        /// Wire method name.
        method: String,
    },
}

impl AgentCommand {
    /// Short stable name used in logs.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Exit { .. } => "exit",
            Self::RetransformationStart { .. } => "retransform/start",
            Self::RetransformationEnd => "retransform/end",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
            Self::Other { method } => method,
        }
    }
}
