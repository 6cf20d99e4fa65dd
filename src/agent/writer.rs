//! Outbound agent requests.
//!
//! Each request is one compact JSON object terminated by `\n`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A request sent from the engine to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound<'a> {
    /// Install a compiled payload.
    Instrument {
        /// Compiled instrumentation payload.
        code: &'a [u8],
        /// Script arguments.
        args: &'a [String],
    },
    /// Shut the agent down.
    Exit {
        /// Exit code to report.
        code: i32,
    },
    /// Fire a named (or anonymous) event in the running script.
    Event {
        /// Event name; `None` fires the default handler.
        name: Option<&'a str>,
    },
}

impl Outbound<'_> {
    /// Wire method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Instrument { .. } => "instrument",
            Self::Exit { .. } => "exit",
            Self::Event { .. } => "event",
        }
    }

    /// JSON envelope for this request.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let params = match self {
            Self::Instrument { code, args } => json!({
                "code": STANDARD.encode(code),
                "args": args,
            }),
            Self::Exit { code } => json!({ "code": code }),
            Self::Event { name } => json!({ "name": name }),
        };
        json!({ "method": self.method(), "params": params })
    }
}

/// Serialize `request`, append `\n`, and write it to `writer`.
///
/// # Errors
///
/// Returns the underlying I/O error if the write or flush fails.
pub async fn write_request<W>(writer: &mut W, request: &Outbound<'_>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(&request.to_value()).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("json serialisation failed: {e}"),
        )
    })?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}
