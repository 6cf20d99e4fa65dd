//! TCP transport to an attached tracing agent.
//!
//! - `attach`: runs the host attach tool that loads the agent into the target.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based NDJSON framing.
//! - `reader`: parses inbound agent lines into
//!   [`AgentCommand`](crate::models::command::AgentCommand)s.
//! - `writer`: serializes outbound requests.
//! - `channel`: [`TcpAgentChannel`](channel::TcpAgentChannel), the
//!   [`AgentChannel`](crate::driver::AgentChannel) implementation tying them together.

pub mod attach;
pub mod channel;
pub mod codec;
pub mod reader;
pub mod writer;
