#![forbid(unsafe_code)]

//! Coordination layer for dynamic instrumentation sessions.
//!
//! A [`TraceEngine`](orchestrator::engine::TraceEngine) compiles a tracing
//! script, attaches an agent to a running process, exchanges the agent's
//! command protocol over a local socket, and reports start/stop transitions
//! to registered listeners.

pub mod agent;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod environment;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod port;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
