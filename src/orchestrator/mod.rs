//! Task lifecycle orchestration.
//!
//! Covers the engine that sequences compile → attach → submit → ready and
//! stop → exit → close, the registry of connected tasks, the listener hub,
//! and the pure reaction to agent commands.

pub mod engine;
pub mod listeners;
pub mod reaction;
pub mod registry;
