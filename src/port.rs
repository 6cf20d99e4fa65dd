//! Local port selection for agent communication.

use std::net::{Ipv4Addr, TcpListener};

use tracing::warn;

/// Pick a free loopback port for the agent to listen on.
///
/// Binds an ephemeral listener, reads back the assigned port, and releases
/// it immediately. Falls back to `fallback` when probing fails; a later
/// connection failure on that port is an ordinary start failure.
#[must_use]
pub fn allocate(fallback: u16) -> u16 {
    allocate_with(probe_ephemeral_port, fallback)
}

/// [`allocate`] with an injectable probe.
#[must_use]
pub fn allocate_with<F>(probe: F, fallback: u16) -> u16
where
    F: FnOnce() -> std::io::Result<u16>,
{
    match probe() {
        Ok(port) if port != 0 => port,
        Ok(_) => {
            warn!(fallback, "port probe returned 0, using fallback port");
            fallback
        }
        Err(err) => {
            warn!(%err, fallback, "port probe failed, using fallback port");
            fallback
        }
    }
}

fn probe_ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
