use trace_engine::port::{allocate, allocate_with};

#[test]
fn allocates_an_ephemeral_port() {
    assert_ne!(allocate(3456), 0);
}

#[test]
fn probe_failure_uses_fallback() {
    let port = allocate_with(|| Err(std::io::Error::other("no sockets")), 3456);
    assert_eq!(port, 3456);
}

#[test]
fn probed_port_is_returned() {
    assert_eq!(allocate_with(|| Ok(41000), 3456), 41000);
}
