//! Fail-fast check that local ports can be bound.

use std::net::{Ipv4Addr, TcpListener};

use thiserror::Error;

/// A port that could not be bound on the loopback interface.
#[derive(Debug, Error)]
#[error("port {port} is not available: {source}")]
pub struct PortUnavailable {
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}

/// Binds and immediately releases each port, in order.
///
/// Returns the first port that could not be bound.
pub fn ensure_available(ports: impl IntoIterator<Item = u16>) -> Result<(), PortUnavailable> {
    for port in ports {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .map_err(|source| PortUnavailable { port, source })?;
        drop(listener);
    }
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_free_ports_pass() {
        ensure_available([free_port(), free_port()]).unwrap();
    }

    #[test]
    fn test_first_busy_port_is_reported() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        assert_matches!(
            ensure_available([free_port(), busy_port]),
            Err(PortUnavailable { port, .. }) if port == busy_port
        );
    }
}
