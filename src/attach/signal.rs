//! One-shot startup handshake.
//!
//! The harness listens on a loopback port before the worker is spawned. The worker connects to it
//! once it is ready to serve RPCs; the connection itself is the signal and no payload is
//! exchanged.

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener},
    time::Duration,
};

use async_io::{Async, Timer};
use futures::{select, FutureExt};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

/// Only the worker ever connects.
const BACKLOG: i32 = 1;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("unable to listen on handshake port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake listener on port {port} failed: {source}")]
    Accept {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("no handshake on port {port} within {timeout:?}")]
    TimedOut { port: u16, timeout: Duration },
    #[error("handshake signal is {0:?}, not listening")]
    NotListening(SignalState),
}

/// Progress of the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    Bound,
    Listening,
    Signaled,
    TimedOut,
}

/// Listen-then-accept rendezvous with the worker.
pub struct ReadinessSignal {
    state: SignalState,
    port: u16,
    listener: Option<Async<TcpListener>>,
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessSignal {
    /// Creates a new signal, not bound to any port yet.
    pub fn new() -> Self {
        Self {
            state: SignalState::Idle,
            port: 0,
            listener: None,
        }
    }

    /// Current progress of the handshake.
    pub fn state(&self) -> SignalState {
        self.state
    }

    /// Port actually listened on, useful when binding port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Binds the loopback port and starts listening.
    ///
    /// This is synchronous so that the socket is guaranteed to accept connections before the
    /// worker is spawned.
    pub fn bind(&mut self, port: u16) -> Result<(), SignalError> {
        if self.state != SignalState::Idle {
            return Err(SignalError::NotListening(self.state));
        }
        let bind_error = |source| SignalError::Bind { port, source };
        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket
            .bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, port)).into())
            .map_err(bind_error)?;
        self.state = SignalState::Bound;

        socket.listen(BACKLOG).map_err(bind_error)?;
        let listener = Async::new(TcpListener::from(socket)).map_err(bind_error)?;
        self.port = listener
            .get_ref()
            .local_addr()
            .map_err(bind_error)?
            .port();
        self.listener = Some(listener);
        self.state = SignalState::Listening;
        Ok(())
    }

    /// Waits for exactly one inbound connection.
    ///
    /// The listening socket is released whatever the outcome.
    pub async fn await_signal(&mut self, timeout: Duration) -> Result<(), SignalError> {
        let Some(listener) = self.listener.take() else {
            return Err(SignalError::NotListening(self.state));
        };
        let port = self.port;

        let res = select! {
            conn = listener.accept().fuse() => conn
                .map(drop)
                .map_err(|source| SignalError::Accept { port, source }),
            _ = Timer::after(timeout).fuse() => Err(SignalError::TimedOut { port, timeout }),
        };

        self.state = match res {
            Ok(()) => SignalState::Signaled,
            Err(_) => SignalState::TimedOut,
        };
        res
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::TcpStream;

    use assert_matches::assert_matches;
    use futures::executor::block_on;

    use super::*;

    #[test]
    fn test_connection_is_the_signal() {
        let mut signal = ReadinessSignal::new();
        signal.bind(0).unwrap();
        assert_eq!(signal.state(), SignalState::Listening);

        let port = signal.port();
        let th = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        });

        block_on(signal.await_signal(Duration::from_secs(5))).unwrap();
        assert_eq!(signal.state(), SignalState::Signaled);
        th.join().unwrap();

        // The port is released after the handshake.
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn test_no_connection_times_out() {
        let mut signal = ReadinessSignal::new();
        signal.bind(0).unwrap();

        assert_matches!(
            block_on(signal.await_signal(Duration::from_millis(100))),
            Err(SignalError::TimedOut { .. })
        );
        assert_eq!(signal.state(), SignalState::TimedOut);
    }

    #[test]
    fn test_await_without_bind_fails() {
        let mut signal = ReadinessSignal::new();
        assert_matches!(
            block_on(signal.await_signal(Duration::from_millis(10))),
            Err(SignalError::NotListening(SignalState::Idle))
        );
    }

    #[test]
    fn test_busy_port_fails_to_bind() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let mut signal = ReadinessSignal::new();
        assert_matches!(
            signal.bind(busy.local_addr().unwrap().port()),
            Err(SignalError::Bind { .. })
        );
        assert_eq!(signal.state(), SignalState::Idle);
    }

    #[test]
    fn test_second_bind_is_rejected() {
        let mut signal = ReadinessSignal::new();
        signal.bind(0).unwrap();
        assert_matches!(
            signal.bind(0),
            Err(SignalError::NotListening(SignalState::Listening))
        );
    }
}
