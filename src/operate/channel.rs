//! RPC channel capability and readiness waiting.
//!
//! Opening a channel never blocks: it only records the target. Connectivity is established by
//! [`RpcChannel::connect`], which [`await_ready`] drives until the channel is ready or a deadline
//! elapses. Once closed, a channel refuses every further use.

use std::{future::Future, net::SocketAddr, time::Duration};

use async_io::Timer;
use async_net::TcpStream;
use futures::{select, FutureExt};
use thiserror::Error;

const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Connectivity of a channel, mirroring the usual RPC channel states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel to {0} is closed")]
    Closed(SocketAddr),
    #[error("channel to {0} is not connected")]
    NotConnected(SocketAddr),
}

/// The channel did not become ready.
#[derive(Debug, Error)]
pub enum NotReady {
    #[error("channel to {addr} not ready within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("channel to {0} was closed while waiting for it")]
    Closed(SocketAddr),
}

/// Channel to one of the worker's RPC endpoints.
pub trait RpcChannel {
    /// Creates the channel without connecting.
    fn open(addr: SocketAddr) -> Self;

    fn addr(&self) -> SocketAddr;

    fn connectivity(&self) -> Connectivity;

    /// Makes one attempt at becoming ready and returns the resulting state.
    fn connect(&mut self) -> impl Future<Output = Connectivity>;

    /// Shuts the channel down for good.
    fn close(&mut self);
}

/// Plain TCP channel.
pub struct TcpChannel {
    addr: SocketAddr,
    state: Connectivity,
    stream: Option<TcpStream>,
}

impl TcpChannel {
    /// The connected stream.
    pub fn stream(&self) -> Result<&TcpStream, ChannelError> {
        match (&self.stream, self.state) {
            (_, Connectivity::Shutdown) => Err(ChannelError::Closed(self.addr)),
            (Some(stream), Connectivity::Ready) => Ok(stream),
            _ => Err(ChannelError::NotConnected(self.addr)),
        }
    }
}

impl RpcChannel for TcpChannel {
    fn open(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: Connectivity::Idle,
            stream: None,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn connectivity(&self) -> Connectivity {
        self.state
    }

    async fn connect(&mut self) -> Connectivity {
        if matches!(self.state, Connectivity::Ready | Connectivity::Shutdown) {
            return self.state;
        }
        self.state = Connectivity::Connecting;
        match TcpStream::connect(self.addr).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = Connectivity::Ready;
            }
            Err(e) => {
                tracing::trace!(addr = %self.addr, "connection attempt failed: {e}");
                self.state = Connectivity::TransientFailure;
            }
        }
        self.state
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = Connectivity::Shutdown;
    }
}

/// Waits until `channel` reports [`Connectivity::Ready`].
///
/// A timeout is a setup failure for the caller; it is not retried here.
pub async fn await_ready<C: RpcChannel>(
    channel: &mut C,
    timeout: Duration,
) -> Result<(), NotReady> {
    let addr = channel.addr();
    let attempts = async {
        loop {
            match channel.connect().await {
                Connectivity::Ready => return Ok(()),
                Connectivity::Shutdown => return Err(NotReady::Closed(addr)),
                _ => {
                    Timer::after(RECONNECT_INTERVAL).await;
                }
            }
        }
    };

    select! {
        res = attempts.fuse() => res,
        _ = Timer::after(timeout).fuse() => Err(NotReady::Timeout { addr, timeout }),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::{Ipv4Addr, TcpListener};

    use assert_matches::assert_matches;
    use futures::executor::block_on;

    use super::*;

    fn unused_addr() -> SocketAddr {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
    }

    #[test]
    fn test_ready_once_endpoint_listens() {
        let addr = unused_addr();
        let mut channel = TcpChannel::open(addr);
        assert_eq!(channel.connectivity(), Connectivity::Idle);
        assert_matches!(channel.stream(), Err(ChannelError::NotConnected(_)));

        let th = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(250));
            let listener = TcpListener::bind(addr).unwrap();
            let _conn = listener.accept().unwrap();
        });

        block_on(await_ready(&mut channel, Duration::from_secs(5))).unwrap();
        assert_eq!(channel.connectivity(), Connectivity::Ready);
        assert!(channel.stream().is_ok());
        th.join().unwrap();
    }

    #[test]
    fn test_times_out_without_endpoint() {
        let addr = unused_addr();
        let mut channel = TcpChannel::open(addr);

        assert_matches!(
            block_on(await_ready(&mut channel, Duration::from_millis(300))),
            Err(NotReady::Timeout { addr: a, .. }) if a == addr
        );
        assert_ne!(channel.connectivity(), Connectivity::Ready);
    }

    #[test]
    fn test_closed_channel_fails_deterministically() {
        let mut channel = TcpChannel::open(unused_addr());
        channel.close();

        assert_matches!(channel.stream(), Err(ChannelError::Closed(_)));
        assert_matches!(
            block_on(await_ready(&mut channel, Duration::from_secs(5))),
            Err(NotReady::Closed(_))
        );
    }
}
