//! Cap'n Proto RPC over a worker channel.
//!
//! [`CapnpChannel`] is a [`TcpChannel`] that can hand out RPC sessions once connected.
//! [`client_connection`] wires any pair of communication streams into an RPC system and exposes the
//! worker's bootstrap capability, which typed service wrappers are built upon.

use std::{future::Future, net::SocketAddr};

use capnp::capability::Client;
use capnp_rpc::{rpc_twoparty_capnp, twoparty, RpcSystem};
use futures::{
    io::{BufReader, BufWriter},
    AsyncRead, AsyncWrite,
};

use crate::operate::channel::{ChannelError, Connectivity, RpcChannel, TcpChannel};

/// Creates a RPC client connection.
///
/// The communication goes through the passed input and output.
///
/// The returned value is made of a system to be run by the async runtime and the worker's
/// bootstrap capability.
pub fn client_connection<R, W>(
    input: R,
    output: W,
) -> (RpcSystem<rpc_twoparty_capnp::Side>, Client)
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let network = twoparty::VatNetwork::new(
        BufReader::new(input),
        BufWriter::new(output),
        rpc_twoparty_capnp::Side::Client,
        Default::default(),
    );
    let mut rpc_system = RpcSystem::new(Box::new(network), None);
    let bootstrap: Client = rpc_system.bootstrap(rpc_twoparty_capnp::Side::Server);
    (rpc_system, bootstrap)
}

/// Channel speaking Cap'n Proto RPC to the worker.
pub struct CapnpChannel {
    inner: TcpChannel,
}

impl CapnpChannel {
    /// Starts an RPC session on the connected stream.
    ///
    /// Fails without touching the network when the channel is not ready or has been closed.
    pub fn session(
        &self,
    ) -> Result<(RpcSystem<rpc_twoparty_capnp::Side>, Client), ChannelError> {
        let stream = self.inner.stream()?.clone();
        Ok(client_connection(stream.clone(), stream))
    }
}

impl RpcChannel for CapnpChannel {
    fn open(addr: SocketAddr) -> Self {
        Self {
            inner: TcpChannel::open(addr),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.inner.addr()
    }

    fn connectivity(&self) -> Connectivity {
        self.inner.connectivity()
    }

    fn connect(&mut self) -> impl Future<Output = Connectivity> {
        self.inner.connect()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
