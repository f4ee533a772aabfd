//! Sub-module where RPC capabilities are located.
//!
//! [`channel`] defines the channel capability and readiness waiting, [`capnp`] exposes RPC
//! sessions using Cap'n Proto protocol.

pub mod capnp;
pub mod channel;
