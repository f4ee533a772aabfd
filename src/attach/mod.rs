//! Sub-module where the worker attaches back to the harness.
//!
//! [`gate`] checks that the ports a worker needs are free, [`signal`] is the one-shot handshake the
//! worker completes once it is ready to serve.

pub mod gate;
pub mod signal;
