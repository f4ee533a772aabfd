//! Standup runs the worker processes of a test harness: it starts a worker, waits until the worker
//! reports it is ready, keeps its output in a log file and tears it down again, gracefully if
//! possible and forcibly if not.
//!
//! ## Handshake
//!
//! Before spawning the worker, the harness listens on a loopback port and passes that port to the
//! worker on its command line. The worker connects to it once it is ready to serve RPCs: the
//! connection is the signal, no data is exchanged.
//!
//! ## RPC
//!
//! The worker exposes a main and a management RPC port. The channels to these ports are opened
//! once the handshake completed and are closed first on teardown, after which any use of them
//! fails. [`operate::capnp`] runs Cap'n Proto RPC sessions over them.
//!
//! ## Remote devices
//!
//! A worker may also run on a remote device reached through `adb`. The device is prepared first
//! (root, verity, port mappings, binaries) and its logs are retrieved after teardown, see
//! [`remote`].
//!
//! ## Example
//!
//! ```no_run
//! use futures::executor::block_on;
//! use standup::{
//!     controller::Controller,
//!     lifecycle::worker::{Ports, WorkerSpec},
//! };
//!
//! let ports = Ports { main: 8999, management: 8998, handshake: 8997 };
//! let spec = WorkerSpec::builder(["./worker", "--signal-port=8997"], ports)
//!     .label("dut")
//!     .build();
//! let mut controller: Controller = Controller::host_only(spec);
//!
//! block_on(async {
//!     controller.start().await?;
//!     controller.supervisor_mut().wait_channel_ready().await?;
//!     // Issue RPCs...
//!     let report = controller.teardown().await?;
//!     println!("worker exited: {:?}", report.exit);
//!     Ok::<_, Box<dyn std::error::Error>>(())
//! })?;
//! # Ok::<_, Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod attach;
#[cfg(unix)]
pub mod config;
#[cfg(unix)]
pub mod controller;
#[cfg(unix)]
pub mod error;
#[cfg(unix)]
pub mod lifecycle;
pub mod operate;
#[cfg(unix)]
pub mod remote;

mod cancellation;
