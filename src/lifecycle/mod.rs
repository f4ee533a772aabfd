//! Sub-module where the worker lifecycle is located.
//!
//! [`supervisor`] drives a worker from spawn to teardown, [`drain`] persists its output and
//! [`process`] holds the OS-level helpers both rely on.

pub mod drain;
pub mod process;
pub mod supervisor;
pub mod worker;

/// Lifecycle of a supervised worker. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}
