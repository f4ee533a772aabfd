//! Outcomes of starting and stopping a worker.
//!
//! Start failures are fatal and abort the operation. Teardown always runs to completion: it
//! collects [`TeardownWarning`]s and at most one [`TeardownFailure`] in a [`TeardownReport`].

use std::{path::PathBuf, process::ExitStatus, time::Duration};

use thiserror::Error;

use crate::{
    attach::{gate::PortUnavailable, signal::SignalError},
    config::ConfigError,
    lifecycle::{drain::DrainError, LifecycleState},
    operate::channel::NotReady,
    remote::{bringup::BringupFailure, DeviceError},
};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    PortUnavailable(#[from] PortUnavailable),
    #[error(transparent)]
    Handshake(#[from] SignalError),
    #[error("unable to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to watch worker {pid}: {source}")]
    Process {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("worker stopped immediately after running `{command}` ({exit}), output:\n{output}")]
    ImmediateExit {
        command: String,
        exit: String,
        output: String,
    },
    #[error("worker {pid} did not connect to handshake port {port} within {timeout:?}")]
    StartupTimeout {
        pid: u32,
        port: u16,
        timeout: Duration,
    },
    #[error("[{label}] {source}")]
    ChannelNotReady {
        label: String,
        #[source]
        source: NotReady,
    },
    #[error(transparent)]
    Bringup(#[from] BringupFailure),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A lifecycle operation was requested in a state that does not allow it.
#[derive(Debug, Error)]
#[error("[{label}] cannot {operation} a worker that is {state:?}")]
pub struct LifecycleError {
    pub label: String,
    pub operation: &'static str,
    pub state: LifecycleState,
}

/// Fatal teardown condition, reported once every teardown step has been attempted.
#[derive(Debug, Error)]
pub enum TeardownFailure {
    #[error("failed to kill worker {pid}")]
    KillFailed { pid: u32 },
}

/// Non-fatal teardown condition.
#[derive(Debug, Error)]
pub enum TeardownWarning {
    #[error("worker stopped abnormally: {exit} (expected {expected} or exit code 0)")]
    AnomalousExit { exit: String, expected: String },
    #[error("unable to send {signal} to worker {pid}: {source}")]
    SignalDelivery {
        pid: u32,
        signal: String,
        #[source]
        source: std::io::Error,
    },
    #[error("output drain failed to finish within {0:?}")]
    DrainJoinTimeout(Duration),
    #[error("output drain failed: {0}")]
    DrainWrite(#[source] DrainError),
    #[error("unable to clean up remote device: {0}")]
    Remote(#[source] DeviceError),
    #[error("unable to retrieve {remote} into {local}: {source}")]
    RemotePull {
        remote: String,
        local: PathBuf,
        #[source]
        source: DeviceError,
    },
}

/// Everything teardown observed.
#[derive(Debug)]
pub struct TeardownReport {
    pub pid: u32,
    /// `None` when the worker survived every signal.
    pub exit: Option<ExitStatus>,
    pub warnings: Vec<TeardownWarning>,
    pub failure: Option<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.failure.is_none()
    }

    /// Turns a fatal condition into an error, keeping warnings in the report otherwise.
    pub fn into_result(mut self) -> Result<Self, TeardownFailure> {
        match self.failure.take() {
            Some(failure) => Err(failure),
            None => Ok(self),
        }
    }
}
