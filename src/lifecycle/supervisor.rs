//! Owner of one worker run.
//!
//! Starting binds the handshake port, spawns the worker with its output drained into the backing
//! log, waits for the handshake and finally opens the RPC channels. Tearing down closes the
//! channels, interrupts the worker, escalates to `SIGKILL` when needed and joins the drain. Both
//! operations are bounded by the [`Timeouts`](crate::lifecycle::worker::Timeouts) of the
//! [`WorkerSpec`].
//!
//! A supervisor runs its worker at most once: a failed start or a completed teardown leaves it
//! [`Stopped`](LifecycleState::Stopped) for good.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    pin::pin,
    process::ExitStatus,
    time::{Duration, SystemTime},
};

use async_process::Child;
use futures::{select, FutureExt};
use nix::sys::signal::Signal;

use crate::{
    attach::{
        gate,
        signal::{ReadinessSignal, SignalError},
    },
    error::{LifecycleError, StartError, TeardownFailure, TeardownReport, TeardownWarning},
    lifecycle::{
        drain::{self, DrainError, DrainTask, Echo},
        process::{self, CrashSummary, Spawned},
        worker::WorkerSpec,
        LifecycleState,
    },
    operate::{
        capnp::CapnpChannel,
        channel::{await_ready, RpcChannel},
    },
};

/// Signal asking the worker to stop gracefully.
const STOP_SIGNAL: Signal = Signal::SIGINT;

/// Which ports must be free on the host before starting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortCheck {
    /// Only the handshake port, for workers whose RPC ports are forwarded from elsewhere.
    HandshakeOnly,
    /// The RPC ports and the handshake port.
    All,
}

/// Identity of the live worker.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub pid: u32,
    pub log_path: PathBuf,
    pub started_at: SystemTime,
}

/// Resources of a live worker. Dropping them kills the worker and cancels the drain.
struct Live<C> {
    handle: WorkerHandle,
    child: Child,
    drain: DrainTask,
    main: C,
    management: C,
}

/// Owner of a worker process, its output drain and its RPC channels.
///
/// A worker still running when the supervisor is dropped is killed.
pub struct ProcessSupervisor<C: RpcChannel = CapnpChannel> {
    spec: WorkerSpec,
    state: LifecycleState,
    live: Option<Live<C>>,
}

enum Handshake {
    Signaled,
    Failed(SignalError),
    Exited(std::io::Result<ExitStatus>),
}

impl<C: RpcChannel> ProcessSupervisor<C> {
    /// Creates a new supervisor for `spec`, not started yet.
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            state: LifecycleState::NotStarted,
            live: None,
        }
    }

    /// The spec the worker is run from.
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Label of the worker, used in logs and artefact names.
    pub fn label(&self) -> &str {
        self.spec.label()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The live worker, while running.
    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.live.as_ref().map(|live| &live.handle)
    }

    /// Channel to the main RPC port.
    pub fn main_channel(&self) -> Result<&C, LifecycleError> {
        self.running("use the main channel of")
            .map(|live| &live.main)
    }

    /// Channel to the management RPC port.
    pub fn management_channel(&self) -> Result<&C, LifecycleError> {
        self.running("use the management channel of")
            .map(|live| &live.management)
    }

    /// Starts the worker and waits for its handshake.
    pub async fn start(&mut self, port_check: PortCheck) -> Result<&WorkerHandle, StartError> {
        if self.state != LifecycleState::NotStarted {
            return Err(self.invalid("start").into());
        }
        self.state = LifecycleState::Starting;

        match self.launch(port_check).await {
            Ok(live) => {
                tracing::info!(
                    label = self.spec.label(),
                    pid = live.handle.pid,
                    "worker running"
                );
                self.state = LifecycleState::Running;
                Ok(&self.live.insert(live).handle)
            }
            Err(e) => {
                tracing::error!(label = self.spec.label(), "unable to start worker: {e}");
                self.state = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    async fn launch(&self, port_check: PortCheck) -> Result<Live<C>, StartError> {
        let spec = &self.spec;
        let ports = spec.ports();
        let timeouts = spec.timeouts();

        let checked = match port_check {
            PortCheck::HandshakeOnly => vec![ports.handshake],
            PortCheck::All => vec![ports.main, ports.management, ports.handshake],
        };
        gate::ensure_available(checked)?;

        let mut signal = ReadinessSignal::new();
        signal.bind(ports.handshake)?;

        let Spawned { mut child, output } =
            process::spawn_combined(spec).map_err(|source| StartError::Spawn {
                command: spec.command().join(" "),
                source,
            })?;
        let pid = child.id();
        tracing::debug!(label = spec.label(), pid, "worker spawned");

        let log_path = spec.backing_log_path();
        let echo = spec.verbose().then(|| Echo {
            label: spec.label().to_owned(),
            color: spec.label_color(),
        });
        let mut drain = match drain::start(output, &log_path, echo) {
            Ok(drain) => drain,
            Err(source) => {
                self.reclaim(&mut child, None).await;
                return Err(StartError::Process { pid, source });
            }
        };

        let handshake = match child.try_status() {
            Ok(Some(status)) => Handshake::Exited(Ok(status)),
            Ok(None) => {
                let mut signaled = pin!(signal.await_signal(timeouts.handshake).fuse());
                let mut exited = pin!(child.status().fuse());
                select! {
                    res = signaled => res.map_or_else(Handshake::Failed, |()| Handshake::Signaled),
                    status = exited => Handshake::Exited(status),
                }
            }
            Err(e) => Handshake::Exited(Err(e)),
        };

        let err = match handshake {
            Handshake::Signaled => None,
            Handshake::Exited(Ok(status)) => {
                let output = match drain.join(timeouts.drain_join).await {
                    Ok(_) => std::fs::read_to_string(&log_path).unwrap_or_default(),
                    Err(e) => format!("<output unavailable: {e}>"),
                };
                return Err(StartError::ImmediateExit {
                    command: spec.command().join(" "),
                    exit: process::describe_exit(status),
                    output,
                });
            }
            Handshake::Exited(Err(source)) => Some(StartError::Process { pid, source }),
            Handshake::Failed(SignalError::TimedOut { port, timeout }) => {
                Some(StartError::StartupTimeout { pid, port, timeout })
            }
            Handshake::Failed(e) => Some(StartError::Handshake(e)),
        };
        if let Some(err) = err {
            self.reclaim(&mut child, Some(drain)).await;
            return Err(err);
        }

        let channel_addr = |port| SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Ok(Live {
            handle: WorkerHandle {
                pid,
                log_path,
                started_at: SystemTime::now(),
            },
            child,
            drain,
            main: C::open(channel_addr(ports.main)),
            management: C::open(channel_addr(ports.management)),
        })
    }

    /// Kills a worker that failed to start and releases its drain.
    async fn reclaim(&self, child: &mut Child, drain: Option<DrainTask>) {
        let timeouts = self.spec.timeouts();
        match process::kill_and_reap(child, timeouts.forced_kill).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::error!(
                label = self.spec.label(),
                pid = child.id(),
                "failed to kill worker after failed start"
            ),
            Err(e) => tracing::error!(
                label = self.spec.label(),
                pid = child.id(),
                "unable to kill worker after failed start: {e}"
            ),
        }
        if let Some(mut drain) = drain {
            if let Err(e) = drain.join(timeouts.drain_join).await {
                tracing::warn!(label = self.spec.label(), "{e}");
            }
        }
    }

    /// Non-blocking liveness check of the worker.
    pub fn is_alive(&mut self) -> bool {
        self.live
            .as_mut()
            .is_some_and(|live| matches!(live.child.try_status(), Ok(None)))
    }

    /// Waits for the main channel to become ready.
    pub async fn wait_channel_ready(&mut self) -> Result<(), StartError> {
        let timeout = self.spec.timeouts().channel_ready;
        let label = self.spec.label().to_owned();
        let invalid = self.invalid("wait for the channel of");
        let live = match self.live.as_mut() {
            Some(live) if self.state == LifecycleState::Running => live,
            _ => return Err(invalid.into()),
        };
        await_ready(&mut live.main, timeout)
            .await
            .map_err(|source| StartError::ChannelNotReady { label, source })
    }

    /// Crash snippet and log tail of a worker that is no longer alive.
    ///
    /// Returns `None` while the worker runs or before it has been started.
    pub fn crash_summary(&mut self) -> Option<std::io::Result<CrashSummary>> {
        if self.state == LifecycleState::NotStarted || self.is_alive() {
            return None;
        }
        Some(process::read_crash_summary(&self.spec.backing_log_path()))
    }

    /// Stops the worker and reports how it went.
    ///
    /// Only a running worker can be torn down. Every step is bounded; a worker surviving `SIGKILL`
    /// is reported as a failure but does not prevent the remaining steps. The worker stays owned
    /// by the supervisor until teardown completes, so abandoning teardown half-way still kills it
    /// when the supervisor is dropped.
    pub async fn teardown(&mut self) -> Result<TeardownReport, LifecycleError> {
        if self.state != LifecycleState::Running {
            return Err(self.invalid("tear down"));
        }
        let Some(live) = self.live.as_mut() else {
            return Err(self.invalid("tear down"));
        };
        self.state = LifecycleState::Stopping;

        let label = self.spec.label();
        let timeouts = *self.spec.timeouts();
        let pid = live.handle.pid;
        let mut report = TeardownReport {
            pid,
            exit: None,
            warnings: Vec::new(),
            failure: None,
        };

        live.main.close();
        live.management.close();

        // A reaped worker is never signalled, its pid may have been reused.
        report.exit = live.child.try_status().unwrap_or_else(|e| {
            tracing::error!(label, pid, "unable to check worker: {e}");
            None
        });
        if report.exit.is_none() {
            if let Err(source) = process::send_signal(pid, STOP_SIGNAL) {
                report.warnings.push(TeardownWarning::SignalDelivery {
                    pid,
                    signal: STOP_SIGNAL.to_string(),
                    source: source.into(),
                });
            }
            report.exit = wait_logged(label, &mut live.child, timeouts.graceful_stop).await;
        }
        if report.exit.is_none() {
            tracing::error!(
                label,
                pid,
                "failed to interrupt worker via {STOP_SIGNAL}, sending SIGKILL"
            );
            if let Err(source) = live.child.kill() {
                report.warnings.push(TeardownWarning::SignalDelivery {
                    pid,
                    signal: Signal::SIGKILL.to_string(),
                    source,
                });
            }
            report.exit = wait_logged(label, &mut live.child, timeouts.forced_kill).await;
        }

        match report.exit {
            None => {
                tracing::error!(label, pid, "failed to kill worker");
                report.failure = Some(TeardownFailure::KillFailed { pid });
            }
            Some(status) if !process::is_expected_exit(status, STOP_SIGNAL) => {
                let exit = process::describe_exit(status);
                tracing::error!(label, pid, "worker stopped abnormally: {exit}");
                report.warnings.push(TeardownWarning::AnomalousExit {
                    exit,
                    expected: STOP_SIGNAL.to_string(),
                });
            }
            Some(_) => {}
        }

        match live.drain.join(timeouts.drain_join).await {
            Ok(summary) => tracing::debug!(
                label,
                lines = summary.lines,
                bytes = summary.bytes,
                "output drained"
            ),
            Err(DrainError::JoinTimeout(timeout)) => {
                tracing::error!(label, "output drain failed to finish on time");
                report.warnings.push(TeardownWarning::DrainJoinTimeout(timeout));
            }
            Err(e) => {
                tracing::error!(label, "output drain produced an error: {e}");
                report.warnings.push(TeardownWarning::DrainWrite(e));
            }
        }

        self.live = None;
        self.state = LifecycleState::Stopped;
        Ok(report)
    }

    fn running(&self, operation: &'static str) -> Result<&Live<C>, LifecycleError> {
        match &self.live {
            Some(live) if self.state == LifecycleState::Running => Ok(live),
            _ => Err(self.invalid(operation)),
        }
    }

    fn invalid(&self, operation: &'static str) -> LifecycleError {
        LifecycleError {
            label: self.spec.label().to_owned(),
            operation,
            state: self.state,
        }
    }
}

async fn wait_logged(label: &str, child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    process::wait_for_exit(child, timeout)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(label, pid = child.id(), "unable to wait for worker: {e}");
            None
        })
}

impl<C: RpcChannel> Drop for ProcessSupervisor<C> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::warn!(
                label = self.spec.label(),
                pid = live.handle.pid,
                "supervisor dropped without completed teardown, killing worker"
            );
        }
    }
}
