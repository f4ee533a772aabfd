//! OS process plumbing: spawning with a combined output stream, signalling and bounded waits.

use std::{
    fs::File,
    io::Read,
    os::{fd::OwnedFd, unix::process::ExitStatusExt},
    path::Path,
    process::ExitStatus,
    time::Duration,
};

use async_io::{Async, Timer};
use async_process::{Child, Command, Stdio};
use futures::{select, FutureExt};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

use crate::lifecycle::worker::WorkerSpec;

/// Number of log lines kept in a crash summary.
const TAIL_LINES: usize = 20;

/// A freshly spawned worker with the read end of its combined stdout/stderr.
///
/// The child is killed if it is dropped before exiting.
pub struct Spawned {
    pub child: Child,
    pub output: Async<File>,
}

/// Spawns the worker with stdout and stderr sharing a single pipe.
///
/// The ambient environment is inherited and extended with the worker's overrides.
pub fn spawn_combined(spec: &WorkerSpec) -> std::io::Result<Spawned> {
    let (program, args) = spec
        .command()
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    let (reader, writer) = std::io::pipe()?;

    // `command` owns our copies of the write end and must be dropped right after spawning,
    // otherwise EOF is never observed on the read end.
    let child = {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(spec.cwd())
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(true);
        command.spawn()?
    };

    let output = Async::new(File::from(OwnedFd::from(reader)))?;
    Ok(Spawned { child, output })
}

/// Sends `signal` to the process, ignoring processes that are already gone.
///
/// Only use on a child that has not been reaped yet, its pid may be reused otherwise.
pub fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    match kill(Pid::from_raw(pid as _), signal) {
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        res => res,
    }
}

/// Waits for the child to exit for at most `timeout`.
///
/// Returns `None` on timeout; the child is left untouched.
pub async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    select! {
        status = child.status().fuse() => status.map(Some),
        _ = Timer::after(timeout).fuse() => Ok(None),
    }
}

/// Kills the child and reaps it, waiting at most `timeout`.
pub async fn kill_and_reap(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    if let Some(status) = child.try_status()? {
        return Ok(Some(status));
    }
    child.kill()?;
    wait_for_exit(child, timeout).await
}

/// Whether the exit status is "exited 0" or "terminated by `expected`".
pub fn is_expected_exit(status: ExitStatus, expected: Signal) -> bool {
    status.code() == Some(0) || status.signal() == Some(expected as i32)
}

/// Human-readable exit condition distinguishing exit codes from signals.
pub fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => match Signal::try_from(signal) {
            Ok(signal) => format!("terminated by {signal}"),
            Err(_) => format!("terminated by signal {signal}"),
        },
        (None, None) => "stopped for an unknown reason".to_owned(),
    }
}

/// Checks the system process table for a live (non-zombie) process.
pub fn pid_exists(pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Excerpts of a dead worker's log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrashSummary {
    /// Lines starting at the first crash or abort report, if any.
    pub snippet: Option<String>,
    /// The last lines of the log.
    pub tail: String,
}

/// Reads the crash snippet and the tail of a backing log.
pub fn read_crash_summary(log_path: &Path) -> std::io::Result<CrashSummary> {
    let mut contents = Vec::new();
    File::open(log_path)?.read_to_end(&mut contents)?;
    let contents = String::from_utf8_lossy(&contents);
    let lines: Vec<&str> = contents.lines().collect();

    let snippet = lines
        .iter()
        .position(|line| {
            let line = line.to_ascii_lowercase();
            line.contains("crash") || line.contains("abort") || line.contains("panicked")
        })
        .map(|start| {
            lines[start..]
                .iter()
                .take(TAIL_LINES)
                .copied()
                .collect::<Vec<_>>()
                .join("\n")
        });
    let tail = lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n");

    Ok(CrashSummary { snippet, tail })
}
