//! [`RemoteDeviceControl`] through the `adb` command line tool.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    time::Duration,
};

use async_io::Timer;
use async_process::{Command, Stdio};
use futures::{select, FutureExt};

use crate::{
    lifecycle::process,
    remote::{DeviceError, Mapping, RemoteDeviceControl},
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// A device reachable through `adb -s <serial>`.
pub struct Adb {
    serial: String,
    program: PathBuf,
}

impl Adb {
    /// Creates a new device handle using the `adb` found in `PATH`.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            program: PathBuf::from("adb"),
        }
    }

    /// Uses another `adb` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Runs `adb -s <serial> <args>` and returns its trimmed stdout.
    ///
    /// The command is killed when it does not complete within `timeout`.
    async fn run<I, S>(&self, args: I, timeout: Duration) -> Result<String, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|arg| arg.as_ref().to_owned()).collect();
        let description = std::iter::once(self.program.as_os_str())
            .chain([OsStr::new("-s"), OsStr::new(&self.serial)])
            .chain(args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        tracing::trace!(serial = %self.serial, "running {description}");

        let mut command = Command::new(&self.program);
        command
            .arg("-s")
            .arg(&self.serial)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Dropping the pending output on timeout kills the command.
        let output = select! {
            output = command.output().fuse() => output.map_err(DeviceError::Io)?,
            _ = Timer::after(timeout).fuse() => {
                return Err(DeviceError::Timeout { command: description, timeout });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DeviceError::Command {
                command: description,
                status: process::describe_exit(output.status),
                output: format!("{stdout}{}", stderr.trim()),
            })
        }
    }

    async fn map(&self, args: [String; 3]) -> Result<Mapping, DeviceError> {
        match self.run(&args, COMMAND_TIMEOUT).await {
            Ok(out) => Ok(parse_mapping(&out)),
            Err(DeviceError::Command { output, .. }) => Ok(Mapping::Rejected(output)),
            Err(e) => Err(e),
        }
    }
}

fn parse_mapping(out: &str) -> Mapping {
    if out.is_empty() {
        Mapping::Existing
    } else {
        out.parse()
            .map_or_else(|_| Mapping::Rejected(out.to_owned()), Mapping::Port)
    }
}

impl RemoteDeviceControl for Adb {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn shell(&self, command: &str) -> Result<String, DeviceError> {
        self.run(["shell", command], COMMAND_TIMEOUT).await
    }

    async fn push(&self, src: &Path, dst: &str, timeout: Duration) -> Result<String, DeviceError> {
        self.run([OsStr::new("push"), src.as_os_str(), OsStr::new(dst)], timeout)
            .await
    }

    async fn pull(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        let args = [OsStr::new("pull"), OsStr::new(remote), local.as_os_str()];
        self.run(args, COMMAND_TIMEOUT).await.map(drop)
    }

    async fn forward(&self, host_port: u16, device_port: u16) -> Result<Mapping, DeviceError> {
        self.map([
            "forward".to_owned(),
            format!("tcp:{host_port}"),
            format!("tcp:{device_port}"),
        ])
        .await
    }

    async fn reverse(&self, device_port: u16, host_port: u16) -> Result<Mapping, DeviceError> {
        self.map([
            "reverse".to_owned(),
            format!("tcp:{device_port}"),
            format!("tcp:{host_port}"),
        ])
        .await
    }

    async fn remove_forward(&self, host_port: u16) -> Result<(), DeviceError> {
        let args = ["forward".to_owned(), "--remove".to_owned(), format!("tcp:{host_port}")];
        self.run(args, COMMAND_TIMEOUT).await.map(drop)
    }

    async fn remove_reverse(&self, device_port: u16) -> Result<(), DeviceError> {
        let args = ["reverse".to_owned(), "--remove".to_owned(), format!("tcp:{device_port}")];
        self.run(args, COMMAND_TIMEOUT).await.map(drop)
    }

    async fn get_prop(&self, name: &str) -> Result<String, DeviceError> {
        self.run(["shell", "getprop", name], COMMAND_TIMEOUT).await
    }

    async fn reboot(&self) -> Result<(), DeviceError> {
        self.run(["reboot"], COMMAND_TIMEOUT).await.map(drop)
    }

    async fn ensure_root(&self) -> Result<bool, DeviceError> {
        self.run(["root"], COMMAND_TIMEOUT).await?;
        self.wait_for_device(COMMAND_TIMEOUT).await?;
        Ok(self.shell("id -u").await? == "0")
    }

    async fn remount(&self) -> Result<(), DeviceError> {
        self.run(["remount"], COMMAND_TIMEOUT).await.map(drop)
    }

    async fn disable_verity(&self) -> Result<(), DeviceError> {
        self.run(["disable-verity"], COMMAND_TIMEOUT).await.map(drop)
    }

    async fn wait_for_device(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.run(["wait-for-device"], timeout).await.map(drop)
    }

    async fn get_state(&self) -> Result<String, DeviceError> {
        self.run(["get-state"], COMMAND_TIMEOUT).await
    }
}
