//! Sub-module where workers hosted on a remote device are handled.
//!
//! [`RemoteDeviceControl`] is the capability the harness needs from the device: shell commands,
//! file transfers, port mappings and boot management. [`adb::Adb`] implements it with the `adb`
//! command line tool and [`bringup::RemoteBringup`] uses it to prepare the device before the worker
//! starts and to collect its logs afterwards.

use std::{future::Future, path::Path, time::Duration};

use thiserror::Error;

pub mod adb;
pub mod bringup;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("unable to run device command: {0}")]
    Io(#[source] std::io::Error),
    #[error("`{command}` failed ({status}): {output}")]
    Command {
        command: String,
        status: String,
        output: String,
    },
    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Result of a port mapping request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mapping {
    /// The mapping was already in place.
    Existing,
    /// The mapping was created on this port.
    Port(u16),
    /// The device refused the mapping.
    Rejected(String),
}

/// Commands the harness issues to a remote device.
pub trait RemoteDeviceControl {
    /// Serial number identifying the device.
    fn serial(&self) -> &str;

    fn shell(&self, command: &str) -> impl Future<Output = Result<String, DeviceError>>;

    fn push(
        &self,
        src: &Path,
        dst: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, DeviceError>>;

    fn pull(&self, remote: &str, local: &Path) -> impl Future<Output = Result<(), DeviceError>>;

    /// Maps a host port to a device port.
    fn forward(
        &self,
        host_port: u16,
        device_port: u16,
    ) -> impl Future<Output = Result<Mapping, DeviceError>>;

    /// Maps a device port to a host port.
    fn reverse(
        &self,
        device_port: u16,
        host_port: u16,
    ) -> impl Future<Output = Result<Mapping, DeviceError>>;

    fn remove_forward(&self, host_port: u16) -> impl Future<Output = Result<(), DeviceError>>;

    fn remove_reverse(&self, device_port: u16) -> impl Future<Output = Result<(), DeviceError>>;

    fn get_prop(&self, name: &str) -> impl Future<Output = Result<String, DeviceError>>;

    fn reboot(&self) -> impl Future<Output = Result<(), DeviceError>>;

    /// Restarts the device daemon as root and tells whether it runs as root.
    fn ensure_root(&self) -> impl Future<Output = Result<bool, DeviceError>>;

    fn remount(&self) -> impl Future<Output = Result<(), DeviceError>>;

    fn disable_verity(&self) -> impl Future<Output = Result<(), DeviceError>>;

    fn wait_for_device(&self, timeout: Duration) -> impl Future<Output = Result<(), DeviceError>>;

    /// Fails when the device is not reachable.
    fn get_state(&self) -> impl Future<Output = Result<String, DeviceError>>;
}
