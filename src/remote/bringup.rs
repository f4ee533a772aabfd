//! Device-side preparation of a remote worker.
//!
//! Before the worker starts, the device must run as root with verity disabled, expose the worker
//! ports through forward and reverse mappings and hold up-to-date worker binaries. A mapping the
//! device refuses is retried after a full reboot, within a retry budget. After teardown the
//! mappings are removed and the device logs are pulled next to the backing log.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use async_io::Timer;
use thiserror::Error;

use crate::{
    error::{TeardownReport, TeardownWarning},
    lifecycle::worker::WorkerSpec,
    remote::{DeviceError, Mapping, RemoteDeviceControl},
};

const SYSTEM_VERITY_PROP: &str = "partition.system.verified";
const VENDOR_VERITY_PROP: &str = "partition.vendor.verified";
const BOOT_COMPLETED_PROP: &str = "sys.boot_completed";

#[derive(Debug, Error)]
#[error("[{serial}] remote bringup failed: {reason}")]
pub struct BringupFailure {
    pub serial: String,
    pub reason: BringupReason,
}

#[derive(Debug, Error)]
pub enum BringupReason {
    #[error("device cannot run as root")]
    RootDenied,
    #[error("unable to push {src} to {dst}: {detail}")]
    PushFailed {
        src: PathBuf,
        dst: String,
        detail: String,
    },
    #[error("unable to {mapping}: {detail}")]
    ForwardExhausted { mapping: String, detail: String },
    #[error("device did not come back after reboot: {0}")]
    RebootTimeout(#[source] DeviceError),
    #[error("device booting process timed out")]
    BootIncomplete,
    #[error("`{command}` returned something when it shouldn't: {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A file installed on the device before the worker starts.
#[derive(Clone, Debug)]
pub struct Push {
    pub src: PathBuf,
    pub dst: String,
}

/// A device file retrieved after teardown, stored as `<log dir>/<label>_<suffix>`.
#[derive(Clone, Debug)]
pub struct Pull {
    pub remote: String,
    pub local_suffix: String,
}

/// What to install on the device and which logs to collect.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    pub pushes: Vec<Push>,
    pub push_timeout: Duration,
    /// Commands whose output must be empty.
    pub quiet_commands: Vec<String>,
    /// Commands run before the worker starts whose outcome does not matter.
    pub cleanup_commands: Vec<String>,
    /// Command run on the device before the logs are pulled.
    pub log_dump_command: Option<String>,
    pub pulls: Vec<Pull>,
    /// Sets the device clock to the host clock.
    pub sync_clock: bool,
}

impl DeviceProfile {
    /// Bluetooth stack with facade, built under `root`.
    pub fn bluetooth(root: impl Into<PathBuf>) -> Self {
        let target = root.into().join("target");
        let push = |file: &str, dst: &str| Push {
            src: target.join(file),
            dst: dst.to_owned(),
        };
        Self {
            pushes: vec![
                push("bluetooth_stack_with_facade", "system/bin"),
                push("libbluetooth_gd.so", "system/lib64"),
                push("libgrpc++_unsecure.so", "system/lib64"),
            ],
            push_timeout: Duration::from_secs(300),
            quiet_commands: vec!["logcat -c".to_owned(), "svc bluetooth disable".to_owned()],
            cleanup_commands: vec!["rm /data/misc/bluetooth/logs/btsnoop_hci.log".to_owned()],
            log_dump_command: Some("logcat -d -f /data/misc/bluetooth/logs/system_log".to_owned()),
            pulls: vec![
                Pull {
                    remote: "/data/misc/bluetooth/logs/btsnoop_hci.log".to_owned(),
                    local_suffix: "btsnoop_hci.log".to_owned(),
                },
                Pull {
                    remote: "/data/misc/bluetooth/logs/system_log".to_owned(),
                    local_suffix: "system_log".to_owned(),
                },
            ],
            sync_clock: true,
        }
    }
}

/// Timing of the reboot sub-protocol.
#[derive(Clone, Copy, Debug)]
pub struct RebootPolicy {
    /// Interval between reachability probes while waiting for the device to go down.
    pub probe_interval: Duration,
    /// Interval between boot completion checks.
    pub boot_poll_interval: Duration,
    /// Overall bound of a reboot.
    pub timeout: Duration,
    pub wait_for_device: Duration,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(100),
            boot_poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
            wait_for_device: Duration::from_secs(180),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Reverse,
}

/// Preparation and cleanup of the remote device hosting a worker.
pub struct RemoteBringup<D> {
    device: D,
    profile: DeviceProfile,
    reboot_policy: RebootPolicy,
    retry_budget: u32,
}

impl<D: RemoteDeviceControl> RemoteBringup<D> {
    /// Creates a new bringup of `device` installing `profile`, with the default reboot policy
    /// and a retry budget of one reboot per mapping.
    pub fn new(device: D, profile: DeviceProfile) -> Self {
        Self {
            device,
            profile,
            reboot_policy: RebootPolicy::default(),
            retry_budget: 1,
        }
    }

    /// Uses another reboot timing.
    pub fn with_reboot_policy(mut self, reboot_policy: RebootPolicy) -> Self {
        self.reboot_policy = reboot_policy;
        self
    }

    /// Number of reboots allowed per port mapping.
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// The device being prepared.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Prepares the device for `spec`; the worker may be started once this returns.
    pub async fn prepare(&self, spec: &WorkerSpec) -> Result<(), BringupFailure> {
        self.prepare_inner(spec).await.map_err(|reason| self.failure(reason))
    }

    async fn prepare_inner(&self, spec: &WorkerSpec) -> Result<(), BringupReason> {
        let ports = spec.ports();
        let serial = self.device.serial();

        self.ensure_verity_disabled().await?;
        if !self.device.ensure_root().await? {
            return Err(BringupReason::RootDenied);
        }
        if self.profile.sync_clock {
            let now = chrono::Local::now().format("%m%d%H%M%Y.%S");
            self.device.shell(&format!("date {now}")).await?;
        }

        // Stale mappings may or may not exist.
        let _ = self.device.remove_forward(ports.main).await;
        let _ = self.device.remove_forward(ports.management).await;
        let _ = self.device.remove_reverse(ports.handshake).await;

        self.map_or_fail(Direction::Forward, ports.main, ports.main).await?;
        self.map_or_fail(Direction::Forward, ports.management, ports.management)
            .await?;
        self.map_or_fail(Direction::Reverse, ports.handshake, ports.handshake)
            .await?;

        for push in &self.profile.pushes {
            self.push_or_fail(push).await?;
        }

        for command in &self.profile.quiet_commands {
            let output = self.device.shell(command).await?;
            if !output.is_empty() {
                return Err(BringupReason::UnexpectedOutput {
                    command: command.clone(),
                    output,
                });
            }
        }
        for command in &self.profile.cleanup_commands {
            if let Err(e) = self.device.shell(command).await {
                tracing::debug!(serial, "ignoring failed `{command}`: {e}");
            }
        }

        tracing::info!(serial, label = spec.label(), "device ready");
        Ok(())
    }

    /// Removes the port mappings and retrieves the device logs.
    ///
    /// Problems are recorded as warnings in `report`.
    pub async fn cleanup(&self, spec: &WorkerSpec, report: &mut TeardownReport) {
        let ports = spec.ports();
        let removals = [
            self.device.remove_forward(ports.main).await,
            self.device.remove_forward(ports.management).await,
            self.device.remove_reverse(ports.handshake).await,
        ];
        report.warnings.extend(
            removals
                .into_iter()
                .filter_map(Result::err)
                .map(TeardownWarning::Remote),
        );

        if let Some(command) = &self.profile.log_dump_command {
            if let Err(e) = self.device.shell(command).await {
                report.warnings.push(TeardownWarning::Remote(e));
            }
        }

        for pull in &self.profile.pulls {
            let local = spec
                .log_dir()
                .join(format!("{}_{}", spec.label(), pull.local_suffix));
            if let Err(source) = self.device.pull(&pull.remote, &local).await {
                tracing::warn!(
                    serial = self.device.serial(),
                    "unable to pull {}: {source}",
                    pull.remote
                );
                report.warnings.push(TeardownWarning::RemotePull {
                    remote: pull.remote.clone(),
                    local,
                    source,
                });
            }
        }
    }

    /// Makes sure the device runs as root with a writable system partition.
    ///
    /// Disabling verity requires a reboot.
    pub async fn ensure_verity_disabled(&self) -> Result<(), BringupReason> {
        tracing::debug!(serial = self.device.serial(), "disabling verity and remounting");
        if !self.device.ensure_root().await? {
            return Err(BringupReason::RootDenied);
        }
        // These properties only exist while verity is enabled.
        let system_verity = self.device.get_prop(SYSTEM_VERITY_PROP).await?;
        let vendor_verity = self.device.get_prop(VENDOR_VERITY_PROP).await?;
        if !system_verity.is_empty() || !vendor_verity.is_empty() {
            self.device.disable_verity().await?;
            self.reboot().await?;
        }
        self.device.remount().await?;
        self.device
            .wait_for_device(self.reboot_policy.wait_for_device)
            .await
            .map_err(BringupReason::RebootTimeout)
    }

    /// Reboots the device and waits for the boot to complete.
    pub async fn reboot(&self) -> Result<(), BringupReason> {
        let serial = self.device.serial();
        tracing::info!(serial, "rebooting");
        self.device.reboot().await?;

        let start = Instant::now();
        // The reboot command may return before the device goes down; wait for it to disappear
        // so that the boot completion property is not read from the previous boot.
        while start.elapsed() < self.reboot_policy.timeout {
            if self.device.get_state().await.is_err() {
                break;
            }
            Timer::after(self.reboot_policy.probe_interval).await;
        }

        self.wait_for_boot_completion(self.reboot_policy.timeout.saturating_sub(start.elapsed()))
            .await
    }

    /// Waits for the device to report a completed boot.
    pub async fn wait_for_boot_completion(&self, timeout: Duration) -> Result<(), BringupReason> {
        let start = Instant::now();
        self.device
            .wait_for_device(self.reboot_policy.wait_for_device)
            .await
            .map_err(BringupReason::RebootTimeout)?;

        while start.elapsed() < timeout {
            // Device commands may fail for a while during boot.
            if let Ok(completed) = self.device.get_prop(BOOT_COMPLETED_PROP).await {
                if completed == "1" {
                    return Ok(());
                }
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            Timer::after(self.reboot_policy.boot_poll_interval.min(remaining)).await;
        }
        Err(BringupReason::BootIncomplete)
    }

    async fn map_or_fail(
        &self,
        direction: Direction,
        from: u16,
        to: u16,
    ) -> Result<u16, BringupReason> {
        let mapping = match direction {
            Direction::Forward => format!("forward host port {from} to device port {to}"),
            Direction::Reverse => format!("reverse device port {from} to host port {to}"),
        };
        let mut retries = self.retry_budget;
        loop {
            let res = match direction {
                Direction::Forward => self.device.forward(from, to).await?,
                Direction::Reverse => self.device.reverse(from, to).await?,
            };
            match res {
                Mapping::Existing => {
                    tracing::debug!(serial = self.device.serial(), "port {from} already mapped");
                    return Ok(from);
                }
                Mapping::Port(port) => return Ok(port),
                Mapping::Rejected(detail) if retries > 0 => {
                    retries -= 1;
                    tracing::warn!(
                        serial = self.device.serial(),
                        retries_left = retries,
                        "failed to {mapping}: {detail}"
                    );
                    self.reboot().await?;
                }
                Mapping::Rejected(detail) => {
                    return Err(BringupReason::ForwardExhausted { mapping, detail })
                }
            }
        }
    }

    async fn push_or_fail(&self, push: &Push) -> Result<(), BringupReason> {
        let push_failed = |detail: String| BringupReason::PushFailed {
            src: push.src.clone(),
            dst: push.dst.clone(),
            detail,
        };
        if !self.device.ensure_root().await? {
            return Err(BringupReason::RootDenied);
        }
        self.ensure_verity_disabled().await?;
        match self
            .device
            .push(&push.src, &push.dst, self.profile.push_timeout)
            .await
        {
            Ok(out) if out.contains("error") => Err(push_failed(out)),
            Ok(_) => Ok(()),
            Err(e) => Err(push_failed(e.to_string())),
        }
    }

    fn failure(&self, reason: BringupReason) -> BringupFailure {
        tracing::error!(serial = self.device.serial(), "{reason}");
        BringupFailure {
            serial: self.device.serial().to_owned(),
            reason,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) mod tests {
    use std::{
        cell::RefCell,
        collections::{BTreeMap, VecDeque},
        path::Path,
    };

    use assert_matches::assert_matches;
    use futures::executor::block_on;

    use super::*;
    use crate::lifecycle::worker::{Ports, WorkerSpec};

    /// In-memory device answering from scripted queues and recording every call.
    #[derive(Default)]
    pub(crate) struct FakeDevice {
        pub calls: RefCell<Vec<String>>,
        pub forwards: RefCell<VecDeque<Mapping>>,
        pub props: RefCell<BTreeMap<String, VecDeque<String>>>,
        pub shell_outputs: RefCell<BTreeMap<String, String>>,
        /// Number of `get_state` probes answered before the device disappears.
        pub reachable_probes: RefCell<u32>,
        pub root: bool,
    }

    impl FakeDevice {
        pub(crate) fn rooted() -> Self {
            Self {
                root: true,
                ..Default::default()
            }
        }

        pub(crate) fn script_prop(&self, name: &str, values: &[&str]) {
            self.props.borrow_mut().insert(
                name.to_owned(),
                values.iter().map(|value| (*value).to_owned()).collect(),
            );
        }

        pub(crate) fn calls_to(&self, prefix: &str) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }

        fn record(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl RemoteDeviceControl for FakeDevice {
        fn serial(&self) -> &str {
            "FAKE0001"
        }

        async fn shell(&self, command: &str) -> Result<String, DeviceError> {
            self.record(format!("shell {command}"));
            Ok(self
                .shell_outputs
                .borrow()
                .get(command)
                .cloned()
                .unwrap_or_default())
        }

        async fn push(
            &self,
            src: &Path,
            dst: &str,
            _timeout: Duration,
        ) -> Result<String, DeviceError> {
            self.record(format!("push {} {dst}", src.display()));
            Ok(format!("{}: 1 file pushed", src.display()))
        }

        async fn pull(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
            self.record(format!("pull {remote} {}", local.display()));
            Ok(())
        }

        async fn forward(&self, host_port: u16, device_port: u16) -> Result<Mapping, DeviceError> {
            self.record(format!("forward {host_port} {device_port}"));
            Ok(self.forwards.borrow_mut().pop_front().unwrap_or(Mapping::Existing))
        }

        async fn reverse(&self, device_port: u16, host_port: u16) -> Result<Mapping, DeviceError> {
            self.record(format!("reverse {device_port} {host_port}"));
            Ok(Mapping::Port(device_port))
        }

        async fn remove_forward(&self, host_port: u16) -> Result<(), DeviceError> {
            self.record(format!("remove_forward {host_port}"));
            Ok(())
        }

        async fn remove_reverse(&self, device_port: u16) -> Result<(), DeviceError> {
            self.record(format!("remove_reverse {device_port}"));
            Ok(())
        }

        async fn get_prop(&self, name: &str) -> Result<String, DeviceError> {
            self.record(format!("get_prop {name}"));
            let mut props = self.props.borrow_mut();
            let values = props.entry(name.to_owned()).or_default();
            let value = if values.len() > 1 {
                values.pop_front()
            } else {
                values.front().cloned()
            };
            Ok(value.unwrap_or_default())
        }

        async fn reboot(&self) -> Result<(), DeviceError> {
            self.record("reboot".to_owned());
            *self.reachable_probes.borrow_mut() = 2;
            Ok(())
        }

        async fn ensure_root(&self) -> Result<bool, DeviceError> {
            self.record("ensure_root".to_owned());
            Ok(self.root)
        }

        async fn remount(&self) -> Result<(), DeviceError> {
            self.record("remount".to_owned());
            Ok(())
        }

        async fn disable_verity(&self) -> Result<(), DeviceError> {
            self.record("disable_verity".to_owned());
            Ok(())
        }

        async fn wait_for_device(&self, _timeout: Duration) -> Result<(), DeviceError> {
            self.record("wait_for_device".to_owned());
            Ok(())
        }

        async fn get_state(&self) -> Result<String, DeviceError> {
            self.record("get_state".to_owned());
            let mut probes = self.reachable_probes.borrow_mut();
            if *probes == 0 {
                return Err(DeviceError::Command {
                    command: "get-state".to_owned(),
                    status: "exited with code 1".to_owned(),
                    output: "error: no devices found".to_owned(),
                });
            }
            *probes -= 1;
            Ok("device".to_owned())
        }
    }

    pub(crate) fn fast_reboots() -> RebootPolicy {
        RebootPolicy {
            probe_interval: Duration::from_millis(1),
            boot_poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
            wait_for_device: Duration::from_millis(100),
        }
    }

    pub(crate) fn profile() -> DeviceProfile {
        DeviceProfile {
            sync_clock: false,
            ..DeviceProfile::bluetooth("/gd")
        }
    }

    fn spec() -> WorkerSpec {
        WorkerSpec::builder(
            ["/system/bin/bluetooth_stack_with_facade"],
            Ports {
                main: 8899,
                management: 8897,
                handshake: 8895,
            },
        )
        .label("dut")
        .log_dir("/tmp/logs")
        .build()
    }

    #[test]
    fn test_prepare_runs_the_whole_protocol() {
        let device = FakeDevice::rooted();
        device.script_prop(BOOT_COMPLETED_PROP, &["1"]);
        let bringup = RemoteBringup::new(device, profile()).with_reboot_policy(fast_reboots());

        block_on(bringup.prepare(&spec())).unwrap();

        let device = bringup.device();
        assert_eq!(device.calls_to("reboot"), 0);
        assert_eq!(device.calls_to("forward 8899 8899"), 1);
        assert_eq!(device.calls_to("forward 8897 8897"), 1);
        assert_eq!(device.calls_to("reverse 8895 8895"), 1);
        assert_eq!(device.calls_to("push /gd/target/"), 3);
        assert_eq!(device.calls_to("shell svc bluetooth disable"), 1);
    }

    #[test]
    fn test_verity_is_disabled_with_a_reboot() {
        let device = FakeDevice::rooted();
        device.script_prop(SYSTEM_VERITY_PROP, &["1", ""]);
        device.script_prop(BOOT_COMPLETED_PROP, &["0", "0", "1"]);
        let bringup = RemoteBringup::new(device, profile()).with_reboot_policy(fast_reboots());

        block_on(bringup.ensure_verity_disabled()).unwrap();

        let device = bringup.device();
        assert_eq!(device.calls_to("disable_verity"), 1);
        assert_eq!(device.calls_to("reboot"), 1);
        // Two reachable probes, then the device goes away.
        assert_eq!(device.calls_to("get_state"), 3);
        assert_eq!(device.calls_to("remount"), 1);
    }

    #[test]
    fn test_forward_retried_after_reboot() {
        let device = FakeDevice::rooted();
        device.script_prop(BOOT_COMPLETED_PROP, &["1"]);
        device
            .forwards
            .borrow_mut()
            .extend([Mapping::Rejected("error: cannot bind".to_owned()), Mapping::Port(8899)]);
        let bringup = RemoteBringup::new(device, profile()).with_reboot_policy(fast_reboots());

        block_on(bringup.prepare(&spec())).unwrap();
        assert_eq!(bringup.device().calls_to("reboot"), 1);
        assert_eq!(bringup.device().calls_to("forward 8899 8899"), 2);
    }

    #[test]
    fn test_forward_exhausts_retry_budget() {
        let device = FakeDevice::rooted();
        device.script_prop(BOOT_COMPLETED_PROP, &["1"]);
        device.forwards.borrow_mut().extend([
            Mapping::Rejected("error: cannot bind".to_owned()),
            Mapping::Rejected("error: cannot bind".to_owned()),
        ]);
        let bringup = RemoteBringup::new(device, profile()).with_reboot_policy(fast_reboots());

        assert_matches!(
            block_on(bringup.prepare(&spec())),
            Err(BringupFailure {
                reason: BringupReason::ForwardExhausted { .. },
                ..
            })
        );
        assert_eq!(bringup.device().calls_to("reboot"), 1);
        assert_eq!(bringup.device().calls_to("push"), 0);
    }

    #[test]
    fn test_root_denied_is_fatal() {
        let bringup = RemoteBringup::new(FakeDevice::default(), profile());

        assert_matches!(
            block_on(bringup.prepare(&spec())),
            Err(BringupFailure {
                reason: BringupReason::RootDenied,
                ..
            })
        );
        assert_eq!(bringup.device().calls_to("forward"), 0);
    }

    #[test]
    fn test_boot_never_completes() {
        let device = FakeDevice::rooted();
        device.script_prop(BOOT_COMPLETED_PROP, &["0"]);
        let bringup = RemoteBringup::new(device, profile()).with_reboot_policy(fast_reboots());

        assert_matches!(block_on(bringup.reboot()), Err(BringupReason::BootIncomplete));
    }

    #[test]
    fn test_noisy_quiet_command_is_fatal() {
        let device = FakeDevice::rooted();
        device
            .shell_outputs
            .borrow_mut()
            .insert("logcat -c".to_owned(), "failed to clear".to_owned());
        let bringup = RemoteBringup::new(device, profile());

        assert_matches!(
            block_on(bringup.prepare(&spec())),
            Err(BringupFailure {
                reason: BringupReason::UnexpectedOutput { command, .. },
                ..
            }) if command == "logcat -c"
        );
    }

    #[test]
    fn test_cleanup_pulls_logs() {
        let bringup = RemoteBringup::new(FakeDevice::rooted(), profile());
        let mut report = TeardownReport {
            pid: 1,
            exit: None,
            warnings: Vec::new(),
            failure: None,
        };

        block_on(bringup.cleanup(&spec(), &mut report));

        assert!(report.warnings.is_empty());
        let device = bringup.device();
        assert_eq!(device.calls_to("remove_forward"), 2);
        assert_eq!(device.calls_to("remove_reverse 8895"), 1);
        assert_eq!(
            device.calls_to("pull /data/misc/bluetooth/logs/system_log /tmp/logs/dut_system_log"),
            1
        );
    }
}
