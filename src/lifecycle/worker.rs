//! Immutable description of a worker run.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use colored::Color;

/// Type identifier used in artefact names when none is given.
pub const DEFAULT_TYPE_IDENTIFIER: &str = "GdDevice";

/// Flag through which the worker is told where to write its capture log.
pub const DEFAULT_CAPTURE_LOG_FLAG: &str = "--btsnoop";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The three ports a worker is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ports {
    /// Main RPC entry port for the worker services.
    pub main: u16,
    /// Management RPC port used to start and stop services.
    pub management: u16,
    /// Local port the worker connects to once it is ready.
    pub handshake: u16,
}

/// Bounds for every blocking step of the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub graceful_stop: Duration,
    pub forced_kill: Duration,
    pub drain_join: Duration,
    pub channel_ready: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_TIMEOUT,
            graceful_stop: DEFAULT_TIMEOUT,
            forced_kill: DEFAULT_TIMEOUT,
            drain_join: DEFAULT_TIMEOUT,
            channel_ready: DEFAULT_TIMEOUT,
        }
    }
}

/// Everything needed to run one worker.
///
/// Built once with [`WorkerSpec::builder`] and never mutated afterwards. The command line always
/// carries a capture-log argument: when the caller does not provide one, the builder appends it,
/// pointing into the log directory.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    command: Vec<String>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    ports: Ports,
    label: String,
    type_identifier: String,
    verbose: bool,
    log_dir: PathBuf,
    timeouts: Timeouts,
}

impl WorkerSpec {
    /// Starts building the spec of a worker run with `command` on `ports`.
    pub fn builder(
        command: impl IntoIterator<Item = impl Into<String>>,
        ports: Ports,
    ) -> WorkerSpecBuilder {
        WorkerSpecBuilder {
            command: command.into_iter().map(Into::into).collect(),
            ports,
            cwd: None,
            env: BTreeMap::new(),
            label: "worker".to_owned(),
            type_identifier: DEFAULT_TYPE_IDENTIFIER.to_owned(),
            verbose: false,
            log_dir: std::env::temp_dir(),
            timeouts: Timeouts::default(),
            capture_log_flag: Some(DEFAULT_CAPTURE_LOG_FLAG.to_owned()),
        }
    }

    /// Program and arguments, capture-log argument included.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Working directory of the worker.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Environment overrides applied on top of the ambient environment.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// Human-readable name of the worker.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Kind of worker, used in artefact names.
    pub fn type_identifier(&self) -> &str {
        &self.type_identifier
    }

    /// Whether the output is mirrored to the console.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Directory receiving the run artefacts.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Path of the file receiving the worker's combined output.
    pub fn backing_log_path(&self) -> PathBuf {
        self.log_dir.join(format!(
            "{}_{}_backing_logs.txt",
            self.type_identifier, self.label
        ))
    }

    /// Colour of the label when the output is mirrored to the console.
    pub fn label_color(&self) -> Color {
        if self.label.contains("cert") {
            Color::Blue
        } else {
            Color::Yellow
        }
    }
}

/// Builder of [`WorkerSpec`], see [`WorkerSpec::builder`].
pub struct WorkerSpecBuilder {
    command: Vec<String>,
    ports: Ports,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    label: String,
    type_identifier: String,
    verbose: bool,
    log_dir: PathBuf,
    timeouts: Timeouts,
    capture_log_flag: Option<String>,
}

impl WorkerSpecBuilder {
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn type_identifier(mut self, type_identifier: impl Into<String>) -> Self {
        self.type_identifier = type_identifier.into();
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Overrides the capture-log flag; `None` disables synthesis of the argument.
    pub fn capture_log_flag(mut self, flag: Option<impl Into<String>>) -> Self {
        self.capture_log_flag = flag.map(Into::into);
        self
    }

    pub fn build(self) -> WorkerSpec {
        let mut command = self.command;
        if let Some(flag) = self.capture_log_flag {
            let prefix = format!("{flag}=");
            if !command.iter().any(|arg| arg.starts_with(&prefix)) {
                let capture_log = self
                    .log_dir
                    .join(format!("{}_btsnoop_hci.log", self.label));
                command.push(format!("{prefix}{}", capture_log.display()));
            }
        }
        WorkerSpec {
            command,
            cwd: self
                .cwd
                .or_else(|| std::env::current_dir().ok())
                .unwrap_or_else(|| PathBuf::from(".")),
            env: self.env,
            ports: self.ports,
            label: self.label,
            type_identifier: self.type_identifier,
            verbose: self.verbose,
            log_dir: self.log_dir,
            timeouts: self.timeouts,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const PORTS: Ports = Ports {
        main: 8999,
        management: 8998,
        handshake: 8997,
    };

    #[test]
    fn test_capture_log_argument_is_synthesised() {
        let spec = WorkerSpec::builder(["worker", "--grpc-port=8999"], PORTS)
            .label("cert_stack")
            .log_dir("/tmp/run")
            .build();
        assert_eq!(
            spec.command(),
            [
                "worker",
                "--grpc-port=8999",
                "--btsnoop=/tmp/run/cert_stack_btsnoop_hci.log"
            ]
        );
        assert_eq!(
            spec.backing_log_path(),
            Path::new("/tmp/run/GdDevice_cert_stack_backing_logs.txt")
        );
        assert_eq!(spec.label_color(), Color::Blue);
    }

    #[test]
    fn test_explicit_capture_log_argument_is_kept() {
        let spec = WorkerSpec::builder(["worker", "--btsnoop=/elsewhere.log"], PORTS)
            .label("dut")
            .build();
        assert_eq!(spec.command(), ["worker", "--btsnoop=/elsewhere.log"]);
        assert_eq!(spec.label_color(), Color::Yellow);
    }

    #[test]
    fn test_capture_log_synthesis_can_be_disabled() {
        let spec = WorkerSpec::builder(["sleep", "1000"], PORTS)
            .capture_log_flag(None::<String>)
            .build();
        assert_eq!(spec.command(), ["sleep", "1000"]);
    }
}
