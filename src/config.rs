//! Harness configuration of the workers to run.
//!
//! Each entry describes one worker. Command arguments may reference the entry through `$GD_ROOT`,
//! `$(grpc_port)`, `$(grpc_root_server_port)`, `$(rootcanal_port)`, `$(signal_port)` and
//! `$(serial_number)`, which are substituted when the [`WorkerSpec`] is built.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::lifecycle::worker::{Ports, WorkerSpec};

/// Serial numbers left over from configuration templates.
const PLACEHOLDER_SERIALS: [&str; 2] = ["DUT", "CERT"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration is empty")]
    Empty,
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("serial number {0:?} is a placeholder, did you forget to configure it?")]
    PlaceholderSerial(String),
    #[error("[{label}] {field} must not be empty")]
    EmptyField { label: String, field: &'static str },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub cmd: Vec<String>,
    pub grpc_port: u16,
    pub grpc_root_server_port: u16,
    pub signal_port: u16,
    pub label: String,
    pub name: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub rootcanal_port: Option<u16>,
    #[serde(default)]
    pub verbose_mode: bool,
}

/// Parses a JSON list of worker entries.
pub fn load_configs(json: &str) -> Result<Vec<WorkerConfig>, ConfigError> {
    let configs: Vec<WorkerConfig> = serde_json::from_str(json)?;
    if configs.is_empty() {
        return Err(ConfigError::Empty);
    }
    Ok(configs)
}

impl WorkerConfig {
    /// Whether the worker runs on a remote device.
    pub fn is_device_hosted(&self) -> bool {
        self.serial_number.as_deref().is_some_and(|serial| !serial.is_empty())
    }

    /// Substitutes the variables of `arg`.
    pub fn replace_vars(&self, arg: &str, root: &Path) -> Result<String, ConfigError> {
        let serial_number = self.serial_number.as_deref().unwrap_or_default();
        if PLACEHOLDER_SERIALS.contains(&serial_number) {
            return Err(ConfigError::PlaceholderSerial(serial_number.to_owned()));
        }
        let rootcanal_port = self
            .rootcanal_port
            .map(|port| port.to_string())
            .unwrap_or_default();
        Ok(arg
            .replace("$GD_ROOT", &root.to_string_lossy())
            .replace("$(grpc_port)", &self.grpc_port.to_string())
            .replace(
                "$(grpc_root_server_port)",
                &self.grpc_root_server_port.to_string(),
            )
            .replace("$(rootcanal_port)", &rootcanal_port)
            .replace("$(signal_port)", &self.signal_port.to_string())
            .replace("$(serial_number)", serial_number))
    }

    /// Builds the spec of this worker, run from `root` with its logs in `log_dir`.
    pub fn to_spec(&self, root: &Path, log_dir: &Path) -> Result<WorkerSpec, ConfigError> {
        for (field, value) in [("label", &self.label), ("name", &self.name)] {
            if value.is_empty() {
                return Err(ConfigError::EmptyField {
                    label: self.label.clone(),
                    field,
                });
            }
        }
        if self.cmd.is_empty() || self.cmd.iter().any(String::is_empty) {
            return Err(ConfigError::EmptyField {
                label: self.label.clone(),
                field: "cmd",
            });
        }

        let command = self
            .cmd
            .iter()
            .map(|arg| self.replace_vars(arg, root))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            label = %self.label,
            name = %self.name,
            ?command,
            "resolved worker command"
        );

        Ok(WorkerSpec::builder(
            command,
            Ports {
                main: self.grpc_port,
                management: self.grpc_root_server_port,
                handshake: self.signal_port,
            },
        )
        .cwd(root)
        .label(&self.label)
        .verbose(self.verbose_mode)
        .log_dir(log_dir)
        .build())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const CONFIG: &str = r#"[
        {
            "cmd": ["$GD_ROOT/bluetooth_stack_with_facade", "--grpc-port=$(grpc_port)",
                    "--root-server-port=$(grpc_root_server_port)", "--signal-port=$(signal_port)",
                    "--rootcanal-port=$(rootcanal_port)"],
            "grpc_port": 8999,
            "grpc_root_server_port": 8997,
            "signal_port": 8895,
            "rootcanal_port": 6402,
            "label": "cert",
            "name": "Cert Device"
        },
        {
            "cmd": ["$GD_ROOT/bluetooth_stack_with_facade", "-s", "$(serial_number)"],
            "grpc_port": 8899,
            "grpc_root_server_port": 8897,
            "signal_port": 8894,
            "label": "dut",
            "name": "DUT Device",
            "serial_number": "ABC123",
            "verbose_mode": true
        }
    ]"#;

    #[test]
    fn test_load_and_resolve() {
        let configs = load_configs(CONFIG).unwrap();
        assert_eq!(configs.len(), 2);
        assert!(!configs[0].is_device_hosted());
        assert!(configs[1].is_device_hosted());

        let spec = configs[0]
            .to_spec(Path::new("/gd"), Path::new("/logs"))
            .unwrap();
        assert_eq!(
            spec.command(),
            [
                "/gd/bluetooth_stack_with_facade",
                "--grpc-port=8999",
                "--root-server-port=8997",
                "--signal-port=8895",
                "--rootcanal-port=6402",
                "--btsnoop=/logs/cert_btsnoop_hci.log",
            ]
        );
        assert_eq!(spec.ports().handshake, 8895);
        assert_eq!(spec.cwd(), Path::new("/gd"));
        assert!(!spec.verbose());

        let spec = configs[1]
            .to_spec(Path::new("/gd"), Path::new("/logs"))
            .unwrap();
        assert_eq!(spec.command()[2], "ABC123");
        assert!(spec.verbose());
    }

    #[test]
    fn test_empty_configuration_is_rejected() {
        assert_matches!(load_configs("[]"), Err(ConfigError::Empty));
        assert_matches!(load_configs("{}"), Err(ConfigError::Parse(_)));
    }

    #[test]
    fn test_placeholder_serial_is_rejected() {
        let mut config = load_configs(CONFIG).unwrap().remove(1);
        config.serial_number = Some("DUT".to_owned());
        assert_matches!(
            config.to_spec(Path::new("/gd"), Path::new("/logs")),
            Err(ConfigError::PlaceholderSerial(serial)) if serial == "DUT"
        );
    }

    #[test]
    fn test_empty_argument_is_rejected() {
        let mut config = load_configs(CONFIG).unwrap().remove(0);
        config.cmd.push(String::new());
        assert_matches!(
            config.to_spec(Path::new("/gd"), Path::new("/logs")),
            Err(ConfigError::EmptyField { field: "cmd", .. })
        );
    }
}
