//! Host-only and device-hosted workers behind a single type.

use std::path::Path;

use crate::{
    config::WorkerConfig,
    error::{LifecycleError, StartError, TeardownReport},
    lifecycle::{
        supervisor::{PortCheck, ProcessSupervisor, WorkerHandle},
        worker::WorkerSpec,
        LifecycleState,
    },
    operate::{capnp::CapnpChannel, channel::RpcChannel},
    remote::{
        adb::Adb,
        bringup::{DeviceProfile, RemoteBringup},
        RemoteDeviceControl,
    },
};

/// Where the worker runs.
pub enum Variant<D> {
    /// On this machine; all of its ports must be free here.
    HostOnly,
    /// On a remote device whose ports are mapped onto this machine.
    DeviceHosted(RemoteBringup<D>),
}

/// One worker, its supervisor and, for remote workers, the device preparation.
pub struct Controller<D = Adb, C: RpcChannel = CapnpChannel> {
    supervisor: ProcessSupervisor<C>,
    variant: Variant<D>,
}

impl<D: RemoteDeviceControl, C: RpcChannel> Controller<D, C> {
    pub fn new(spec: WorkerSpec, variant: Variant<D>) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(spec),
            variant,
        }
    }

    pub fn host_only(spec: WorkerSpec) -> Self {
        Self::new(spec, Variant::HostOnly)
    }

    pub fn device_hosted(spec: WorkerSpec, bringup: RemoteBringup<D>) -> Self {
        Self::new(spec, Variant::DeviceHosted(bringup))
    }

    pub fn variant(&self) -> &Variant<D> {
        &self.variant
    }

    pub fn supervisor(&self) -> &ProcessSupervisor<C> {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut ProcessSupervisor<C> {
        &mut self.supervisor
    }

    /// Prepares the device if any, then starts the worker.
    pub async fn start(&mut self) -> Result<&WorkerHandle, StartError> {
        match &self.variant {
            Variant::HostOnly => self.supervisor.start(PortCheck::All).await,
            Variant::DeviceHosted(bringup) => {
                if self.supervisor.state() != LifecycleState::NotStarted {
                    return Err(LifecycleError {
                        label: self.supervisor.label().to_owned(),
                        operation: "start",
                        state: self.supervisor.state(),
                    }
                    .into());
                }
                bringup.prepare(self.supervisor.spec()).await?;
                // The RPC ports are held on this machine by the port mappings.
                self.supervisor.start(PortCheck::HandshakeOnly).await
            }
        }
    }

    /// Stops the worker, then cleans up the device if any.
    pub async fn teardown(&mut self) -> Result<TeardownReport, LifecycleError> {
        let mut report = self.supervisor.teardown().await?;
        if let Variant::DeviceHosted(bringup) = &self.variant {
            bringup.cleanup(self.supervisor.spec(), &mut report).await;
        }
        for warning in &report.warnings {
            tracing::warn!(label = self.supervisor.label(), "{warning}");
        }
        Ok(report)
    }
}

/// Starts one controller per configuration entry, on a remote device when it has a serial number.
///
/// If any of them fails to start, the ones already running are torn down before returning.
pub async fn create_all(
    configs: &[WorkerConfig],
    root: &Path,
    log_dir: &Path,
) -> Result<Vec<Controller>, StartError> {
    let mut controllers = Vec::with_capacity(configs.len());
    for config in configs {
        let res = async {
            let spec = config.to_spec(root, log_dir)?;
            let mut controller: Controller = match &config.serial_number {
                Some(serial) if config.is_device_hosted() => Controller::device_hosted(
                    spec,
                    RemoteBringup::new(Adb::new(serial), DeviceProfile::bluetooth(root)),
                ),
                _ => Controller::host_only(spec),
            };
            controller.start().await?;
            Ok::<_, StartError>(controller)
        }
        .await;
        match res {
            Ok(controller) => controllers.push(controller),
            Err(e) => {
                destroy_all(controllers).await;
                return Err(e);
            }
        }
    }
    Ok(controllers)
}

/// Tears down every controller, logging failures instead of stopping at the first one.
pub async fn destroy_all<D: RemoteDeviceControl, C: RpcChannel>(
    controllers: Vec<Controller<D, C>>,
) {
    for mut controller in controllers {
        let label = controller.supervisor().label().to_owned();
        match controller.teardown().await.map(TeardownReport::into_result) {
            Ok(Ok(_)) => {}
            Ok(Err(failure)) => {
                tracing::error!(label, "failed to clean up properly: {failure}")
            }
            Err(e) => tracing::error!(label, "failed to clean up properly: {e}"),
        }
    }
}
