//! The fleet registry: every running controller, keyed by serial, plus
//! the operator command surface over them.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;

use crate::config::Config;
use crate::controller::{Controller, MachineHandle, OperatorCommand};
use crate::job::JobQueue;
use crate::machine::{AutomationConfig, MachineSnapshot};
use crate::noop::NoopTransport;
use crate::traits::{FileStore, Transport};

/// All registered devices. Cheap to share; every method takes `&self`.
#[derive(Default)]
pub struct Fleet {
    machines: DashMap<String, MachineHandle>,
}

impl Fleet {
    /// An empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn controllers for every machine in the configuration, all
    /// backed by recording no-op transports. Real transports register
    /// through [Fleet::register] instead.
    pub fn from_config(config: &Config, queue: Arc<JobQueue>, files: Arc<dyn FileStore>) -> Self {
        let fleet = Self::new();
        for entry in &config.machines {
            let handle = Controller::spawn(
                &entry.serial,
                entry.display_name(),
                entry.make_model(),
                entry.automation(),
                queue.clone(),
                Box::new(NoopTransport::new()),
                files.clone(),
                config.timeouts,
                config.watchdog,
            );
            fleet.register(handle);
        }
        fleet
    }

    /// Add a device's handle. Replaces any previous registration for the
    /// same serial.
    pub fn register(&self, handle: MachineHandle) {
        tracing::info!(serial = handle.serial(), "machine registered");
        self.machines.insert(handle.serial().to_owned(), handle);
    }

    /// Spawn and register a controller for one device with an explicit
    /// transport.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_machine(
        &self,
        serial: &str,
        name: &str,
        automation: AutomationConfig,
        queue: Arc<JobQueue>,
        transport: Box<dyn Transport>,
        files: Arc<dyn FileStore>,
        config: &Config,
    ) -> MachineHandle {
        let handle = Controller::spawn(
            serial,
            name,
            Default::default(),
            automation,
            queue,
            transport,
            files,
            config.timeouts,
            config.watchdog,
        );
        self.register(handle.clone());
        handle
    }

    /// The handle for one device.
    pub fn get(&self, serial: &str) -> Option<MachineHandle> {
        self.machines.get(serial).map(|h| h.clone())
    }

    /// Current snapshots of every registered device.
    pub fn snapshots(&self) -> Vec<MachineSnapshot> {
        let mut snapshots: Vec<MachineSnapshot> = self.machines.iter().map(|h| h.snapshot()).collect();
        snapshots.sort_by(|a, b| a.serial.cmp(&b.serial));
        snapshots
    }

    /// Deliver an operator command to one device.
    pub async fn command(&self, serial: &str, cmd: OperatorCommand) -> Result<()> {
        let handle = self
            .get(serial)
            .ok_or_else(|| anyhow::anyhow!("no such machine: {}", serial))?;
        handle.command(cmd).await
    }

    /// Operator confirms the build surface of a device is empty.
    pub async fn confirm_clearance(&self, serial: &str) -> Result<()> {
        self.command(serial, OperatorCommand::ConfirmClearance).await
    }

    /// Operator override: reset a device to idle without the thermal gate.
    pub async fn force_clear(&self, serial: &str) -> Result<()> {
        self.command(serial, OperatorCommand::ForceClear).await
    }

    /// Pause a device's current print.
    pub async fn pause(&self, serial: &str) -> Result<()> {
        self.command(serial, OperatorCommand::Pause).await
    }

    /// Resume a device's paused print.
    pub async fn resume(&self, serial: &str) -> Result<()> {
        self.command(serial, OperatorCommand::Resume).await
    }

    /// Cancel a device's current job.
    pub async fn cancel(&self, serial: &str) -> Result<()> {
        self.command(serial, OperatorCommand::Cancel).await
    }

    /// Acknowledge a device error.
    pub async fn clear_error(&self, serial: &str) -> Result<()> {
        self.command(serial, OperatorCommand::ClearError).await
    }

    /// Replace a device's automation policy.
    pub async fn set_automation(&self, serial: &str, automation: AutomationConfig) -> Result<()> {
        self.command(serial, OperatorCommand::SetAutomation(automation)).await
    }
}
