// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::time::Duration;

use hypervisor::{Hypervisor, HypervisorError, HypervisorVmError, VmBuilder, VmEvent};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BootConfig, ConsolePort, NetworkAttachment, ValidationError, VmConfig};

/// Longest time the host loop runs before pending events are looked at.
const HOST_LOOP_SLICE: Duration = Duration::from_millis(100);

/// Errors associated with VM management
#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot create the virtual machine builder: {0}")]
    EngineBuilder(#[source] HypervisorError),

    #[error("Cannot set up the EFI variable store: {0}")]
    StoreCreationFailed(#[source] HypervisorVmError),

    #[error("Cannot attach disk image {0}: {1}")]
    AttachmentFailed(PathBuf, #[source] HypervisorVmError),

    #[error("Cannot configure the virtual machine: {0}")]
    Configure(#[source] HypervisorVmError),

    #[error("Invalid virtual machine configuration: {0}")]
    ValidationFailed(#[source] ValidationError),

    #[error("Virtual machine configuration rejected: {0}")]
    EngineValidation(#[source] HypervisorVmError),

    #[error("Cannot create the virtual machine: {0}")]
    EngineBuild(#[source] HypervisorVmError),

    #[error("Cannot request the virtual machine start: {0}")]
    StartRequest(#[source] HypervisorVmError),

    #[error("Failed to start the virtual machine. {0}")]
    EngineStartFailed(String),

    #[error("Virtual machine stopped with error. {0}")]
    EngineRuntimeFailed(String),

    #[error("Virtual machine network device \"{device}\" was disconnected with error. {detail}")]
    NetworkDisconnected { device: String, detail: String },

    #[error("Virtual machine event channel closed before the guest stopped")]
    EventChannelClosed,

    #[error("Invalid VM state transition: {0:?} to {1:?}")]
    InvalidStateTransition(VmState, VmState),
}
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum VmState {
    Configuring,
    Validating,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl VmState {
    fn valid_transition(self, new_state: VmState) -> Result<()> {
        match self {
            VmState::Configuring => match new_state {
                VmState::Validating | VmState::Failed => Ok(()),
                _ => Err(Error::InvalidStateTransition(self, new_state)),
            },

            VmState::Validating => match new_state {
                VmState::Starting | VmState::Failed => Ok(()),
                _ => Err(Error::InvalidStateTransition(self, new_state)),
            },

            VmState::Starting => match new_state {
                VmState::Running | VmState::Stopped | VmState::Failed => Ok(()),
                _ => Err(Error::InvalidStateTransition(self, new_state)),
            },

            VmState::Running => match new_state {
                VmState::Stopped | VmState::Failed => Ok(()),
                _ => Err(Error::InvalidStateTransition(self, new_state)),
            },

            VmState::Stopped | VmState::Failed => Err(Error::InvalidStateTransition(self, new_state)),
        }
    }
}

/// How a virtual machine session ended.
#[derive(Debug)]
pub enum LifecycleOutcome {
    /// The guest powered itself off.
    Stopped,
    Failed(Error),
}

pub struct Vm {
    vm: Box<dyn hypervisor::Vm>,
    events: Receiver<VmEvent>,
    state: VmState,
}

impl Vm {
    /// Hands `config` to the engine and validates it.
    ///
    /// An EFI variable store is opened when its path exists and created
    /// otherwise.
    pub fn new(config: VmConfig, hypervisor: &dyn Hypervisor) -> Result<Self> {
        let mut state = VmState::Configuring;

        let mut builder = hypervisor
            .create_vm_builder()
            .map_err(Error::EngineBuilder)?;
        Self::configure(&config, builder.as_mut())?;

        state.valid_transition(VmState::Validating)?;
        state = VmState::Validating;

        config
            .validate(&hypervisor.resource_limits())
            .map_err(Error::ValidationFailed)?;
        builder.validate().map_err(Error::EngineValidation)?;

        let (events_tx, events) = channel();
        let vm = builder.build(events_tx).map_err(Error::EngineBuild)?;

        Ok(Vm {
            vm,
            events,
            state,
        })
    }

    fn configure(config: &VmConfig, builder: &mut dyn VmBuilder) -> Result<()> {
        builder.set_cpus(config.cpus.boot_vcpus);
        builder.set_memory(config.memory.size);

        match &config.boot {
            BootConfig::Efi { variable_store } => {
                info!("Configuring EFI boot loader.");
                let create = !variable_store.exists();
                if create {
                    info!(
                        "Creating new EFI variable store at {}.",
                        variable_store.display()
                    );
                } else {
                    info!(
                        "Using existing EFI variable store at {}.",
                        variable_store.display()
                    );
                }
                builder
                    .set_efi_boot_loader(variable_store, create)
                    .map_err(Error::StoreCreationFailed)?;
            }
            BootConfig::Linux {
                kernel,
                command_line,
                initial_ramdisk,
            } => {
                info!("Configuring Linux boot loader.");
                if let Some(command_line) = command_line {
                    info!("Using kernel command line \"{command_line}\".");
                }
                if let Some(initial_ramdisk) = initial_ramdisk {
                    info!("Using initial ramdisk at {}.", initial_ramdisk.display());
                }
                builder
                    .set_linux_boot_loader(
                        kernel,
                        command_line.as_deref(),
                        initial_ramdisk.as_deref(),
                    )
                    .map_err(Error::Configure)?;
            }
        }

        for disk in &config.disks {
            debug!(
                "Attaching disk image {} (read-only: {})",
                disk.path.display(),
                disk.readonly
            );
            builder
                .add_disk(&disk.path, disk.readonly)
                .map_err(|e| Error::AttachmentFailed(disk.path.clone(), e))?;
        }

        for net in &config.net {
            match net.attachment {
                NetworkAttachment::Nat => builder
                    .add_nat_network(net.mac)
                    .map_err(Error::Configure)?,
            }
        }

        let platform = &config.platform;
        builder.set_generic_platform().map_err(Error::Configure)?;
        if platform.entropy {
            builder.add_entropy_device().map_err(Error::Configure)?;
        }
        if let Some(display) = &platform.display {
            builder
                .add_graphics_device(display.width, display.height)
                .map_err(Error::Configure)?;
        }
        if let Some(ConsolePort::SpiceAgent { port }) = platform.console {
            builder
                .add_spice_agent_console(port)
                .map_err(Error::Configure)?;
        }
        if platform.keyboard {
            builder.add_usb_keyboard().map_err(Error::Configure)?;
        }
        if platform.pointing_device {
            builder.add_usb_pointing_device().map_err(Error::Configure)?;
        }

        Ok(())
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    fn set_state(&mut self, new_state: VmState) -> Result<()> {
        self.state.valid_transition(new_state)?;
        self.state = new_state;
        Ok(())
    }

    /// Requests the start. Completion is observed by [`Vm::run`].
    pub fn start(&mut self) -> Result<()> {
        self.set_state(VmState::Starting)?;

        if let Err(e) = self.vm.start() {
            self.state = VmState::Failed;
            return Err(Error::StartRequest(e));
        }
        info!("Starting virtual machine.");

        Ok(())
    }

    /// Drives the engine until the session ends.
    pub fn run(&mut self) -> LifecycleOutcome {
        if self.state != VmState::Starting {
            return LifecycleOutcome::Failed(Error::InvalidStateTransition(
                self.state,
                VmState::Running,
            ));
        }

        loop {
            self.vm.run_host_loop(HOST_LOOP_SLICE);

            loop {
                match self.events.try_recv() {
                    Ok(event) => {
                        if let Some(outcome) = self.handle_event(event) {
                            return outcome;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.fail(Error::EventChannelClosed),
                }
            }
        }
    }

    fn handle_event(&mut self, event: VmEvent) -> Option<LifecycleOutcome> {
        debug!("Handling {event:?} in state {:?}", self.state);

        match event {
            VmEvent::Started => {
                if self.state == VmState::Running {
                    warn!("Virtual machine reported as started twice");
                    return None;
                }
                if let Err(e) = self.set_state(VmState::Running) {
                    return Some(self.fail(e));
                }
                info!("Virtual machine started.");
                None
            }
            VmEvent::StartFailed(detail) => Some(self.fail(Error::EngineStartFailed(detail))),
            VmEvent::GuestStopped => match self.set_state(VmState::Stopped) {
                Ok(()) => Some(LifecycleOutcome::Stopped),
                Err(e) => Some(self.fail(e)),
            },
            VmEvent::StoppedWithError(detail) => {
                Some(self.fail(Error::EngineRuntimeFailed(detail)))
            }
            VmEvent::NetworkDisconnected { device, detail } => {
                Some(self.fail(Error::NetworkDisconnected { device, detail }))
            }
        }
    }

    fn fail(&mut self, error: Error) -> LifecycleOutcome {
        if self.set_state(VmState::Failed).is_err() {
            warn!("Virtual machine failed in state {:?}", self.state);
            self.state = VmState::Failed;
        }
        LifecycleOutcome::Failed(error)
    }
}
