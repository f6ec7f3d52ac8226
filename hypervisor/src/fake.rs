// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! An engine that never runs a guest. It records what it was asked to build
//! and replays a scripted sequence of [`VmEvent`]s, one per host loop turn.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use net_util::MacAddr;

use crate::hypervisor::{self, Hypervisor, ResourceLimits};
use crate::vm::{self, HypervisorVmError, Vm, VmBuilder, VmEvent};

/// Limits close to what a small Apple silicon host reports.
pub const DEFAULT_LIMITS: ResourceLimits = ResourceLimits {
    min_cpus: 1,
    max_cpus: 8,
    min_memory: 128 << 20,
    max_memory: 16 << 30,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeCall {
    SetCpus(u64),
    SetMemory(u64),
    EfiBootLoader {
        variable_store: PathBuf,
        create: bool,
    },
    LinuxBootLoader {
        kernel: PathBuf,
        command_line: Option<String>,
        initial_ramdisk: Option<PathBuf>,
    },
    Disk {
        path: PathBuf,
        read_only: bool,
    },
    NatNetwork(Option<MacAddr>),
    GenericPlatform,
    EntropyDevice,
    GraphicsDevice {
        width: u32,
        height: u32,
    },
    SpiceAgentConsole(u32),
    UsbKeyboard,
    UsbPointingDevice,
    Validate,
    Build,
    Start,
}

/// What the fake engine does once a guest is built.
#[derive(Clone, Debug, Default)]
pub struct FakeScript {
    /// Events delivered after a successful start, one per host loop turn.
    /// The event channel is dropped once they run out.
    pub events: Vec<VmEvent>,
    pub validate_error: Option<String>,
    pub start_error: Option<String>,
}

pub struct FakeHypervisor {
    limits: ResourceLimits,
    script: FakeScript,
    calls: Arc<Mutex<Vec<FakeCall>>>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new(DEFAULT_LIMITS)
    }
}

impl FakeHypervisor {
    pub fn new(limits: ResourceLimits) -> Self {
        FakeHypervisor {
            limits,
            script: FakeScript::default(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_script(mut self, script: FakeScript) -> Self {
        self.script = script;
        self
    }

    /// Every call made so far against builders and Vms of this engine.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Hypervisor for FakeHypervisor {
    fn resource_limits(&self) -> ResourceLimits {
        self.limits
    }

    fn create_vm_builder(&self) -> hypervisor::Result<Box<dyn VmBuilder>> {
        Ok(Box::new(FakeVmBuilder {
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}

struct FakeVmBuilder {
    script: FakeScript,
    calls: Arc<Mutex<Vec<FakeCall>>>,
}

impl FakeVmBuilder {
    fn record(&self, call: FakeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl VmBuilder for FakeVmBuilder {
    fn set_cpus(&mut self, count: u64) {
        self.record(FakeCall::SetCpus(count));
    }

    fn set_memory(&mut self, size: u64) {
        self.record(FakeCall::SetMemory(size));
    }

    fn set_efi_boot_loader(&mut self, variable_store: &Path, create: bool) -> vm::Result<()> {
        if create {
            File::create(variable_store).map_err(|e| HypervisorVmError::CreateVariableStore {
                path: variable_store.to_path_buf(),
                source: e.into(),
            })?;
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(variable_store)
                .map_err(|e| HypervisorVmError::OpenVariableStore {
                    path: variable_store.to_path_buf(),
                    source: e.into(),
                })?;
        }

        self.record(FakeCall::EfiBootLoader {
            variable_store: variable_store.to_path_buf(),
            create,
        });
        Ok(())
    }

    fn set_linux_boot_loader(
        &mut self,
        kernel: &Path,
        command_line: Option<&str>,
        initial_ramdisk: Option<&Path>,
    ) -> vm::Result<()> {
        self.record(FakeCall::LinuxBootLoader {
            kernel: kernel.to_path_buf(),
            command_line: command_line.map(str::to_owned),
            initial_ramdisk: initial_ramdisk.map(Path::to_path_buf),
        });
        Ok(())
    }

    fn add_disk(&mut self, path: &Path, read_only: bool) -> vm::Result<()> {
        OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| HypervisorVmError::AttachDisk {
                path: path.to_path_buf(),
                source: e.into(),
            })?;

        self.record(FakeCall::Disk {
            path: path.to_path_buf(),
            read_only,
        });
        Ok(())
    }

    fn add_nat_network(&mut self, mac: Option<MacAddr>) -> vm::Result<()> {
        self.record(FakeCall::NatNetwork(mac));
        Ok(())
    }

    fn set_generic_platform(&mut self) -> vm::Result<()> {
        self.record(FakeCall::GenericPlatform);
        Ok(())
    }

    fn add_entropy_device(&mut self) -> vm::Result<()> {
        self.record(FakeCall::EntropyDevice);
        Ok(())
    }

    fn add_graphics_device(&mut self, width: u32, height: u32) -> vm::Result<()> {
        self.record(FakeCall::GraphicsDevice { width, height });
        Ok(())
    }

    fn add_spice_agent_console(&mut self, port: u32) -> vm::Result<()> {
        self.record(FakeCall::SpiceAgentConsole(port));
        Ok(())
    }

    fn add_usb_keyboard(&mut self) -> vm::Result<()> {
        self.record(FakeCall::UsbKeyboard);
        Ok(())
    }

    fn add_usb_pointing_device(&mut self) -> vm::Result<()> {
        self.record(FakeCall::UsbPointingDevice);
        Ok(())
    }

    fn validate(&self) -> vm::Result<()> {
        self.record(FakeCall::Validate);
        match &self.script.validate_error {
            Some(reason) => Err(HypervisorVmError::Validate(anyhow!("{reason}"))),
            None => Ok(()),
        }
    }

    fn build(self: Box<Self>, events: Sender<VmEvent>) -> vm::Result<Box<dyn Vm>> {
        self.record(FakeCall::Build);
        Ok(Box::new(FakeVm {
            start_error: self.script.start_error,
            pending: Mutex::new(VecDeque::new()),
            scripted: Mutex::new(Some(self.script.events.into())),
            events: Mutex::new(Some(events)),
            calls: self.calls,
        }))
    }
}

struct FakeVm {
    start_error: Option<String>,
    pending: Mutex<VecDeque<VmEvent>>,
    scripted: Mutex<Option<VecDeque<VmEvent>>>,
    events: Mutex<Option<Sender<VmEvent>>>,
    calls: Arc<Mutex<Vec<FakeCall>>>,
}

impl Vm for FakeVm {
    fn start(&self) -> vm::Result<()> {
        self.calls.lock().unwrap().push(FakeCall::Start);

        let mut pending = self.pending.lock().unwrap();
        match &self.start_error {
            Some(reason) => pending.push_back(VmEvent::StartFailed(reason.clone())),
            None => {
                pending.push_back(VmEvent::Started);
                if let Some(scripted) = self.scripted.lock().unwrap().take() {
                    pending.extend(scripted);
                }
            }
        }

        Ok(())
    }

    fn run_host_loop(&self, timeout: Duration) {
        let mut events = self.events.lock().unwrap();
        let Some(sender) = events.as_ref() else {
            std::thread::sleep(timeout);
            return;
        };

        match self.pending.lock().unwrap().pop_front() {
            // Sending fails once the controller dropped its receiver.
            Some(event) => {
                let _ = sender.send(event);
            }
            None => *events = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use vmm_sys_util::tempdir::TempDir;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_fake_records_calls() {
        let hv = FakeHypervisor::default();
        let mut builder = hv.create_vm_builder().unwrap();
        let disk = TempFile::new().unwrap();

        builder.set_cpus(2);
        builder.set_memory(2 << 30);
        builder.add_disk(disk.as_path(), true).unwrap();
        builder.add_nat_network(None).unwrap();
        builder.validate().unwrap();

        assert_eq!(
            hv.calls(),
            vec![
                FakeCall::SetCpus(2),
                FakeCall::SetMemory(2 << 30),
                FakeCall::Disk {
                    path: disk.as_path().to_path_buf(),
                    read_only: true,
                },
                FakeCall::NatNetwork(None),
                FakeCall::Validate,
            ]
        );
    }

    #[test]
    fn test_fake_variable_store() {
        let dir = TempDir::new().unwrap();
        let store = dir.as_path().join("efi_vars.fd");
        let hv = FakeHypervisor::default();
        let mut builder = hv.create_vm_builder().unwrap();

        assert!(matches!(
            builder.set_efi_boot_loader(&store, false),
            Err(HypervisorVmError::OpenVariableStore { .. })
        ));
        builder.set_efi_boot_loader(&store, true).unwrap();
        assert!(store.exists());
        builder.set_efi_boot_loader(&store, false).unwrap();

        let missing = dir.as_path().join("missing").join("efi_vars.fd");
        assert!(matches!(
            builder.set_efi_boot_loader(&missing, true),
            Err(HypervisorVmError::CreateVariableStore { .. })
        ));
    }

    #[test]
    fn test_fake_missing_disk() {
        let dir = TempDir::new().unwrap();
        let hv = FakeHypervisor::default();
        let mut builder = hv.create_vm_builder().unwrap();

        assert!(matches!(
            builder.add_disk(&dir.as_path().join("missing.img"), false),
            Err(HypervisorVmError::AttachDisk { .. })
        ));
        assert!(hv.calls().is_empty());
    }

    #[test]
    fn test_fake_replays_script() {
        let hv = FakeHypervisor::default().with_script(FakeScript {
            events: vec![VmEvent::GuestStopped],
            ..Default::default()
        });
        let (tx, rx) = channel();
        let vm = hv.create_vm_builder().unwrap().build(tx).unwrap();

        vm.start().unwrap();
        vm.run_host_loop(Duration::ZERO);
        assert_eq!(rx.try_recv().unwrap(), VmEvent::Started);
        vm.run_host_loop(Duration::ZERO);
        assert_eq!(rx.try_recv().unwrap(), VmEvent::GuestStopped);
        vm.run_host_loop(Duration::ZERO);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_fake_start_failure() {
        let hv = FakeHypervisor::default().with_script(FakeScript {
            events: vec![VmEvent::GuestStopped],
            start_error: Some("not entitled".to_owned()),
            ..Default::default()
        });
        let (tx, rx) = channel();
        let vm = hv.create_vm_builder().unwrap().build(tx).unwrap();

        vm.start().unwrap();
        vm.run_host_loop(Duration::ZERO);
        assert_eq!(
            rx.try_recv().unwrap(),
            VmEvent::StartFailed("not entitled".to_owned())
        );
        vm.run_host_loop(Duration::ZERO);
        assert!(rx.recv().is_err());
    }
}
