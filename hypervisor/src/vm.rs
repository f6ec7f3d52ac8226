// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;

use net_util::MacAddr;
use thiserror::Error;

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    ///
    /// EFI variable store creation error
    ///
    #[error("Failed to create EFI variable store at {path}: {source}")]
    CreateVariableStore {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    ///
    /// EFI variable store open error
    ///
    #[error("Failed to open EFI variable store at {path}: {source}")]
    OpenVariableStore {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    ///
    /// Disk image attachment error
    ///
    #[error("Failed to attach disk image {path}: {source}")]
    AttachDisk {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    ///
    /// Network device error
    ///
    #[error("Failed to add network device: {0}")]
    AddNetDevice(#[source] anyhow::Error),
    ///
    /// Configuration rejected by the engine
    ///
    #[error("Invalid virtual machine configuration: {0}")]
    Validate(#[source] anyhow::Error),
    ///
    /// Vm creation error
    ///
    #[error("Failed to create Vm: {0}")]
    Create(#[source] anyhow::Error),
    ///
    /// Vm start request error
    ///
    #[error("Failed to start Vm: {0}")]
    Start(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

/// Asynchronous notifications delivered by a running engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmEvent {
    /// The start request completed successfully.
    Started,
    /// The start request completed with an error.
    StartFailed(String),
    /// The guest powered itself off.
    GuestStopped,
    /// The engine stopped the guest because of an error.
    StoppedWithError(String),
    /// A network attachment was lost.
    NetworkDisconnected { device: String, detail: String },
}

///
/// Trait to describe a guest before it is created
///
/// The calls are accumulated by the engine. Nothing is checked against the
/// engine's rules until [`VmBuilder::validate`].
///
pub trait VmBuilder {
    fn set_cpus(&mut self, count: u64);
    /// Memory size in bytes.
    fn set_memory(&mut self, size: u64);
    ///
    /// Boot through EFI firmware. With `create` the variable store is
    /// created (replacing any file at `variable_store`), otherwise it is
    /// opened.
    ///
    fn set_efi_boot_loader(&mut self, variable_store: &Path, create: bool) -> Result<()>;
    ///
    /// Boot a Linux kernel directly
    ///
    fn set_linux_boot_loader(
        &mut self,
        kernel: &Path,
        command_line: Option<&str>,
        initial_ramdisk: Option<&Path>,
    ) -> Result<()>;
    fn add_disk(&mut self, path: &Path, read_only: bool) -> Result<()>;
    ///
    /// Add a virtio network device attached to the host NAT. Without a MAC
    /// address the engine picks one.
    ///
    fn add_nat_network(&mut self, mac: Option<MacAddr>) -> Result<()>;
    fn set_generic_platform(&mut self) -> Result<()>;
    fn add_entropy_device(&mut self) -> Result<()>;
    fn add_graphics_device(&mut self, width: u32, height: u32) -> Result<()>;
    fn add_spice_agent_console(&mut self, port: u32) -> Result<()>;
    fn add_usb_keyboard(&mut self) -> Result<()>;
    fn add_usb_pointing_device(&mut self) -> Result<()>;
    ///
    /// Check the accumulated description against the engine's rules
    ///
    fn validate(&self) -> Result<()>;
    ///
    /// Create the Vm. Every asynchronous notification is sent to `events`.
    ///
    fn build(self: Box<Self>, events: Sender<VmEvent>) -> Result<Box<dyn Vm>>;
}

///
/// Trait to represent a Vm
///
pub trait Vm {
    ///
    /// Request the start of the guest. Completion is reported as
    /// [`VmEvent::Started`] or [`VmEvent::StartFailed`].
    ///
    fn start(&self) -> Result<()>;
    ///
    /// Service the engine's host side work for at most `timeout`
    ///
    fn run_host_loop(&self, timeout: Duration);
}
