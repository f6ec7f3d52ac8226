// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Virtualization.framework backend.
//!
//! Callbacks from the framework are delivered on the main dispatch queue, so
//! [`Vm::run_host_loop`] must be driven from the main thread.

mod delegate;

use std::path::Path;
use std::sync::mpsc::Sender;
use std::time::Duration;

use anyhow::anyhow;
use block2::RcBlock;
use log::debug;
use net_util::MacAddr;
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::AllocAnyThread;
use objc2_foundation::{NSArray, NSDate, NSError, NSRunLoop, NSString, NSURL};
use objc2_virtualization::{
    VZBootLoader, VZConsoleDeviceConfiguration, VZDiskImageStorageDeviceAttachment,
    VZEFIBootLoader, VZEFIVariableStore, VZEFIVariableStoreInitializationOptions,
    VZEntropyDeviceConfiguration, VZGenericPlatformConfiguration, VZGraphicsDeviceConfiguration,
    VZKeyboardConfiguration, VZLinuxBootLoader, VZMACAddress, VZNATNetworkDeviceAttachment,
    VZNetworkDeviceAttachment, VZNetworkDeviceConfiguration, VZPlatformConfiguration,
    VZPointingDeviceConfiguration, VZSerialPortAttachment, VZSpiceAgentPortAttachment,
    VZStorageDeviceAttachment, VZStorageDeviceConfiguration, VZUSBKeyboardConfiguration,
    VZUSBScreenCoordinatePointingDeviceConfiguration, VZVirtioBlockDeviceConfiguration,
    VZVirtioConsoleDeviceConfiguration, VZVirtioConsolePortConfiguration,
    VZVirtioEntropyDeviceConfiguration, VZVirtioGraphicsDeviceConfiguration,
    VZVirtioGraphicsScanoutConfiguration, VZVirtioNetworkDeviceConfiguration, VZVirtualMachine,
    VZVirtualMachineConfiguration,
};

use crate::hypervisor::{self, Hypervisor, HypervisorError, ResourceLimits};
use crate::vm::{self, HypervisorVmError, Vm, VmBuilder, VmEvent};
use delegate::VmDelegate;

fn file_url(path: &Path) -> Retained<NSURL> {
    let path = NSString::from_str(&path.to_string_lossy());
    NSURL::fileURLWithPath(&path)
}

fn describe(error: &NSError) -> anyhow::Error {
    anyhow!("{}", error.localizedDescription())
}

/// Virtualization.framework engine
pub struct VzHypervisor {}

impl VzHypervisor {
    pub fn new() -> hypervisor::Result<VzHypervisor> {
        // SAFETY: class property without side effects.
        if !unsafe { VZVirtualMachine::isSupported() } {
            return Err(HypervisorError::Unavailable(anyhow!(
                "the host does not support Virtualization.framework"
            )));
        }

        Ok(VzHypervisor {})
    }
}

impl Hypervisor for VzHypervisor {
    fn resource_limits(&self) -> ResourceLimits {
        // SAFETY: class properties without side effects.
        unsafe {
            ResourceLimits {
                min_cpus: VZVirtualMachineConfiguration::minimumAllowedCPUCount() as u64,
                max_cpus: VZVirtualMachineConfiguration::maximumAllowedCPUCount() as u64,
                min_memory: VZVirtualMachineConfiguration::minimumAllowedMemorySize(),
                max_memory: VZVirtualMachineConfiguration::maximumAllowedMemorySize(),
            }
        }
    }

    fn create_vm_builder(&self) -> hypervisor::Result<Box<dyn VmBuilder>> {
        // SAFETY: plain object allocation.
        let configuration = unsafe { VZVirtualMachineConfiguration::new() };

        Ok(Box::new(VzVmBuilder {
            configuration,
            storage_devices: Vec::new(),
            network_devices: Vec::new(),
            entropy_devices: Vec::new(),
            graphics_devices: Vec::new(),
            console_devices: Vec::new(),
            keyboards: Vec::new(),
            pointing_devices: Vec::new(),
        }))
    }
}

struct VzVmBuilder {
    configuration: Retained<VZVirtualMachineConfiguration>,
    storage_devices: Vec<Retained<VZStorageDeviceConfiguration>>,
    network_devices: Vec<Retained<VZNetworkDeviceConfiguration>>,
    entropy_devices: Vec<Retained<VZEntropyDeviceConfiguration>>,
    graphics_devices: Vec<Retained<VZGraphicsDeviceConfiguration>>,
    console_devices: Vec<Retained<VZConsoleDeviceConfiguration>>,
    keyboards: Vec<Retained<VZKeyboardConfiguration>>,
    pointing_devices: Vec<Retained<VZPointingDeviceConfiguration>>,
}

impl VzVmBuilder {
    fn set_boot_loader(&mut self, boot_loader: &VZBootLoader) {
        // SAFETY: the configuration retains the boot loader.
        unsafe { self.configuration.setBootLoader(Some(boot_loader)) };
    }

    // Device lists are copied into the configuration as a whole.
    fn apply_devices(&self) {
        let configuration = &self.configuration;

        // SAFETY: the configuration copies every array it is given.
        unsafe {
            configuration.setStorageDevices(&NSArray::from_retained_slice(&self.storage_devices));
            configuration.setNetworkDevices(&NSArray::from_retained_slice(&self.network_devices));
            configuration.setEntropyDevices(&NSArray::from_retained_slice(&self.entropy_devices));
            configuration
                .setGraphicsDevices(&NSArray::from_retained_slice(&self.graphics_devices));
            configuration
                .setConsoleDevices(&NSArray::from_retained_slice(&self.console_devices));
            configuration.setKeyboards(&NSArray::from_retained_slice(&self.keyboards));
            configuration
                .setPointingDevices(&NSArray::from_retained_slice(&self.pointing_devices));
        }
    }
}

impl VmBuilder for VzVmBuilder {
    fn set_cpus(&mut self, count: u64) {
        // SAFETY: out of range values are rejected by validate().
        unsafe { self.configuration.setCPUCount(count as usize) };
    }

    fn set_memory(&mut self, size: u64) {
        // SAFETY: out of range values are rejected by validate().
        unsafe { self.configuration.setMemorySize(size) };
    }

    fn set_efi_boot_loader(&mut self, variable_store: &Path, create: bool) -> vm::Result<()> {
        let url = file_url(variable_store);

        // SAFETY: `url` is a valid file URL for the duration of the call.
        let store = unsafe {
            if create {
                VZEFIVariableStore::initCreatingURL_options_error(
                    VZEFIVariableStore::alloc(),
                    &url,
                    VZEFIVariableStoreInitializationOptions::AllowOverwrite,
                )
                .map_err(|e| HypervisorVmError::CreateVariableStore {
                    path: variable_store.to_path_buf(),
                    source: describe(&e),
                })?
            } else {
                VZEFIVariableStore::initWithURL(VZEFIVariableStore::alloc(), &url)
            }
        };

        // SAFETY: plain object allocation and property setter.
        let boot_loader = unsafe {
            let boot_loader = VZEFIBootLoader::new();
            boot_loader.setVariableStore(Some(&store));
            boot_loader
        };
        self.set_boot_loader(&boot_loader);

        Ok(())
    }

    fn set_linux_boot_loader(
        &mut self,
        kernel: &Path,
        command_line: Option<&str>,
        initial_ramdisk: Option<&Path>,
    ) -> vm::Result<()> {
        // SAFETY: every URL and string outlives the calls using it.
        let boot_loader = unsafe {
            let boot_loader =
                VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &file_url(kernel));
            if let Some(command_line) = command_line {
                boot_loader.setCommandLine(&NSString::from_str(command_line));
            }
            if let Some(initial_ramdisk) = initial_ramdisk {
                boot_loader.setInitialRamdiskURL(Some(&file_url(initial_ramdisk)));
            }
            boot_loader
        };
        self.set_boot_loader(&boot_loader);

        Ok(())
    }

    fn add_disk(&mut self, path: &Path, read_only: bool) -> vm::Result<()> {
        // SAFETY: `path` is converted to a valid file URL.
        let attachment = unsafe {
            VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
                VZDiskImageStorageDeviceAttachment::alloc(),
                &file_url(path),
                read_only,
            )
        }
        .map_err(|e| HypervisorVmError::AttachDisk {
            path: path.to_path_buf(),
            source: describe(&e),
        })?;

        let attachment: &VZStorageDeviceAttachment = &attachment;
        // SAFETY: the device retains its attachment.
        let device = unsafe {
            VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                attachment,
            )
        };
        self.storage_devices.push(Retained::into_super(device));

        Ok(())
    }

    fn add_nat_network(&mut self, mac: Option<MacAddr>) -> vm::Result<()> {
        // SAFETY: plain object allocations and property setters.
        let device = unsafe {
            let device = VZVirtioNetworkDeviceConfiguration::new();
            let attachment = VZNATNetworkDeviceAttachment::new();
            let attachment: &VZNetworkDeviceAttachment = &attachment;
            device.setAttachment(Some(attachment));

            if let Some(mac) = mac {
                let address = VZMACAddress::initWithString(
                    VZMACAddress::alloc(),
                    &NSString::from_str(&mac.to_string()),
                )
                .ok_or_else(|| {
                    HypervisorVmError::AddNetDevice(anyhow!("MAC address {mac} was refused"))
                })?;
                device.setMACAddress(&address);
            }

            device
        };
        self.network_devices.push(Retained::into_super(device));

        Ok(())
    }

    fn set_generic_platform(&mut self) -> vm::Result<()> {
        // SAFETY: plain object allocation and property setter.
        unsafe {
            let platform = VZGenericPlatformConfiguration::new();
            let platform: &VZPlatformConfiguration = &platform;
            self.configuration.setPlatform(platform);
        }

        Ok(())
    }

    fn add_entropy_device(&mut self) -> vm::Result<()> {
        // SAFETY: plain object allocation.
        let device = unsafe { VZVirtioEntropyDeviceConfiguration::new() };
        self.entropy_devices.push(Retained::into_super(device));

        Ok(())
    }

    fn add_graphics_device(&mut self, width: u32, height: u32) -> vm::Result<()> {
        // SAFETY: plain object allocations and property setters.
        let device = unsafe {
            let scanout = VZVirtioGraphicsScanoutConfiguration::initWithWidthInPixels_heightInPixels(
                VZVirtioGraphicsScanoutConfiguration::alloc(),
                width as isize,
                height as isize,
            );
            let device = VZVirtioGraphicsDeviceConfiguration::new();
            device.setScanouts(&NSArray::from_retained_slice(&[scanout]));
            device
        };
        self.graphics_devices.push(Retained::into_super(device));

        Ok(())
    }

    fn add_spice_agent_console(&mut self, port: u32) -> vm::Result<()> {
        // SAFETY: plain object allocations and property setters.
        let device = unsafe {
            let attachment = VZSpiceAgentPortAttachment::new();
            let attachment: &VZSerialPortAttachment = &attachment;
            let port_configuration = VZVirtioConsolePortConfiguration::new();
            port_configuration.setName(Some(&VZSpiceAgentPortAttachment::spiceAgentPortName()));
            port_configuration.setAttachment(Some(attachment));

            let device = VZVirtioConsoleDeviceConfiguration::new();
            device
                .ports()
                .setObject_atIndexedSubscript(Some(&port_configuration), port as usize);
            device
        };
        self.console_devices.push(Retained::into_super(device));

        Ok(())
    }

    fn add_usb_keyboard(&mut self) -> vm::Result<()> {
        // SAFETY: plain object allocation.
        let keyboard = unsafe { VZUSBKeyboardConfiguration::new() };
        self.keyboards.push(Retained::into_super(keyboard));

        Ok(())
    }

    fn add_usb_pointing_device(&mut self) -> vm::Result<()> {
        // SAFETY: plain object allocation.
        let device = unsafe { VZUSBScreenCoordinatePointingDeviceConfiguration::new() };
        self.pointing_devices.push(Retained::into_super(device));

        Ok(())
    }

    fn validate(&self) -> vm::Result<()> {
        self.apply_devices();

        // SAFETY: validation only reads the configuration.
        unsafe { self.configuration.validateWithError() }
            .map_err(|e| HypervisorVmError::Validate(describe(&e)))
    }

    fn build(self: Box<Self>, events: Sender<VmEvent>) -> vm::Result<Box<dyn Vm>> {
        self.apply_devices();

        // SAFETY: the configuration was validated and is copied by the
        // virtual machine. The delegate is retained by VzVm for as long as
        // the virtual machine lives.
        let (vm, delegate) = unsafe {
            let vm =
                VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), &self.configuration);
            let delegate = VmDelegate::new(events.clone());
            vm.setDelegate(Some(ProtocolObject::from_ref(&*delegate)));
            (vm, delegate)
        };
        debug!("Created virtual machine");

        Ok(Box::new(VzVm {
            vm,
            _delegate: delegate,
            events,
        }))
    }
}

struct VzVm {
    vm: Retained<VZVirtualMachine>,
    _delegate: Retained<VmDelegate>,
    events: Sender<VmEvent>,
}

impl Vm for VzVm {
    fn start(&self) -> vm::Result<()> {
        let events = self.events.clone();
        let completion = RcBlock::new(move |error: *mut NSError| {
            // SAFETY: the framework passes either nil or a valid NSError.
            let event = match unsafe { error.as_ref() } {
                Some(error) => VmEvent::StartFailed(error.localizedDescription().to_string()),
                None => VmEvent::Started,
            };
            let _ = events.send(event);
        });

        // SAFETY: the block is copied by the framework.
        unsafe { self.vm.startWithCompletionHandler(&completion) };

        Ok(())
    }

    fn run_host_loop(&self, timeout: Duration) {
        // SAFETY: runs the current thread's run loop for a bounded time.
        unsafe {
            let limit = NSDate::dateWithTimeIntervalSinceNow(timeout.as_secs_f64());
            NSRunLoop::currentRunLoop().runUntilDate(&limit);
        }
    }
}
