// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use hypervisor::Hypervisor;
use log::info;

use crate::config::VmConfig;
use crate::vm::{LifecycleOutcome, Vm};

pub mod config;
pub mod vm;
pub mod vm_config;

/// Runs one virtual machine session from validation until the guest stops
/// or something fails. This is the only way a session ends.
pub fn start_vm(config: VmConfig, hypervisor: &dyn Hypervisor) -> LifecycleOutcome {
    let mut vm = match Vm::new(config, hypervisor) {
        Ok(vm) => vm,
        Err(e) => return LifecycleOutcome::Failed(e),
    };

    if let Err(e) = vm.start() {
        return LifecycleOutcome::Failed(e);
    }

    let outcome = vm.run();
    info!("Virtual machine session ended in state {:?}", vm.state());
    outcome
}

#[cfg(test)]
mod tests {
    use hypervisor::fake::{FakeCall, FakeHypervisor, FakeScript};
    use hypervisor::VmEvent;

    use super::*;
    use crate::config::VmParams;
    use crate::vm::Error as VmError;

    fn config(cpus: u64) -> VmConfig {
        VmConfig::parse(VmParams {
            boot_loader: "type=linux,kernel=/vmlinuz",
            disks: Vec::new(),
            networks: Vec::new(),
            cpus,
            memory_mib: 1024,
        })
        .unwrap()
    }

    #[test]
    fn test_start_vm() {
        let hv = FakeHypervisor::default().with_script(FakeScript {
            events: vec![VmEvent::GuestStopped],
            ..Default::default()
        });

        assert!(matches!(start_vm(config(2), &hv), LifecycleOutcome::Stopped));
        assert_eq!(hv.calls().last(), Some(&FakeCall::Start));
    }

    #[test]
    fn test_start_vm_invalid_config() {
        let hv = FakeHypervisor::default();

        assert!(matches!(
            start_vm(config(0), &hv),
            LifecycleOutcome::Failed(VmError::ValidationFailed(_))
        ));
        assert!(!hv.calls().contains(&FakeCall::Start));
    }
}
