// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A generic abstraction around the virtualization engine
//!
//! This crate offers a trait abstraction for the engine that assembles and
//! runs a virtual machine. The guest is described through a [`VmBuilder`],
//! validated, turned into a [`Vm`] and started. Everything the engine reports
//! asynchronously afterwards is delivered as a [`VmEvent`] over a channel.
//!
//! # Platform support
//!
//! - macOS (Virtualization.framework)
//!

/// Hypervisor related module
pub mod hypervisor;

/// Vm related module
pub mod vm;

/// In-process engine used by tests
#[cfg(any(test, feature = "fake"))]
pub mod fake;

/// Virtualization.framework implementation module
#[cfg(target_os = "macos")]
pub mod vz;

use std::sync::Arc;

pub use crate::hypervisor::{Hypervisor, HypervisorError, ResourceLimits};
pub use vm::{HypervisorVmError, Vm, VmBuilder, VmEvent};

/// Returns the engine available on this host.
#[cfg(target_os = "macos")]
pub fn new() -> std::result::Result<Arc<dyn Hypervisor>, HypervisorError> {
    let hv = vz::VzHypervisor::new()?;

    Ok(Arc::new(hv))
}

/// Returns the engine available on this host.
#[cfg(not(target_os = "macos"))]
pub fn new() -> std::result::Result<Arc<dyn Hypervisor>, HypervisorError> {
    Err(HypervisorError::Unsupported(std::env::consts::OS))
}

#[cfg(all(test, not(target_os = "macos")))]
mod tests {
    use super::*;

    #[test]
    fn test_new_unsupported_host() {
        match new() {
            Err(HypervisorError::Unsupported(os)) => assert_eq!(os, std::env::consts::OS),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("no engine expected on this host"),
        }
    }
}
