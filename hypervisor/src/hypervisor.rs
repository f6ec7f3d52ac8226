// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

use crate::vm::VmBuilder;

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// No engine exists for the host operating system
    ///
    #[error("Virtualization is not supported on {0}")]
    Unsupported(&'static str),
    ///
    /// The engine exists but refuses to run guests on this host
    ///
    #[error("Virtualization is not available on this host: {0}")]
    Unavailable(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Bounds the engine places on guest resources. Memory is in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub min_cpus: u64,
    pub max_cpus: u64,
    pub min_memory: u64,
    pub max_memory: u64,
}

impl ResourceLimits {
    pub fn cpus_in_range(&self, cpus: u64) -> bool {
        (self.min_cpus..=self.max_cpus).contains(&cpus)
    }

    pub fn memory_in_range(&self, bytes: u64) -> bool {
        (self.min_memory..=self.max_memory).contains(&bytes)
    }

    pub fn min_memory_mib(&self) -> u64 {
        self.min_memory / 1024 / 1024
    }

    pub fn max_memory_mib(&self) -> u64 {
        self.max_memory / 1024 / 1024
    }
}

///
/// Trait to represent a Hypervisor
///
/// This crate provides a hypervisor-agnostic interfaces
///
pub trait Hypervisor: Send + Sync {
    ///
    /// Return the CPU and memory bounds accepted by the engine
    ///
    fn resource_limits(&self) -> ResourceLimits;
    ///
    /// Create an empty guest description using the underlying engine
    ///
    fn create_vm_builder(&self) -> Result<Box<dyn VmBuilder>>;
}
