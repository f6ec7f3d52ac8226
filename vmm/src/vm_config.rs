// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//
use std::path::PathBuf;

use net_util::MacAddr;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VCPUS: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: u64,
}

impl Default for CpusConfig {
    fn default() -> Self {
        CpusConfig {
            boot_vcpus: DEFAULT_VCPUS,
        }
    }
}

pub const DEFAULT_MEMORY_MB: u64 = 2048;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Size in bytes.
    pub size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            size: DEFAULT_MEMORY_MB << 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BootConfig {
    Efi {
        variable_store: PathBuf,
    },
    Linux {
        kernel: PathBuf,
        #[serde(default)]
        command_line: Option<String>,
        #[serde(default)]
        initial_ramdisk: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAttachment {
    #[default]
    Nat,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NetConfig {
    #[serde(default)]
    pub attachment: NetworkAttachment,
    #[serde(default)]
    pub mac: Option<MacAddr>,
}

pub const DEFAULT_DISPLAY_WIDTH: u32 = 1280;
pub const DEFAULT_DISPLAY_HEIGHT: u32 = 720;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            width: DEFAULT_DISPLAY_WIDTH,
            height: DEFAULT_DISPLAY_HEIGHT,
        }
    }
}

// Port index the guest agent expects the SPICE channel on.
pub const SPICE_AGENT_PORT: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsolePort {
    SpiceAgent { port: u32 },
}

/// Devices every guest gets. None of them can be changed from the command
/// line.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformConfig {
    pub entropy: bool,
    pub display: Option<DisplayConfig>,
    pub console: Option<ConsolePort>,
    pub keyboard: bool,
    pub pointing_device: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            entropy: true,
            display: Some(DisplayConfig::default()),
            console: Some(ConsolePort::SpiceAgent {
                port: SPICE_AGENT_PORT,
            }),
            keyboard: true,
            pointing_device: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmConfig {
    #[serde(default)]
    pub cpus: CpusConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub boot: BootConfig,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub net: Vec<NetConfig>,
    #[serde(default)]
    pub platform: PlatformConfig,
}
