// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::result;

use clap::ArgMatches;
use hypervisor::ResourceLimits;
use log::warn;
use net_util::MacAddr;
use option_parser::OptionParser;
use thiserror::Error;

pub use crate::vm_config::*;

/// Errors associated with VM configuration parameters.
#[derive(Debug, Error)]
pub enum Error {
    /// A required key is absent, e.g. ("Linux boot loader", "kernel")
    #[error("{0} requires a {1}")]
    MissingField(&'static str, &'static str),
    /// A `type` value that is not recognised
    #[error("Invalid {0} type \"{1}\"")]
    UnsupportedVariant(&'static str, String),
    #[error("Invalid MAC address \"{0}\"")]
    InvalidMacAddress(String),
    /// Resources outside the bounds accepted by the engine
    #[error("Invalid virtual machine configuration: {0}")]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{cpus} CPUs requested, min {min}, max {max}")]
    CpusOutOfRange { cpus: u64, min: u64, max: u64 },
    #[error("{mib} MiB of memory requested, min {min_mib} MiB, max {max_mib} MiB")]
    MemoryOutOfRange { mib: u64, min_mib: u64, max_mib: u64 },
    #[error("{0} MiB of memory cannot be represented in bytes")]
    MemoryOverflow(u64),
}

pub type Result<T> = result::Result<T, Error>;

pub struct VmParams<'a> {
    pub boot_loader: &'a str,
    pub disks: Vec<&'a str>,
    pub networks: Vec<&'a str>,
    pub cpus: u64,
    pub memory_mib: u64,
}

impl<'a> VmParams<'a> {
    pub fn from_arg_matches(args: &'a ArgMatches) -> Self {
        let boot_loader = args
            .get_one::<String>("boot-loader")
            .map(String::as_str)
            .unwrap_or_default();
        let disks: Vec<&str> = args
            .get_many::<String>("disk")
            .map(|x| x.map(String::as_str).collect())
            .unwrap_or_default();
        let networks: Vec<&str> = args
            .get_many::<String>("network")
            .map(|x| x.map(String::as_str).collect())
            .unwrap_or_default();
        let cpus = args
            .get_one::<u64>("cpus")
            .copied()
            .unwrap_or(DEFAULT_VCPUS);
        let memory_mib = args
            .get_one::<u64>("memory")
            .copied()
            .unwrap_or(DEFAULT_MEMORY_MB);

        VmParams {
            boot_loader,
            disks,
            networks,
            cpus,
            memory_mib,
        }
    }
}

impl BootConfig {
    pub const SYNTAX: &'static str = "Boot loader parameters \
        \"type=efi,variableStore=<path>\" or \
        \"type=linux,kernel=<path>[,commandLine=<string>][,initialRamdisk=<path>]\"";

    pub fn parse(boot_loader: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("type")
            .add("variableStore")
            .add("kernel")
            .add("commandLine")
            .add("initialRamdisk");
        parser.parse(boot_loader);

        let boot_type = parser
            .get("type")
            .ok_or(Error::MissingField("Boot loader", "type"))?;

        match boot_type.as_str() {
            "efi" => {
                for key in ["kernel", "commandLine", "initialRamdisk"] {
                    if parser.is_set(key) {
                        warn!("{key} parameter has no effect with an EFI boot loader");
                    }
                }

                let variable_store = parser
                    .get("variableStore")
                    .map(PathBuf::from)
                    .ok_or(Error::MissingField("EFI boot loader", "variableStore"))?;

                Ok(BootConfig::Efi { variable_store })
            }
            "linux" => {
                if parser.is_set("variableStore") {
                    warn!("variableStore parameter has no effect with a Linux boot loader");
                }

                let kernel = parser
                    .get("kernel")
                    .map(PathBuf::from)
                    .ok_or(Error::MissingField("Linux boot loader", "kernel"))?;

                Ok(BootConfig::Linux {
                    kernel,
                    command_line: parser.get("commandLine"),
                    initial_ramdisk: parser.get("initialRamdisk").map(PathBuf::from),
                })
            }
            _ => Err(Error::UnsupportedVariant("boot loader", boot_type)),
        }
    }
}

impl DiskConfig {
    pub const SYNTAX: &'static str =
        "Disk parameters \"path=<disk_image_path>[,readOnly=true|false|1]\"";

    pub fn parse(disk: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("path").add("readOnly");
        parser.parse(disk);

        let path = parser
            .get("path")
            .map(PathBuf::from)
            .ok_or(Error::MissingField("Storage device", "path"))?;
        let readonly = matches!(parser.get("readOnly").as_deref(), Some("true" | "1"));

        Ok(DiskConfig { path, readonly })
    }
}

impl NetConfig {
    pub const SYNTAX: &'static str = "Network parameters \"type=nat[,macAddress=<mac>]\"";

    pub fn parse(net: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("type").add("macAddress");
        parser.parse(net);

        let net_type = parser
            .get("type")
            .ok_or(Error::MissingField("Network device", "type"))?;
        let attachment = match net_type.as_str() {
            "nat" => NetworkAttachment::Nat,
            _ => return Err(Error::UnsupportedVariant("network", net_type)),
        };

        // An empty macAddress is an invalid address, not a missing one.
        let mac = if parser.is_set("macAddress") {
            let mac = parser.get("macAddress").unwrap_or_default();
            Some(MacAddr::parse_str(&mac).map_err(|_| Error::InvalidMacAddress(mac))?)
        } else {
            None
        };

        Ok(NetConfig { attachment, mac })
    }
}

impl VmConfig {
    /// Builds the configuration from the raw command line values. Disks and
    /// network devices keep their command line order.
    pub fn parse(vm_params: VmParams) -> Result<Self> {
        let boot = BootConfig::parse(vm_params.boot_loader)?;

        let disks = vm_params
            .disks
            .iter()
            .map(|disk| DiskConfig::parse(disk))
            .collect::<Result<Vec<_>>>()?;

        let net = vm_params
            .networks
            .iter()
            .map(|net| NetConfig::parse(net))
            .collect::<Result<Vec<_>>>()?;

        let size = vm_params
            .memory_mib
            .checked_mul(1 << 20)
            .ok_or(ValidationError::MemoryOverflow(vm_params.memory_mib))?;

        Ok(VmConfig {
            cpus: CpusConfig {
                boot_vcpus: vm_params.cpus,
            },
            memory: MemoryConfig { size },
            boot,
            disks,
            net,
            platform: PlatformConfig::default(),
        })
    }

    pub fn validate(&self, limits: &ResourceLimits) -> result::Result<(), ValidationError> {
        let cpus = self.cpus.boot_vcpus;
        if !limits.cpus_in_range(cpus) {
            return Err(ValidationError::CpusOutOfRange {
                cpus,
                min: limits.min_cpus,
                max: limits.max_cpus,
            });
        }

        if !limits.memory_in_range(self.memory.size) {
            return Err(ValidationError::MemoryOutOfRange {
                mib: self.memory.size >> 20,
                min_mib: limits.min_memory_mib(),
                max_mib: limits.max_memory_mib(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: ResourceLimits = ResourceLimits {
        min_cpus: 1,
        max_cpus: 8,
        min_memory: 128 << 20,
        max_memory: 16 << 30,
    };

    fn vm_params<'a>(boot_loader: &'a str, cpus: u64, memory_mib: u64) -> VmParams<'a> {
        VmParams {
            boot_loader,
            disks: Vec::new(),
            networks: Vec::new(),
            cpus,
            memory_mib,
        }
    }

    #[test]
    fn test_boot_loader_parsing() -> Result<()> {
        assert_eq!(
            BootConfig::parse("type=efi,variableStore=/tmp/x")?,
            BootConfig::Efi {
                variable_store: PathBuf::from("/tmp/x")
            }
        );
        assert_eq!(
            BootConfig::parse("type=linux,kernel=/boot/vmlinuz")?,
            BootConfig::Linux {
                kernel: PathBuf::from("/boot/vmlinuz"),
                command_line: None,
                initial_ramdisk: None,
            }
        );
        assert_eq!(
            BootConfig::parse(
                "type=linux,kernel=/boot/vmlinuz,commandLine=console=hvc0 root=/dev/vda1,initialRamdisk=/boot/initrd"
            )?,
            BootConfig::Linux {
                kernel: PathBuf::from("/boot/vmlinuz"),
                command_line: Some("console=hvc0 root=/dev/vda1".to_owned()),
                initial_ramdisk: Some(PathBuf::from("/boot/initrd")),
            }
        );
        // Keys of the other boot loader type are ignored
        assert_eq!(
            BootConfig::parse("type=efi,variableStore=/tmp/x,kernel=/boot/vmlinuz")?,
            BootConfig::Efi {
                variable_store: PathBuf::from("/tmp/x")
            }
        );
        // Unknown keys are ignored and the last duplicate wins
        assert_eq!(
            BootConfig::parse("type=linux,kernel=/a,foo=bar,kernel=/b")?,
            BootConfig::Linux {
                kernel: PathBuf::from("/b"),
                command_line: None,
                initial_ramdisk: None,
            }
        );
        // Quotes are part of the value
        assert_eq!(
            BootConfig::parse("type=linux,kernel=/k,commandLine=dyndbg=\"file a.c +p\"")?,
            BootConfig::Linux {
                kernel: PathBuf::from("/k"),
                command_line: Some("dyndbg=\"file a.c +p\"".to_owned()),
                initial_ramdisk: None,
            }
        );
        assert_eq!(
            BootConfig::parse("type=linux,kernel=/k,commandLine=say\"hi")?,
            BootConfig::Linux {
                kernel: PathBuf::from("/k"),
                command_line: Some("say\"hi".to_owned()),
                initial_ramdisk: None,
            }
        );
        Ok(())
    }

    #[test]
    fn test_boot_loader_parsing_errors() {
        assert!(matches!(
            BootConfig::parse("variableStore=/tmp/x"),
            Err(Error::MissingField(_, "type"))
        ));
        assert!(matches!(
            BootConfig::parse(""),
            Err(Error::MissingField(_, "type"))
        ));
        assert!(matches!(
            BootConfig::parse("type=efi"),
            Err(Error::MissingField(_, "variableStore"))
        ));
        assert!(matches!(
            BootConfig::parse("type=linux"),
            Err(Error::MissingField(_, "kernel"))
        ));
        assert!(matches!(
            BootConfig::parse("type=linux,kernel="),
            Err(Error::MissingField(_, "kernel"))
        ));
        assert!(matches!(
            BootConfig::parse("type=bios,kernel=/a"),
            Err(Error::UnsupportedVariant("boot loader", t)) if t == "bios"
        ));
        // Types are matched case sensitively
        assert!(matches!(
            BootConfig::parse("type=EFI,variableStore=/tmp/x"),
            Err(Error::UnsupportedVariant(_, _))
        ));
    }

    #[test]
    fn test_boot_loader_error_messages() {
        assert_eq!(
            BootConfig::parse("").unwrap_err().to_string(),
            "Boot loader requires a type"
        );
        assert_eq!(
            BootConfig::parse("type=bios").unwrap_err().to_string(),
            "Invalid boot loader type \"bios\""
        );
    }

    #[test]
    fn test_disk_parsing() -> Result<()> {
        assert_eq!(
            DiskConfig::parse("path=/a,readOnly=true")?,
            DiskConfig {
                path: PathBuf::from("/a"),
                readonly: true,
            }
        );
        assert_eq!(
            DiskConfig::parse("path=/a,readOnly=1")?,
            DiskConfig {
                path: PathBuf::from("/a"),
                readonly: true,
            }
        );
        for value in ["yes", "on", "TRUE", "false", "0", ""] {
            assert_eq!(
                DiskConfig::parse(&format!("path=/a,readOnly={value}"))?,
                DiskConfig {
                    path: PathBuf::from("/a"),
                    readonly: false,
                }
            );
        }
        assert_eq!(
            DiskConfig::parse("path=/a")?,
            DiskConfig {
                path: PathBuf::from("/a"),
                readonly: false,
            }
        );
        // Values may contain '='
        assert_eq!(
            DiskConfig::parse("path=/images/a=b.img")?.path,
            PathBuf::from("/images/a=b.img")
        );

        assert!(matches!(
            DiskConfig::parse("readOnly=true"),
            Err(Error::MissingField(_, "path"))
        ));
        assert!(matches!(
            DiskConfig::parse("path="),
            Err(Error::MissingField(_, "path"))
        ));
        Ok(())
    }

    #[test]
    fn test_net_parsing() -> Result<()> {
        assert_eq!(
            NetConfig::parse("type=nat")?,
            NetConfig {
                attachment: NetworkAttachment::Nat,
                mac: None,
            }
        );
        assert_eq!(
            NetConfig::parse("type=nat,macAddress=AA:BB:CC:DD:EE:FF")?,
            NetConfig {
                attachment: NetworkAttachment::Nat,
                mac: Some(MacAddr::parse_str("aa:bb:cc:dd:ee:ff").unwrap()),
            }
        );
        assert_eq!(
            NetConfig::parse("type=nat,macAddress=aa-bb-cc-dd-ee-ff")?.mac,
            Some(MacAddr::parse_str("aa:bb:cc:dd:ee:ff").unwrap())
        );

        assert!(matches!(
            NetConfig::parse("type=nat,macAddress=zz"),
            Err(Error::InvalidMacAddress(m)) if m == "zz"
        ));
        assert!(matches!(
            NetConfig::parse("type=nat,macAddress="),
            Err(Error::InvalidMacAddress(m)) if m.is_empty()
        ));
        assert!(matches!(
            NetConfig::parse("macAddress=aa:bb:cc:dd:ee:ff"),
            Err(Error::MissingField(_, "type"))
        ));
        assert!(matches!(
            NetConfig::parse("type=bridged"),
            Err(Error::UnsupportedVariant("network", t)) if t == "bridged"
        ));
        Ok(())
    }

    #[test]
    fn test_parsing_is_stateless() -> Result<()> {
        let boot = "type=linux,kernel=/vmlinuz,commandLine=root=/dev/vda1";
        assert_eq!(BootConfig::parse(boot)?, BootConfig::parse(boot)?);
        assert_eq!(
            DiskConfig::parse("path=/a,readOnly=1")?,
            DiskConfig::parse("path=/a,readOnly=1")?
        );
        Ok(())
    }

    #[test]
    fn test_vm_config_parsing() -> Result<()> {
        let vm_params = VmParams {
            boot_loader: "type=efi,variableStore=./nvram",
            disks: vec!["path=./disk.img", "path=./data.img,readOnly=true"],
            networks: vec!["type=nat", "type=nat,macAddress=52:54:00:12:34:56"],
            cpus: 2,
            memory_mib: 2048,
        };

        let expected: VmConfig = serde_json::from_str(
            r#"{
                "cpus": {"boot_vcpus": 2},
                "memory": {"size": 2147483648},
                "boot": {"type": "efi", "variable_store": "./nvram"},
                "disks": [
                    {"path": "./disk.img"},
                    {"path": "./data.img", "readonly": true}
                ],
                "net": [
                    {"attachment": "nat"},
                    {"attachment": "nat", "mac": "52:54:00:12:34:56"}
                ]
            }"#,
        )
        .unwrap();

        let config = VmConfig::parse(vm_params)?;
        assert_eq!(config, expected);
        assert_eq!(config.platform, PlatformConfig::default());
        config.validate(&LIMITS)?;
        Ok(())
    }

    #[test]
    fn test_vm_config_parsing_errors() {
        let params = VmParams {
            boot_loader: "type=linux,kernel=/vmlinuz",
            disks: vec!["path=/a", "readOnly=1"],
            networks: Vec::new(),
            cpus: 2,
            memory_mib: 2048,
        };
        assert!(matches!(
            VmConfig::parse(params),
            Err(Error::MissingField(_, "path"))
        ));

        assert!(matches!(
            VmConfig::parse(vm_params("kernel=/vmlinuz", 2, 2048)),
            Err(Error::MissingField(_, "type"))
        ));

        assert!(matches!(
            VmConfig::parse(vm_params("type=linux,kernel=/vmlinuz", 2, u64::MAX)),
            Err(Error::Validation(ValidationError::MemoryOverflow(u64::MAX)))
        ));
    }

    #[test]
    fn test_vm_config_validation() -> Result<()> {
        let boot_loader = "type=linux,kernel=/vmlinuz";

        for cpus in [LIMITS.min_cpus, LIMITS.max_cpus] {
            VmConfig::parse(vm_params(boot_loader, cpus, 2048))?.validate(&LIMITS)?;
        }
        for cpus in [LIMITS.min_cpus - 1, LIMITS.max_cpus + 1] {
            assert_eq!(
                VmConfig::parse(vm_params(boot_loader, cpus, 2048))?.validate(&LIMITS),
                Err(ValidationError::CpusOutOfRange {
                    cpus,
                    min: LIMITS.min_cpus,
                    max: LIMITS.max_cpus,
                })
            );
        }

        for memory_mib in [128, 16384] {
            VmConfig::parse(vm_params(boot_loader, 2, memory_mib))?.validate(&LIMITS)?;
        }
        for memory_mib in [127, 16385] {
            assert_eq!(
                VmConfig::parse(vm_params(boot_loader, 2, memory_mib))?.validate(&LIMITS),
                Err(ValidationError::MemoryOutOfRange {
                    mib: memory_mib,
                    min_mib: 128,
                    max_mib: 16384,
                })
            );
        }
        Ok(())
    }

    #[test]
    fn test_vm_config_serialization() -> Result<()> {
        let config = VmConfig::parse(VmParams {
            boot_loader: "type=linux,kernel=/vmlinuz,initialRamdisk=/initrd",
            disks: vec!["path=/a"],
            networks: vec!["type=nat"],
            cpus: 4,
            memory_mib: 4096,
        })?;

        let json = serde_json::to_string(&config).unwrap();
        let config2: VmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, config2);
        Ok(())
    }
}
