// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright © 2024 The vmcli Authors
//

#[cfg(test)]
mod test_util;

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use std::{io, process, thread};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use hypervisor::{Hypervisor, HypervisorError, ResourceLimits};
use log::{info, LevelFilter, SetLoggerError};
use thiserror::Error;
use vmcli::cli_print_error_chain;
use vmm::config::{self, BootConfig, DiskConfig, NetConfig, VmConfig, VmParams};
use vmm::vm::LifecycleOutcome;

#[derive(Error, Debug)]
enum Error {
    #[error("Error parsing config")]
    ParsingConfig(#[source] config::Error),
    #[error("Error creating log file")]
    LogFileCreation(#[source] io::Error),
    #[error("Error setting up logger")]
    LoggerSetup(#[source] SetLoggerError),
    #[error("Failed to create the virtualization engine")]
    CreateHypervisor(#[source] HypervisorError),
    #[error("Failed to run the virtual machine")]
    VmRun(#[source] vmm::vm::Error),
}

fn cpus_help(limits: Option<&ResourceLimits>) -> String {
    let help = "The number of CPUs you make available to the guest operating system";
    match limits {
        Some(limits) => format!("{help}, min {}, max {}.", limits.min_cpus, limits.max_cpus),
        None => format!("{help}."),
    }
}

fn memory_help(limits: Option<&ResourceLimits>) -> String {
    let help = "The amount of physical memory the guest operating system recognizes in MiB";
    match limits {
        Some(limits) => format!(
            "{help}, min {} MiB, max {} MiB.",
            limits.min_memory_mib(),
            limits.max_memory_mib()
        ),
        None => format!("{help}."),
    }
}

fn get_cli_options_sorted(limits: Option<ResourceLimits>) -> Vec<Arg> {
    vec![
        Arg::new("boot-loader")
            .long("boot-loader")
            .help(BootConfig::SYNTAX)
            .num_args(1)
            .required(true),
        Arg::new("cpus")
            .long("cpus")
            .help(cpus_help(limits.as_ref()))
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value(config::DEFAULT_VCPUS.to_string()),
        Arg::new("disk")
            .long("disk")
            .help(DiskConfig::SYNTAX)
            .num_args(1)
            .action(ArgAction::Append),
        Arg::new("log-file")
            .long("log-file")
            .help("Log file. Standard error is used if not specified")
            .num_args(1),
        Arg::new("memory")
            .long("memory")
            .help(memory_help(limits.as_ref()))
            .num_args(1)
            .value_parser(value_parser!(u64))
            .default_value(config::DEFAULT_MEMORY_MB.to_string()),
        Arg::new("network")
            .long("network")
            .help(NetConfig::SYNTAX)
            .num_args(1)
            .action(ArgAction::Append),
        Arg::new("v")
            .short('v')
            .action(ArgAction::Count)
            .help("Sets the level of debugging output"),
    ]
}

/// Creates the CLI definition of vmcli.
fn create_app(limits: Option<ResourceLimits>) -> Command {
    Command::new("vmcli")
        // 'BUILD_VERSION' is set by the build script 'build.rs' at
        // compile time
        .version(env!("BUILD_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Launch a single virtual machine.")
        .args(get_cli_options_sorted(limits))
}

fn init_logger(cmd_arguments: &ArgMatches) -> Result<(), Error> {
    let log_level = match cmd_arguments.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let target = match cmd_arguments.get_one::<String>("log-file") {
        Some(path) => env_logger::Target::Pipe(Box::new(
            File::create(path).map_err(Error::LogFileCreation)?,
        )),
        None => env_logger::Target::Stderr,
    };

    let start = Instant::now();
    env_logger::Builder::new()
        .filter_level(log_level)
        .target(target)
        .format(move |buf, record| {
            writeln!(
                buf,
                "vmcli: {:.6?}: <{}> {}:{}:{} -- {}",
                start.elapsed(),
                thread::current().name().unwrap_or("anonymous"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init()
        .map_err(Error::LoggerSetup)
}

fn start_vmcli(
    cmd_arguments: &ArgMatches,
    hypervisor: Result<Arc<dyn Hypervisor>, HypervisorError>,
) -> Result<(), Error> {
    let vm_params = VmParams::from_arg_matches(cmd_arguments);
    let vm_config = VmConfig::parse(vm_params).map_err(Error::ParsingConfig)?;

    let hypervisor = hypervisor.map_err(Error::CreateHypervisor)?;
    info!(
        "Launching virtual machine with {} CPUs and {} MiB of memory",
        vm_config.cpus.boot_vcpus,
        vm_config.memory.size >> 20
    );

    match vmm::start_vm(vm_config, hypervisor.as_ref()) {
        LifecycleOutcome::Stopped => Ok(()),
        LifecycleOutcome::Failed(e) => Err(Error::VmRun(e)),
    }
}

fn main() {
    let hypervisor = hypervisor::new();
    let limits = hypervisor.as_ref().ok().map(|hv| hv.resource_limits());

    let cmd_arguments = create_app(limits).get_matches();

    let exit_code = match init_logger(&cmd_arguments)
        .and_then(|()| start_vmcli(&cmd_arguments, hypervisor))
    {
        Ok(()) => {
            println!("Virtual machine stopped from guest. Exiting.");
            0
        }
        Err(top_error) => {
            cli_print_error_chain(&top_error, "vmcli");
            1
        }
    };

    process::exit(exit_code);
}
