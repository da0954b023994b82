// Copyright 2023 aztecher, or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::ExitCode;

mod utils;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HvctlExitCode {
    /// Success exit code.
    Ok = 0,
    /// Generic error exit code.
    GenericError = 1,
    /// Bad configuration for the platform.
    BadConfiguration = 153,
}

#[derive(Debug, thiserror::Error)]
enum CliInputError {
    #[error("Failed to open file: {0}")]
    FileIo(#[from] std::io::Error),
    #[error("{0}")]
    Utils(#[from] utils::UtilsError),
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("Unexpected input error: {0}")]
    CliError(#[from] CliInputError),
}

impl From<&MainError> for HvctlExitCode {
    fn from(value: &MainError) -> Self {
        match value {
            MainError::CliError(e) => match e {
                CliInputError::FileIo(_) => HvctlExitCode::BadConfiguration,
                CliInputError::Utils(utils::UtilsError::Config(_)) => {
                    HvctlExitCode::BadConfiguration
                }
                CliInputError::Utils(_) => HvctlExitCode::GenericError,
            },
        }
    }
}

impl From<MainError> for ExitCode {
    fn from(value: MainError) -> Self {
        ExitCode::from(HvctlExitCode::from(&value) as u8)
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the VMX capability masks of the platform
    Caps {
        /// Path of the platform config file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Create and tear down a VM with one vcpu, without running it
    Probe {
        /// Path of the platform config file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Guest memory to map at guest-physical 0, in MiB
        #[arg(short, long, value_name = "MIB", default_value_t = 1)]
        mem_mib: usize,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<Option<String>, CliInputError> {
    Ok(match path {
        Some(path) => Some(read_to_string(path)?),
        None => None,
    })
}

fn run(cli: Cli) -> Result<(), CliInputError> {
    match cli.command {
        Command::Caps { config } => {
            let config = load_config(config)?;
            let platform = utils::platform_from_config(config.as_deref())?;
            for (cap, value) in utils::read_capabilities(&platform)? {
                println!("{:<28}{:#018x}", cap.name(), value);
            }
            Ok(())
        }
        Command::Probe { config, mem_mib } => {
            let config = load_config(config)?;
            let platform = utils::platform_from_config(config.as_deref())?;
            let report = utils::probe(&platform, mem_mib)?;
            println!("platform:  {}", report.platform);
            println!("memory:    {:#x} bytes at 0x0", report.mem_size);
            println!("vcpu:      {}", report.vcpu);
            println!("rip:       {:#x}", report.rip);
            println!("exec time: {}", report.exec_time);
            Ok(())
        }
    }
}

fn main_exec() -> Result<(), MainError> {
    let cli = Cli::parse();
    let result = run(cli);
    if let Err(e) = result {
        eprintln!("{}", e);
        return Err(MainError::CliError(e));
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let result = main_exec();
    if let Err(err) = result {
        eprintln!("Error: {err:?}");
        ExitCode::from(err)
    } else {
        ExitCode::SUCCESS
    }
}
