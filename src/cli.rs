// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use clap::{ArgAction, Parser};
use introspect::config::{DEFAULT_DEVICE_PATH, DEFAULT_KICK_INTERVAL};
use introspect::{ListenerConfig, SessionConfig, TrapConfiguration, TrapEvent};
use log::LevelFilter;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid system call number {0:?}")]
    InvalidSyscall(String),
}

/// Parses a system call number in decimal or `0x` prefixed hexadecimal.
pub fn parse_syscall(s: &str) -> Result<u64, Error> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| Error::InvalidSyscall(s.to_owned()))
}

#[derive(Parser, Debug)]
#[command(
    name = "nitro",
    version,
    about = "Trace the system calls of a KVM guest through the Nitro kernel module."
)]
pub struct CliArgs {
    /// Control device of the Nitro enabled KVM module
    #[arg(long, value_name = "PATH", default_value = DEFAULT_DEVICE_PATH)]
    pub device: PathBuf,

    /// Print one JSON object per event
    #[arg(long)]
    pub json: bool,

    /// Process id of the VM creator
    #[arg(value_name = "PID")]
    pub pid: libc::pid_t,

    /// System call to trap, decimal or hex; may be repeated. Traps every
    /// system call when omitted
    #[arg(long = "syscall", value_name = "NR", value_parser = parse_syscall)]
    pub syscalls: Vec<u64>,

    /// vCPU to listen on; may be repeated. Listens on every vCPU when omitted
    #[arg(long = "vcpu", value_name = "INDEX")]
    pub vcpus: Vec<usize>,

    /// Raise the log level, up to three times
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl CliArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            device_path: self.device.clone(),
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            vcpus: (!self.vcpus.is_empty()).then(|| self.vcpus.clone()),
            kick_interval: DEFAULT_KICK_INTERVAL,
        }
    }

    pub fn trap_configuration(&self) -> TrapConfiguration {
        TrapConfiguration::syscalls(self.syscalls.iter().copied())
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Renders one event the way it is printed on stdout.
pub fn format_event(event: &TrapEvent, json: bool) -> String {
    if json {
        match serde_json::to_string(&event.info()) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Failed to serialize event: {}", e);
                event.to_string()
            }
        }
    } else {
        event.to_string()
    }
}
