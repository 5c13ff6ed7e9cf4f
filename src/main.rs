// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

#[macro_use]
extern crate log;

use anyhow::Context;
use clap::Parser;
use introspect::{CancellationToken, KernelTransport, Listener, Session};
use nitro::cli::{format_event, CliArgs};
use nitro::error_report;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::process;
use std::sync::Arc;

fn run(args: &CliArgs) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, token.flag())
            .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }

    let mut session = Session::open(Arc::new(KernelTransport), &args.session_config())
        .context("Failed to open the Nitro control device")?;
    match session.count_vms() {
        Ok(n) => info!("{} VMs known to the kernel module", n),
        Err(e) => warn!("Could not count VMs: {}", e),
    }

    session
        .attach(args.pid)
        .with_context(|| format!("Failed to attach to the VM of process {}", args.pid))?;
    session.discover().context("Failed to attach vCPUs")?;
    session
        .set_trap(&args.trap_configuration())
        .context("Failed to install the syscall trap")?;

    let listener = Listener::new(args.listener_config(), token);
    let json = args.json;
    let result = listener.listen(&mut session, |event| {
        println!("{}", format_event(event, json));
    });

    // Trap removal and handle release happen before reporting.
    session.close();

    for (index, stats) in result.context("Event loop failed")? {
        info!(
            "vCPU {}: {} events, {} entries, {} returns, {} passed through, {} kernel errors",
            index,
            stats.events,
            stats.syscall_entries,
            stats.syscall_returns,
            stats.passthrough,
            stats.kernel_errors
        );
    }
    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level())
        .parse_default_env()
        .init();

    if let Err(e) = run(&args) {
        eprintln!("{}", error_report(&*e));
        debug!("{:?}", e);
        process::exit(1);
    }
}
