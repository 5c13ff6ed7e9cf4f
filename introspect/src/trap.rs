// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::error::{Error, Result};
use crate::vm::VmSession;
use nitro_ioctls::Request;
use std::collections::BTreeSet;

/// Which system calls the trap reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallSelection {
    All,
    Only(BTreeSet<u64>),
}

/// Desired trap state. The kernel holds the authoritative copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrapConfiguration {
    pub syscalls: SyscallSelection,
    pub enabled: bool,
}

impl TrapConfiguration {
    /// Trap every system call.
    pub fn all() -> Self {
        TrapConfiguration {
            syscalls: SyscallSelection::All,
            enabled: true,
        }
    }

    /// Trap only the given system call numbers. An empty list traps all.
    pub fn syscalls<I: IntoIterator<Item = u64>>(numbers: I) -> Self {
        let numbers = numbers.into_iter().collect::<BTreeSet<_>>();
        let syscalls = if numbers.is_empty() {
            SyscallSelection::All
        } else {
            SyscallSelection::Only(numbers)
        };
        TrapConfiguration {
            syscalls,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        TrapConfiguration {
            syscalls: SyscallSelection::All,
            enabled: false,
        }
    }

    fn filters(&self) -> BTreeSet<u64> {
        match &self.syscalls {
            SyscallSelection::All => BTreeSet::new(),
            SyscallSelection::Only(numbers) => numbers.clone(),
        }
    }
}

/// Userspace mirror of the trap installed on the attached VM.
///
/// With no filter installed the kernel traps every system call.
#[derive(Debug, Default)]
pub struct TrapController {
    filters: BTreeSet<u64>,
    enabled: bool,
}

impl TrapController {
    pub fn new() -> Self {
        TrapController::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn filters(&self) -> &BTreeSet<u64> {
        &self.filters
    }

    /// True when a previous request may have left state in the kernel.
    pub fn is_active(&self) -> bool {
        self.enabled || !self.filters.is_empty()
    }

    /// Installs `config` on `vm`: reconciles the syscall filters, then sets
    /// the enable flag.
    pub fn set_trap(&mut self, vm: &VmSession, config: &TrapConfiguration) -> Result<()> {
        let wanted = config.filters();

        let stale = self
            .filters
            .difference(&wanted)
            .copied()
            .collect::<Vec<_>>();
        for nr in stale {
            vm.raw_request(Request::RemoveSyscallFilter(nr))
                .map_err(Error::TrapInstallFailed)?;
            self.filters.remove(&nr);
        }

        let missing = wanted
            .difference(&self.filters)
            .copied()
            .collect::<Vec<_>>();
        for nr in missing {
            self.add_syscall_filter(vm, nr)?;
        }

        vm.raw_request(Request::SetSyscallTrap(config.enabled))
            .map_err(Error::TrapInstallFailed)?;
        self.enabled = config.enabled;

        if self.filters.is_empty() {
            info!("Syscall trap enabled={} for all system calls", self.enabled);
        } else {
            info!(
                "Syscall trap enabled={} for system calls {:?}",
                self.enabled, self.filters
            );
        }
        Ok(())
    }

    /// Best-effort removal: disables the trap and drops every filter.
    ///
    /// Every step is attempted even if an earlier one fails; the first
    /// failure is returned as `TrapClearFailed`.
    pub fn clear_trap(&mut self, vm: &VmSession) -> Result<()> {
        let mut first_error = None;

        match vm.raw_request(Request::SetSyscallTrap(false)) {
            Ok(_) => self.enabled = false,
            Err(e) => {
                warn!("Failed to disable syscall trap: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let filters = self.filters.iter().copied().collect::<Vec<_>>();
        for nr in filters {
            match vm.raw_request(Request::RemoveSyscallFilter(nr)) {
                Ok(_) => {
                    self.filters.remove(&nr);
                }
                Err(e) => {
                    warn!("Failed to remove syscall filter {:#x}: {}", nr, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(Error::TrapClearFailed(e)),
            None => {
                info!("Syscall trap cleared");
                Ok(())
            }
        }
    }

    pub fn add_syscall_filter(&mut self, vm: &VmSession, nr: u64) -> Result<()> {
        debug!("Adding syscall filter on {:#x}", nr);
        vm.raw_request(Request::AddSyscallFilter(nr))
            .map_err(Error::TrapInstallFailed)?;
        self.filters.insert(nr);
        Ok(())
    }

    pub fn remove_syscall_filter(&mut self, vm: &VmSession, nr: u64) -> Result<()> {
        debug!("Removing syscall filter on {:#x}", nr);
        vm.vm_request(Request::RemoveSyscallFilter(nr))?;
        self.filters.remove(&nr);
        Ok(())
    }

    /// Forgets the mirror once the VM handle is gone.
    pub(crate) fn reset(&mut self) {
        self.filters.clear();
        self.enabled = false;
    }
}
