// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use kvm_bindings::{kvm_regs, kvm_sregs};
use nitro_ioctls::{
    EventData, KVM_NITRO_EVENT_ERROR, KVM_NITRO_EVENT_SYSCALL, KVM_NITRO_EVENT_SYSRET,
};
use serde::Serialize;
use std::fmt;
use std::os::raw::c_int;

/// General purpose registers of a held vCPU.
pub type RegisterSnapshot = kvm_regs;
/// Control and segment registers of a held vCPU.
pub type SegmentRegisterSnapshot = kvm_sregs;

/// Outcome of one `get_event` wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "syscall", rename_all = "snake_case")]
pub enum EventRecord {
    /// The kernel reported a failure building the event.
    Error,
    /// The wait returned without a trap event.
    Timeout,
    SyscallEntry(u64),
    SyscallReturn(u64),
}

impl EventRecord {
    /// Decodes the non-negative return code of `KVM_NITRO_GET_EVENT`.
    ///
    /// Only the two trap codes carry a system call. Unknown codes are not
    /// errors: the vCPU is still held and must be resumed like any other.
    pub fn decode(code: c_int, data: &EventData) -> EventRecord {
        match code {
            KVM_NITRO_EVENT_SYSCALL => EventRecord::SyscallEntry(data.syscall),
            KVM_NITRO_EVENT_SYSRET => EventRecord::SyscallReturn(data.syscall),
            KVM_NITRO_EVENT_ERROR => EventRecord::Error,
            _ => EventRecord::Timeout,
        }
    }

    pub fn is_trap(&self) -> bool {
        self.direction().is_some()
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            EventRecord::SyscallEntry(_) => Some(Direction::Enter),
            EventRecord::SyscallReturn(_) => Some(Direction::Exit),
            EventRecord::Error | EventRecord::Timeout => None,
        }
    }

    pub fn syscall(&self) -> Option<u64> {
        match self {
            EventRecord::SyscallEntry(nr) | EventRecord::SyscallReturn(nr) => Some(*nr),
            EventRecord::Error | EventRecord::Timeout => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Enter,
    Exit,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Enter => write!(f, "ENTER"),
            Direction::Exit => write!(f, "EXIT"),
        }
    }
}

/// A trapped system call together with the vCPU state captured while the
/// guest was held.
#[derive(Clone, Debug)]
pub struct TrapEvent {
    pub vcpu: usize,
    pub kernel_id: i32,
    pub record: EventRecord,
    pub regs: RegisterSnapshot,
    pub sregs: SegmentRegisterSnapshot,
}

/// Flat summary of a [`TrapEvent`] for reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventInfo {
    pub vcpu: usize,
    pub direction: Option<Direction>,
    pub syscall: Option<u64>,
    pub cr3: String,
    pub rax: String,
    pub rip: String,
}

impl TrapEvent {
    pub fn info(&self) -> EventInfo {
        EventInfo {
            vcpu: self.vcpu,
            direction: self.record.direction(),
            syscall: self.record.syscall(),
            cr3: format!("{:#x}", self.sregs.cr3),
            rax: format!("{:#x}", self.regs.rax),
            rip: format!("{:#x}", self.regs.rip),
        }
    }
}

impl fmt::Display for TrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "vcpu: {}", self.vcpu)?;
        if let Some(direction) = self.record.direction() {
            write!(f, " - direction: {direction}")?;
        }
        if let Some(nr) = self.record.syscall() {
            write!(f, " - syscall: {nr:#x}")?;
        }
        write!(
            f,
            " - cr3: {:#x} - rax: {:#x}",
            self.sregs.cr3, self.regs.rax
        )
    }
}
