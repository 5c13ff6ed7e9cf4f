// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Userspace control plane for Nitro virtual machine introspection.
//!
//! A [`Session`] opens the Nitro enabled KVM device, attaches to the VM of
//! a given process, discovers its vCPUs and installs a system call trap.
//! Each trapped system call holds its vCPU in the kernel until it is
//! resumed; [`Listener`] drives that cycle for one or all vCPUs.

#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod listener;
pub mod session;
pub mod trap;
pub mod vcpu;
pub mod vm;

#[cfg(test)]
mod mock;

pub use config::{ListenerConfig, SessionConfig};
pub use device::DeviceHandle;
pub use error::{Error, Result};
pub use event::{
    Direction, EventInfo, EventRecord, RegisterSnapshot, SegmentRegisterSnapshot, TrapEvent,
};
pub use listener::{CancellationToken, Listener, ListenerStats};
pub use nitro_ioctls::{KernelTransport, Request, Transport};
pub use session::Session;
pub use trap::{SyscallSelection, TrapConfiguration, TrapController};
pub use vcpu::{VcpuEntry, VcpuHandle, VcpuState};
pub use vm::VmHandle;
