// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Bindings for the Nitro extension of the KVM ioctl interface.
//!
//! Nitro adds a small set of requests to `/dev/kvm` that let a second
//! process attach to a VM created by someone else, trap the guest's
//! system calls, and inspect the vCPU state while the guest is held.
//!
//! This crate only describes the wire format and the [`Transport`] seam
//! through which requests reach the kernel. Session bookkeeping lives in
//! the `introspect` crate.

#[macro_use]
extern crate log;
#[macro_use]
extern crate vmm_sys_util;

use kvm_bindings::{kvm_regs, kvm_sregs, KVMIO};
use std::os::raw::c_int;

mod transport;

pub use transport::{KernelTransport, Request, Result, Transport};

/// Number of vCPU slots in the table filled by `KVM_NITRO_ATTACH_VCPUS`.
pub const NITRO_MAX_VCPUS: usize = 64;

/// `KVM_NITRO_GET_EVENT` return code for an event the kernel failed to build.
pub const KVM_NITRO_EVENT_ERROR: c_int = 1;
/// `KVM_NITRO_GET_EVENT` return code for a trapped system call entry.
pub const KVM_NITRO_EVENT_SYSCALL: c_int = 2;
/// `KVM_NITRO_GET_EVENT` return code for a trapped system call return.
pub const KVM_NITRO_EVENT_SYSRET: c_int = 3;

// System ioctls, issued on the /dev/kvm descriptor.
ioctl_io_nr!(KVM_NITRO_NUM_VMS, KVMIO, 0xE0);
ioctl_iow_nr!(KVM_NITRO_ATTACH_VM, KVMIO, 0xE1, libc::pid_t);

// VM ioctls.
ioctl_ior_nr!(KVM_NITRO_ATTACH_VCPUS, KVMIO, 0xE2, NitroVcpus);
ioctl_iow_nr!(KVM_NITRO_SET_SYSCALL_TRAP, KVMIO, 0xE3, bool);
ioctl_ior_nr!(KVM_NITRO_ADD_SYSCALL_FILTER, KVMIO, 0xEB, u64);
ioctl_ior_nr!(KVM_NITRO_REMOVE_SYSCALL_FILTER, KVMIO, 0xEC, u64);

// vCPU ioctls.
ioctl_ior_nr!(KVM_NITRO_GET_EVENT, KVMIO, 0xE5, EventData);
ioctl_io_nr!(KVM_NITRO_CONTINUE, KVMIO, 0xE6);
ioctl_ior_nr!(KVM_NITRO_GET_REGS, KVMIO, 0xE7, kvm_regs);
ioctl_iow_nr!(KVM_NITRO_SET_REGS, KVMIO, 0xE8, kvm_regs);
ioctl_ior_nr!(KVM_NITRO_GET_SREGS, KVMIO, 0xE9, kvm_sregs);
ioctl_iow_nr!(KVM_NITRO_SET_SREGS, KVMIO, 0xEA, kvm_sregs);

/// vCPU table filled in by the kernel on `KVM_NITRO_ATTACH_VCPUS`.
///
/// The caller allocates it zeroed; the kernel writes `num_vcpus` and the
/// first `num_vcpus` slots of `ids` and `fds`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NitroVcpus {
    pub num_vcpus: c_int,
    pub ids: [c_int; NITRO_MAX_VCPUS],
    pub fds: [c_int; NITRO_MAX_VCPUS],
}

impl Default for NitroVcpus {
    fn default() -> Self {
        NitroVcpus {
            num_vcpus: 0,
            ids: [0; NITRO_MAX_VCPUS],
            fds: [0; NITRO_MAX_VCPUS],
        }
    }
}

/// Payload written by `KVM_NITRO_GET_EVENT`.
///
/// The kernel declares this as a union whose only member is the system
/// call number, so a single-field C struct has the same layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventData {
    pub syscall: u64,
}
