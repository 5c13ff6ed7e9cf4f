// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::*;
use kvm_bindings::{kvm_regs, kvm_sregs};
use std::ffi::CString;
use std::os::raw::{c_int, c_ulong};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use vmm_sys_util::errno;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref};

/// Result of a request against the control device: the non-negative ioctl
/// return value, or the errno the kernel reported.
pub type Result<T> = std::result::Result<T, errno::Error>;

/// One typed Nitro request.
///
/// Out-parameters are borrowed mutably for the duration of the call so the
/// kernel (or a simulation of it) can fill them in place.
#[derive(Debug)]
pub enum Request<'a> {
    NumVms,
    AttachVm(libc::pid_t),
    AttachVcpus(&'a mut NitroVcpus),
    SetSyscallTrap(bool),
    AddSyscallFilter(u64),
    RemoveSyscallFilter(u64),
    GetEvent(&'a mut EventData),
    Continue,
    GetRegs(&'a mut kvm_regs),
    SetRegs(&'a kvm_regs),
    GetSregs(&'a mut kvm_sregs),
    SetSregs(&'a kvm_sregs),
}

impl Request<'_> {
    /// Ioctl request number as passed to `ioctl(2)`.
    pub fn number(&self) -> c_ulong {
        match self {
            Request::NumVms => KVM_NITRO_NUM_VMS(),
            Request::AttachVm(_) => KVM_NITRO_ATTACH_VM(),
            Request::AttachVcpus(_) => KVM_NITRO_ATTACH_VCPUS(),
            Request::SetSyscallTrap(_) => KVM_NITRO_SET_SYSCALL_TRAP(),
            Request::AddSyscallFilter(_) => KVM_NITRO_ADD_SYSCALL_FILTER(),
            Request::RemoveSyscallFilter(_) => KVM_NITRO_REMOVE_SYSCALL_FILTER(),
            Request::GetEvent(_) => KVM_NITRO_GET_EVENT(),
            Request::Continue => KVM_NITRO_CONTINUE(),
            Request::GetRegs(_) => KVM_NITRO_GET_REGS(),
            Request::SetRegs(_) => KVM_NITRO_SET_REGS(),
            Request::GetSregs(_) => KVM_NITRO_GET_SREGS(),
            Request::SetSregs(_) => KVM_NITRO_SET_SREGS(),
        }
    }

    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Request::NumVms => "num_vms",
            Request::AttachVm(_) => "attach_vm",
            Request::AttachVcpus(_) => "attach_vcpus",
            Request::SetSyscallTrap(_) => "set_syscall_trap",
            Request::AddSyscallFilter(_) => "add_syscall_filter",
            Request::RemoveSyscallFilter(_) => "remove_syscall_filter",
            Request::GetEvent(_) => "get_event",
            Request::Continue => "continue",
            Request::GetRegs(_) => "get_regs",
            Request::SetRegs(_) => "set_regs",
            Request::GetSregs(_) => "get_sregs",
            Request::SetSregs(_) => "set_sregs",
        }
    }
}

///
/// Trait to represent the channel to the Nitro-enabled KVM module
///
/// Every descriptor handed out by `open` or by an attach request must be
/// given back to `close` exactly once.
///
pub trait Transport: Send + Sync {
    /// Opens the control device node read-write.
    fn open(&self, path: &Path) -> Result<RawFd>;
    /// Issues `request` against `fd` and returns the raw ioctl result.
    fn ioctl(&self, fd: RawFd, request: Request<'_>) -> Result<c_int>;
    /// Releases a descriptor.
    fn close(&self, fd: RawFd) -> Result<()>;
}

/// [`Transport`] backed by the real `ioctl(2)` system call.
#[derive(Debug, Default)]
pub struct KernelTransport;

impl KernelTransport {
    pub fn new() -> Self {
        KernelTransport
    }
}

impl Transport for KernelTransport {
    fn open(&self, path: &Path) -> Result<RawFd> {
        let path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| errno::Error::new(libc::EINVAL))?;
        // SAFETY: FFI call with a valid NUL terminated path
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(errno::Error::last());
        }
        Ok(fd)
    }

    fn ioctl(&self, fd: RawFd, request: Request<'_>) -> Result<c_int> {
        let nr = request.number();
        let name = request.name();
        // SAFETY: every request number is paired with the payload type it was
        // declared with, and the payload outlives the call.
        let ret = unsafe {
            match request {
                Request::NumVms | Request::Continue => ioctl(&fd, nr),
                Request::AttachVm(pid) => ioctl_with_ref(&fd, nr, &pid),
                Request::AttachVcpus(vcpus) => ioctl_with_mut_ref(&fd, nr, vcpus),
                Request::SetSyscallTrap(enabled) => ioctl_with_ref(&fd, nr, &enabled),
                Request::AddSyscallFilter(syscall) | Request::RemoveSyscallFilter(syscall) => {
                    ioctl_with_ref(&fd, nr, &syscall)
                }
                Request::GetEvent(data) => ioctl_with_mut_ref(&fd, nr, data),
                Request::GetRegs(regs) => ioctl_with_mut_ref(&fd, nr, regs),
                Request::SetRegs(regs) => ioctl_with_ref(&fd, nr, regs),
                Request::GetSregs(sregs) => ioctl_with_mut_ref(&fd, nr, sregs),
                Request::SetSregs(sregs) => ioctl_with_ref(&fd, nr, sregs),
            }
        };
        if ret < 0 {
            let e = errno::Error::last();
            debug!("Nitro request {} on fd {} failed: {}", name, fd, e);
            return Err(e);
        }
        Ok(ret)
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        // SAFETY: the caller owns fd and never uses it again
        let ret = unsafe { libc::close(fd) };
        if ret < 0 {
            return Err(errno::Error::last());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_numbers_match_declarations() {
        let mut vcpus = NitroVcpus::default();
        let mut data = EventData::default();
        assert_eq!(
            Request::AttachVcpus(&mut vcpus).number(),
            KVM_NITRO_ATTACH_VCPUS()
        );
        assert_eq!(Request::GetEvent(&mut data).number(), KVM_NITRO_GET_EVENT());
        assert_eq!(Request::AttachVm(42).name(), "attach_vm");
        assert_eq!(Request::Continue.number(), KVM_NITRO_CONTINUE());
    }

    #[test]
    fn test_open_missing_node() {
        let transport = KernelTransport::new();
        let err = transport
            .open(Path::new("/nonexistent/nitro-control-node"))
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_open_rejects_interior_nul() {
        let transport = KernelTransport::new();
        let path = Path::new(std::ffi::OsStr::from_bytes(b"/dev/\0kvm"));
        assert_eq!(transport.open(path).unwrap_err().errno(), libc::EINVAL);
    }
}
