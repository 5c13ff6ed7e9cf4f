// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::device::DeviceChannel;
use crate::error::{Error, Result};
use nitro_ioctls::{Request, Transport};
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Descriptor returned by `KVM_NITRO_ATTACH_VM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmHandle(RawFd);

impl VmHandle {
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

/// An attached VM.
pub struct VmSession {
    transport: Arc<dyn Transport>,
    handle: VmHandle,
    creator: libc::pid_t,
}

impl VmSession {
    /// Attaches to the VM created by process `creator`.
    pub fn attach(device: &DeviceChannel, creator: libc::pid_t) -> Result<VmSession> {
        let fd = device.fd()?;
        let transport = device.transport().clone();

        let vm_fd = transport
            .ioctl(fd, Request::AttachVm(creator))
            .map_err(|source| Error::AttachFailed {
                pid: creator,
                source,
            })?;
        info!("Attached to VM created by pid {} (fd {})", creator, vm_fd);

        Ok(VmSession {
            transport,
            handle: VmHandle(vm_fd),
            creator,
        })
    }

    pub fn handle(&self) -> VmHandle {
        self.handle
    }

    pub fn creator(&self) -> libc::pid_t {
        self.creator
    }

    /// Issues a VM scoped request.
    pub fn vm_request(&self, request: Request<'_>) -> Result<c_int> {
        let name = request.name();
        self.raw_request(request)
            .map_err(|source| Error::IoctlFailed {
                request: name,
                source,
            })
    }

    pub(crate) fn raw_request(&self, request: Request<'_>) -> nitro_ioctls::Result<c_int> {
        debug!("VM fd {}: {}", self.handle.raw(), request.name());
        self.transport.ioctl(self.handle.raw(), request)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Releases the VM handle. Every vCPU handle must be gone by now.
    pub fn detach(self) -> Result<()> {
        let fd = self.handle.raw();
        self.transport
            .close(fd)
            .map_err(|source| Error::IoctlFailed {
                request: "detach_vm",
                source,
            })?;
        info!("Detached from VM created by pid {}", self.creator);
        Ok(())
    }
}
