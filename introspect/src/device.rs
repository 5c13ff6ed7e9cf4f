// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::error::{Error, Result};
use nitro_ioctls::{Request, Transport};
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Descriptor of the opened control device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceHandle(RawFd);

impl DeviceHandle {
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

/// Owner of the control device descriptor.
pub struct DeviceChannel {
    transport: Arc<dyn Transport>,
    path: PathBuf,
    handle: Option<DeviceHandle>,
}

impl DeviceChannel {
    pub fn new(transport: Arc<dyn Transport>, path: &Path) -> Self {
        DeviceChannel {
            transport,
            path: path.to_path_buf(),
            handle: None,
        }
    }

    /// Opens the control device. Calling it again while the device is open
    /// hands back the existing handle.
    pub fn open_device(&mut self) -> Result<DeviceHandle> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }

        let fd = self
            .transport
            .open(&self.path)
            .map_err(|source| Error::DeviceUnavailable {
                path: self.path.clone(),
                source,
            })?;
        debug!("Opened control device {:?} as fd {}", self.path, fd);

        let handle = DeviceHandle(fd);
        self.handle = Some(handle);
        Ok(handle)
    }

    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issues a device scoped request and returns the raw result.
    pub fn generic_request(&self, request: Request<'_>) -> Result<c_int> {
        let fd = self.fd()?;
        let name = request.name();
        self.transport
            .ioctl(fd, request)
            .map_err(|source| Error::IoctlFailed {
                request: name,
                source,
            })
    }

    /// Number of VMs the kernel module lets us attach to.
    pub fn count_vms(&self) -> Result<usize> {
        self.generic_request(Request::NumVms).map(|n| n as usize)
    }

    /// Releases the descriptor. Safe to call when nothing is open.
    pub fn close_device(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.transport.close(handle.raw()) {
                warn!("Failed to close control device fd {}: {}", handle.raw(), e);
            }
            debug!("Closed control device fd {}", handle.raw());
        }
    }

    pub(crate) fn fd(&self) -> Result<RawFd> {
        self.handle.map(|h| h.raw()).ok_or(Error::DeviceClosed)
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockTransport, DEVICE_FD};

    fn channel(mock: &Arc<MockTransport>) -> DeviceChannel {
        DeviceChannel::new(mock.clone(), Path::new("/dev/kvm"))
    }

    #[test]
    fn test_open_is_idempotent() {
        let mock = MockTransport::new();
        let mut device = channel(&mock);

        let first = device.open_device().unwrap();
        let second = device.open_device().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.raw(), DEVICE_FD);
        assert_eq!(mock.count("open"), 1);
    }

    #[test]
    fn test_open_failure() {
        let mock = MockTransport::new();
        mock.fail("open", libc::EACCES);
        let mut device = channel(&mock);

        let err = device.open_device().unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
        assert_eq!(err.errno(), Some(libc::EACCES));
        assert!(device.handle().is_none());
    }

    #[test]
    fn test_generic_request_passthrough() {
        let mock = MockTransport::new();
        mock.set_num_vms(3);
        let mut device = channel(&mock);

        assert!(matches!(device.count_vms(), Err(Error::DeviceClosed)));
        device.open_device().unwrap();
        assert_eq!(device.count_vms().unwrap(), 3);

        mock.fail("num_vms", libc::ENOTTY);
        let err = device.generic_request(Request::NumVms).unwrap_err();
        assert!(matches!(
            err,
            Error::IoctlFailed {
                request: "num_vms",
                ..
            }
        ));
        assert_eq!(err.errno(), Some(libc::ENOTTY));
    }

    #[test]
    fn test_close_without_open() {
        let mock = MockTransport::new();
        let mut device = channel(&mock);
        device.close_device();
        assert!(mock.calls().is_empty());

        device.open_device().unwrap();
        device.close_device();
        device.close_device();
        assert_eq!(mock.closes(), vec![DEVICE_FD]);
        assert_eq!(mock.calls().last(), Some(&Call::Close(DEVICE_FD)));
    }
}
