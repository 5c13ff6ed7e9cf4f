// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::error::{Error, Result};
use crate::event::{EventRecord, RegisterSnapshot, SegmentRegisterSnapshot};
use crate::vm::VmSession;
use nitro_ioctls::{EventData, NitroVcpus, Request, Transport, NITRO_MAX_VCPUS};
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use vmm_sys_util::errno;

/// Descriptor of one attached vCPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuHandle(RawFd);

impl VcpuHandle {
    pub fn raw(&self) -> RawFd {
        self.0
    }
}

/// Slot of the vCPU table as handed out by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuEntry {
    pub logical_index: usize,
    pub kernel_id: i32,
    pub handle: Option<VcpuHandle>,
}

/// Position of a vCPU in its trap cycle.
///
/// `Idle -> AwaitingEvent -> EventReady -> Resuming -> Idle`, with `Closed`
/// once the handle is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuState {
    Idle,
    AwaitingEvent,
    EventReady,
    Resuming,
    Closed,
}

/// One attached vCPU and its trap cycle state.
#[derive(Debug)]
pub struct Vcpu {
    entry: VcpuEntry,
    state: VcpuState,
}

impl Vcpu {
    fn new(entry: VcpuEntry) -> Self {
        let state = if entry.handle.is_some() {
            VcpuState::Idle
        } else {
            VcpuState::Closed
        };
        Vcpu { entry, state }
    }

    pub fn index(&self) -> usize {
        self.entry.logical_index
    }

    pub fn kernel_id(&self) -> i32 {
        self.entry.kernel_id
    }

    pub fn entry(&self) -> &VcpuEntry {
        &self.entry
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    fn fd(&self) -> Result<RawFd> {
        self.entry
            .handle
            .map(|h| h.raw())
            .ok_or(Error::NoActiveSession)
    }

    fn request(&self, transport: &dyn Transport, request: Request<'_>) -> Result<c_int> {
        let fd = self.fd()?;
        let name = request.name();
        transport
            .ioctl(fd, request)
            .map_err(|source| Error::IoctlFailed {
                request: name,
                source,
            })
    }

    fn require_event(&self) -> Result<()> {
        match self.state {
            VcpuState::EventReady => Ok(()),
            VcpuState::Closed => Err(Error::NoActiveSession),
            _ => Err(Error::StaleState {
                index: self.index(),
            }),
        }
    }

    /// Blocks until the kernel holds this vCPU on a trap, or the wait is
    /// interrupted by a signal.
    ///
    /// This is the only call that may block for a guest dependent time.
    /// There is no timeout: a guest that never issues a trapped system call
    /// keeps it waiting until a signal arrives.
    pub fn next_event(&mut self, transport: &dyn Transport) -> Result<EventRecord> {
        match self.state {
            VcpuState::Idle => {}
            VcpuState::Closed => return Err(Error::NoActiveSession),
            _ => {
                return Err(Error::EventPending {
                    index: self.index(),
                })
            }
        }
        let fd = self.fd()?;

        self.state = VcpuState::AwaitingEvent;
        let mut data = EventData::default();
        match transport.ioctl(fd, Request::GetEvent(&mut data)) {
            Ok(code) => {
                self.state = VcpuState::EventReady;
                let record = EventRecord::decode(code, &data);
                debug!("vCPU {}: event {:?}", self.index(), record);
                Ok(record)
            }
            Err(e) if e.errno() == libc::EINTR => {
                self.state = VcpuState::Idle;
                Err(Error::Interrupted {
                    index: self.index(),
                })
            }
            Err(source) => {
                self.state = VcpuState::Idle;
                Err(Error::IoctlFailed {
                    request: "get_event",
                    source,
                })
            }
        }
    }

    pub fn snapshot_registers(&self, transport: &dyn Transport) -> Result<RegisterSnapshot> {
        self.require_event()?;
        let mut regs = RegisterSnapshot::default();
        self.request(transport, Request::GetRegs(&mut regs))?;
        Ok(regs)
    }

    pub fn snapshot_segment_registers(
        &self,
        transport: &dyn Transport,
    ) -> Result<SegmentRegisterSnapshot> {
        self.require_event()?;
        let mut sregs = SegmentRegisterSnapshot::default();
        self.request(transport, Request::GetSregs(&mut sregs))?;
        Ok(sregs)
    }

    /// Writes general purpose registers back before the guest resumes.
    pub fn set_registers(&self, transport: &dyn Transport, regs: &RegisterSnapshot) -> Result<()> {
        self.require_event()?;
        self.request(transport, Request::SetRegs(regs)).map(|_| ())
    }

    pub fn set_segment_registers(
        &self,
        transport: &dyn Transport,
        sregs: &SegmentRegisterSnapshot,
    ) -> Result<()> {
        self.require_event()?;
        self.request(transport, Request::SetSregs(sregs)).map(|_| ())
    }

    /// Lets the held guest continue.
    pub fn resume(&mut self, transport: &dyn Transport) -> Result<()> {
        match self.state {
            VcpuState::EventReady => {}
            VcpuState::Closed => return Err(Error::NoActiveSession),
            _ => {
                return Err(Error::NotAwaitingResume {
                    index: self.index(),
                })
            }
        }

        self.state = VcpuState::Resuming;
        match self.request(transport, Request::Continue) {
            Ok(_) => {
                self.state = VcpuState::Idle;
                Ok(())
            }
            Err(e) => {
                // The guest is still held.
                self.state = VcpuState::EventReady;
                Err(e)
            }
        }
    }

    fn release(&mut self, transport: &dyn Transport) -> bool {
        self.state = VcpuState::Closed;
        match self.entry.handle.take() {
            Some(handle) => {
                if let Err(e) = transport.close(handle.raw()) {
                    warn!(
                        "Failed to close vCPU {} fd {}: {}",
                        self.index(),
                        handle.raw(),
                        e
                    );
                }
                true
            }
            None => false,
        }
    }
}

/// vCPUs attached for the current VM session, indexed by logical index.
#[derive(Debug)]
pub struct VcpuTable {
    vcpus: Vec<Vcpu>,
}

impl VcpuTable {
    /// Asks the kernel for the vCPU table of `vm`.
    pub fn discover(vm: &VmSession) -> Result<VcpuTable> {
        let mut raw = NitroVcpus::default();
        vm.raw_request(Request::AttachVcpus(&mut raw))
            .map_err(Error::DiscoverFailed)?;

        let count = usize::try_from(raw.num_vcpus)
            .ok()
            .filter(|n| *n <= NITRO_MAX_VCPUS)
            .ok_or_else(|| {
                error!("Kernel reported {} vCPUs", raw.num_vcpus);
                Error::DiscoverFailed(errno::Error::new(libc::EOVERFLOW))
            })?;

        let vcpus = (0..count)
            .map(|i| {
                let fd = raw.fds[i];
                Vcpu::new(VcpuEntry {
                    logical_index: i,
                    kernel_id: raw.ids[i],
                    handle: (fd > 0).then_some(VcpuHandle(fd)),
                })
            })
            .collect::<Vec<_>>();
        info!("Detected {} vCPUs", count);

        Ok(VcpuTable { vcpus })
    }

    pub fn count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn get(&self, index: usize) -> Result<&Vcpu> {
        let count = self.count();
        self.vcpus
            .get(index)
            .ok_or(Error::IndexOutOfRange { index, count })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Vcpu> {
        let count = self.count();
        self.vcpus
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, count })
    }

    pub fn handle_for(&self, index: usize) -> Result<VcpuHandle> {
        self.get(index)?.entry.handle.ok_or(Error::NoActiveSession)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vcpu> {
        self.vcpus.iter()
    }

    pub fn as_mut_slice(&mut self) -> &mut [Vcpu] {
        &mut self.vcpus
    }

    /// True while any vCPU handle has not been released.
    pub fn has_live_handles(&self) -> bool {
        self.vcpus.iter().any(|v| v.entry.handle.is_some())
    }

    /// Releases every populated handle once; released slots are skipped.
    pub fn release(&mut self, transport: &dyn Transport) -> usize {
        let released = self
            .vcpus
            .iter_mut()
            .map(|vcpu| vcpu.release(transport))
            .filter(|released| *released)
            .count();
        if released > 0 {
            debug!("Released {} vCPU handles", released);
        }
        released
    }
}
