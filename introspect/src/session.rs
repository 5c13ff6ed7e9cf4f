// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::config::SessionConfig;
use crate::device::{DeviceChannel, DeviceHandle};
use crate::error::{Error, Result};
use crate::event::{EventRecord, RegisterSnapshot, SegmentRegisterSnapshot};
use crate::trap::{TrapConfiguration, TrapController};
use crate::vcpu::{Vcpu, VcpuHandle, VcpuState, VcpuTable};
use crate::vm::{VmHandle, VmSession};
use nitro_ioctls::{Request, Transport};
use std::os::raw::c_int;
use std::sync::Arc;

/// Introspection session over one control device and at most one attached
/// VM.
///
/// Handles nest strictly: vCPU handles are released before the VM handle,
/// which is released before the device handle. [`Session::close`] (also run
/// on drop) walks that order and may be called any number of times.
pub struct Session {
    device: DeviceChannel,
    vm: Option<VmSession>,
    vcpus: Option<VcpuTable>,
    trap: TrapController,
}

impl Session {
    /// Creates a session without touching the device yet.
    pub fn new(transport: Arc<dyn Transport>, config: &SessionConfig) -> Self {
        Session {
            device: DeviceChannel::new(transport, &config.device_path),
            vm: None,
            vcpus: None,
            trap: TrapController::new(),
        }
    }

    /// Creates a session and opens the control device.
    pub fn open(transport: Arc<dyn Transport>, config: &SessionConfig) -> Result<Self> {
        let mut session = Session::new(transport, config);
        session.open_device()?;
        Ok(session)
    }

    pub fn open_device(&mut self) -> Result<DeviceHandle> {
        self.device.open_device()
    }

    pub fn generic_request(&self, request: Request<'_>) -> Result<c_int> {
        self.device.generic_request(request)
    }

    pub fn count_vms(&self) -> Result<usize> {
        self.device.count_vms()
    }

    /// Attaches to the VM created by `creator`. A second attach while a VM
    /// is attached is refused rather than replacing it.
    pub fn attach(&mut self, creator: libc::pid_t) -> Result<VmHandle> {
        if self.vm.is_some() {
            return Err(Error::SessionAlreadyActive);
        }
        let vm = VmSession::attach(&self.device, creator)?;
        let handle = vm.handle();
        self.vm = Some(vm);
        Ok(handle)
    }

    pub fn vm_handle(&self) -> Option<VmHandle> {
        self.vm.as_ref().map(|vm| vm.handle())
    }

    fn vm(&self) -> Result<&VmSession> {
        self.vm.as_ref().ok_or(Error::NoActiveSession)
    }

    pub fn vm_request(&self, request: Request<'_>) -> Result<c_int> {
        self.vm()?.vm_request(request)
    }

    /// Fills the vCPU table. Allowed once per attached VM.
    pub fn discover(&mut self) -> Result<usize> {
        let vm = self.vm.as_ref().ok_or(Error::NoActiveSession)?;
        if self.vcpus.is_some() {
            return Err(Error::AlreadyDiscovered);
        }
        let table = VcpuTable::discover(vm)?;
        let count = table.count();
        self.vcpus = Some(table);
        Ok(count)
    }

    fn table(&self) -> Result<&VcpuTable> {
        self.vcpus.as_ref().ok_or(Error::NotDiscovered)
    }

    fn vcpu_mut(&mut self, index: usize) -> Result<(&dyn Transport, &mut Vcpu)> {
        let vcpu = self
            .vcpus
            .as_mut()
            .ok_or(Error::NotDiscovered)?
            .get_mut(index)?;
        Ok((self.device.transport().as_ref(), vcpu))
    }

    fn vcpu_ref(&self, index: usize) -> Result<(&dyn Transport, &Vcpu)> {
        let vcpu = self.table()?.get(index)?;
        Ok((self.device.transport().as_ref(), vcpu))
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.as_ref().map_or(0, |t| t.count())
    }

    pub fn vcpu(&self, index: usize) -> Result<&Vcpu> {
        self.table()?.get(index)
    }

    pub fn handle_for(&self, index: usize) -> Result<VcpuHandle> {
        self.table()?.handle_for(index)
    }

    /// Splits the session into the transport and the vCPUs so that each
    /// vCPU can be driven from its own thread.
    pub fn vcpus_mut(&mut self) -> Result<(&dyn Transport, &mut [Vcpu])> {
        let table = self.vcpus.as_mut().ok_or(Error::NotDiscovered)?;
        Ok((self.device.transport().as_ref(), table.as_mut_slice()))
    }

    /// The VM trap requests go to. Traps are only installed once the vCPUs
    /// that will report them are known.
    fn trap_target<'a>(
        vm: &'a Option<VmSession>,
        vcpus: &Option<VcpuTable>,
    ) -> Result<&'a VmSession> {
        let vm = vm.as_ref().ok_or(Error::NoActiveSession)?;
        if vcpus.is_none() {
            return Err(Error::NotDiscovered);
        }
        Ok(vm)
    }

    pub fn set_trap(&mut self, config: &TrapConfiguration) -> Result<()> {
        let vm = Self::trap_target(&self.vm, &self.vcpus)?;
        self.trap.set_trap(vm, config)
    }

    /// Best-effort trap removal; see [`TrapController::clear_trap`]. Without
    /// an attached VM there is nothing to clear.
    pub fn clear_trap(&mut self) -> Result<()> {
        match self.vm.as_ref() {
            Some(vm) => self.trap.clear_trap(vm),
            None => Ok(()),
        }
    }

    pub fn add_syscall_filter(&mut self, nr: u64) -> Result<()> {
        let vm = Self::trap_target(&self.vm, &self.vcpus)?;
        self.trap.add_syscall_filter(vm, nr)
    }

    pub fn remove_syscall_filter(&mut self, nr: u64) -> Result<()> {
        let vm = Self::trap_target(&self.vm, &self.vcpus)?;
        self.trap.remove_syscall_filter(vm, nr)
    }

    pub fn trap(&self) -> &TrapController {
        &self.trap
    }

    pub fn next_event(&mut self, index: usize) -> Result<EventRecord> {
        let (transport, vcpu) = self.vcpu_mut(index)?;
        vcpu.next_event(transport)
    }

    pub fn snapshot_registers(&self, index: usize) -> Result<RegisterSnapshot> {
        let (transport, vcpu) = self.vcpu_ref(index)?;
        vcpu.snapshot_registers(transport)
    }

    pub fn snapshot_segment_registers(&self, index: usize) -> Result<SegmentRegisterSnapshot> {
        let (transport, vcpu) = self.vcpu_ref(index)?;
        vcpu.snapshot_segment_registers(transport)
    }

    pub fn set_registers(&self, index: usize, regs: &RegisterSnapshot) -> Result<()> {
        let (transport, vcpu) = self.vcpu_ref(index)?;
        vcpu.set_registers(transport, regs)
    }

    pub fn set_segment_registers(
        &self,
        index: usize,
        sregs: &SegmentRegisterSnapshot,
    ) -> Result<()> {
        let (transport, vcpu) = self.vcpu_ref(index)?;
        vcpu.set_segment_registers(transport, sregs)
    }

    pub fn resume(&mut self, index: usize) -> Result<()> {
        let (transport, vcpu) = self.vcpu_mut(index)?;
        vcpu.resume(transport)
    }

    /// Releases every vCPU handle. Returns how many were released.
    pub fn release_vcpus(&mut self) -> usize {
        let transport = self.device.transport().as_ref();
        self.vcpus
            .as_mut()
            .map_or(0, |table| table.release(transport))
    }

    /// Releases the VM handle. vCPU handles have to be released first.
    pub fn detach(&mut self) -> Result<()> {
        if self.vm.is_none() {
            return Err(Error::NoActiveSession);
        }
        if self.vcpus.as_ref().is_some_and(|t| t.has_live_handles()) {
            return Err(Error::VcpusStillAttached);
        }
        self.vcpus = None;
        self.trap.reset();
        match self.vm.take() {
            Some(vm) => vm.detach(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.device.handle().is_none() && self.vm.is_none()
    }

    /// Lets every vCPU still held on an event continue. Returns how many
    /// were resumed; failures are logged.
    fn resume_held_vcpus(&mut self) -> usize {
        let transport = self.device.transport().as_ref();
        let Some(table) = self.vcpus.as_mut() else {
            return 0;
        };
        let mut resumed = 0;
        for vcpu in table.as_mut_slice() {
            if vcpu.state() != VcpuState::EventReady {
                continue;
            }
            match vcpu.resume(transport) {
                Ok(()) => resumed += 1,
                Err(e) => warn!("Failed to resume held vCPU {}: {}", vcpu.index(), e),
            }
        }
        resumed
    }

    /// Tears the session down: clears an installed trap, lets held guests
    /// continue, then releases vCPU, VM and device handles in that order.
    /// Failures are logged and never stop the remaining steps.
    pub fn close(&mut self) {
        if self.trap.is_active() {
            if let Err(e) = self.clear_trap() {
                warn!("Continuing teardown: {}", e);
            }
        }

        let resumed = self.resume_held_vcpus();
        if resumed > 0 {
            debug!("Resumed {} held vCPUs before release", resumed);
        }

        self.release_vcpus();

        if self.vm.is_some() {
            if let Err(e) = self.detach() {
                warn!("Continuing teardown: {}", e);
            }
        }

        self.device.close_device();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Idempotent; in case this wasn't called.
        self.close();
    }
}
