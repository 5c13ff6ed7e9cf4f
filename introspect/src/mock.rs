// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Scripted in-memory stand-in for the Nitro kernel module.

use crate::listener::CancellationToken;
use kvm_bindings::{kvm_regs, kvm_sregs};
use nitro_ioctls::{Request, Result, Transport, NITRO_MAX_VCPUS};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use vmm_sys_util::errno;

pub const DEVICE_FD: RawFd = 3;
pub const VM_FD: RawFd = 10;
const VCPU_FD_BASE: RawFd = 20;

pub fn vcpu_fd(index: usize) -> RawFd {
    VCPU_FD_BASE + index as RawFd
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Open,
    Ioctl { fd: RawFd, request: &'static str },
    Close(RawFd),
}

type EventHook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    failures: HashMap<&'static str, (c_int, bool)>,
    num_vms: c_int,
    attached_pid: Option<libc::pid_t>,
    vcpu_ids: Vec<c_int>,
    vcpu_fds: Vec<RawFd>,
    reported_count: Option<c_int>,
    filters: BTreeSet<u64>,
    trap_enabled: Option<bool>,
    events: HashMap<usize, VecDeque<std::result::Result<(c_int, u64), c_int>>>,
    regs: kvm_regs,
    sregs: kvm_sregs,
    cancel_on_drain: Option<CancellationToken>,
}

pub struct MockTransport {
    state: Mutex<State>,
    event_hook: Mutex<Option<EventHook>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_vcpus(&[])
    }

    /// Kernel that hands out one vCPU per id, with fds from `vcpu_fd`.
    pub fn with_vcpus(ids: &[c_int]) -> Arc<Self> {
        let state = State {
            vcpu_ids: ids.to_vec(),
            vcpu_fds: (0..ids.len()).map(vcpu_fd).collect(),
            regs: kvm_regs {
                rax: 0x3c,
                rip: 0xffff_ffff_8100_0000,
                ..Default::default()
            },
            sregs: kvm_sregs {
                cr3: 0x1aa000,
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(MockTransport {
            state: Mutex::new(state),
            event_hook: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Makes every `request` fail with `errno` from now on.
    pub fn fail(&self, request: &'static str, errno: c_int) {
        self.state().failures.insert(request, (errno, false));
    }

    /// Makes the next `request` fail with `errno`.
    pub fn fail_once(&self, request: &'static str, errno: c_int) {
        self.state().failures.insert(request, (errno, true));
    }

    pub fn set_num_vms(&self, n: c_int) {
        self.state().num_vms = n;
    }

    pub fn set_reported_vcpu_count(&self, n: c_int) {
        self.state().reported_count = Some(n);
    }

    pub fn set_vcpu_fd(&self, index: usize, fd: RawFd) {
        self.state().vcpu_fds[index] = fd;
    }

    pub fn push_event(&self, index: usize, code: c_int, syscall: u64) {
        self.state()
            .events
            .entry(index)
            .or_default()
            .push_back(Ok((code, syscall)));
    }

    pub fn push_event_error(&self, index: usize, errno: c_int) {
        self.state()
            .events
            .entry(index)
            .or_default()
            .push_back(Err(errno));
    }

    /// Once every scripted event queue is empty, cancels `token` and
    /// answers further waits with EINTR.
    pub fn cancel_on_drain(&self, token: CancellationToken) {
        self.state().cancel_on_drain = Some(token);
    }

    /// Runs `hook` with the vCPU index at the start of every event wait.
    pub fn on_event_wait<F: Fn(usize) + Send + Sync + 'static>(&self, hook: F) {
        *self.event_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn requests(&self) -> Vec<&'static str> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Ioctl { request, .. } => Some(*request),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<RawFd> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Close(fd) => Some(*fd),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, request: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| match c {
                Call::Open => request == "open",
                Call::Ioctl { request: r, .. } => *r == request,
                Call::Close(_) => request == "close",
            })
            .count()
    }

    /// Requests issued on the descriptor of vCPU `index`.
    pub fn vcpu_requests(&self, index: usize) -> Vec<&'static str> {
        let fd = vcpu_fd(index);
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Ioctl { fd: f, request } if *f == fd => Some(*request),
                _ => None,
            })
            .collect()
    }

    pub fn attached_pid(&self) -> Option<libc::pid_t> {
        self.state().attached_pid
    }

    pub fn filters(&self) -> Vec<u64> {
        self.state().filters.iter().copied().collect()
    }

    pub fn trap_enabled(&self) -> Option<bool> {
        self.state().trap_enabled
    }

    pub fn regs(&self) -> kvm_regs {
        self.state().regs
    }

    fn injected_failure(state: &mut State, request: &'static str) -> Result<()> {
        if let Some((errno, once)) = state.failures.get(request).copied() {
            if once {
                state.failures.remove(request);
            }
            return Err(errno::Error::new(errno));
        }
        Ok(())
    }

    fn vcpu_index(fd: RawFd) -> usize {
        (fd - VCPU_FD_BASE) as usize
    }

    fn next_event(&self, index: usize, data: &mut nitro_ioctls::EventData) -> Result<c_int> {
        if let Some(hook) = self.event_hook.lock().unwrap().as_ref() {
            hook(index);
        }

        let mut state = self.state();
        Self::injected_failure(&mut state, "get_event")?;
        if let Some(scripted) = state.events.get_mut(&index).and_then(|q| q.pop_front()) {
            return match scripted {
                Ok((code, syscall)) => {
                    data.syscall = syscall;
                    Ok(code)
                }
                Err(errno) => Err(errno::Error::new(errno)),
            };
        }

        // Nothing scripted for this vCPU: behave like a wait cut short by
        // a signal.
        if state.events.values().all(|q| q.is_empty()) {
            if let Some(token) = state.cancel_on_drain.as_ref() {
                token.cancel();
            }
        }
        drop(state);
        thread::yield_now();
        Err(errno::Error::new(libc::EINTR))
    }
}

impl Transport for MockTransport {
    fn open(&self, _path: &Path) -> Result<RawFd> {
        let mut state = self.state();
        state.calls.push(Call::Open);
        Self::injected_failure(&mut state, "open")?;
        Ok(DEVICE_FD)
    }

    fn ioctl(&self, fd: RawFd, request: Request<'_>) -> Result<c_int> {
        let name = request.name();
        {
            let mut state = self.state();
            state.calls.push(Call::Ioctl { fd, request: name });
            if !matches!(request, Request::GetEvent(_)) {
                Self::injected_failure(&mut state, name)?;
            }
        }

        match request {
            Request::NumVms => Ok(self.state().num_vms),
            Request::AttachVm(pid) => {
                self.state().attached_pid = Some(pid);
                Ok(VM_FD)
            }
            Request::AttachVcpus(vcpus) => {
                let state = self.state();
                let count = state.vcpu_ids.len().min(NITRO_MAX_VCPUS);
                vcpus.num_vcpus = state.reported_count.unwrap_or(count as c_int);
                vcpus.ids[..count].copy_from_slice(&state.vcpu_ids[..count]);
                vcpus.fds[..count].copy_from_slice(&state.vcpu_fds[..count]);
                Ok(0)
            }
            Request::SetSyscallTrap(enabled) => {
                self.state().trap_enabled = Some(enabled);
                Ok(0)
            }
            Request::AddSyscallFilter(nr) => {
                self.state().filters.insert(nr);
                Ok(0)
            }
            Request::RemoveSyscallFilter(nr) => {
                self.state().filters.remove(&nr);
                Ok(0)
            }
            Request::GetEvent(data) => self.next_event(Self::vcpu_index(fd), data),
            Request::Continue => Ok(0),
            Request::GetRegs(regs) => {
                *regs = self.state().regs;
                Ok(0)
            }
            Request::SetRegs(regs) => {
                self.state().regs = *regs;
                Ok(0)
            }
            Request::GetSregs(sregs) => {
                *sregs = self.state().sregs;
                Ok(0)
            }
            Request::SetSregs(sregs) => {
                self.state().sregs = *sregs;
                Ok(0)
            }
        }
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Close(fd));
        Self::injected_failure(&mut state, "close")
    }
}
