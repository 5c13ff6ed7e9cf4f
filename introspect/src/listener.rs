// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Event loops driving the trap cycle of attached vCPUs.
//!
//! Every held guest is resumed exactly once, whether the event was reported,
//! passed through, or its registers could not be read. Cancellation is only
//! observed between cycles: a thread blocked in `get_event` is woken with
//! `SIGRTMIN` and sees the token on its next iteration.

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::event::{EventRecord, TrapEvent};
use crate::session::Session;
use crate::vcpu::Vcpu;
use libc::{c_void, siginfo_t};
use nitro_ioctls::Transport;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

/// Shared stop request for listeners.
///
/// The flag can be handed to signal handlers directly, see
/// [`CancellationToken::flag`].
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

/// Counters of one vCPU listening run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub events: u64,
    pub syscall_entries: u64,
    pub syscall_returns: u64,
    pub passthrough: u64,
    pub kernel_errors: u64,
    pub interruptions: u64,
}

pub struct Listener {
    config: ListenerConfig,
    token: CancellationToken,
}

impl Listener {
    pub fn new(config: ListenerConfig, token: CancellationToken) -> Self {
        Listener { config, token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs the trap cycle of vCPU `index` on the calling thread until the
    /// token is cancelled or a request fails.
    pub fn listen_vcpu<F>(
        &self,
        session: &mut Session,
        index: usize,
        mut handler: F,
    ) -> Result<ListenerStats>
    where
        F: FnMut(&TrapEvent),
    {
        let (transport, vcpus) = session.vcpus_mut()?;
        let count = vcpus.len();
        let vcpu = vcpus
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, count })?;
        run_vcpu(transport, vcpu, &self.token, &mut handler)
    }

    /// Listens on the configured vCPUs, one thread each, until the token is
    /// cancelled or one of them fails. A failing vCPU cancels the others.
    ///
    /// Returns the statistics of each vCPU by logical index, or the first
    /// error once every thread has stopped.
    pub fn listen<F>(
        &self,
        session: &mut Session,
        handler: F,
    ) -> Result<Vec<(usize, ListenerStats)>>
    where
        F: Fn(&TrapEvent) + Sync,
    {
        let (transport, vcpus) = session.vcpus_mut()?;
        let count = vcpus.len();
        let selected = match self.config.vcpus.as_ref() {
            Some(indices) => {
                if let Some(&index) = indices.iter().find(|i| **i >= count) {
                    return Err(Error::IndexOutOfRange { index, count });
                }
                indices.iter().copied().collect::<BTreeSet<_>>()
            }
            None => (0..count).collect(),
        };

        extern "C" fn handle_signal(_: i32, _: *mut siginfo_t, _: *mut c_void) {}
        // A no-op handler is enough to turn the blocking wait into EINTR.
        register_signal_handler(SIGRTMIN(), handle_signal)
            .map_err(|e| Error::ListenerThread(format!("signal handler: {e}")))?;

        let token = &self.token;
        let handler = &handler;
        let kick_interval = self.config.kick_interval;
        let tids = selected
            .iter()
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>();

        thread::scope(|scope| {
            let mut workers = Vec::new();
            let mut spawn_error = None;

            let targets = vcpus
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| selected.contains(i));
            for ((index, vcpu), tid) in targets.zip(tids.iter()) {
                let spawned = thread::Builder::new()
                    .name(format!("vcpu{index}"))
                    .spawn_scoped(scope, move || {
                        // SAFETY: FFI call without arguments.
                        tid.store(unsafe { libc::pthread_self() } as u64, Ordering::SeqCst);
                        let mut handler = |e: &TrapEvent| handler(e);
                        let result = run_vcpu(transport, vcpu, token, &mut handler);
                        if let Err(e) = &result {
                            error!("vCPU {} listener stopped: {}", index, e);
                            token.cancel();
                        }
                        result
                    });
                match spawned {
                    Ok(handle) => workers.push((index, tid, handle)),
                    Err(e) => {
                        token.cancel();
                        spawn_error = Some(Error::ListenerThread(format!(
                            "failed to spawn vcpu{index}: {e}"
                        )));
                        break;
                    }
                }
            }
            info!("Listening on {} vCPUs", workers.len());

            while workers.iter().any(|(_, _, h)| !h.is_finished()) {
                if token.is_cancelled() {
                    for (_, tid, handle) in workers.iter() {
                        if !handle.is_finished() {
                            kick(tid);
                        }
                    }
                }
                thread::sleep(kick_interval);
            }

            let mut stats = Vec::with_capacity(workers.len());
            let mut first_error = spawn_error;
            for (index, _, handle) in workers {
                match handle.join() {
                    Ok(Ok(s)) => stats.push((index, s)),
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(_) => {
                        first_error
                            .get_or_insert(Error::ListenerThread(format!("vcpu{index} panicked")));
                    }
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(stats),
            }
        })
    }
}

/// Interrupts the blocking wait of the thread recorded in `tid`.
fn kick(tid: &AtomicU64) {
    let tid = tid.load(Ordering::SeqCst);
    if tid != 0 {
        // SAFETY: the thread has not been joined yet so its id is valid.
        unsafe {
            libc::pthread_kill(tid as libc::pthread_t, SIGRTMIN());
        }
    }
}

fn run_vcpu<F>(
    transport: &dyn Transport,
    vcpu: &mut Vcpu,
    token: &CancellationToken,
    handler: &mut F,
) -> Result<ListenerStats>
where
    F: FnMut(&TrapEvent),
{
    let mut stats = ListenerStats::default();

    while !token.is_cancelled() {
        let record = match vcpu.next_event(transport) {
            Ok(record) => record,
            Err(Error::Interrupted { .. }) => {
                stats.interruptions += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        stats.events += 1;

        let snapshot = vcpu.snapshot_registers(transport).and_then(|regs| {
            vcpu.snapshot_segment_registers(transport)
                .map(|sregs| (regs, sregs))
        });
        let (regs, sregs) = match snapshot {
            Ok(s) => s,
            Err(e) => {
                error!("vCPU {}: failed to capture registers: {}", vcpu.index(), e);
                if let Err(resume_error) = vcpu.resume(transport) {
                    error!("vCPU {}: {}", vcpu.index(), resume_error);
                }
                return Err(e);
            }
        };

        match record {
            EventRecord::SyscallEntry(_) => stats.syscall_entries += 1,
            EventRecord::SyscallReturn(_) => stats.syscall_returns += 1,
            EventRecord::Timeout => {
                stats.passthrough += 1;
                debug!("vCPU {}: no trap event, resuming", vcpu.index());
            }
            EventRecord::Error => {
                stats.kernel_errors += 1;
                warn!("vCPU {}: kernel reported an event error", vcpu.index());
            }
        }

        if record.is_trap() {
            handler(&TrapEvent {
                vcpu: vcpu.index(),
                kernel_id: vcpu.kernel_id(),
                record,
                regs,
                sregs,
            });
        }

        vcpu.resume(transport)?;
    }

    debug!("vCPU {}: listener cancelled", vcpu.index());
    Ok(stats)
}
