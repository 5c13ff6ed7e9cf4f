// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::path::PathBuf;
use thiserror::Error;
use vmm_sys_util::errno;

#[derive(Error, Debug)]
///
/// Enum for introspection session errors
///
pub enum Error {
    ///
    /// The control device node is missing or access was denied
    ///
    #[error("Failed to open control device {path:?}: {source}")]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: errno::Error,
    },
    ///
    /// The control device was already released
    ///
    #[error("Control device is closed")]
    DeviceClosed,
    ///
    /// A VM is already attached to this session
    ///
    #[error("A VM session is already active")]
    SessionAlreadyActive,
    ///
    /// No VM is attached to this session
    ///
    #[error("No VM session is active")]
    NoActiveSession,
    ///
    /// The kernel refused to attach to the VM
    ///
    #[error("Failed to attach to VM created by pid {pid}: {source}")]
    AttachFailed {
        pid: libc::pid_t,
        #[source]
        source: errno::Error,
    },
    ///
    /// The kernel refused to hand out the vCPU table
    ///
    #[error("Failed to attach vCPUs: {0}")]
    DiscoverFailed(#[source] errno::Error),
    ///
    /// vCPUs were already discovered for this session
    ///
    #[error("vCPUs were already discovered for this session")]
    AlreadyDiscovered,
    ///
    /// vCPUs have not been discovered yet
    ///
    #[error("vCPUs have not been discovered")]
    NotDiscovered,
    ///
    /// vCPU index past the discovered count
    ///
    #[error("vCPU index {index} out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },
    ///
    /// vCPU handles must be released before detaching
    ///
    #[error("vCPU handles are still attached")]
    VcpusStillAttached,
    ///
    /// The kernel rejected the trap configuration
    ///
    #[error("Failed to install syscall trap: {0}")]
    TrapInstallFailed(#[source] errno::Error),
    ///
    /// Best-effort trap removal failed
    ///
    #[error("Failed to clear syscall trap: {0}")]
    TrapClearFailed(#[source] errno::Error),
    ///
    /// Generic request failure
    ///
    #[error("Nitro request {request} failed: {source}")]
    IoctlFailed {
        request: &'static str,
        #[source]
        source: errno::Error,
    },
    ///
    /// Register state requested outside of a pending event
    ///
    #[error("vCPU {index} has no pending event, register state is stale")]
    StaleState { index: usize },
    ///
    /// Resume requested without a pending event
    ///
    #[error("vCPU {index} is not waiting to be resumed")]
    NotAwaitingResume { index: usize },
    ///
    /// Event requested while a previous one was not resumed
    ///
    #[error("vCPU {index} still holds an event that was not resumed")]
    EventPending { index: usize },
    ///
    /// Event wait interrupted by a signal
    ///
    #[error("Waiting for an event on vCPU {index} was interrupted")]
    Interrupted { index: usize },
    ///
    /// vCPU listener thread failure
    ///
    #[error("vCPU listener thread failed: {0}")]
    ListenerThread(String),
}

impl Error {
    /// Raw errno reported by the kernel, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::DeviceUnavailable { source, .. }
            | Error::AttachFailed { source, .. }
            | Error::IoctlFailed { source, .. } => Some(source.errno()),
            Error::DiscoverFailed(e) | Error::TrapInstallFailed(e) | Error::TrapClearFailed(e) => {
                Some(e.errno())
            }
            _ => None,
        }
    }

    /// True for local misuse of the session API, as opposed to failures
    /// reported by the kernel.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::SessionAlreadyActive
                | Error::AlreadyDiscovered
                | Error::NotDiscovered
                | Error::IndexOutOfRange { .. }
                | Error::VcpusStillAttached
                | Error::StaleState { .. }
                | Error::NotAwaitingResume { .. }
                | Error::EventPending { .. }
        )
    }

    /// False for failures that must never stop a teardown from proceeding.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::TrapClearFailed(_) | Error::Interrupted { .. })
    }
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, Error>;
