// Copyright © 2025 The Nitro Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::path::PathBuf;
use std::time::Duration;

/// Node of the Nitro enabled KVM module.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/kvm";

/// How often a cancelled listener re-signals vCPU threads still blocked in
/// the kernel.
pub const DEFAULT_KICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub device_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Logical vCPU indices to listen on, `None` for every discovered vCPU.
    pub vcpus: Option<Vec<usize>>,
    pub kick_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            vcpus: None,
            kick_interval: DEFAULT_KICK_INTERVAL,
        }
    }
}
