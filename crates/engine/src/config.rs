// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Configuration for a running system.

use crate::constants::{DEFAULT_IPC_REGION_BASE, DEFAULT_SHUTDOWN_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Address mapping of one execution context.
///
/// Both contexts of an IPC pair see the same physical memory through their own
/// window: `local = shared - shared_base + local_base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub name: String,
    pub local_base: u64,
    pub shared_base: u64,
}

impl ContextConfig {
    /// A context whose local and shared addresses coincide.
    pub fn identity(name: impl Into<String>) -> Self {
        Self { name: name.into(), local_base: 0, shared_base: 0 }
    }
}

/// Configuration for a [`crate::System`].
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Capacity of each link's mailbox (default: 32 commands)
    pub mailbox_capacity: Option<usize>,
    /// Capacity of the state update channel (default: 128 updates)
    pub state_capacity: Option<usize>,
    /// Base address of the region holding IPC rings and slots
    pub ipc_region_base: u64,
    /// Contexts created up front; contexts first named by a pipeline get an
    /// identity mapping
    pub contexts: Vec<ContextConfig>,
    /// How long teardown waits for link tasks
    pub shutdown_timeout: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: None, // Uses DEFAULT_MAILBOX_CAPACITY when None
            state_capacity: None,   // Uses DEFAULT_STATE_CHANNEL_CAPACITY when None
            ipc_region_base: DEFAULT_IPC_REGION_BASE,
            contexts: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}
