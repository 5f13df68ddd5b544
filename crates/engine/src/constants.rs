// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared defaults for link tasks and the system.
//!
//! Server config and [`crate::SystemConfig`] reference these constants so the
//! values stay consistent across the codebase.
//!
//! # Mailbox Capacity Guidelines
//!
//! Mailbox capacities are measured in commands, not buffers. NEW_DATA and
//! RELEASE are coalesced to at most one pending instance each, so a mailbox
//! only fills up when lifecycle or CONTROL commands pile up faster than the
//! link processes them.

use std::time::Duration;

// === Link Tasks ===

/// Default capacity of each link's command mailbox.
///
/// Two slots are always spoken for by the coalesced NEW_DATA and RELEASE;
/// the rest absorb CREATE/STOP/DELETE and CONTROL bursts from the operator.
///
/// Recommended range: 8-128
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Default capacity of the internal channel carrying state updates from link
/// tasks to the system's fan-out task.
///
/// State emission uses `try_send`; when this channel is full the update is
/// dropped rather than stalling a link.
pub const DEFAULT_STATE_CHANNEL_CAPACITY: usize = 128;

/// Default buffer size for state subscriber channels.
///
/// Each subscriber gets its own channel with this capacity. Slow subscribers
/// miss updates instead of back-pressuring the fan-out task.
pub const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;

// === Lifecycle ===

/// How long teardown waits for link tasks to finish their DELETE.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long removing a single link waits for its task to exit.
pub const DEFAULT_LINK_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

// === Shared Memory ===

/// Default base of the region holding IPC rings and slot tables.
///
/// Every IPC channel gets a non-overlapping window above this address so
/// flush/invalidate ranges can be told apart.
pub const DEFAULT_IPC_REGION_BASE: u64 = 0x7000_0000;
