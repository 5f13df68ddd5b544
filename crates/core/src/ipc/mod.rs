// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared-memory transport between execution contexts.
//!
//! - [`ring`]: index rings with independent producer and consumer cursors
//! - [`slot`]: the slot table carrying buffer metadata in shared form
//! - [`channel`]: one forward ring, one reverse ring and a slot table per adapter pair
//!
//! A slot index is, at any instant, in at most one of: the out-adapter's free
//! list, the forward ring, held by the in-adapter, or the reverse ring.

pub mod channel;
pub mod ring;
pub mod slot;

pub use channel::{IpcChannel, IpcChannelConfig, IpcChannelId, IpcChannelTable};
pub use ring::IpcRing;
pub use slot::{IpcSlot, IpcSlotTable, SharedPlane, SlotFlags, IPC_MAX_SLOTS};
