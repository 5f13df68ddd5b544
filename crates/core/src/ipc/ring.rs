// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Fixed-capacity ring of slot indices in memory visible to two contexts.
//!
//! Layout of the shared region: read cursor (4 bytes), write cursor (4 bytes),
//! then `capacity` 4-byte entries. The writer owns `write`, the reader owns `read`.
//! `read == write` means empty; one physical entry always stays unused so that a
//! full ring is distinguishable from an empty one.
//!
//! Publish order on push: entry, flush entry, cursor (Release), flush cursor.
//! Acquire order on pop: invalidate cursor, cursor (Acquire), invalidate entry.

use crate::error::{Exhausted, FrameLinkError, Result};
use crate::platform::{MemRange, PlatformMemory};
use std::sync::atomic::{AtomicU32, Ordering};

const CURSOR_BYTES: u64 = 4;
const ENTRY_BYTES: u64 = 4;
const HEADER_BYTES: u64 = 2 * CURSOR_BYTES;

/// A single-producer, single-consumer ring of `u32` indices.
///
/// Callers that push from more than one thread must serialize their pushes.
#[derive(Debug)]
pub struct IpcRing {
    entries: Box<[AtomicU32]>,
    read: AtomicU32,
    write: AtomicU32,
    region: MemRange,
}

impl IpcRing {
    /// Bytes of shared memory a ring of `capacity` entries occupies.
    pub const fn region_len(capacity: usize) -> u64 {
        HEADER_BYTES + ENTRY_BYTES * capacity as u64
    }

    /// # Errors
    ///
    /// `Configuration` when `capacity < 2` or does not fit a cursor.
    pub fn new(capacity: usize, region: MemRange) -> Result<Self> {
        if capacity < 2 {
            return Err(FrameLinkError::Configuration(format!(
                "ring capacity must be at least 2, got {capacity}"
            )));
        }
        if u32::try_from(capacity).is_err() {
            return Err(FrameLinkError::Configuration(format!("ring capacity {capacity} too large")));
        }
        Ok(Self {
            entries: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            read: AtomicU32::new(0),
            write: AtomicU32::new(0),
            region: MemRange::new(region.addr, Self::region_len(capacity)),
        })
    }

    /// Physical entries.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Entries that can be queued at once.
    pub fn usable(&self) -> usize {
        self.entries.len() - 1
    }

    pub const fn region(&self) -> MemRange {
        self.region
    }

    #[allow(clippy::cast_possible_truncation)]
    fn advance(&self, cursor: u32) -> u32 {
        // `new` guarantees capacity fits in u32.
        (cursor + 1) % self.entries.len() as u32
    }

    fn read_cursor_range(&self) -> MemRange {
        self.region.at(0, CURSOR_BYTES)
    }

    fn write_cursor_range(&self) -> MemRange {
        self.region.at(CURSOR_BYTES, CURSOR_BYTES)
    }

    fn entry_range(&self, index: u32) -> MemRange {
        self.region.at(HEADER_BYTES + ENTRY_BYTES * u64::from(index), ENTRY_BYTES)
    }

    /// Queues `value`. Never overwrites an unread entry.
    ///
    /// # Errors
    ///
    /// [`Exhausted::RingFull`] when `usable()` entries are already queued.
    pub fn push(&self, platform: &dyn PlatformMemory, value: u32) -> std::result::Result<(), Exhausted> {
        let write = self.write.load(Ordering::Relaxed);
        let next = self.advance(write);

        platform.invalidate(self.read_cursor_range());
        if next == self.read.load(Ordering::Acquire) {
            return Err(Exhausted::RingFull);
        }

        let slot = write as usize;
        self.entries[slot].store(value, Ordering::Relaxed);
        platform.flush(self.entry_range(write));

        self.write.store(next, Ordering::Release);
        platform.flush(self.write_cursor_range());
        Ok(())
    }

    /// Dequeues the oldest entry, if any.
    pub fn pop(&self, platform: &dyn PlatformMemory) -> Option<u32> {
        let read = self.read.load(Ordering::Relaxed);

        platform.invalidate(self.write_cursor_range());
        if read == self.write.load(Ordering::Acquire) {
            return None;
        }

        platform.invalidate(self.entry_range(read));
        let value = self.entries[read as usize].load(Ordering::Relaxed);

        self.read.store(self.advance(read), Ordering::Release);
        platform.flush(self.read_cursor_range());
        Some(value)
    }

    pub fn is_empty(&self, platform: &dyn PlatformMemory) -> bool {
        platform.invalidate(self.write_cursor_range());
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire) as usize;
        let write = self.write.load(Ordering::Acquire) as usize;
        (write + self.entries.len() - read) % self.entries.len()
    }

    /// Rewinds both cursors. Only valid while neither side is active.
    pub fn reset(&self) {
        self.read.store(0, Ordering::Release);
        self.write.store(0, Ordering::Release);
    }
}
