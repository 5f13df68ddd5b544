// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! IPC slots: fixed-size, index-addressed copies of buffer metadata.

use crate::buffer::{Buffer, BufferType, MemRegion, PayloadInfo, MAX_PLANES};
use crate::error::{FrameLinkError, Result};
use crate::platform::{MemRange, PlatformMemory, SharedAddr};
use smallvec::SmallVec;
use std::sync::{Mutex, PoisonError};

/// Build-time maximum number of slots in one IPC channel.
pub const IPC_MAX_SLOTS: usize = 64;

/// Bytes reserved per slot in the shared region.
pub const SLOT_BYTES: u64 = 128;

/// Index of the push timestamp in [`IpcSlot::ipc_timestamps`].
pub const IPC_TS_PUSH: usize = 0;

/// Index of the publish timestamp in [`IpcSlot::ipc_timestamps`], taken just
/// before the index goes on the forward ring.
pub const IPC_TS_NOTIFY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotFlags {
    pub buf_type: BufferType,
    pub channel: u16,
    pub payload_size: u32,
}

/// A payload plane in context-independent form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedPlane {
    pub addr: SharedAddr,
    pub size: u32,
}

/// The shared representation of one in-flight buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpcSlot {
    pub flags: SlotFlags,
    pub src_timestamp: u64,
    pub link_local_timestamp: u64,
    pub ipc_timestamps: [u64; 2],
    pub planes: SmallVec<[SharedPlane; MAX_PLANES]>,
    pub info: PayloadInfo,
}

impl IpcSlot {
    /// Marshals `buffer`, translating payload addresses to shared form.
    pub fn from_buffer(buffer: &Buffer, platform: &dyn PlatformMemory, pushed_us: u64) -> Self {
        let planes = buffer
            .payload
            .planes
            .iter()
            .map(|p| SharedPlane { addr: platform.translate_to_shared(p.addr), size: p.size })
            .collect();
        Self {
            flags: SlotFlags {
                buf_type: buffer.buf_type,
                channel: buffer.channel,
                payload_size: u32::try_from(buffer.payload.size()).unwrap_or(u32::MAX),
            },
            src_timestamp: buffer.src_timestamp,
            link_local_timestamp: buffer.link_local_timestamp,
            ipc_timestamps: [pushed_us, 0],
            planes,
            info: buffer.payload.info,
        }
    }

    /// Unmarshals into a local buffer, translating payload addresses back.
    ///
    /// The buffer keeps its own identity; only metadata and payload move.
    pub fn apply_to(&self, buffer: &mut Buffer, platform: &dyn PlatformMemory) {
        buffer.buf_type = self.flags.buf_type;
        buffer.channel = self.flags.channel;
        buffer.src_timestamp = self.src_timestamp;
        buffer.link_local_timestamp = self.link_local_timestamp;
        buffer.payload.planes = self
            .planes
            .iter()
            .map(|p| MemRegion { addr: platform.translate_from_shared(p.addr), size: p.size })
            .collect();
        buffer.payload.info = self.info;
    }
}

/// The slot array of one IPC channel.
#[derive(Debug)]
pub struct IpcSlotTable {
    slots: Box<[Mutex<IpcSlot>]>,
    region: MemRange,
}

impl IpcSlotTable {
    pub const fn region_len(slots: usize) -> u64 {
        SLOT_BYTES * slots as u64
    }

    /// # Errors
    ///
    /// `Configuration` when `slots` is zero or above [`IPC_MAX_SLOTS`].
    pub fn new(slots: usize, region: MemRange) -> Result<Self> {
        if slots == 0 || slots > IPC_MAX_SLOTS {
            return Err(FrameLinkError::Configuration(format!(
                "{slots} IPC slots requested, must be within 1..={IPC_MAX_SLOTS}"
            )));
        }
        Ok(Self {
            slots: (0..slots).map(|_| Mutex::new(IpcSlot::default())).collect(),
            region: MemRange::new(region.addr, Self::region_len(slots)),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub const fn region(&self) -> MemRange {
        self.region
    }

    fn slot_range(&self, index: u32) -> MemRange {
        self.region.at(SLOT_BYTES * u64::from(index), SLOT_BYTES)
    }

    fn get(&self, index: u32) -> Result<&Mutex<IpcSlot>> {
        self.slots.get(index as usize).ok_or_else(|| {
            FrameLinkError::Protocol(format!(
                "slot index {index} outside table of {}",
                self.slots.len()
            ))
        })
    }

    /// Stores `slot` at `index` and publishes it.
    ///
    /// # Errors
    ///
    /// `Protocol` for an out-of-range index.
    pub fn write(&self, platform: &dyn PlatformMemory, index: u32, slot: IpcSlot) -> Result<()> {
        let cell = self.get(index)?;
        *cell.lock().unwrap_or_else(PoisonError::into_inner) = slot;
        platform.flush(self.slot_range(index));
        Ok(())
    }

    /// Reads the slot at `index` after discarding stale cache lines.
    ///
    /// # Errors
    ///
    /// `Protocol` for an out-of-range index.
    pub fn read(&self, platform: &dyn PlatformMemory, index: u32) -> Result<IpcSlot> {
        let cell = self.get(index)?;
        platform.invalidate(self.slot_range(index));
        Ok(cell.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Modifies the slot in place and publishes it.
    ///
    /// # Errors
    ///
    /// `Protocol` for an out-of-range index.
    pub fn update<F>(&self, platform: &dyn PlatformMemory, index: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut IpcSlot),
    {
        let cell = self.get(index)?;
        f(&mut cell.lock().unwrap_or_else(PoisonError::into_inner));
        platform.flush(self.slot_range(index));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::test_support::buffer;
    use crate::platform::{LocalAddr, OffsetMapping, RecordingPlatform};

    #[test]
    fn test_marshal_translates_between_contexts() {
        let producer = OffsetMapping::new(0x8000_0000, 0x1000_0000);
        let consumer = OffsetMapping::new(0xC000_0000, 0x1000_0000);

        let mut source = buffer(1, 3, 2);
        source.payload.planes[0].addr = LocalAddr(0x8000_3000);
        source.src_timestamp = 111;
        source.link_local_timestamp = 222;

        let slot = IpcSlot::from_buffer(&source, &producer, 333);
        assert_eq!(slot.planes[0].addr, SharedAddr(0x1000_3000));
        assert_eq!(slot.flags.channel, 2);
        assert_eq!(slot.flags.payload_size, 64);
        assert_eq!(slot.ipc_timestamps, [333, 0]);

        let mut local = buffer(7, 0, 0);
        slot.apply_to(&mut local, &consumer);
        assert_eq!(local.payload.planes[0].addr, LocalAddr(0xC000_3000));
        assert_eq!(local.channel, 2);
        assert_eq!(local.src_timestamp, 111);
        assert_eq!(local.id().link.0, 7);
    }

    #[test]
    fn test_table_bounds_and_publish() {
        let platform = RecordingPlatform::default();
        let table = IpcSlotTable::new(4, MemRange::new(LocalAddr(0), 0)).unwrap();
        assert_eq!(table.region().len, 4 * SLOT_BYTES);

        let slot = IpcSlot { src_timestamp: 9, ..IpcSlot::default() };
        table.write(&platform, 3, slot).unwrap();
        table.update(&platform, 3, |s| s.ipc_timestamps[IPC_TS_NOTIFY] = 5).unwrap();
        let read = table.read(&platform, 3).unwrap();
        assert_eq!(read.src_timestamp, 9);
        assert_eq!(read.ipc_timestamps[IPC_TS_NOTIFY], 5);
        assert_eq!(platform.flushes(), 2);
        assert_eq!(platform.invalidates(), 1);

        assert!(matches!(table.read(&platform, 4), Err(FrameLinkError::Protocol(_))));
    }

    #[test]
    fn test_slot_count_limits() {
        let region = MemRange::new(LocalAddr(0), 0);
        assert!(IpcSlotTable::new(0, region).is_err());
        assert!(IpcSlotTable::new(IPC_MAX_SLOTS + 1, region).is_err());
        assert!(IpcSlotTable::new(IPC_MAX_SLOTS, region).is_ok());
    }
}
