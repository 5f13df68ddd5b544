// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! IPC channels: the shared state of one Out/In adapter pair.

use super::ring::IpcRing;
use super::slot::IpcSlotTable;
use crate::error::{FrameLinkError, Result};
use crate::link::{LinkId, LinkInfo};
use crate::platform::{LocalAddr, MemRange};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use ts_rs::TS;

/// Identifier of an IPC channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, TS,
)]
#[ts(export)]
pub struct IpcChannelId(pub u32);

impl fmt::Display for IpcChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipc{}", self.0)
    }
}

/// Sizing of one IPC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
#[serde(default)]
pub struct IpcChannelConfig {
    /// Physical entries of the forward ring; one fewer can be queued.
    pub ring_capacity: usize,
    /// Slots owned by the out-adapter.
    pub slots: usize,
}

impl Default for IpcChannelConfig {
    fn default() -> Self {
        Self { ring_capacity: 9, slots: 8 }
    }
}

/// Forward ring, reverse ring and slot table shared by an adapter pair.
#[derive(Debug)]
pub struct IpcChannel {
    id: IpcChannelId,
    out_link: LinkId,
    in_link: LinkId,
    forward: IpcRing,
    reverse: IpcRing,
    slots: IpcSlotTable,
    peer_info: Mutex<Option<LinkInfo>>,
}

impl IpcChannel {
    /// Shared bytes needed for `config`.
    pub fn region_len(config: &IpcChannelConfig) -> u64 {
        IpcRing::region_len(config.ring_capacity)
            + IpcRing::region_len(Self::reverse_capacity(config))
            + IpcSlotTable::region_len(config.slots)
    }

    /// The reverse ring can always hold every slot.
    fn reverse_capacity(config: &IpcChannelConfig) -> usize {
        config.ring_capacity.max(config.slots + 1)
    }

    /// # Errors
    ///
    /// `Configuration` for degenerate ring capacity or slot count.
    pub fn new(
        id: IpcChannelId,
        config: &IpcChannelConfig,
        out_link: LinkId,
        in_link: LinkId,
        base: LocalAddr,
    ) -> Result<Self> {
        let forward = IpcRing::new(config.ring_capacity, MemRange::new(base, 0))?;
        let reverse_base = LocalAddr(base.0 + forward.region().len);
        let reverse =
            IpcRing::new(Self::reverse_capacity(config), MemRange::new(reverse_base, 0))?;
        let slots_base = LocalAddr(reverse_base.0 + reverse.region().len);
        let slots = IpcSlotTable::new(config.slots, MemRange::new(slots_base, 0))?;
        Ok(Self { id, out_link, in_link, forward, reverse, slots, peer_info: Mutex::new(None) })
    }

    pub const fn id(&self) -> IpcChannelId {
        self.id
    }

    pub const fn out_link(&self) -> LinkId {
        self.out_link
    }

    pub const fn in_link(&self) -> LinkId {
        self.in_link
    }

    /// Out-adapter to in-adapter: slots holding new data.
    pub const fn forward(&self) -> &IpcRing {
        &self.forward
    }

    /// In-adapter to out-adapter: slots returned.
    pub const fn reverse(&self) -> &IpcRing {
        &self.reverse
    }

    pub const fn slots(&self) -> &IpcSlotTable {
        &self.slots
    }

    /// Producer-side layout, published by the out-adapter at CREATE.
    pub fn publish_peer_info(&self, info: LinkInfo) {
        *self.peer_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    pub fn peer_info(&self) -> Option<LinkInfo> {
        self.peer_info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_peer_info(&self) {
        *self.peer_info.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// All IPC channels of a system. Regions are carved sequentially from `base`.
#[derive(Debug)]
pub struct IpcChannelTable {
    channels: RwLock<HashMap<IpcChannelId, Arc<IpcChannel>>>,
    base: LocalAddr,
    next_offset: AtomicU64,
    next_id: AtomicU32,
}

impl Default for IpcChannelTable {
    fn default() -> Self {
        Self::new(LocalAddr(0))
    }
}

impl IpcChannelTable {
    pub fn new(base: LocalAddr) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            base,
            next_offset: AtomicU64::new(0),
            next_id: AtomicU32::new(0),
        }
    }

    /// Creates a channel between `out_link` and `in_link`. Picks the next free id
    /// when `id` is `None`.
    ///
    /// # Errors
    ///
    /// `Configuration` when the id is taken or the sizing is invalid.
    pub fn create(
        &self,
        id: Option<IpcChannelId>,
        config: &IpcChannelConfig,
        out_link: LinkId,
        in_link: LinkId,
    ) -> Result<Arc<IpcChannel>> {
        let id = id.unwrap_or_else(|| IpcChannelId(self.next_id.fetch_add(1, Ordering::Relaxed)));
        let mut channels = self
            .channels
            .write()
            .map_err(|_| FrameLinkError::Runtime("IPC channel table poisoned".to_string()))?;
        if channels.contains_key(&id) {
            return Err(FrameLinkError::Configuration(format!("IPC channel {id} already exists")));
        }

        let offset = self.next_offset.fetch_add(IpcChannel::region_len(config), Ordering::Relaxed);
        let channel =
            Arc::new(IpcChannel::new(id, config, out_link, in_link, LocalAddr(self.base.0 + offset))?);
        channels.insert(id, channel.clone());
        tracing::debug!(
            channel = %id,
            out_link = %out_link,
            in_link = %in_link,
            ring_capacity = config.ring_capacity,
            slots = config.slots,
            "IPC channel created"
        );
        Ok(channel)
    }

    /// # Errors
    ///
    /// `Configuration` if no such channel exists.
    pub fn get(&self, id: IpcChannelId) -> Result<Arc<IpcChannel>> {
        self.channels
            .read()
            .ok()
            .and_then(|c| c.get(&id).cloned())
            .ok_or_else(|| FrameLinkError::Configuration(format!("IPC channel {id} does not exist")))
    }

    pub fn remove(&self, id: IpcChannelId) -> Option<Arc<IpcChannel>> {
        self.channels.write().ok().and_then(|mut c| c.remove(&id))
    }

    pub fn len(&self) -> usize {
        self.channels.read().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut channels) = self.channels.write() {
            channels.clear();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::platform::RecordingPlatform;

    #[test]
    fn test_reverse_ring_holds_every_slot() {
        let config = IpcChannelConfig { ring_capacity: 4, slots: 8 };
        let channel =
            IpcChannel::new(IpcChannelId(0), &config, LinkId(1), LinkId(2), LocalAddr(0)).unwrap();
        let platform = RecordingPlatform::default();
        for i in 0..8 {
            assert!(channel.reverse().push(&platform, i).is_ok());
        }
        assert_eq!(channel.forward().usable(), 3);
    }

    #[test]
    fn test_regions_do_not_overlap() {
        let table = IpcChannelTable::new(LocalAddr(0x1000));
        let config = IpcChannelConfig::default();
        let a = table.create(None, &config, LinkId(1), LinkId(2)).unwrap();
        let b = table.create(None, &config, LinkId(3), LinkId(4)).unwrap();
        assert_ne!(a.id(), b.id());

        let a_end = a.slots().region().addr.0 + a.slots().region().len;
        assert!(b.forward().region().addr.0 >= a_end);
        assert_eq!(a.reverse().region().addr.0, 0x1000 + a.forward().region().len);
    }

    #[test]
    fn test_duplicate_and_missing_ids() {
        let table = IpcChannelTable::default();
        let config = IpcChannelConfig::default();
        table.create(Some(IpcChannelId(5)), &config, LinkId(1), LinkId(2)).unwrap();
        assert!(table.create(Some(IpcChannelId(5)), &config, LinkId(1), LinkId(2)).is_err());
        assert!(table.get(IpcChannelId(6)).is_err());
        assert!(table.remove(IpcChannelId(5)).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_peer_info_round_trip() {
        let table = IpcChannelTable::default();
        let channel = table.create(None, &IpcChannelConfig::default(), LinkId(1), LinkId(2)).unwrap();
        assert!(channel.peer_info().is_none());
        channel.publish_peer_info(LinkInfo::default());
        assert_eq!(channel.peer_info(), Some(LinkInfo::default()));
        channel.clear_peer_info();
        assert!(channel.peer_info().is_none());
    }
}
