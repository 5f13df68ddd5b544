// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Buffers and buffer lists, the units of exchange between links.
//!
//! A [`Buffer`] is deliberately not `Clone`: a buffer is mutated in place and its
//! ownership moves as a whole, so at any instant it sits in exactly one queue or
//! is checked out by exactly one processing call.

use crate::error::{Exhausted, Rejected};
use crate::link::LinkId;
use crate::platform::LocalAddr;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use ts_rs::TS;

/// Maximum number of buffers moved by a single get/put call.
pub const MAX_BUFFERS_PER_LIST: usize = 64;

/// Maximum number of memory planes a payload can reference.
pub const MAX_PLANES: usize = 3;

/// What a buffer's payload holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, TS,
)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    #[default]
    VideoFrame,
    Bitstream,
    Metadata,
    CompositeFrame,
}

/// A contiguous memory region in the owning context's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRegion {
    pub addr: LocalAddr,
    pub size: u32,
}

/// Type-specific payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadInfo {
    Video { width: u32, height: u32, pitch: u32 },
    Bitstream { filled: u32 },
    Metadata { count: u32 },
    Composite { frames: u32 },
}

impl Default for PayloadInfo {
    fn default() -> Self {
        Self::Metadata { count: 0 }
    }
}

/// An opaque payload: up to [`MAX_PLANES`] regions plus a typed header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub planes: SmallVec<[MemRegion; MAX_PLANES]>,
    pub info: PayloadInfo,
}

impl Payload {
    pub fn single(addr: LocalAddr, size: u32, info: PayloadInfo) -> Self {
        let mut planes = SmallVec::new();
        planes.push(MemRegion { addr, size });
        Self { planes, info }
    }

    /// Total payload size across planes.
    pub fn size(&self) -> u64 {
        self.planes.iter().map(|p| u64::from(p.size)).sum()
    }
}

/// Identity of a buffer, fixed at allocation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[ts(export)]
pub struct BufferId {
    /// The link that allocated the buffer.
    pub link: LinkId,
    pub index: u32,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.link, self.index)
    }
}

/// The unit of exchange between links.
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    pub buf_type: BufferType,
    pub channel: u16,
    pub payload: Payload,
    /// Stamped once by the originating source.
    pub src_timestamp: u64,
    /// Restamped whenever the buffer enters a link.
    pub link_local_timestamp: u64,
    /// Set only on buffers received through an IPC ring.
    pub origin_slot: Option<u32>,
}

impl Buffer {
    pub const fn new(id: BufferId, buf_type: BufferType, channel: u16, payload: Payload) -> Self {
        Self {
            id,
            buf_type,
            channel,
            payload,
            src_timestamp: 0,
            link_local_timestamp: 0,
            origin_slot: None,
        }
    }

    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Channel as an index.
    pub fn channel_index(&self) -> usize {
        usize::from(self.channel)
    }
}

/// An ordered, bounded batch of buffers.
///
/// Order is FIFO within a channel; nothing is promised across channels.
#[derive(Debug, Default)]
pub struct BufferList {
    buffers: Vec<Buffer>,
}

impl BufferList {
    pub const fn new() -> Self {
        Self { buffers: Vec::new() }
    }

    /// Appends a buffer, handing it back when the list is already at
    /// [`MAX_BUFFERS_PER_LIST`].
    ///
    /// # Errors
    ///
    /// Returns the buffer with [`Exhausted::QueueFull`] when the list is full.
    pub fn push(&mut self, buffer: Buffer) -> Result<(), Rejected<Buffer>> {
        if self.is_full() {
            return Err(Rejected::exhausted(Exhausted::QueueFull, buffer));
        }
        self.buffers.push(buffer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffers.len() >= MAX_BUFFERS_PER_LIST
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Buffer> {
        self.buffers.iter_mut()
    }

    pub fn ids(&self) -> Vec<BufferId> {
        self.buffers.iter().map(Buffer::id).collect()
    }
}

impl IntoIterator for BufferList {
    type Item = Buffer;
    type IntoIter = std::vec::IntoIter<Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.into_iter()
    }
}

impl<'a> IntoIterator for &'a BufferList {
    type Item = &'a Buffer;
    type IntoIter = std::slice::Iter<'a, Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.iter()
    }
}

/// Accumulates buffers into lists no longer than [`MAX_BUFFERS_PER_LIST`].
///
/// Used where a pass can hand back more buffers than fit in one list.
#[derive(Debug, Default)]
pub struct BufferBatch {
    lists: Vec<BufferList>,
}

impl BufferBatch {
    pub const fn new() -> Self {
        Self { lists: Vec::new() }
    }

    pub fn push(&mut self, buffer: Buffer) {
        let buffer = match self.lists.last_mut() {
            Some(list) => match list.push(buffer) {
                Ok(()) => return,
                Err(rejected) => rejected.into_inner(),
            },
            None => buffer,
        };
        let mut list = BufferList::new();
        // A fresh list always has room.
        let _ = list.push(buffer);
        self.lists.push(list);
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(BufferList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn into_lists(self) -> Vec<BufferList> {
        self.lists
    }
}
