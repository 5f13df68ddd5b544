// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-link queue pool.
//!
//! Each link owns:
//! - one bounded *empty* queue per (output queue, channel) holding buffers it may fill
//! - one bounded *full* queue per output queue holding buffers ready for consumers
//! - per input queue, the set of producer buffers it still holds ([`HeldBuffers`])
//! - buffers handed back that fit none of its queues ([`StrayBuffers`])
//!
//! Capacities are fixed at creation and queues never grow. Every operation takes a
//! single queue lock for O(1) work, so `put_*` may be called from a notification
//! context while the owning task uses `get_*`.

use crate::buffer::{Buffer, BufferId, BufferList, BufferType, Payload};
use crate::error::{Exhausted, FrameLinkError, Rejected, Result};
use crate::link::{LinkId, MAX_CHANNELS_PER_QUEUE, MAX_OUT_QUEUES};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use ts_rs::TS;

/// A fixed-capacity FIFO.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// # Errors
    ///
    /// Returns the item with [`Exhausted::QueueFull`] when at capacity.
    pub fn push(&mut self, item: T) -> std::result::Result<(), Rejected<T>> {
        if self.is_full() {
            return Err(Rejected::exhausted(Exhausted::QueueFull, item));
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.items.drain(..)
    }
}

/// Shape of one output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub channels: usize,
    /// Empty-queue capacity per channel.
    pub depth: usize,
    /// Full-queue capacity; defaults to `channels * depth`.
    pub full_capacity: Option<usize>,
}

impl QueueLayout {
    pub const fn new(channels: usize, depth: usize) -> Self {
        Self { channels, depth, full_capacity: None }
    }

    #[must_use]
    pub const fn with_full_capacity(mut self, capacity: usize) -> Self {
        self.full_capacity = Some(capacity);
        self
    }
}

/// Buffer totals at one observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, TS)]
#[ts(export)]
pub struct PoolCounts {
    pub allocated: usize,
    pub empty: usize,
    pub full: usize,
    /// Own buffers returned to a queue or channel that does not exist.
    pub parked: usize,
}

impl PoolCounts {
    /// Buffers currently outside this pool (with consumers or being processed).
    pub const fn outstanding(&self) -> usize {
        self.allocated.saturating_sub(self.empty + self.full + self.parked)
    }
}

struct OutQueue {
    empty: Vec<Mutex<BoundedQueue<Buffer>>>,
    full: Mutex<BoundedQueue<Buffer>>,
}

fn lock<T>(m: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match m.lock() {
        Ok(guard) => Some(guard),
        Err(_) => {
            tracing::error!("queue lock poisoned");
            None
        },
    }
}

/// The empty/full queues of one link.
pub struct QueuePool {
    link: LinkId,
    queues: Vec<OutQueue>,
    allocated: usize,
}

impl std::fmt::Debug for QueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePool")
            .field("link", &self.link)
            .field("queues", &self.queues.len())
            .field("counts", &self.counts())
            .finish()
    }
}

impl QueuePool {
    /// Builds empty and full queues for every output queue in `layouts`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for zero depth, too many queues or too many channels.
    pub fn new(link: LinkId, layouts: &[QueueLayout]) -> Result<Self> {
        if layouts.len() > MAX_OUT_QUEUES {
            return Err(FrameLinkError::Configuration(format!(
                "{} output queues requested, at most {MAX_OUT_QUEUES} supported",
                layouts.len()
            )));
        }

        let mut queues = Vec::with_capacity(layouts.len());
        for (index, layout) in layouts.iter().enumerate() {
            if layout.channels > MAX_CHANNELS_PER_QUEUE {
                return Err(FrameLinkError::Configuration(format!(
                    "queue {index}: {} channels requested, at most {MAX_CHANNELS_PER_QUEUE} supported",
                    layout.channels
                )));
            }
            if layout.depth == 0 {
                return Err(FrameLinkError::Configuration(format!(
                    "queue {index}: depth must be greater than 0"
                )));
            }
            let full_capacity = layout.full_capacity.unwrap_or(layout.channels * layout.depth);
            queues.push(OutQueue {
                empty: (0..layout.channels)
                    .map(|_| Mutex::new(BoundedQueue::with_capacity(layout.depth)))
                    .collect(),
                full: Mutex::new(BoundedQueue::with_capacity(full_capacity.max(1))),
            });
        }

        Ok(Self { link, queues, allocated: 0 })
    }

    pub const fn link(&self) -> LinkId {
        self.link
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn num_channels(&self, queue: usize) -> usize {
        self.queues.get(queue).map_or(0, |q| q.empty.len())
    }

    /// Fills every empty queue of `queue` to its depth with buffers built by `make`.
    ///
    /// Only called during CREATE, before the pool is shared.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `queue` does not exist.
    pub fn allocate<F>(&mut self, queue: usize, mut make: F) -> Result<usize>
    where
        F: FnMut(BufferId, u16) -> (BufferType, Payload),
    {
        let link = self.link;
        let mut next_index = u32::try_from(self.allocated).unwrap_or(u32::MAX);
        let out = self.queues.get(queue).ok_or_else(|| {
            FrameLinkError::Configuration(format!("queue {queue} does not exist"))
        })?;

        let mut created = 0;
        for (channel, empty) in out.empty.iter().enumerate() {
            let Some(mut empty) = lock(empty) else {
                return Err(FrameLinkError::Runtime("queue lock poisoned".to_string()));
            };
            let channel = u16::try_from(channel).unwrap_or(u16::MAX);
            while !empty.is_full() {
                let id = BufferId { link, index: next_index };
                let (buf_type, payload) = make(id, channel);
                if empty.push(Buffer::new(id, buf_type, channel, payload)).is_err() {
                    break;
                }
                next_index = next_index.saturating_add(1);
                created += 1;
            }
        }

        self.allocated += created;
        Ok(created)
    }

    pub const fn total_allocated(&self) -> usize {
        self.allocated
    }

    /// Returns a buffer to its channel's empty queue.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the channel's queue is at capacity, `Protocol` when the
    /// queue or channel does not exist. The buffer is handed back either way.
    pub fn put_empty(&self, queue: usize, buffer: Buffer) -> std::result::Result<(), Rejected<Buffer>> {
        let Some(empty) =
            self.queues.get(queue).and_then(|q| q.empty.get(buffer.channel_index()))
        else {
            let error = FrameLinkError::Protocol(format!(
                "buffer {} returned to unknown queue {queue} channel {}",
                buffer.id(),
                buffer.channel
            ));
            return Err(Rejected::new(error, buffer));
        };
        let Some(mut empty) = lock(empty) else {
            return Err(Rejected::new(
                FrameLinkError::Runtime("queue lock poisoned".to_string()),
                buffer,
            ));
        };
        empty.push(buffer)
    }

    /// Takes one buffer from a channel's empty queue.
    ///
    /// # Errors
    ///
    /// `NoBufferAvailable` when the queue is empty. This is backpressure, not a
    /// failure.
    pub fn get_empty(&self, queue: usize, channel: usize) -> Result<Buffer> {
        let empty = self.queues.get(queue).and_then(|q| q.empty.get(channel)).ok_or_else(|| {
            FrameLinkError::Protocol(format!("queue {queue} channel {channel} does not exist"))
        })?;
        lock(empty)
            .and_then(|mut q| q.pop())
            .ok_or(FrameLinkError::Exhausted(Exhausted::NoBufferAvailable))
    }

    /// Queues a filled buffer for consumers.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the full queue is at capacity; the buffer is handed back.
    pub fn put_full(&self, queue: usize, buffer: Buffer) -> std::result::Result<(), Rejected<Buffer>> {
        let Some(out) = self.queues.get(queue) else {
            let error = FrameLinkError::Protocol(format!("output queue {queue} does not exist"));
            return Err(Rejected::new(error, buffer));
        };
        let Some(mut full) = lock(&out.full) else {
            return Err(Rejected::new(
                FrameLinkError::Runtime("queue lock poisoned".to_string()),
                buffer,
            ));
        };
        full.push(buffer)
    }

    /// Takes every ready buffer from a full queue, up to one list. Never blocks.
    pub fn get_full(&self, queue: usize) -> BufferList {
        let mut list = BufferList::new();
        let Some(mut full) = self.queues.get(queue).and_then(|q| lock(&q.full)) else {
            return list;
        };
        while !list.is_full() {
            let Some(buffer) = full.pop() else {
                break;
            };
            if let Err(rejected) = list.push(buffer) {
                // Unreachable while the loop checks `is_full`, kept for ownership.
                let _ = full.push(rejected.into_inner());
                break;
            }
        }
        list
    }

    pub fn empty_len(&self, queue: usize, channel: usize) -> usize {
        self.queues
            .get(queue)
            .and_then(|q| q.empty.get(channel))
            .and_then(lock)
            .map_or(0, |q| q.len())
    }

    pub fn full_len(&self, queue: usize) -> usize {
        self.queues.get(queue).and_then(|q| lock(&q.full)).map_or(0, |q| q.len())
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts { allocated: self.allocated, ..PoolCounts::default() };
        for (index, out) in self.queues.iter().enumerate() {
            counts.full += self.full_len(index);
            counts.empty += out.empty.iter().filter_map(lock).map(|q| q.len()).sum::<usize>();
        }
        counts
    }

    /// Removes every buffer from every queue. Used at DELETE.
    pub fn drain_all(&self) -> Vec<Buffer> {
        let mut drained = Vec::with_capacity(self.allocated);
        for out in &self.queues {
            for empty in &out.empty {
                if let Some(mut q) = lock(empty) {
                    drained.extend(q.drain());
                }
            }
            if let Some(mut q) = lock(&out.full) {
                drained.extend(q.drain());
            }
        }
        drained
    }
}

/// Producer buffers an input queue has taken and not yet returned.
#[derive(Debug, Default)]
pub struct HeldBuffers {
    held: Mutex<HashSet<BufferId>>,
}

impl HeldBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records buffers taken from the producer. Returns how many were already held.
    pub fn checkout<'a>(&self, buffers: impl IntoIterator<Item = &'a Buffer>) -> usize {
        let Some(mut held) = lock(&self.held) else {
            return 0;
        };
        buffers.into_iter().filter(|b| !held.insert(b.id())).count()
    }

    /// Forgets a returned buffer. Returns false if it was not held.
    pub fn release(&self, id: BufferId) -> bool {
        lock(&self.held).is_some_and(|mut held| held.remove(&id))
    }

    pub fn contains(&self, id: BufferId) -> bool {
        lock(&self.held).is_some_and(|held| held.contains(&id))
    }

    pub fn len(&self) -> usize {
        lock(&self.held).map_or(0, |held| held.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(mut held) = lock(&self.held) {
            held.clear();
        }
    }
}

/// Buffers a link was handed but cannot put back into any of its queues.
///
/// A buffer is never destroyed while its pipeline runs, so refused buffers are
/// parked here until DELETE drains them.
#[derive(Debug, Default)]
pub struct StrayBuffers {
    parked: Mutex<Vec<Buffer>>,
}

impl StrayBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, buffer: Buffer) {
        match self.parked.lock() {
            Ok(mut parked) => parked.push(buffer),
            Err(poisoned) => poisoned.into_inner().push(buffer),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.parked).map_or(0, |parked| parked.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parked buffers allocated by `link`.
    pub fn owned_by(&self, link: LinkId) -> usize {
        lock(&self.parked).map_or(0, |parked| parked.iter().filter(|b| b.id().link == link).count())
    }

    pub fn ids(&self) -> Vec<BufferId> {
        lock(&self.parked).map_or_else(Vec::new, |parked| parked.iter().map(Buffer::id).collect())
    }

    /// Empties the list, split into buffers allocated by `link` and all others.
    pub fn drain_split(&self, link: LinkId) -> (Vec<Buffer>, Vec<Buffer>) {
        let drained = match self.parked.lock() {
            Ok(mut parked) => std::mem::take(&mut *parked),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        drained.into_iter().partition(|b| b.id().link == link)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::test_support::buffer;
    use crate::buffer::PayloadInfo;
    use crate::platform::LocalAddr;

    fn pool(channels: usize, depth: usize) -> QueuePool {
        let mut pool = QueuePool::new(LinkId(1), &[QueueLayout::new(channels, depth)]).unwrap();
        pool.allocate(0, |id, _| {
            (
                BufferType::VideoFrame,
                Payload::single(LocalAddr(u64::from(id.index) * 0x1000), 0x1000, PayloadInfo::default()),
            )
        })
        .unwrap();
        pool
    }

    #[test]
    fn test_allocate_fills_every_channel() {
        let pool = pool(3, 4);
        assert_eq!(pool.total_allocated(), 12);
        assert_eq!(pool.empty_len(0, 0), 4);
        assert_eq!(pool.empty_len(0, 2), 4);
        assert_eq!(pool.counts(), PoolCounts { allocated: 12, empty: 12, full: 0, parked: 0 });
    }

    #[test]
    fn test_get_empty_reports_backpressure() {
        let pool = pool(1, 2);
        let a = pool.get_empty(0, 0).unwrap();
        let b = pool.get_empty(0, 0).unwrap();
        let err = pool.get_empty(0, 0).unwrap_err();
        assert_eq!(err, FrameLinkError::Exhausted(Exhausted::NoBufferAvailable));
        assert!(err.is_recoverable());

        pool.put_empty(0, a).unwrap();
        pool.put_empty(0, b).unwrap();
        assert_eq!(pool.counts().outstanding(), 0);
    }

    #[test]
    fn test_full_queue_overflow_drops_excess_in_order() {
        // Empty capacity 4, full capacity 4, six pushes and no consumer.
        let pool = QueuePool::new(LinkId(2), &[QueueLayout::new(1, 4).with_full_capacity(4)])
            .unwrap();

        let mut drops = 0;
        let mut dropped_ids = Vec::new();
        for i in 0..6 {
            if let Err(rejected) = pool.put_full(0, buffer(2, i, 0)) {
                assert_eq!(rejected.error, FrameLinkError::Exhausted(Exhausted::QueueFull));
                dropped_ids.push(rejected.item.id().index);
                drops += 1;
            }
        }

        assert_eq!(drops, 2);
        assert_eq!(dropped_ids, vec![4, 5]);
        let queued: Vec<u32> = pool.get_full(0).ids().iter().map(|id| id.index).collect();
        assert_eq!(queued, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fifo_per_channel_with_interleaving() {
        let pool = QueuePool::new(LinkId(3), &[QueueLayout::new(2, 8)]).unwrap();
        for i in 0..6 {
            pool.put_full(0, buffer(3, i, u16::try_from(i % 2).unwrap())).unwrap();
        }

        let list = pool.get_full(0);
        let ch0: Vec<u32> =
            list.iter().filter(|b| b.channel == 0).map(|b| b.id().index).collect();
        let ch1: Vec<u32> =
            list.iter().filter(|b| b.channel == 1).map(|b| b.id().index).collect();
        assert_eq!(ch0, vec![0, 2, 4]);
        assert_eq!(ch1, vec![1, 3, 5]);
    }

    #[test]
    fn test_put_empty_to_unknown_channel_is_protocol_error() {
        let pool = pool(1, 1);
        let Err(rejected) = pool.put_empty(0, buffer(1, 77, 5)) else {
            panic!("unknown channel must be refused");
        };
        assert!(matches!(rejected.error, FrameLinkError::Protocol(_)));
        assert_eq!(rejected.item.id().index, 77);
    }

    #[test]
    fn test_conservation_across_churn() {
        let pool = pool(2, 3);
        let total = pool.total_allocated();
        let mut checked_out = Vec::new();

        for round in 0..50_usize {
            let channel = round % 2;
            if let Ok(buf) = pool.get_empty(0, channel) {
                if round % 3 == 0 {
                    checked_out.push(buf);
                } else {
                    pool.put_full(0, buf).unwrap();
                }
            }
            if round % 4 == 0 {
                for buf in pool.get_full(0) {
                    pool.put_empty(0, buf).unwrap();
                }
                for buf in checked_out.drain(..) {
                    pool.put_empty(0, buf).unwrap();
                }
            }
            let counts = pool.counts();
            assert_eq!(counts.empty + counts.full + checked_out.len(), total);
        }

        assert_eq!(pool.drain_all().len() + checked_out.len(), total);
    }

    #[test]
    fn test_held_buffers_detect_double_checkout() {
        let held = HeldBuffers::new();
        let mut list = BufferList::new();
        list.push(buffer(9, 0, 0)).unwrap();
        list.push(buffer(9, 1, 0)).unwrap();

        assert_eq!(held.checkout(&list), 0);
        assert_eq!(held.checkout(&list), 2);
        assert!(held.release(BufferId { link: LinkId(9), index: 0 }));
        assert!(!held.release(BufferId { link: LinkId(9), index: 0 }));
        assert_eq!(held.len(), 1);
    }

    #[test]
    fn test_invalid_layouts_rejected() {
        assert!(QueuePool::new(LinkId(1), &[QueueLayout::new(1, 0)]).is_err());
        assert!(
            QueuePool::new(LinkId(1), &[QueueLayout::new(MAX_CHANNELS_PER_QUEUE + 1, 1)]).is_err()
        );
        let too_many = vec![QueueLayout::new(1, 1); MAX_OUT_QUEUES + 1];
        assert!(QueuePool::new(LinkId(1), &too_many).is_err());
    }

    #[test]
    fn test_stray_buffers_keep_every_refused_buffer() {
        let pool = pool(1, 1);
        let strays = StrayBuffers::new();
        if let Err(rejected) = pool.put_empty(0, buffer(1, 77, 5)) {
            strays.park(rejected.into_inner());
        }
        strays.park(buffer(9, 3, 0));

        assert_eq!(strays.len(), 2);
        assert_eq!(strays.owned_by(LinkId(1)), 1);
        let (own, foreign) = strays.drain_split(LinkId(1));
        assert_eq!(own.iter().map(|b| b.id().index).collect::<Vec<_>>(), vec![77]);
        assert_eq!(foreign.iter().map(|b| b.id()).collect::<Vec<_>>(), vec![BufferId { link: LinkId(9), index: 3 }]);
        assert!(strays.is_empty());
    }
}
