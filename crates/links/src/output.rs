// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Buffer-exchange interface for links that own their output pool.

use framelink_core::stats::LinkCounters;
use framelink_core::{Buffer, BufferList, LinkInfo, LinkInterface, PoolCounts, QueuePool, StrayBuffers};
use std::sync::Arc;

/// A [`QueuePool`] exposed to consumers.
///
/// Consumers pull from the full queues and return into the empty queues. A buffer
/// that does not belong to this pool, or does not fit back, is counted as an
/// input-buffer error and parked until DELETE.
#[derive(Debug)]
pub struct PooledOutput {
    pool: QueuePool,
    strays: StrayBuffers,
    info: LinkInfo,
    counters: Arc<LinkCounters>,
}

impl PooledOutput {
    pub fn new(pool: QueuePool, info: LinkInfo, counters: Arc<LinkCounters>) -> Self {
        Self { pool, strays: StrayBuffers::new(), info, counters }
    }

    pub const fn pool(&self) -> &QueuePool {
        &self.pool
    }

    pub const fn strays(&self) -> &StrayBuffers {
        &self.strays
    }

    pub fn counts(&self) -> PoolCounts {
        PoolCounts { parked: self.strays.owned_by(self.pool.link()), ..self.pool.counts() }
    }

    /// Returns one buffer to its empty queue, parking it on refusal.
    pub fn recycle(&self, queue: usize, buffer: Buffer) {
        if buffer.id().link != self.pool.link() {
            LinkCounters::bump(&self.counters.in_buf_errors);
            tracing::warn!(
                link_id = %self.pool.link(),
                buffer = %buffer.id(),
                "Parking buffer owned by another link"
            );
            self.strays.park(buffer);
            return;
        }
        if let Err(rejected) = self.pool.put_empty(queue, buffer) {
            LinkCounters::bump(&self.counters.in_buf_errors);
            tracing::warn!(
                link_id = %self.pool.link(),
                buffer = %rejected.item.id(),
                error = %rejected.error,
                "Returned buffer refused, parked"
            );
            self.strays.park(rejected.into_inner());
        }
    }

    /// Empties the pool and the parked list at DELETE.
    ///
    /// Returns how many of this pool's own buffers came back. Parked buffers of
    /// other links are reported by id.
    pub fn reclaim(&self) -> usize {
        let (own, foreign) = self.strays.drain_split(self.pool.link());
        if !foreign.is_empty() {
            let ids: Vec<String> = foreign.iter().map(|b| b.id().to_string()).collect();
            tracing::warn!(
                link_id = %self.pool.link(),
                buffers = ?ids,
                "Foreign buffers were returned here and are released with this link"
            );
        }
        self.pool.drain_all().len() + own.len()
    }
}

impl LinkInterface for PooledOutput {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        self.pool.get_full(queue)
    }

    fn put_empty_buffers(&self, queue: usize, buffers: BufferList) {
        LinkCounters::bump(&self.counters.put_empty_calls);
        for buffer in buffers {
            self.recycle(queue, buffer);
        }
    }

    fn get_info(&self) -> LinkInfo {
        self.info.clone()
    }
}
