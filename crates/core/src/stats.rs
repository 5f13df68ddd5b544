// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Link statistics and latency collection.
//!
//! Counters reset exactly once, on the first buffer received after a CREATE, so
//! start-up transients do not skew long-run averages. Counters touched from other
//! links' tasks (buffer-exchange calls) live in [`LinkCounters`] as atomics; the rest
//! belong to the owning task's [`LinkStatsCollector`].

use crate::buffer::Buffer;
use crate::link::LinkId;
use crate::queue::PoolCounts;
use crate::time::now_us;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use ts_rs::TS;

/// Notification latencies at or above this are treated as outliers and not recorded.
pub const NOTIFY_LATENCY_CUTOFF_US: u64 = 1_000;

/// Running latency tracker in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LatencyStats {
    pub count: u64,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self { count: 0, sum_us: 0, min_us: u64::MAX, max_us: 0 }
    }
}

impl LatencyStats {
    /// Records the age of `stamp_us` at `now_us`.
    pub fn update(&mut self, stamp_us: u64, now_us: u64) {
        self.record(now_us.saturating_sub(stamp_us));
    }

    pub fn record(&mut self, latency_us: u64) {
        self.count += 1;
        self.sum_us = self.sum_us.saturating_add(latency_us);
        self.min_us = self.min_us.min(latency_us);
        self.max_us = self.max_us.max(latency_us);
    }

    pub const fn average_us(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_us / self.count
        }
    }

    /// Minimum, or 0 if nothing was recorded.
    pub const fn min_or_zero(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.min_us
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Per-channel buffer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChannelStats {
    pub received: u64,
    pub processed: u64,
    /// Dropped because a resource was exhausted.
    pub dropped: u64,
    /// Dropped on purpose (frame-rate control).
    pub user_dropped: u64,
    /// Handed to a downstream queue.
    pub forwarded: u64,
}

/// Counts per kind of resource exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ExhaustionStats {
    pub no_buffer: u64,
    pub queue_full: u64,
    pub no_free_slot: u64,
    pub ring_full: u64,
}

impl ExhaustionStats {
    pub const fn record(&mut self, kind: crate::error::Exhausted) {
        use crate::error::Exhausted;
        match kind {
            Exhausted::NoBufferAvailable => self.no_buffer += 1,
            Exhausted::QueueFull => self.queue_full += 1,
            Exhausted::NoFreeSlot => self.no_free_slot += 1,
            Exhausted::RingFull => self.ring_full += 1,
        }
    }
}

/// Counters updated from buffer-exchange and notification paths.
#[derive(Debug, Default)]
pub struct LinkCounters {
    pub get_full_calls: AtomicU64,
    pub put_empty_calls: AtomicU64,
    pub in_buf_errors: AtomicU64,
    pub out_buf_errors: AtomicU64,
    pub notify_events: AtomicU64,
}

impl LinkCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.get_full_calls,
            &self.put_empty_calls,
            &self.in_buf_errors,
            &self.out_buf_errors,
            &self.notify_events,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// A typed statistics snapshot for one link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LinkStatsSnapshot {
    pub link_id: LinkId,
    pub kind: String,
    pub elapsed_ms: u64,
    pub channels: Vec<ChannelStats>,
    /// Processed buffers per second, per channel.
    pub fps: Vec<f64>,
    pub exhausted: ExhaustionStats,
    pub new_data_cmds: u64,
    pub release_cmds: u64,
    pub stray_cmds: u64,
    pub get_full_calls: u64,
    pub put_empty_calls: u64,
    pub in_buf_errors: u64,
    pub out_buf_errors: u64,
    pub notify_events: u64,
    pub link_latency: LatencyStats,
    pub src_to_link_latency: LatencyStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_latency: Option<LatencyStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_latency: Option<LatencyStats>,
    /// Buffer census of the link's own pool, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffers: Option<PoolSnapshot>,
}

/// Serializable copy of [`PoolCounts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PoolSnapshot {
    pub allocated: u64,
    pub empty: u64,
    pub full: u64,
    #[serde(default)]
    pub parked: u64,
}

impl From<PoolCounts> for PoolSnapshot {
    fn from(counts: PoolCounts) -> Self {
        Self {
            allocated: counts.allocated as u64,
            empty: counts.empty as u64,
            full: counts.full as u64,
            parked: counts.parked as u64,
        }
    }
}

impl PoolSnapshot {
    pub const fn outstanding(&self) -> u64 {
        self.allocated.saturating_sub(self.empty + self.full + self.parked)
    }
}

/// Statistics owned by a link task.
#[derive(Debug)]
pub struct LinkStatsCollector {
    link: LinkId,
    kind: String,
    channels: Vec<ChannelStats>,
    exhausted: ExhaustionStats,
    new_data_cmds: u64,
    release_cmds: u64,
    stray_cmds: u64,
    link_latency: LatencyStats,
    src_to_link_latency: LatencyStats,
    ipc_latency: Option<LatencyStats>,
    notify_latency: Option<LatencyStats>,
    first_buffer_seen: bool,
    start_us: u64,
    counters: Arc<LinkCounters>,
}

impl LinkStatsCollector {
    pub fn new(link: LinkId, kind: impl Into<String>, counters: Arc<LinkCounters>) -> Self {
        Self {
            link,
            kind: kind.into(),
            channels: Vec::new(),
            exhausted: ExhaustionStats::default(),
            new_data_cmds: 0,
            release_cmds: 0,
            stray_cmds: 0,
            link_latency: LatencyStats::default(),
            src_to_link_latency: LatencyStats::default(),
            ipc_latency: None,
            notify_latency: None,
            first_buffer_seen: false,
            start_us: now_us(),
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<LinkCounters> {
        &self.counters
    }

    /// Sizes per-channel counters. Called from CREATE.
    pub fn configure(&mut self, num_channels: usize) {
        self.channels = vec![ChannelStats::default(); num_channels];
    }

    /// Enables IPC and notification latency tracking.
    pub fn enable_ipc_latency(&mut self) {
        self.ipc_latency = Some(LatencyStats::default());
        self.notify_latency = Some(LatencyStats::default());
    }

    /// Arms the one-shot reset for the next received buffer.
    pub const fn restart(&mut self) {
        self.first_buffer_seen = false;
    }

    pub fn reset(&mut self) {
        self.channels.iter_mut().for_each(|c| *c = ChannelStats::default());
        self.exhausted = ExhaustionStats::default();
        self.new_data_cmds = 0;
        self.release_cmds = 0;
        self.stray_cmds = 0;
        self.counters.reset();
        self.reset_latency();
        self.start_us = now_us();
    }

    pub fn reset_latency(&mut self) {
        self.link_latency.reset();
        self.src_to_link_latency.reset();
        if let Some(ipc) = self.ipc_latency.as_mut() {
            ipc.reset();
        }
        if let Some(notify) = self.notify_latency.as_mut() {
            notify.reset();
        }
    }

    /// Call when buffers arrive; resets everything on the first arrival after CREATE.
    pub fn on_buffers_received(&mut self) {
        if !self.first_buffer_seen {
            self.reset();
            self.first_buffer_seen = true;
        }
    }

    pub const fn first_buffer_seen(&self) -> bool {
        self.first_buffer_seen
    }

    /// Per-channel counters; grows the table when an unexpected channel shows up.
    pub fn channel(&mut self, channel: usize) -> &mut ChannelStats {
        if channel >= self.channels.len() {
            self.channels.resize(channel + 1, ChannelStats::default());
        }
        &mut self.channels[channel]
    }

    pub fn channel_stats(&self, channel: usize) -> Option<&ChannelStats> {
        self.channels.get(channel)
    }

    /// Counts a drop caused by resource exhaustion.
    pub fn record_drop(&mut self, channel: usize, kind: crate::error::Exhausted) {
        self.channel(channel).dropped += 1;
        self.exhausted.record(kind);
    }

    pub const fn record_new_data(&mut self) {
        self.new_data_cmds += 1;
    }

    pub const fn record_release(&mut self) {
        self.release_cmds += 1;
    }

    pub const fn record_stray(&mut self) {
        self.stray_cmds += 1;
    }

    /// Updates link and source-to-link latency from a buffer's stamps.
    pub fn update_latency(&mut self, buffer: &Buffer, now_us: u64) {
        self.link_latency.update(buffer.link_local_timestamp, now_us);
        if buffer.src_timestamp != 0 {
            self.src_to_link_latency.update(buffer.src_timestamp, now_us);
        }
    }

    /// Records slot-passing latency (push to pop) and, under the cutoff,
    /// notification latency (raise to pop).
    pub fn update_ipc_latency(&mut self, pushed_us: u64, notified_us: u64, now_us: u64) {
        if let Some(ipc) = self.ipc_latency.as_mut() {
            ipc.update(pushed_us, now_us);
        }
        let notify_latency = now_us.saturating_sub(notified_us);
        if notify_latency < NOTIFY_LATENCY_CUTOFF_US {
            if let Some(notify) = self.notify_latency.as_mut() {
                notify.record(notify_latency);
            }
        }
    }

    /// Renders a snapshot without mutating anything.
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        let elapsed_us = now_us().saturating_sub(self.start_us);
        #[allow(clippy::cast_precision_loss)]
        let fps = self
            .channels
            .iter()
            .map(|c| {
                if elapsed_us == 0 {
                    0.0
                } else {
                    c.processed as f64 * 1_000_000.0 / elapsed_us as f64
                }
            })
            .collect();

        LinkStatsSnapshot {
            link_id: self.link,
            kind: self.kind.clone(),
            elapsed_ms: elapsed_us / 1_000,
            channels: self.channels.clone(),
            fps,
            exhausted: self.exhausted,
            new_data_cmds: self.new_data_cmds,
            release_cmds: self.release_cmds,
            stray_cmds: self.stray_cmds,
            get_full_calls: LinkCounters::load(&self.counters.get_full_calls),
            put_empty_calls: LinkCounters::load(&self.counters.put_empty_calls),
            in_buf_errors: LinkCounters::load(&self.counters.in_buf_errors),
            out_buf_errors: LinkCounters::load(&self.counters.out_buf_errors),
            notify_events: LinkCounters::load(&self.counters.notify_events),
            link_latency: self.link_latency,
            src_to_link_latency: self.src_to_link_latency,
            ipc_latency: self.ipc_latency,
            notify_latency: self.notify_latency,
            buffers: None,
        }
    }

    /// Logs a snapshot, optionally resetting latency trackers afterwards.
    pub fn print(&mut self, reset_latency: bool) -> LinkStatsSnapshot {
        let snapshot = self.snapshot();
        log_snapshot(&snapshot);
        if reset_latency {
            self.reset_latency();
        }
        snapshot
    }
}

fn log_snapshot(snapshot: &LinkStatsSnapshot) {
    tracing::info!(
        link_id = %snapshot.link_id,
        kind = %snapshot.kind,
        elapsed_ms = snapshot.elapsed_ms,
        new_data_cmds = snapshot.new_data_cmds,
        release_cmds = snapshot.release_cmds,
        stray_cmds = snapshot.stray_cmds,
        notify_events = snapshot.notify_events,
        get_full_calls = snapshot.get_full_calls,
        put_empty_calls = snapshot.put_empty_calls,
        in_buf_errors = snapshot.in_buf_errors,
        out_buf_errors = snapshot.out_buf_errors,
        link_latency_avg_us = snapshot.link_latency.average_us(),
        link_latency_max_us = snapshot.link_latency.max_us,
        src_latency_avg_us = snapshot.src_to_link_latency.average_us(),
        src_latency_min_us = snapshot.src_to_link_latency.min_or_zero(),
        src_latency_max_us = snapshot.src_to_link_latency.max_us,
        "Link statistics"
    );
    for (channel, (stats, fps)) in snapshot.channels.iter().zip(&snapshot.fps).enumerate() {
        tracing::info!(
            link_id = %snapshot.link_id,
            channel,
            received = stats.received,
            processed = stats.processed,
            dropped = stats.dropped,
            user_dropped = stats.user_dropped,
            forwarded = stats.forwarded,
            fps = format!("{fps:.1}"),
            "Channel statistics"
        );
    }
    if let (Some(ipc), Some(notify)) = (snapshot.ipc_latency, snapshot.notify_latency) {
        tracing::info!(
            link_id = %snapshot.link_id,
            ipc_count = ipc.count,
            ipc_avg_us = ipc.average_us(),
            ipc_min_us = ipc.min_or_zero(),
            ipc_max_us = ipc.max_us,
            notify_count = notify.count,
            notify_avg_us = notify.average_us(),
            notify_min_us = notify.min_or_zero(),
            notify_max_us = notify.max_us,
            "IPC latency"
        );
    }
}
