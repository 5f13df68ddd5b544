// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Sync link
//!
//! Groups one buffer from each synced channel into a composite buffer once
//! their source timestamps agree. The group's master timestamp is the mean of
//! the waiting heads; a head more than `sync_delta_ms` behind it is dropped,
//! and when a head is ahead of the window the heads inside it are dropped too,
//! so the late channels catch up. The originals go back to the producer when
//! the composite is returned.

use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, graph_helpers, Buffer, BufferId, BufferList, BufferType, ChannelInfo,
    CreateParams, Exhausted, FrameLinkError, InQueueParams, LinkContext, LinkId, LinkInfo,
    LinkInterface, LinkPlugin, LinkRegistry, Payload, PayloadInfo, PoolCounts, QueueInfo,
    QueueLayout, QueuePool, Result, StrayBuffers,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SyncConfig {
    /// Half-width of the window around the master timestamp.
    pub sync_delta_ms: u64,
    /// Waiting buffers older than this are dropped. Unset keeps them until matched.
    pub drop_threshold_ms: Option<u64>,
    /// Channels grouped into each composite; empty selects every input channel.
    pub channels: Vec<u16>,
    /// Composite buffers in the output pool.
    #[schemars(range(min = 1))]
    pub depth: usize,
    /// Buffers held per channel while the others catch up.
    #[schemars(range(min = 1))]
    pub queue_depth: usize,
    /// Re-evaluates the waiting buffers on this period; 0 disables.
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_delta_ms: 16,
            drop_threshold_ms: None,
            channels: Vec::new(),
            depth: 8,
            queue_depth: 16,
            poll_interval_ms: 33,
        }
    }
}

/// Counters reported by the `sync_stats` control.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncStats {
    pub composites: u64,
    /// Heads dropped for falling outside the window.
    pub out_of_sync: u64,
    /// Heads dropped for waiting longer than `drop_threshold_ms`.
    pub stale: u64,
    /// Mean distance of grouped buffers from their master timestamp.
    pub average_sync_delta_us: u64,
}

struct SyncOutput {
    registry: LinkRegistry,
    prev: InQueueParams,
    pool: QueuePool,
    info: LinkInfo,
    /// Composite id to the originals it groups.
    members: Mutex<HashMap<BufferId, Vec<Buffer>>>,
    counters: Arc<LinkCounters>,
    strays: StrayBuffers,
}

impl SyncOutput {
    fn members(&self) -> MutexGuard<'_, HashMap<BufferId, Vec<Buffer>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes composites back into the pool and returns the originals they held.
    fn release(&self, composites: impl IntoIterator<Item = Buffer>) -> Vec<Buffer> {
        let mut originals = Vec::new();
        for mut composite in composites {
            if composite.id().link != self.pool.link() {
                LinkCounters::bump(&self.counters.in_buf_errors);
                tracing::warn!(buffer = %composite.id(), "Parking buffer owned by another link");
                self.strays.park(composite);
                continue;
            }
            match self.members().remove(&composite.id()) {
                Some(frames) => originals.extend(frames),
                None => {
                    LinkCounters::bump(&self.counters.in_buf_errors);
                    tracing::warn!(buffer = %composite.id(), "Composite returned twice or never sent");
                },
            }
            composite.payload = Payload::default();
            if let Err(rejected) = self.pool.put_empty(0, composite) {
                LinkCounters::bump(&self.counters.in_buf_errors);
                tracing::warn!(buffer = %rejected.item.id(), error = %rejected.error, "Composite refused, parked");
                self.strays.park(rejected.into_inner());
            }
        }
        originals
    }

    fn return_originals(&self, originals: Vec<Buffer>) {
        graph_helpers::return_all_to_producer(&self.registry, &self.prev, originals, &self.counters);
    }

    fn drain_full(&self) -> Vec<Buffer> {
        let mut originals = Vec::new();
        loop {
            let list = self.pool.get_full(0);
            if list.is_empty() {
                return originals;
            }
            originals.extend(self.release(list));
        }
    }
}

impl LinkInterface for SyncOutput {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        self.pool.get_full(queue)
    }

    fn put_empty_buffers(&self, _queue: usize, buffers: BufferList) {
        LinkCounters::bump(&self.counters.put_empty_calls);
        let originals = self.release(buffers);
        self.return_originals(originals);
    }

    fn get_info(&self) -> LinkInfo {
        self.info.clone()
    }
}

/// Mean of the timestamps, without overflow.
fn master_timestamp(heads: &[u64]) -> u64 {
    if heads.is_empty() {
        return 0;
    }
    let sum: u128 = heads.iter().map(|&t| u128::from(t)).sum();
    u64::try_from(sum / heads.len() as u128).unwrap_or(u64::MAX)
}

#[derive(Default)]
pub struct FrameSync {
    output: Option<Arc<SyncOutput>>,
    config: SyncConfig,
    /// Input channels that make up a composite, in composite order.
    synced: Vec<usize>,
    /// Indexed by input channel.
    waiting: Vec<VecDeque<Buffer>>,
    stats: SyncStats,
    delta_sum_us: u64,
    delta_count: u64,
    next_links: Vec<LinkId>,
}

impl FrameSync {
    pub fn new() -> Self {
        Self::default()
    }

    fn heads(&self) -> Option<Vec<u64>> {
        self.synced.iter().map(|&ch| self.waiting[ch].front().map(|b| b.src_timestamp)).collect()
    }

    fn drop_stale(&mut self, ctx: &mut LinkContext, now: u64, dropped: &mut Vec<Buffer>) {
        let Some(threshold_ms) = self.config.drop_threshold_ms else {
            return;
        };
        let threshold_us = threshold_ms.saturating_mul(1000);
        for &ch in &self.synced {
            while self.waiting[ch].front().is_some_and(|b| now.saturating_sub(b.src_timestamp) > threshold_us) {
                if let Some(buffer) = self.waiting[ch].pop_front() {
                    ctx.stats_mut().channel(ch).user_dropped += 1;
                    self.stats.stale += 1;
                    dropped.push(buffer);
                }
            }
        }
    }

    fn accept(&mut self, ctx: &mut LinkContext, list: BufferList, now: u64, dropped: &mut Vec<Buffer>) {
        for mut buffer in list {
            let channel = buffer.channel_index();
            let Some(queue) = self.waiting.get_mut(channel) else {
                LinkCounters::bump(&ctx.counters().in_buf_errors);
                tracing::warn!(link_id = %ctx.id(), channel, "Buffer on a channel the producer never declared");
                dropped.push(buffer);
                continue;
            };
            let stats = ctx.stats_mut();
            stats.update_latency(&buffer, now);
            buffer.link_local_timestamp = now;
            stats.channel(channel).received += 1;

            if !self.synced.contains(&channel) {
                stats.channel(channel).user_dropped += 1;
                dropped.push(buffer);
            } else if queue.len() >= self.config.queue_depth {
                stats.record_drop(channel, Exhausted::QueueFull);
                dropped.push(buffer);
            } else {
                queue.push_back(buffer);
            }
        }
    }

    /// Pops one head per synced channel into a composite. Returns whether one was queued.
    fn emit(
        &mut self,
        ctx: &mut LinkContext,
        output: &SyncOutput,
        master: u64,
        now: u64,
        dropped: &mut Vec<Buffer>,
    ) -> bool {
        let frames: Vec<Buffer> = self.synced.iter().filter_map(|&ch| self.waiting[ch].pop_front()).collect();

        let mut composite = match output.pool.get_empty(0, 0) {
            Ok(composite) => composite,
            Err(e) => {
                let kind = match e {
                    FrameLinkError::Exhausted(kind) => kind,
                    _ => Exhausted::NoBufferAvailable,
                };
                for frame in &frames {
                    ctx.stats_mut().record_drop(frame.channel_index(), kind);
                }
                dropped.extend(frames);
                return false;
            },
        };

        for frame in &frames {
            let stats = ctx.stats_mut().channel(frame.channel_index());
            stats.processed += 1;
            stats.forwarded += 1;
            self.delta_sum_us = self.delta_sum_us.saturating_add(frame.src_timestamp.abs_diff(master));
            self.delta_count += 1;
        }
        composite.buf_type = BufferType::CompositeFrame;
        composite.channel = 0;
        composite.src_timestamp = master;
        composite.link_local_timestamp = now;
        composite.payload = Payload {
            planes: frames.iter().flat_map(|f| f.payload.planes.iter().copied()).collect(),
            info: PayloadInfo::Composite { frames: u32::try_from(frames.len()).unwrap_or(u32::MAX) },
        };

        let id = composite.id();
        output.members().insert(id, frames);
        match output.pool.put_full(0, composite) {
            Ok(()) => {
                self.stats.composites += 1;
                true
            },
            Err(rejected) => {
                if let Some(&first) = self.synced.first() {
                    ctx.stats_mut().record_drop(first, Exhausted::QueueFull);
                }
                dropped.extend(output.release([rejected.into_inner()]));
                false
            },
        }
    }

    fn current_stats(&self) -> SyncStats {
        SyncStats { average_sync_delta_us: self.delta_sum_us.checked_div(self.delta_count).unwrap_or(0), ..self.stats }
    }
}

impl LinkPlugin for FrameSync {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: SyncConfig = config_helpers::parse_config_optional(params.config.as_ref())?;
        graph_helpers::expect_inputs(&params.in_queues, 1, "sync")?;
        if config.queue_depth == 0 {
            return Err(FrameLinkError::Configuration("sync queue_depth must be at least 1".to_string()));
        }
        let mut queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;
        let inputs: Vec<ChannelInfo> = queues.remove(0).channels;

        let synced: Vec<usize> = if config.channels.is_empty() {
            (0..inputs.len()).collect()
        } else {
            config.channels.iter().map(|&c| usize::from(c)).collect()
        };
        for (position, &channel) in synced.iter().enumerate() {
            if channel >= inputs.len() {
                return Err(FrameLinkError::Configuration(format!(
                    "sync channel {channel} does not exist, producer has {}",
                    inputs.len()
                )));
            }
            if synced[..position].contains(&channel) {
                return Err(FrameLinkError::Configuration(format!("sync channel {channel} listed twice")));
            }
        }
        let Some(&first) = synced.first() else {
            return Err(FrameLinkError::Configuration("sync needs at least one input channel".to_string()));
        };

        let mut pool = QueuePool::new(ctx.id(), &[QueueLayout::new(1, config.depth)])?;
        pool.allocate(0, |_, _| (BufferType::CompositeFrame, Payload::default()))?;
        let info = LinkInfo::single(QueueInfo {
            channels: vec![ChannelInfo { buf_type: BufferType::CompositeFrame, ..inputs[first] }],
        });

        let output = Arc::new(SyncOutput {
            registry: ctx.registry().clone(),
            prev: params.in_queues[0],
            pool,
            info,
            members: Mutex::new(HashMap::new()),
            counters: ctx.counters(),
            strays: StrayBuffers::new(),
        });
        ctx.attach_interface(output.clone())?;
        ctx.stats_mut().configure(inputs.len());

        tracing::debug!(
            link_id = %ctx.id(),
            channels = synced.len(),
            sync_delta_ms = config.sync_delta_ms,
            "Sync created"
        );
        self.waiting = (0..inputs.len()).map(|_| VecDeque::new()).collect();
        self.synced = synced;
        self.config = config;
        self.stats = SyncStats::default();
        self.output = Some(output);
        self.next_links = params.next_links();
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let Some(output) = self.output.clone() else {
            return Ok(());
        };
        let now = now_us();
        let mut dropped = Vec::new();

        self.drop_stale(ctx, now, &mut dropped);
        let list = ctx.registry().get_full_buffers(output.prev.prev_link, output.prev.prev_queue);
        if !list.is_empty() {
            ctx.stats_mut().on_buffers_received();
            self.accept(ctx, list, now, &mut dropped);
        }

        let delta_us = self.config.sync_delta_ms.saturating_mul(1000);
        let mut produced = 0;
        while let Some(heads) = self.heads() {
            let master = master_timestamp(&heads);
            let lower = master.saturating_sub(delta_us);
            let upper = master.saturating_add(delta_us);
            let early = heads.iter().any(|&t| t > upper);
            let late = heads.iter().any(|&t| t < lower);

            if !early && !late {
                if self.emit(ctx, &output, master, now, &mut dropped) {
                    produced += 1;
                }
                continue;
            }

            // The mean lies inside the window, so every pass drops at least one head.
            for (&ch, &t) in self.synced.iter().zip(&heads) {
                if t < lower || (early && t <= upper) {
                    if let Some(buffer) = self.waiting[ch].pop_front() {
                        ctx.stats_mut().channel(ch).user_dropped += 1;
                        self.stats.out_of_sync += 1;
                        dropped.push(buffer);
                    }
                }
            }
        }

        output.return_originals(dropped);
        if produced > 0 {
            ctx.notify_links(&self.next_links);
        }
        Ok(())
    }

    fn control(
        &mut self,
        _ctx: &mut LinkContext,
        name: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match name {
            "sync_stats" => serde_json::to_value(self.current_stats())
                .map_err(|e| FrameLinkError::Plugin(format!("sync_stats: {e}"))),
            other => Err(FrameLinkError::Plugin(format!("sync: unknown control '{other}'"))),
        }
    }

    fn stop(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        if let Some(output) = &self.output {
            let mut back: Vec<Buffer> = self.waiting.iter_mut().flat_map(|q| q.drain(..)).collect();
            back.extend(output.drain_full());
            output.return_originals(back);
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        let Some(output) = self.output.take() else {
            return Ok(());
        };
        let mut back: Vec<Buffer> = self.waiting.iter_mut().flat_map(|q| q.drain(..)).collect();
        back.extend(output.drain_full());

        let stranded: Vec<Buffer> = output.members().drain().flat_map(|(_, frames)| frames).collect();
        if !stranded.is_empty() {
            LinkCounters::bump(&ctx.counters().out_buf_errors);
            tracing::warn!(
                link_id = %ctx.id(),
                stranded = stranded.len(),
                "Composites still with consumers at delete, returning their originals"
            );
        }
        back.extend(stranded);
        output.return_originals(back);

        let (own, foreign) = output.strays.drain_split(ctx.id());
        if !foreign.is_empty() {
            let ids: Vec<String> = foreign.iter().map(|b| b.id().to_string()).collect();
            tracing::warn!(
                link_id = %ctx.id(),
                buffers = ?ids,
                "Foreign buffers were returned here and are released with this link"
            );
        }
        let reclaimed = output.pool.drain_all().len() + own.len();
        tracing::debug!(link_id = %ctx.id(), reclaimed, stats = ?self.current_stats(), "Sync deleted");
        self.waiting.clear();
        self.next_links.clear();
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        (self.config.poll_interval_ms > 0).then(|| Duration::from_millis(self.config.poll_interval_ms))
    }

    fn census(&self) -> Option<PoolCounts> {
        self.output
            .as_ref()
            .map(|o| PoolCounts { parked: o.strays.owned_by(o.pool.link()), ..o.pool.counts() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::OutQueueParams;

    fn sync_params(config: serde_json::Value) -> CreateParams {
        CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![OutQueueParams { next_links: vec![] }],
            config: Some(config),
        }
    }

    fn stamped(index: u32, channel: u16, src_timestamp: u64) -> Buffer {
        let mut b = buffer(1, index, channel);
        b.src_timestamp = src_timestamp;
        b
    }

    #[test]
    fn test_in_sync_channels_form_one_composite() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(2);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "sync");

        let mut sync = FrameSync::new();
        sync.create(&mut ctx, &sync_params(serde_json::json!({ "sync_delta_ms": 16 }))).unwrap();
        let info = services.registry.get_info(LinkId(2)).unwrap();
        assert_eq!(info.queues[0].channels[0].buf_type, BufferType::CompositeFrame);

        producer.offer(stamped(0, 0, 1_000_000));
        producer.offer(stamped(1, 1, 1_005_000));
        sync.process(&mut ctx).unwrap();
        assert!(producer.returned_ids().is_empty());

        let list = services.registry.get_full_buffers(LinkId(2), 0);
        let Some(composite) = list.iter().next() else {
            panic!("no composite queued");
        };
        assert_eq!(composite.buf_type, BufferType::CompositeFrame);
        assert_eq!(composite.payload.info, PayloadInfo::Composite { frames: 2 });
        assert_eq!(composite.payload.planes.len(), 2);
        assert_eq!(composite.src_timestamp, 1_002_500);

        services.registry.put_empty_buffers(LinkId(2), 0, list).unwrap();
        assert_eq!(producer.returned_ids(), vec![0, 1]);
        assert_eq!(sync.census().unwrap().outstanding(), 0);
        assert_eq!(sync.current_stats().average_sync_delta_us, 2_500);
    }

    #[test]
    fn test_late_head_dropped_until_channels_agree() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(2);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "sync");

        let mut sync = FrameSync::new();
        sync.create(&mut ctx, &sync_params(serde_json::json!({ "sync_delta_ms": 16 }))).unwrap();

        producer.offer(stamped(0, 0, 1_000_000));
        producer.offer(stamped(1, 1, 1_100_000));
        sync.process(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![0]);
        assert!(services.registry.get_full_buffers(LinkId(2), 0).is_empty());

        producer.offer(stamped(2, 0, 1_101_000));
        sync.process(&mut ctx).unwrap();
        let list = services.registry.get_full_buffers(LinkId(2), 0);
        assert_eq!(list.len(), 1);

        let stats = sync.control(&mut ctx, "sync_stats", &serde_json::Value::Null).unwrap();
        assert_eq!(stats["out_of_sync"], 1);
        assert_eq!(stats["composites"], 1);
        assert_eq!(ctx.stats().snapshot().channels[0].user_dropped, 1);
    }

    #[test]
    fn test_unsynced_channel_and_stale_buffers_go_back() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(3);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "sync");

        let mut sync = FrameSync::new();
        let config = serde_json::json!({ "channels": [0, 1], "drop_threshold_ms": 10 });
        sync.create(&mut ctx, &sync_params(config)).unwrap();

        let old = now_us().saturating_sub(1_000_000);
        producer.offer(stamped(0, 0, old));
        producer.offer(stamped(1, 2, old));
        sync.process(&mut ctx).unwrap();
        // Channel 2 is not synced; channel 0 waits for channel 1.
        assert_eq!(producer.returned_ids(), vec![1]);

        sync.process(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![1, 0]);
        assert_eq!(sync.current_stats().stale, 1);
    }

    #[test]
    fn test_no_composite_left_drops_the_group() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "sync");

        let mut sync = FrameSync::new();
        sync.create(&mut ctx, &sync_params(serde_json::json!({ "depth": 1 }))).unwrap();
        producer.offer(stamped(0, 0, 1_000));
        producer.offer(stamped(1, 0, 2_000));
        sync.process(&mut ctx).unwrap();

        assert_eq!(producer.returned_ids(), vec![1]);
        assert_eq!(ctx.stats().snapshot().exhausted.no_buffer, 1);
    }

    #[test]
    fn test_stop_and_delete_return_everything() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(2);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "sync");

        let mut sync = FrameSync::new();
        sync.create(&mut ctx, &sync_params(serde_json::json!({}))).unwrap();
        producer.offer(stamped(0, 0, 1_000));
        producer.offer(stamped(1, 1, 1_000));
        producer.offer(stamped(2, 0, 9_000_000));
        sync.process(&mut ctx).unwrap();

        // A consumer holds the composite; index 2 still waits for channel 1.
        let _held = services.registry.get_full_buffers(LinkId(2), 0);
        sync.stop(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![2]);

        sync.delete(&mut ctx).unwrap();
        let mut back = producer.returned_ids();
        back.sort_unstable();
        assert_eq!(back, vec![0, 1, 2]);
    }

    #[test]
    fn test_rejects_unknown_channel() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "sync");
        assert!(matches!(
            FrameSync::new().create(&mut ctx, &sync_params(serde_json::json!({ "channels": [4] }))),
            Err(FrameLinkError::Configuration(_))
        ));
    }
}
