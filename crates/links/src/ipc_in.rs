// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! IPC in-adapter
//!
//! The receiving half of an adapter pair. Slot indices popped from the forward
//! ring are unmarshalled into local buffers that remember their `origin_slot`;
//! when a local consumer returns such a buffer the slot index goes back on the
//! reverse ring and the out-adapter is raised.

use framelink_core::ipc::slot::{IPC_TS_NOTIFY, IPC_TS_PUSH};
use framelink_core::ipc::{IpcChannel, IpcChannelId};
use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, Buffer, BufferList, BufferType, CreateParams, Exhausted, FrameLinkError,
    LinkContext, LinkId, LinkInfo, LinkInterface, LinkPlugin, NotifyHub, Payload, PlatformMemory,
    PoolCounts, QueueLayout, QueuePool, Result, StrayBuffers,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IpcInConfig {
    /// Channel shared with the paired `ipc_out`.
    pub channel: IpcChannelId,
    /// Local buffers per channel.
    #[serde(default = "default_depth")]
    #[schemars(range(min = 1))]
    pub depth: usize,
    /// Polls the forward ring on this period in addition to notifications.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

const fn default_depth() -> usize {
    4
}

/// State shared between the in-adapter's task and its consumers.
struct InShared {
    channel: Arc<IpcChannel>,
    pool: QueuePool,
    info: LinkInfo,
    /// Serializes pushes onto the reverse ring; consumers and the task both push.
    reverse_lock: Mutex<()>,
    notify: NotifyHub,
    platform: Arc<dyn PlatformMemory>,
    counters: Arc<LinkCounters>,
    /// Returned buffers the pool refused, held until delete.
    strays: StrayBuffers,
}

impl InShared {
    /// Pushes slot indices back to the out-adapter and raises it once.
    fn return_slots(&self, indices: impl IntoIterator<Item = u32>) {
        let mut returned = 0;
        {
            let _guard = self.reverse_lock.lock().unwrap_or_else(PoisonError::into_inner);
            for index in indices {
                match self.channel.reverse().push(self.platform.as_ref(), index) {
                    Ok(()) => returned += 1,
                    Err(kind) => {
                        LinkCounters::bump(&self.counters.out_buf_errors);
                        tracing::warn!(channel = %self.channel.id(), index, error = %kind, "Slot not returned");
                    },
                }
            }
        }
        if returned > 0 {
            if let Err(e) = self.notify.raise_notify(self.channel.out_link()) {
                tracing::debug!(channel = %self.channel.id(), error = %e, "Out-adapter not notified");
            }
        }
    }

    fn recycle(&self, buffer: Buffer) {
        if let Err(rejected) = self.pool.put_empty(0, buffer) {
            LinkCounters::bump(&self.counters.in_buf_errors);
            tracing::warn!(buffer = %rejected.item.id(), error = %rejected.error, "Returned buffer refused, parked");
            self.strays.park(rejected.into_inner());
        }
    }

    /// Detaches the slot from each buffer, recycles the buffer, returns the slots.
    fn give_back(&self, buffers: impl IntoIterator<Item = Buffer>) {
        let mut slots = Vec::new();
        for mut buffer in buffers {
            if buffer.id().link != self.pool.link() {
                LinkCounters::bump(&self.counters.in_buf_errors);
                tracing::warn!(buffer = %buffer.id(), "Parking buffer owned by another link");
                self.strays.park(buffer);
                continue;
            }
            match buffer.origin_slot.take() {
                Some(index) => slots.push(index),
                None => {
                    LinkCounters::bump(&self.counters.in_buf_errors);
                    tracing::warn!(buffer = %buffer.id(), "Returned buffer carries no slot");
                },
            }
            self.recycle(buffer);
        }
        self.return_slots(slots);
    }

    fn drain_full(&self) -> Vec<Buffer> {
        let mut drained = Vec::new();
        loop {
            let list = self.pool.get_full(0);
            if list.is_empty() {
                return drained;
            }
            drained.extend(list);
        }
    }
}

impl LinkInterface for InShared {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        self.pool.get_full(queue)
    }

    fn put_empty_buffers(&self, _queue: usize, buffers: BufferList) {
        LinkCounters::bump(&self.counters.put_empty_calls);
        self.give_back(buffers);
    }

    fn get_info(&self) -> LinkInfo {
        self.info.clone()
    }
}

#[derive(Default)]
pub struct IpcIn {
    shared: Option<Arc<InShared>>,
    next_links: Vec<LinkId>,
    poll: Option<Duration>,
}

impl IpcIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends back everything not yet handed to a consumer.
    fn flush_pending(shared: &InShared) {
        let platform = shared.platform.as_ref();
        let mut slots: Vec<u32> =
            std::iter::from_fn(|| shared.channel.forward().pop(platform)).collect();
        for mut buffer in shared.drain_full() {
            slots.extend(buffer.origin_slot.take());
            shared.recycle(buffer);
        }
        shared.return_slots(slots);
    }
}

impl LinkPlugin for IpcIn {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: IpcInConfig = config_helpers::parse_config_required(params.config.as_ref())?;
        if !params.in_queues.is_empty() {
            return Err(FrameLinkError::Configuration(
                "ipc_in receives from its IPC channel, not from input queues".to_string(),
            ));
        }
        if config.depth == 0 {
            return Err(FrameLinkError::Configuration("ipc_in depth must be at least 1".to_string()));
        }

        let channel = ctx.ipc().get(config.channel)?;
        if channel.in_link() != ctx.id() {
            return Err(FrameLinkError::Configuration(format!(
                "IPC channel {} belongs to in-link {}, not {}",
                config.channel,
                channel.in_link(),
                ctx.id()
            )));
        }
        let info = channel.peer_info().ok_or_else(|| {
            FrameLinkError::Configuration(format!(
                "IPC channel {} has no peer layout; create ipc_out {} first",
                config.channel,
                channel.out_link()
            ))
        })?;
        let queue = info.queue(0).cloned().unwrap_or_default();

        let mut pool = QueuePool::new(ctx.id(), &[QueueLayout::new(queue.num_channels(), config.depth)])?;
        let types: Vec<BufferType> = queue.channels.iter().map(|c| c.buf_type).collect();
        pool.allocate(0, |_, channel| (types[usize::from(channel)], Payload::default()))?;

        let shared = Arc::new(InShared {
            channel: channel.clone(),
            pool,
            info: LinkInfo::single(queue.clone()),
            reverse_lock: Mutex::new(()),
            notify: ctx.notify_hub().clone(),
            platform: ctx.platform().clone(),
            counters: ctx.counters(),
            strays: StrayBuffers::new(),
        });
        ctx.attach_interface(shared.clone())?;

        // The out-adapter raises us after pushing.
        let platform = ctx.platform().clone();
        let mailbox = ctx.mailbox().clone();
        let counters = ctx.counters();
        ctx.notify_hub().register_notify(
            ctx.id(),
            Arc::new(move || {
                LinkCounters::bump(&counters.notify_events);
                if !channel.forward().is_empty(platform.as_ref()) {
                    mailbox.notify_new_data();
                }
            }),
        );

        ctx.stats_mut().configure(queue.num_channels());
        ctx.stats_mut().enable_ipc_latency();
        self.shared = Some(shared);
        self.next_links = params.next_links();
        self.poll = config.poll_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
        tracing::info!(
            link_id = %ctx.id(),
            channel = %config.channel,
            channels = queue.num_channels(),
            depth = config.depth,
            "IPC in-adapter created"
        );
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let Some(shared) = self.shared.clone() else {
            return Ok(());
        };
        let platform = shared.platform.as_ref();
        let mut queued = 0;
        let mut bounced = Vec::new();
        let mut malformed = 0;

        while let Some(index) = shared.channel.forward().pop(platform) {
            let now = now_us();
            ctx.stats_mut().on_buffers_received();
            let slot = match shared.channel.slots().read(platform, index) {
                Ok(slot) => slot,
                Err(e) => {
                    malformed += 1;
                    LinkCounters::bump(&ctx.counters().in_buf_errors);
                    tracing::warn!(link_id = %ctx.id(), index, error = %e, "Malformed forward ring entry");
                    continue;
                },
            };
            let channel = usize::from(slot.flags.channel);
            let stats = ctx.stats_mut();
            stats.channel(channel).received += 1;
            stats.update_ipc_latency(
                slot.ipc_timestamps[IPC_TS_PUSH],
                slot.ipc_timestamps[IPC_TS_NOTIFY],
                now,
            );

            let mut buffer = match shared.pool.get_empty(0, channel) {
                Ok(buffer) => buffer,
                Err(FrameLinkError::Exhausted(kind)) => {
                    stats.record_drop(channel, kind);
                    bounced.push(index);
                    continue;
                },
                Err(e) => {
                    LinkCounters::bump(&shared.counters.in_buf_errors);
                    tracing::warn!(link_id = %ctx.id(), channel, error = %e, "Slot for an unknown channel");
                    bounced.push(index);
                    continue;
                },
            };

            slot.apply_to(&mut buffer, platform);
            buffer.origin_slot = Some(index);
            stats.update_latency(&buffer, now);
            buffer.link_local_timestamp = now;

            match shared.pool.put_full(0, buffer) {
                Ok(()) => {
                    let stats = stats.channel(channel);
                    stats.processed += 1;
                    stats.forwarded += 1;
                    queued += 1;
                },
                Err(rejected) => {
                    stats.record_drop(channel, Exhausted::QueueFull);
                    let mut buffer = rejected.into_inner();
                    bounced.extend(buffer.origin_slot.take());
                    shared.recycle(buffer);
                },
            }
        }

        if !bounced.is_empty() {
            shared.return_slots(bounced);
        }
        if queued > 0 {
            ctx.notify_links(&self.next_links);
        }
        if malformed > 0 {
            return Err(FrameLinkError::Protocol(format!("{malformed} forward ring entries out of range")));
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
            "ring_depth" => {
                let depth = self.shared.as_ref().map_or(0, |s| s.channel.forward().len());
                Ok(serde_json::json!({ "forward": depth }))
            },
            other => Err(FrameLinkError::Plugin(format!("ipc_in: unknown control '{other}'"))),
        }
    }

    fn stop(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        if let Some(shared) = &self.shared {
            Self::flush_pending(shared);
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.notify_hub().unregister(ctx.id());
        ctx.detach_interface();
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };
        Self::flush_pending(&shared);

        let allocated = shared.pool.total_allocated();
        let (own, foreign) = shared.strays.drain_split(shared.pool.link());
        if !foreign.is_empty() {
            let ids: Vec<String> = foreign.iter().map(|b| b.id().to_string()).collect();
            tracing::warn!(
                link_id = %ctx.id(),
                buffers = ?ids,
                "Foreign buffers were returned here and are released with this link"
            );
        }
        let reclaimed = shared.pool.drain_all().len() + own.len();
        if reclaimed != allocated {
            LinkCounters::bump(&ctx.counters().out_buf_errors);
            tracing::warn!(
                link_id = %ctx.id(),
                allocated,
                reclaimed,
                "Buffers still with consumers at delete; their slots stay with the peer"
            );
        }
        self.next_links.clear();
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        self.poll
    }

    fn census(&self) -> Option<PoolCounts> {
        self.shared
            .as_ref()
            .map(|s| PoolCounts { parked: s.strays.owned_by(s.pool.link()), ..s.pool.counts() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ipc_out::IpcOut;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::ipc::IpcChannelConfig;
    use framelink_core::{InQueueParams, LinkCommand, OutQueueParams};

    fn pair_params() -> (CreateParams, CreateParams) {
        let out = CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![],
            config: Some(serde_json::json!({ "channel": 0 })),
        };
        let input = CreateParams {
            in_queues: vec![],
            out_queues: vec![OutQueueParams { next_links: vec![LinkId(4)] }],
            config: Some(serde_json::json!({ "channel": 0, "depth": 2 })),
        };
        (out, input)
    }

    #[test]
    fn test_round_trip_through_the_rings() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut out_ctx, mut out_rx) = context(&services, 2, "ipc_out");
        let (mut in_ctx, mut in_rx) = context(&services, 3, "ipc_in");
        let (_sink, mut sink_rx) = context(&services, 4, "null_sink");
        services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig { ring_capacity: 8, slots: 8 }, LinkId(2), LinkId(3))
            .unwrap();

        let (out_params, in_params) = pair_params();
        let mut out = IpcOut::new();
        let mut input = IpcIn::new();
        out.create(&mut out_ctx, &out_params).unwrap();
        input.create(&mut in_ctx, &in_params).unwrap();
        assert_eq!(services.registry.get_info(LinkId(3)).unwrap().queues[0].num_channels(), 1);

        let mut first = buffer(1, 0, 0);
        first.src_timestamp = now_us();
        producer.offer(first);
        out.process(&mut out_ctx).unwrap();
        assert!(matches!(in_rx.try_recv(), Some(LinkCommand::NewData)));

        input.process(&mut in_ctx).unwrap();
        assert!(matches!(sink_rx.try_recv(), Some(LinkCommand::NewData)));
        let snapshot = in_ctx.stats().snapshot();
        assert_eq!(snapshot.channels[0].processed, 1);
        assert_eq!(snapshot.ipc_latency.unwrap().count, 1);

        let list = services.registry.get_full_buffers(LinkId(3), 0);
        let Some(local) = list.iter().next() else {
            panic!("nothing queued by the in-adapter");
        };
        assert_eq!(local.id().link, LinkId(3));
        assert_eq!(local.origin_slot, Some(0));
        assert_eq!(local.payload, buffer(1, 0, 0).payload);

        services.registry.put_empty_buffers(LinkId(3), 0, list).unwrap();
        assert!(matches!(out_rx.try_recv(), Some(LinkCommand::Release)));
        out.release(&mut out_ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![0]);
        assert_eq!(input.census().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_no_local_buffer_bounces_slot() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut out_ctx, _out_rx) = context(&services, 2, "ipc_out");
        let (mut in_ctx, _in_rx) = context(&services, 3, "ipc_in");
        let (_sink, _sink_rx) = context(&services, 4, "null_sink");
        services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig { ring_capacity: 8, slots: 8 }, LinkId(2), LinkId(3))
            .unwrap();

        let (out_params, in_params) = pair_params();
        let mut out = IpcOut::new();
        let mut input = IpcIn::new();
        out.create(&mut out_ctx, &out_params).unwrap();
        input.create(&mut in_ctx, &in_params).unwrap();

        for i in 0..3 {
            producer.offer(buffer(1, i, 0));
        }
        out.process(&mut out_ctx).unwrap();
        input.process(&mut in_ctx).unwrap();

        // Depth 2: the third slot goes straight back.
        let snapshot = in_ctx.stats().snapshot();
        assert_eq!(snapshot.channels[0].processed, 2);
        assert_eq!(snapshot.exhausted.no_buffer, 1);
        out.release(&mut out_ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![2]);

        // Stop hands the queued two back through the reverse ring as well.
        input.stop(&mut in_ctx).unwrap();
        out.release(&mut out_ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![2, 0, 1]);
    }

    #[test]
    fn test_foreign_buffer_is_held_until_delete() {
        let (services, _) = services();
        let (mut out_ctx, _out_rx) = context(&services, 2, "ipc_out");
        let (mut in_ctx, _in_rx) = context(&services, 3, "ipc_in");
        services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig { ring_capacity: 8, slots: 8 }, LinkId(2), LinkId(3))
            .unwrap();
        let (out_params, in_params) = pair_params();
        let mut out = IpcOut::new();
        let mut input = IpcIn::new();
        out.create(&mut out_ctx, &out_params).unwrap();
        input.create(&mut in_ctx, &in_params).unwrap();

        let mut list = BufferList::new();
        list.push(buffer(9, 5, 0)).unwrap();
        services.registry.put_empty_buffers(LinkId(3), 0, list).unwrap();

        let shared = input.shared.clone().unwrap();
        assert_eq!(shared.strays.ids(), vec![framelink_core::BufferId { link: LinkId(9), index: 5 }]);
        assert_eq!(in_ctx.counters().in_buf_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
        // Not ours, so the census is unaffected.
        assert_eq!(input.census().unwrap().parked, 0);
        assert_eq!(input.census().unwrap().outstanding(), 0);

        input.delete(&mut in_ctx).unwrap();
        assert!(shared.strays.is_empty());
    }

    #[test]
    fn test_requires_peer_layout() {
        let (services, _) = services();
        let (mut in_ctx, _rx) = context(&services, 3, "ipc_in");
        services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig::default(), LinkId(2), LinkId(3))
            .unwrap();
        let (_, in_params) = pair_params();
        assert!(matches!(
            IpcIn::new().create(&mut in_ctx, &in_params),
            Err(FrameLinkError::Configuration(_))
        ));
    }
}
