// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! IPC out-adapter
//!
//! Consumes a local producer's buffers and publishes them to the paired
//! in-adapter through an [`IpcChannel`]: metadata is marshalled into a slot and
//! the slot index is pushed on the forward ring. The original buffer stays here,
//! parked under its slot, until the index comes back on the reverse ring.

use framelink_core::ipc::slot::IPC_TS_NOTIFY;
use framelink_core::ipc::{IpcChannel, IpcChannelId, IpcSlot};
use framelink_core::skip::FrameSkip;
use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, graph_helpers, Buffer, CreateParams, Exhausted, FrameLinkError, InQueueParams,
    LinkContext, LinkInfo, LinkPlugin, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IpcOutConfig {
    /// Channel shared with the paired `ipc_in`.
    pub channel: IpcChannelId,
    /// Frame-rate reduction applied to every channel; equal rates forward all.
    #[serde(default = "default_fps")]
    pub input_fps: u32,
    #[serde(default = "default_fps")]
    pub output_fps: u32,
}

const fn default_fps() -> u32 {
    30
}

#[derive(Debug, Deserialize)]
struct SetFrameRate {
    channel: usize,
    input_fps: u32,
    output_fps: u32,
}

struct Attached {
    channel: Arc<IpcChannel>,
    prev: InQueueParams,
    free_slots: Vec<u32>,
    /// Originals parked per slot while the peer holds the slot.
    in_flight: Vec<Option<Buffer>>,
    skips: Vec<FrameSkip>,
}

#[derive(Default)]
pub struct IpcOut {
    attached: Option<Attached>,
}

impl IpcOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the reverse ring and hands the parked originals back to the producer.
    ///
    /// Returns how many malformed indices were seen.
    fn reclaim(&mut self, ctx: &LinkContext) -> usize {
        let Some(attached) = self.attached.as_mut() else {
            return 0;
        };
        let platform = ctx.platform().as_ref();
        let mut returned = Vec::new();
        let mut malformed = 0;

        while let Some(index) = attached.channel.reverse().pop(platform) {
            match attached.in_flight.get_mut(index as usize).and_then(Option::take) {
                Some(buffer) => {
                    attached.free_slots.push(index);
                    returned.push(buffer);
                },
                None => {
                    malformed += 1;
                    LinkCounters::bump(&ctx.counters().in_buf_errors);
                    tracing::warn!(link_id = %ctx.id(), index, "Reverse ring returned a slot not in flight");
                },
            }
        }

        graph_helpers::return_all_to_producer(ctx.registry(), &attached.prev, returned, &ctx.counters());
        malformed
    }

    fn in_flight(&self) -> usize {
        self.attached.as_ref().map_or(0, |a| a.in_flight.iter().filter(|b| b.is_some()).count())
    }
}

impl LinkPlugin for IpcOut {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: IpcOutConfig = config_helpers::parse_config_required(params.config.as_ref())?;
        graph_helpers::expect_inputs(&params.in_queues, 1, "ipc_out")?;
        let mut queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;
        let queue = queues.remove(0);

        let channel = ctx.ipc().get(config.channel)?;
        if channel.out_link() != ctx.id() {
            return Err(FrameLinkError::Configuration(format!(
                "IPC channel {} belongs to out-link {}, not {}",
                config.channel,
                channel.out_link(),
                ctx.id()
            )));
        }
        let slots = channel.slots().len();

        let num_channels = queue.num_channels();
        channel.publish_peer_info(LinkInfo::single(queue));

        // The in-adapter raises us after pushing returns.
        let notify_channel = channel.clone();
        let platform = ctx.platform().clone();
        let mailbox = ctx.mailbox().clone();
        let counters = ctx.counters();
        ctx.notify_hub().register_notify(
            ctx.id(),
            Arc::new(move || {
                LinkCounters::bump(&counters.notify_events);
                if !notify_channel.reverse().is_empty(platform.as_ref()) {
                    mailbox.notify_release();
                }
            }),
        );

        ctx.stats_mut().configure(num_channels);
        #[allow(clippy::cast_possible_truncation)]
        let free_slots = (0..slots as u32).rev().collect();
        self.attached = Some(Attached {
            channel,
            prev: params.in_queues[0],
            free_slots,
            in_flight: (0..slots).map(|_| None).collect(),
            skips: vec![FrameSkip::new(config.input_fps, config.output_fps); num_channels],
        });
        tracing::info!(
            link_id = %ctx.id(),
            channel = %config.channel,
            slots,
            channels = num_channels,
            "IPC out-adapter created"
        );
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        self.reclaim(ctx);
        let Some(attached) = self.attached.as_mut() else {
            return Ok(());
        };
        let list = ctx.registry().get_full_buffers(attached.prev.prev_link, attached.prev.prev_queue);
        if list.is_empty() {
            return Ok(());
        }
        ctx.stats_mut().on_buffers_received();

        let platform = ctx.platform().clone();
        let platform = platform.as_ref();
        let now = now_us();
        let mut returned = Vec::new();
        let mut pushed = 0usize;

        for mut buffer in list {
            let channel = buffer.channel_index();
            let Some(skip) = attached.skips.get_mut(channel) else {
                LinkCounters::bump(&ctx.counters().in_buf_errors);
                tracing::warn!(link_id = %ctx.id(), channel, "Buffer on a channel the producer never declared");
                returned.push(buffer);
                continue;
            };

            let stats = ctx.stats_mut();
            stats.update_latency(&buffer, now);
            buffer.link_local_timestamp = now;
            stats.channel(channel).received += 1;

            if skip.should_skip() {
                stats.channel(channel).user_dropped += 1;
                returned.push(buffer);
                continue;
            }

            let Some(index) = attached.free_slots.pop() else {
                stats.record_drop(channel, Exhausted::NoFreeSlot);
                returned.push(buffer);
                continue;
            };

            // Stamped in full before the index is published.
            let mut slot = IpcSlot::from_buffer(&buffer, platform, now);
            slot.ipc_timestamps[IPC_TS_NOTIFY] = now_us();
            if let Err(e) = attached.channel.slots().write(platform, index, slot) {
                attached.free_slots.push(index);
                tracing::warn!(link_id = %ctx.id(), index, error = %e, "Slot write failed");
                returned.push(buffer);
                continue;
            }

            match attached.channel.forward().push(platform, index) {
                Ok(()) => {
                    attached.in_flight[index as usize] = Some(buffer);
                    let stats = stats.channel(channel);
                    stats.processed += 1;
                    stats.forwarded += 1;
                    pushed += 1;
                },
                Err(kind) => {
                    attached.free_slots.push(index);
                    stats.record_drop(channel, kind);
                    returned.push(buffer);
                },
            }
        }

        graph_helpers::return_all_to_producer(ctx.registry(), &attached.prev, returned, &ctx.counters());

        if pushed > 0 {
            if let Err(e) = ctx.notify_hub().raise_notify(attached.channel.in_link()) {
                tracing::debug!(link_id = %ctx.id(), error = %e, "Peer not notified");
            }
        }
        Ok(())
    }

    fn release(&mut self, ctx: &mut LinkContext) -> Result<()> {
        match self.reclaim(ctx) {
            0 => Ok(()),
            malformed => Err(FrameLinkError::Protocol(format!(
                "{malformed} reverse ring entries did not name an in-flight slot"
            ))),
        }
    }

    fn control(
        &mut self,
        _ctx: &mut LinkContext,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match name {
            "set_frame_rate" => {
                let SetFrameRate { channel, input_fps, output_fps } =
                    serde_json::from_value(payload.clone())
                        .map_err(|e| FrameLinkError::Plugin(format!("set_frame_rate: {e}")))?;
                let skip = self
                    .attached
                    .as_mut()
                    .and_then(|a| a.skips.get_mut(channel))
                    .ok_or_else(|| FrameLinkError::Plugin(format!("no channel {channel}")))?;
                skip.reset(input_fps, output_fps);
                Ok(serde_json::json!({ "channel": channel, "input_fps": input_fps, "output_fps": output_fps }))
            },
            "in_flight" => Ok(serde_json::json!({ "in_flight": self.in_flight() })),
            other => Err(FrameLinkError::Plugin(format!("ipc_out: unknown control '{other}'"))),
        }
    }

    fn stop(&mut self, ctx: &mut LinkContext) -> Result<()> {
        self.reclaim(ctx);
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.notify_hub().unregister(ctx.id());
        self.reclaim(ctx);
        let Some(mut attached) = self.attached.take() else {
            return Ok(());
        };

        let stranded: Vec<Buffer> = attached.in_flight.iter_mut().filter_map(Option::take).collect();
        if !stranded.is_empty() {
            tracing::warn!(
                link_id = %ctx.id(),
                stranded = stranded.len(),
                "Slots still held by the peer at delete, returning originals"
            );
        }
        graph_helpers::return_all_to_producer(ctx.registry(), &attached.prev, stranded, &ctx.counters());

        attached.channel.forward().reset();
        attached.channel.reverse().reset();
        attached.channel.clear_peer_info();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::ipc::slot::IPC_TS_PUSH;
    use framelink_core::ipc::IpcChannelConfig;
    use framelink_core::{LinkCommand, LinkId};

    fn out_params(channel: u32) -> CreateParams {
        CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![],
            config: Some(serde_json::json!({ "channel": channel })),
        }
    }

    #[test]
    fn test_push_park_and_reclaim() {
        let (services, platform) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, mut rx) = context(&services, 2, "ipc_out");
        let ch = services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig { ring_capacity: 4, slots: 2 }, LinkId(2), LinkId(3))
            .unwrap();

        let mut out = IpcOut::new();
        out.create(&mut ctx, &out_params(0)).unwrap();
        assert_eq!(ch.peer_info().unwrap().queues[0].num_channels(), 1);

        for i in 0..3 {
            producer.offer(buffer(1, i, 0));
        }
        out.process(&mut ctx).unwrap();

        // Two slots: the third buffer finds none and goes straight back.
        assert_eq!(producer.returned_ids(), vec![2]);
        assert_eq!(ctx.stats().snapshot().exhausted.no_free_slot, 1);
        assert_eq!(ch.forward().len(), 2);
        assert!(platform.flushes() > 0);

        // Peer consumes both and returns the first.
        let first = ch.forward().pop(platform.as_ref()).unwrap();
        let _second = ch.forward().pop(platform.as_ref()).unwrap();
        let slot = ch.slots().read(platform.as_ref(), first).unwrap();
        assert_ne!(slot.ipc_timestamps[IPC_TS_NOTIFY], 0);
        assert!(slot.ipc_timestamps[IPC_TS_NOTIFY] >= slot.ipc_timestamps[IPC_TS_PUSH]);
        ch.reverse().push(platform.as_ref(), first).unwrap();
        services.notify.raise_notify(LinkId(2)).unwrap();
        assert!(matches!(rx.try_recv(), Some(LinkCommand::Release)));

        out.release(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![2, 0]);
        assert_eq!(out.in_flight(), 1);

        out.delete(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![2, 0, 1]);
        assert!(ch.peer_info().is_none());
    }

    #[test]
    fn test_malformed_reverse_entry_is_protocol_error() {
        let (services, platform) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "ipc_out");
        let ch = services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig::default(), LinkId(2), LinkId(3))
            .unwrap();

        let mut out = IpcOut::new();
        out.create(&mut ctx, &out_params(0)).unwrap();
        ch.reverse().push(platform.as_ref(), 5).unwrap();
        assert!(matches!(out.release(&mut ctx), Err(FrameLinkError::Protocol(_))));
        assert_eq!(ctx.stats().snapshot().in_buf_errors, 1);
    }

    #[test]
    fn test_frame_rate_skip_returns_buffers() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "ipc_out");
        services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig::default(), LinkId(2), LinkId(3))
            .unwrap();

        let mut out = IpcOut::new();
        out.create(&mut ctx, &out_params(0)).unwrap();
        out.control(
            &mut ctx,
            "set_frame_rate",
            &serde_json::json!({ "channel": 0, "input_fps": 30, "output_fps": 15 }),
        )
        .unwrap();

        for i in 0..4 {
            producer.offer(buffer(1, i, 0));
        }
        out.process(&mut ctx).unwrap();
        let snapshot = ctx.stats().snapshot();
        assert_eq!(snapshot.channels[0].user_dropped, 2);
        assert_eq!(snapshot.channels[0].processed, 2);
        assert_eq!(producer.returned_ids().len(), 2);
    }

    #[test]
    fn test_wrong_channel_owner_is_configuration_error() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "ipc_out");
        services
            .ipc
            .create(Some(IpcChannelId(0)), &IpcChannelConfig::default(), LinkId(7), LinkId(3))
            .unwrap();
        assert!(matches!(
            IpcOut::new().create(&mut ctx, &out_params(0)),
            Err(FrameLinkError::Configuration(_))
        ));
    }
}
