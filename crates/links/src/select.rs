// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Select link
//!
//! Routes the channels of one input queue to several output queues. Each output
//! queue lists the input channels it carries; a buffer is renumbered to its
//! position in that list. Channels no output selects go straight back to the
//! producer. The mapping can be changed at runtime with
//! `set_out_queue_channels`.

use framelink_core::buffer::MAX_BUFFERS_PER_LIST;
use framelink_core::link::MAX_CHANNELS_PER_QUEUE;
use framelink_core::queue::BoundedQueue;
use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, graph_helpers, Buffer, BufferId, BufferList, ChannelInfo, CreateParams,
    Exhausted, FrameLinkError, InQueueParams, LinkContext, LinkId, LinkInfo, LinkInterface,
    LinkPlugin, LinkRegistry, QueueInfo, Result, StrayBuffers,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SelectConfig {
    /// Input channels carried by each output queue, in output channel order.
    /// Output queues beyond this list start with no channels.
    pub out_queues: Vec<Vec<u16>>,
}

/// Payload of `set_out_queue_channels`.
#[derive(Debug, Deserialize)]
struct OutQueueChannels {
    out_queue: usize,
    #[serde(default)]
    channels: Vec<u16>,
}

/// Payload of `get_out_queue_channels`.
#[derive(Debug, Deserialize)]
struct OutQueueRef {
    out_queue: usize,
}

/// Where an input channel currently goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    queue: usize,
    channel: u16,
}

#[derive(Debug)]
struct Routing {
    /// Indexed by input channel.
    targets: Vec<Option<Target>>,
    /// Indexed by output queue: the input channels it carries.
    selected: Vec<Vec<u16>>,
    info: LinkInfo,
    /// Input channel of every buffer handed downstream.
    in_flight: HashMap<BufferId, u16>,
}

impl Routing {
    fn new(inputs: &[ChannelInfo], outputs: usize) -> Self {
        Self {
            targets: vec![None; inputs.len()],
            selected: vec![Vec::new(); outputs],
            info: LinkInfo { queues: vec![QueueInfo::default(); outputs] },
            in_flight: HashMap::new(),
        }
    }

    /// Replaces the channels of `queue`. An input channel feeds at most one
    /// output, so channels taken here are removed from other queues.
    fn assign(&mut self, inputs: &[ChannelInfo], queue: usize, channels: &[u16]) -> Result<()> {
        if queue >= self.selected.len() {
            return Err(FrameLinkError::Plugin(format!(
                "select has {} output queues, no queue {queue}",
                self.selected.len()
            )));
        }
        if channels.len() > MAX_CHANNELS_PER_QUEUE {
            return Err(FrameLinkError::Plugin(format!(
                "{} channels exceed {MAX_CHANNELS_PER_QUEUE} per queue",
                channels.len()
            )));
        }
        for (position, &channel) in channels.iter().enumerate() {
            if usize::from(channel) >= inputs.len() {
                return Err(FrameLinkError::Plugin(format!(
                    "input channel {channel} does not exist, producer has {}",
                    inputs.len()
                )));
            }
            if channels[..position].contains(&channel) {
                return Err(FrameLinkError::Plugin(format!("input channel {channel} listed twice")));
            }
        }

        for &channel in &self.selected[queue] {
            self.targets[usize::from(channel)] = None;
        }
        for (other, list) in self.selected.iter_mut().enumerate() {
            if other != queue {
                list.retain(|c| !channels.contains(c));
            }
        }
        self.selected[queue] = channels.to_vec();

        for (queue, list) in self.selected.iter().enumerate() {
            for (position, &channel) in list.iter().enumerate() {
                self.targets[usize::from(channel)] =
                    Some(Target { queue, channel: u16::try_from(position).unwrap_or(u16::MAX) });
            }
            self.info.queues[queue] =
                QueueInfo { channels: list.iter().map(|&c| inputs[usize::from(c)]).collect() };
        }
        Ok(())
    }
}

struct SelectOutput {
    registry: LinkRegistry,
    prev: InQueueParams,
    inputs: Vec<ChannelInfo>,
    full: Vec<Mutex<BoundedQueue<Buffer>>>,
    routing: Mutex<Routing>,
    counters: Arc<LinkCounters>,
    strays: StrayBuffers,
}

impl SelectOutput {
    fn routing(&self) -> MutexGuard<'_, Routing> {
        self.routing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, queue: usize) -> Option<MutexGuard<'_, BoundedQueue<Buffer>>> {
        self.full.get(queue).map(|q| q.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Restores each buffer's input channel and hands it back to the producer.
    fn return_upstream(&self, buffers: impl IntoIterator<Item = Buffer>) {
        let mut back = Vec::new();
        {
            let mut routing = self.routing();
            for mut buffer in buffers {
                match routing.in_flight.remove(&buffer.id()) {
                    Some(channel) => {
                        buffer.channel = channel;
                        back.push(buffer);
                    },
                    None => {
                        LinkCounters::bump(&self.counters.in_buf_errors);
                        tracing::warn!(buffer = %buffer.id(), "Select never forwarded this buffer, parked");
                        self.strays.park(buffer);
                    },
                }
            }
        }
        graph_helpers::return_all_to_producer(&self.registry, &self.prev, back, &self.counters);
    }

    fn drain(&self) -> Vec<Buffer> {
        let mut drained = Vec::new();
        for queue in &self.full {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            drained.extend(std::iter::from_fn(|| queue.pop()));
        }
        drained
    }
}

impl LinkInterface for SelectOutput {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        let mut list = BufferList::new();
        let Some(mut full) = self.queue(queue) else {
            return list;
        };
        while !list.is_full() {
            let Some(buffer) = full.pop() else {
                break;
            };
            let _ = list.push(buffer);
        }
        list
    }

    fn put_empty_buffers(&self, _queue: usize, buffers: BufferList) {
        LinkCounters::bump(&self.counters.put_empty_calls);
        self.return_upstream(buffers);
    }

    fn get_info(&self) -> LinkInfo {
        self.routing().info.clone()
    }
}

#[derive(Default)]
pub struct Select {
    output: Option<Arc<SelectOutput>>,
    /// Consumers of each output queue.
    next_links: Vec<Vec<LinkId>>,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    fn output(&self) -> Result<&Arc<SelectOutput>> {
        self.output.as_ref().ok_or_else(|| FrameLinkError::Plugin("select is not created".to_string()))
    }
}

impl LinkPlugin for Select {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: SelectConfig = config_helpers::parse_config_optional(params.config.as_ref())?;
        graph_helpers::expect_inputs(&params.in_queues, 1, "select")?;
        if params.out_queues.is_empty() {
            return Err(FrameLinkError::Configuration("select needs at least one output queue".to_string()));
        }
        if config.out_queues.len() > params.out_queues.len() {
            return Err(FrameLinkError::Configuration(format!(
                "select maps {} output queues but has {}",
                config.out_queues.len(),
                params.out_queues.len()
            )));
        }
        let mut queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;
        let inputs = queues.remove(0).channels;

        let mut routing = Routing::new(&inputs, params.out_queues.len());
        for (queue, channels) in config.out_queues.iter().enumerate() {
            routing.assign(&inputs, queue, channels).map_err(|e| match e {
                FrameLinkError::Plugin(msg) => FrameLinkError::Configuration(format!("select: {msg}")),
                other => other,
            })?;
        }

        let output = Arc::new(SelectOutput {
            registry: ctx.registry().clone(),
            prev: params.in_queues[0],
            full: (0..params.out_queues.len())
                .map(|_| Mutex::new(BoundedQueue::with_capacity(MAX_BUFFERS_PER_LIST)))
                .collect(),
            inputs,
            routing: Mutex::new(routing),
            counters: ctx.counters(),
            strays: StrayBuffers::new(),
        });
        ctx.stats_mut().configure(output.inputs.len());
        ctx.attach_interface(output.clone())?;

        self.next_links = params.out_queues.iter().map(|q| q.next_links.clone()).collect();
        tracing::debug!(
            link_id = %ctx.id(),
            outputs = params.out_queues.len(),
            channels = output.inputs.len(),
            "Select created"
        );
        self.output = Some(output);
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let Some(output) = self.output.clone() else {
            return Ok(());
        };
        let list = ctx.registry().get_full_buffers(output.prev.prev_link, output.prev.prev_queue);
        if list.is_empty() {
            return Ok(());
        }
        ctx.stats_mut().on_buffers_received();

        let now = now_us();
        let mut unselected = Vec::new();
        let mut refused = Vec::new();
        let mut touched = vec![false; output.full.len()];

        for mut buffer in list {
            let channel = buffer.channel_index();
            if channel >= output.inputs.len() {
                LinkCounters::bump(&ctx.counters().in_buf_errors);
                tracing::warn!(link_id = %ctx.id(), channel, "Buffer on a channel the producer never declared");
                unselected.push(buffer);
                continue;
            }
            ctx.stats_mut().update_latency(&buffer, now);
            buffer.link_local_timestamp = now;
            ctx.stats_mut().channel(channel).received += 1;

            let target = output.routing().targets[channel];
            let Some(target) = target else {
                ctx.stats_mut().channel(channel).user_dropped += 1;
                unselected.push(buffer);
                continue;
            };

            let id = buffer.id();
            let original = buffer.channel;
            buffer.channel = target.channel;
            output.routing().in_flight.insert(id, original);
            let pushed = output.full[target.queue].lock().unwrap_or_else(PoisonError::into_inner).push(buffer);
            match pushed {
                Ok(()) => {
                    touched[target.queue] = true;
                    let stats = ctx.stats_mut().channel(channel);
                    stats.processed += 1;
                    stats.forwarded += 1;
                },
                Err(rejected) => {
                    ctx.stats_mut().record_drop(channel, Exhausted::QueueFull);
                    refused.push(rejected.into_inner());
                },
            }
        }

        graph_helpers::return_all_to_producer(ctx.registry(), &output.prev, unselected, &ctx.counters());
        if !refused.is_empty() {
            output.return_upstream(refused);
        }
        for (queue, _) in touched.iter().enumerate().filter(|(_, t)| **t) {
            ctx.notify_links(&self.next_links[queue]);
        }
        Ok(())
    }

    fn control(
        &mut self,
        ctx: &mut LinkContext,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match name {
            "set_out_queue_channels" => {
                let OutQueueChannels { out_queue, channels } = serde_json::from_value(payload.clone())
                    .map_err(|e| FrameLinkError::Plugin(format!("set_out_queue_channels: {e}")))?;
                let output = self.output()?;
                output.routing().assign(&output.inputs, out_queue, &channels)?;
                tracing::info!(link_id = %ctx.id(), out_queue, ?channels, "Select mapping changed");
                Ok(serde_json::json!({ "out_queue": out_queue, "channels": channels }))
            },
            "get_out_queue_channels" => {
                let OutQueueRef { out_queue } = serde_json::from_value(payload.clone())
                    .map_err(|e| FrameLinkError::Plugin(format!("get_out_queue_channels: {e}")))?;
                let routing = self.output()?.routing();
                let channels = routing
                    .selected
                    .get(out_queue)
                    .ok_or_else(|| FrameLinkError::Plugin(format!("no output queue {out_queue}")))?;
                Ok(serde_json::json!({ "out_queue": out_queue, "channels": channels }))
            },
            other => Err(FrameLinkError::Plugin(format!("select: unknown control '{other}'"))),
        }
    }

    fn stop(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        if let Some(output) = &self.output {
            output.return_upstream(output.drain());
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        let Some(output) = self.output.take() else {
            return Ok(());
        };
        output.return_upstream(output.drain());

        let with_consumers = output.routing().in_flight.len();
        if with_consumers > 0 {
            LinkCounters::bump(&ctx.counters().out_buf_errors);
            tracing::warn!(
                link_id = %ctx.id(),
                with_consumers,
                "Buffers still with consumers at delete"
            );
        }
        let (_, foreign) = output.strays.drain_split(ctx.id());
        if !foreign.is_empty() {
            let ids: Vec<String> = foreign.iter().map(|b| b.id().to_string()).collect();
            tracing::warn!(
                link_id = %ctx.id(),
                buffers = ?ids,
                "Buffers select never forwarded are released with this link"
            );
        }
        self.next_links.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::OutQueueParams;

    fn select_params(outputs: usize, config: serde_json::Value) -> CreateParams {
        CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![OutQueueParams { next_links: vec![] }; outputs],
            config: Some(config),
        }
    }

    #[test]
    fn test_channels_routed_and_restored() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(3);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "select");

        let mut select = Select::new();
        select
            .create(&mut ctx, &select_params(2, serde_json::json!({ "out_queues": [[2], [0]] })))
            .unwrap();
        let info = services.registry.get_info(LinkId(2)).unwrap();
        assert_eq!(info.queues.len(), 2);
        assert_eq!(info.queues[0].num_channels(), 1);

        producer.offer(buffer(1, 0, 0));
        producer.offer(buffer(1, 1, 1));
        producer.offer(buffer(1, 2, 2));
        select.process(&mut ctx).unwrap();

        // Channel 1 is not selected anywhere.
        assert_eq!(producer.returned_ids(), vec![1]);
        assert_eq!(ctx.stats().snapshot().channels[1].user_dropped, 1);

        let first = services.registry.get_full_buffers(LinkId(2), 0);
        let second = services.registry.get_full_buffers(LinkId(2), 1);
        assert_eq!(first.iter().map(|b| (b.id().index, b.channel)).collect::<Vec<_>>(), vec![(2, 0)]);
        assert_eq!(second.iter().map(|b| (b.id().index, b.channel)).collect::<Vec<_>>(), vec![(0, 0)]);

        services.registry.put_empty_buffers(LinkId(2), 0, first).unwrap();
        services.registry.put_empty_buffers(LinkId(2), 1, second).unwrap();
        let back: Vec<(u32, u16)> =
            producer.take_returned().iter().map(|b| (b.id().index, b.channel)).collect();
        assert_eq!(back, vec![(1, 1), (2, 2), (0, 0)]);
    }

    #[test]
    fn test_set_out_queue_channels_moves_a_channel() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(2);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "select");

        let mut select = Select::new();
        select
            .create(&mut ctx, &select_params(2, serde_json::json!({ "out_queues": [[0, 1]] })))
            .unwrap();

        let reply = select
            .control(&mut ctx, "set_out_queue_channels", &serde_json::json!({ "out_queue": 1, "channels": [1] }))
            .unwrap();
        assert_eq!(reply["channels"], serde_json::json!([1]));
        let first = select
            .control(&mut ctx, "get_out_queue_channels", &serde_json::json!({ "out_queue": 0 }))
            .unwrap();
        assert_eq!(first["channels"], serde_json::json!([0]));
        let info = services.registry.get_info(LinkId(2)).unwrap();
        assert_eq!((info.queues[0].num_channels(), info.queues[1].num_channels()), (1, 1));

        producer.offer(buffer(1, 4, 1));
        select.process(&mut ctx).unwrap();
        let list = services.registry.get_full_buffers(LinkId(2), 1);
        assert_eq!(list.iter().map(|b| b.channel).collect::<Vec<_>>(), vec![0]);

        assert!(select
            .control(&mut ctx, "set_out_queue_channels", &serde_json::json!({ "out_queue": 0, "channels": [7] }))
            .is_err());
        assert!(select
            .control(&mut ctx, "get_out_queue_channels", &serde_json::json!({ "out_queue": 5 }))
            .is_err());
    }

    #[test]
    fn test_unknown_return_is_parked_not_lost() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "select");

        let mut select = Select::new();
        select.create(&mut ctx, &select_params(1, serde_json::json!({ "out_queues": [[0]] }))).unwrap();
        let mut list = BufferList::new();
        list.push(buffer(8, 1, 0)).unwrap();
        services.registry.put_empty_buffers(LinkId(2), 0, list).unwrap();

        let output = select.output.clone().unwrap();
        assert_eq!(output.strays.ids(), vec![BufferId { link: LinkId(8), index: 1 }]);
        assert!(producer.returned_ids().is_empty());
        select.delete(&mut ctx).unwrap();
        assert!(output.strays.is_empty());
    }

    #[test]
    fn test_rejects_bad_mapping_at_create() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "select");
        assert!(matches!(
            Select::new().create(&mut ctx, &select_params(1, serde_json::json!({ "out_queues": [[3]] }))),
            Err(FrameLinkError::Configuration(_))
        ));
        assert!(matches!(
            Select::new().create(&mut ctx, &select_params(1, serde_json::json!({ "out_queues": [[0], [0]] }))),
            Err(FrameLinkError::Configuration(_))
        ));
    }
}
