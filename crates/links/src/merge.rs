// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Merge link
//!
//! Combines N input queues into one output queue. Channels are renumbered
//! consecutively in input order; returned buffers get their original channel back
//! and go to the producer they came from.

use framelink_core::buffer::MAX_BUFFERS_PER_LIST;
use framelink_core::queue::BoundedQueue;
use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    graph_helpers, Buffer, BufferList, CreateParams, Exhausted, FrameLinkError, InQueueParams,
    LinkContext, LinkId, LinkInfo, LinkInterface, LinkPlugin, LinkRegistry, QueueInfo, Result,
    StrayBuffers,
};
use std::sync::{Arc, Mutex, PoisonError};

/// Where an output channel came from.
#[derive(Debug, Clone, Copy)]
struct Route {
    input: usize,
    channel: u16,
}

struct MergeOutput {
    registry: LinkRegistry,
    inputs: Vec<InQueueParams>,
    routes: Vec<Route>,
    full: Mutex<BoundedQueue<Buffer>>,
    info: LinkInfo,
    counters: Arc<LinkCounters>,
    /// Returned buffers on a channel no input maps to.
    strays: StrayBuffers,
}

impl MergeOutput {
    /// Restores the producer's channel and returns the buffers, grouped per input.
    fn return_upstream(&self, buffers: impl IntoIterator<Item = Buffer>) {
        let mut per_input: Vec<Vec<Buffer>> = self.inputs.iter().map(|_| Vec::new()).collect();
        for mut buffer in buffers {
            let Some(route) = self.routes.get(buffer.channel_index()).copied() else {
                LinkCounters::bump(&self.counters.in_buf_errors);
                tracing::warn!(buffer = %buffer.id(), channel = buffer.channel, "Merge got a buffer on an unknown channel, parked");
                self.strays.park(buffer);
                continue;
            };
            buffer.channel = route.channel;
            per_input[route.input].push(buffer);
        }
        for (input, buffers) in self.inputs.iter().zip(per_input) {
            graph_helpers::return_all_to_producer(&self.registry, input, buffers, &self.counters);
        }
    }

    fn drain(&self) -> Vec<Buffer> {
        let mut full = self.full.lock().unwrap_or_else(PoisonError::into_inner);
        std::iter::from_fn(|| full.pop()).collect()
    }

    /// Drains the parked buffers and reports them; merge owns none of them.
    fn report_strays(&self, link: LinkId) {
        let (_, foreign) = self.strays.drain_split(link);
        if !foreign.is_empty() {
            let ids: Vec<String> = foreign.iter().map(|b| b.id().to_string()).collect();
            tracing::warn!(
                link_id = %link,
                buffers = ?ids,
                "Buffers returned on unknown channels are released with this link"
            );
        }
    }
}

impl LinkInterface for MergeOutput {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        let mut list = BufferList::new();
        if queue != 0 {
            return list;
        }
        let mut full = self.full.lock().unwrap_or_else(PoisonError::into_inner);
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
        self.info.clone()
    }
}

#[derive(Default)]
pub struct Merge {
    output: Option<Arc<MergeOutput>>,
    offsets: Vec<u16>,
    /// Channel count each input declared at create.
    input_channels: Vec<usize>,
    next_links: Vec<LinkId>,
}

impl Merge {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkPlugin for Merge {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        if params.in_queues.is_empty() {
            return Err(FrameLinkError::Configuration("merge needs at least one input queue".to_string()));
        }
        let queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;

        let mut channels = Vec::new();
        let mut routes = Vec::new();
        let mut offsets = Vec::with_capacity(queues.len());
        for (input, queue) in queues.iter().enumerate() {
            offsets.push(u16::try_from(routes.len()).unwrap_or(u16::MAX));
            for (channel, info) in queue.channels.iter().enumerate() {
                channels.push(*info);
                routes.push(Route { input, channel: u16::try_from(channel).unwrap_or(u16::MAX) });
            }
        }
        if channels.len() > framelink_core::link::MAX_CHANNELS_PER_QUEUE {
            return Err(FrameLinkError::Configuration(format!(
                "merge of {} channels exceeds {} per queue",
                channels.len(),
                framelink_core::link::MAX_CHANNELS_PER_QUEUE
            )));
        }

        let output = Arc::new(MergeOutput {
            registry: ctx.registry().clone(),
            inputs: params.in_queues.clone(),
            routes,
            full: Mutex::new(BoundedQueue::with_capacity(MAX_BUFFERS_PER_LIST)),
            info: LinkInfo::single(QueueInfo { channels }),
            counters: ctx.counters(),
            strays: StrayBuffers::new(),
        });
        ctx.stats_mut().configure(output.routes.len());
        ctx.attach_interface(output.clone())?;

        self.offsets = offsets;
        self.input_channels = queues.iter().map(QueueInfo::num_channels).collect();
        self.next_links = params.next_links();
        self.output = Some(output);
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let Some(output) = self.output.clone() else {
            return Ok(());
        };
        let now = now_us();
        let mut forwarded = 0;
        let mut dropped = Vec::new();

        for (input, prev) in output.inputs.iter().enumerate() {
            let list = ctx.registry().get_full_buffers(prev.prev_link, prev.prev_queue);
            if list.is_empty() {
                continue;
            }
            ctx.stats_mut().on_buffers_received();
            let offset = self.offsets[input];
            let declared = self.input_channels[input];
            let mut misfits = Vec::new();

            for mut buffer in list {
                if buffer.channel_index() >= declared {
                    LinkCounters::bump(&output.counters.in_buf_errors);
                    tracing::warn!(
                        link_id = %ctx.id(),
                        buffer = %buffer.id(),
                        channel = buffer.channel,
                        declared,
                        "Input buffer on an undeclared channel, returned"
                    );
                    misfits.push(buffer);
                    continue;
                }
                buffer.channel = buffer.channel.saturating_add(offset);
                buffer.link_local_timestamp = now;
                let channel = buffer.channel_index();
                ctx.stats_mut().channel(channel).received += 1;

                let pushed = output.full.lock().unwrap_or_else(PoisonError::into_inner).push(buffer);
                match pushed {
                    Ok(()) => {
                        let stats = ctx.stats_mut().channel(channel);
                        stats.processed += 1;
                        stats.forwarded += 1;
                        forwarded += 1;
                    },
                    Err(rejected) => {
                        ctx.stats_mut().record_drop(channel, Exhausted::QueueFull);
                        dropped.push(rejected.into_inner());
                    },
                }
            }
            if !misfits.is_empty() {
                graph_helpers::return_all_to_producer(ctx.registry(), prev, misfits, &output.counters);
            }
        }

        if !dropped.is_empty() {
            output.return_upstream(dropped);
        }
        if forwarded > 0 {
            ctx.notify_links(&self.next_links);
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        if let Some(output) = &self.output {
            output.return_upstream(output.drain());
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        if let Some(output) = self.output.take() {
            output.return_upstream(output.drain());
            output.report_strays(ctx.id());
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};

    fn merge_params() -> CreateParams {
        CreateParams {
            in_queues: vec![
                InQueueParams { prev_link: LinkId(1), prev_queue: 0 },
                InQueueParams { prev_link: LinkId(2), prev_queue: 0 },
            ],
            out_queues: vec![framelink_core::OutQueueParams { next_links: vec![LinkId(9)] }],
            config: None,
        }
    }

    #[test]
    fn test_channels_are_renumbered_and_restored() {
        let (services, _) = services();
        let a = ScriptedProducer::new(2);
        let b = ScriptedProducer::new(1);
        let _arx = a.install(&services, 1);
        let _brx = b.install(&services, 2);
        let (mut ctx, _rx) = context(&services, 3, "merge");

        let mut merge = Merge::new();
        merge.create(&mut ctx, &merge_params()).unwrap();
        assert_eq!(services.registry.get_info(LinkId(3)).unwrap().queues[0].num_channels(), 3);

        a.offer(buffer(1, 0, 1));
        b.offer(buffer(2, 0, 0));
        merge.process(&mut ctx).unwrap();

        let list = services.registry.get_full_buffers(LinkId(3), 0);
        let channels: Vec<u16> = list.iter().map(|b| b.channel).collect();
        assert_eq!(channels, vec![1, 2]);

        services.registry.put_empty_buffers(LinkId(3), 0, list).unwrap();
        let back_a = a.take_returned();
        let back_b = b.take_returned();
        assert_eq!(back_a.len(), 1);
        assert_eq!(back_a[0].channel, 1);
        assert_eq!(back_b.len(), 1);
        assert_eq!(back_b[0].channel, 0);
    }

    #[test]
    fn test_stop_returns_queued_buffers() {
        let (services, _) = services();
        let a = ScriptedProducer::new(1);
        let b = ScriptedProducer::new(1);
        let _arx = a.install(&services, 1);
        let _brx = b.install(&services, 2);
        let (mut ctx, _rx) = context(&services, 3, "merge");

        let mut merge = Merge::new();
        merge.create(&mut ctx, &merge_params()).unwrap();
        a.offer(buffer(1, 7, 0));
        merge.process(&mut ctx).unwrap();
        merge.stop(&mut ctx).unwrap();
        assert_eq!(a.returned_ids(), vec![7]);
        merge.delete(&mut ctx).unwrap();
        assert!(services.registry.get_info(LinkId(3)).is_err());
    }

    #[test]
    fn test_undeclared_channel_goes_back_to_its_producer() {
        let (services, _) = services();
        let a = ScriptedProducer::new(1);
        let b = ScriptedProducer::new(1);
        let _arx = a.install(&services, 1);
        let _brx = b.install(&services, 2);
        let (mut ctx, _rx) = context(&services, 3, "merge");

        let mut merge = Merge::new();
        merge.create(&mut ctx, &merge_params()).unwrap();
        // Channel 1 would be renumbered onto B's channel.
        a.offer(buffer(1, 4, 1));
        merge.process(&mut ctx).unwrap();

        assert_eq!(a.returned_ids(), vec![4]);
        assert!(b.returned_ids().is_empty());
        assert!(services.registry.get_full_buffers(LinkId(3), 0).is_empty());
        assert_eq!(ctx.counters().in_buf_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(ctx.stats().snapshot().channels[1].received, 0);
    }

    #[test]
    fn test_unknown_channel_on_return_is_parked() {
        let (services, _) = services();
        let a = ScriptedProducer::new(1);
        let b = ScriptedProducer::new(1);
        let _arx = a.install(&services, 1);
        let _brx = b.install(&services, 2);
        let (mut ctx, _rx) = context(&services, 3, "merge");

        let mut merge = Merge::new();
        merge.create(&mut ctx, &merge_params()).unwrap();
        let mut list = BufferList::new();
        list.push(buffer(1, 6, 5)).unwrap();
        services.registry.put_empty_buffers(LinkId(3), 0, list).unwrap();

        let output = merge.output.clone().unwrap();
        assert_eq!(output.strays.ids(), vec![framelink_core::BufferId { link: LinkId(1), index: 6 }]);
        assert!(a.returned_ids().is_empty());
        assert_eq!(ctx.counters().in_buf_errors.load(std::sync::atomic::Ordering::Relaxed), 1);

        merge.delete(&mut ctx).unwrap();
        assert!(output.strays.is_empty());
    }
}
