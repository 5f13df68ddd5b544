// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Frame copy link
//!
//! The shape of an algorithm link: every input buffer is matched with an empty
//! output buffer of the same channel, the frame is "processed" into it and the
//! input goes straight back to its producer.

use crate::output::PooledOutput;
use framelink_core::buffer::PayloadInfo;
use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, graph_helpers, Buffer, BufferList, CreateParams, Exhausted, FrameLinkError,
    InQueueParams, LinkContext, LinkId, LinkInfo, LinkPlugin, LocalAddr, Payload, PoolCounts,
    QueueInfo, QueueLayout, QueuePool, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FrameCopyConfig {
    /// Output buffers per channel.
    #[schemars(range(min = 1))]
    pub depth: usize,
    /// Local address of the first output payload.
    pub base_addr: u64,
}

impl Default for FrameCopyConfig {
    fn default() -> Self {
        Self { depth: 4, base_addr: 0x2000_0000 }
    }
}

#[derive(Default)]
pub struct FrameCopy {
    prev: Option<InQueueParams>,
    output: Option<Arc<PooledOutput>>,
    next_links: Vec<LinkId>,
}

impl FrameCopy {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Copies everything but the payload planes, which stay the output buffer's own.
fn copy_frame(src: &Buffer, dst: &mut Buffer, now: u64) {
    dst.buf_type = src.buf_type;
    dst.src_timestamp = src.src_timestamp;
    dst.link_local_timestamp = now;
    dst.payload.info = src.payload.info;
}

/// Payload address of each output buffer, one `stride` apart from `base`.
fn payload_addrs(base: u64, stride: u64, count: usize) -> Result<Vec<u64>> {
    (0..count as u64)
        .map(|index| {
            index.checked_mul(stride).and_then(|offset| base.checked_add(offset)).ok_or_else(|| {
                FrameLinkError::Configuration(format!(
                    "frame_copy buffer {index} at base {base:#x} + {stride} bytes per frame overflows the address space"
                ))
            })
        })
        .collect()
}

impl LinkPlugin for FrameCopy {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: FrameCopyConfig = config_helpers::parse_config_optional(params.config.as_ref())?;
        graph_helpers::expect_inputs(&params.in_queues, 1, "frame_copy")?;
        let mut queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;
        let queue: QueueInfo = queues.remove(0);

        let frame_sizes: Vec<u32> =
            queue.channels.iter().map(|c| c.pitch.saturating_mul(c.height)).collect();
        let stride = u64::from(frame_sizes.iter().copied().max().unwrap_or(0));
        let addrs = payload_addrs(config.base_addr, stride, queue.num_channels() * config.depth)?;
        let mut pool =
            QueuePool::new(ctx.id(), &[QueueLayout::new(queue.num_channels(), config.depth)])?;
        let channels = queue.channels.clone();
        pool.allocate(0, |id, channel| {
            let info = &channels[usize::from(channel)];
            let addr = LocalAddr(addrs[id.index as usize]);
            (
                info.buf_type,
                Payload::single(
                    addr,
                    frame_sizes[usize::from(channel)],
                    PayloadInfo::Video { width: info.width, height: info.height, pitch: info.pitch },
                ),
            )
        })?;

        let output = Arc::new(PooledOutput::new(pool, LinkInfo::single(queue.clone()), ctx.counters()));
        ctx.attach_interface(output.clone())?;
        ctx.stats_mut().configure(queue.num_channels());

        self.prev = Some(params.in_queues[0]);
        self.output = Some(output);
        self.next_links = params.next_links();
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let (Some(prev), Some(output)) = (self.prev, self.output.clone()) else {
            return Ok(());
        };
        let inputs = ctx.registry().get_full_buffers(prev.prev_link, prev.prev_queue);
        if inputs.is_empty() {
            return Ok(());
        }
        ctx.stats_mut().on_buffers_received();

        let now = now_us();
        let mut produced = 0;
        for input in &inputs {
            let channel = input.channel_index();
            ctx.stats_mut().channel(channel).received += 1;
            ctx.stats_mut().update_latency(input, now);

            let mut out = match output.pool().get_empty(0, channel) {
                Ok(out) => out,
                Err(FrameLinkError::Exhausted(kind)) => {
                    ctx.stats_mut().record_drop(channel, kind);
                    continue;
                },
                Err(e) => {
                    LinkCounters::bump(&ctx.counters().in_buf_errors);
                    tracing::warn!(link_id = %ctx.id(), channel, error = %e, "Input on an unknown channel");
                    continue;
                },
            };
            copy_frame(input, &mut out, now);

            match output.pool().put_full(0, out) {
                Ok(()) => {
                    let stats = ctx.stats_mut().channel(channel);
                    stats.processed += 1;
                    stats.forwarded += 1;
                    produced += 1;
                },
                Err(rejected) => {
                    ctx.stats_mut().record_drop(channel, Exhausted::QueueFull);
                    output.recycle(0, rejected.into_inner());
                },
            }
        }

        graph_helpers::return_to_producer(ctx.registry(), &prev, inputs, &ctx.counters());
        if produced > 0 {
            ctx.notify_links(&self.next_links);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut LinkContext) -> Result<()> {
        // Hand back anything the producer still has queued for us.
        if let Some(prev) = self.prev {
            let pending: BufferList = ctx.registry().get_full_buffers(prev.prev_link, prev.prev_queue);
            graph_helpers::return_to_producer(ctx.registry(), &prev, pending, &ctx.counters());
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        if let Some(output) = self.output.take() {
            let allocated = output.pool().total_allocated();
            let reclaimed = output.reclaim();
            if reclaimed != allocated {
                LinkCounters::bump(&ctx.counters().out_buf_errors);
                tracing::warn!(link_id = %ctx.id(), allocated, reclaimed, "Output buffers still with consumers at delete");
            }
        }
        self.prev = None;
        Ok(())
    }

    fn census(&self) -> Option<PoolCounts> {
        self.output.as_ref().map(|o| o.counts())
    }
}
