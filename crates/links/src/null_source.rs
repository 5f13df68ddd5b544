// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Null source link
//!
//! Owns a pool of empty video buffers and emits one buffer per channel on every
//! processing pass, either on its own tick or on NEW_DATA. Returned buffers come
//! back through its interface.

use crate::output::PooledOutput;
use framelink_core::buffer::PayloadInfo;
use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, BufferType, ChannelInfo, CreateParams, Exhausted, FrameLinkError, LinkContext,
    LinkId, LinkInfo, LinkPlugin, LocalAddr, Payload, PoolCounts, QueueInfo, QueueLayout,
    QueuePool, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NullSourceConfig {
    /// Channels on the single output queue.
    #[schemars(range(min = 1, max = 16))]
    pub channels: usize,
    /// Buffers allocated per channel at CREATE.
    #[schemars(range(min = 1))]
    pub buffers_per_channel: usize,
    /// Generation period in milliseconds; 0 generates only on NEW_DATA.
    pub interval_ms: u64,
    pub width: u32,
    pub height: u32,
    /// Local address of the first buffer's payload.
    pub base_addr: u64,
}

impl Default for NullSourceConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            buffers_per_channel: 4,
            interval_ms: 33,
            width: 640,
            height: 480,
            base_addr: 0x1000_0000,
        }
    }
}

#[derive(Default)]
pub struct NullSource {
    config: NullSourceConfig,
    output: Option<Arc<PooledOutput>>,
    next_links: Vec<LinkId>,
}

impl NullSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn pitch(&self) -> u32 {
        self.config.width.saturating_mul(2)
    }
}

impl LinkPlugin for NullSource {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        self.config = config_helpers::parse_config_optional(params.config.as_ref())?;
        if !params.in_queues.is_empty() {
            return Err(FrameLinkError::Configuration(
                "null_source takes no input queues".to_string(),
            ));
        }
        if self.config.channels == 0 {
            return Err(FrameLinkError::Configuration("null_source needs at least 1 channel".to_string()));
        }

        let pitch = self.pitch();
        let frame_size = pitch.saturating_mul(self.config.height);
        let (width, height, base) = (self.config.width, self.config.height, self.config.base_addr);

        let mut pool = QueuePool::new(
            ctx.id(),
            &[QueueLayout::new(self.config.channels, self.config.buffers_per_channel)],
        )?;
        pool.allocate(0, |id, _channel| {
            let addr = LocalAddr(base + u64::from(id.index) * u64::from(frame_size));
            (
                BufferType::VideoFrame,
                Payload::single(addr, frame_size, PayloadInfo::Video { width, height, pitch }),
            )
        })?;

        let info = LinkInfo::single(QueueInfo {
            channels: vec![
                ChannelInfo { buf_type: BufferType::VideoFrame, width, height, pitch };
                self.config.channels
            ],
        });
        let output = Arc::new(PooledOutput::new(pool, info, ctx.counters()));
        ctx.attach_interface(output.clone())?;
        ctx.stats_mut().configure(self.config.channels);

        self.next_links = params.next_links();
        self.output = Some(output);
        tracing::info!(
            link_id = %ctx.id(),
            channels = self.config.channels,
            buffers_per_channel = self.config.buffers_per_channel,
            interval_ms = self.config.interval_ms,
            "Null source created"
        );
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let Some(output) = self.output.clone() else {
            return Ok(());
        };
        ctx.stats_mut().on_buffers_received();

        let mut produced = 0;
        for channel in 0..self.config.channels {
            let mut buffer = match output.pool().get_empty(0, channel) {
                Ok(buffer) => buffer,
                Err(FrameLinkError::Exhausted(kind)) => {
                    ctx.stats_mut().record_drop(channel, kind);
                    tracing::trace!(link_id = %ctx.id(), channel, "No empty buffer, frame dropped");
                    continue;
                },
                Err(e) => return Err(e),
            };

            let now = now_us();
            buffer.src_timestamp = now;
            buffer.link_local_timestamp = now;
            ctx.stats_mut().channel(channel).received += 1;

            match output.pool().put_full(0, buffer) {
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

        if produced > 0 {
            ctx.notify_links(&self.next_links);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut LinkContext) -> Result<()> {
        tracing::debug!(link_id = %ctx.id(), "Null source stopped");
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        if let Some(output) = self.output.take() {
            let allocated = output.pool().total_allocated();
            let reclaimed = output.reclaim();
            if reclaimed != allocated {
                LinkCounters::bump(&ctx.counters().out_buf_errors);
                tracing::warn!(
                    link_id = %ctx.id(),
                    allocated,
                    reclaimed,
                    "Buffers still with consumers at delete"
                );
            }
        }
        self.next_links.clear();
        Ok(())
    }

    fn tick_interval(&self) -> Option<Duration> {
        (self.config.interval_ms > 0).then(|| Duration::from_millis(self.config.interval_ms))
    }

    fn census(&self) -> Option<PoolCounts> {
        self.output.as_ref().map(|o| o.counts())
    }
}
