// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Dup link
//!
//! Duplicates one input queue to M output queues. Each output gets a shadow
//! buffer that references the original payload; the original goes back to its
//! producer only when the last shadow has been returned.

use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, graph_helpers, Buffer, BufferId, BufferList, BufferType, CreateParams,
    FrameLinkError, InQueueParams, LinkContext, LinkId, LinkInfo, LinkInterface, LinkPlugin,
    LinkRegistry, Payload, PoolCounts, QueueLayout, QueuePool, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DupConfig {
    /// Shadow buffers per output channel.
    #[schemars(range(min = 1))]
    pub depth: usize,
}

impl Default for DupConfig {
    fn default() -> Self {
        Self { depth: 4 }
    }
}

/// An original waiting for its shadows. READY once `remaining` reaches zero.
#[derive(Debug)]
struct Pending {
    original: Buffer,
    remaining: usize,
}

#[derive(Debug, Default)]
struct DupState {
    pending: HashMap<BufferId, Pending>,
    /// Shadow id to the original it mirrors.
    shadow_of: HashMap<BufferId, BufferId>,
}

struct DupOutput {
    registry: LinkRegistry,
    prev: InQueueParams,
    pool: QueuePool,
    info: LinkInfo,
    state: Mutex<DupState>,
    counters: Arc<LinkCounters>,
}

impl DupOutput {
    fn state(&self) -> std::sync::MutexGuard<'_, DupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a shadow back. Returns the original once no shadow references it.
    fn release_shadow(&self, queue: usize, shadow: Buffer) -> Option<Buffer> {
        let ready = {
            let mut state = self.state();
            match state.shadow_of.remove(&shadow.id()) {
                Some(original) => {
                    let done = state.pending.get_mut(&original).is_some_and(|p| {
                        p.remaining = p.remaining.saturating_sub(1);
                        p.remaining == 0
                    });
                    if done {
                        state.pending.remove(&original).map(|p| p.original)
                    } else {
                        None
                    }
                },
                None => {
                    LinkCounters::bump(&self.counters.in_buf_errors);
                    tracing::warn!(buffer = %shadow.id(), "Shadow buffer returned twice or never sent");
                    None
                },
            }
        };

        if let Err(rejected) = self.pool.put_empty(queue, shadow) {
            LinkCounters::bump(&self.counters.in_buf_errors);
            tracing::warn!(buffer = %rejected.item.id(), error = %rejected.error, "Shadow buffer refused");
        }
        ready
    }

    fn return_originals(&self, originals: Vec<Buffer>) {
        graph_helpers::return_all_to_producer(&self.registry, &self.prev, originals, &self.counters);
    }

    /// Pulls shadows still queued for consumers and releases them.
    fn drain_full(&self) -> Vec<Buffer> {
        let mut ready = Vec::new();
        for queue in 0..self.pool.num_queues() {
            loop {
                let list = self.pool.get_full(queue);
                if list.is_empty() {
                    break;
                }
                ready.extend(list.into_iter().filter_map(|s| self.release_shadow(queue, s)));
            }
        }
        ready
    }
}

impl LinkInterface for DupOutput {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        self.pool.get_full(queue)
    }

    fn put_empty_buffers(&self, queue: usize, buffers: BufferList) {
        LinkCounters::bump(&self.counters.put_empty_calls);
        let ready: Vec<Buffer> =
            buffers.into_iter().filter_map(|s| self.release_shadow(queue, s)).collect();
        self.return_originals(ready);
    }

    fn get_info(&self) -> LinkInfo {
        self.info.clone()
    }
}

#[derive(Default)]
pub struct Dup {
    output: Option<Arc<DupOutput>>,
    next_links: Vec<LinkId>,
}

impl Dup {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkPlugin for Dup {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: DupConfig = config_helpers::parse_config_optional(params.config.as_ref())?;
        graph_helpers::expect_inputs(&params.in_queues, 1, "dup")?;
        if params.out_queues.is_empty() {
            return Err(FrameLinkError::Configuration("dup needs at least one output queue".to_string()));
        }
        if config.depth == 0 {
            return Err(FrameLinkError::Configuration("dup depth must be at least 1".to_string()));
        }
        let mut queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;
        let queue = queues.remove(0);
        let outputs = params.out_queues.len();

        let layouts = vec![QueueLayout::new(queue.num_channels(), config.depth); outputs];
        let mut pool = QueuePool::new(ctx.id(), &layouts)?;
        for q in 0..outputs {
            pool.allocate(q, |_, _| (BufferType::default(), Payload::default()))?;
        }

        let output = Arc::new(DupOutput {
            registry: ctx.registry().clone(),
            prev: params.in_queues[0],
            pool,
            info: LinkInfo { queues: vec![queue.clone(); outputs] },
            state: Mutex::new(DupState::default()),
            counters: ctx.counters(),
        });
        ctx.attach_interface(output.clone())?;
        ctx.stats_mut().configure(queue.num_channels());

        self.output = Some(output);
        self.next_links = params.next_links();
        tracing::debug!(link_id = %ctx.id(), outputs, depth = config.depth, "Dup created");
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
        let mut unused = Vec::new();
        let mut produced = 0;

        for mut original in list {
            let channel = original.channel_index();
            ctx.stats_mut().update_latency(&original, now);
            original.link_local_timestamp = now;
            ctx.stats_mut().channel(channel).received += 1;

            let mut shadows = Vec::with_capacity(output.pool.num_queues());
            for queue in 0..output.pool.num_queues() {
                match output.pool.get_empty(queue, channel) {
                    Ok(mut shadow) => {
                        shadow.buf_type = original.buf_type;
                        shadow.payload = original.payload.clone();
                        shadow.src_timestamp = original.src_timestamp;
                        shadow.link_local_timestamp = now;
                        shadows.push((queue, shadow));
                    },
                    Err(FrameLinkError::Exhausted(kind)) => ctx.stats_mut().record_drop(channel, kind),
                    Err(e) => {
                        LinkCounters::bump(&ctx.counters().in_buf_errors);
                        tracing::warn!(link_id = %ctx.id(), channel, error = %e, "Buffer on a channel dup does not have");
                    },
                }
            }

            if shadows.is_empty() {
                unused.push(original);
                continue;
            }

            {
                let mut state = output.state();
                for (_, shadow) in &shadows {
                    state.shadow_of.insert(shadow.id(), original.id());
                }
                state.pending.insert(original.id(), Pending { original, remaining: shadows.len() });
            }

            for (queue, shadow) in shadows {
                match output.pool.put_full(queue, shadow) {
                    Ok(()) => produced += 1,
                    Err(rejected) => {
                        ctx.stats_mut().record_drop(channel, framelink_core::Exhausted::QueueFull);
                        unused.extend(output.release_shadow(queue, rejected.into_inner()));
                    },
                }
            }
            let stats = ctx.stats_mut().channel(channel);
            stats.processed += 1;
            stats.forwarded += 1;
        }

        output.return_originals(unused);
        if produced > 0 {
            ctx.notify_links(&self.next_links);
        }
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        if let Some(output) = &self.output {
            let ready = output.drain_full();
            output.return_originals(ready);
        }
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        let Some(output) = self.output.take() else {
            return Ok(());
        };
        let mut ready = output.drain_full();
        let stranded: Vec<Buffer> = {
            let mut state = output.state();
            state.shadow_of.clear();
            state.pending.drain().map(|(_, p)| p.original).collect()
        };
        if !stranded.is_empty() {
            LinkCounters::bump(&ctx.counters().out_buf_errors);
            tracing::warn!(
                link_id = %ctx.id(),
                stranded = stranded.len(),
                "Shadows still with consumers at delete, returning originals"
            );
        }
        ready.extend(stranded);
        output.return_originals(ready);
        self.next_links.clear();
        Ok(())
    }

    fn census(&self) -> Option<PoolCounts> {
        self.output.as_ref().map(|o| o.pool.counts())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::OutQueueParams;

    fn dup_params(outputs: usize) -> CreateParams {
        CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![OutQueueParams { next_links: vec![] }; outputs],
            config: None,
        }
    }

    #[test]
    fn test_original_returned_after_last_shadow() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "dup");

        let mut dup = Dup::new();
        dup.create(&mut ctx, &dup_params(2)).unwrap();
        producer.offer(buffer(1, 5, 0));
        dup.process(&mut ctx).unwrap();

        let first = services.registry.get_full_buffers(LinkId(2), 0);
        let second = services.registry.get_full_buffers(LinkId(2), 1);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first.iter().next().unwrap().payload, buffer(1, 5, 0).payload);

        services.registry.put_empty_buffers(LinkId(2), 0, first).unwrap();
        assert!(producer.returned_ids().is_empty());
        services.registry.put_empty_buffers(LinkId(2), 1, second).unwrap();
        assert_eq!(producer.returned_ids(), vec![5]);
        assert_eq!(dup.census().unwrap().outstanding(), 0);
    }

    #[test]
    fn test_exhausted_outputs_return_original_immediately() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "dup");

        let mut dup = Dup::new();
        let mut params = dup_params(1);
        params.config = Some(serde_json::json!({ "depth": 1 }));
        dup.create(&mut ctx, &params).unwrap();

        producer.offer(buffer(1, 0, 0));
        producer.offer(buffer(1, 1, 0));
        dup.process(&mut ctx).unwrap();

        assert_eq!(producer.returned_ids(), vec![1]);
        assert_eq!(ctx.stats().snapshot().exhausted.no_buffer, 1);
    }

    #[test]
    fn test_delete_returns_stranded_originals() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "dup");

        let mut dup = Dup::new();
        dup.create(&mut ctx, &dup_params(2)).unwrap();
        producer.offer(buffer(1, 3, 0));
        dup.process(&mut ctx).unwrap();

        // One consumer took its shadow and never returned it.
        let _taken = services.registry.get_full_buffers(LinkId(2), 0);
        dup.stop(&mut ctx).unwrap();
        assert!(producer.returned_ids().is_empty());

        dup.delete(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![3]);
    }
}
