// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Gate link
//!
//! Exposes its producer's output queue unchanged while ON. While OFF consumers see
//! nothing and the producer's buffers stay queued at the producer.

use framelink_core::stats::LinkCounters;
use framelink_core::{
    config_helpers, graph_helpers, BufferList, CreateParams, FrameLinkError, InQueueParams,
    LinkContext, LinkId, LinkInfo, LinkInterface, LinkPlugin, LinkRegistry, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GateConfig {
    /// Initial position.
    pub open: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { open: true }
    }
}

struct GateOutput {
    registry: LinkRegistry,
    prev: InQueueParams,
    info: LinkInfo,
    open: AtomicBool,
    forwarded: AtomicU64,
    counters: Arc<LinkCounters>,
}

impl LinkInterface for GateOutput {
    fn get_full_buffers(&self, queue: usize) -> BufferList {
        LinkCounters::bump(&self.counters.get_full_calls);
        if queue != 0 || !self.open.load(Ordering::Acquire) {
            return BufferList::new();
        }
        let list = self.registry.get_full_buffers(self.prev.prev_link, self.prev.prev_queue);
        self.forwarded.fetch_add(list.len() as u64, Ordering::Relaxed);
        list
    }

    fn put_empty_buffers(&self, _queue: usize, buffers: BufferList) {
        LinkCounters::bump(&self.counters.put_empty_calls);
        graph_helpers::return_to_producer(&self.registry, &self.prev, buffers, &self.counters);
    }

    fn get_info(&self) -> LinkInfo {
        self.info.clone()
    }
}

#[derive(Default)]
pub struct Gate {
    output: Option<Arc<GateOutput>>,
    next_links: Vec<LinkId>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_open(&self, ctx: &LinkContext, open: bool) -> Result<bool> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| FrameLinkError::Plugin("gate is not created".to_string()))?;
        let was = output.open.swap(open, Ordering::AcqRel);
        if open && !was {
            // Anything queued upstream while closed is now visible.
            ctx.notify_links(&self.next_links);
        }
        tracing::info!(link_id = %ctx.id(), open, "Gate switched");
        Ok(was)
    }
}

impl LinkPlugin for Gate {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: GateConfig = config_helpers::parse_config_optional(params.config.as_ref())?;
        graph_helpers::expect_inputs(&params.in_queues, 1, "gate")?;
        let mut queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;
        let queue = queues.remove(0);
        ctx.stats_mut().configure(queue.num_channels());

        let output = Arc::new(GateOutput {
            registry: ctx.registry().clone(),
            prev: params.in_queues[0],
            info: LinkInfo::single(queue),
            open: AtomicBool::new(config.open),
            forwarded: AtomicU64::new(0),
            counters: ctx.counters(),
        });
        ctx.attach_interface(output.clone())?;
        self.output = Some(output);
        self.next_links = params.next_links();
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        if let Some(output) = &self.output {
            if output.open.load(Ordering::Acquire) {
                ctx.notify_links(&self.next_links);
            }
        }
        Ok(())
    }

    fn control(
        &mut self,
        ctx: &mut LinkContext,
        name: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match name {
            "on" => self.set_open(ctx, true).map(|was| serde_json::json!({ "was_open": was })),
            "off" => self.set_open(ctx, false).map(|was| serde_json::json!({ "was_open": was })),
            "forward_count" => {
                let count = self.output.as_ref().map_or(0, |o| o.forwarded.load(Ordering::Relaxed));
                Ok(serde_json::json!({ "forwarded": count }))
            },
            other => Err(FrameLinkError::Plugin(format!("gate: unknown control '{other}'"))),
        }
    }

    fn stop(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        ctx.detach_interface();
        self.output = None;
        self.next_links.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::LinkCommand;

    fn gate_params(open: bool) -> CreateParams {
        CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![framelink_core::OutQueueParams { next_links: vec![LinkId(3)] }],
            config: Some(serde_json::json!({ "open": open })),
        }
    }

    #[test]
    fn test_closed_gate_hides_buffers() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(2);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "gate");
        let (_sink, mut sink_rx) = context(&services, 3, "null_sink");

        let mut gate = Gate::new();
        gate.create(&mut ctx, &gate_params(false)).unwrap();
        assert_eq!(services.registry.get_info(LinkId(2)).unwrap().queues[0].num_channels(), 2);

        producer.offer(buffer(1, 0, 0));
        assert!(services.registry.get_full_buffers(LinkId(2), 0).is_empty());
        assert_eq!(producer.pending(), 1);

        gate.control(&mut ctx, "on", &serde_json::Value::Null).unwrap();
        assert!(matches!(sink_rx.try_recv(), Some(LinkCommand::NewData)));

        let list = services.registry.get_full_buffers(LinkId(2), 0);
        assert_eq!(list.len(), 1);
        services.registry.put_empty_buffers(LinkId(2), 0, list).unwrap();
        assert_eq!(producer.returned_ids(), vec![0]);

        let count = gate.control(&mut ctx, "forward_count", &serde_json::Value::Null).unwrap();
        assert_eq!(count["forwarded"], 1);
    }

    #[test]
    fn test_requires_exactly_one_input() {
        let (services, _) = services();
        let (mut ctx, _rx) = context(&services, 2, "gate");
        let params = CreateParams { in_queues: vec![], ..CreateParams::default() };
        assert!(matches!(
            Gate::new().create(&mut ctx, &params),
            Err(FrameLinkError::Configuration(_))
        ));
    }
}
