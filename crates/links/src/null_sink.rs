// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Null sink link
//!
//! Pulls every ready buffer from its producers, counts it and hands it back.
//! Holding `hold` buffers simulates a slow consumer.

use framelink_core::stats::LinkCounters;
use framelink_core::time::now_us;
use framelink_core::{
    config_helpers, graph_helpers, Buffer, CreateParams, FrameLinkError, HeldBuffers,
    InQueueParams, LinkContext, LinkPlugin, Result,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NullSinkConfig {
    /// Buffers kept back from the producer before returning.
    pub hold: usize,
}

#[derive(Debug, Deserialize)]
struct SetHold {
    hold: usize,
}

struct Input {
    params: InQueueParams,
    channel_offset: usize,
    held: HeldBuffers,
}

#[derive(Default)]
pub struct NullSink {
    hold: usize,
    inputs: Vec<Input>,
    /// Buffers kept back, oldest first, with their input index.
    kept: VecDeque<(usize, Buffer)>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn return_buffers(&self, ctx: &LinkContext, input: usize, buffers: Vec<Buffer>) {
        let Some(source) = self.inputs.get(input) else {
            return;
        };
        let counters = ctx.counters();
        for buffer in &buffers {
            if !source.held.release(buffer.id()) {
                LinkCounters::bump(&counters.in_buf_errors);
                tracing::warn!(link_id = %ctx.id(), buffer = %buffer.id(), "Returning a buffer not held");
            }
        }
        graph_helpers::return_all_to_producer(ctx.registry(), &source.params, buffers, &counters);
    }

    /// Returns kept buffers until at most `limit` remain.
    fn release_kept(&mut self, ctx: &LinkContext, limit: usize) {
        let mut per_input: Vec<Vec<Buffer>> = self.inputs.iter().map(|_| Vec::new()).collect();
        while self.kept.len() > limit {
            let Some((input, buffer)) = self.kept.pop_front() else {
                break;
            };
            if let Some(bucket) = per_input.get_mut(input) {
                bucket.push(buffer);
            }
        }
        for (input, buffers) in per_input.into_iter().enumerate() {
            if !buffers.is_empty() {
                self.return_buffers(ctx, input, buffers);
            }
        }
    }

    /// Pulls and returns everything the producers still have queued.
    fn drain_producers(&self, ctx: &LinkContext) {
        for (index, input) in self.inputs.iter().enumerate() {
            let list = ctx.registry().get_full_buffers(input.params.prev_link, input.params.prev_queue);
            if list.is_empty() {
                continue;
            }
            input.held.checkout(&list);
            self.return_buffers(ctx, index, list.into_iter().collect());
        }
    }
}

impl LinkPlugin for NullSink {
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> {
        let config: NullSinkConfig = config_helpers::parse_config_optional(params.config.as_ref())?;
        if params.in_queues.is_empty() {
            return Err(FrameLinkError::Configuration("null_sink needs an input queue".to_string()));
        }
        let queues = graph_helpers::discover_inputs(ctx.registry(), &params.in_queues)?;

        let mut offset = 0;
        self.inputs = params
            .in_queues
            .iter()
            .zip(&queues)
            .map(|(params, queue)| {
                let input = Input { params: *params, channel_offset: offset, held: HeldBuffers::new() };
                offset += queue.num_channels();
                input
            })
            .collect();
        self.hold = config.hold;
        ctx.stats_mut().configure(offset);
        tracing::debug!(link_id = %ctx.id(), inputs = self.inputs.len(), hold = self.hold, "Null sink created");
        Ok(())
    }

    fn process(&mut self, ctx: &mut LinkContext) -> Result<()> {
        let now = now_us();
        for index in 0..self.inputs.len() {
            let (prev, offset) = {
                let input = &self.inputs[index];
                (input.params, input.channel_offset)
            };
            let mut list = ctx.registry().get_full_buffers(prev.prev_link, prev.prev_queue);
            if list.is_empty() {
                continue;
            }
            ctx.stats_mut().on_buffers_received();

            let double = self.inputs[index].held.checkout(&list);
            if double > 0 {
                LinkCounters::bump(&ctx.counters().in_buf_errors);
                tracing::warn!(link_id = %ctx.id(), double, "Producer handed out buffers already held");
            }

            for buffer in list.iter_mut() {
                let stats = ctx.stats_mut();
                stats.update_latency(buffer, now);
                buffer.link_local_timestamp = now;
                let channel = stats.channel(offset + buffer.channel_index());
                channel.received += 1;
                channel.processed += 1;
            }
            self.kept.extend(list.into_iter().map(|b| (index, b)));
        }

        self.release_kept(ctx, self.hold);
        Ok(())
    }

    fn control(
        &mut self,
        ctx: &mut LinkContext,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match name {
            "set_hold" => {
                let SetHold { hold } = serde_json::from_value(payload.clone())
                    .map_err(|e| FrameLinkError::Plugin(format!("set_hold: {e}")))?;
                self.hold = hold;
                self.release_kept(ctx, hold);
                Ok(serde_json::json!({ "hold": hold }))
            },
            "release_held" => {
                let released = self.kept.len();
                self.release_kept(ctx, 0);
                Ok(serde_json::json!({ "released": released }))
            },
            "held" => Ok(serde_json::json!({ "held": self.kept.len() })),
            other => Err(FrameLinkError::Plugin(format!("null_sink: unknown control '{other}'"))),
        }
    }

    fn stop(&mut self, ctx: &mut LinkContext) -> Result<()> {
        self.release_kept(ctx, 0);
        self.drain_producers(ctx);
        Ok(())
    }

    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> {
        self.release_kept(ctx, 0);
        self.inputs.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{buffer, context, services, ScriptedProducer};
    use framelink_core::LinkId;

    fn sink_params(hold: usize) -> CreateParams {
        CreateParams {
            in_queues: vec![InQueueParams { prev_link: LinkId(1), prev_queue: 0 }],
            out_queues: vec![],
            config: Some(serde_json::json!({ "hold": hold })),
        }
    }

    #[test]
    fn test_returns_everything_it_receives() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "null_sink");

        let mut sink = NullSink::new();
        sink.create(&mut ctx, &sink_params(0)).unwrap();
        for i in 0..3 {
            producer.offer(buffer(1, i, 0));
        }
        sink.process(&mut ctx).unwrap();

        assert_eq!(producer.returned_ids(), vec![0, 1, 2]);
        let snapshot = ctx.stats().snapshot();
        assert_eq!(snapshot.channels[0].received, 3);
        assert_eq!(snapshot.link_latency.count, 3);
    }

    #[test]
    fn test_hold_keeps_newest_and_stop_releases() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "null_sink");

        let mut sink = NullSink::new();
        sink.create(&mut ctx, &sink_params(2)).unwrap();
        for i in 0..5 {
            producer.offer(buffer(1, i, 0));
        }
        sink.process(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![0, 1, 2]);

        let held = sink.control(&mut ctx, "held", &serde_json::Value::Null).unwrap();
        assert_eq!(held["held"], 2);

        // Stop drains what is still queued upstream too.
        producer.offer(buffer(1, 5, 0));
        sink.stop(&mut ctx).unwrap();
        assert_eq!(producer.returned_ids(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(producer.pending(), 0);
    }

    #[test]
    fn test_set_hold_control() {
        let (services, _) = services();
        let producer = ScriptedProducer::new(1);
        let _prx = producer.install(&services, 1);
        let (mut ctx, _rx) = context(&services, 2, "null_sink");

        let mut sink = NullSink::new();
        sink.create(&mut ctx, &sink_params(4)).unwrap();
        for i in 0..4 {
            producer.offer(buffer(1, i, 0));
        }
        sink.process(&mut ctx).unwrap();
        assert!(producer.returned_ids().is_empty());

        sink.control(&mut ctx, "set_hold", &serde_json::json!({ "hold": 1 })).unwrap();
        assert_eq!(producer.returned_ids(), vec![0, 1, 2]);
        assert!(sink.control(&mut ctx, "bogus", &serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_missing_producer_is_configuration_error() {
        let (services, _) = services();
        let (mut ctx, _rx) = context(&services, 2, "null_sink");
        let err = NullSink::new().create(&mut ctx, &sink_params(0)).unwrap_err();
        assert!(matches!(err, FrameLinkError::Configuration(_)));
    }
}
