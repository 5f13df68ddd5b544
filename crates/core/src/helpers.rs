// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Utility functions shared by link plugins.
//!
//! - [`config_helpers`]: Parse link configuration from JSON values
//! - [`graph_helpers`]: Producer discovery and buffer return at queue boundaries

use crate::error::FrameLinkError;

/// Helper functions for parsing link configuration from JSON values.
pub mod config_helpers {
    use super::FrameLinkError;
    use serde::Deserialize;

    /// Parses configuration from an optional JSON value, using defaults if not provided.
    ///
    /// # Errors
    ///
    /// Returns `FrameLinkError::Configuration` if a value is provided but does not parse.
    pub fn parse_config_optional<T>(params: Option<&serde_json::Value>) -> Result<T, FrameLinkError>
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match params {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| FrameLinkError::Configuration(format!("Failed to parse config: {e}"))),
        }
    }

    /// Parses configuration from an optional JSON value, returning an error if not provided.
    ///
    /// # Errors
    ///
    /// Returns `FrameLinkError::Configuration` if `params` is `None` or if deserialization fails.
    pub fn parse_config_required<T>(params: Option<&serde_json::Value>) -> Result<T, FrameLinkError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = params
            .ok_or_else(|| FrameLinkError::Configuration("Configuration required".to_string()))?
            .clone();
        serde_json::from_value(value)
            .map_err(|e| FrameLinkError::Configuration(format!("Failed to parse config: {e}")))
    }
}

/// Producer discovery and buffer return.
pub mod graph_helpers {
    use crate::buffer::{Buffer, BufferList};
    use crate::error::{FrameLinkError, Result};
    use crate::link::{InQueueParams, QueueInfo, MAX_CHANNELS_PER_QUEUE, MAX_IN_QUEUES};
    use crate::registry::LinkRegistry;
    use crate::stats::LinkCounters;

    /// Queries each producer's `get_info` and returns the layout of the named
    /// output queues, in input order.
    ///
    /// # Errors
    ///
    /// `Configuration` when a producer is missing, a queue index is out of range,
    /// a queue carries too many channels, or more than [`MAX_IN_QUEUES`] inputs
    /// are declared.
    pub fn discover_inputs(
        registry: &LinkRegistry,
        in_queues: &[InQueueParams],
    ) -> Result<Vec<QueueInfo>> {
        if in_queues.len() > MAX_IN_QUEUES {
            return Err(FrameLinkError::Configuration(format!(
                "{} input queues declared, at most {MAX_IN_QUEUES} supported",
                in_queues.len()
            )));
        }

        in_queues
            .iter()
            .map(|input| {
                let info = registry.get_info(input.prev_link).map_err(|_| {
                    FrameLinkError::Configuration(format!(
                        "previous link {} is not created",
                        input.prev_link
                    ))
                })?;
                let queue = info.queue(input.prev_queue).cloned().ok_or_else(|| {
                    FrameLinkError::Configuration(format!(
                        "previous link {} has {} output queues, queue {} requested",
                        input.prev_link,
                        info.num_queues(),
                        input.prev_queue
                    ))
                })?;
                if queue.num_channels() > MAX_CHANNELS_PER_QUEUE {
                    return Err(FrameLinkError::Configuration(format!(
                        "previous link {} queue {} exposes {} channels, at most {MAX_CHANNELS_PER_QUEUE} supported",
                        input.prev_link,
                        input.prev_queue,
                        queue.num_channels()
                    )));
                }
                Ok(queue)
            })
            .collect()
    }

    /// Requires exactly `expected` input queues.
    ///
    /// # Errors
    ///
    /// `Configuration` on a count mismatch.
    pub fn expect_inputs(in_queues: &[InQueueParams], expected: usize, kind: &str) -> Result<()> {
        if in_queues.len() == expected {
            Ok(())
        } else {
            Err(FrameLinkError::Configuration(format!(
                "{kind} needs {expected} input queue(s), {} declared",
                in_queues.len()
            )))
        }
    }

    /// Hands `buffers` back to the producer of `input`. A missing producer is
    /// counted as an output-buffer error; the buffers are dropped with it.
    pub fn return_to_producer(
        registry: &LinkRegistry,
        input: &InQueueParams,
        buffers: BufferList,
        counters: &LinkCounters,
    ) {
        if buffers.is_empty() {
            return;
        }
        if let Err(rejected) = registry.put_empty_buffers(input.prev_link, input.prev_queue, buffers) {
            LinkCounters::bump(&counters.out_buf_errors);
            tracing::warn!(
                prev_link = %input.prev_link,
                buffers = rejected.item.len(),
                error = %rejected.error,
                "Producer gone, returned buffers dropped"
            );
        }
    }

    /// Hands any number of buffers back to the producer of `input`, one list at a time.
    pub fn return_all_to_producer(
        registry: &LinkRegistry,
        input: &InQueueParams,
        buffers: impl IntoIterator<Item = Buffer>,
        counters: &LinkCounters,
    ) {
        let mut list = BufferList::new();
        for buffer in buffers {
            if let Err(rejected) = list.push(buffer) {
                return_to_producer(registry, input, std::mem::take(&mut list), counters);
                let _ = list.push(rejected.into_inner());
            }
        }
        return_to_producer(registry, input, list, counters);
    }
}

#[cfg(test)]
mod tests {
    use super::config_helpers::*;
    use super::graph_helpers::*;
    use crate::command::Mailbox;
    use crate::link::{InQueueParams, LinkId, LinkInterface, LinkInfo, QueueInfo, ChannelInfo};
    use crate::registry::LinkRegistry;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        depth: usize,
    }

    #[test]
    fn test_optional_config_defaults_and_rejects_garbage() {
        let parsed: Sample = parse_config_optional(None).unwrap_or_default();
        assert_eq!(parsed, Sample::default());
        let parsed: Sample =
            parse_config_optional(Some(&serde_json::json!({ "depth": 3 }))).unwrap_or_default();
        assert_eq!(parsed.depth, 3);
        assert!(parse_config_optional::<Sample>(Some(&serde_json::json!({ "depth": "x" }))).is_err());
        assert!(parse_config_required::<Sample>(None).is_err());
    }

    struct TwoChannels;

    impl LinkInterface for TwoChannels {
        fn get_full_buffers(&self, _queue: usize) -> crate::buffer::BufferList {
            crate::buffer::BufferList::new()
        }

        fn put_empty_buffers(&self, _queue: usize, _buffers: crate::buffer::BufferList) {}

        fn get_info(&self) -> LinkInfo {
            LinkInfo::single(QueueInfo { channels: vec![ChannelInfo::default(); 2] })
        }
    }

    #[test]
    fn test_discover_inputs_validates_queue_index() {
        let registry = LinkRegistry::new();
        assert!(registry.init().is_ok());
        let (mailbox, _rx) = Mailbox::channel(LinkId(1), 1);
        assert!(registry.register(LinkId(1), "src", mailbox).is_ok());
        assert!(registry.attach(LinkId(1), Arc::new(TwoChannels)).is_ok());

        let ok = discover_inputs(&registry, &[InQueueParams { prev_link: LinkId(1), prev_queue: 0 }]);
        assert_eq!(ok.map(|q| q[0].num_channels()).ok(), Some(2));

        let bad_queue =
            discover_inputs(&registry, &[InQueueParams { prev_link: LinkId(1), prev_queue: 1 }]);
        assert!(bad_queue.is_err());

        let missing =
            discover_inputs(&registry, &[InQueueParams { prev_link: LinkId(7), prev_queue: 0 }]);
        assert!(missing.is_err());

        assert!(expect_inputs(&[], 1, "null_sink").is_err());
    }
}
