// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The uniform buffer-exchange contract every link exposes.
//!
//! Adjacent links talk through [`LinkInterface`] only, so a consumer never needs to
//! know what its producer computes. Within one address space this is a direct
//! call-through; across contexts the IPC adapters stand in for the remote link.

use crate::buffer::{BufferList, BufferType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

/// Maximum output queues per link.
pub const MAX_OUT_QUEUES: usize = 4;

/// Maximum input queues per link.
pub const MAX_IN_QUEUES: usize = 8;

/// Maximum channels carried by one output queue.
pub const MAX_CHANNELS_PER_QUEUE: usize = 16;

/// Identifier of a link instance.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
    TS,
)]
#[ts(export)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Geometry and type of one channel of an output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct ChannelInfo {
    pub buf_type: BufferType,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

/// Channels exposed by one output queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct QueueInfo {
    pub channels: Vec<ChannelInfo>,
}

impl QueueInfo {
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }
}

/// What a link exposes to its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct LinkInfo {
    pub queues: Vec<QueueInfo>,
}

impl LinkInfo {
    pub fn single(queue: QueueInfo) -> Self {
        Self { queues: vec![queue] }
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, index: usize) -> Option<&QueueInfo> {
        self.queues.get(index)
    }
}

/// Names a producer's output queue feeding one of this link's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct InQueueParams {
    pub prev_link: LinkId,
    #[serde(default)]
    pub prev_queue: usize,
}

/// Consumers of one of this link's output queues.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct OutQueueParams {
    #[serde(default)]
    pub next_links: Vec<LinkId>,
}

/// Buffer-exchange callbacks a link registers under its id.
///
/// Implementations must never block: `get_full_buffers` returns an empty list when
/// nothing is ready and `put_empty_buffers` holds its locks only for O(1) work per
/// buffer.
pub trait LinkInterface: Send + Sync {
    /// Takes every ready buffer (up to one list) from output queue `queue`.
    fn get_full_buffers(&self, queue: usize) -> BufferList;

    /// Hands consumed buffers back to the producer.
    fn put_empty_buffers(&self, queue: usize, buffers: BufferList);

    /// Output queue layout.
    fn get_info(&self) -> LinkInfo;
}
