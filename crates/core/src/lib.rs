// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! FrameLink Core - the link/queue/IPC framework of the pipeline runtime.
//!
//! ## Core Modules
//!
//! - [`buffer`]: Buffers, buffer lists and payload descriptors
//! - [`queue`]: Per-link empty/full queue pools and held-buffer bookkeeping
//! - [`link`]: The buffer-exchange contract every link exposes
//! - [`registry`]: Process-wide link table with explicit init/teardown
//! - [`command`]: Link commands and coalescing mailboxes
//! - [`state`]: Link state machine and state updates
//! - [`plugin`]: Plugin contract, link context and plugin registry
//! - [`ipc`]: Shared-memory rings, slot tables and IPC channels
//! - [`notify`]: Edge-triggered notifications between links
//! - [`platform`]: Address translation and cache maintenance contract
//! - [`stats`]: Counters and latency tracking
//! - [`skip`]: Frame-rate reduction
//! - [`helpers`]: Configuration parsing and producer discovery
//! - [`error`]: Error types and handling
//!
//! ## Quick Start
//!
//! ```ignore
//! use framelink_core::plugin::{LinkContext, LinkPlugin, PluginRegistry};
//! use framelink_core::command::CreateParams;
//!
//! struct Passthrough;
//!
//! impl LinkPlugin for Passthrough {
//!     fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()> { /* ... */ }
//!     fn process(&mut self, ctx: &mut LinkContext) -> Result<()> { /* ... */ }
//!     fn stop(&mut self, ctx: &mut LinkContext) -> Result<()> { /* ... */ }
//!     fn delete(&mut self, ctx: &mut LinkContext) -> Result<()> { /* ... */ }
//! }
//!
//! let mut registry = PluginRegistry::new();
//! registry.register("passthrough", || Box::new(Passthrough), schema, vec![], "Forwards buffers");
//! ```

pub mod buffer;
pub mod command;
pub mod error;
pub mod helpers;
pub mod ipc;
pub mod link;
pub mod notify;
pub mod platform;
pub mod plugin;
pub mod queue;
pub mod registry;
pub mod skip;
pub mod state;
pub mod stats;
pub mod time;

// Error handling
pub use error::{Exhausted, FrameLinkError, Rejected, Result};

// Buffers and queues
pub use buffer::{Buffer, BufferBatch, BufferId, BufferList, BufferType, Payload, PayloadInfo};
pub use queue::{HeldBuffers, PoolCounts, QueueLayout, QueuePool, StrayBuffers};

// Link contract
pub use link::{ChannelInfo, InQueueParams, LinkId, LinkInfo, LinkInterface, OutQueueParams, QueueInfo};
pub use registry::LinkRegistry;

// Commands and lifecycle
pub use command::{
    ControlCommand, ControlReply, CreateParams, LinkCommand, Mailbox, MailboxReceiver,
};
pub use state::{LinkState, LinkStateUpdate};

// Plugins
pub use plugin::{LinkContext, LinkPlugin, LinkServices, PluginDefinition, PluginRegistry};

// Transport
pub use notify::NotifyHub;
pub use platform::{LocalAddr, OffsetMapping, PlatformMemory, SharedAddr};

// Statistics
pub use stats::{LatencyStats, LinkStatsCollector, LinkStatsSnapshot};

// Helper modules
pub use helpers::{config_helpers, graph_helpers};
pub use state::state_helpers;
