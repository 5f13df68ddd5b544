// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! api: Pipeline definitions for FrameLink.
//!
//! A user writes a pipeline as YAML (see [`yaml`]); it compiles into a
//! [`LinkGraph`], the explicit form the engine assembles: numeric link ids,
//! resolved queues in both directions, topological order, and one IPC channel
//! per adapter pair.

use framelink_core::ipc::{IpcChannelConfig, IpcChannelId};
use framelink_core::{CreateParams, LinkId, LinkStatsSnapshot};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// YAML pipeline format compilation
pub mod yaml;

// Re-export types so client crates can use them
pub use framelink_core::{LinkState, PluginDefinition};

/// Execution context of links that do not name one.
pub const DEFAULT_CONTEXT: &str = "main";

/// One link of a compiled pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GraphLink {
    pub id: LinkId,
    /// User-facing name; generated for inserted IPC adapters.
    pub name: String,
    pub kind: String,
    /// Execution context the link runs in.
    pub context: String,
    /// Resolved CREATE parameters.
    pub params: CreateParams,
}

impl GraphLink {
    /// A link with no input queues.
    pub fn is_source(&self) -> bool {
        self.params.in_queues.is_empty()
    }
}

/// An IPC channel connecting an inserted adapter pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct IpcChannelSpec {
    pub id: IpcChannelId,
    pub out_link: LinkId,
    pub in_link: LinkId,
    pub config: IpcChannelConfig,
}

/// The explicit, engine-ready form of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LinkGraph {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Links in topological order: every producer precedes its consumers and
    /// every `ipc_out` precedes its `ipc_in`.
    pub links: Vec<GraphLink>,
    pub ipc_channels: Vec<IpcChannelSpec>,
}

impl LinkGraph {
    pub fn link(&self, name: &str) -> Option<&GraphLink> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn link_by_id(&self, id: LinkId) -> Option<&GraphLink> {
        self.links.iter().find(|l| l.id == id)
    }

    /// Distinct contexts in order of first appearance.
    pub fn contexts(&self) -> Vec<&str> {
        let mut contexts: Vec<&str> = Vec::new();
        for link in &self.links {
            if !contexts.contains(&link.context.as_str()) {
                contexts.push(&link.context);
            }
        }
        contexts
    }
}

/// Statistics of one link of a running pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LinkStatsEntry {
    pub name: String,
    pub context: String,
    pub state: LinkState,
    pub stats: LinkStatsSnapshot,
}

/// Statistics of every link of a running pipeline, in topological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PipelineStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub links: Vec<LinkStatsEntry>,
}

impl PipelineStats {
    pub fn link(&self, name: &str) -> Option<&LinkStatsEntry> {
        self.links.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::InQueueParams;

    fn link(id: u32, name: &str, context: &str, inputs: &[u32]) -> GraphLink {
        GraphLink {
            id: LinkId(id),
            name: name.to_string(),
            kind: "null_sink".to_string(),
            context: context.to_string(),
            params: CreateParams {
                in_queues: inputs
                    .iter()
                    .map(|&prev| InQueueParams { prev_link: LinkId(prev), prev_queue: 0 })
                    .collect(),
                ..CreateParams::default()
            },
        }
    }

    #[test]
    fn test_contexts_in_first_appearance_order() {
        let graph = LinkGraph {
            links: vec![link(1, "a", "dsp", &[]), link(2, "b", "main", &[1]), link(3, "c", "dsp", &[2])],
            ..LinkGraph::default()
        };
        assert_eq!(graph.contexts(), vec!["dsp", "main"]);
        assert!(graph.links[0].is_source());
        assert_eq!(graph.link("c").map(|l| l.id), Some(LinkId(3)));
        assert_eq!(graph.link_by_id(LinkId(2)).map(|l| l.name.as_str()), Some("b"));
    }
}
