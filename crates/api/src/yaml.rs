// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! YAML pipeline format parsing and compilation.
//!
//! ```yaml
//! name: two-context copy
//! ipc:
//!   ring_capacity: 9
//!   slots: 8
//! links:
//!   camera:
//!     kind: null_source
//!     context: capture
//!     params: { channels: 2 }
//!   copy:
//!     kind: frame_copy
//!     inputs: camera
//!   sink:
//!     kind: null_sink
//!     inputs: [{ link: copy, queue: 0 }]
//! ```
//!
//! Links are created in dependency order regardless of declaration order.
//! Every input edge whose producer runs in a different `context` than its
//! consumer is split by an `ipc_out`/`ipc_in` pair with its own IPC channel.

use super::{GraphLink, IpcChannelSpec, LinkGraph, DEFAULT_CONTEXT};
use framelink_core::ipc::{IpcChannelConfig, IpcChannelId};
use framelink_core::{CreateParams, InQueueParams, LinkId, OutQueueParams};
use indexmap::IndexMap;
use serde::Deserialize;

/// A reference to one output queue of another link.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InputRef {
    /// Just the link name; reads its queue 0.
    Link(String),
    /// Link name and output queue index.
    Queue {
        link: String,
        #[serde(default)]
        queue: usize,
    },
}

impl InputRef {
    fn link(&self) -> &str {
        match self {
            Self::Link(link) | Self::Queue { link, .. } => link,
        }
    }

    const fn queue(&self) -> usize {
        match self {
            Self::Link(_) => 0,
            Self::Queue { queue, .. } => *queue,
        }
    }
}

/// Represents the `inputs` field of a link.
#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
pub enum Inputs {
    #[default]
    None,
    Single(InputRef),
    Multiple(Vec<InputRef>),
}

impl Inputs {
    fn refs(&self) -> &[InputRef] {
        match self {
            Self::None => &[],
            Self::Single(input) => std::slice::from_ref(input),
            Self::Multiple(inputs) => inputs,
        }
    }
}

/// Represents a single link in a user-facing pipeline definition.
#[derive(Debug, Deserialize)]
pub struct UserLink {
    pub kind: String,
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub inputs: Inputs,
    pub context: Option<String>,
}

impl UserLink {
    fn context(&self) -> &str {
        self.context.as_deref().unwrap_or(DEFAULT_CONTEXT)
    }
}

/// The top-level structure for a user-facing pipeline definition.
#[derive(Debug, Deserialize)]
pub struct UserPipeline {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Sizing applied to every inserted IPC channel.
    #[serde(default)]
    pub ipc: IpcChannelConfig,
    pub links: IndexMap<String, UserLink>,
}

/// Parses and compiles a YAML pipeline.
///
/// # Errors
///
/// Returns an error if the YAML is malformed or the pipeline does not compile.
pub fn parse(yaml: &str) -> Result<LinkGraph, String> {
    let pipeline: UserPipeline =
        serde_saphyr::from_str(yaml).map_err(|e| format!("Invalid pipeline YAML: {e}"))?;
    compile(pipeline)
}

/// A link of the expanded graph, before ids are assigned.
struct Draft {
    name: String,
    kind: String,
    context: String,
    config: Option<serde_json::Value>,
    /// (producer draft index, producer queue) per input queue.
    inputs: Vec<(usize, usize)>,
    /// Drafts that must be created first although they feed no input.
    after: Option<usize>,
}

/// "Compiles" the user-facing pipeline format into the explicit graph the engine requires.
///
/// # Errors
///
/// Returns an error if a link references a non-existent input, if the inputs
/// form a cycle, or if an inserted adapter name collides with a user link.
pub fn compile(pipeline: UserPipeline) -> Result<LinkGraph, String> {
    let UserPipeline { name, description, ipc, links } = pipeline;
    if links.is_empty() {
        return Err("Pipeline defines no links".to_string());
    }
    if ipc.ring_capacity < 2 || ipc.slots == 0 {
        return Err(format!(
            "Invalid ipc sizing: ring_capacity {} (min 2), slots {} (min 1)",
            ipc.ring_capacity, ipc.slots
        ));
    }
    for (link_name, link) in &links {
        for input in link.inputs.refs() {
            if !links.contains_key(input.link()) {
                return Err(format!(
                    "Link '{link_name}' references non-existent link '{}' in 'inputs' field",
                    input.link()
                ));
            }
        }
    }
    detect_cycles(&links)?;

    let mut drafts: Vec<Draft> = links
        .iter()
        .map(|(link_name, link)| Draft {
            name: link_name.clone(),
            kind: link.kind.clone(),
            context: link.context().to_string(),
            config: link.params.clone(),
            inputs: Vec::new(),
            after: None,
        })
        .collect();

    let mut channels: Vec<(IpcChannelId, usize, usize)> = Vec::new();
    for (consumer, (consumer_name, link)) in links.iter().enumerate() {
        for input in link.inputs.refs() {
            let Some(producer) = links.get_index_of(input.link()) else {
                continue;
            };
            if drafts[producer].context == drafts[consumer].context {
                drafts[consumer].inputs.push((producer, input.queue()));
                continue;
            }

            let next_id = u32::try_from(channels.len() + 1)
                .map_err(|_| "Too many IPC channels".to_string())?;
            let channel = IpcChannelId(next_id);
            let prefix = format!("{}->{consumer_name}", input.link());
            let out_context = drafts[producer].context.clone();
            let in_context = drafts[consumer].context.clone();
            let out_index = drafts.len();
            drafts.push(Draft {
                name: format!("{prefix}.ipc_out"),
                kind: "ipc_out".to_string(),
                context: out_context,
                config: Some(serde_json::json!({ "channel": channel })),
                inputs: vec![(producer, input.queue())],
                after: None,
            });
            let in_index = drafts.len();
            drafts.push(Draft {
                name: format!("{prefix}.ipc_in"),
                kind: "ipc_in".to_string(),
                context: in_context,
                config: Some(serde_json::json!({ "channel": channel })),
                inputs: Vec::new(),
                after: Some(out_index),
            });
            drafts[consumer].inputs.push((in_index, 0));
            channels.push((channel, out_index, in_index));
        }
    }

    for inserted in &drafts[links.len()..] {
        if links.contains_key(&inserted.name) {
            return Err(format!("Link name '{}' is reserved for an inserted IPC adapter", inserted.name));
        }
    }

    let order = topological_order(&drafts)?;
    let mut ids = vec![LinkId(0); drafts.len()];
    for (position, &index) in order.iter().enumerate() {
        let id = u32::try_from(position + 1).map_err(|_| "Too many links".to_string())?;
        ids[index] = LinkId(id);
    }

    // Consumers of each producer queue, in consumer declaration order.
    let mut out_queues: Vec<Vec<OutQueueParams>> = vec![Vec::new(); drafts.len()];
    for (consumer, draft) in drafts.iter().enumerate() {
        for &(producer, queue) in &draft.inputs {
            let queues = &mut out_queues[producer];
            if queues.len() <= queue {
                queues.resize_with(queue + 1, OutQueueParams::default);
            }
            queues[queue].next_links.push(ids[consumer]);
        }
    }

    let mut graph_links = Vec::with_capacity(drafts.len());
    for &index in &order {
        let draft = &mut drafts[index];
        graph_links.push(GraphLink {
            id: ids[index],
            name: std::mem::take(&mut draft.name),
            kind: std::mem::take(&mut draft.kind),
            context: std::mem::take(&mut draft.context),
            params: CreateParams {
                in_queues: draft
                    .inputs
                    .iter()
                    .map(|&(producer, queue)| InQueueParams {
                        prev_link: ids[producer],
                        prev_queue: queue,
                    })
                    .collect(),
                out_queues: std::mem::take(&mut out_queues[index]),
                config: draft.config.take(),
            },
        });
    }

    let ipc_channels = channels
        .into_iter()
        .map(|(id, out_index, in_index)| IpcChannelSpec {
            id,
            out_link: ids[out_index],
            in_link: ids[in_index],
            config: ipc,
        })
        .collect();

    Ok(LinkGraph { name, description, links: graph_links, ipc_channels })
}

/// Kahn's algorithm, always taking the earliest-declared ready draft.
fn topological_order(drafts: &[Draft]) -> Result<Vec<usize>, String> {
    let deps: Vec<Vec<usize>> = drafts
        .iter()
        .map(|d| d.inputs.iter().map(|&(p, _)| p).chain(d.after).collect())
        .collect();
    let mut placed = vec![false; drafts.len()];
    let mut order = Vec::with_capacity(drafts.len());

    while order.len() < drafts.len() {
        let next = (0..drafts.len()).find(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]));
        let Some(next) = next else {
            let stuck: Vec<&str> =
                (0..drafts.len()).filter(|&i| !placed[i]).map(|i| drafts[i].name.as_str()).collect();
            return Err(format!("Circular dependency detected involving: {}", stuck.join(", ")));
        };
        placed[next] = true;
        order.push(next);
    }
    Ok(order)
}

/// Detect cycles in the input graph using DFS.
///
/// Returns an error message describing the cycle if one is found.
fn detect_cycles(user_links: &IndexMap<String, UserLink>) -> Result<(), String> {
    use std::collections::HashSet;

    // Returns the cycle description if one is found
    fn dfs<'a>(
        link: &'a str,
        adjacency: &IndexMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        cycle_path: &mut Vec<&'a str>,
    ) -> Option<String> {
        visited.insert(link);
        rec_stack.insert(link);
        cycle_path.push(link);

        if let Some(neighbors) = adjacency.get(link) {
            for &neighbor in neighbors {
                if !visited.contains(neighbor) {
                    if let Some(cycle) = dfs(neighbor, adjacency, visited, rec_stack, cycle_path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(neighbor) {
                    let start = cycle_path.iter().position(|&n| n == neighbor).unwrap_or(0);
                    return Some(format!(
                        "Circular dependency detected: {} -> {neighbor}",
                        cycle_path[start..].join(" -> ")
                    ));
                }
            }
        }

        rec_stack.remove(link);
        cycle_path.pop();
        None
    }

    // Edge: producer -> consumer (data flow direction)
    let mut adjacency: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for (link_name, link) in user_links {
        adjacency.entry(link_name.as_str()).or_default();
        for input in link.inputs.refs() {
            if let Some((key, _)) = user_links.get_key_value(input.link()) {
                adjacency.entry(key.as_str()).or_default().push(link_name.as_str());
            }
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut rec_stack: HashSet<&str> = HashSet::new();
    let mut cycle_path: Vec<&str> = Vec::new();

    for link_name in user_links.keys() {
        if !visited.contains(link_name.as_str()) {
            if let Some(cycle) =
                dfs(link_name, &adjacency, &mut visited, &mut rec_stack, &mut cycle_path)
            {
                return Err(cycle);
            }
        }
    }

    Ok(())
}
