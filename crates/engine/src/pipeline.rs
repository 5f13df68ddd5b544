// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Pipeline assembly from a compiled [`LinkGraph`].
//!
//! Links are CREATEd in topological order so every consumer can discover its
//! producers. The first failure deletes everything created so far and is
//! returned to the caller with the offending link named in the message.

use crate::handle::LinkHandle;
use crate::system::System;
use framelink_api::{LinkGraph, LinkStatsEntry, PipelineStats};
use framelink_core::ipc::IpcChannelId;
use framelink_core::{FrameLinkError, LinkId, Result};

/// One link of an assembled pipeline.
#[derive(Debug, Clone)]
pub struct PipelineLink {
    pub name: String,
    pub is_source: bool,
    pub handle: LinkHandle,
}

/// A pipeline whose links have all been created.
#[derive(Debug)]
pub struct Pipeline {
    name: Option<String>,
    /// Topological order.
    links: Vec<PipelineLink>,
    channels: Vec<IpcChannelId>,
}

/// Prefixes an error message with the link it came from.
fn annotate(error: FrameLinkError, link: &str) -> FrameLinkError {
    match error {
        FrameLinkError::Configuration(msg) => FrameLinkError::Configuration(format!("link '{link}': {msg}")),
        FrameLinkError::Protocol(msg) => FrameLinkError::Protocol(format!("link '{link}': {msg}")),
        FrameLinkError::Plugin(msg) => FrameLinkError::Plugin(format!("link '{link}': {msg}")),
        FrameLinkError::Runtime(msg) => FrameLinkError::Runtime(format!("link '{link}': {msg}")),
        other => other,
    }
}

impl Pipeline {
    /// Spawns and creates every link of `graph`.
    ///
    /// # Errors
    ///
    /// The first spawn or CREATE error, after everything created so far has
    /// been deleted again.
    pub async fn assemble(system: &System, graph: &LinkGraph) -> Result<Self> {
        let mut pipeline = Self { name: graph.name.clone(), links: Vec::new(), channels: Vec::new() };
        match pipeline.build(system, graph).await {
            Ok(()) => {
                tracing::info!(
                    pipeline = graph.name.as_deref(),
                    links = pipeline.links.len(),
                    ipc_channels = pipeline.channels.len(),
                    contexts = ?graph.contexts(),
                    "Pipeline assembled"
                );
                Ok(pipeline)
            },
            Err(e) => {
                tracing::error!(pipeline = graph.name.as_deref(), error = %e, "Pipeline assembly failed");
                if let Err(cleanup) = pipeline.teardown(system).await {
                    tracing::warn!(error = %cleanup, "Rollback after failed assembly was incomplete");
                }
                Err(e)
            },
        }
    }

    async fn build(&mut self, system: &System, graph: &LinkGraph) -> Result<()> {
        for spec in &graph.ipc_channels {
            system.create_ipc_channel(spec)?;
            self.channels.push(spec.id);
        }

        for link in &graph.links {
            let handle = system
                .spawn_link(&link.context, link.id, &link.kind)
                .map_err(|e| annotate(e, &link.name))?;
            self.links.push(PipelineLink { name: link.name.clone(), is_source: link.is_source(), handle });
        }

        for (link, entry) in graph.links.iter().zip(&self.links) {
            entry.handle.create(link.params.clone()).await.map_err(|e| annotate(e, &link.name))?;
        }
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Links in creation order.
    pub fn links(&self) -> &[PipelineLink] {
        &self.links
    }

    pub fn link(&self, name: &str) -> Option<&LinkHandle> {
        self.links.iter().find(|l| l.name == name).map(|l| &l.handle)
    }

    pub fn link_by_id(&self, id: LinkId) -> Option<&PipelineLink> {
        self.links.iter().find(|l| l.handle.id() == id)
    }

    /// Stops sources first, then every other link in creation order, so
    /// consumers drain what their producers queued last.
    ///
    /// # Errors
    ///
    /// The first stop error; every link is still asked to stop.
    pub async fn stop(&self) -> Result<()> {
        let ordered = self.links.iter().filter(|l| l.is_source).chain(self.links.iter().filter(|l| !l.is_source));
        let mut first_error = None;
        for link in ordered {
            if let Err(e) = link.handle.stop().await {
                tracing::warn!(link = %link.name, error = %e, "Stop failed");
                first_error.get_or_insert(annotate(e, &link.name));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deletes every link in reverse creation order, then removes the link
    /// tasks and IPC channels from the system.
    ///
    /// # Errors
    ///
    /// The first delete error; every link is still deleted.
    pub async fn delete(mut self, system: &System) -> Result<()> {
        let result = self.teardown(system).await;
        tracing::info!(pipeline = self.name.as_deref(), "Pipeline deleted");
        result
    }

    async fn teardown(&mut self, system: &System) -> Result<()> {
        let mut first_error = None;
        for link in self.links.iter().rev() {
            if let Err(e) = link.handle.delete().await {
                tracing::warn!(link = %link.name, error = %e, "Delete failed");
                first_error.get_or_insert(annotate(e, &link.name));
            }
        }
        for link in self.links.drain(..) {
            if let Err(e) = system.remove_link(link.handle.id()).await {
                tracing::debug!(link = %link.name, error = %e, "Link already removed");
            }
        }
        for channel in self.channels.drain(..) {
            system.remove_ipc_channel(channel);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn collect(&self, reset_latency: Option<bool>) -> Result<PipelineStats> {
        let mut links = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let stats = match reset_latency {
                Some(reset) => link.handle.print_statistics(reset).await,
                None => link.handle.statistics().await,
            }
            .map_err(|e| annotate(e, &link.name))?;
            links.push(LinkStatsEntry {
                name: link.name.clone(),
                context: link.handle.context().to_string(),
                state: link.handle.state().await?,
                stats,
            });
        }
        Ok(PipelineStats { name: self.name.clone(), links })
    }

    /// Statistics snapshots of every link, in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if a link task has shut down.
    pub async fn statistics(&self) -> Result<PipelineStats> {
        self.collect(None).await
    }

    /// Logs every link's statistics and returns the snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error if a link task has shut down.
    pub async fn print_statistics(&self, reset_latency: bool) -> Result<PipelineStats> {
        self.collect(Some(reset_latency)).await
    }
}
