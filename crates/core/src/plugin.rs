// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The plugin contract and plugin registry.
//!
//! A plugin supplies the "what to compute" of a link; the link task supplies the
//! lifecycle. Every entry point is synchronous and must not block: buffer pulls
//! return "none available" instead of waiting.
//!
//! - [`LinkPlugin`]: entry points invoked by the link task
//! - [`LinkContext`]: what a plugin may touch while it runs
//! - [`PluginRegistry`]: plugin kinds registered at startup

use crate::command::{CreateParams, Mailbox};
use crate::error::{FrameLinkError, Result};
use crate::ipc::IpcChannelTable;
use crate::link::{LinkId, LinkInterface};
use crate::notify::NotifyHub;
use crate::platform::PlatformMemory;
use crate::queue::PoolCounts;
use crate::registry::LinkRegistry;
use crate::stats::{LinkCounters, LinkStatsCollector};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use ts_rs::TS;

/// Entry points of a link kind.
pub trait LinkPlugin: Send {
    /// Validates parameters, discovers producers, allocates buffers and publishes
    /// the link's interface with [`LinkContext::attach_interface`].
    ///
    /// # Errors
    ///
    /// `Configuration` for invalid parameters. The task calls [`LinkPlugin::delete`]
    /// and stays IDLE.
    fn create(&mut self, ctx: &mut LinkContext, params: &CreateParams) -> Result<()>;

    /// One processing pass: drain everything available, then notify consumers.
    ///
    /// # Errors
    ///
    /// Errors are logged and counted; they never stop the link.
    fn process(&mut self, ctx: &mut LinkContext) -> Result<()>;

    /// Handles buffers returned across a context boundary.
    ///
    /// # Errors
    ///
    /// `Protocol` for malformed returns.
    fn release(&mut self, _ctx: &mut LinkContext) -> Result<()> {
        Ok(())
    }

    /// Plugin-specific control command.
    ///
    /// # Errors
    ///
    /// `Plugin` for unknown commands or bad payloads.
    fn control(
        &mut self,
        _ctx: &mut LinkContext,
        name: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(FrameLinkError::Plugin(format!("unsupported control command '{name}'")))
    }

    /// Leaves no buffer docked for processing.
    ///
    /// # Errors
    ///
    /// Logged; the link is STOPPED regardless.
    fn stop(&mut self, ctx: &mut LinkContext) -> Result<()>;

    /// Releases every buffer and queue.
    ///
    /// # Errors
    ///
    /// Logged; the link is IDLE regardless.
    fn delete(&mut self, ctx: &mut LinkContext) -> Result<()>;

    /// Periodic processing interval, for sources and polling adapters.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Census of the link's own buffer pool.
    fn census(&self) -> Option<PoolCounts> {
        None
    }
}

/// Builds a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn LinkPlugin> + Send + Sync>;

/// Serializable description of a registered plugin kind.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct PluginDefinition {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[ts(type = "JsonValue")]
    pub param_schema: serde_json::Value,
    /// Hierarchical categories, e.g. `["ipc"]`.
    pub categories: Vec<String>,
}

#[derive(Clone)]
struct PluginInfo {
    factory: PluginFactory,
    param_schema: serde_json::Value,
    description: Option<String>,
    categories: Vec<String>,
}

/// Link kinds known to the system. Populated once at startup.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    info: BTreeMap<String, PluginInfo>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("kinds", &self.info.keys()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `kind`, replacing an existing registration.
    pub fn register<F>(
        &mut self,
        kind: &str,
        factory: F,
        param_schema: serde_json::Value,
        categories: Vec<String>,
        description: impl Into<String>,
    ) where
        F: Fn() -> Box<dyn LinkPlugin> + Send + Sync + 'static,
    {
        if self.info.contains_key(kind) {
            tracing::warn!(kind, "Replacing registered link kind");
        }
        self.info.insert(
            kind.to_string(),
            PluginInfo {
                factory: Arc::new(factory),
                param_schema,
                description: Some(description.into()),
                categories,
            },
        );
    }

    /// # Errors
    ///
    /// `Configuration` if `kind` is not registered.
    pub fn create(&self, kind: &str) -> Result<Box<dyn LinkPlugin>> {
        self.info
            .get(kind)
            .map(|info| (info.factory)())
            .ok_or_else(|| FrameLinkError::Configuration(format!("link kind '{kind}' not found")))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.info.contains_key(kind)
    }

    pub fn unregister(&mut self, kind: &str) -> bool {
        self.info.remove(kind).is_some()
    }

    /// Definitions sorted by kind.
    pub fn definitions(&self) -> Vec<PluginDefinition> {
        self.info
            .iter()
            .map(|(kind, info)| PluginDefinition {
                kind: kind.clone(),
                description: info.description.clone(),
                param_schema: info.param_schema.clone(),
                categories: info.categories.clone(),
            })
            .collect()
    }
}

/// Services shared by every link of one execution context.
#[derive(Clone)]
pub struct LinkServices {
    pub registry: LinkRegistry,
    pub notify: NotifyHub,
    pub ipc: Arc<IpcChannelTable>,
    pub platform: Arc<dyn PlatformMemory>,
}

impl std::fmt::Debug for LinkServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkServices").field("platform", &self.platform).finish_non_exhaustive()
    }
}

/// What a plugin may touch while one of its entry points runs.
#[derive(Debug)]
pub struct LinkContext {
    id: LinkId,
    kind: String,
    services: LinkServices,
    mailbox: Mailbox,
    stats: LinkStatsCollector,
}

impl LinkContext {
    pub fn new(id: LinkId, kind: impl Into<String>, services: LinkServices, mailbox: Mailbox) -> Self {
        let kind = kind.into();
        let stats = LinkStatsCollector::new(id, kind.clone(), Arc::new(LinkCounters::default()));
        Self { id, kind, services, mailbox, stats }
    }

    pub const fn id(&self) -> LinkId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub const fn registry(&self) -> &LinkRegistry {
        &self.services.registry
    }

    pub const fn notify_hub(&self) -> &NotifyHub {
        &self.services.notify
    }

    pub const fn ipc(&self) -> &Arc<IpcChannelTable> {
        &self.services.ipc
    }

    pub const fn platform(&self) -> &Arc<dyn PlatformMemory> {
        &self.services.platform
    }

    /// This link's own mailbox, for wiring notification callbacks.
    pub const fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub const fn stats(&self) -> &LinkStatsCollector {
        &self.stats
    }

    pub const fn stats_mut(&mut self) -> &mut LinkStatsCollector {
        &mut self.stats
    }

    /// Counters shared with the link's interface.
    pub fn counters(&self) -> Arc<LinkCounters> {
        self.stats.counters().clone()
    }

    /// Wakes each consumer in `links` once. Unknown links are logged and skipped.
    pub fn notify_links(&self, links: &[LinkId]) {
        for &link in links {
            if let Err(e) = self.services.registry.notify_new_data(link) {
                tracing::debug!(link_id = %self.id, next_link = %link, error = %e, "Consumer not notified");
            }
        }
    }

    /// Publishes this link's buffer-exchange interface.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if the link is not registered.
    pub fn attach_interface(&self, interface: Arc<dyn LinkInterface>) -> Result<()> {
        self.services.registry.attach(self.id, interface)
    }

    pub fn detach_interface(&self) -> Option<Arc<dyn LinkInterface>> {
        self.services.registry.detach(self.id)
    }
}
