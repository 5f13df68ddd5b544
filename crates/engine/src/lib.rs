// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! engine: Runs FrameLink link graphs.
//!
//! Every link is a tokio task draining its own mailbox. A [`System`] owns the
//! registries, notification hub and IPC channels those tasks share, and a
//! [`Pipeline`] creates a compiled [`framelink_api::LinkGraph`] on top of it.

use framelink_core::{PluginDefinition, PluginRegistry, Result};
use std::sync::Arc;

// --- Public Modules ---

pub mod config;
pub mod constants;
pub mod handle;
pub mod pipeline;
pub mod system;

mod link_task;
mod metrics;

// Re-exports
pub use config::{ContextConfig, SystemConfig};
pub use handle::LinkHandle;
pub use pipeline::{Pipeline, PipelineLink};
pub use system::System;

// --- Engine Structs ---

/// The main Engine struct, which acts as a unified entry point.
/// It holds the link kinds known to the process and starts systems that use them.
#[derive(Debug, Clone)]
pub struct Engine {
    pub plugins: Arc<PluginRegistry>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates a new engine with every built-in link kind registered.
    pub fn new() -> Self {
        let mut plugins = PluginRegistry::new();
        framelink_links::register_links(&mut plugins);
        Self::with_plugins(plugins)
    }

    /// Creates an engine over an explicitly populated registry.
    pub fn with_plugins(plugins: PluginRegistry) -> Self {
        Self { plugins: Arc::new(plugins) }
    }

    /// Registered link kinds, sorted by kind.
    pub fn definitions(&self) -> Vec<PluginDefinition> {
        self.plugins.definitions()
    }

    /// Starts a system in the background runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured contexts are invalid.
    pub fn start_system(&self, config: SystemConfig) -> Result<System> {
        System::start(self.plugins.clone(), config)
    }
}

#[cfg(test)]
mod tests;
