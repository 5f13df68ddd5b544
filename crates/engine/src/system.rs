// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The system: explicit lifecycle for every process-wide table.
//!
//! A [`System`] owns, per execution context, a link registry and a platform
//! mapping, plus the notification hub and IPC channel table the contexts share.
//! Links are spawned into a context as tasks; teardown cancels every task, lets
//! each run its DELETE, then tears the tables down.

use crate::config::SystemConfig;
use crate::constants::{
    DEFAULT_LINK_EXIT_TIMEOUT, DEFAULT_MAILBOX_CAPACITY, DEFAULT_STATE_CHANNEL_CAPACITY,
    DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY,
};
use crate::handle::LinkHandle;
use crate::link_task::LinkTask;
use crate::metrics::EngineMetrics;
use framelink_api::IpcChannelSpec;
use framelink_core::ipc::{IpcChannel, IpcChannelId, IpcChannelTable};
use framelink_core::{
    FrameLinkError, LinkContext, LinkId, LinkRegistry, LinkServices, LinkStateUpdate, LocalAddr,
    Mailbox, NotifyHub, OffsetMapping, PlatformMemory, PluginRegistry, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<LinkStateUpdate>>>>;

struct SpawnedLink {
    context: String,
    handle: LinkHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A running set of execution contexts and their link tasks.
pub struct System {
    plugins: Arc<PluginRegistry>,
    notify: NotifyHub,
    ipc: Arc<IpcChannelTable>,
    contexts: RwLock<HashMap<String, LinkServices>>,
    links: Mutex<HashMap<LinkId, SpawnedLink>>,
    state_tx: mpsc::Sender<LinkStateUpdate>,
    subscribers: Subscribers,
    fanout: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    fanout_cancel: CancellationToken,
    cancel: CancellationToken,
    metrics: EngineMetrics,
    mailbox_capacity: usize,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("contexts", &self.context_names())
            .field("links", &self.link_ids())
            .field("ipc_channels", &self.ipc.len())
            .finish_non_exhaustive()
    }
}

/// Forwards link state updates to every live subscriber.
async fn fan_out_states(
    mut state_rx: mpsc::Receiver<LinkStateUpdate>,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    let forward = |update: &LinkStateUpdate| {
        if let Ok(mut subscribers) = subscribers.lock() {
            subscribers.retain(|tx| match tx.try_send(update.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    };

    loop {
        tokio::select! {
            biased;
            Some(update) = state_rx.recv() => forward(&update),
            () = cancel.cancelled() => break,
        }
    }
    // Updates emitted by the final DELETEs.
    while let Ok(update) = state_rx.try_recv() {
        forward(&update);
    }
}

impl System {
    /// Starts a system and creates the configured contexts.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Configuration` if two configured contexts share a name.
    pub fn start(plugins: Arc<PluginRegistry>, config: SystemConfig) -> Result<Self> {
        let (state_tx, state_rx) =
            mpsc::channel(config.state_capacity.unwrap_or(DEFAULT_STATE_CHANNEL_CAPACITY));
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let fanout_cancel = CancellationToken::new();
        let fanout = tokio::spawn(fan_out_states(state_rx, subscribers.clone(), fanout_cancel.clone()));

        let mailbox_capacity = config.mailbox_capacity.unwrap_or(DEFAULT_MAILBOX_CAPACITY);
        tracing::info!(
            mailbox_capacity,
            mailbox_capacity_source =
                if config.mailbox_capacity.is_some() { "config" } else { "default" },
            contexts = config.contexts.len(),
            ipc_region_base = config.ipc_region_base,
            "Starting FrameLink system"
        );

        let system = Self {
            plugins,
            notify: NotifyHub::new(),
            ipc: Arc::new(IpcChannelTable::new(LocalAddr(config.ipc_region_base))),
            contexts: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            state_tx,
            subscribers,
            fanout: tokio::sync::Mutex::new(Some(fanout)),
            fanout_cancel,
            cancel: CancellationToken::new(),
            metrics: EngineMetrics::new(),
            mailbox_capacity,
            shutdown_timeout: config.shutdown_timeout,
        };
        for context in &config.contexts {
            system.add_context(
                &context.name,
                Arc::new(OffsetMapping::new(context.local_base, context.shared_base)),
            )?;
        }
        Ok(system)
    }

    pub const fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub const fn notify_hub(&self) -> &NotifyHub {
        &self.notify
    }

    pub const fn ipc(&self) -> &Arc<IpcChannelTable> {
        &self.ipc
    }

    /// Number of links currently running.
    pub fn running_links(&self) -> u64 {
        self.metrics.running()
    }

    /// Adds an execution context with its own registry and address mapping.
    ///
    /// # Errors
    ///
    /// `Configuration` if the context exists, `Runtime` if the system is shut down.
    pub fn add_context(&self, name: &str, platform: Arc<dyn PlatformMemory>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FrameLinkError::Runtime("system is shut down".to_string()));
        }
        let mut contexts = self
            .contexts
            .write()
            .map_err(|_| FrameLinkError::Runtime("context table poisoned".to_string()))?;
        if contexts.contains_key(name) {
            return Err(FrameLinkError::Configuration(format!("context '{name}' already exists")));
        }

        let registry = LinkRegistry::new();
        registry.init()?;
        tracing::debug!(context = name, ?platform, "Context added");
        contexts.insert(
            name.to_string(),
            LinkServices { registry, notify: self.notify.clone(), ipc: self.ipc.clone(), platform },
        );
        Ok(())
    }

    /// Services of `name`, if the context exists.
    pub fn context(&self, name: &str) -> Option<LinkServices> {
        self.contexts.read().ok().and_then(|c| c.get(name).cloned())
    }

    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.contexts.read().map(|c| c.keys().cloned().collect()).unwrap_or_default();
        names.sort();
        names
    }

    /// Services of `name`, creating an identity-mapped context on first use.
    fn services(&self, name: &str) -> Result<LinkServices> {
        if let Some(services) = self.context(name) {
            return Ok(services);
        }
        match self.add_context(name, Arc::new(OffsetMapping::identity())) {
            Ok(()) | Err(FrameLinkError::Configuration(_)) => {},
            Err(e) => return Err(e),
        }
        self.context(name)
            .ok_or_else(|| FrameLinkError::Runtime(format!("context '{name}' vanished")))
    }

    /// Spawns an idle link task of `kind` in `context` under `id`.
    ///
    /// # Errors
    ///
    /// `Configuration` for unknown kinds or ids already in use, `Runtime` if the
    /// system is shut down.
    pub fn spawn_link(&self, context: &str, id: LinkId, kind: &str) -> Result<LinkHandle> {
        if self.cancel.is_cancelled() {
            return Err(FrameLinkError::Runtime("system is shut down".to_string()));
        }
        let plugin = self.plugins.create(kind)?;
        let services = self.services(context)?;

        let mut links =
            self.links.lock().map_err(|_| FrameLinkError::Runtime("link table poisoned".to_string()))?;
        if links.contains_key(&id) {
            return Err(FrameLinkError::Configuration(format!("link id {id} already in use")));
        }

        let (mailbox, rx) = Mailbox::channel(id, self.mailbox_capacity);
        services.registry.register(id, kind, mailbox.clone())?;
        let ctx = LinkContext::new(id, kind, services, mailbox.clone());
        let cancel = self.cancel.child_token();
        let task = LinkTask::new(
            plugin,
            self.plugins.clone(),
            ctx,
            rx,
            self.state_tx.clone(),
            cancel.clone(),
            self.metrics.clone(),
        );
        let handle = LinkHandle::new(id, kind, context, mailbox);
        links.insert(
            id,
            SpawnedLink {
                context: context.to_string(),
                handle: handle.clone(),
                cancel,
                task: tokio::spawn(task.run()),
            },
        );
        tracing::debug!(link_id = %id, kind, context, "Link task spawned");
        Ok(handle)
    }

    pub fn link(&self, id: LinkId) -> Option<LinkHandle> {
        self.links.lock().ok().and_then(|l| l.get(&id).map(|s| s.handle.clone()))
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> =
            self.links.lock().map(|l| l.keys().copied().collect()).unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Cancels a link task, waits for it to run its DELETE, and unregisters it.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if no such link was spawned.
    pub async fn remove_link(&self, id: LinkId) -> Result<()> {
        let spawned = self
            .links
            .lock()
            .ok()
            .and_then(|mut l| l.remove(&id))
            .ok_or(FrameLinkError::LinkNotFound(id))?;
        spawned.cancel.cancel();

        match tokio::time::timeout(DEFAULT_LINK_EXIT_TIMEOUT, spawned.task).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::error!(link_id = %id, error = %e, "Link task panicked"),
            Err(_) => tracing::warn!(link_id = %id, "Link task did not exit in time"),
        }
        if let Some(services) = self.context(&spawned.context) {
            services.registry.unregister(id);
        }
        Ok(())
    }

    /// Creates the IPC channel of an adapter pair.
    ///
    /// # Errors
    ///
    /// `Configuration` if the id is taken or the sizing is invalid.
    pub fn create_ipc_channel(&self, spec: &IpcChannelSpec) -> Result<Arc<IpcChannel>> {
        self.ipc.create(Some(spec.id), &spec.config, spec.out_link, spec.in_link)
    }

    pub fn remove_ipc_channel(&self, id: IpcChannelId) -> bool {
        self.ipc.remove(id).is_some()
    }

    /// Subscribes to link state updates.
    /// Returns a receiver that will receive all subsequent state changes.
    pub fn subscribe_state(&self) -> mpsc::Receiver<LinkStateUpdate> {
        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Cancels every link task, waits for their DELETEs and tears down the
    /// registries, the notification hub and the IPC channel table.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A link task panicked during shutdown
    /// - The tasks fail to finish within the shutdown timeout
    #[allow(clippy::cognitive_complexity)]
    pub async fn shutdown_and_wait(&self) -> std::result::Result<(), String> {
        let already_down = self.cancel.is_cancelled();
        self.cancel.cancel();

        let spawned: Vec<(LinkId, SpawnedLink)> =
            self.links.lock().map(|mut l| l.drain().collect()).unwrap_or_default();
        let link_count = spawned.len();
        let joins = futures::future::join_all(
            spawned.into_iter().map(|(id, link)| async move { (id, link.task.await) }),
        );

        let result = match tokio::time::timeout(self.shutdown_timeout, joins).await {
            Ok(results) => {
                let panicked: Vec<LinkId> =
                    results.into_iter().filter(|(_, r)| r.is_err()).map(|(id, _)| id).collect();
                if panicked.is_empty() {
                    tracing::debug!(links = link_count, "Link tasks shut down gracefully");
                    Ok(())
                } else {
                    tracing::error!(?panicked, "Link tasks panicked during shutdown");
                    Err(format!("{} link task(s) panicked", panicked.len()))
                }
            },
            Err(_) => {
                tracing::warn!(timeout = ?self.shutdown_timeout, "Link tasks did not shut down in time");
                Err("System shutdown timeout".to_string())
            },
        };

        if let Ok(contexts) = self.contexts.read() {
            for services in contexts.values() {
                services.registry.teardown();
            }
        }
        self.notify.clear();
        self.ipc.clear();

        self.fanout_cancel.cancel();
        let fanout = self.fanout.lock().await.take();
        if let Some(fanout) = fanout {
            let _ = fanout.await;
        } else if already_down {
            tracing::warn!("shutdown_and_wait called multiple times, system already shut down");
        }

        if !already_down {
            tracing::info!(links = link_count, "FrameLink system shut down");
        }
        result
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.fanout_cancel.cancel();
    }
}
