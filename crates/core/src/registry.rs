// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide link registry.
//!
//! Maps a [`LinkId`] to the link's mailbox and, while the link is created, to its
//! [`LinkInterface`]. Adjacent links use the call-through helpers here to exchange
//! buffers without knowing each other's implementation.
//!
//! The table has an explicit `init`/`teardown` lifecycle; every lookup fails with
//! `LinkNotFound` outside it. The table lock is never held while calling into a link.

use crate::buffer::BufferList;
use crate::command::{LinkCommand, Mailbox};
use crate::error::{FrameLinkError, Result};
use crate::link::{LinkId, LinkInfo, LinkInterface};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct LinkEntry {
    kind: String,
    mailbox: Mailbox,
    interface: Option<Arc<dyn LinkInterface>>,
}

type Table = Option<HashMap<LinkId, LinkEntry>>;

/// Shared handle to the link table.
#[derive(Clone, Default)]
pub struct LinkRegistry {
    table: Arc<RwLock<Table>>,
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry").field("links", &self.link_ids()).finish()
    }
}

impl LinkRegistry {
    /// Creates an uninitialized registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Option<RwLockReadGuard<'_, Table>> {
        self.table.read().map_err(|_| tracing::error!("link registry poisoned")).ok()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>> {
        self.table.write().map_err(|_| FrameLinkError::Runtime("link registry poisoned".to_string()))
    }

    /// Opens the table. Calling it twice keeps existing entries.
    ///
    /// # Errors
    ///
    /// `Runtime` if the lock is poisoned.
    pub fn init(&self) -> Result<()> {
        let mut table = self.write()?;
        if table.is_none() {
            *table = Some(HashMap::new());
        }
        Ok(())
    }

    /// Drops every entry and closes the table.
    pub fn teardown(&self) {
        if let Ok(mut table) = self.write() {
            let count = table.as_ref().map_or(0, HashMap::len);
            *table = None;
            tracing::debug!(links = count, "Link registry torn down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.read().is_some_and(|t| t.is_some())
    }

    /// Registers a link's mailbox under `id`.
    ///
    /// # Errors
    ///
    /// `Runtime` before `init`, `Configuration` if `id` is taken.
    pub fn register(&self, id: LinkId, kind: &str, mailbox: Mailbox) -> Result<()> {
        let mut guard = self.write()?;
        let table = guard
            .as_mut()
            .ok_or_else(|| FrameLinkError::Runtime("link registry not initialized".to_string()))?;
        if table.contains_key(&id) {
            return Err(FrameLinkError::Configuration(format!("link id {id} already registered")));
        }
        table.insert(id, LinkEntry { kind: kind.to_string(), mailbox, interface: None });
        Ok(())
    }

    pub fn unregister(&self, id: LinkId) {
        if let Ok(mut table) = self.write() {
            if let Some(table) = table.as_mut() {
                table.remove(&id);
            }
        }
    }

    /// Publishes the buffer-exchange interface of a created link.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if `id` is not registered.
    pub fn attach(&self, id: LinkId, interface: Arc<dyn LinkInterface>) -> Result<()> {
        let mut table = self.write()?;
        let entry = table
            .as_mut()
            .and_then(|t| t.get_mut(&id))
            .ok_or(FrameLinkError::LinkNotFound(id))?;
        entry.interface = Some(interface);
        Ok(())
    }

    /// Withdraws a link's interface. Returns it so the caller controls when it drops.
    pub fn detach(&self, id: LinkId) -> Option<Arc<dyn LinkInterface>> {
        let mut table = self.write().ok()?;
        table.as_mut().and_then(|t| t.get_mut(&id)).and_then(|e| e.interface.take())
    }

    /// # Errors
    ///
    /// `LinkNotFound` if `id` is not registered or not created.
    pub fn interface(&self, id: LinkId) -> Result<Arc<dyn LinkInterface>> {
        self.read()
            .and_then(|t| t.as_ref().and_then(|t| t.get(&id)).and_then(|e| e.interface.clone()))
            .ok_or(FrameLinkError::LinkNotFound(id))
    }

    /// # Errors
    ///
    /// `LinkNotFound` if `id` is not registered.
    pub fn mailbox(&self, id: LinkId) -> Result<Mailbox> {
        self.read()
            .and_then(|t| t.as_ref().and_then(|t| t.get(&id)).map(|e| e.mailbox.clone()))
            .ok_or(FrameLinkError::LinkNotFound(id))
    }

    pub fn kind(&self, id: LinkId) -> Option<String> {
        self.read().and_then(|t| t.as_ref().and_then(|t| t.get(&id)).map(|e| e.kind.clone()))
    }

    /// Registered ids in ascending order.
    pub fn link_ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> =
            self.read().and_then(|t| t.as_ref().map(|t| t.keys().copied().collect())).unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Pulls ready buffers from `id`'s output queue `queue`. Empty when the link is
    /// not created.
    pub fn get_full_buffers(&self, id: LinkId, queue: usize) -> BufferList {
        match self.interface(id) {
            Ok(interface) => interface.get_full_buffers(queue),
            Err(_) => BufferList::new(),
        }
    }

    /// Returns consumed buffers to their producer.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if the producer is gone; the buffers are handed back.
    pub fn put_empty_buffers(
        &self,
        id: LinkId,
        queue: usize,
        buffers: BufferList,
    ) -> std::result::Result<(), crate::error::Rejected<BufferList>> {
        match self.interface(id) {
            Ok(interface) => {
                interface.put_empty_buffers(queue, buffers);
                Ok(())
            },
            Err(error) => Err(crate::error::Rejected::new(error, buffers)),
        }
    }

    /// # Errors
    ///
    /// `LinkNotFound` if `id` is not registered or not created.
    pub fn get_info(&self, id: LinkId) -> Result<LinkInfo> {
        Ok(self.interface(id)?.get_info())
    }

    /// Sends a command without waiting.
    ///
    /// # Errors
    ///
    /// `LinkNotFound`, or `Runtime` when the mailbox is full or closed.
    pub fn send_command(&self, id: LinkId, command: LinkCommand) -> Result<()> {
        self.mailbox(id)?.try_send(command)
    }

    /// Wakes `id` with a coalesced NEW_DATA.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if `id` is not registered.
    pub fn notify_new_data(&self, id: LinkId) -> Result<bool> {
        Ok(self.mailbox(id)?.notify_new_data())
    }
}
