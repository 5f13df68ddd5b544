// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Edge-triggered, content-free notifications between links.
//!
//! A notification carries no payload and may stand for any backlog, so a receiver
//! must always drain until empty. Callbacks run on the raiser's thread and must
//! only check state and enqueue a coalesced command; they must never block.

use crate::error::{FrameLinkError, Result};
use crate::link::LinkId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A notification handler registered for one link.
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

/// Process-wide notification table.
#[derive(Clone, Default)]
pub struct NotifyHub {
    callbacks: Arc<RwLock<HashMap<LinkId, NotifyCallback>>>,
    raised: Arc<AtomicU64>,
}

impl std::fmt::Debug for NotifyHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self.callbacks.read().map_or(0, |c| c.len());
        f.debug_struct("NotifyHub")
            .field("registered", &registered)
            .field("raised", &self.raised())
            .finish()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `callback` for `link`, replacing any previous one.
    pub fn register_notify(&self, link: LinkId, callback: NotifyCallback) {
        match self.callbacks.write() {
            Ok(mut callbacks) => {
                callbacks.insert(link, callback);
            },
            Err(_) => tracing::error!(link_id = %link, "notify table poisoned, callback dropped"),
        }
    }

    pub fn unregister(&self, link: LinkId) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.remove(&link);
        }
    }

    pub fn is_registered(&self, link: LinkId) -> bool {
        self.callbacks.read().is_ok_and(|c| c.contains_key(&link))
    }

    /// Wakes `peer`. The table lock is released before the callback runs.
    ///
    /// # Errors
    ///
    /// `LinkNotFound` if nothing is registered for `peer`.
    pub fn raise_notify(&self, peer: LinkId) -> Result<()> {
        let callback = self
            .callbacks
            .read()
            .ok()
            .and_then(|c| c.get(&peer).cloned())
            .ok_or(FrameLinkError::LinkNotFound(peer))?;
        self.raised.fetch_add(1, Ordering::Relaxed);
        callback();
        Ok(())
    }

    /// Total notifications delivered.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_raise_runs_registered_callback() {
        let hub = NotifyHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        hub.register_notify(
            LinkId(2),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(hub.raise_notify(LinkId(2)).is_ok());
        assert!(hub.raise_notify(LinkId(2)).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(hub.raised(), 2);
    }

    #[test]
    fn test_raise_unknown_peer_fails() {
        let hub = NotifyHub::new();
        assert_eq!(hub.raise_notify(LinkId(9)), Err(FrameLinkError::LinkNotFound(LinkId(9))));
    }

    #[test]
    fn test_callback_may_reenter_hub() {
        // A callback that raises another link must not deadlock on the table lock.
        let hub = NotifyHub::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        hub.register_notify(
            LinkId(1),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let inner = hub.clone();
        hub.register_notify(
            LinkId(0),
            Arc::new(move || {
                let _ = inner.raise_notify(LinkId(1));
            }),
        );

        assert!(hub.raise_notify(LinkId(0)).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        hub.unregister(LinkId(1));
        assert!(!hub.is_registered(LinkId(1)));
        hub.clear();
        assert!(!hub.is_registered(LinkId(0)));
    }
}
