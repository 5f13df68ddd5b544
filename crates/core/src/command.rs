// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Link commands and the per-link mailbox.
//!
//! Every link has one bounded mailbox consumed by its own task, one command at a
//! time, in arrival order. NEW_DATA and RELEASE are coalesced with a pending flag:
//! while one is queued and unprocessed, further requests are dropped, since a
//! processing pass always drains everything available.

use crate::error::{FrameLinkError, Result};
use crate::link::{InQueueParams, LinkId, OutQueueParams};
use crate::state::LinkState;
use crate::stats::LinkStatsSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use ts_rs::TS;

/// Parameters of a CREATE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CreateParams {
    #[serde(default)]
    pub in_queues: Vec<InQueueParams>,
    #[serde(default)]
    pub out_queues: Vec<OutQueueParams>,
    /// Plugin-specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "JsonValue")]
    pub config: Option<serde_json::Value>,
}

impl CreateParams {
    /// Consumers of every output queue, deduplicated, in declaration order.
    pub fn next_links(&self) -> Vec<LinkId> {
        let mut links = Vec::new();
        for id in self.out_queues.iter().flat_map(|q| q.next_links.iter().copied()) {
            if !links.contains(&id) {
                links.push(id);
            }
        }
        links
    }

    /// Producers of every input queue, deduplicated, in declaration order.
    pub fn prev_links(&self) -> Vec<LinkId> {
        let mut links = Vec::new();
        for id in self.in_queues.iter().map(|q| q.prev_link) {
            if !links.contains(&id) {
                links.push(id);
            }
        }
        links
    }
}

/// Payload of a CONTROL command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Log a statistics snapshot.
    PrintStatistics {
        #[serde(default)]
        reset_latency: bool,
    },
    /// Return a statistics snapshot.
    Statistics,
    /// Plugin-specific command.
    Plugin {
        name: String,
        #[serde(default)]
        #[ts(type = "JsonValue")]
        payload: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ControlReply {
    Done,
    Statistics(Box<LinkStatsSnapshot>),
    Value(#[ts(type = "JsonValue")] serde_json::Value),
}

/// A command processed by a link task.
#[derive(Debug)]
pub enum LinkCommand {
    Create { params: CreateParams, ack: oneshot::Sender<Result<()>> },
    /// A producer has buffers ready, or a forward ring is non-empty.
    NewData,
    /// Buffers returned across a context boundary are waiting.
    Release,
    Control { command: ControlCommand, ack: oneshot::Sender<Result<ControlReply>> },
    QueryState { ack: oneshot::Sender<LinkState> },
    Stop { ack: Option<oneshot::Sender<Result<()>>> },
    Delete { ack: Option<oneshot::Sender<Result<()>>> },
}

impl LinkCommand {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::NewData => "new_data",
            Self::Release => "release",
            Self::Control { .. } => "control",
            Self::QueryState { .. } => "query_state",
            Self::Stop { .. } => "stop",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Default)]
struct PendingFlags {
    new_data: AtomicBool,
    release: AtomicBool,
    coalesced: AtomicU64,
}

/// Sending side of a link's mailbox.
#[derive(Debug, Clone)]
pub struct Mailbox {
    link: LinkId,
    tx: mpsc::Sender<LinkCommand>,
    pending: Arc<PendingFlags>,
}

/// Receiving side of a link's mailbox, owned by the link task.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<LinkCommand>,
    pending: Arc<PendingFlags>,
}

impl Mailbox {
    /// Creates a mailbox holding at most `capacity` commands.
    pub fn channel(link: LinkId, capacity: usize) -> (Self, MailboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(PendingFlags::default());
        (Self { link, tx, pending: pending.clone() }, MailboxReceiver { rx, pending })
    }

    pub const fn link(&self) -> LinkId {
        self.link
    }

    /// Requests a processing pass. Never blocks; safe from notification context.
    ///
    /// Returns false if the request was coalesced into one already pending.
    pub fn notify_new_data(&self) -> bool {
        self.enqueue_coalesced(&self.pending.new_data, LinkCommand::NewData)
    }

    /// Requests a release pass. Never blocks; safe from notification context.
    pub fn notify_release(&self) -> bool {
        self.enqueue_coalesced(&self.pending.release, LinkCommand::Release)
    }

    fn enqueue_coalesced(&self, flag: &AtomicBool, command: LinkCommand) -> bool {
        if flag.swap(true, Ordering::AcqRel) {
            self.pending.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                flag.store(false, Ordering::Release);
                tracing::debug!(link_id = %self.link, error = %e, "Wake-up not delivered");
                false
            },
        }
    }

    /// Wake-ups dropped because one was already pending.
    pub fn coalesced(&self) -> u64 {
        self.pending.coalesced.load(Ordering::Relaxed)
    }

    /// # Errors
    ///
    /// `Runtime` if the link task has exited.
    pub async fn send(&self, command: LinkCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| {
            FrameLinkError::Runtime(format!("mailbox of link {} is closed", self.link))
        })
    }

    /// # Errors
    ///
    /// `Runtime` if the mailbox is full or closed.
    pub fn try_send(&self, command: LinkCommand) -> Result<()> {
        self.tx.try_send(command).map_err(|e| {
            FrameLinkError::Runtime(format!("mailbox of link {}: {e}", self.link))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl MailboxReceiver {
    /// Waits for the next command, clearing the pending flag of a coalesced one.
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        let command = self.rx.recv().await?;
        Some(self.clear_pending(command))
    }

    /// Takes the next command if one is queued.
    pub fn try_recv(&mut self) -> Option<LinkCommand> {
        let command = self.rx.try_recv().ok()?;
        Some(self.clear_pending(command))
    }

    fn clear_pending(&self, command: LinkCommand) -> LinkCommand {
        match command {
            LinkCommand::NewData => self.pending.new_data.store(false, Ordering::Release),
            LinkCommand::Release => self.pending.release.store(false, Ordering::Release),
            _ => {},
        }
        command
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_data_coalesces_until_received() {
        let (mailbox, mut rx) = Mailbox::channel(LinkId(1), 8);
        assert!(mailbox.notify_new_data());
        assert!(!mailbox.notify_new_data());
        assert!(!mailbox.notify_new_data());
        assert!(mailbox.notify_release());
        assert_eq!(mailbox.coalesced(), 2);

        let Some(LinkCommand::NewData) = rx.recv().await else {
            panic!("expected NewData");
        };
        // Flag cleared on receipt, so the next wake-up is queued again.
        assert!(mailbox.notify_new_data());

        let Some(LinkCommand::Release) = rx.recv().await else {
            panic!("expected Release");
        };
        let Some(LinkCommand::NewData) = rx.recv().await else {
            panic!("expected second NewData");
        };
    }

    #[tokio::test]
    async fn test_full_mailbox_does_not_leave_flag_stuck() {
        let (mailbox, mut rx) = Mailbox::channel(LinkId(2), 1);
        assert!(mailbox.try_send(LinkCommand::Stop { ack: None }).is_ok());
        assert!(!mailbox.notify_new_data());

        let Some(LinkCommand::Stop { .. }) = rx.recv().await else {
            panic!("expected Stop");
        };
        assert!(mailbox.notify_new_data());
    }

    #[test]
    fn test_next_and_prev_links_deduplicate() {
        let params = CreateParams {
            in_queues: vec![
                InQueueParams { prev_link: LinkId(1), prev_queue: 0 },
                InQueueParams { prev_link: LinkId(1), prev_queue: 1 },
                InQueueParams { prev_link: LinkId(2), prev_queue: 0 },
            ],
            out_queues: vec![
                OutQueueParams { next_links: vec![LinkId(5), LinkId(6)] },
                OutQueueParams { next_links: vec![LinkId(5)] },
            ],
            config: None,
        };
        assert_eq!(params.prev_links(), vec![LinkId(1), LinkId(2)]);
        assert_eq!(params.next_links(), vec![LinkId(5), LinkId(6)]);
    }

    #[test]
    fn test_control_command_json_shape() {
        let json = serde_json::json!({ "type": "plugin", "name": "on" });
        let Ok(ControlCommand::Plugin { name, payload }) = serde_json::from_value(json) else {
            panic!("plugin command should parse");
        };
        assert_eq!(name, "on");
        assert!(payload.is_null());
    }
}
