// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Public client handle for commanding a running link task.

use framelink_core::{
    ControlCommand, ControlReply, CreateParams, FrameLinkError, LinkCommand, LinkId, LinkState,
    LinkStatsSnapshot, Mailbox, Result,
};
use tokio::sync::oneshot;

/// A handle to communicate with one link task.
///
/// Cloning is cheap; every clone feeds the same mailbox.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: LinkId,
    kind: String,
    context: String,
    mailbox: Mailbox,
}

impl LinkHandle {
    pub(crate) fn new(id: LinkId, kind: &str, context: &str, mailbox: Mailbox) -> Self {
        Self { id, kind: kind.to_string(), context: context.to_string(), mailbox }
    }

    pub const fn id(&self) -> LinkId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    async fn request<T>(
        &self,
        command: LinkCommand,
        response_rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.mailbox.send(command).await?;
        response_rx
            .await
            .map_err(|_| FrameLinkError::Runtime(format!("link {} dropped its reply", self.id)))
    }

    /// Sends CREATE and waits for the outcome.
    ///
    /// # Errors
    ///
    /// The plugin's CREATE error (typically `Configuration`), `Protocol` if the
    /// link is not idle, or `Runtime` if the link task has shut down.
    pub async fn create(&self, params: CreateParams) -> Result<()> {
        let (ack, response_rx) = oneshot::channel();
        self.request(LinkCommand::Create { params, ack }, response_rx).await?
    }

    /// Sends STOP and waits for it. Stopping a stopped link is a no-op.
    ///
    /// # Errors
    ///
    /// The plugin's stop error, or `Runtime` if the link task has shut down.
    pub async fn stop(&self) -> Result<()> {
        let (ack, response_rx) = oneshot::channel();
        self.request(LinkCommand::Stop { ack: Some(ack) }, response_rx).await?
    }

    /// Sends DELETE and waits for it. A running link is stopped first.
    ///
    /// # Errors
    ///
    /// The plugin's stop/delete error, or `Runtime` if the link task has shut down.
    pub async fn delete(&self) -> Result<()> {
        let (ack, response_rx) = oneshot::channel();
        self.request(LinkCommand::Delete { ack: Some(ack) }, response_rx).await?
    }

    /// # Errors
    ///
    /// Returns an error if the link task has shut down or the command fails.
    pub async fn control(&self, command: ControlCommand) -> Result<ControlReply> {
        let (ack, response_rx) = oneshot::channel();
        self.request(LinkCommand::Control { command, ack }, response_rx).await?
    }

    /// Sends a plugin-specific control command.
    ///
    /// # Errors
    ///
    /// `Protocol` unless the link is running, the plugin's error otherwise.
    pub async fn plugin_control(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        match self.control(ControlCommand::Plugin { name: name.to_string(), payload }).await? {
            ControlReply::Value(value) => Ok(value),
            ControlReply::Done => Ok(serde_json::Value::Null),
            ControlReply::Statistics(_) => {
                Err(FrameLinkError::Protocol(format!("link {} answered with statistics", self.id)))
            },
        }
    }

    /// Gets the current statistics of the link. Answered in any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the link task has shut down.
    pub async fn statistics(&self) -> Result<LinkStatsSnapshot> {
        self.expect_statistics(ControlCommand::Statistics).await
    }

    /// Logs the link's statistics and returns the snapshot that was logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the link task has shut down.
    pub async fn print_statistics(&self, reset_latency: bool) -> Result<LinkStatsSnapshot> {
        self.expect_statistics(ControlCommand::PrintStatistics { reset_latency }).await
    }

    async fn expect_statistics(&self, command: ControlCommand) -> Result<LinkStatsSnapshot> {
        match self.control(command).await? {
            ControlReply::Statistics(snapshot) => Ok(*snapshot),
            other => Err(FrameLinkError::Protocol(format!(
                "link {} answered a statistics query with {other:?}",
                self.id
            ))),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the link task has shut down.
    pub async fn state(&self) -> Result<LinkState> {
        let (ack, response_rx) = oneshot::channel();
        self.request(LinkCommand::QueryState { ack }, response_rx).await
    }

    /// Requests a processing pass, coalesced with one already pending.
    pub fn notify_new_data(&self) -> bool {
        self.mailbox.notify_new_data()
    }

    /// Wake-ups that were dropped because one was already pending.
    pub fn coalesced(&self) -> u64 {
        self.mailbox.coalesced()
    }
}
