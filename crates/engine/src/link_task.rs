// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-link task: one mailbox, one worker, one state machine.
//!
//! Commands are processed one at a time in arrival order. A command that is not
//! legal in the current state is acknowledged as a no-op and counted; stray
//! wake-ups are expected while a STOP races a producer's last notification.

use crate::metrics::EngineMetrics;
use framelink_core::state::state_helpers;
use framelink_core::{
    ControlCommand, ControlReply, CreateParams, FrameLinkError, LinkCommand, LinkContext,
    LinkPlugin, LinkState, LinkStateUpdate, LinkStatsSnapshot, MailboxReceiver, PluginRegistry,
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct LinkTask {
    plugin: Box<dyn LinkPlugin>,
    plugins: Arc<PluginRegistry>,
    ctx: LinkContext,
    rx: MailboxReceiver,
    state: LinkState,
    ticker: Option<Interval>,
    state_tx: mpsc::Sender<LinkStateUpdate>,
    cancel: CancellationToken,
    metrics: EngineMetrics,
    coalesced_seen: u64,
}

/// Resolves on the next tick, or never when the link has no ticker.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => std::future::pending().await,
    }
}

fn make_ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

impl LinkTask {
    pub(crate) fn new(
        plugin: Box<dyn LinkPlugin>,
        plugins: Arc<PluginRegistry>,
        ctx: LinkContext,
        rx: MailboxReceiver,
        state_tx: mpsc::Sender<LinkStateUpdate>,
        cancel: CancellationToken,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            plugin,
            plugins,
            ctx,
            rx,
            state: LinkState::Idle,
            ticker: None,
            state_tx,
            cancel,
            metrics,
            coalesced_seen: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(link_id = %self.ctx.id(), kind = %self.ctx.kind(), "Link task started");
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command);
                },
                () = next_tick(&mut self.ticker) => self.on_tick(),
            }
        }

        if self.state != LinkState::Idle {
            if let Err(e) = self.delete() {
                tracing::warn!(link_id = %self.ctx.id(), error = %e, "Delete during shutdown failed");
            }
        }
        self.rx.close();
        tracing::debug!(link_id = %self.ctx.id(), "Link task exited");
    }

    fn handle(&mut self, command: LinkCommand) {
        self.metrics.record_command(self.ctx.kind(), command.name());
        match command {
            LinkCommand::Create { params, ack } => {
                let _ = ack.send(self.create(&params));
            },
            LinkCommand::NewData => self.on_new_data(),
            LinkCommand::Release => self.on_release(),
            LinkCommand::Control { command, ack } => {
                let _ = ack.send(self.control(command));
            },
            LinkCommand::QueryState { ack } => {
                let _ = ack.send(self.state);
            },
            LinkCommand::Stop { ack } => {
                let result = self.stop();
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            },
            LinkCommand::Delete { ack } => {
                let result = self.delete();
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            },
        }

        let coalesced = self.ctx.mailbox().coalesced();
        self.metrics.record_coalesced(self.ctx.kind(), coalesced.saturating_sub(self.coalesced_seen));
        self.coalesced_seen = coalesced;
    }

    fn transition(&mut self, to: LinkState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.metrics.record_transition(self.ctx.kind(), from, to);
        state_helpers::emit_state(&self.state_tx, self.ctx.id(), to);
        tracing::debug!(link_id = %self.ctx.id(), %from, %to, "Link state changed");
    }

    /// Counts and logs a command that has no effect in the current state.
    fn stray(&mut self, command: &'static str) {
        self.ctx.stats_mut().record_stray();
        tracing::trace!(link_id = %self.ctx.id(), command, state = %self.state, "Ignoring command");
    }

    fn create(&mut self, params: &CreateParams) -> Result<()> {
        if self.state != LinkState::Idle {
            self.stray("create");
            tracing::warn!(link_id = %self.ctx.id(), state = %self.state, "CREATE on a link that is not idle");
            return Err(FrameLinkError::Protocol(format!(
                "link {} is {}, CREATE needs idle",
                self.ctx.id(),
                self.state
            )));
        }

        self.ctx.stats_mut().reset();
        self.ctx.stats_mut().restart();
        match self.plugin.create(&mut self.ctx, params) {
            Ok(()) => {
                self.ticker = self.plugin.tick_interval().map(make_ticker);
                self.transition(LinkState::Running);
                tracing::info!(
                    link_id = %self.ctx.id(),
                    kind = %self.ctx.kind(),
                    inputs = params.in_queues.len(),
                    outputs = params.out_queues.len(),
                    "Link created"
                );
                Ok(())
            },
            Err(e) => {
                tracing::warn!(link_id = %self.ctx.id(), kind = %self.ctx.kind(), error = %e, "CREATE failed");
                if let Err(cleanup) = self.plugin.delete(&mut self.ctx) {
                    tracing::debug!(link_id = %self.ctx.id(), error = %cleanup, "Cleanup after failed CREATE");
                }
                self.ctx.detach_interface();
                self.renew_plugin();
                Err(e)
            },
        }
    }

    fn process(&mut self) {
        if let Err(e) = self.plugin.process(&mut self.ctx) {
            if e.is_recoverable() {
                tracing::trace!(link_id = %self.ctx.id(), error = %e, "Processing hit exhaustion");
            } else {
                tracing::warn!(link_id = %self.ctx.id(), error = %e, "Processing pass failed");
            }
        }
    }

    fn on_new_data(&mut self) {
        if self.state != LinkState::Running {
            self.stray("new_data");
            return;
        }
        self.ctx.stats_mut().record_new_data();
        self.process();
    }

    fn on_tick(&mut self) {
        if self.state == LinkState::Running {
            self.process();
        } else {
            self.ticker = None;
        }
    }

    fn on_release(&mut self) {
        if self.state != LinkState::Running {
            self.stray("release");
            return;
        }
        self.ctx.stats_mut().record_release();
        if let Err(e) = self.plugin.release(&mut self.ctx) {
            tracing::warn!(link_id = %self.ctx.id(), error = %e, "Release pass failed");
        }
    }

    fn snapshot(&self) -> LinkStatsSnapshot {
        let mut snapshot = self.ctx.stats().snapshot();
        snapshot.buffers = self.plugin.census().map(Into::into);
        snapshot
    }

    fn control(&mut self, command: ControlCommand) -> Result<ControlReply> {
        match command {
            ControlCommand::Statistics => Ok(ControlReply::Statistics(Box::new(self.snapshot()))),
            ControlCommand::PrintStatistics { reset_latency } => {
                let mut snapshot = self.ctx.stats_mut().print(reset_latency);
                snapshot.buffers = self.plugin.census().map(Into::into);
                if let Some(buffers) = snapshot.buffers {
                    tracing::info!(
                        link_id = %self.ctx.id(),
                        allocated = buffers.allocated,
                        empty = buffers.empty,
                        full = buffers.full,
                        outstanding = buffers.outstanding(),
                        "Buffer census"
                    );
                }
                Ok(ControlReply::Statistics(Box::new(snapshot)))
            },
            ControlCommand::Plugin { name, payload } => {
                if self.state != LinkState::Running {
                    self.stray("control");
                    return Err(FrameLinkError::Protocol(format!(
                        "link {} is {}, '{name}' needs running",
                        self.ctx.id(),
                        self.state
                    )));
                }
                self.plugin.control(&mut self.ctx, &name, &payload).map(ControlReply::Value)
            },
        }
    }

    fn stop(&mut self) -> Result<()> {
        match self.state {
            LinkState::Running => {
                self.ticker = None;
                let result = self.plugin.stop(&mut self.ctx);
                if let Err(e) = &result {
                    tracing::warn!(link_id = %self.ctx.id(), error = %e, "Plugin stop failed");
                }
                self.transition(LinkState::Stopped);
                result
            },
            LinkState::Stopped => {
                tracing::debug!(link_id = %self.ctx.id(), "Already stopped");
                Ok(())
            },
            LinkState::Idle => {
                self.stray("stop");
                Ok(())
            },
        }
    }

    fn delete(&mut self) -> Result<()> {
        if self.state == LinkState::Idle {
            self.stray("delete");
            return Ok(());
        }
        let stopped = self.stop();
        let deleted = self.plugin.delete(&mut self.ctx);
        if let Err(e) = &deleted {
            tracing::warn!(link_id = %self.ctx.id(), error = %e, "Plugin delete failed");
        }
        self.ctx.detach_interface();
        self.transition(LinkState::Idle);
        self.renew_plugin();
        tracing::info!(link_id = %self.ctx.id(), kind = %self.ctx.kind(), "Link deleted");
        stopped.and(deleted)
    }

    /// Swaps in a fresh plugin instance so the next CREATE starts clean.
    fn renew_plugin(&mut self) {
        match self.plugins.create(self.ctx.kind()) {
            Ok(plugin) => self.plugin = plugin,
            Err(e) => {
                tracing::warn!(link_id = %self.ctx.id(), error = %e, "Keeping previous plugin instance");
            },
        }
    }
}
