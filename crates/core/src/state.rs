// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Link state machine and state update emission.
//!
//! ## State Machine
//!
//! ```text
//!       Idle ──CREATE──▶ Running ──STOP──▶ Stopped
//!        ▲                  │                 │
//!        │                  └──DELETE (auto STOP)
//!        └──────────────────DELETE────────────┘
//! ```
//!
//! A deleted link is back in `Idle` and may be created again.

use crate::link::LinkId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use ts_rs::TS;

/// Runtime state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Initial state, and the state after DELETE.
    #[default]
    Idle,
    /// Created; processing NEW_DATA.
    Running,
    /// Stopped; no buffers are docked for processing.
    Stopped,
}

impl LinkState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state transition reported by a link task.
#[derive(Debug, Clone)]
pub struct LinkStateUpdate {
    pub link_id: LinkId,
    pub state: LinkState,
    pub timestamp: SystemTime,
}

impl LinkStateUpdate {
    #[inline]
    pub fn new(link_id: LinkId, state: LinkState) -> Self {
        Self { link_id, state, timestamp: SystemTime::now() }
    }
}

/// Helper functions for emitting link state updates.
pub mod state_helpers {
    use super::{LinkId, LinkState, LinkStateUpdate};
    use tokio::sync::mpsc;

    /// Emits a state update. Failures are ignored as state tracking is best-effort.
    #[inline]
    pub fn emit_state(state_tx: &mpsc::Sender<LinkStateUpdate>, link_id: LinkId, state: LinkState) {
        let _ = state_tx.try_send(LinkStateUpdate::new(link_id, state));
    }

    #[inline]
    pub fn emit_running(state_tx: &mpsc::Sender<LinkStateUpdate>, link_id: LinkId) {
        emit_state(state_tx, link_id, LinkState::Running);
    }

    #[inline]
    pub fn emit_stopped(state_tx: &mpsc::Sender<LinkStateUpdate>, link_id: LinkId) {
        emit_state(state_tx, link_id, LinkState::Stopped);
    }

    #[inline]
    pub fn emit_idle(state_tx: &mpsc::Sender<LinkStateUpdate>, link_id: LinkId) {
        emit_state(state_tx, link_id, LinkState::Idle);
    }
}
