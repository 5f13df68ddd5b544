// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenTelemetry instruments shared by every link task of a system.

use framelink_core::LinkState;
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{global, KeyValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct EngineMetrics {
    state_transitions: Counter<u64>,
    links_active: Gauge<u64>,
    commands: Counter<u64>,
    new_data_coalesced: Counter<u64>,
    running: Arc<AtomicU64>,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").field("running", &self.running()).finish_non_exhaustive()
    }
}

impl EngineMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("framelink_engine");
        Self {
            state_transitions: meter
                .u64_counter("engine.link.state_transitions")
                .with_description("Link state transitions")
                .build(),
            links_active: meter
                .u64_gauge("engine.links.active")
                .with_description("Number of links in the running state")
                .build(),
            commands: meter
                .u64_counter("engine.link.commands")
                .with_description("Commands processed by link tasks")
                .build(),
            new_data_coalesced: meter
                .u64_counter("engine.link.new_data_coalesced")
                .with_description("Wake-ups dropped because one was already pending")
                .build(),
            running: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn running(&self) -> u64 {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn record_transition(&self, kind: &str, from: LinkState, to: LinkState) {
        self.state_transitions.add(
            1,
            &[
                KeyValue::new("link.kind", kind.to_string()),
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );

        let running = if to == LinkState::Running && from != LinkState::Running {
            self.running.fetch_add(1, Ordering::Relaxed) + 1
        } else if from == LinkState::Running && to != LinkState::Running {
            self.running.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
        } else {
            self.running()
        };
        self.links_active.record(running, &[]);
    }

    pub(crate) fn record_command(&self, kind: &str, command: &'static str) {
        self.commands.add(
            1,
            &[KeyValue::new("link.kind", kind.to_string()), KeyValue::new("command", command)],
        );
    }

    pub(crate) fn record_coalesced(&self, kind: &str, count: u64) {
        if count > 0 {
            self.new_data_coalesced.add(count, &[KeyValue::new("link.kind", kind.to_string())]);
        }
    }
}
