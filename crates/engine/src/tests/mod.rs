// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod ipc_ring_fuzz;

use framelink_core::{CreateParams, InQueueParams, LinkId, OutQueueParams};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Parameters of a source feeding `next`.
pub(crate) fn source_params(config: serde_json::Value, next: u32) -> CreateParams {
    CreateParams {
        in_queues: vec![],
        out_queues: vec![OutQueueParams { next_links: vec![LinkId(next)] }],
        config: Some(config),
    }
}

/// Parameters of a link reading queue 0 of `prev`, optionally feeding `next`.
pub(crate) fn consumer_params(prev: u32, next: Option<u32>, config: serde_json::Value) -> CreateParams {
    CreateParams {
        in_queues: vec![InQueueParams { prev_link: LinkId(prev), prev_queue: 0 }],
        out_queues: next
            .map(|n| vec![OutQueueParams { next_links: vec![LinkId(n)] }])
            .unwrap_or_default(),
        config: Some(config),
    }
}
