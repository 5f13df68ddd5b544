// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Integration tests for pipelines assembled from YAML.
//!
//! These drive whole graphs through the public engine API: compile, assemble,
//! exchange buffers across contexts, stop, read statistics and delete.

use framelink_api::yaml;
use framelink_core::{FrameLinkError, LinkState};
use framelink_engine::{Engine, LinkHandle, Pipeline, SystemConfig};
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Polls `link` until `done` holds for its statistics.
#[allow(clippy::expect_used)]
async fn wait_for<F>(link: &LinkHandle, what: &str, done: F)
where
    F: Fn(&framelink_core::LinkStatsSnapshot) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let stats = link.statistics().await.expect("statistics");
            if done(&stats) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

const CROSS_CONTEXT: &str = r"
name: capture-to-dsp
ipc:
  ring_capacity: 8
  slots: 8
links:
  src:
    kind: null_source
    context: capture
    params: { channels: 2, buffers_per_channel: 4, interval_ms: 0 }
  sink:
    kind: null_sink
    context: dsp
    inputs: src
";

#[tokio::test]
#[allow(clippy::expect_used, clippy::unwrap_used)]
async fn test_cross_context_pipeline_round_trip() {
    init_tracing();
    let engine = Engine::new();
    let system = engine.start_system(SystemConfig::default()).expect("system");
    let graph = yaml::parse(CROSS_CONTEXT).expect("valid pipeline");
    assert_eq!(graph.links.len(), 4);
    assert_eq!(graph.ipc_channels.len(), 1);

    let pipeline = Pipeline::assemble(&system, &graph).await.expect("assembly");
    let src = pipeline.link("src").expect("src").clone();
    let sink = pipeline.link("sink").expect("sink").clone();
    let ipc_in = pipeline.link("src->sink.ipc_in").expect("in-adapter").clone();
    assert_eq!(ipc_in.context(), "dsp");
    assert_eq!(pipeline.link("src->sink.ipc_out").expect("out-adapter").context(), "capture");

    for frame in 1..=10u64 {
        src.notify_new_data();
        wait_for(&sink, "frame delivery", |s| s.channels.iter().map(|c| c.received).sum::<u64>() == 2 * frame)
            .await;
        // Both channels come back to the source before the next frame.
        wait_for(&src, "buffer return", |s| s.buffers.is_some_and(|b| b.empty == b.allocated)).await;
    }

    pipeline.stop().await.expect("stop");
    let stats = pipeline.statistics().await.expect("statistics");
    assert_eq!(stats.name.as_deref(), Some("capture-to-dsp"));
    assert!(stats.links.iter().all(|l| l.state == LinkState::Stopped));

    let sink_stats = &stats.link("sink").unwrap().stats;
    assert_eq!(sink_stats.channels.len(), 2);
    assert!(sink_stats.channels.iter().all(|c| c.received == 10));
    assert_eq!(sink_stats.in_buf_errors, 0);

    let in_stats = &stats.link("src->sink.ipc_in").unwrap().stats;
    assert_eq!(in_stats.in_buf_errors, 0);
    assert!(in_stats.ipc_latency.is_some_and(|l| l.count == 20));

    let out_stats = &stats.link("src->sink.ipc_out").unwrap().stats;
    assert_eq!(out_stats.channels.iter().map(|c| c.forwarded).sum::<u64>(), 20);
    assert_eq!(out_stats.exhausted.ring_full, 0);

    pipeline.delete(&system).await.expect("delete");
    assert!(system.link_ids().is_empty());
    assert!(system.ipc().is_empty());
    assert_eq!(system.running_links(), 0);

    system.shutdown_and_wait().await.expect("shutdown");
}

#[tokio::test]
#[allow(clippy::expect_used)]
async fn test_failed_assembly_rolls_back() {
    init_tracing();
    let engine = Engine::new();
    let system = engine.start_system(SystemConfig::default()).expect("system");
    let mut states = system.subscribe_state();

    let graph = yaml::parse(
        r#"
links:
  src:
    kind: null_source
    params: { interval_ms: 0 }
  sink:
    kind: null_sink
    inputs: src
    params: { hold: "lots" }
"#,
    )
    .expect("the graph itself is valid");

    let Err(err) = Pipeline::assemble(&system, &graph).await else {
        panic!("assembly should fail on the sink's params");
    };
    assert!(matches!(err, FrameLinkError::Configuration(_)), "unexpected error: {err}");
    assert!(err.to_string().contains("link 'sink'"), "error does not name the link: {err}");
    assert!(system.link_ids().is_empty());

    // The source came up and went down again.
    let mut seen = Vec::new();
    while let Ok(Some(update)) = timeout(Duration::from_millis(200), states.recv()).await {
        seen.push(update.state);
    }
    assert_eq!(seen, vec![LinkState::Running, LinkState::Stopped, LinkState::Idle]);

    system.shutdown_and_wait().await.expect("shutdown");
}

#[tokio::test]
#[allow(clippy::expect_used)]
async fn test_same_graph_assembles_repeatedly() {
    init_tracing();
    let engine = Engine::new();
    let system = engine.start_system(SystemConfig::default()).expect("system");
    let graph = yaml::parse(CROSS_CONTEXT).expect("valid pipeline");

    for _ in 0..3 {
        let pipeline = Pipeline::assemble(&system, &graph).await.expect("assembly");
        let src = pipeline.link("src").expect("src").clone();
        let sink = pipeline.link("sink").expect("sink").clone();
        src.notify_new_data();
        wait_for(&sink, "frame delivery", |s| s.channels.iter().all(|c| c.received == 1)).await;
        pipeline.stop().await.expect("stop");
        pipeline.delete(&system).await.expect("delete");
        assert!(system.ipc().is_empty());
    }

    system.shutdown_and_wait().await.expect("shutdown");
}

#[tokio::test]
async fn test_invalid_graphs_never_reach_the_system() {
    init_tracing();
    let cyclic = r"
links:
  a: { kind: gate, inputs: b }
  b: { kind: gate, inputs: a }
";
    let Err(err) = yaml::parse(cyclic) else {
        panic!("a cycle must not compile");
    };
    assert!(err.contains("Circular dependency"), "unexpected error: {err}");

    let Err(err) = yaml::parse("links:\n  sink: { kind: null_sink, inputs: nowhere }\n") else {
        panic!("a dangling input must not compile");
    };
    assert!(err.contains("nowhere"), "unexpected error: {err}");
}
