// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Runs one pipeline until its duration elapses or the process is interrupted.

use anyhow::{anyhow, Context};
use framelink_api::{LinkGraph, PipelineStats};
use framelink_engine::{Pipeline, System};
use std::path::Path;
use std::time::Duration;
use tokio::time::{Instant, Interval};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this long; `None` waits for Ctrl-C.
    pub duration: Option<Duration>,
    /// Log every link's statistics on this period, resetting latencies.
    pub stats_interval: Option<Duration>,
}

/// Reads and compiles a pipeline file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not compile.
pub fn load_graph(path: &Path) -> anyhow::Result<LinkGraph> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline {}", path.display()))?;
    framelink_api::yaml::parse(&yaml).map_err(|e| anyhow!("{}: {e}", path.display()))
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => std::future::pending().await,
    }
}

async fn wait_for_stop(pipeline: &Pipeline, options: &RunOptions) {
    let deadline = async {
        match options.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(interrupted);
    let mut ticker = options.stats_interval.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            () = &mut deadline => {
                tracing::info!("Run duration elapsed");
                break;
            },
            () = &mut interrupted => {
                tracing::info!("Interrupted, stopping pipeline");
                break;
            },
            () = next_tick(&mut ticker) => {
                if let Err(e) = pipeline.print_statistics(true).await {
                    tracing::warn!(error = %e, "Periodic statistics failed");
                }
            },
        }
    }
}

/// Assembles `graph` on `system`, runs it, then stops and deletes it.
///
/// Returns the statistics taken after STOP, before DELETE.
///
/// # Errors
///
/// Returns an error if assembly fails, or if stopping, collecting statistics or
/// deleting fails. Deletion is attempted in every case.
pub async fn run_graph(
    system: &System,
    graph: &LinkGraph,
    options: &RunOptions,
) -> anyhow::Result<PipelineStats> {
    let pipeline = Pipeline::assemble(system, graph).await.context("Pipeline assembly failed")?;
    tracing::info!(
        pipeline = pipeline.name(),
        links = pipeline.links().len(),
        duration = ?options.duration,
        "Pipeline running"
    );

    wait_for_stop(&pipeline, options).await;

    let stopped = pipeline.stop().await;
    let stats = pipeline.print_statistics(false).await;
    let deleted = pipeline.delete(system).await;

    stopped.context("Pipeline stop failed")?;
    let stats = stats.context("Collecting statistics failed")?;
    deleted.context("Pipeline delete failed")?;
    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use framelink_engine::{Engine, SystemConfig};

    #[test]
    fn test_load_graph_names_the_file_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "links: {}\n").unwrap();

        let err = load_graph(&path).unwrap_err().to_string();
        assert!(err.contains("broken.yaml"), "{err}");
        assert!(load_graph(&dir.path().join("missing.yaml")).is_err());
    }

    #[tokio::test]
    async fn test_run_graph_collects_stats_and_cleans_up() {
        let graph = framelink_api::yaml::parse(
            r"
name: ticking
links:
  src:
    kind: null_source
    params: { interval_ms: 5 }
  sink:
    kind: null_sink
    inputs: src
",
        )
        .unwrap();
        let system = Engine::new().start_system(SystemConfig::default()).unwrap();
        let options = RunOptions { duration: Some(Duration::from_millis(100)), stats_interval: None };

        let stats = run_graph(&system, &graph, &options).await.unwrap();
        let sink = stats.link("sink").unwrap();
        assert!(sink.stats.channels[0].received > 0);
        assert_eq!(sink.stats.in_buf_errors, 0);
        assert!(system.link_ids().is_empty());

        system.shutdown_and_wait().await.unwrap();
    }
}
