// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

pub mod cli;
pub mod config;
pub mod logging;
pub mod run;
pub mod telemetry;

// Re-export commonly used items for convenience
pub use config::Config;
pub use run::{load_graph, run_graph, RunOptions};
