// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use framelink_engine::{ContextConfig, SystemConfig};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::Level;

/// Preset tuning profiles for the engine.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum EnginePerfProfile {
    /// Small mailboxes: a slow link surfaces as stray or coalesced wake-ups quickly
    LowLatency,
    /// Defaults for general pipelines
    Balanced,
    /// Deep mailboxes for links that receive bursts of control commands
    HighThroughput,
}

impl EnginePerfProfile {
    const fn mailbox_capacity(self) -> usize {
        match self {
            Self::LowLatency => 8,
            Self::Balanced => 32,
            Self::HighThroughput => 128,
        }
    }
}

const fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// Engine configuration for link tasks and their mailboxes.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct EngineConfig {
    /// Optional tuning profile that provides mailbox defaults.
    ///
    /// An explicit `mailbox_capacity` takes precedence.
    #[serde(default)]
    pub profile: Option<EnginePerfProfile>,
    /// Commands each link's mailbox holds (default: 32)
    /// NEW_DATA and RELEASE are coalesced, so this bounds control traffic only
    pub mailbox_capacity: Option<usize>,
    /// State updates buffered for subscribers (default: 128)
    pub state_capacity: Option<usize>,
    /// Seconds between periodic statistics prints while running; 0 disables
    #[serde(default)]
    pub stats_interval_secs: u64,
    /// Seconds teardown waits for link tasks before giving up
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: None,
            mailbox_capacity: None,
            state_capacity: None,
            stats_interval_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub(crate) fn resolved_mailbox_capacity(&self) -> Option<usize> {
        self.mailbox_capacity.or_else(|| self.profile.map(EnginePerfProfile::mailbox_capacity))
    }
}

/// Address window of one execution context.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct PlatformContext {
    pub name: String,
    /// Where this context sees the start of the shared window
    pub local_base: u64,
    /// Address of the same memory in the shared address space
    pub shared_base: u64,
}

const fn default_ipc_region_base() -> u64 {
    framelink_engine::constants::DEFAULT_IPC_REGION_BASE
}

/// Shared-memory layout of the platform.
///
/// Contexts not listed here get an identity mapping when a pipeline first
/// names them.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct PlatformConfig {
    /// Base of the region holding IPC rings and slot tables
    #[serde(default = "default_ipc_region_base")]
    pub ipc_region_base: u64,
    #[serde(default)]
    pub contexts: Vec<PlatformContext>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { ipc_region_base: default_ipc_region_base(), contexts: Vec::new() }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct TelemetryConfig {
    /// Record engine metrics through OpenTelemetry
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub tracing_enable: bool,
    /// OTLP/HTTP metrics endpoint; metrics stay local when unset
    pub otlp_endpoint: Option<String>,
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info, // Debug logs every processing pass
            file_path: "./framelink.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// What `framelink run` does when no arguments override it.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct RunConfig {
    /// Pipeline YAML to run
    pub pipeline: Option<String>,
    /// Seconds to run before stopping; runs until Ctrl-C when unset
    pub duration_secs: Option<u64>,
    /// Print every link's statistics as JSON after the pipeline stops
    #[serde(default = "default_true")]
    pub print_stats_on_exit: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { pipeline: None, duration_secs: None, print_stats_on_exit: true }
    }
}

#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub run: RunConfig,
}

impl Config {
    /// The engine's view of this configuration.
    pub fn system_config(&self) -> SystemConfig {
        SystemConfig {
            mailbox_capacity: self.engine.resolved_mailbox_capacity(),
            state_capacity: self.engine.state_capacity,
            ipc_region_base: self.platform.ipc_region_base,
            contexts: self
                .platform
                .contexts
                .iter()
                .map(|c| ContextConfig {
                    name: c.name.clone(),
                    local_base: c.local_base,
                    shared_base: c.shared_base,
                })
                .collect(),
            shutdown_timeout: Duration::from_secs(self.engine.shutdown_timeout_secs),
        }
    }
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads defaults, then `config_path` if it exists, then `FL_` environment
/// variables (`FL_ENGINE__MAILBOX_CAPACITY=64`).
///
/// # Errors
///
/// Returns an error if the file or an environment variable does not fit the
/// configuration schema.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // A missing file is not an error; defaults and env still apply
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("FL_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    #[test]
    fn test_explicit_mailbox_capacity_beats_profile() {
        let mut engine = EngineConfig { profile: Some(EnginePerfProfile::LowLatency), ..Default::default() };
        assert_eq!(engine.resolved_mailbox_capacity(), Some(8));
        engine.mailbox_capacity = Some(64);
        assert_eq!(engine.resolved_mailbox_capacity(), Some(64));
        assert_eq!(EngineConfig::default().resolved_mailbox_capacity(), None);
    }

    #[test]
    fn test_platform_contexts_reach_the_system_config() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                r#"
[platform]
ipc_region_base = 0x6000_0000

[[platform.contexts]]
name = "dsp"
local_base = 0x1000_0000
shared_base = 0x8000_0000
"#,
            ))
            .extract()
            .unwrap();

        let system = config.system_config();
        assert_eq!(system.ipc_region_base, 0x6000_0000);
        assert_eq!(
            system.contexts,
            vec![ContextConfig {
                name: "dsp".to_string(),
                local_base: 0x1000_0000,
                shared_base: 0x8000_0000
            }]
        );
        assert_eq!(system.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = generate_default().unwrap();
        let config: Config = Figment::new().merge(Toml::string(&rendered)).extract().unwrap();
        assert!(config.run.print_stats_on_exit);
        assert_eq!(config.platform.ipc_region_base, default_ipc_region_base());
    }
}
