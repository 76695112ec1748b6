//! Stress run configuration.
//!
//! The configuration file is a regular `relay.toml` with an additional
//! `[generate]` section describing the event generators:
//!
//! ```toml
//! [queue.mem]
//! events = 4096
//!
//! [output]
//! type = "test"
//! worker = 2
//! bulk_max_size = 64
//! max_wait_ms = 5
//! fail_every_batch = 10
//!
//! [generate]
//! worker = 4
//! publish_mode = "guaranteed"
//! max_events = 100000
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::config::RelayConfig;
use relay_publisher::PublishMode;
use serde::Deserialize;

/// Generator publish mode as written in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratePublishMode {
    #[default]
    Default,
    Guaranteed,
    DropIfFull,
}

impl From<GeneratePublishMode> for PublishMode {
    fn from(mode: GeneratePublishMode) -> Self {
        match mode {
            GeneratePublishMode::Default => PublishMode::Default,
            GeneratePublishMode::Guaranteed => PublishMode::GuaranteedSend,
            GeneratePublishMode::DropIfFull => PublishMode::DropIfFull,
        }
    }
}

/// `[generate]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerateConfig {
    /// Number of concurrent generators, each with its own client.
    pub worker: usize,
    /// Log ACK counts per generator.
    pub ack: bool,
    /// Events per generator (0 = until stopped).
    pub max_events: u64,
    /// Client close wait for outstanding ACKs (0 = do not wait).
    pub wait_close_ms: u64,
    pub publish_mode: GeneratePublishMode,
    /// Interval after which a generator that made no progress is reported (0 = disabled).
    pub watchdog_ms: u64,
}

impl GenerateConfig {
    pub fn wait_close(&self) -> Option<Duration> {
        (self.wait_close_ms > 0).then(|| Duration::from_millis(self.wait_close_ms))
    }

    pub fn watchdog(&self) -> Option<Duration> {
        (self.watchdog_ms > 0).then(|| Duration::from_millis(self.watchdog_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker == 0 {
            anyhow::bail!("generate.worker must be at least 1");
        }
        Ok(())
    }
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            worker: 1,
            ack: false,
            max_events: 0,
            wait_close_ms: 0,
            publish_mode: GeneratePublishMode::Default,
            watchdog_ms: 2_000,
        }
    }
}

#[derive(Deserialize)]
struct GenerateSection {
    #[serde(default)]
    generate: GenerateConfig,
}

/// Full stress configuration: pipeline settings plus generator settings.
#[derive(Debug, Clone, Default)]
pub struct StressConfig {
    pub relay: RelayConfig,
    pub generate: GenerateConfig,
}

impl StressConfig {
    /// Loads the file, applies `RELAY_*` environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.relay.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without validating it.
    pub fn parse(toml_str: &str) -> Result<Self> {
        let relay = RelayConfig::parse(toml_str)?;
        let section: GenerateSection =
            toml::from_str(toml_str).context("invalid [generate] section")?;
        Ok(Self {
            relay,
            generate: section.generate,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        self.generate.validate()
    }
}
