use std::path::Path;
use std::time::Duration;

use announce_listener::TimingConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// Optional YAML file with the broker address, topics and timing overrides.
///
/// ```yaml
/// server: tcp://notify.example.com:22000
/// topics: [proj1, proj2]
/// timing:
///   heartbeat_units: 120
///   request_timeout_ms: 2000
/// ```
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub server: Option<String>,
    pub topics: Vec<String>,
    pub timing: TimingFile,
}

/// [`TimingConfig`] with durations in milliseconds. Missing fields keep the
/// library defaults.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingFile {
    pub topic_timeout_ms: u64,
    pub payload_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_units: u32,
    pub idle_step: u32,
    pub unit_ms: u64,
    pub sleep_factor: f64,
}

impl Default for TimingFile {
    fn default() -> Self {
        let d = TimingConfig::default();
        Self {
            topic_timeout_ms: millis(d.topic_timeout),
            payload_timeout_ms: millis(d.payload_timeout),
            request_timeout_ms: millis(d.request_timeout),
            connect_timeout_ms: millis(d.connect_timeout),
            heartbeat_units: d.heartbeat_units,
            idle_step: d.idle_step,
            unit_ms: millis(d.unit),
            sleep_factor: d.sleep_factor,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TimingFile {
    fn validate(&self) -> CliResult<()> {
        let positive = [
            ("topic_timeout_ms", self.topic_timeout_ms),
            ("payload_timeout_ms", self.payload_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("unit_ms", self.unit_ms),
            ("heartbeat_units", u64::from(self.heartbeat_units)),
            ("idle_step", u64::from(self.idle_step)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CliError::Config(format!("timing.{name} must be positive")));
            }
        }
        if !(self.sleep_factor.is_finite() && self.sleep_factor > 1.0) {
            return Err(CliError::Config(format!(
                "timing.sleep_factor must be greater than 1, got {}",
                self.sleep_factor
            )));
        }
        Ok(())
    }
}

impl From<TimingFile> for TimingConfig {
    fn from(t: TimingFile) -> Self {
        Self {
            topic_timeout: Duration::from_millis(t.topic_timeout_ms),
            payload_timeout: Duration::from_millis(t.payload_timeout_ms),
            request_timeout: Duration::from_millis(t.request_timeout_ms),
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            heartbeat_units: t.heartbeat_units,
            idle_step: t.idle_step,
            unit: Duration::from_millis(t.unit_ms),
            sleep_factor: t.sleep_factor,
        }
    }
}

/// Load and validate a CLI config from a YAML file.
pub async fn load(path: &Path) -> CliResult<CliConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::Config(format!("read {}: {e}", path.display())))?;
    let config: CliConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| CliError::Config(format!("parse {}: {e}", path.display())))?;
    config.timing.validate()?;
    Ok(config)
}
