use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scenario: ScenarioConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub ramp: RampConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Metric name -> threshold expressions, e.g. `connect_success = ["rate>0.99"]`
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdEntry>>,
    #[serde(default)]
    pub run: RunConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Structural checks that must pass before any connection is attempted.
    /// Threshold expressions are checked separately by `ThresholdRule::parse_all`.
    pub fn validate(&self) -> Result<url::Url, ConfigError> {
        let url = self.target.parse_url()?;

        if self.target.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroConnectTimeout);
        }

        if self.ramp.stages.is_empty() {
            return Err(ConfigError::EmptyRamp);
        }

        let min_ms = self.session.send_interval_min_ms;
        let max_ms = self.session.send_interval_max_ms;
        if min_ms == 0 || min_ms >= max_ms {
            return Err(ConfigError::InvalidSendInterval { min_ms, max_ms });
        }

        if self.scheduler.tick_ms == 0 {
            return Err(ConfigError::ZeroTick);
        }

        if self.thresholds.values().all(|v| v.is_empty()) && !self.run.no_thresholds {
            return Err(ConfigError::NoThresholds);
        }

        Ok(url)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Optional seed for reproducible send jitter
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// WebSocket endpoint (ws:// or wss://)
    #[serde(default)]
    pub url: String,
    /// Handshake timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl TargetConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn parse_url(&self) -> Result<url::Url, ConfigError> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingUrl);
        }

        let url = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        if url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }

        Ok(url)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampStage {
    /// Time to move from the previous stage's target to this one, in milliseconds
    pub duration_ms: u64,
    /// Virtual users to reach by the end of the stage
    pub target: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RampConfig {
    #[serde(default)]
    pub stages: Vec<RampStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lower bound (inclusive) of the jittered send interval
    #[serde(default = "default_send_interval_min_ms")]
    pub send_interval_min_ms: u64,
    /// Upper bound (exclusive) of the jittered send interval
    #[serde(default = "default_send_interval_max_ms")]
    pub send_interval_max_ms: u64,
    /// How long a cancelled session may spend on the close handshake
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_interval_min_ms: default_send_interval_min_ms(),
            send_interval_max_ms: default_send_interval_max_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between convergence passes
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Hard limit on waiting for sessions after the ramp ends or on shutdown
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,
    /// Cap on live sessions; spawns beyond it fail as resource exhaustion
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            max_sessions: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Evaluate thresholds every N ms while running (needed for abort_on_fail)
    #[serde(default)]
    pub evaluate_every_ms: Option<u64>,
    /// Explicitly run without any thresholds
    #[serde(default)]
    pub no_thresholds: bool,
}

/// One entry under `[thresholds]`: either `"count<10"` or
/// `{ threshold = "count<10", abort_on_fail = true }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
    },
}

impl ThresholdEntry {
    pub fn expr(&self) -> &str {
        match self {
            ThresholdEntry::Expr(s) => s,
            ThresholdEntry::Detailed { threshold, .. } => threshold,
        }
    }

    pub fn abort_on_fail(&self) -> bool {
        matches!(
            self,
            ThresholdEntry::Detailed {
                abort_on_fail: true,
                ..
            }
        )
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_send_interval_min_ms() -> u64 {
    2_000
}

fn default_send_interval_max_ms() -> u64 {
    4_000
}

fn default_close_grace_ms() -> u64 {
    1_000
}

fn default_tick_ms() -> u64 {
    100
}

fn default_shutdown_deadline_ms() -> u64 {
    5_000
}
