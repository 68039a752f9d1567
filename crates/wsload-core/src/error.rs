use std::time::Duration;
use thiserror::Error;

/// Fatal, pre-run configuration problems. Nothing is connected when one of
/// these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target url is required (set target.url, --url or WS_URL)")]
    MissingUrl,

    #[error("invalid target url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("target url must use ws:// or wss:// (got scheme {0:?})")]
    UnsupportedScheme(String),

    #[error("ramp must contain at least one stage")]
    EmptyRamp,

    #[error("send interval must satisfy 0 < min < max (got min={min_ms}ms, max={max_ms}ms)")]
    InvalidSendInterval { min_ms: u64, max_ms: u64 },

    #[error("scheduler.tick_ms must be non-zero")]
    ZeroTick,

    #[error("target.connect_timeout_ms must be non-zero")]
    ZeroConnectTimeout,

    #[error("no thresholds configured; add [thresholds] or set run.no_thresholds = true")]
    NoThresholds,

    #[error("unknown metric {0:?} in thresholds")]
    UnknownMetric(String),

    #[error("invalid threshold {expr:?} for {metric}: {reason}")]
    InvalidThreshold {
        metric: String,
        expr: String,
        reason: String,
    },
}

/// A connection attempt that did not reach the Open state.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake rejected with status {0}")]
    Status(u16),

    #[error("connect failed: {0}")]
    Transport(String),

    #[error("cancelled while connecting")]
    Cancelled,
}

/// Failures on an already open connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("close failed: {0}")]
    Close(String),
}

/// Session factory failures. Recorded as a connect failure and retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("session limit reached ({limit} live sessions)")]
    Exhausted { limit: usize },
}
