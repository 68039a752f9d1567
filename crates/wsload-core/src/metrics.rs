use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Highest connect latency tracked exactly; slower samples saturate here.
const MAX_TRACKED_LATENCY_MS: u64 = 3_600_000;
const LATENCY_SIGFIGS: u8 = 3;

/// Something a session observed. Each occurrence is recorded exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    ConnectAttempt,
    ConnectSuccess { latency_ms: u64 },
    ConnectFailure,
    MessageSent,
    MessageReceived,
    /// Transport error on an open connection
    SessionError,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub connects_attempted: u64,
    pub connects_succeeded: u64,
    pub connects_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub session_errors: u64,
    pub disconnected: u64,
}

impl Counters {
    /// Failed handshakes plus errors on open connections.
    pub fn connect_errors(&self) -> u64 {
        self.connects_failed.saturating_add(self.session_errors)
    }

    /// Succeeded / attempted, or `None` before the first attempt.
    pub fn connect_success_rate(&self) -> Option<f64> {
        if self.connects_attempted == 0 {
            return None;
        }
        Some(self.connects_succeeded as f64 / self.connects_attempted as f64)
    }

    fn apply(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::ConnectAttempt => self.connects_attempted += 1,
            MetricEvent::ConnectSuccess { .. } => self.connects_succeeded += 1,
            MetricEvent::ConnectFailure => self.connects_failed += 1,
            MetricEvent::MessageSent => self.messages_sent += 1,
            MetricEvent::MessageReceived => self.messages_received += 1,
            MetricEvent::SessionError => self.session_errors += 1,
            MetricEvent::Disconnected => self.disconnected += 1,
        }
    }
}

struct Inner {
    counters: Counters,
    connect_time: Histogram<u64>,
}

/// Shared sink for every session's events.
///
/// Counters and the connect-latency histogram sit behind a single lock so a
/// snapshot never shows a half-applied event. The critical section is a
/// counter bump and at most one histogram insert.
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
    started: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                counters: Counters::default(),
                connect_time: empty_histogram(),
            }),
            started: Instant::now(),
        }
    }

    pub fn record(&self, event: MetricEvent) {
        let mut inner = self.inner.lock();
        inner.counters.apply(event);
        if let MetricEvent::ConnectSuccess { latency_ms } = event {
            inner.connect_time.saturating_record(latency_ms);
        }
    }

    pub fn counters(&self) -> Counters {
        self.inner.lock().counters
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        MetricsSnapshot {
            counters: inner.counters,
            connect_time: inner.connect_time.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_TRACKED_LATENCY_MS, LATENCY_SIGFIGS)
        .expect("histogram bounds are compile-time constants")
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: Counters,
    pub connect_time: Histogram<u64>,
    pub elapsed_ms: u64,
}

impl MetricsSnapshot {
    pub fn latency_summary(&self) -> LatencySummary {
        let h = &self.connect_time;
        if h.is_empty() {
            return LatencySummary::default();
        }
        LatencySummary {
            count: h.len(),
            min_ms: h.min(),
            max_ms: h.max(),
            mean_ms: h.mean(),
            p50_ms: h.value_at_quantile(0.50),
            p90_ms: h.value_at_quantile(0.90),
            p95_ms: h.value_at_quantile(0.95),
            p99_ms: h.value_at_quantile(0.99),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}
