use crate::config::ThresholdEntry;
use crate::error::ConfigError;
use crate::metrics::MetricsSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    /// Ratio of successes to attempts
    Rate,
    /// Distribution of connect latencies
    Trend,
}

/// Metrics a threshold can refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    ConnectsAttempted,
    ConnectsSucceeded,
    ConnectsFailed,
    ConnectErrors,
    MessagesSent,
    MessagesReceived,
    SessionErrors,
    Disconnected,
    ConnectSuccess,
    ConnectTimeMs,
}

impl MetricName {
    /// Canonical names plus the `ws_*` names used by existing k6 scripts.
    pub fn parse(name: &str) -> Option<Self> {
        let metric = match name.trim() {
            "connects_attempted" => MetricName::ConnectsAttempted,
            "connects_succeeded" => MetricName::ConnectsSucceeded,
            "connects_failed" => MetricName::ConnectsFailed,
            "connect_errors" | "ws_connect_errors" => MetricName::ConnectErrors,
            "messages_sent" | "ws_msgs_sent" => MetricName::MessagesSent,
            "messages_received" | "ws_msgs_received" => MetricName::MessagesReceived,
            "session_errors" => MetricName::SessionErrors,
            "disconnected" => MetricName::Disconnected,
            "connect_success" | "ws_connects" => MetricName::ConnectSuccess,
            "connect_time_ms" | "ws_connect_time_ms" => MetricName::ConnectTimeMs,
            _ => return None,
        };
        Some(metric)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricName::ConnectsAttempted => "connects_attempted",
            MetricName::ConnectsSucceeded => "connects_succeeded",
            MetricName::ConnectsFailed => "connects_failed",
            MetricName::ConnectErrors => "connect_errors",
            MetricName::MessagesSent => "messages_sent",
            MetricName::MessagesReceived => "messages_received",
            MetricName::SessionErrors => "session_errors",
            MetricName::Disconnected => "disconnected",
            MetricName::ConnectSuccess => "connect_success",
            MetricName::ConnectTimeMs => "connect_time_ms",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            MetricName::ConnectSuccess => MetricKind::Rate,
            MetricName::ConnectTimeMs => MetricKind::Trend,
            _ => MetricKind::Counter,
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Aggregate {
    fn parse(s: &str) -> Option<Self> {
        let agg = match s {
            "count" => Aggregate::Count,
            "rate" => Aggregate::Rate,
            "avg" => Aggregate::Avg,
            "min" => Aggregate::Min,
            "max" => Aggregate::Max,
            "med" => Aggregate::Med,
            _ => {
                let inner = s.strip_prefix("p(")?.strip_suffix(')')?;
                let p: f64 = inner.trim().parse().ok()?;
                if !(p > 0.0 && p <= 100.0) {
                    return None;
                }
                Aggregate::Percentile(p)
            }
        };
        Some(agg)
    }

    fn fits(self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => self == Aggregate::Count,
            MetricKind::Rate => self == Aggregate::Rate,
            MetricKind::Trend => !matches!(self, Aggregate::Count | Aggregate::Rate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    // Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Comparison); 6] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("!=", Comparison::Ne),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

/// A parsed `[thresholds]` entry such as `connects_failed: count<10`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: MetricName,
    pub expr: String,
    pub aggregate: Aggregate,
    pub op: Comparison,
    pub bound: f64,
    pub abort_on_fail: bool,
}

impl ThresholdRule {
    pub fn parse(metric: &str, expr: &str) -> Result<Self, ConfigError> {
        let name = MetricName::parse(metric)
            .ok_or_else(|| ConfigError::UnknownMetric(metric.to_string()))?;
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let op_at = expr
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let (lhs, rest) = expr.split_at(op_at);
        let (token, op) = Comparison::TOKENS
            .iter()
            .find(|(token, _)| rest.starts_with(token))
            .copied()
            .ok_or_else(|| invalid("unknown comparison operator"))?;

        let aggregate = Aggregate::parse(lhs.trim())
            .ok_or_else(|| invalid("unknown aggregate (expected count, rate, avg, min, max, med or p(N))"))?;
        if !aggregate.fits(name.kind()) {
            return Err(invalid(&format!(
                "aggregate not supported for {:?} metric {}",
                name.kind(),
                name
            )));
        }

        let bound: f64 = rest[token.len()..]
            .trim()
            .parse()
            .map_err(|_| invalid("bound is not a number"))?;
        if !bound.is_finite() {
            return Err(invalid("bound must be finite"));
        }

        Ok(Self {
            metric: name,
            expr: expr.trim().to_string(),
            aggregate,
            op,
            bound,
            abort_on_fail: false,
        })
    }

    /// Parse every configured threshold; the first bad entry is returned as an error.
    pub fn parse_all(
        thresholds: &BTreeMap<String, Vec<ThresholdEntry>>,
    ) -> Result<Vec<Self>, ConfigError> {
        let mut rules = Vec::new();
        for (metric, entries) in thresholds {
            for entry in entries {
                let mut rule = Self::parse(metric, entry.expr())?;
                rule.abort_on_fail = entry.abort_on_fail();
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    /// The value this rule compares, or `None` when it is undefined
    /// (a rate with no attempts, a trend with no samples).
    fn observe(&self, snapshot: &MetricsSnapshot) -> Option<f64> {
        let c = &snapshot.counters;
        let count = |n: u64| Some(n as f64);

        match self.metric {
            MetricName::ConnectsAttempted => count(c.connects_attempted),
            MetricName::ConnectsSucceeded => count(c.connects_succeeded),
            MetricName::ConnectsFailed => count(c.connects_failed),
            MetricName::ConnectErrors => count(c.connect_errors()),
            MetricName::MessagesSent => count(c.messages_sent),
            MetricName::MessagesReceived => count(c.messages_received),
            MetricName::SessionErrors => count(c.session_errors),
            MetricName::Disconnected => count(c.disconnected),
            MetricName::ConnectSuccess => c.connect_success_rate(),
            MetricName::ConnectTimeMs => {
                let h = &snapshot.connect_time;
                if h.is_empty() {
                    return None;
                }
                let v = match self.aggregate {
                    Aggregate::Avg => h.mean(),
                    Aggregate::Min => h.min() as f64,
                    Aggregate::Max => h.max() as f64,
                    Aggregate::Med => h.value_at_quantile(0.5) as f64,
                    Aggregate::Percentile(p) => h.value_at_percentile(p) as f64,
                    Aggregate::Count | Aggregate::Rate => return None,
                };
                Some(v)
            }
        }
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> RuleResult {
        let observed = self.observe(snapshot);
        let status = match observed {
            None => RuleStatus::Indeterminate,
            Some(v) if self.op.holds(v, self.bound) => RuleStatus::Pass,
            Some(_) => RuleStatus::Fail,
        };

        RuleResult {
            metric: self.metric,
            expr: self.expr.clone(),
            status,
            observed,
            bound: self.bound,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Pass,
    Fail,
    /// Nothing to compare yet; counts as a pass
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub metric: MetricName,
    pub expr: String,
    pub status: RuleStatus,
    pub observed: Option<f64>,
    pub bound: f64,
    pub abort_on_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub results: Vec<RuleResult>,
    pub passed: bool,
    /// At least one rule had nothing to evaluate
    pub indeterminate: bool,
}

impl ThresholdReport {
    /// A failing rule asked for the run to stop.
    pub fn should_abort(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.abort_on_fail && r.status == RuleStatus::Fail)
    }

    pub fn failed(&self) -> impl Iterator<Item = &RuleResult> {
        self.results.iter().filter(|r| r.status == RuleStatus::Fail)
    }
}

/// Evaluate all rules against one snapshot. Pure: the same snapshot always
/// gives the same report.
pub fn evaluate(rules: &[ThresholdRule], snapshot: &MetricsSnapshot) -> ThresholdReport {
    let results: Vec<RuleResult> = rules.iter().map(|r| r.evaluate(snapshot)).collect();
    let passed = results.iter().all(|r| r.status != RuleStatus::Fail);
    let indeterminate = results
        .iter()
        .any(|r| r.status == RuleStatus::Indeterminate);

    ThresholdReport {
        results,
        passed,
        indeterminate,
    }
}
