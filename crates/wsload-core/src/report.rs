use crate::metrics::{Counters, LatencySummary};
use crate::scheduler::SchedulerSummary;
use crate::threshold::{RuleStatus, ThresholdReport};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Ramp ran to the end
    Completed,
    /// Stopped by an external cancellation (Ctrl-C)
    Interrupted,
    /// Stopped because an abort_on_fail threshold failed
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub timestamp: String,
    pub target: String,
    pub connector: String,
    pub outcome: RunOutcome,
    pub duration_ms: u64,
    pub counters: Counters,
    pub connect_success_rate: Option<f64>,
    pub connect_errors: u64,
    pub connect_time: LatencySummary,
    pub sessions: SchedulerSummary,
    pub thresholds: ThresholdReport,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.thresholds.passed
    }

    /// 0 when every threshold passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }

    pub fn print_summary(&self) {
        let c = &self.counters;
        let t = &self.connect_time;
        let s = &self.sessions;

        println!("\n=== Run Summary ({:?}) ===", self.outcome);
        println!("Target: {} ({})", self.target, self.connector);
        println!("Duration: {}ms", self.duration_ms);
        println!("Connects attempted: {}", c.connects_attempted);
        println!("Connects succeeded: {}", c.connects_succeeded);
        println!("Connects failed: {}", c.connects_failed);
        match self.connect_success_rate {
            Some(rate) => println!("Connect success rate: {:.2}%", rate * 100.0),
            None => println!("Connect success rate: n/a (no attempts)"),
        }
        println!("Connect errors: {}", self.connect_errors);
        println!("Session errors: {}", c.session_errors);
        println!("Messages sent: {}", c.messages_sent);
        println!("Messages received: {}", c.messages_received);
        println!("Disconnected: {}", c.disconnected);
        println!(
            "Connect time: avg={:.1}ms min={}ms p50={}ms p90={}ms p95={}ms p99={}ms max={}ms",
            t.mean_ms, t.min_ms, t.p50_ms, t.p90_ms, t.p95_ms, t.p99_ms, t.max_ms
        );
        println!(
            "Sessions: spawned={} peak={} closed={} failed={} abandoned={} spawn_failures={}",
            s.spawned, s.peak_active, s.closed, s.failed, s.abandoned, s.spawn_failures
        );

        println!("\n=== Thresholds ===");
        if self.thresholds.results.is_empty() {
            println!("(none configured)");
        }
        for r in &self.thresholds.results {
            let mark = match r.status {
                RuleStatus::Pass => "PASS",
                RuleStatus::Fail => "FAIL",
                RuleStatus::Indeterminate => "N/A ",
            };
            match r.observed {
                Some(v) => println!("{} {} {} (observed {})", mark, r.metric, r.expr, v),
                None => println!("{} {} {} (no data)", mark, r.metric, r.expr),
            }
        }
        println!(
            "\nResult: {}",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        println!();
    }
}
