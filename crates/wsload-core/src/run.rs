use crate::config::Config;
use crate::connector::Connector;
use crate::error::ConfigError;
use crate::metrics::MetricsRegistry;
use crate::ramp::RampPlanner;
use crate::report::{RunOutcome, RunReport};
use crate::scheduler::{ConnectorSessionFactory, Scheduler, SchedulerStatus};
use crate::session::SessionSettings;
use crate::threshold::{self, ThresholdRule};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns one load test: validates the config, runs the scheduler, watches for
/// cancellation and abort thresholds, and produces the final report.
pub struct RunController {
    config: Config,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsRegistry>,
    cancel: CancellationToken,
    status_tx: watch::Sender<SchedulerStatus>,
    status_rx: watch::Receiver<SchedulerStatus>,
}

impl RunController {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        Self {
            config,
            connector,
            metrics: Arc::new(MetricsRegistry::new()),
            cancel: CancellationToken::new(),
            status_tx,
            status_rx,
        }
    }

    /// Cancelling this token stops the ramp and drains all sessions.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn status_rx(&self) -> watch::Receiver<SchedulerStatus> {
        self.status_rx.clone()
    }

    /// Run to completion. Configuration errors are returned before any
    /// connection is attempted; everything else ends up in the report.
    pub async fn run(self) -> Result<RunReport, ConfigError> {
        let url = self.config.validate()?;
        let rules = ThresholdRule::parse_all(&self.config.thresholds)?;

        let timestamp = chrono::Utc::now().to_rfc3339();
        let start = Instant::now();
        info!(
            "Starting run against {} ({} connector), {} threshold rule(s)",
            url,
            self.connector.name(),
            rules.len()
        );

        let settings = Arc::new(SessionSettings::from_config(&url, &self.config));
        let mut factory =
            ConnectorSessionFactory::new(settings, self.connector.clone(), self.metrics.clone());
        if let Some(limit) = self.config.scheduler.max_sessions {
            factory = factory.with_max_sessions(limit);
        }

        let scheduler = Scheduler::new(
            RampPlanner::new(self.config.ramp.clone()),
            Arc::new(factory),
            self.metrics.clone(),
            &self.config.scheduler,
            self.cancel.clone(),
            self.status_tx,
        );
        let scheduler_run = scheduler.run();
        tokio::pin!(scheduler_run);

        let mut eval_ticker = self.config.run.evaluate_every_ms.map(|ms| {
            let period = Duration::from_millis(ms.max(1));
            let mut ticker = interval_at(start + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        let mut outcome = RunOutcome::Completed;
        let summary = loop {
            tokio::select! {
                summary = &mut scheduler_run => break summary,

                _ = self.cancel.cancelled(), if outcome == RunOutcome::Completed => {
                    info!("Interrupt received, draining sessions");
                    outcome = RunOutcome::Interrupted;
                }

                _ = next_tick(&mut eval_ticker) => {
                    let report = threshold::evaluate(&rules, &self.metrics.snapshot());
                    if report.should_abort() && outcome == RunOutcome::Completed {
                        for r in report.failed().filter(|r| r.abort_on_fail) {
                            warn!(
                                "Threshold {} {} failed (observed {:?}), aborting run",
                                r.metric, r.expr, r.observed
                            );
                        }
                        outcome = RunOutcome::Aborted;
                        self.cancel.cancel();
                    }
                }
            }
        };

        let snapshot = self.metrics.snapshot();
        let thresholds = threshold::evaluate(&rules, &snapshot);
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Run {:?} after {}ms: attempted={} succeeded={} failed={} sent={} received={} thresholds={}",
            outcome,
            duration_ms,
            snapshot.counters.connects_attempted,
            snapshot.counters.connects_succeeded,
            snapshot.counters.connects_failed,
            snapshot.counters.messages_sent,
            snapshot.counters.messages_received,
            if thresholds.passed { "pass" } else { "fail" }
        );

        Ok(RunReport {
            timestamp,
            target: url.to_string(),
            connector: self.connector.name().to_string(),
            outcome,
            duration_ms,
            counters: snapshot.counters,
            connect_success_rate: snapshot.counters.connect_success_rate(),
            connect_errors: snapshot.counters.connect_errors(),
            connect_time: snapshot.latency_summary(),
            sessions: summary,
            thresholds,
        })
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RampStage, ThresholdEntry};
    use crate::connector::{MockBehavior, MockConnector};
    use crate::threshold::RuleStatus;
    use tokio::time::sleep;

    fn config(stages: &[(u64, u32)], thresholds: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        config.target.url = "ws://localhost:8080/ws".to_string();
        config.scenario.seed = Some(1);
        config.ramp.stages = stages
            .iter()
            .map(|&(duration_ms, target)| RampStage {
                duration_ms,
                target,
            })
            .collect();
        for &(metric, expr) in thresholds {
            config
                .thresholds
                .entry(metric.to_string())
                .or_default()
                .push(ThresholdEntry::Expr(expr.to_string()));
        }
        config.run.no_thresholds = thresholds.is_empty();
        config
    }

    fn mock(behavior: MockBehavior) -> (Arc<MockConnector>, Arc<dyn Connector>) {
        let connector = Arc::new(MockConnector::new(behavior));
        (connector.clone(), connector)
    }

    fn rejecting(status: u16) -> MockBehavior {
        MockBehavior {
            status,
            ..MockBehavior::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_user_connects_and_greets() {
        let (_, connector) = mock(MockBehavior::default());
        let controller = RunController::new(
            config(&[(0, 1)], &[("connect_success", "rate>0.99")]),
            connector,
        );

        let report = controller.run().await.unwrap();
        let c = report.counters;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(c.connects_attempted, 1);
        assert_eq!(c.connects_succeeded, 1);
        assert!(c.messages_sent >= 1);
        assert_eq!(c.disconnected, 1);
        assert!(report.duration_ms <= 4_000);
        assert_eq!(report.connect_success_rate, Some(1.0));
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_url_fails_before_connecting() {
        let (mock, connector) = mock(MockBehavior::default());
        let mut cfg = config(&[(1_000, 5)], &[("connect_success", "rate>0.99")]);
        cfg.target.url = String::new();

        let controller = RunController::new(cfg, connector);
        let metrics = controller.metrics();

        assert_eq!(controller.run().await.unwrap_err(), ConfigError::MissingUrl);
        assert_eq!(metrics.counters().connects_attempted, 0);
        assert_eq!(mock.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_threshold_fails_before_connecting() {
        let (mock, connector) = mock(MockBehavior::default());
        let controller = RunController::new(
            config(&[(1_000, 5)], &[("messages_sent", "count>>5")]),
            connector,
        );

        assert!(matches!(
            controller.run().await,
            Err(ConfigError::InvalidThreshold { .. })
        ));
        assert_eq!(mock.connect_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_handshake_counts_as_failure() {
        let (_, connector) = mock(rejecting(500));
        let controller = RunController::new(
            config(&[(0, 1)], &[("ws_connects", "rate>0.99")]),
            connector,
        );

        let report = controller.run().await.unwrap();
        let c = report.counters;
        assert_eq!(c.connects_attempted, 1);
        assert_eq!(c.connects_failed, 1);
        assert_eq!(c.connects_succeeded, 0);
        assert_eq!(c.messages_sent, 0);
        assert_eq!(report.sessions.failed, 1);
        assert_eq!(report.thresholds.results[0].status, RuleStatus::Fail);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_count_at_bound_fails_report() {
        let (_, connector) = mock(rejecting(500));
        let controller = RunController::new(
            config(&[(0, 10)], &[("connects_failed", "count<10")]),
            connector,
        );

        let report = controller.run().await.unwrap();
        assert_eq!(report.counters.connects_failed, 10);
        assert!(!report.passed());
        assert_eq!(report.thresholds.results[0].observed, Some(10.0));
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_drains_all_sessions() {
        let (_, connector) = mock(MockBehavior::default());
        let cfg = config(
            &[(1_000, 50), (60_000, 50)],
            &[("connect_success", "rate>0.99")],
        );
        let grace_ms = cfg.session.close_grace_ms;
        let controller = RunController::new(cfg, connector);

        let cancel = controller.cancel_token();
        let status = controller.status_rx();
        let interrupter = tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            let active = status.borrow().active;
            cancel.cancel();
            active
        });

        let report = controller.run().await.unwrap();
        let c = report.counters;
        assert_eq!(interrupter.await.unwrap(), 50);
        assert_eq!(report.outcome, RunOutcome::Interrupted);
        assert_eq!(report.sessions.peak_active, 50);
        assert_eq!(report.sessions.closed, 50);
        assert_eq!(report.sessions.abandoned, 0);
        assert_eq!(c.connects_succeeded, 50);
        assert_eq!(c.disconnected, 50);
        assert!(report.duration_ms <= 5_000 + grace_ms);
        assert!(report.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_on_fail_stops_run() {
        let (_, connector) = mock(rejecting(503));
        let mut cfg = config(&[(1_000, 10), (60_000, 10)], &[]);
        cfg.run.no_thresholds = false;
        cfg.run.evaluate_every_ms = Some(1_000);
        cfg.thresholds.insert(
            "connect_errors".to_string(),
            vec![ThresholdEntry::Detailed {
                threshold: "count<5".to_string(),
                abort_on_fail: true,
            }],
        );

        let report = RunController::new(cfg, connector).run().await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert!(report.duration_ms < 2_000);
        assert!(report.counters.connects_failed >= 5);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_ramp_passes() {
        let (mock, connector) = mock(MockBehavior::default());
        let controller = RunController::new(
            config(
                &[(2_000, 5), (10_000, 5), (2_000, 0)],
                &[
                    ("ws_connects", "rate>0.99"),
                    ("ws_connect_errors", "count<1"),
                    ("ws_msgs_sent", "count>10"),
                    ("ws_msgs_received", "count>10"),
                    ("ws_connect_time_ms", "p(95)<1000"),
                ],
            ),
            connector,
        );
        let status = controller.status_rx();

        let report = controller.run().await.unwrap();
        let c = report.counters;
        assert_eq!(report.outcome, RunOutcome::Completed, "{:?}", report.thresholds);
        assert!(report.passed(), "{:?}", report.thresholds);
        assert_eq!(report.sessions.peak_active, 5);
        assert_eq!(c.connects_attempted, mock.connect_calls());
        assert_eq!(c.connects_attempted, report.sessions.spawned);
        assert_eq!(c.connects_attempted, c.connects_succeeded + c.connects_failed);
        assert_eq!(c.disconnected, c.connects_succeeded);
        assert_eq!(report.sessions.closed, report.sessions.spawned);
        assert!(c.messages_received <= c.messages_sent);

        let last = status.borrow().clone();
        assert!(last.draining);
        assert_eq!(last.active + last.retiring, 0);
    }
}
