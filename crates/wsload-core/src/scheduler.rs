use crate::config::SchedulerConfig;
use crate::connector::Connector;
use crate::error::SpawnError;
use crate::metrics::{MetricEvent, MetricsRegistry};
use crate::ramp::RampPlanner;
use crate::session::{Session, SessionSettings, SessionState, VirtualUser};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builds the session for a freshly assigned virtual user.
pub trait SessionFactory: Send + Sync {
    fn create(&self, user: VirtualUser) -> Result<Session, SpawnError>;
}

/// Default factory: one connector-backed session per user, optionally capped
/// at a number of live sessions.
pub struct ConnectorSessionFactory {
    settings: Arc<SessionSettings>,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsRegistry>,
    slots: Option<(Arc<Semaphore>, usize)>,
}

impl ConnectorSessionFactory {
    pub fn new(
        settings: Arc<SessionSettings>,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            settings,
            connector,
            metrics,
            slots: None,
        }
    }

    pub fn with_max_sessions(mut self, limit: usize) -> Self {
        self.slots = Some((Arc::new(Semaphore::new(limit)), limit));
        self
    }
}

impl SessionFactory for ConnectorSessionFactory {
    fn create(&self, user: VirtualUser) -> Result<Session, SpawnError> {
        let session = Session::new(
            user,
            self.settings.clone(),
            self.connector.clone(),
            self.metrics.clone(),
        );

        match &self.slots {
            None => Ok(session),
            Some((slots, limit)) => {
                let permit = slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| SpawnError::Exhausted { limit: *limit })?;
                Ok(session.with_permit(permit))
            }
        }
    }
}

/// Live view of the scheduler, published every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Index of the running stage; `None` before start and after the ramp
    pub stage: Option<usize>,
    pub desired: u32,
    pub active: usize,
    pub retiring: usize,
    pub spawned: u64,
    pub draining: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    /// Spawn attempts, including ones the factory refused
    pub spawned: u64,
    pub spawn_failures: u64,
    pub peak_active: usize,
    pub closed: u64,
    pub failed: u64,
    /// Sessions aborted at the shutdown deadline
    pub abandoned: u64,
}

struct ActiveSession {
    user: VirtualUser,
    cancel: CancellationToken,
    handle: JoinHandle<SessionState>,
}

/// Drives the ramp: every tick it computes the desired concurrency and spawns
/// or retires sessions (oldest first) to match it. Sessions that end on their
/// own are replaced on the next tick.
pub struct Scheduler {
    planner: RampPlanner,
    factory: Arc<dyn SessionFactory>,
    metrics: Arc<MetricsRegistry>,
    tick: Duration,
    shutdown_deadline: Duration,
    cancel: CancellationToken,
    status_tx: watch::Sender<SchedulerStatus>,
    active: VecDeque<ActiveSession>,
    retiring: Vec<ActiveSession>,
    next_id: u64,
    summary: SchedulerSummary,
}

impl Scheduler {
    pub fn new(
        planner: RampPlanner,
        factory: Arc<dyn SessionFactory>,
        metrics: Arc<MetricsRegistry>,
        config: &SchedulerConfig,
        cancel: CancellationToken,
        status_tx: watch::Sender<SchedulerStatus>,
    ) -> Self {
        Self {
            planner,
            factory,
            metrics,
            tick: Duration::from_millis(config.tick_ms.max(1)),
            shutdown_deadline: Duration::from_millis(config.shutdown_deadline_ms),
            cancel,
            status_tx,
            active: VecDeque::new(),
            retiring: Vec::new(),
            next_id: 1,
            summary: SchedulerSummary::default(),
        }
    }

    /// Run the ramp to completion (or until cancelled), then drain every
    /// session.
    pub async fn run(mut self) -> SchedulerSummary {
        let start = Instant::now();
        let total_ms = self.planner.total_duration_ms();
        let mut ticker = interval_at(start + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Ramp: {} stages over {}ms, peak {} VUs",
            self.planner.stages().len(),
            total_ms,
            self.planner.peak_target()
        );

        loop {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested, stopping ramp");
                break;
            }

            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.reap().await;

            let desired = self.planner.target_at(elapsed_ms);
            self.converge(desired);
            self.publish(self.planner.stage_index_at(elapsed_ms), desired, false);

            if elapsed_ms >= total_ms {
                // Hold the final target for one tick before draining.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.cancel.cancelled() => {}
                }
                info!("Ramp complete after {}ms", start.elapsed().as_millis());
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        self.drain().await;

        info!(
            "Scheduler done: spawned={} spawn_failures={} peak={} closed={} failed={} abandoned={}",
            self.summary.spawned,
            self.summary.spawn_failures,
            self.summary.peak_active,
            self.summary.closed,
            self.summary.failed,
            self.summary.abandoned
        );
        self.summary
    }

    /// Spawn or retire sessions until `desired` are active.
    fn converge(&mut self, desired: u32) {
        let desired = desired as usize;

        while self.active.len() > desired {
            let Some(oldest) = self.active.pop_front() else {
                break;
            };
            debug!("Retiring VU {}", oldest.user.id);
            oldest.cancel.cancel();
            self.retiring.push(oldest);
        }

        while self.active.len() < desired {
            let user = VirtualUser::new(self.next_id);
            self.next_id += 1;
            self.summary.spawned += 1;

            match self.factory.create(user) {
                Ok(session) => {
                    let cancel = self.cancel.child_token();
                    let handle = tokio::spawn(session.run(cancel.clone()));
                    self.active.push_back(ActiveSession {
                        user,
                        cancel,
                        handle,
                    });
                }
                Err(e) => {
                    // Retried on the next tick.
                    warn!("VU {}: could not start session: {}", user.id, e);
                    self.metrics.record(MetricEvent::ConnectAttempt);
                    self.metrics.record(MetricEvent::ConnectFailure);
                    self.summary.spawn_failures += 1;
                    break;
                }
            }
        }

        self.summary.peak_active = self.summary.peak_active.max(self.active.len());
    }

    /// Collect sessions that have reached a terminal state.
    async fn reap(&mut self) {
        let (done, live): (Vec<_>, Vec<_>) = self
            .active
            .drain(..)
            .partition(|s| s.handle.is_finished());
        self.active = live.into();

        let (retired, still_retiring): (Vec<_>, Vec<_>) = self
            .retiring
            .drain(..)
            .partition(|s| s.handle.is_finished());
        self.retiring = still_retiring;

        for s in done.into_iter().chain(retired) {
            let result = s.handle.await;
            self.account(s.user.id, result);
        }
    }

    fn account(&mut self, id: u64, result: Result<SessionState, JoinError>) {
        match result {
            Ok(SessionState::Closed) => self.summary.closed += 1,
            Ok(state) => {
                debug!("VU {} ended in {:?}", id, state);
                self.summary.failed += 1;
            }
            Err(e) if e.is_cancelled() => self.summary.abandoned += 1,
            Err(e) => {
                error!("VU {}: session task panicked: {}", id, e);
                self.summary.failed += 1;
            }
        }
    }

    /// Drive desired concurrency to zero and wait for every session, aborting
    /// whatever is left at the shutdown deadline.
    async fn drain(&mut self) {
        self.converge(0);
        self.publish(None, 0, true);

        let deadline = Instant::now() + self.shutdown_deadline;
        loop {
            self.reap().await;
            self.publish(None, 0, true);
            if self.retiring.is_empty() {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Shutdown deadline reached, abandoning {} sessions",
                    self.retiring.len()
                );
                for s in std::mem::take(&mut self.retiring) {
                    s.handle.abort();
                    // Awaiting lets the aborted session record its own failure.
                    let result = s.handle.await;
                    self.account(s.user.id, result);
                }
                self.publish(None, 0, true);
                return;
            }

            sleep_until((now + self.tick).min(deadline)).await;
        }
    }

    fn publish(&self, stage: Option<usize>, desired: u32, draining: bool) {
        self.status_tx.send_replace(SchedulerStatus {
            stage,
            desired,
            active: self.active.len(),
            retiring: self.retiring.len(),
            spawned: self.summary.spawned,
            draining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RampConfig, RampStage};
    use crate::connector::{MockBehavior, MockConnector};
    use tokio::time::sleep;

    fn settings(connect_timeout: Duration) -> Arc<SessionSettings> {
        Arc::new(SessionSettings {
            url: "ws://mock/ws".to_string(),
            connect_timeout,
            send_interval_min_ms: 2_000,
            send_interval_max_ms: 4_000,
            close_grace: Duration::from_secs(1),
            seed: Some(1),
        })
    }

    fn planner(stages: &[(u64, u32)]) -> RampPlanner {
        RampPlanner::new(RampConfig {
            stages: stages
                .iter()
                .map(|&(duration_ms, target)| RampStage {
                    duration_ms,
                    target,
                })
                .collect(),
        })
    }

    struct Rig {
        scheduler: Scheduler,
        status: watch::Receiver<SchedulerStatus>,
        metrics: Arc<MetricsRegistry>,
        cancel: CancellationToken,
    }

    fn rig(
        stages: &[(u64, u32)],
        behavior: MockBehavior,
        connect_timeout: Duration,
        max_sessions: Option<usize>,
        config: SchedulerConfig,
    ) -> Rig {
        let metrics = Arc::new(MetricsRegistry::new());
        let mut factory = ConnectorSessionFactory::new(
            settings(connect_timeout),
            Arc::new(MockConnector::new(behavior)),
            metrics.clone(),
        );
        if let Some(limit) = max_sessions {
            factory = factory.with_max_sessions(limit);
        }
        let cancel = CancellationToken::new();
        let (status_tx, status) = watch::channel(SchedulerStatus::default());
        let scheduler = Scheduler::new(
            planner(stages),
            Arc::new(factory),
            metrics.clone(),
            &config,
            cancel.clone(),
            status_tx,
        );
        Rig {
            scheduler,
            status,
            metrics,
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_sessions_track_interpolated_target() {
        let rig = rig(
            &[(10_000, 20)],
            MockBehavior::default(),
            Duration::from_secs(10),
            None,
            SchedulerConfig::default(),
        );
        let status = rig.status.clone();
        let handle = tokio::spawn(rig.scheduler.run());

        for (at_ms, expected) in [(2_500u64, 5u32), (5_000, 10), (7_500, 15)] {
            sleep(Duration::from_millis(2_500)).await;
            let s = status.borrow().clone();
            assert!(
                s.desired + 1 >= expected && s.desired <= expected,
                "at {}ms desired {} expected {}",
                at_ms,
                s.desired,
                expected
            );
            assert_eq!(s.active, s.desired as usize);
        }

        let summary = handle.await.unwrap();
        assert_eq!(summary.spawned, 20);
        assert_eq!(summary.closed, 20);
        assert_eq!(summary.peak_active, 20);

        let c = rig.metrics.counters();
        assert_eq!(c.connects_attempted, 20);
        assert_eq!(c.connects_succeeded, 20);
        assert_eq!(c.disconnected, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_oldest_first() {
        let mut rig = rig(
            &[(0, 5)],
            MockBehavior::default(),
            Duration::from_secs(10),
            None,
            SchedulerConfig::default(),
        );

        rig.scheduler.converge(5);
        rig.scheduler.converge(2);

        let active: Vec<u64> = rig.scheduler.active.iter().map(|s| s.user.id).collect();
        let retiring: Vec<u64> = rig.scheduler.retiring.iter().map(|s| s.user.id).collect();
        assert_eq!(active, vec![4, 5]);
        assert_eq!(retiring, vec![1, 2, 3]);
        assert!(rig.scheduler.retiring.iter().all(|s| s.cancel.is_cancelled()));

        rig.scheduler.converge(4);
        let active: Vec<u64> = rig.scheduler.active.iter().map(|s| s.user.id).collect();
        assert_eq!(active, vec![4, 5, 6, 7]);

        // 1-3 were retired before their handshake ran; 4-7 get to open.
        sleep(Duration::from_millis(1)).await;
        rig.scheduler.drain().await;
        assert_eq!(rig.scheduler.summary.closed, 4);
        assert_eq!(rig.scheduler.summary.failed, 3);

        let c = rig.metrics.counters();
        assert_eq!(c.connects_attempted, 7);
        assert_eq!(c.connects_failed, 3);
        assert_eq!(c.disconnected, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_keeps_live_sessions_in_spawn_order() {
        let mut rig = rig(
            &[(0, 1)],
            MockBehavior::default(),
            Duration::from_secs(10),
            None,
            SchedulerConfig::default(),
        );

        for (id, finished) in [(1, false), (2, true), (3, false), (4, true), (5, false)] {
            let cancel = CancellationToken::new();
            let until = cancel.clone();
            let handle = tokio::spawn(async move {
                if !finished {
                    until.cancelled().await;
                }
                SessionState::Closed
            });
            rig.scheduler.active.push_back(ActiveSession {
                user: VirtualUser::new(id),
                cancel,
                handle,
            });
        }
        sleep(Duration::from_millis(1)).await;

        rig.scheduler.reap().await;
        let active: Vec<u64> = rig.scheduler.active.iter().map(|s| s.user.id).collect();
        assert_eq!(active, vec![1, 3, 5]);
        assert_eq!(rig.scheduler.summary.closed, 2);

        rig.scheduler.converge(1);
        let retiring: Vec<u64> = rig.scheduler.retiring.iter().map(|s| s.user.id).collect();
        assert_eq!(retiring, vec![1, 3]);

        rig.scheduler.drain().await;
        assert_eq!(rig.scheduler.summary.closed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_exhaustion_is_retried_not_fatal() {
        let rig = rig(
            &[(0, 5), (2_000, 5)],
            MockBehavior::default(),
            Duration::from_secs(10),
            Some(2),
            SchedulerConfig::default(),
        );
        let status = rig.status.clone();
        let handle = tokio::spawn(rig.scheduler.run());

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(status.borrow().active, 2);

        let summary = handle.await.unwrap();
        assert!(summary.spawn_failures >= 10, "failures: {}", summary.spawn_failures);
        assert_eq!(summary.closed, 2);

        let c = rig.metrics.counters();
        assert_eq!(c.connects_attempted, summary.spawned);
        assert_eq!(c.connects_failed, summary.spawn_failures);
        assert_eq!(c.connects_succeeded + c.connects_failed, c.connects_attempted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sessions_are_replaced() {
        let rig = rig(
            &[(0, 3), (1_000, 3)],
            MockBehavior {
                status: 503,
                ..MockBehavior::default()
            },
            Duration::from_secs(10),
            None,
            SchedulerConfig::default(),
        );

        let summary = rig.scheduler.run().await;

        // Every tick replaces the three sessions that failed on the previous one.
        assert!(summary.spawned > 3, "spawned: {}", summary.spawned);
        assert_eq!(summary.failed, summary.spawned);
        let c = rig.metrics.counters();
        assert_eq!(c.connects_failed, c.connects_attempted);
        assert_eq!(c.connects_attempted, summary.spawned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_all_sessions() {
        let rig = rig(
            &[(0, 50), (600_000, 50)],
            MockBehavior::default(),
            Duration::from_secs(10),
            None,
            SchedulerConfig::default(),
        );
        let status = rig.status.clone();
        let handle = tokio::spawn(rig.scheduler.run());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(status.borrow().active, 50);
        rig.cancel.cancel();

        let summary = handle.await.unwrap();
        assert_eq!(summary.closed, 50);
        assert_eq!(summary.abandoned, 0);
        let s = status.borrow().clone();
        assert_eq!((s.active, s.retiring), (0, 0));
        assert_eq!(rig.metrics.counters().disconnected, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sessions_abandoned_at_deadline() {
        let rig = rig(
            &[(0, 3), (60_000, 3)],
            MockBehavior {
                close_delay: Duration::from_secs(3_600),
                ..MockBehavior::default()
            },
            Duration::from_secs(10),
            None,
            SchedulerConfig {
                shutdown_deadline_ms: 500,
                ..SchedulerConfig::default()
            },
        );
        let handle = tokio::spawn(rig.scheduler.run());

        sleep(Duration::from_secs(1)).await;
        rig.cancel.cancel();
        let start = Instant::now();
        let summary = handle.await.unwrap();

        // The close grace (1s) outlasts the deadline, so all three are still closing.
        assert!(start.elapsed() <= Duration::from_millis(600));
        assert_eq!(summary.abandoned, 3);
        let c = rig.metrics.counters();
        assert_eq!(c.connects_succeeded, 3);
        assert_eq!(c.session_errors, 3);
        assert_eq!(c.disconnected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_sessions_released_promptly_on_cancel() {
        let rig = rig(
            &[(0, 3), (60_000, 3)],
            MockBehavior {
                connect_delay: Duration::from_secs(3_600),
                ..MockBehavior::default()
            },
            Duration::from_secs(7_200),
            None,
            SchedulerConfig::default(),
        );
        let handle = tokio::spawn(rig.scheduler.run());

        sleep(Duration::from_secs(1)).await;
        rig.cancel.cancel();
        let start = Instant::now();
        let summary = handle.await.unwrap();

        assert!(start.elapsed() <= Duration::from_millis(200));
        assert_eq!(summary.abandoned, 0);
        assert_eq!(summary.failed, 3);
        let c = rig.metrics.counters();
        assert_eq!(c.connects_attempted, 3);
        assert_eq!(c.connects_failed, 3);
    }
}
