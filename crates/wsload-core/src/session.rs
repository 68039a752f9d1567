use crate::config::Config;
use crate::connector::{Connection, Connector, Inbound};
use crate::error::{ConnectError, TransportError};
use crate::metrics::{MetricEvent, MetricsRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VirtualUser {
    pub id: u64,
    pub started_at: Instant,
}

impl VirtualUser {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Instant::now(),
        }
    }
}

/// Per-run session parameters shared by every virtual user.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub send_interval_min_ms: u64,
    pub send_interval_max_ms: u64,
    pub close_grace: Duration,
    pub seed: Option<u64>,
}

impl SessionSettings {
    pub fn from_config(url: &url::Url, config: &Config) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout: config.target.connect_timeout(),
            send_interval_min_ms: config.session.send_interval_min_ms,
            send_interval_max_ms: config.session.send_interval_max_ms,
            close_grace: Duration::from_millis(config.session.close_grace_ms),
            seed: config.scenario.seed,
        }
    }
}

/// Why the open phase ended.
enum OpenExit {
    Cancelled,
    PeerClosed,
    Error(TransportError),
}

/// One virtual user's connection lifecycle:
/// `Connecting -> Open -> Closing -> Closed`, or `Failed` from `Connecting`/`Open`.
///
/// Every terminal transition goes through [`Session::finish`], which records
/// whatever the current state still owes the metrics (a connect failure, or a
/// disconnect) and is a no-op once the session is terminal. Dropping a session
/// that never reached a terminal state (a task aborted at the hard deadline)
/// finishes it as `Failed`.
pub struct Session {
    user: VirtualUser,
    state: SessionState,
    settings: Arc<SessionSettings>,
    connector: Arc<dyn Connector>,
    metrics: Arc<MetricsRegistry>,
    rng: StdRng,
    attempted: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Session {
    pub fn new(
        user: VirtualUser,
        settings: Arc<SessionSettings>,
        connector: Arc<dyn Connector>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::from_seed(user_seed(seed, user.id)),
            None => StdRng::from_entropy(),
        };

        Self {
            user,
            state: SessionState::Connecting,
            settings,
            connector,
            metrics,
            rng,
            attempted: false,
            _permit: None,
        }
    }

    /// Hold a live-session slot until this session is dropped.
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self._permit = Some(permit);
        self
    }

    pub fn user(&self) -> &VirtualUser {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state.
    ///
    /// Cancellation while connecting abandons the attempt, which counts as a
    /// connect failure. An open session closes within the configured grace
    /// period.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionState {
        let mut conn = match self.connect(&cancel).await {
            Ok(conn) => conn,
            Err(ConnectError::Cancelled) => {
                debug!("VU {}: cancelled while connecting", self.user.id);
                self.finish(SessionState::Failed);
                return self.state;
            }
            Err(e) => {
                warn!("VU {}: connect failed: {}", self.user.id, e);
                self.finish(SessionState::Failed);
                return self.state;
            }
        };

        let exit = self.run_open(conn.as_mut(), &cancel).await;

        match exit {
            OpenExit::Cancelled => {
                self.state = SessionState::Closing;
                match timeout(self.settings.close_grace, conn.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("VU {}: close error: {}", self.user.id, e),
                    Err(_) => debug!("VU {}: close handshake timed out", self.user.id),
                }
                drop(conn);
                self.finish(SessionState::Closed);
            }
            OpenExit::PeerClosed => {
                drop(conn);
                self.finish(SessionState::Closed);
            }
            OpenExit::Error(e) => {
                warn!("VU {}: WebSocket error: {}", self.user.id, e);
                drop(conn);
                self.finish(SessionState::Failed);
            }
        }

        debug!(
            "VU {}: disconnected ({:?}) after {:?}",
            self.user.id,
            self.state,
            self.user.started_at.elapsed()
        );
        self.state
    }

    async fn connect(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let start = Instant::now();
        self.metrics.record(MetricEvent::ConnectAttempt);
        self.attempted = true;

        let attempt = timeout(
            self.settings.connect_timeout,
            self.connector.connect(&self.settings.url),
        );
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            result = attempt => match result {
                Ok(result) => result?,
                Err(_) => return Err(ConnectError::Timeout(self.settings.connect_timeout)),
            },
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        self.metrics.record(MetricEvent::ConnectSuccess { latency_ms });
        self.state = SessionState::Open;
        debug!("VU {}: connected in {}ms", self.user.id, latency_ms);
        Ok(conn)
    }

    async fn run_open(
        &mut self,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
    ) -> OpenExit {
        if let Err(e) = conn.send(format!("User_{} joined", self.user.id)).await {
            return OpenExit::Error(e);
        }
        self.metrics.record(MetricEvent::MessageSent);

        let send_timer = sleep_until(self.next_send_deadline());
        tokio::pin!(send_timer);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return OpenExit::Cancelled,

                _ = &mut send_timer => {
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return OpenExit::Cancelled,
                        r = conn.send(format!("User_{}: message", self.user.id)) => r,
                    };
                    if let Err(e) = sent {
                        return OpenExit::Error(e);
                    }
                    self.metrics.record(MetricEvent::MessageSent);

                    let next = self.next_send_deadline();
                    send_timer.as_mut().reset(next);
                }

                event = conn.next_event() => match event {
                    Some(Ok(Inbound::Message)) => {
                        self.metrics.record(MetricEvent::MessageReceived);
                    }
                    Some(Ok(Inbound::Closed)) | None => return OpenExit::PeerClosed,
                    Some(Err(e)) => return OpenExit::Error(e),
                },
            }
        }
    }

    /// Draw a fresh interval in `[min, max)` and return the next send deadline.
    fn next_send_deadline(&mut self) -> Instant {
        Instant::now() + self.next_interval()
    }

    fn next_interval(&mut self) -> Duration {
        let ms = self
            .rng
            .gen_range(self.settings.send_interval_min_ms..self.settings.send_interval_max_ms);
        Duration::from_millis(ms)
    }

    /// Move to a terminal state, recording what the current state still owes.
    /// Returns false if the session was already terminal.
    fn finish(&mut self, to: SessionState) -> bool {
        debug_assert!(to.is_terminal());
        if self.state.is_terminal() {
            return false;
        }

        match self.state {
            // A session dropped before its first poll never attempted anything.
            SessionState::Connecting if self.attempted => {
                self.metrics.record(MetricEvent::ConnectFailure);
            }
            SessionState::Connecting => {}
            SessionState::Open | SessionState::Closing => {
                if to == SessionState::Failed {
                    self.metrics.record(MetricEvent::SessionError);
                }
                self.metrics.record(MetricEvent::Disconnected);
            }
            SessionState::Closed | SessionState::Failed => {}
        }

        self.state = to;
        true
    }
}

/// Per-user RNG seed: distinct for every (run seed, user id) pair.
fn user_seed(seed: u64, id: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..8].copy_from_slice(&seed.to_le_bytes());
    out[8..16].copy_from_slice(&id.to_le_bytes());
    out
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            warn!("VU {}: abandoned in state {:?}", self.user.id, self.state);
            self.finish(SessionState::Failed);
        }
    }
}
