//! Connection Supervisor
//!
//! Owns the remote connection lifecycle and is the only writer of the
//! [`NetworkMonitor`] state.
//!
//! ```text
//! connecting -> connected -> disconnected -> reconnecting -> connected
//!                                                         -> failed (until reset)
//! ```
//!
//! Entering `connected` from any other state replays the offline queue.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, duration_millis};
use crate::config::SupervisorConfig;
use crate::error::QueryError;
use crate::network::{ConnectivityClass, ConnectivitySignal, NetworkMonitor};
use crate::offline_queue::OfflineQueue;
use crate::remote::RemoteLink;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;

/// Name of the health-check task registered with the [`Scheduler`]
pub const HEALTH_CHECK_TASK: &str = "connection_health_check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnect attempts exhausted; only [`ConnectionSupervisor::reset`] leaves it
    Failed,
}

/// Published connection status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_connected_at: Option<u64>,
    pub last_error: Option<QueryError>,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_connected_at: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Connection lifecycle owner
pub struct ConnectionSupervisor {
    me: Weak<Self>,
    remote: Arc<dyn RemoteLink>,
    monitor: Arc<NetworkMonitor>,
    queue: Arc<OfflineQueue>,
    config: SupervisorConfig,
    backoff: RetryPolicy,
    clock: Arc<dyn Clock>,
    status: watch::Sender<ConnectionStatus>,
    foreground: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteLink>,
        monitor: Arc<NetworkMonitor>,
        queue: Arc<OfflineQueue>,
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::initial());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            remote,
            monitor,
            queue,
            backoff: RetryPolicy::from(&config),
            config,
            clock,
            status,
            foreground: AtomicBool::new(true),
            reconnect_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn get_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Receive every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }

    async fn probe(&self) -> Result<(), QueryError> {
        match tokio::time::timeout(self.config.probe_timeout, self.remote.ping()).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::timeout(self.config.probe_timeout)),
        }
    }

    /// First connection attempt; schedules reconnects on failure
    pub async fn connect(&self) -> bool {
        if self.state() == ConnectionState::Failed {
            debug!("Connection failed permanently; connect ignored until reset");
            return false;
        }
        self.set_state(ConnectionState::Connecting);
        info!(remote = self.remote.name(), "Connecting");

        match self.probe().await {
            Ok(()) => {
                self.enter_connected().await;
                true
            }
            Err(e) => {
                self.enter_disconnected(e);
                self.schedule_reconnect();
                false
            }
        }
    }

    async fn enter_connected(&self) {
        let previous = self.state();
        let now = self.clock.now_millis();
        self.cancel_reconnect();
        self.status.send_modify(|status| {
            status.state = ConnectionState::Connected;
            status.reconnect_attempts = 0;
            status.last_connected_at = Some(now);
            status.last_error = None;
        });
        self.monitor.set_reachable(true);

        if previous != ConnectionState::Connected {
            info!(from = ?previous, "Connected");
            let report = self.queue.process_queue().await;
            debug!(completed = report.completed, skipped = report.skipped, "Replay after connect");
        }
    }

    fn enter_disconnected(&self, error: QueryError) {
        warn!(error = %error, "Backend unreachable");
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.last_error = Some(error);
        });
        self.monitor.set_reachable(false);
    }

    fn schedule_reconnect(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut task = self.reconnect_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(async move { me.reconnect_loop().await }));
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            let attempt = self.status.borrow().reconnect_attempts + 1;
            if attempt > self.config.max_reconnect_attempts {
                self.set_state(ConnectionState::Failed);
                error!(
                    attempts = self.config.max_reconnect_attempts,
                    "Reconnect attempts exhausted; connection failed"
                );
                return;
            }

            self.status.send_modify(|status| {
                status.state = ConnectionState::Reconnecting;
                status.reconnect_attempts = attempt;
            });
            let delay = self.backoff.delay_for(attempt);
            info!(attempt, delay_ms = duration_millis(delay), "Reconnecting");
            tokio::time::sleep(delay).await;

            if self.state() == ConnectionState::Connected {
                return;
            }
            match self.probe().await {
                Ok(()) => {
                    // Detach first so enter_connected does not abort this task
                    self.reconnect_task.lock().take();
                    self.enter_connected().await;
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.status.send_modify(|status| status.last_error = Some(e));
                }
            }
        }
    }

    /// One health probe. Skipped in the background and in the `failed` state.
    ///
    /// Success outside `connected` promotes to `connected`; failure while
    /// `connected` demotes to `disconnected` and starts reconnecting.
    pub async fn health_check(&self) -> bool {
        let state = self.state();
        if !self.foreground.load(Ordering::Acquire) || state == ConnectionState::Failed {
            return state == ConnectionState::Connected;
        }

        match self.probe().await {
            Ok(()) => {
                if state != ConnectionState::Connected {
                    self.enter_connected().await;
                }
                true
            }
            Err(e) => {
                if state == ConnectionState::Connected {
                    self.enter_disconnected(e);
                    self.schedule_reconnect();
                } else {
                    debug!(error = %e, state = ?state, "Health check failed");
                }
                false
            }
        }
    }

    /// Entry point for OS connectivity callbacks
    pub async fn handle_connectivity_signal(&self, signal: ConnectivitySignal) {
        self.monitor.apply_signal(&signal);

        if signal.class() == ConnectivityClass::None {
            self.cancel_reconnect();
            if !matches!(self.state(), ConnectionState::Failed | ConnectionState::Disconnected) {
                self.enter_disconnected(QueryError::network("device reported no network"));
            }
            return;
        }

        match self.state() {
            ConnectionState::Connected | ConnectionState::Failed => {}
            _ => {
                self.cancel_reconnect();
                self.connect().await;
            }
        }
    }

    /// Foreground/background transition; returning to the foreground probes
    /// immediately and replays the queue
    pub async fn set_foreground(&self, foreground: bool) {
        let was = self.foreground.swap(foreground, Ordering::AcqRel);
        if foreground && !was {
            debug!("App foregrounded");
            self.health_check().await;
            self.queue.process_queue().await;
        }
    }

    /// Leave the `failed` state and connect again
    pub async fn reset(&self) -> bool {
        self.cancel_reconnect();
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.reconnect_attempts = 0;
        });
        info!("Connection reset");
        self.connect().await
    }

    /// Probe every `health_check_interval`
    pub fn start_health_checks(self: &Arc<Self>, scheduler: &Scheduler) {
        let weak = Arc::downgrade(self);
        scheduler.every(HEALTH_CHECK_TASK, self.config.health_check_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.health_check().await;
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.cancel_reconnect();
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}
