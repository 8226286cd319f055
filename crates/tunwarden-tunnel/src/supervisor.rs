//! Session supervision
//!
//! The [`Supervisor`] owns the single [`Session`] and is the only code that
//! changes it. It runs as one task draining a request queue; IPC commands and
//! the watchdog's liveness checks go through the same queue, so transitions
//! never interleave and an adapter cannot be torn down twice.
//!
//! ```text
//! Idle --connect--> Connecting --ok--> Connected --disconnect/timeout/fatal--> Disconnecting --> Idle
//!                        \--error--> Failed --rollback--> Idle
//! ```

use crate::adapter::{AdapterHandle, AdapterManager};
use crate::error::{TunnelError, TunnelResult};
use crate::routes::{RouteEntry, RouteReconciler};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tunwarden_protocol::{Counters, TunnelConfig};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No tunnel
    Idle,
    /// Adapter and routes being set up
    Connecting,
    /// Tunnel up
    Connected,
    /// Tunnel being torn down
    Disconnecting,
    /// Connect failed; partial state being rolled back
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Source of monotonic time for liveness checks
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: std::sync::Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    /// Start at the current instant
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *offset += by;
    }
}

#[cfg(test)]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The one tunnel session
#[derive(Debug)]
pub struct Session {
    /// Current state
    pub state: SessionState,
    /// Adapter, present from create until teardown
    pub adapter: Option<AdapterHandle>,
    /// Last time the client showed signs of life
    pub last_heartbeat: Instant,
    /// Network changes to undo on teardown
    pub installed: Vec<RouteEntry>,
}

/// Reply to a status request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// State at the time of the request
    pub state: SessionState,
    /// Counters, when connected
    pub counters: Option<Counters>,
}

impl StatusReport {
    /// Total received bytes (0 when idle)
    pub fn rx(&self) -> u64 {
        self.counters.as_ref().map_or(0, Counters::rx)
    }

    /// Total sent bytes (0 when idle)
    pub fn tx(&self) -> u64 {
        self.counters.as_ref().map_or(0, Counters::tx)
    }
}

/// Read-only view of the session for callers outside the actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current state
    pub state: SessionState,
    /// Adapter name when one is held
    pub adapter: Option<String>,
    /// Recorded network changes
    pub installed: Vec<RouteEntry>,
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Adapter name to create
    pub adapter_name: String,
    /// Time without a heartbeat before the session is torn down
    pub liveness_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            adapter_name: "tunwarden".to_string(),
            liveness_timeout: Duration::from_secs(60),
        }
    }
}

/// Owns the session and performs every transition
pub struct Supervisor {
    config: SupervisorConfig,
    adapters: AdapterManager,
    routes: RouteReconciler,
    clock: Arc<dyn Clock>,
    session: Session,
}

impl Supervisor {
    /// Create an idle supervisor
    pub fn new(
        config: SupervisorConfig,
        adapters: AdapterManager,
        routes: RouteReconciler,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            config,
            adapters,
            routes,
            clock,
            session: Session {
                state: SessionState::Idle,
                adapter: None,
                last_heartbeat: now,
                installed: Vec::new(),
            },
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Current session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Snapshot of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.session.state,
            adapter: self.session.adapter.as_ref().map(|a| a.name().to_string()),
            installed: self.session.installed.clone(),
        }
    }

    fn transition(&mut self, to: SessionState, trigger: &str) {
        let from = self.session.state;
        self.session.state = to;
        tracing::info!(from = %from, to = %to, command = trigger, "Session transition");
    }

    /// Parse `text`, bring up the adapter and install routes.
    ///
    /// A parse failure changes nothing. Any later failure rolls back what was
    /// done and leaves the session idle.
    pub async fn connect(&mut self, text: &str) -> TunnelResult<()> {
        if matches!(
            self.session.state,
            SessionState::Connecting | SessionState::Connected
        ) {
            tracing::warn!(state = %self.session.state, "connect refused: session already active");
            return Err(TunnelError::AlreadyActive);
        }

        let config = TunnelConfig::parse(text).map_err(|e| {
            tracing::error!(command = "connect", state = %self.session.state, "Rejected config: {}", e);
            TunnelError::from(e)
        })?;

        self.transition(SessionState::Connecting, "connect");
        match self.bring_up(&config).await {
            Ok(()) => {
                self.session.last_heartbeat = self.clock.now();
                self.transition(SessionState::Connected, "connect");
                Ok(())
            }
            Err(e) => {
                tracing::error!(command = "connect", state = "connecting", "Connect failed: {}", e);
                self.transition(SessionState::Failed, "connect");
                self.teardown().await;
                self.transition(SessionState::Idle, "connect");
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, config: &TunnelConfig) -> TunnelResult<()> {
        let handle = self.adapters.create(&self.config.adapter_name).await?;
        let name = handle.name().to_string();
        self.session.adapter = Some(handle);

        if let Some(ref handle) = self.session.adapter {
            self.adapters.configure(handle, config).await?;
            self.adapters.set_up(handle).await?;
        }

        let report = self
            .routes
            .apply(&name, config, &mut self.session.installed)
            .await;
        if !report.failures.is_empty() {
            tracing::warn!(
                "{} of {} network changes failed on {}",
                report.failures.len(),
                report.requested,
                name
            );
        }
        Ok(())
    }

    /// Roll back routes, then take down and close the adapter. Never fails;
    /// problems are logged.
    async fn teardown(&mut self) {
        if let Some(ref handle) = self.session.adapter {
            let name = handle.name().to_string();
            self.routes.rollback(&name, &mut self.session.installed).await;
        } else {
            self.session.installed.clear();
        }

        if let Some(mut handle) = self.session.adapter.take() {
            if let Err(e) = self.adapters.set_down(&handle).await {
                tracing::debug!("Could not take {} down: {}", handle.name(), e);
            }
            if let Err(e) = self.adapters.close(&mut handle).await {
                tracing::warn!("Failed to close adapter {}: {}", handle.name(), e);
            }
        }
    }

    async fn disconnect_with(&mut self, trigger: &str) {
        self.transition(SessionState::Disconnecting, trigger);
        self.teardown().await;
        self.transition(SessionState::Idle, trigger);
    }

    /// Tear the session down. A no-op when idle.
    pub async fn disconnect(&mut self) -> TunnelResult<()> {
        if self.session.state == SessionState::Idle {
            tracing::debug!("disconnect while idle");
            return Ok(());
        }
        self.disconnect_with("disconnect").await;
        Ok(())
    }

    /// Refresh the heartbeat and read counters.
    ///
    /// If the driver reports the adapter gone the session is torn down.
    pub async fn status(&mut self) -> TunnelResult<StatusReport> {
        if self.session.state != SessionState::Connected {
            return Ok(StatusReport {
                state: self.session.state,
                counters: None,
            });
        }

        self.session.last_heartbeat = self.clock.now();
        let result = match self.session.adapter {
            Some(ref handle) => self.adapters.read_counters(handle).await,
            None => Err(TunnelError::ServiceStopped),
        };

        match result {
            Ok(counters) => Ok(StatusReport {
                state: SessionState::Connected,
                counters: Some(counters),
            }),
            Err(e) if e.is_fatal() => {
                tracing::error!(command = "status", state = "connected", "Adapter lost: {}", e);
                self.disconnect_with("status").await;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(command = "status", state = "connected", "Counter read failed: {}", e);
                Err(e)
            }
        }
    }

    /// Tear down a connected session whose client has gone quiet. Returns
    /// whether a teardown happened.
    pub async fn check_liveness(&mut self) -> bool {
        if self.session.state != SessionState::Connected {
            return false;
        }
        let elapsed = self
            .clock
            .now()
            .saturating_duration_since(self.session.last_heartbeat);
        if elapsed <= self.config.liveness_timeout {
            return false;
        }

        tracing::warn!(
            "No heartbeat for {:?} (limit {:?}), disconnecting",
            elapsed,
            self.config.liveness_timeout
        );
        self.disconnect_with("watchdog").await;
        true
    }

    /// Tear down any active session before exit
    pub async fn shutdown(&mut self) {
        if self.session.state != SessionState::Idle {
            self.disconnect_with("shutdown").await;
        }
    }

    /// Run the supervisor as a task and return a handle to it
    pub fn spawn(self) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(self.run(rx));
        (SupervisorHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        tracing::debug!("Supervisor started");
        while let Some(request) = rx.recv().await {
            match request {
                Request::Connect { text, reply } => {
                    let _ = reply.send(self.connect(&text).await);
                }
                Request::Disconnect { reply } => {
                    let _ = reply.send(self.disconnect().await);
                }
                Request::Status { reply } => {
                    let _ = reply.send(self.status().await);
                }
                Request::CheckLiveness { reply } => {
                    let _ = reply.send(self.check_liveness().await);
                }
                Request::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Request::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
        // Every handle dropped without an explicit shutdown
        self.shutdown().await;
        tracing::debug!("Supervisor stopped");
    }
}

enum Request {
    Connect {
        text: String,
        reply: oneshot::Sender<TunnelResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<TunnelResult<()>>,
    },
    Status {
        reply: oneshot::Sender<TunnelResult<StatusReport>>,
    },
    CheckLiveness {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running [`Supervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
}

impl SupervisorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> TunnelResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| TunnelError::ServiceStopped)?;
        rx.await.map_err(|_| TunnelError::ServiceStopped)
    }

    /// Connect with configuration text
    pub async fn connect(&self, text: impl Into<String>) -> TunnelResult<()> {
        let text = text.into();
        self.request(|reply| Request::Connect { text, reply }).await?
    }

    /// Disconnect
    pub async fn disconnect(&self) -> TunnelResult<()> {
        self.request(|reply| Request::Disconnect { reply }).await?
    }

    /// Heartbeat and counters
    pub async fn status(&self) -> TunnelResult<StatusReport> {
        self.request(|reply| Request::Status { reply }).await?
    }

    /// Run one liveness check
    pub async fn check_liveness(&self) -> TunnelResult<bool> {
        self.request(|reply| Request::CheckLiveness { reply }).await
    }

    /// Snapshot of the session
    pub async fn snapshot(&self) -> TunnelResult<SessionSnapshot> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    /// Tear down and stop the supervisor
    pub async fn shutdown(&self) -> TunnelResult<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DEFAULT_TUNNEL_TYPE;
    use crate::driver::MemoryDriver;
    use crate::netops::MemoryNetwork;
    use tunwarden_protocol::encode_key;

    struct Fixture {
        driver: Arc<MemoryDriver>,
        net: Arc<MemoryNetwork>,
        clock: Arc<ManualClock>,
        supervisor: Supervisor,
    }

    fn fixture() -> Fixture {
        let driver = Arc::new(MemoryDriver::new());
        let net = Arc::new(MemoryNetwork::new());
        let clock = Arc::new(ManualClock::new());
        let supervisor = Supervisor::new(
            SupervisorConfig {
                adapter_name: "wg-test".into(),
                liveness_timeout: Duration::from_secs(60),
            },
            AdapterManager::new(driver.clone(), DEFAULT_TUNNEL_TYPE, Duration::from_secs(5)),
            RouteReconciler::new(net.clone(), Duration::from_secs(5)),
            clock.clone(),
        );
        Fixture {
            driver,
            net,
            clock,
            supervisor,
        }
    }

    fn config_text() -> String {
        format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.53.0.14/32\nDNS = 8.8.8.8\n\n\
             [Peer]\nPublicKey = {}\nEndpoint = 203.0.113.5:51820\nAllowedIPs = 0.0.0.0/0\n",
            encode_key(&[1u8; 32]),
            encode_key(&[2u8; 32])
        )
    }

    fn default_routes(net: &MemoryNetwork) -> Vec<tunwarden_protocol::Cidr> {
        net.routes("wg-test")
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let mut f = fixture();
        f.supervisor.connect(&config_text()).await.unwrap();

        assert_eq!(f.supervisor.state(), SessionState::Connected);
        assert!(f.supervisor.session().adapter.is_some());
        assert_eq!(default_routes(&f.net), vec!["0.0.0.0/0".parse().unwrap()]);
        assert_eq!(
            f.supervisor
                .session()
                .installed
                .iter()
                .filter(|e| e.is_route())
                .count(),
            1
        );

        f.supervisor.disconnect().await.unwrap();
        assert_eq!(f.supervisor.state(), SessionState::Idle);
        assert!(f.supervisor.session().installed.is_empty());
        assert!(f.supervisor.session().adapter.is_none());
        assert!(f.net.is_clean());
        assert_eq!(f.driver.live_adapters(), 0);
    }

    #[tokio::test]
    async fn test_connect_while_connected() {
        let mut f = fixture();
        f.supervisor.connect(&config_text()).await.unwrap();

        assert!(matches!(
            f.supervisor.connect(&config_text()).await,
            Err(TunnelError::AlreadyActive)
        ));
        assert_eq!(f.driver.created_total(), 1);
        assert_eq!(f.supervisor.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_malformed_config_changes_nothing() {
        let mut f = fixture();
        let text = "[Interface]\nPrivateKey = c2hvcnQ=\n";

        assert!(matches!(
            f.supervisor.connect(text).await,
            Err(TunnelError::MalformedConfig(_))
        ));
        assert_eq!(f.supervisor.state(), SessionState::Idle);
        assert_eq!(f.driver.created_total(), 0);
    }

    #[tokio::test]
    async fn test_rejected_config_rolls_back() {
        let mut f = fixture();
        f.driver.set_reject_config(true);

        assert!(matches!(
            f.supervisor.connect(&config_text()).await,
            Err(TunnelError::ConfigurationRejected(_))
        ));
        assert_eq!(f.supervisor.state(), SessionState::Idle);
        assert_eq!(f.driver.live_adapters(), 0);
        assert!(f.net.is_clean());

        // A later connect works
        f.driver.set_reject_config(false);
        f.supervisor.connect(&config_text()).await.unwrap();
        assert_eq!(f.supervisor.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_adapter_create_failure() {
        let mut f = fixture();
        f.driver.set_fail_create(true);

        assert!(matches!(
            f.supervisor.connect(&config_text()).await,
            Err(TunnelError::Adapter(_))
        ));
        assert_eq!(f.supervisor.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle() {
        let mut f = fixture();
        f.supervisor.disconnect().await.unwrap();
        assert_eq!(f.supervisor.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_status_reports_counters() {
        let mut f = fixture();
        let idle = f.supervisor.status().await.unwrap();
        assert_eq!(idle.state, SessionState::Idle);
        assert_eq!((idle.rx(), idle.tx()), (0, 0));

        f.supervisor.connect(&config_text()).await.unwrap();
        f.driver.simulate_traffic("wg-test", 1500, 900);
        let report = f.supervisor.status().await.unwrap();
        assert_eq!(report.state, SessionState::Connected);
        assert_eq!((report.rx(), report.tx()), (1500, 900));
    }

    #[tokio::test]
    async fn test_status_keeps_session_alive() {
        let mut f = fixture();
        f.supervisor.connect(&config_text()).await.unwrap();

        f.clock.advance(Duration::from_secs(59));
        f.supervisor.status().await.unwrap();
        assert!(!f.supervisor.check_liveness().await);

        f.clock.advance(Duration::from_secs(59));
        assert!(!f.supervisor.check_liveness().await);
        assert_eq!(f.supervisor.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_watchdog_timeout_tears_down() {
        let mut f = fixture();
        f.supervisor.connect(&config_text()).await.unwrap();

        f.clock.advance(Duration::from_secs(59));
        assert!(!f.supervisor.check_liveness().await);

        f.clock.advance(Duration::from_secs(2));
        assert!(f.supervisor.check_liveness().await);
        assert_eq!(f.supervisor.state(), SessionState::Idle);
        assert!(f.net.is_clean());
        assert_eq!(f.driver.live_adapters(), 0);
    }

    #[tokio::test]
    async fn test_lost_adapter_is_fatal() {
        let mut f = fixture();
        f.supervisor.connect(&config_text()).await.unwrap();
        f.driver.remove_adapter("wg-test");

        assert!(matches!(
            f.supervisor.status().await,
            Err(TunnelError::Adapter(_))
        ));
        assert_eq!(f.supervisor.state(), SessionState::Idle);
        assert!(f.net.is_clean());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let f = fixture();
        let (handle, task) = f.supervisor.spawn();

        handle.connect(config_text()).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Connected);
        assert_eq!(snapshot.adapter.as_deref(), Some("wg-test"));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(f.driver.live_adapters(), 0);
        assert!(f.net.is_clean());
        assert!(matches!(
            handle.status().await,
            Err(TunnelError::ServiceStopped)
        ));
    }
}
