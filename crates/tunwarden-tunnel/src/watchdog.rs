//! Liveness watchdog
//!
//! Posts a liveness check into the supervisor queue on a fixed interval. The
//! supervisor decides whether the session has gone quiet; the watchdog only
//! keeps time.

use crate::error::TunnelError;
use crate::supervisor::SupervisorHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Configuration for the watchdog
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often to check
    pub interval: Duration,
    /// How long without a heartbeat before disconnecting
    pub timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Spawn the watchdog task. It stops when `shutdown` flips to true or the
/// supervisor goes away.
pub fn spawn_watchdog(
    interval: Duration,
    supervisor: SupervisorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Watchdog started ({:?} interval)", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match supervisor.check_liveness().await {
                        Ok(true) => warn!("Watchdog disconnected an unresponsive session"),
                        Ok(false) => {}
                        Err(TunnelError::ServiceStopped) => break,
                        Err(e) => warn!("Liveness check failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Watchdog stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterManager, DEFAULT_TUNNEL_TYPE};
    use crate::driver::MemoryDriver;
    use crate::netops::MemoryNetwork;
    use crate::routes::RouteReconciler;
    use crate::supervisor::{ManualClock, SessionState, Supervisor, SupervisorConfig};
    use std::sync::Arc;
    use tunwarden_protocol::encode_key;

    fn spawn_supervisor(clock: Arc<ManualClock>) -> (SupervisorHandle, JoinHandle<()>) {
        Supervisor::new(
            SupervisorConfig {
                adapter_name: "wg-dog".into(),
                liveness_timeout: Duration::from_secs(60),
            },
            AdapterManager::new(
                Arc::new(MemoryDriver::new()),
                DEFAULT_TUNNEL_TYPE,
                Duration::from_secs(5),
            ),
            RouteReconciler::new(Arc::new(MemoryNetwork::new()), Duration::from_secs(5)),
            clock,
        )
        .spawn()
    }

    fn config_text() -> String {
        format!(
            "[Interface]\nPrivateKey = {}\n[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.0/8\n",
            encode_key(&[1u8; 32]),
            encode_key(&[2u8; 32])
        )
    }

    #[tokio::test]
    async fn test_watchdog_disconnects_quiet_session() {
        let clock = Arc::new(ManualClock::new());
        let (handle, _task) = spawn_supervisor(clock.clone());
        handle.connect(config_text()).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let dog = spawn_watchdog(Duration::from_millis(10), handle.clone(), rx);

        clock.advance(Duration::from_secs(61));
        let mut state = SessionState::Connected;
        for _ in 0..200 {
            state = handle.snapshot().await.unwrap().state;
            if state == SessionState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, SessionState::Idle);
        dog.abort();
    }

    #[tokio::test]
    async fn test_watchdog_stops_on_shutdown_signal() {
        let clock = Arc::new(ManualClock::new());
        let (handle, _task) = spawn_supervisor(clock);
        let (tx, rx) = watch::channel(false);
        let dog = spawn_watchdog(Duration::from_secs(5), handle, rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), dog)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_stops_when_supervisor_exits() {
        let clock = Arc::new(ManualClock::new());
        let (handle, task) = spawn_supervisor(clock);
        let (_tx, rx) = watch::channel(false);
        let dog = spawn_watchdog(Duration::from_millis(10), handle.clone(), rx);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), dog)
            .await
            .unwrap()
            .unwrap();
    }
}
