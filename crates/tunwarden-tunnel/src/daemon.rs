//! Service daemon
//!
//! Wires the pieces together: picks the driver and network back-ends, starts
//! the supervisor, the liveness watchdog and the command server, then waits
//! for a shutdown signal. On the way out any active session is torn down
//! before the process exits.

use crate::adapter::AdapterManager;
use crate::config::{DriverKind, ServiceConfig};
use crate::driver::{MemoryDriver, TunnelDriver};
use crate::error::{TunnelError, TunnelResult};
use crate::netops::{MemoryNetwork, NetworkOps};
use crate::routes::RouteReconciler;
use crate::server::CommandServer;
use crate::supervisor::{Clock, Supervisor, SupervisorConfig, SystemClock};
use crate::watchdog::spawn_watchdog;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinError;

type Backends = (Arc<dyn TunnelDriver>, Arc<dyn NetworkOps>);

#[cfg(target_os = "linux")]
fn native_backends(config: &ServiceConfig) -> TunnelResult<Backends> {
    if let Some(path) = &config.driver_path {
        tracing::warn!("driver_path {} is ignored on Linux", path.display());
    }
    Ok((
        Arc::new(crate::linux::KernelWireGuardDriver::new()),
        Arc::new(crate::linux::LinuxNetwork::new()),
    ))
}

#[cfg(target_os = "windows")]
fn native_backends(config: &ServiceConfig) -> TunnelResult<Backends> {
    use crate::windows::{WindowsNetwork, WireGuardNtDriver};

    let driver = match &config.driver_path {
        Some(path) => WireGuardNtDriver::load(path)?,
        None => WireGuardNtDriver::load_default()?,
    };
    Ok((Arc::new(driver), Arc::new(WindowsNetwork::new())))
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn native_backends(_config: &ServiceConfig) -> TunnelResult<Backends> {
    Err(TunnelError::PlatformNotSupported(format!(
        "no native tunnel driver for {}",
        std::env::consts::OS
    )))
}

fn joined(result: Result<TunnelResult<()>, JoinError>, task: &str) -> TunnelResult<()> {
    result.map_err(|e| TunnelError::Io(std::io::Error::other(format!("{} task failed: {}", task, e))))?
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// The tunnel control service
pub struct Daemon {
    config: ServiceConfig,
    driver: Arc<dyn TunnelDriver>,
    network: Arc<dyn NetworkOps>,
    clock: Arc<dyn Clock>,
}

impl Daemon {
    /// Build a daemon with the back-ends `config` asks for
    pub fn new(config: ServiceConfig) -> TunnelResult<Self> {
        let (driver, network): Backends = match config.driver {
            DriverKind::Memory => (Arc::new(MemoryDriver::new()), Arc::new(MemoryNetwork::new())),
            DriverKind::Native => native_backends(&config)?,
        };
        Ok(Self::with_backends(config, driver, network))
    }

    /// Build a daemon over explicit back-ends
    pub fn with_backends(
        config: ServiceConfig,
        driver: Arc<dyn TunnelDriver>,
        network: Arc<dyn NetworkOps>,
    ) -> Self {
        Self {
            config,
            driver,
            network,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Name of the selected driver back-end
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Name of the selected network back-end
    pub fn network_name(&self) -> &'static str {
        self.network.name()
    }

    /// Run until Ctrl-C or SIGTERM
    pub async fn run(self) -> TunnelResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or the command server fails
    pub async fn run_until<F>(self, shutdown: F) -> TunnelResult<()>
    where
        F: Future<Output = ()>,
    {
        let config = self.config;
        tracing::info!(
            adapter = %config.adapter_name,
            driver = self.driver.name(),
            network = self.network.name(),
            "tunwarden service starting"
        );
        if let Some(version) = self.driver.driver_version() {
            tracing::info!("Running driver version {}.{}", version >> 16, version & 0xffff);
        }

        let adapters = AdapterManager::new(
            self.driver,
            &config.tunnel_type,
            config.driver_call_timeout,
        );
        let routes = RouteReconciler::new(self.network, config.route_op_timeout);
        let supervisor = Supervisor::new(
            SupervisorConfig {
                adapter_name: config.adapter_name.clone(),
                liveness_timeout: config.watchdog.timeout,
            },
            adapters,
            routes,
            self.clock,
        );
        let (handle, supervisor_task) = supervisor.spawn();

        let (stop_tx, stop_rx) = watch::channel(false);
        let watchdog = spawn_watchdog(config.watchdog.interval, handle.clone(), stop_rx.clone());
        let server = CommandServer::new(
            config.endpoint.clone(),
            handle.clone(),
            config.request_read_timeout,
        );
        let mut server_task = tokio::spawn(server.run(stop_rx));

        tokio::pin!(shutdown);
        let early = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                None
            }
            result = &mut server_task => Some(result),
        };

        let _ = stop_tx.send(true);
        let served = match early {
            Some(result) => {
                let served = joined(result, "command server");
                if let Err(e) = &served {
                    tracing::error!("Command server stopped: {}", e);
                }
                served
            }
            None => joined(server_task.await, "command server"),
        };

        if let Err(e) = watchdog.await {
            tracing::warn!("Watchdog task failed: {}", e);
        }
        match handle.shutdown().await {
            Ok(()) | Err(TunnelError::ServiceStopped) => {}
            Err(e) => tracing::warn!("Supervisor shutdown failed: {}", e),
        }
        if let Err(e) = supervisor_task.await {
            tracing::warn!("Supervisor task failed: {}", e);
        }

        tracing::info!("tunwarden service stopped");
        served
    }
}
