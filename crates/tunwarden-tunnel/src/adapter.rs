//! Adapter lifecycle
//!
//! [`AdapterManager`] is the only owner of driver adapter handles. Every
//! driver call runs on the blocking pool under a time limit, so a hung driver
//! surfaces as [`TunnelError::Timeout`] instead of stalling the service.

use crate::bounded::run_bounded;
use crate::driver::{AdapterState, RawAdapter, TunnelDriver};
use crate::error::{TunnelError, TunnelResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use tunwarden_protocol::{codec, Counters, TunnelConfig};

/// Default tunnel type string passed to the driver
pub const DEFAULT_TUNNEL_TYPE: &str = "WireGuard";

/// A live adapter owned by the [`AdapterManager`]
#[derive(Debug)]
pub struct AdapterHandle {
    raw: RawAdapter,
    name: String,
    guid: Uuid,
    closed: bool,
}

impl AdapterHandle {
    /// Adapter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier the adapter was created with
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Whether [`AdapterManager::close`] has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Creates, configures and releases adapters through a [`TunnelDriver`]
pub struct AdapterManager {
    driver: Arc<dyn TunnelDriver>,
    tunnel_type: String,
    call_timeout: Duration,
    configure_lock: Mutex<()>,
    live: AtomicBool,
}

impl AdapterManager {
    /// Create a manager over `driver`
    pub fn new(driver: Arc<dyn TunnelDriver>, tunnel_type: &str, call_timeout: Duration) -> Self {
        Self {
            driver,
            tunnel_type: tunnel_type.to_string(),
            call_timeout,
            configure_lock: Mutex::new(()),
            live: AtomicBool::new(false),
        }
    }

    /// Backend name
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Whether a handle is currently live
    pub fn has_live_handle(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> TunnelResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TunnelDriver) -> TunnelResult<T> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        run_bounded(op, self.call_timeout, move || f(driver.as_ref())).await
    }

    /// Create a fresh adapter named `name`, closing any existing adapter of
    /// the same name first
    pub async fn create(&self, name: &str) -> TunnelResult<AdapterHandle> {
        if self.has_live_handle() {
            return Err(TunnelError::AlreadyActive);
        }

        let lookup = name.to_string();
        let existing = self
            .call("open_adapter", move |d| Ok(d.open_adapter(&lookup)?))
            .await?;
        if let Some(stale) = existing {
            tracing::warn!("Adapter {} already exists, closing it first", name);
            self.call("close_adapter", move |d| Ok(d.close_adapter(stale)?))
                .await?;
        }

        let guid = Uuid::new_v4();
        let owned_name = name.to_string();
        let tunnel_type = self.tunnel_type.clone();
        let raw = self
            .call("create_adapter", move |d| {
                Ok(d.create_adapter(&owned_name, &tunnel_type, guid)?)
            })
            .await?;

        self.live.store(true, Ordering::SeqCst);
        tracing::info!(
            "Created adapter {} ({}) via {} driver",
            name,
            guid,
            self.driver.name()
        );
        Ok(AdapterHandle {
            raw,
            name: name.to_string(),
            guid,
            closed: false,
        })
    }

    /// Encode `config` and push it to the driver
    pub async fn configure(&self, handle: &AdapterHandle, config: &TunnelConfig) -> TunnelResult<()> {
        let _guard = self.configure_lock.lock().await;
        let bytes = codec::encode_config(config)?;
        let raw = handle.raw;
        let len = bytes.len();

        self.call("set_configuration", move |d| {
            d.set_configuration(raw, &bytes)
                .map_err(TunnelError::ConfigurationRejected)
        })
        .await?;

        tracing::debug!(
            "Pushed {} bytes of configuration ({} peers) to {}",
            len,
            config.peers.len(),
            handle.name
        );
        Ok(())
    }

    async fn set_state(&self, handle: &AdapterHandle, want: AdapterState) -> TunnelResult<()> {
        let raw = handle.raw;
        let current = self
            .call("get_adapter_state", move |d| Ok(d.get_adapter_state(raw)?))
            .await?;
        if current == want {
            return Ok(());
        }
        self.call("set_adapter_state", move |d| {
            Ok(d.set_adapter_state(raw, want)?)
        })
        .await?;
        tracing::debug!("Adapter {} is {}", handle.name, want);
        Ok(())
    }

    /// Bring the adapter up (no-op if already up)
    pub async fn set_up(&self, handle: &AdapterHandle) -> TunnelResult<()> {
        self.set_state(handle, AdapterState::Up).await
    }

    /// Take the adapter down (no-op if already down)
    pub async fn set_down(&self, handle: &AdapterHandle) -> TunnelResult<()> {
        self.set_state(handle, AdapterState::Down).await
    }

    /// Read per-peer counters. An unconfigured adapter has none.
    pub async fn read_counters(&self, handle: &AdapterHandle) -> TunnelResult<Counters> {
        let raw = handle.raw;
        let bytes = self
            .call("get_configuration", move |d| Ok(d.get_configuration(raw)?))
            .await?;
        Ok(Counters::decode(&bytes)?)
    }

    /// Release the adapter. Calling it again is a no-op.
    pub async fn close(&self, handle: &mut AdapterHandle) -> TunnelResult<()> {
        if handle.closed {
            return Ok(());
        }
        handle.closed = true;
        self.live.store(false, Ordering::SeqCst);

        let raw = handle.raw;
        self.call("close_adapter", move |d| Ok(d.close_adapter(raw)?))
            .await?;
        tracing::info!("Closed adapter {}", handle.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use tunwarden_protocol::{PeerConfig, PrivateKey, PublicKey};

    fn manager() -> (Arc<MemoryDriver>, AdapterManager) {
        let driver = Arc::new(MemoryDriver::new());
        let mgr = AdapterManager::new(driver.clone(), DEFAULT_TUNNEL_TYPE, Duration::from_secs(5));
        (driver, mgr)
    }

    fn config() -> TunnelConfig {
        TunnelConfig::new(PrivateKey::from_bytes([1u8; 32])).with_peer(
            PeerConfig::new(PublicKey::from_bytes([2u8; 32]))
                .with_endpoint("198.51.100.1:51820".parse().unwrap())
                .with_allowed_ip("0.0.0.0/0".parse().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_create_replaces_stale_adapter() {
        let (driver, mgr) = manager();
        driver
            .create_adapter("wg-tun", "WireGuard", Uuid::new_v4())
            .unwrap();

        let handle = mgr.create("wg-tun").await.unwrap();
        assert_eq!(driver.live_adapters(), 1);
        assert_eq!(driver.created_total(), 2);
        assert_eq!(driver.adapter_guid("wg-tun"), Some(handle.guid()));
    }

    #[tokio::test]
    async fn test_concurrent_configure_is_serialized() {
        let (driver, mgr) = manager();
        let handle = mgr.create("wg-tun").await.unwrap();
        driver.set_call_delay(Some(Duration::from_millis(100)));

        let cfg = config();
        let (first, second) = tokio::join!(mgr.configure(&handle, &cfg), mgr.configure(&handle, &cfg));
        first.unwrap();
        second.unwrap();
        assert_eq!(driver.peak_concurrent_configs(), 1);
    }

    #[tokio::test]
    async fn test_single_live_handle() {
        let (_driver, mgr) = manager();
        let mut handle = mgr.create("wg-tun").await.unwrap();
        assert!(matches!(
            mgr.create("wg-other").await,
            Err(TunnelError::AlreadyActive)
        ));

        mgr.close(&mut handle).await.unwrap();
        assert!(mgr.create("wg-other").await.is_ok());
    }

    #[tokio::test]
    async fn test_configure_and_read_counters() {
        let (driver, mgr) = manager();
        let handle = mgr.create("wg-tun").await.unwrap();
        assert!(mgr.read_counters(&handle).await.unwrap().peers.is_empty());

        mgr.configure(&handle, &config()).await.unwrap();
        driver.simulate_traffic("wg-tun", 4096, 512);

        let counters = mgr.read_counters(&handle).await.unwrap();
        assert_eq!(counters.rx(), 4096);
        assert_eq!(counters.tx(), 512);
    }

    #[tokio::test]
    async fn test_rejected_configuration() {
        let (driver, mgr) = manager();
        let handle = mgr.create("wg-tun").await.unwrap();
        driver.set_reject_config(true);

        assert!(matches!(
            mgr.configure(&handle, &config()).await,
            Err(TunnelError::ConfigurationRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_state_toggle_is_idempotent() {
        let (driver, mgr) = manager();
        let handle = mgr.create("wg-tun").await.unwrap();

        mgr.set_up(&handle).await.unwrap();
        mgr.set_up(&handle).await.unwrap();
        assert_eq!(driver.adapter_state("wg-tun"), Some(AdapterState::Up));

        mgr.set_down(&handle).await.unwrap();
        mgr.set_down(&handle).await.unwrap();
        assert_eq!(driver.adapter_state("wg-tun"), Some(AdapterState::Down));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (driver, mgr) = manager();
        let mut handle = mgr.create("wg-tun").await.unwrap();

        mgr.close(&mut handle).await.unwrap();
        mgr.close(&mut handle).await.unwrap();
        assert!(handle.is_closed());
        assert_eq!(driver.live_adapters(), 0);
        assert!(!mgr.has_live_handle());
    }

    #[tokio::test]
    async fn test_hung_driver_times_out() {
        let driver = Arc::new(MemoryDriver::new());
        let mgr = AdapterManager::new(driver.clone(), DEFAULT_TUNNEL_TYPE, Duration::from_millis(20));
        driver.set_call_delay(Some(Duration::from_millis(300)));

        assert!(matches!(
            mgr.create("wg-tun").await,
            Err(TunnelError::Timeout(_))
        ));
    }
}
