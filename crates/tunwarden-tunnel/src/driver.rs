//! Tunnel driver boundary
//!
//! The kernel-mode tunnel driver is a black box reached through a handful of
//! atomic calls. [`TunnelDriver`] is that surface; the platform modules
//! implement it against the real driver and [`MemoryDriver`] simulates it
//! in-process for dry runs and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use tunwarden_protocol::codec;

/// Platform error code: object not found
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
/// Platform error code: generic device failure
pub const ERROR_GEN_FAILURE: u32 = 31;
/// Platform error code: invalid parameter
pub const ERROR_INVALID_PARAMETER: u32 = 87;

/// Opaque adapter reference returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawAdapter(pub usize);

/// Administrative adapter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Adapter is down
    Down,
    /// Adapter is up and passing traffic
    Up,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Down => write!(f, "down"),
            AdapterState::Up => write!(f, "up"),
        }
    }
}

/// A driver call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed (code {code}): {message}")]
pub struct DriverError {
    /// Driver call that failed
    pub op: &'static str,
    /// Platform error code
    pub code: u32,
    /// Human readable detail
    pub message: String,
}

impl DriverError {
    /// Create a driver error
    pub fn new(op: &'static str, code: u32, message: impl Into<String>) -> Self {
        Self {
            op,
            code,
            message: message.into(),
        }
    }
}

/// The calls the tunnel driver exposes. Every call is atomic and either
/// succeeds or fails with a platform error code.
pub trait TunnelDriver: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Open an existing adapter by name
    fn open_adapter(&self, name: &str) -> Result<Option<RawAdapter>, DriverError>;

    /// Create a new adapter
    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        guid: Uuid,
    ) -> Result<RawAdapter, DriverError>;

    /// Release an adapter
    fn close_adapter(&self, adapter: RawAdapter) -> Result<(), DriverError>;

    /// Set the administrative state
    fn set_adapter_state(&self, adapter: RawAdapter, state: AdapterState)
        -> Result<(), DriverError>;

    /// Read the administrative state
    fn get_adapter_state(&self, adapter: RawAdapter) -> Result<AdapterState, DriverError>;

    /// Push a configuration buffer
    fn set_configuration(&self, adapter: RawAdapter, config: &[u8]) -> Result<(), DriverError>;

    /// Pull the current configuration buffer including live counters. An
    /// adapter that was never configured returns an empty buffer.
    fn get_configuration(&self, adapter: RawAdapter) -> Result<Vec<u8>, DriverError>;

    /// Version of the running driver, if the backend reports one
    fn driver_version(&self) -> Option<u32> {
        None
    }
}

// ============================================================================
// In-memory driver
// ============================================================================

#[derive(Debug)]
struct MemoryAdapter {
    name: String,
    guid: Uuid,
    state: AdapterState,
    config: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    adapters: HashMap<usize, MemoryAdapter>,
    next_id: usize,
    created_total: usize,
    fail_create: bool,
    reject_config: bool,
    call_delay: Option<Duration>,
    configuring: usize,
    peak_configuring: usize,
}

/// Simulated driver holding adapter state in memory.
///
/// Pushed configuration is validated by decoding it, so a buffer the real
/// driver would reject as malformed is rejected here too.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    inner: Mutex<MemoryInner>,
}

impl MemoryDriver {
    /// Create an empty driver
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delay(&self) {
        let delay = self.lock().call_delay;
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
    }

    /// Most configuration pushes ever in flight at once
    pub fn peak_concurrent_configs(&self) -> usize {
        self.lock().peak_configuring
    }

    /// Number of adapters currently open
    pub fn live_adapters(&self) -> usize {
        self.lock().adapters.len()
    }

    /// Number of adapters ever created
    pub fn created_total(&self) -> usize {
        self.lock().created_total
    }

    /// Identifier of the live adapter with `name`
    pub fn adapter_guid(&self, name: &str) -> Option<Uuid> {
        self.lock()
            .adapters
            .values()
            .find(|a| a.name == name)
            .map(|a| a.guid)
    }

    /// State of the live adapter with `name`
    pub fn adapter_state(&self, name: &str) -> Option<AdapterState> {
        self.lock()
            .adapters
            .values()
            .find(|a| a.name == name)
            .map(|a| a.state)
    }

    /// Make adapter creation fail
    pub fn set_fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    /// Make configuration pushes fail
    pub fn set_reject_config(&self, reject: bool) {
        self.lock().reject_config = reject;
    }

    /// Delay every call, simulating a hung driver
    pub fn set_call_delay(&self, delay: Option<Duration>) {
        self.lock().call_delay = delay;
    }

    /// Drop an adapter behind the service's back, as when the driver is
    /// unloaded or the device removed
    pub fn remove_adapter(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let id = inner
            .adapters
            .iter()
            .find(|(_, a)| a.name == name)
            .map(|(id, _)| *id);
        match id {
            Some(id) => inner.adapters.remove(&id).is_some(),
            None => false,
        }
    }

    /// Add traffic to the first peer of the named adapter
    pub fn simulate_traffic(&self, name: &str, rx: u64, tx: u64) -> bool {
        let mut inner = self.lock();
        let Some(adapter) = inner.adapters.values_mut().find(|a| a.name == name) else {
            return false;
        };
        let Ok(mut state) = codec::decode(&adapter.config) else {
            return false;
        };
        let Some(peer) = state.peers.first_mut() else {
            return false;
        };
        peer.rx_bytes = peer.rx_bytes.saturating_add(rx);
        peer.tx_bytes = peer.tx_bytes.saturating_add(tx);
        match codec::encode(&state) {
            Ok(bytes) => {
                adapter.config = bytes.to_vec();
                true
            }
            Err(_) => false,
        }
    }
}

fn not_found(op: &'static str, adapter: RawAdapter) -> DriverError {
    DriverError::new(
        op,
        ERROR_FILE_NOT_FOUND,
        format!("no adapter with handle {}", adapter.0),
    )
}

impl TunnelDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_adapter(&self, name: &str) -> Result<Option<RawAdapter>, DriverError> {
        self.delay();
        Ok(self
            .lock()
            .adapters
            .iter()
            .find(|(_, a)| a.name == name)
            .map(|(id, _)| RawAdapter(*id)))
    }

    fn create_adapter(
        &self,
        name: &str,
        tunnel_type: &str,
        guid: Uuid,
    ) -> Result<RawAdapter, DriverError> {
        self.delay();
        let mut inner = self.lock();
        if inner.fail_create {
            return Err(DriverError::new(
                "WireGuardCreateAdapter",
                ERROR_GEN_FAILURE,
                "adapter creation disabled",
            ));
        }
        if inner.adapters.values().any(|a| a.name == name) {
            return Err(DriverError::new(
                "WireGuardCreateAdapter",
                183,
                format!("adapter {} already exists", name),
            ));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.created_total += 1;
        inner.adapters.insert(
            id,
            MemoryAdapter {
                name: name.to_string(),
                guid,
                state: AdapterState::Down,
                config: Vec::new(),
            },
        );
        tracing::debug!("memory driver: created {} ({}, {})", name, tunnel_type, guid);
        Ok(RawAdapter(id))
    }

    fn close_adapter(&self, adapter: RawAdapter) -> Result<(), DriverError> {
        self.delay();
        match self.lock().adapters.remove(&adapter.0) {
            Some(a) => {
                tracing::debug!("memory driver: closed {}", a.name);
                Ok(())
            }
            None => Err(not_found("WireGuardCloseAdapter", adapter)),
        }
    }

    fn set_adapter_state(
        &self,
        adapter: RawAdapter,
        state: AdapterState,
    ) -> Result<(), DriverError> {
        self.delay();
        let mut inner = self.lock();
        let a = inner
            .adapters
            .get_mut(&adapter.0)
            .ok_or_else(|| not_found("WireGuardSetAdapterState", adapter))?;
        a.state = state;
        Ok(())
    }

    fn get_adapter_state(&self, adapter: RawAdapter) -> Result<AdapterState, DriverError> {
        self.delay();
        self.lock()
            .adapters
            .get(&adapter.0)
            .map(|a| a.state)
            .ok_or_else(|| not_found("WireGuardGetAdapterState", adapter))
    }

    fn set_configuration(&self, adapter: RawAdapter, config: &[u8]) -> Result<(), DriverError> {
        {
            let mut inner = self.lock();
            inner.configuring += 1;
            inner.peak_configuring = inner.peak_configuring.max(inner.configuring);
        }
        self.delay();
        let mut inner = self.lock();
        inner.configuring -= 1;
        if inner.reject_config {
            return Err(DriverError::new(
                "WireGuardSetConfiguration",
                ERROR_INVALID_PARAMETER,
                "configuration rejected",
            ));
        }
        codec::decode(config).map_err(|e| {
            DriverError::new("WireGuardSetConfiguration", ERROR_INVALID_PARAMETER, e.to_string())
        })?;
        let a = inner
            .adapters
            .get_mut(&adapter.0)
            .ok_or_else(|| not_found("WireGuardSetConfiguration", adapter))?;
        a.config = config.to_vec();
        Ok(())
    }

    fn get_configuration(&self, adapter: RawAdapter) -> Result<Vec<u8>, DriverError> {
        self.delay();
        self.lock()
            .adapters
            .get(&adapter.0)
            .map(|a| a.config.clone())
            .ok_or_else(|| not_found("WireGuardGetConfiguration", adapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunwarden_protocol::{PeerConfig, PrivateKey, PublicKey, TunnelConfig};

    fn config_bytes() -> Vec<u8> {
        let config = TunnelConfig::new(PrivateKey::from_bytes([1u8; 32])).with_peer(
            PeerConfig::new(PublicKey::from_bytes([2u8; 32]))
                .with_allowed_ip("0.0.0.0/0".parse().unwrap()),
        );
        codec::encode_config(&config).unwrap().to_vec()
    }

    #[test]
    fn test_create_open_close() {
        let driver = MemoryDriver::new();
        assert_eq!(driver.open_adapter("wg0").unwrap(), None);

        let handle = driver.create_adapter("wg0", "WireGuard", Uuid::new_v4()).unwrap();
        assert_eq!(driver.open_adapter("wg0").unwrap(), Some(handle));
        assert_eq!(driver.live_adapters(), 1);
        assert!(driver.create_adapter("wg0", "WireGuard", Uuid::new_v4()).is_err());

        driver.close_adapter(handle).unwrap();
        assert_eq!(driver.live_adapters(), 0);
        assert_eq!(
            driver.close_adapter(handle).unwrap_err().code,
            ERROR_FILE_NOT_FOUND
        );
    }

    #[test]
    fn test_configuration_is_validated() {
        let driver = MemoryDriver::new();
        let handle = driver.create_adapter("wg0", "WireGuard", Uuid::new_v4()).unwrap();
        assert!(driver.get_configuration(handle).unwrap().is_empty());

        let err = driver.set_configuration(handle, &[0u8; 10]).unwrap_err();
        assert_eq!(err.code, ERROR_INVALID_PARAMETER);

        let bytes = config_bytes();
        driver.set_configuration(handle, &bytes).unwrap();
        assert_eq!(driver.get_configuration(handle).unwrap(), bytes);
    }

    #[test]
    fn test_simulated_traffic() {
        let driver = MemoryDriver::new();
        let handle = driver.create_adapter("wg0", "WireGuard", Uuid::new_v4()).unwrap();
        assert!(!driver.simulate_traffic("wg0", 1, 1));

        driver.set_configuration(handle, &config_bytes()).unwrap();
        assert!(driver.simulate_traffic("wg0", 300, 100));
        assert!(driver.simulate_traffic("wg0", 10, 0));

        let counters =
            tunwarden_protocol::Counters::decode(&driver.get_configuration(handle).unwrap())
                .unwrap();
        assert_eq!(counters.rx(), 310);
        assert_eq!(counters.tx(), 100);
    }

    #[test]
    fn test_fault_injection() {
        let driver = MemoryDriver::new();
        driver.set_fail_create(true);
        assert!(driver.create_adapter("wg0", "WireGuard", Uuid::new_v4()).is_err());
        assert_eq!(driver.created_total(), 0);

        driver.set_fail_create(false);
        let handle = driver.create_adapter("wg0", "WireGuard", Uuid::new_v4()).unwrap();
        driver.set_reject_config(true);
        assert!(driver.set_configuration(handle, &config_bytes()).is_err());

        assert!(driver.remove_adapter("wg0"));
        assert!(driver.get_configuration(handle).is_err());
    }
}
