//! OS network configuration
//!
//! [`NetworkOps`] is everything the reconciler needs from the host network
//! stack. Each call is one blocking, independently failing change.

use crate::error::{TunnelError, TunnelResult};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tunwarden_protocol::Cidr;

/// Host network operations applied to the tunnel adapter
pub trait NetworkOps: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Assign an address to the interface
    fn add_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()>;

    /// Remove an interface address
    fn remove_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()>;

    /// Route `dest` through the interface
    fn add_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()>;

    /// Remove a route through the interface
    fn remove_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()>;

    /// Set the interface MTU
    fn set_mtu(&self, iface: &str, mtu: u16) -> TunnelResult<()>;

    /// Enable IP forwarding on the interface
    fn enable_forwarding(&self, iface: &str) -> TunnelResult<()>;

    /// Disable IP forwarding on the interface
    fn disable_forwarding(&self, iface: &str) -> TunnelResult<()>;

    /// Add a resolver to the interface
    fn add_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()>;

    /// Remove a resolver from the interface
    fn remove_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()>;

    /// Pin a host route to a peer endpoint on the path it takes before the
    /// tunnel routes go in, so encrypted traffic does not loop into `iface`
    fn add_endpoint_route(&self, iface: &str, endpoint: IpAddr) -> TunnelResult<()>;

    /// Remove a pinned endpoint route
    fn remove_endpoint_route(&self, iface: &str, endpoint: IpAddr) -> TunnelResult<()>;
}

#[derive(Debug, Default)]
struct NetState {
    addresses: Vec<(String, Cidr)>,
    routes: Vec<(String, Cidr)>,
    dns: Vec<(String, IpAddr)>,
    endpoint_routes: Vec<(String, IpAddr)>,
    mtu: HashMap<String, u16>,
    forwarding: HashSet<String>,
    fail_routes: HashSet<Cidr>,
    fail_dns: HashSet<IpAddr>,
    fail_removals: bool,
}

/// Records network changes in memory instead of touching the host.
///
/// Adding something that already exists, or removing something that does
/// not, fails the way the OS tools do.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    state: Mutex<NetState>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes currently installed through `iface`
    pub fn routes(&self, iface: &str) -> Vec<Cidr> {
        self.lock()
            .routes
            .iter()
            .filter(|(i, _)| i == iface)
            .map(|(_, c)| *c)
            .collect()
    }

    /// Addresses currently assigned to `iface`
    pub fn addresses(&self, iface: &str) -> Vec<Cidr> {
        self.lock()
            .addresses
            .iter()
            .filter(|(i, _)| i == iface)
            .map(|(_, c)| *c)
            .collect()
    }

    /// Resolvers currently applied to `iface`
    pub fn dns(&self, iface: &str) -> Vec<IpAddr> {
        self.lock()
            .dns
            .iter()
            .filter(|(i, _)| i == iface)
            .map(|(_, a)| *a)
            .collect()
    }

    /// Endpoints pinned outside the tunnel for `iface`
    pub fn endpoint_routes(&self, iface: &str) -> Vec<IpAddr> {
        self.lock()
            .endpoint_routes
            .iter()
            .filter(|(i, _)| i == iface)
            .map(|(_, a)| *a)
            .collect()
    }

    /// MTU set on `iface`
    pub fn mtu(&self, iface: &str) -> Option<u16> {
        self.lock().mtu.get(iface).copied()
    }

    /// Whether forwarding is enabled on `iface`
    pub fn forwarding(&self, iface: &str) -> bool {
        self.lock().forwarding.contains(iface)
    }

    /// Nothing is configured on any interface
    pub fn is_clean(&self) -> bool {
        let s = self.lock();
        s.addresses.is_empty()
            && s.routes.is_empty()
            && s.dns.is_empty()
            && s.endpoint_routes.is_empty()
            && s.forwarding.is_empty()
    }

    /// Make installing a route to `dest` fail
    pub fn fail_route(&self, dest: Cidr) {
        self.lock().fail_routes.insert(dest);
    }

    /// Make adding a resolver fail
    pub fn fail_dns(&self, server: IpAddr) {
        self.lock().fail_dns.insert(server);
    }

    /// Make every removal fail
    pub fn set_fail_removals(&self, fail: bool) {
        self.lock().fail_removals = fail;
    }

    fn check_removal(&self, what: &str) -> TunnelResult<()> {
        if self.lock().fail_removals {
            return Err(TunnelError::Route(format!("cannot remove {}", what)));
        }
        Ok(())
    }
}

fn add_unique<T: PartialEq + std::fmt::Display>(
    list: &mut Vec<(String, T)>,
    iface: &str,
    item: T,
) -> TunnelResult<()> {
    if list.iter().any(|(i, x)| i == iface && *x == item) {
        return Err(TunnelError::Route(format!("{} already exists on {}", item, iface)));
    }
    list.push((iface.to_string(), item));
    Ok(())
}

fn remove_one<T: PartialEq + std::fmt::Display>(
    list: &mut Vec<(String, T)>,
    iface: &str,
    item: &T,
) -> TunnelResult<()> {
    match list.iter().position(|(i, x)| i == iface && x == item) {
        Some(pos) => {
            list.remove(pos);
            Ok(())
        }
        None => Err(TunnelError::Route(format!("{} not present on {}", item, iface))),
    }
}

impl NetworkOps for MemoryNetwork {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn add_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()> {
        add_unique(&mut self.lock().addresses, iface, *addr)
    }

    fn remove_address(&self, iface: &str, addr: &Cidr) -> TunnelResult<()> {
        self.check_removal("address")?;
        remove_one(&mut self.lock().addresses, iface, addr)
    }

    fn add_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()> {
        let mut s = self.lock();
        if s.fail_routes.contains(dest) {
            return Err(TunnelError::Route(format!("route to {} refused", dest)));
        }
        add_unique(&mut s.routes, iface, *dest)
    }

    fn remove_route(&self, iface: &str, dest: &Cidr) -> TunnelResult<()> {
        self.check_removal("route")?;
        remove_one(&mut self.lock().routes, iface, dest)
    }

    fn set_mtu(&self, iface: &str, mtu: u16) -> TunnelResult<()> {
        self.lock().mtu.insert(iface.to_string(), mtu);
        Ok(())
    }

    fn enable_forwarding(&self, iface: &str) -> TunnelResult<()> {
        self.lock().forwarding.insert(iface.to_string());
        Ok(())
    }

    fn disable_forwarding(&self, iface: &str) -> TunnelResult<()> {
        self.check_removal("forwarding")?;
        self.lock().forwarding.remove(iface);
        Ok(())
    }

    fn add_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()> {
        let mut s = self.lock();
        if s.fail_dns.contains(&server) {
            return Err(TunnelError::Route(format!("resolver {} refused", server)));
        }
        add_unique(&mut s.dns, iface, server)
    }

    fn remove_dns(&self, iface: &str, server: IpAddr) -> TunnelResult<()> {
        self.check_removal("dns")?;
        remove_one(&mut self.lock().dns, iface, &server)
    }

    fn add_endpoint_route(&self, iface: &str, endpoint: IpAddr) -> TunnelResult<()> {
        add_unique(&mut self.lock().endpoint_routes, iface, endpoint)
    }

    fn remove_endpoint_route(&self, iface: &str, endpoint: IpAddr) -> TunnelResult<()> {
        self.check_removal("endpoint route")?;
        remove_one(&mut self.lock().endpoint_routes, iface, &endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_route_fails() {
        let net = MemoryNetwork::new();
        let dest: Cidr = "10.0.0.0/8".parse().unwrap();
        net.add_route("wg0", &dest).unwrap();
        assert!(net.add_route("wg0", &dest).is_err());
        assert!(net.add_route("wg1", &dest).is_ok());
        assert_eq!(net.routes("wg0"), vec![dest]);
    }

    #[test]
    fn test_remove_missing_fails() {
        let net = MemoryNetwork::new();
        let dest: Cidr = "10.0.0.0/8".parse().unwrap();
        assert!(net.remove_route("wg0", &dest).is_err());
        assert!(net.remove_dns("wg0", "1.1.1.1".parse().unwrap()).is_err());
    }

    #[test]
    fn test_fault_injection() {
        let net = MemoryNetwork::new();
        let dest: Cidr = "0.0.0.0/0".parse().unwrap();
        net.fail_route(dest);
        assert!(net.add_route("wg0", &dest).is_err());

        net.enable_forwarding("wg0").unwrap();
        net.set_fail_removals(true);
        assert!(net.disable_forwarding("wg0").is_err());
        assert!(net.forwarding("wg0"));
        assert!(!net.is_clean());
    }
}
