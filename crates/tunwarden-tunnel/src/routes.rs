//! Route, address, DNS and forwarding reconciliation
//!
//! On connect every allowed-IP range of every peer becomes a route through
//! the adapter, including the default ranges: full tunneling is the policy.
//! Each change that actually succeeds is recorded so that rollback removes
//! exactly what was installed, newest first.

use crate::bounded::run_bounded;
use crate::error::TunnelResult;
use crate::netops::NetworkOps;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tunwarden_protocol::{Cidr, TunnelConfig};

/// One recorded change to the host network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEntry {
    /// Interface address
    Address(Cidr),
    /// Host route keeping a peer endpoint off the adapter
    Endpoint(IpAddr),
    /// Route through the adapter
    Route(Cidr),
    /// MTU set on the adapter
    Mtu(u16),
    /// Forwarding enabled on the adapter
    Forwarding,
    /// Resolver applied to the adapter
    Dns(IpAddr),
}

impl RouteEntry {
    /// Whether this entry is a route
    pub fn is_route(&self) -> bool {
        matches!(self, RouteEntry::Route(_))
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteEntry::Address(c) => write!(f, "address {}", c),
            RouteEntry::Endpoint(a) => write!(f, "endpoint route {}", a),
            RouteEntry::Route(c) => write!(f, "route {}", c),
            RouteEntry::Mtu(m) => write!(f, "mtu {}", m),
            RouteEntry::Forwarding => write!(f, "forwarding"),
            RouteEntry::Dns(a) => write!(f, "dns {}", a),
        }
    }
}

/// Outcome of applying a config
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Changes planned
    pub requested: usize,
    /// Routes among the planned changes
    pub routes_requested: usize,
    /// Changes that failed and were skipped
    pub failures: Vec<(RouteEntry, String)>,
}

/// Outcome of a rollback
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Entries a removal was attempted for
    pub attempted: usize,
    /// Entries whose removal failed
    pub failures: Vec<(RouteEntry, String)>,
}

impl RollbackReport {
    /// Every removal succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Build the ordered list of changes for `config`: addresses, endpoint
/// routes, routes, MTU, forwarding, then resolvers.
///
/// Routes are taken as network blocks and deduplicated. A route equal to an
/// interface address network is skipped since the OS installs it along with
/// the address. Every peer endpoint that some route would capture gets a
/// host route on its existing path, planned ahead of the routes that would
/// capture it.
pub fn plan(config: &TunnelConfig) -> Vec<RouteEntry> {
    let iface = &config.interface;
    let mut entries: Vec<RouteEntry> = iface.addresses.iter().map(|a| RouteEntry::Address(*a)).collect();

    let connected: Vec<Cidr> = iface
        .addresses
        .iter()
        .filter(|a| a.prefix < tunwarden_protocol::types::max_prefix(&a.addr))
        .map(Cidr::network)
        .collect();

    let mut routes: Vec<Cidr> = Vec::new();
    for cidr in config.allowed_ips() {
        let dest = cidr.network();
        if connected.contains(&dest) {
            tracing::debug!("Skipping route {}: covered by interface address", dest);
            continue;
        }
        if !routes.contains(&dest) {
            routes.push(dest);
        }
    }

    let mut endpoints: Vec<IpAddr> = Vec::new();
    for ep in config.peers.iter().filter_map(|p| p.endpoint).map(|e| e.ip()) {
        if routes.iter().any(|r| r.contains(&ep)) && !endpoints.contains(&ep) {
            endpoints.push(ep);
        }
    }
    entries.extend(endpoints.into_iter().map(RouteEntry::Endpoint));
    entries.extend(routes.into_iter().map(RouteEntry::Route));

    entries.push(RouteEntry::Mtu(iface.mtu));
    entries.push(RouteEntry::Forwarding);
    entries.extend(iface.dns.iter().map(|d| RouteEntry::Dns(*d)));
    entries
}

/// Applies and rolls back host network changes for the adapter
pub struct RouteReconciler {
    net: Arc<dyn NetworkOps>,
    op_timeout: Duration,
}

impl RouteReconciler {
    /// Create a reconciler over `net`
    pub fn new(net: Arc<dyn NetworkOps>, op_timeout: Duration) -> Self {
        Self { net, op_timeout }
    }

    async fn run(&self, iface: &str, entry: RouteEntry, install: bool) -> TunnelResult<()> {
        let net = Arc::clone(&self.net);
        let iface = iface.to_string();
        let op = if install { "network install" } else { "network remove" };
        run_bounded(op, self.op_timeout, move || {
            let iface = iface.as_str();
            match (entry, install) {
                (RouteEntry::Address(c), true) => net.add_address(iface, &c),
                (RouteEntry::Address(c), false) => net.remove_address(iface, &c),
                (RouteEntry::Endpoint(a), true) => net.add_endpoint_route(iface, a),
                (RouteEntry::Endpoint(a), false) => net.remove_endpoint_route(iface, a),
                (RouteEntry::Route(c), true) => net.add_route(iface, &c),
                (RouteEntry::Route(c), false) => net.remove_route(iface, &c),
                (RouteEntry::Mtu(m), true) => net.set_mtu(iface, m),
                // MTU goes away with the adapter
                (RouteEntry::Mtu(_), false) => Ok(()),
                (RouteEntry::Forwarding, true) => net.enable_forwarding(iface),
                (RouteEntry::Forwarding, false) => net.disable_forwarding(iface),
                (RouteEntry::Dns(a), true) => net.add_dns(iface, a),
                (RouteEntry::Dns(a), false) => net.remove_dns(iface, a),
            }
        })
        .await
    }

    /// Apply every change for `config`, appending each success to
    /// `installed`. Failures are logged and skipped.
    pub async fn apply(
        &self,
        iface: &str,
        config: &TunnelConfig,
        installed: &mut Vec<RouteEntry>,
    ) -> ApplyReport {
        let entries = plan(config);
        let mut report = ApplyReport {
            requested: entries.len(),
            routes_requested: entries.iter().filter(|e| e.is_route()).count(),
            failures: Vec::new(),
        };

        for entry in entries {
            match self.run(iface, entry, true).await {
                Ok(()) => {
                    tracing::debug!("Installed {} on {}", entry, iface);
                    installed.push(entry);
                }
                Err(e) => {
                    tracing::warn!("Failed to install {} on {}: {}", entry, iface, e);
                    report.failures.push((entry, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Applied {}/{} network changes on {} via {}",
            report.requested - report.failures.len(),
            report.requested,
            iface,
            self.net.name()
        );
        report
    }

    /// Remove every recorded entry in reverse order. All entries are
    /// attempted and the record is always cleared.
    pub async fn rollback(&self, iface: &str, installed: &mut Vec<RouteEntry>) -> RollbackReport {
        let mut report = RollbackReport::default();

        while let Some(entry) = installed.pop() {
            report.attempted += 1;
            if let Err(e) = self.run(iface, entry, false).await {
                tracing::warn!("Failed to remove {} from {}: {}", entry, iface, e);
                report.failures.push((entry, e.to_string()));
            }
        }

        if report.is_clean() {
            tracing::info!("Rolled back {} network changes on {}", report.attempted, iface);
        } else {
            tracing::warn!(
                "Rolled back {} network changes on {} with {} failures",
                report.attempted,
                iface,
                report.failures.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netops::MemoryNetwork;
    use tunwarden_protocol::{PeerConfig, PrivateKey, PublicKey};

    fn config(allowed: &[&str]) -> TunnelConfig {
        let mut peer = PeerConfig::new(PublicKey::from_bytes([2u8; 32]));
        for a in allowed {
            peer = peer.with_allowed_ip(a.parse().unwrap());
        }
        let mut config = TunnelConfig::new(PrivateKey::from_bytes([1u8; 32])).with_peer(peer);
        config.interface.addresses = vec!["10.53.0.14/24".parse().unwrap()];
        config.interface.dns = vec!["8.8.8.8".parse().unwrap(), "1.1.1.1".parse().unwrap()];
        config
    }

    fn reconciler(net: &Arc<MemoryNetwork>) -> RouteReconciler {
        RouteReconciler::new(net.clone(), Duration::from_secs(5))
    }

    #[test]
    fn test_plan_order_and_dedupe() {
        let mut cfg = config(&["0.0.0.0/0", "::/0", "10.53.0.0/24", "192.168.7.9/16"]);
        cfg.peers.push(
            PeerConfig::new(PublicKey::from_bytes([3u8; 32]))
                .with_allowed_ip("192.168.0.0/16".parse().unwrap()),
        );

        let entries = plan(&cfg);
        assert_eq!(
            entries,
            vec![
                RouteEntry::Address("10.53.0.14/24".parse().unwrap()),
                RouteEntry::Route("0.0.0.0/0".parse().unwrap()),
                RouteEntry::Route("::/0".parse().unwrap()),
                RouteEntry::Route("192.168.0.0/16".parse().unwrap()),
                RouteEntry::Mtu(1420),
                RouteEntry::Forwarding,
                RouteEntry::Dns("8.8.8.8".parse().unwrap()),
                RouteEntry::Dns("1.1.1.1".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn test_plan_pins_captured_endpoints() {
        let mut cfg = config(&["0.0.0.0/0"]);
        cfg.peers[0].endpoint = Some("203.0.113.5:51820".parse().unwrap());
        cfg.peers.push(
            PeerConfig::new(PublicKey::from_bytes([3u8; 32]))
                .with_endpoint("[2001:db8::7]:51820".parse().unwrap())
                .with_allowed_ip("172.16.0.0/12".parse().unwrap()),
        );

        let entries = plan(&cfg);
        let endpoint = RouteEntry::Endpoint("203.0.113.5".parse().unwrap());
        let pos = entries.iter().position(|e| *e == endpoint).unwrap();
        let default = entries
            .iter()
            .position(|e| *e == RouteEntry::Route("0.0.0.0/0".parse().unwrap()))
            .unwrap();
        assert!(pos < default);
        // No IPv6 route captures the second endpoint
        assert_eq!(
            entries.iter().filter(|e| matches!(e, RouteEntry::Endpoint(_))).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_endpoint_route_is_rolled_back() {
        let net = Arc::new(MemoryNetwork::new());
        let rec = reconciler(&net);
        let mut cfg = config(&["0.0.0.0/0"]);
        cfg.peers[0].endpoint = Some("203.0.113.5:51820".parse().unwrap());
        let mut installed = Vec::new();

        let report = rec.apply("wg0", &cfg, &mut installed).await;
        assert!(report.failures.is_empty());
        assert_eq!(net.endpoint_routes("wg0"), vec!["203.0.113.5".parse::<IpAddr>().unwrap()]);

        rec.rollback("wg0", &mut installed).await;
        assert!(net.endpoint_routes("wg0").is_empty());
        assert!(net.is_clean());
    }

    #[tokio::test]
    async fn test_apply_then_rollback() {
        let net = Arc::new(MemoryNetwork::new());
        let rec = reconciler(&net);
        let mut installed = Vec::new();

        let report = rec.apply("wg0", &config(&["0.0.0.0/0"]), &mut installed).await;
        assert!(report.failures.is_empty());
        assert_eq!(net.routes("wg0"), vec!["0.0.0.0/0".parse().unwrap()]);
        assert_eq!(net.dns("wg0").len(), 2);
        assert_eq!(net.mtu("wg0"), Some(1420));
        assert!(net.forwarding("wg0"));

        let rollback = rec.rollback("wg0", &mut installed).await;
        assert!(rollback.is_clean());
        assert_eq!(rollback.attempted, report.requested);
        assert!(installed.is_empty());
        assert!(net.is_clean());
    }

    #[tokio::test]
    async fn test_partial_install_is_recorded() {
        let net = Arc::new(MemoryNetwork::new());
        net.fail_route("10.0.0.0/8".parse().unwrap());
        net.fail_dns("8.8.8.8".parse().unwrap());
        let rec = reconciler(&net);
        let mut installed = Vec::new();

        let report = rec
            .apply("wg0", &config(&["10.0.0.0/8", "172.16.0.0/12"]), &mut installed)
            .await;
        assert_eq!(report.failures.len(), 2);
        assert_eq!(installed.len(), report.requested - 2);
        assert!(installed.contains(&RouteEntry::Route("172.16.0.0/12".parse().unwrap())));
        assert!(!installed.contains(&RouteEntry::Route("10.0.0.0/8".parse().unwrap())));

        rec.rollback("wg0", &mut installed).await;
        assert!(net.is_clean());
    }

    #[tokio::test]
    async fn test_rollback_attempts_everything() {
        let net = Arc::new(MemoryNetwork::new());
        let rec = reconciler(&net);
        let mut installed = Vec::new();
        rec.apply("wg0", &config(&["0.0.0.0/0"]), &mut installed).await;
        let recorded = installed.len();

        net.set_fail_removals(true);
        let report = rec.rollback("wg0", &mut installed).await;
        assert_eq!(report.attempted, recorded);
        // Only the MTU entry has nothing to remove
        assert_eq!(report.failures.len(), recorded - 1);
        assert!(installed.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_is_reverse_order() {
        let net = Arc::new(MemoryNetwork::new());
        let rec = reconciler(&net);
        let mut installed = Vec::new();
        rec.apply("wg0", &config(&["0.0.0.0/0"]), &mut installed).await;
        let expected: Vec<RouteEntry> = installed.iter().rev().copied().collect();

        net.set_fail_removals(true);
        let report = rec.rollback("wg0", &mut installed).await;
        let failed: Vec<RouteEntry> = report.failures.iter().map(|(e, _)| *e).collect();
        let expected: Vec<RouteEntry> = expected
            .into_iter()
            .filter(|e| !matches!(e, RouteEntry::Mtu(_)))
            .collect();
        assert_eq!(failed, expected);
    }
}
