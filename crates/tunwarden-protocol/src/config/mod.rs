//! Tunnel configuration model and parser
//!
//! Parses the WireGuard-style text a client submits with `connect`:
//!
//! ```text
//! [Interface]
//! PrivateKey = <base64>
//! Address = 10.53.0.14/32
//! DNS = 8.8.8.8
//!
//! [Peer]
//! PublicKey = <base64>
//! Endpoint = 203.0.113.5:51820
//! AllowedIPs = 0.0.0.0/0, ::/0
//! PersistentKeepalive = 25
//! ```
//!
//! Parsing is a pure function of the text. Unknown keys are ignored and keys
//! that appear before any section header are discarded.

use crate::types::{Cidr, CidrError, KeyError, PresharedKey, PrivateKey, PublicKey};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Default tunnel MTU
pub const DEFAULT_MTU: u16 = 1420;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key is absent
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Key material did not decode to 32 bytes
    #[error("invalid key in {field}: {source}")]
    InvalidKey {
        /// Config key that held the value
        field: String,
        /// Decode failure
        source: KeyError,
    },

    /// An address, endpoint or CIDR failed to parse
    #[error("invalid address in {field}: {value}")]
    InvalidAddress {
        /// Config key that held the value
        field: String,
        /// Offending text
        value: String,
    },

    /// Prefix length exceeds the address family maximum
    #[error("invalid prefix length in {field}: {value}")]
    InvalidPrefix {
        /// Config key that held the value
        field: String,
        /// Offending text
        value: String,
    },

    /// A numeric value failed to parse
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        /// Config key that held the value
        field: String,
        /// Offending text
        value: String,
    },

    /// Failed to read or write a configuration file
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local end of the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// X25519 private key
    pub private_key: PrivateKey,
    /// Addresses assigned to the adapter
    pub addresses: Vec<Cidr>,
    /// Resolvers applied to the adapter, in order
    pub dns: Vec<IpAddr>,
    /// UDP listen port (driver picks one when absent)
    pub listen_port: Option<u16>,
    /// Adapter MTU
    pub mtu: u16,
}

/// One remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer's X25519 public key
    pub public_key: PublicKey,
    /// Optional preshared key
    pub preshared_key: Option<PresharedKey>,
    /// Peer's UDP endpoint
    pub endpoint: Option<SocketAddr>,
    /// Ranges routed to this peer, in order
    pub allowed_ips: Vec<Cidr>,
    /// Keepalive interval in seconds (0 = off)
    pub persistent_keepalive: u16,
}

impl PeerConfig {
    /// Create a peer with just a public key
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: 0,
        }
    }

    /// Set the endpoint
    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Add an allowed IP range
    pub fn with_allowed_ip(mut self, cidr: Cidr) -> Self {
        self.allowed_ips.push(cidr);
        self
    }

    /// Set persistent keepalive
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = seconds;
        self
    }
}

/// A complete tunnel configuration. Peer order is significant on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Interface section
    pub interface: InterfaceConfig,
    /// Peer sections, in file order
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfig {
    /// Create a config with an interface key and no peers
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            interface: InterfaceConfig {
                private_key,
                addresses: Vec::new(),
                dns: Vec::new(),
                listen_port: None,
                mtu: DEFAULT_MTU,
            },
            peers: Vec::new(),
        }
    }

    /// Add a peer
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Parse configuration text
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut section = Section::None;
        let mut iface = RawInterface::default();
        let mut peers: Vec<RawPeer> = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim();
                section = if name.eq_ignore_ascii_case("interface") {
                    Section::Interface
                } else if name.eq_ignore_ascii_case("peer") {
                    peers.push(RawPeer::default());
                    Section::Peer
                } else {
                    tracing::debug!("Ignoring unknown section [{}]", name);
                    Section::Unknown
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::debug!("Ignoring line without '=': {}", line);
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().to_string();

            match section {
                Section::Interface => iface.set(&key, value),
                Section::Peer => {
                    if let Some(peer) = peers.last_mut() {
                        peer.set(&key, value);
                    }
                }
                Section::None => {
                    tracing::debug!("Discarding key '{}' outside any section", key);
                }
                Section::Unknown => {}
            }
        }

        let interface = iface.build()?;
        let peers = peers
            .into_iter()
            .enumerate()
            .map(|(i, p)| p.build(i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { interface, peers })
    }

    /// All allowed-IP ranges across peers, in peer then entry order
    pub fn allowed_ips(&self) -> impl Iterator<Item = &Cidr> {
        self.peers.iter().flat_map(|p| p.allowed_ips.iter())
    }
}

impl FromStr for TunnelConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical text form. Re-parsing the output yields an equal config.
impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let iface = &self.interface;
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", iface.private_key.to_base64())?;
        if !iface.addresses.is_empty() {
            writeln!(f, "Address = {}", join(&iface.addresses))?;
        }
        if !iface.dns.is_empty() {
            writeln!(f, "DNS = {}", join(&iface.dns))?;
        }
        if let Some(port) = iface.listen_port {
            writeln!(f, "ListenPort = {}", port)?;
        }
        writeln!(f, "MTU = {}", iface.mtu)?;

        for peer in &self.peers {
            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "PublicKey = {}", peer.public_key.to_base64())?;
            if let Some(ref psk) = peer.preshared_key {
                writeln!(f, "PresharedKey = {}", psk.to_base64())?;
            }
            if let Some(endpoint) = peer.endpoint {
                writeln!(f, "Endpoint = {}", endpoint)?;
            }
            if !peer.allowed_ips.is_empty() {
                writeln!(f, "AllowedIPs = {}", join(&peer.allowed_ips))?;
            }
            if peer.persistent_keepalive > 0 {
                writeln!(f, "PersistentKeepalive = {}", peer.persistent_keepalive)?;
            }
        }
        Ok(())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Raw section accumulators
// ============================================================================

#[derive(Clone, Copy)]
enum Section {
    None,
    Interface,
    Peer,
    Unknown,
}

#[derive(Default)]
struct RawInterface {
    private_key: Option<String>,
    address: Option<String>,
    dns: Option<String>,
    listen_port: Option<String>,
    mtu: Option<String>,
}

impl RawInterface {
    fn set(&mut self, key: &str, value: String) {
        match key {
            "privatekey" => self.private_key = Some(value),
            "address" => self.address = Some(value),
            "dns" => self.dns = Some(value),
            "listenport" => self.listen_port = Some(value),
            "mtu" => self.mtu = Some(value),
            other => tracing::debug!("Ignoring unknown interface key '{}'", other),
        }
    }

    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let private_key = self
            .private_key
            .ok_or_else(|| ConfigError::MissingField("Interface.PrivateKey".into()))?;
        let private_key =
            PrivateKey::from_base64(&private_key).map_err(|source| ConfigError::InvalidKey {
                field: "PrivateKey".into(),
                source,
            })?;

        let addresses = match self.address {
            Some(ref list) => parse_cidr_list("Address", list)?,
            None => Vec::new(),
        };

        let dns = match self.dns {
            Some(ref list) => split_list(list)
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|_| ConfigError::InvalidAddress {
                        field: "DNS".into(),
                        value: s.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let listen_port = self
            .listen_port
            .map(|v| parse_number::<u16>("ListenPort", &v))
            .transpose()?;

        let mtu = match self.mtu {
            Some(v) => parse_number::<u16>("MTU", &v)?,
            None => DEFAULT_MTU,
        };

        Ok(InterfaceConfig {
            private_key,
            addresses,
            dns,
            listen_port,
            mtu,
        })
    }
}

#[derive(Default)]
struct RawPeer {
    public_key: Option<String>,
    preshared_key: Option<String>,
    endpoint: Option<String>,
    allowed_ips: Vec<String>,
    persistent_keepalive: Option<String>,
}

impl RawPeer {
    fn set(&mut self, key: &str, value: String) {
        match key {
            "publickey" => self.public_key = Some(value),
            "presharedkey" => self.preshared_key = Some(value),
            "endpoint" => self.endpoint = Some(value),
            // Repeated AllowedIPs lines accumulate
            "allowedips" => self.allowed_ips.push(value),
            "persistentkeepalive" => self.persistent_keepalive = Some(value),
            other => tracing::debug!("Ignoring unknown peer key '{}'", other),
        }
    }

    fn build(self, index: usize) -> Result<PeerConfig, ConfigError> {
        let public_key = self
            .public_key
            .ok_or_else(|| ConfigError::MissingField(format!("Peer[{}].PublicKey", index)))?;
        let public_key =
            PublicKey::from_base64(&public_key).map_err(|source| ConfigError::InvalidKey {
                field: format!("Peer[{}].PublicKey", index),
                source,
            })?;

        let preshared_key = self
            .preshared_key
            .map(|v| {
                PresharedKey::from_base64(&v).map_err(|source| ConfigError::InvalidKey {
                    field: format!("Peer[{}].PresharedKey", index),
                    source,
                })
            })
            .transpose()?;

        let endpoint = self
            .endpoint
            .map(|v| {
                v.parse::<SocketAddr>()
                    .map_err(|_| ConfigError::InvalidAddress {
                        field: format!("Peer[{}].Endpoint", index),
                        value: v.clone(),
                    })
            })
            .transpose()?;

        let mut allowed_ips = Vec::new();
        for list in &self.allowed_ips {
            allowed_ips.extend(parse_cidr_list(&format!("Peer[{}].AllowedIPs", index), list)?);
        }

        let persistent_keepalive = match self.persistent_keepalive.as_deref() {
            None => 0,
            Some(v) if v.eq_ignore_ascii_case("off") => 0,
            Some(v) => parse_number::<u16>("PersistentKeepalive", v)?,
        };

        Ok(PeerConfig {
            public_key,
            preshared_key,
            endpoint,
            allowed_ips,
            persistent_keepalive,
        })
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_cidr_list(field: &str, list: &str) -> Result<Vec<Cidr>, ConfigError> {
    split_list(list)
        .map(|entry| {
            entry.parse::<Cidr>().map_err(|e| match e {
                CidrError::InvalidAddress(_) => ConfigError::InvalidAddress {
                    field: field.to_string(),
                    value: entry.to_string(),
                },
                CidrError::InvalidPrefix { .. } => ConfigError::InvalidPrefix {
                    field: field.to_string(),
                    value: entry.to_string(),
                },
            })
        })
        .collect()
}

fn parse_number<T: FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}
