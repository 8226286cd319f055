//! Driver configuration wire format
//!
//! The tunnel driver accepts and returns its whole device state as one
//! packed little-endian buffer:
//!
//! ```text
//! +-------------------+-------------+------------------+------------------+-------------+-----
//! | interface (80 B)  | peer (136 B)| allowed-ip (24 B)| allowed-ip (24 B)| peer (136 B)| ...
//! +-------------------+-------------+------------------+------------------+-------------+-----
//! ```
//!
//! Each record is padded to an 8-byte boundary. Multi-byte integers are
//! little-endian except the endpoint port, which is stored in network order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

use crate::config::TunnelConfig;
use crate::types::{max_prefix, Cidr, PresharedKey, PrivateKey, PublicKey, KEY_LENGTH};

/// Interface record layout
pub mod interface {
    /// Record size
    pub const SIZE: usize = 80;
    /// Flag word (u32)
    pub const FLAGS: usize = 0;
    /// Listen port (u16)
    pub const LISTEN_PORT: usize = 4;
    /// Private key ([u8; 32])
    pub const PRIVATE_KEY: usize = 8;
    /// Public key ([u8; 32])
    pub const PUBLIC_KEY: usize = 40;
    /// Number of peer records that follow (u32)
    pub const PEER_COUNT: usize = 72;

    /// Public key field is valid
    pub const HAS_PUBLIC_KEY: u32 = 1 << 0;
    /// Private key field is valid
    pub const HAS_PRIVATE_KEY: u32 = 1 << 1;
    /// Listen port field is valid
    pub const HAS_LISTEN_PORT: u32 = 1 << 2;
    /// Replace every existing peer
    pub const REPLACE_PEERS: u32 = 1 << 3;
}

/// Peer record layout
pub mod peer {
    /// Record size
    pub const SIZE: usize = 136;
    /// Flag word (u32)
    pub const FLAGS: usize = 0;
    /// Public key ([u8; 32])
    pub const PUBLIC_KEY: usize = 8;
    /// Preshared key ([u8; 32])
    pub const PRESHARED_KEY: usize = 40;
    /// Persistent keepalive seconds (u16)
    pub const KEEPALIVE: usize = 72;
    /// Endpoint address family (u16)
    pub const ENDPOINT_FAMILY: usize = 76;
    /// Endpoint port (u16, network order)
    pub const ENDPOINT_PORT: usize = 78;
    /// Endpoint address ([u8; 16])
    pub const ENDPOINT_ADDR: usize = 80;
    /// Transmitted bytes (u64)
    pub const TX_BYTES: usize = 104;
    /// Received bytes (u64)
    pub const RX_BYTES: usize = 112;
    /// Last handshake timestamp (u64)
    pub const LAST_HANDSHAKE: usize = 120;
    /// Number of allowed-ip records that follow (u32)
    pub const ALLOWED_IP_COUNT: usize = 128;

    /// Public key field is valid
    pub const HAS_PUBLIC_KEY: u32 = 1 << 0;
    /// Preshared key field is valid
    pub const HAS_PRESHARED_KEY: u32 = 1 << 1;
    /// Keepalive field is valid
    pub const HAS_PERSISTENT_KEEPALIVE: u32 = 1 << 2;
    /// Endpoint field is valid
    pub const HAS_ENDPOINT: u32 = 1 << 3;
    /// Replace the peer's allowed IPs
    pub const REPLACE_ALLOWED_IPS: u32 = 1 << 5;
    /// Remove the peer
    pub const REMOVE: u32 = 1 << 6;
    /// Only update an existing peer
    pub const UPDATE: u32 = 1 << 7;
}

/// Allowed-IP record layout
pub mod allowed_ip {
    /// Record size
    pub const SIZE: usize = 24;
    /// Address ([u8; 16], IPv4 uses the first 4)
    pub const ADDRESS: usize = 0;
    /// Address family (u16)
    pub const FAMILY: usize = 16;
    /// Prefix length (u8)
    pub const CIDR: usize = 18;
}

/// Address family code for IPv4
pub const AF_INET: u16 = 2;
/// Address family code for IPv6
pub const AF_INET6: u16 = 23;

const ENDPOINT_RESERVED: usize = 8;

/// Errors that can occur while encoding or decoding driver state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer ended inside a record
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish the record
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Key field was not 32 bytes
    #[error("key must be {expected} bytes, got {actual}")]
    KeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Address family code not recognised
    #[error("unknown address family: {0}")]
    UnknownFamily(u16),

    /// Allowed-IP prefix longer than its family allows
    #[error("prefix length {prefix} invalid for family {family}")]
    InvalidPrefix {
        /// Family code of the record
        family: u16,
        /// Prefix length found
        prefix: u8,
    },

    /// Too many records to express in a u32 count
    #[error("record count {0} does not fit the wire format")]
    CountOverflow(usize),
}

impl From<crate::types::KeyError> for CodecError {
    fn from(err: crate::types::KeyError) -> Self {
        match err {
            crate::types::KeyError::InvalidLength { expected, actual } => {
                CodecError::KeyLength { expected, actual }
            }
            crate::types::KeyError::InvalidEncoding => CodecError::KeyLength {
                expected: KEY_LENGTH,
                actual: 0,
            },
        }
    }
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

// ============================================================================
// Device state model
// ============================================================================

/// Interface section of the driver state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceRecord {
    /// Raw flag word
    pub flags: u32,
    /// UDP listen port
    pub listen_port: Option<u16>,
    /// Interface private key
    pub private_key: Option<PrivateKey>,
    /// Interface public key (reported by the driver)
    pub public_key: Option<PublicKey>,
}

/// One peer of the driver state, including live counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Raw flag word
    pub flags: u32,
    /// Peer public key
    pub public_key: PublicKey,
    /// Preshared key
    pub preshared_key: Option<PresharedKey>,
    /// Keepalive seconds (0 = off)
    pub persistent_keepalive: u16,
    /// Remote endpoint
    pub endpoint: Option<SocketAddr>,
    /// Bytes sent to this peer
    pub tx_bytes: u64,
    /// Bytes received from this peer
    pub rx_bytes: u64,
    /// Last handshake time as reported by the driver
    pub last_handshake: u64,
    /// Allowed IP ranges in order
    pub allowed_ips: Vec<Cidr>,
}

impl PeerRecord {
    /// Fresh peer record for a configured peer
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            flags: peer::HAS_PUBLIC_KEY | peer::REPLACE_ALLOWED_IPS,
            public_key,
            preshared_key: None,
            persistent_keepalive: 0,
            endpoint: None,
            tx_bytes: 0,
            rx_bytes: 0,
            last_handshake: 0,
            allowed_ips: Vec::new(),
        }
    }
}

/// Everything the driver knows about one adapter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceState {
    /// Interface record
    pub interface: InterfaceRecord,
    /// Peer records in wire order
    pub peers: Vec<PeerRecord>,
}

impl DeviceState {
    /// Build the state that replaces whatever the driver holds with `config`
    pub fn from_config(config: &TunnelConfig) -> Self {
        let iface = &config.interface;
        let mut flags = interface::HAS_PRIVATE_KEY | interface::REPLACE_PEERS;
        if iface.listen_port.is_some() {
            flags |= interface::HAS_LISTEN_PORT;
        }

        let peers = config
            .peers
            .iter()
            .map(|p| {
                let mut record = PeerRecord::new(p.public_key);
                if let Some(ref psk) = p.preshared_key {
                    record.flags |= peer::HAS_PRESHARED_KEY;
                    record.preshared_key = Some(psk.clone());
                }
                if p.persistent_keepalive > 0 {
                    record.flags |= peer::HAS_PERSISTENT_KEEPALIVE;
                    record.persistent_keepalive = p.persistent_keepalive;
                }
                if let Some(endpoint) = p.endpoint {
                    record.flags |= peer::HAS_ENDPOINT;
                    record.endpoint = Some(endpoint);
                }
                record.allowed_ips = p.allowed_ips.clone();
                record
            })
            .collect();

        Self {
            interface: InterfaceRecord {
                flags,
                listen_port: iface.listen_port,
                private_key: Some(iface.private_key.clone()),
                public_key: None,
            },
            peers,
        }
    }

    /// Exact size of the encoded buffer
    pub fn encoded_len(&self) -> usize {
        interface::SIZE
            + self
                .peers
                .iter()
                .map(|p| peer::SIZE + p.allowed_ips.len() * allowed_ip::SIZE)
                .sum::<usize>()
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a config as the buffer pushed to the driver
pub fn encode_config(config: &TunnelConfig) -> Result<Bytes> {
    encode(&DeviceState::from_config(config))
}

/// Encode a device state into a new buffer
pub fn encode(state: &DeviceState) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(state.encoded_len());
    encode_into(state, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a device state into an existing buffer
pub fn encode_into(state: &DeviceState, buf: &mut BytesMut) -> Result<()> {
    let peer_count = count_u32(state.peers.len())?;
    let iface = &state.interface;

    buf.put_u32_le(iface.flags);
    buf.put_u16_le(iface.listen_port.unwrap_or(0));
    buf.put_u16_le(0);
    put_key(buf, iface.private_key.as_ref().map(PrivateKey::as_bytes));
    put_key(buf, iface.public_key.as_ref().map(PublicKey::as_bytes));
    buf.put_u32_le(peer_count);
    buf.put_bytes(0, interface::SIZE - interface::PEER_COUNT - 4);

    for p in &state.peers {
        encode_peer(p, buf)?;
    }
    Ok(())
}

fn encode_peer(p: &PeerRecord, buf: &mut BytesMut) -> Result<()> {
    let allowed_count = count_u32(p.allowed_ips.len())?;

    buf.put_u32_le(p.flags);
    buf.put_u32_le(0);
    buf.put_slice(p.public_key.as_bytes());
    put_key(buf, p.preshared_key.as_ref().map(PresharedKey::as_bytes));
    buf.put_u16_le(p.persistent_keepalive);
    buf.put_bytes(0, peer::ENDPOINT_FAMILY - peer::KEEPALIVE - 2);

    match p.endpoint {
        Some(addr) => {
            let (family, octets) = family_and_octets(&addr.ip());
            buf.put_u16_le(family);
            buf.put_u16(addr.port());
            buf.put_slice(&octets);
        }
        None => buf.put_bytes(0, 2 + 2 + 16),
    }
    buf.put_bytes(0, ENDPOINT_RESERVED);

    buf.put_u64_le(p.tx_bytes);
    buf.put_u64_le(p.rx_bytes);
    buf.put_u64_le(p.last_handshake);
    buf.put_u32_le(allowed_count);
    buf.put_bytes(0, peer::SIZE - peer::ALLOWED_IP_COUNT - 4);

    for cidr in &p.allowed_ips {
        let (family, octets) = family_and_octets(&cidr.addr);
        buf.put_slice(&octets);
        buf.put_u16_le(family);
        buf.put_u8(cidr.prefix);
        buf.put_bytes(0, allowed_ip::SIZE - allowed_ip::CIDR - 1);
    }
    Ok(())
}

fn put_key(buf: &mut BytesMut, key: Option<&[u8; KEY_LENGTH]>) {
    match key {
        Some(k) => buf.put_slice(k),
        None => buf.put_bytes(0, KEY_LENGTH),
    }
}

fn count_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| CodecError::CountOverflow(len))
}

fn family_and_octets(addr: &IpAddr) -> (u16, [u8; 16]) {
    let mut octets = [0u8; 16];
    match addr {
        IpAddr::V4(v4) => {
            octets[..4].copy_from_slice(&v4.octets());
            (AF_INET, octets)
        }
        IpAddr::V6(v6) => (AF_INET6, v6.octets()),
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a driver buffer. Trailing bytes after the last record are ignored.
pub fn decode(data: &[u8]) -> Result<DeviceState> {
    let mut buf = data;
    ensure(&buf, interface::SIZE)?;

    let flags = buf.get_u32_le();
    let listen_port = buf.get_u16_le();
    buf.advance(2);
    let private_key = take_key(&mut buf);
    let public_key = take_key(&mut buf);
    let peer_count = buf.get_u32_le() as usize;
    buf.advance(interface::SIZE - interface::PEER_COUNT - 4);

    let interface = InterfaceRecord {
        flags,
        listen_port: (flags & interface::HAS_LISTEN_PORT != 0).then_some(listen_port),
        private_key: (flags & interface::HAS_PRIVATE_KEY != 0)
            .then(|| PrivateKey::from_bytes(private_key)),
        public_key: (flags & interface::HAS_PUBLIC_KEY != 0)
            .then(|| PublicKey::from_bytes(public_key)),
    };

    // Cap the preallocation; a corrupt count must not drive a huge allocation
    let mut peers = Vec::with_capacity(peer_count.min(buf.remaining() / peer::SIZE));
    for _ in 0..peer_count {
        peers.push(decode_peer(&mut buf)?);
    }

    Ok(DeviceState { interface, peers })
}

fn decode_peer(buf: &mut &[u8]) -> Result<PeerRecord> {
    ensure(buf, peer::SIZE)?;

    let flags = buf.get_u32_le();
    buf.advance(4);
    let public_key = PublicKey::from_bytes(take_key(buf));
    let preshared_key = take_key(buf);
    let persistent_keepalive = buf.get_u16_le();
    buf.advance(peer::ENDPOINT_FAMILY - peer::KEEPALIVE - 2);

    let family = buf.get_u16_le();
    let port = buf.get_u16();
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    buf.advance(ENDPOINT_RESERVED);
    let endpoint = if flags & peer::HAS_ENDPOINT != 0 {
        Some(SocketAddr::new(ip_from_family(family, &octets)?, port))
    } else {
        None
    };

    let tx_bytes = buf.get_u64_le();
    let rx_bytes = buf.get_u64_le();
    let last_handshake = buf.get_u64_le();
    let allowed_count = buf.get_u32_le() as usize;
    buf.advance(peer::SIZE - peer::ALLOWED_IP_COUNT - 4);

    let mut allowed_ips = Vec::with_capacity(allowed_count.min(buf.remaining() / allowed_ip::SIZE));
    for _ in 0..allowed_count {
        ensure(buf, allowed_ip::SIZE)?;
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let family = buf.get_u16_le();
        let prefix = buf.get_u8();
        buf.advance(allowed_ip::SIZE - allowed_ip::CIDR - 1);

        let addr = ip_from_family(family, &octets)?;
        if prefix > max_prefix(&addr) {
            return Err(CodecError::InvalidPrefix { family, prefix });
        }
        allowed_ips.push(Cidr { addr, prefix });
    }

    Ok(PeerRecord {
        flags,
        public_key,
        preshared_key: (flags & peer::HAS_PRESHARED_KEY != 0)
            .then(|| PresharedKey::from_bytes(preshared_key)),
        persistent_keepalive,
        endpoint,
        tx_bytes,
        rx_bytes,
        last_handshake,
        allowed_ips,
    })
}

fn ensure(buf: &&[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn take_key(buf: &mut &[u8]) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    buf.copy_to_slice(&mut key);
    key
}

fn ip_from_family(family: u16, octets: &[u8; 16]) -> Result<IpAddr> {
    match family {
        AF_INET => Ok(IpAddr::V4(Ipv4Addr::new(
            octets[0], octets[1], octets[2], octets[3],
        ))),
        AF_INET6 => Ok(IpAddr::V6(Ipv6Addr::from(*octets))),
        other => Err(CodecError::UnknownFamily(other)),
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Traffic counters for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCounters {
    /// Peer the counters belong to
    pub public_key: PublicKey,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes sent
    pub tx_bytes: u64,
    /// Last handshake time reported by the driver
    pub last_handshake: u64,
}

/// Snapshot of per-peer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// One entry per peer, in wire order
    pub peers: Vec<PeerCounters>,
}

impl Counters {
    /// Extract counters from a decoded state
    pub fn from_state(state: &DeviceState) -> Self {
        Self {
            peers: state
                .peers
                .iter()
                .map(|p| PeerCounters {
                    public_key: p.public_key,
                    rx_bytes: p.rx_bytes,
                    tx_bytes: p.tx_bytes,
                    last_handshake: p.last_handshake,
                })
                .collect(),
        }
    }

    /// Decode counters straight from a driver buffer; an empty buffer means
    /// the adapter was never configured
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        decode(data).map(|s| Self::from_state(&s))
    }

    /// Total bytes received across peers
    pub fn rx(&self) -> u64 {
        self.peers.iter().fold(0u64, |acc, p| acc.saturating_add(p.rx_bytes))
    }

    /// Total bytes sent across peers
    pub fn tx(&self) -> u64 {
        self.peers.iter().fold(0u64, |acc, p| acc.saturating_add(p.tx_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    fn two_peer_config() -> TunnelConfig {
        let mut config = TunnelConfig::new(PrivateKey::from_bytes([1u8; 32]))
            .with_peer(
                PeerConfig::new(PublicKey::from_bytes([2u8; 32]))
                    .with_endpoint("67.219.108.79:51820".parse().unwrap())
                    .with_allowed_ip("0.0.0.0/0".parse().unwrap())
                    .with_allowed_ip("::/0".parse().unwrap())
                    .with_keepalive(25),
            )
            .with_peer(
                PeerConfig::new(PublicKey::from_bytes([3u8; 32]))
                    .with_endpoint("[2001:db8::7]:443".parse().unwrap())
                    .with_allowed_ip("10.10.0.0/16".parse().unwrap()),
            );
        config.interface.listen_port = Some(51821);
        config.peers[1].preshared_key = Some(PresharedKey::from_bytes([4u8; 32]));
        config
    }

    fn u32_at(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }

    fn u16_at(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
    }

    #[test]
    fn test_encoded_length() {
        let config = two_peer_config();
        let bytes = encode_config(&config).unwrap();
        assert_eq!(bytes.len(), 80 + 136 + 2 * 24 + 136 + 24);
        assert_eq!(bytes.len(), DeviceState::from_config(&config).encoded_len());
    }

    #[test]
    fn test_interface_field_offsets() {
        let bytes = encode_config(&two_peer_config()).unwrap();

        assert_eq!(
            u32_at(&bytes, interface::FLAGS),
            interface::HAS_PRIVATE_KEY | interface::REPLACE_PEERS | interface::HAS_LISTEN_PORT
        );
        assert_eq!(u16_at(&bytes, interface::LISTEN_PORT), 51821);
        assert_eq!(&bytes[interface::PRIVATE_KEY..interface::PRIVATE_KEY + 32], &[1u8; 32]);
        assert_eq!(&bytes[interface::PUBLIC_KEY..interface::PUBLIC_KEY + 32], &[0u8; 32]);
        assert_eq!(u32_at(&bytes, interface::PEER_COUNT), 2);
    }

    #[test]
    fn test_peer_and_allowed_ip_offsets() {
        let bytes = encode_config(&two_peer_config()).unwrap();
        let p = &bytes[interface::SIZE..];

        assert_eq!(
            u32_at(p, peer::FLAGS),
            peer::HAS_PUBLIC_KEY
                | peer::REPLACE_ALLOWED_IPS
                | peer::HAS_ENDPOINT
                | peer::HAS_PERSISTENT_KEEPALIVE
        );
        assert_eq!(&p[peer::PUBLIC_KEY..peer::PUBLIC_KEY + 32], &[2u8; 32]);
        assert_eq!(&p[peer::PRESHARED_KEY..peer::PRESHARED_KEY + 32], &[0u8; 32]);
        assert_eq!(u16_at(p, peer::KEEPALIVE), 25);
        assert_eq!(u16_at(p, peer::ENDPOINT_FAMILY), AF_INET);
        // Port is big-endian
        assert_eq!(&p[peer::ENDPOINT_PORT..peer::ENDPOINT_PORT + 2], &[0xCA, 0x6C]);
        assert_eq!(&p[peer::ENDPOINT_ADDR..peer::ENDPOINT_ADDR + 4], &[67, 219, 108, 79]);
        assert_eq!(&p[peer::TX_BYTES..peer::ALLOWED_IP_COUNT], &[0u8; 24]);
        assert_eq!(u32_at(p, peer::ALLOWED_IP_COUNT), 2);

        let a = &p[peer::SIZE..];
        assert_eq!(&a[allowed_ip::ADDRESS..allowed_ip::ADDRESS + 16], &[0u8; 16]);
        assert_eq!(u16_at(a, allowed_ip::FAMILY), AF_INET);
        assert_eq!(a[allowed_ip::CIDR], 0);
        let b = &a[allowed_ip::SIZE..];
        assert_eq!(u16_at(b, allowed_ip::FAMILY), AF_INET6);
    }

    #[test]
    fn test_decode_reproduces_config_fields() {
        let config = two_peer_config();
        let state = decode(&encode_config(&config).unwrap()).unwrap();

        assert_eq!(state, DeviceState::from_config(&config));
        assert_eq!(state.interface.listen_port, Some(51821));
        assert_eq!(state.peers[0].allowed_ips, config.peers[0].allowed_ips);
        assert_eq!(state.peers[1].endpoint, config.peers[1].endpoint);
        assert_eq!(state.peers[1].preshared_key, config.peers[1].preshared_key);
        assert_eq!(state.peers[0].tx_bytes, 0);
    }

    #[test]
    fn test_zero_counts() {
        let config = TunnelConfig::new(PrivateKey::from_bytes([9u8; 32]))
            .with_peer(PeerConfig::new(PublicKey::from_bytes([8u8; 32])));
        let bytes = encode_config(&config).unwrap();
        assert_eq!(bytes.len(), interface::SIZE + peer::SIZE);

        let state = decode(&bytes).unwrap();
        assert!(state.peers[0].allowed_ips.is_empty());
        assert_eq!(state.peers[0].endpoint, None);

        let empty = TunnelConfig::new(PrivateKey::from_bytes([9u8; 32]));
        let state = decode(&encode_config(&empty).unwrap()).unwrap();
        assert!(state.peers.is_empty());
    }

    #[test]
    fn test_truncated_buffers() {
        let bytes = encode_config(&two_peer_config()).unwrap();

        assert_eq!(
            decode(&bytes[..40]),
            Err(CodecError::Truncated {
                needed: 80,
                available: 40
            })
        );
        assert!(matches!(
            decode(&bytes[..interface::SIZE + 100]),
            Err(CodecError::Truncated { needed: 136, .. })
        ));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated { needed: 24, .. })
        ));
    }

    #[test]
    fn test_unknown_family_and_bad_prefix() {
        let mut bytes = encode_config(&two_peer_config()).unwrap().to_vec();
        let first_aip = interface::SIZE + peer::SIZE;

        bytes[first_aip + allowed_ip::CIDR] = 33;
        assert_eq!(
            decode(&bytes),
            Err(CodecError::InvalidPrefix {
                family: AF_INET,
                prefix: 33
            })
        );

        bytes[first_aip + allowed_ip::CIDR] = 0;
        bytes[first_aip + allowed_ip::FAMILY] = 99;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownFamily(99)));
    }

    #[test]
    fn test_counters_totals() {
        let mut state = DeviceState::from_config(&two_peer_config());
        state.peers[0].rx_bytes = 1000;
        state.peers[0].tx_bytes = 200;
        state.peers[1].rx_bytes = 5;
        state.peers[1].tx_bytes = 7;

        let counters = Counters::decode(&encode(&state).unwrap()).unwrap();
        assert_eq!(counters.rx(), 1005);
        assert_eq!(counters.tx(), 207);
        assert_eq!(counters.peers[1].public_key, PublicKey::from_bytes([3u8; 32]));

        assert_eq!(Counters::decode(&[]).unwrap(), Counters::default());
    }

    #[test]
    fn test_key_error_conversion() {
        let err: CodecError = crate::types::key_from_slice(&[0u8; 31]).unwrap_err().into();
        assert_eq!(
            err,
            CodecError::KeyLength {
                expected: 32,
                actual: 31
            }
        );
    }
}
