//! Key and address types shared by the parser and the wire codec

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every WireGuard key (private, public, preshared)
pub const KEY_LENGTH: usize = 32;

/// Errors produced while decoding key material
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Not valid base64
    #[error("invalid base64 encoding")]
    InvalidEncoding,

    /// Decoded to the wrong number of bytes
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Decoded length
        actual: usize,
    },
}

/// Decode a base64 key into exactly [`KEY_LENGTH`] bytes
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LENGTH], KeyError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| KeyError::InvalidEncoding)?;
    key_from_slice(&bytes)
}

/// Copy a raw slice into a key, rejecting anything that is not 32 bytes
pub fn key_from_slice(bytes: &[u8]) -> Result<[u8; KEY_LENGTH], KeyError> {
    <[u8; KEY_LENGTH]>::try_from(bytes).map_err(|_| KeyError::InvalidLength {
        expected: KEY_LENGTH,
        actual: bytes.len(),
    })
}

/// Encode a key as standard base64
pub fn encode_key(key: &[u8; KEY_LENGTH]) -> String {
    STANDARD.encode(key)
}

// ============================================================================
// Keys
// ============================================================================

/// X25519 private key (zeroized on drop)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_LENGTH]);

impl PrivateKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Derive the matching X25519 public key
    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    /// Generate a fresh random private key
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand_core::OsRng);
        Self(secret.to_bytes())
    }
}

/// Generate a fresh X25519 private key
pub fn generate_private_key() -> PrivateKey {
    PrivateKey::generate()
}

/// Derive the public key for a private key
pub fn public_key_from_private(private: &PrivateKey) -> PublicKey {
    private.public_key()
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Short hex fingerprint for log lines
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", self.fingerprint())
    }
}

/// Optional symmetric key mixed into the handshake (zeroized on drop)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PresharedKey([u8; KEY_LENGTH]);

impl PresharedKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresharedKey([REDACTED])")
    }
}

// ============================================================================
// CIDR blocks
// ============================================================================

/// An address with a prefix length, e.g. `10.0.0.0/8` or `::/0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cidr {
    /// Network (or host) address
    pub addr: IpAddr,
    /// Prefix length in bits
    pub prefix: u8,
}

/// Errors produced while parsing a CIDR block
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrError {
    /// Address part did not parse
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// Prefix part did not parse or exceeds the family maximum
    #[error("invalid prefix length '{prefix}' for {addr}")]
    InvalidPrefix {
        /// Address the prefix was attached to
        addr: String,
        /// Offending prefix text
        prefix: String,
    },
}

impl Cidr {
    /// Create a CIDR block, validating the prefix against the address family
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > max_prefix(&addr) {
            return Err(CidrError::InvalidPrefix {
                addr: addr.to_string(),
                prefix: prefix.to_string(),
            });
        }
        Ok(Self { addr, prefix })
    }

    /// A single-host block (`/32` or `/128`)
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix: max_prefix(&addr),
        }
    }

    /// Whether this block covers the whole address family
    pub fn is_default(&self) -> bool {
        self.prefix == 0
    }

    /// The block with host bits cleared
    pub fn network(&self) -> Self {
        let addr = match self.addr {
            IpAddr::V4(a) => {
                let mask = if self.prefix == 0 { 0 } else { !0u32 << (32 - self.prefix) };
                IpAddr::V4((u32::from_be_bytes(a.octets()) & mask).into())
            }
            IpAddr::V6(a) => {
                let mask = if self.prefix == 0 { 0 } else { !0u128 << (128 - self.prefix) };
                IpAddr::V6((u128::from_be_bytes(a.octets()) & mask).into())
            }
        };
        Self {
            addr,
            prefix: self.prefix,
        }
    }

    /// Whether `addr` falls inside this block. Always false across families.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        if self.addr.is_ipv4() != addr.is_ipv4() {
            return false;
        }
        Cidr {
            addr: *addr,
            prefix: self.prefix,
        }
        .network()
            == self.network()
    }
}

/// Largest valid prefix length for the address family
pub fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a.trim(), Some(p.trim())),
            None => (s, None),
        };

        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| CidrError::InvalidAddress(addr_part.to_string()))?;

        match prefix_part {
            None => Ok(Self::host(addr)),
            Some(p) => {
                let prefix: u8 = p.parse().map_err(|_| CidrError::InvalidPrefix {
                    addr: addr.to_string(),
                    prefix: p.to_string(),
                })?;
                Self::new(addr, prefix)
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}
