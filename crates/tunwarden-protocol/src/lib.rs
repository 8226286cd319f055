//! tunwarden protocol layer
//!
//! Everything that is a pure function of bytes or text:
//!
//! - [`config`]: the `[Interface]` / `[Peer]` tunnel configuration model and
//!   its parser and canonical printer
//! - [`codec`]: the packed little-endian layout the tunnel driver reads and
//!   writes, plus per-peer traffic [`Counters`]
//! - [`types`]: X25519 keys and CIDR blocks
//! - [`prefs`]: the client's flat `Key=Value` preferences file
//!
//! # Example
//!
//! ```
//! use tunwarden_protocol::{codec, PrivateKey, TunnelConfig};
//!
//! let text = format!(
//!     "[Interface]\nPrivateKey = {}\nAddress = 10.53.0.14/32\n\n[Peer]\nPublicKey = {}\nAllowedIPs = 0.0.0.0/0\n",
//!     PrivateKey::generate().to_base64(),
//!     PrivateKey::generate().public_key().to_base64(),
//! );
//! let config = TunnelConfig::parse(&text).unwrap();
//! let bytes = codec::encode_config(&config).unwrap();
//! assert_eq!(codec::decode(&bytes).unwrap().peers.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod prefs;
pub mod types;

// Re-exports
pub use codec::{CodecError, Counters, DeviceState, PeerCounters};
pub use config::{ConfigError, InterfaceConfig, PeerConfig, TunnelConfig, DEFAULT_MTU};
pub use prefs::Preferences;
pub use types::{
    decode_key, encode_key, generate_private_key, public_key_from_private, Cidr, CidrError,
    KeyError, PresharedKey, PrivateKey, PublicKey, KEY_LENGTH,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
