//! tunwarden tunnel control service
//!
//! Owns the life of one WireGuard-style tunnel on behalf of an unprivileged
//! client: creates the virtual adapter through the platform driver, pushes
//! the packed configuration, installs addresses, routes and resolvers, and
//! tears all of it down again on disconnect, on failure, or when the client
//! stops reporting in.

#![warn(missing_docs)]

pub mod adapter;
pub mod bounded;
pub mod client;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod netops;
pub mod routes;
pub mod server;
pub mod supervisor;
pub mod watchdog;

// Platform-specific modules - only compile on their target
#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

// Re-exports
pub use adapter::{AdapterHandle, AdapterManager};
pub use client::{parse_status, send_command};
pub use config::{DriverKind, ServiceConfig};
pub use daemon::Daemon;
pub use driver::{AdapterState, DriverError, MemoryDriver, TunnelDriver};
pub use error::{TunnelError, TunnelResult};
pub use netops::{MemoryNetwork, NetworkOps};
pub use routes::{RouteEntry, RouteReconciler};
pub use server::{CommandRequest, CommandServer, StatusReply, DEFAULT_ENDPOINT};
pub use supervisor::{SessionState, Supervisor, SupervisorConfig, SupervisorHandle};
pub use watchdog::WatchdogConfig;
