//! wgproxy: userspace WireGuard tunnels behind virtual network stacks
//!
//! This library compiles an interface configuration into the WireGuard
//! control-protocol text and starts one userspace tunnel per configured
//! local address. Each tunnel pairs a virtual network stack with a
//! boringtun-backed device, so no kernel interface or elevated privilege
//! is involved.
//!
//! # Modules
//!
//! - `config`: Configuration model and file loading
//! - `wireguard`: Control-protocol compiler, keys and devices
//! - `netstack`: Virtual network stacks
//! - `tunnel`: Tunnel orchestration
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod netstack;
pub mod tunnel;
pub mod wireguard;

// Re-export commonly used types
pub use error::{Result, WgProxyError};
pub use tunnel::{start_wireguard, VirtualTun};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
