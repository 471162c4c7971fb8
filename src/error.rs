//! Error types for wgproxy
//!
//! This module defines the error types used throughout the library.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation in the binary.

use std::net::IpAddr;
use thiserror::Error;

/// Main error type for wgproxy operations
#[derive(Error, Debug)]
pub enum WgProxyError {
    /// Structurally invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control-protocol text could not be assembled, or a config
    /// document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The virtual network stack for a slot could not be created
    #[error("Failed to create virtual stack for peer slot {slot} ({address}): {reason}")]
    StackCreation {
        /// Peer slot index
        slot: usize,
        /// Local address the stack was scoped to
        address: IpAddr,
        /// Underlying failure
        reason: String,
    },

    /// The device rejected the control-protocol text
    #[error("Device for peer slot {slot} ({address}) rejected configuration: {reason}")]
    DeviceConfiguration {
        /// Peer slot index
        slot: usize,
        /// Local address of the device's stack
        address: IpAddr,
        /// Underlying failure
        reason: String,
    },

    /// The device could not be brought up
    #[error("Failed to bring up device for peer slot {slot} ({address}): {reason}")]
    DeviceActivation {
        /// Peer slot index
        slot: usize,
        /// Local address of the device's stack
        address: IpAddr,
        /// Underlying failure
        reason: String,
    },

    /// WireGuard protocol errors raised inside a device
    #[error("WireGuard error: {0}")]
    WireGuard(String),

    /// Socket and runtime errors raised inside a device
    #[error("Platform error: {0}")]
    Platform(String),

    /// Packet processing errors on a virtual interface
    #[error("Packet processing error: {0}")]
    PacketProcessing(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using WgProxyError
pub type Result<T> = std::result::Result<T, WgProxyError>;

impl From<serde_json::Error> for WgProxyError {
    fn from(err: serde_json::Error) -> Self {
        WgProxyError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for WgProxyError {
    fn from(err: toml::de::Error) -> Self {
        WgProxyError::Config(err.to_string())
    }
}

impl From<std::fmt::Error> for WgProxyError {
    fn from(err: std::fmt::Error) -> Self {
        WgProxyError::Serialization(err.to_string())
    }
}
