//! Configuration validation functions
//!
//! This module validates configuration fields the way the device will
//! read them: hex-encoded keys, `ip:port` endpoints, and the MTU.

use crate::error::{Result, WgProxyError};
use std::net::SocketAddr;

/// Validate MTU value (any non-zero size)
pub fn validate_mtu(mtu: u16) -> Result<()> {
    if mtu == 0 {
        return Err(WgProxyError::Config("MTU must be greater than 0".to_string()));
    }
    Ok(())
}

/// Validate a 32-byte key in lowercase or uppercase hex (64 characters)
pub fn validate_hex_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(WgProxyError::Config("Key cannot be empty".to_string()));
    }

    if key.len() != 64 {
        return Err(WgProxyError::Config(format!(
            "Invalid key length: {} (expected 64 hex characters)",
            key.len()
        )));
    }

    if !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WgProxyError::Config(
            "Key contains invalid hex characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a preshared key: empty, or a hex key
pub fn validate_preshared_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Ok(());
    }
    validate_hex_key(key)
}

/// Validate endpoint format (ip:port)
///
/// Hostnames must be resolved before the config reaches the device.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let addr: SocketAddr = endpoint.parse().map_err(|_| {
        WgProxyError::Config(format!(
            "Invalid endpoint format: {} (expected format: ip:port)",
            endpoint
        ))
    })?;

    if addr.port() == 0 {
        return Err(WgProxyError::Config("Port number cannot be 0".to_string()));
    }

    Ok(())
}
