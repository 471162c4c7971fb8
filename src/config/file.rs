//! Configuration file parser
//!
//! A config file has one `[interface]` table and any number of `[[peer]]`
//! tables. Keys are written in base64 the way `wg genkey` prints them and
//! are converted to hex for the control protocol on load.

use crate::config::{default_mtu, AllowedIp, DeviceConfig, LocalAddress, PeerConfig};
use crate::error::{Result, WgProxyError};
use crate::wireguard::{PresharedKey, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use tracing::debug;

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Local interface settings
    pub interface: InterfaceSection,

    /// Peers, in slot order
    #[serde(default)]
    pub peer: Vec<PeerSection>,
}

/// `[interface]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSection {
    /// Base64-encoded private key
    pub private_key: String,

    /// UDP listen port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// DNS servers
    #[serde(default)]
    pub dns: Vec<IpAddr>,

    /// Maximum Transmission Unit
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// `[[peer]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Base64-encoded public key
    pub public_key: String,

    /// Base64-encoded preshared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,

    /// Peer endpoint (host:port; hostnames are resolved on load)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Allowed IP addresses/ranges
    #[serde(default)]
    pub allowed_ips: Vec<AllowedIp>,

    /// Persistent keepalive interval in seconds
    #[serde(default)]
    pub persistent_keepalive: u16,

    /// Local address of the virtual stack dedicated to this peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<IpAddr>,
}

impl ConfigFile {
    /// Load a configuration file; `.json` is parsed as JSON, anything else as TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            WgProxyError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        debug!("Parsing config file {:?} as {}", path, if is_json { "JSON" } else { "TOML" });

        if is_json {
            Self::parse_json(&contents)
        } else {
            Self::parse(&contents)
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml: &str) -> Result<Self> {
        toml::from_str(toml)
            .map_err(|e| WgProxyError::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Parse configuration from a JSON string
    pub fn parse_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| WgProxyError::Config(format!("Failed to parse JSON: {}", e)))
    }
}

impl TryFrom<ConfigFile> for DeviceConfig {
    type Error = WgProxyError;

    fn try_from(file: ConfigFile) -> Result<Self> {
        let secret_key = PrivateKey::from_base64(&file.interface.private_key)?.to_hex();

        let mut peers = Vec::with_capacity(file.peer.len());
        let mut addresses = Vec::new();

        for (slot, section) in file.peer.into_iter().enumerate() {
            let public_key = PublicKey::from_base64(&section.public_key)
                .map_err(|e| WgProxyError::Config(format!("Peer {}: {}", slot, e)))?
                .to_hex();

            let preshared_key = match &section.preshared_key {
                Some(key) => PresharedKey::from_base64(key)
                    .map_err(|e| WgProxyError::Config(format!("Peer {}: {}", slot, e)))?,
                None => PresharedKey::zero(),
            }
            .to_hex();

            if let Some(address) = section.local_address {
                addresses.push(LocalAddress {
                    peer: slot,
                    address,
                });
            }

            peers.push(PeerConfig {
                public_key,
                preshared_key,
                keepalive: section.persistent_keepalive,
                endpoint: section
                    .endpoint
                    .as_deref()
                    .map(resolve_endpoint)
                    .transpose()
                    .map_err(|e| WgProxyError::Config(format!("Peer {}: {}", slot, e)))?,
                allowed_ips: section.allowed_ips,
            });
        }

        let config = DeviceConfig {
            secret_key,
            listen_port: file.interface.listen_port,
            peers,
            dns: file.interface.dns,
            addresses,
            mtu: file.interface.mtu,
        };
        config.validate()?;

        Ok(config)
    }
}

/// Resolve a `host:port` endpoint to the `ip:port` form the device reads
fn resolve_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.parse::<SocketAddr>().is_ok() {
        return Ok(endpoint.to_string());
    }

    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| WgProxyError::Config(format!("Failed to resolve endpoint {}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| {
            WgProxyError::Config(format!("Endpoint {} resolved to no addresses", endpoint))
        })?;

    debug!("Resolved endpoint {} to {}", endpoint, addr);
    Ok(addr.to_string())
}
