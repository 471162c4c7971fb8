//! Configuration management
//!
//! This module holds the in-memory interface configuration consumed by the
//! control-protocol compiler and the tunnel orchestrator, and loads it from
//! TOML or JSON files.

mod allowed_ip;
mod file;
mod validation;

pub use allowed_ip::AllowedIp;
pub use file::{ConfigFile, InterfaceSection, PeerSection};

use crate::error::{Result, WgProxyError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Interface configuration: our key, our peers, and the local addresses
/// that each get their own virtual stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Private key, passed to the device verbatim
    pub secret_key: String,

    /// UDP listen port (None = let the device pick one)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Peers, in slot order
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// DNS servers (empty = system resolver)
    #[serde(default)]
    pub dns: Vec<IpAddr>,

    /// Peer slot to local address bindings, in construction order
    #[serde(default)]
    pub addresses: Vec<LocalAddress>,

    /// Maximum Transmission Unit
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Peer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer public key
    pub public_key: String,

    /// Preshared key; empty or all-zero means none
    #[serde(default)]
    pub preshared_key: String,

    /// Persistent keepalive interval in seconds (0 = disabled)
    #[serde(default)]
    pub keepalive: u16,

    /// Remote endpoint (ip:port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Allowed IP ranges; empty means everything
    #[serde(default)]
    pub allowed_ips: Vec<AllowedIp>,
}

/// Binds one peer slot to the local address of a dedicated virtual stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalAddress {
    /// Index into [`DeviceConfig::peers`]
    pub peer: usize,
    /// Address assigned to the virtual interface
    pub address: IpAddr,
}

impl DeviceConfig {
    /// Create a configuration with no peers
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            listen_port: None,
            peers: Vec::new(),
            dns: Vec::new(),
            addresses: Vec::new(),
            mtu: default_mtu(),
        }
    }

    /// Load configuration from a file; `.json` files are parsed as JSON,
    /// everything else as TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        ConfigFile::from_file(path)?.try_into()
    }

    /// Add a peer and return its slot index
    pub fn add_peer(&mut self, peer: PeerConfig) -> usize {
        self.peers.push(peer);
        self.peers.len() - 1
    }

    /// Give the peer at `slot` its own virtual stack at `address`
    pub fn bind_address(&mut self, slot: usize, address: IpAddr) {
        self.addresses.push(LocalAddress {
            peer: slot,
            address,
        });
    }

    /// Look up a peer by slot
    pub fn peer(&self, slot: usize) -> Option<&PeerConfig> {
        self.peers.get(slot)
    }

    /// Validate the configuration as it will be handed to the device
    pub fn validate(&self) -> Result<()> {
        validation::validate_mtu(self.mtu)?;
        validation::validate_hex_key(&self.secret_key)
            .map_err(|e| WgProxyError::Config(format!("Private key: {}", e)))?;

        for (slot, peer) in self.peers.iter().enumerate() {
            peer.validate()
                .map_err(|e| WgProxyError::Config(format!("Peer {}: {}", slot, e)))?;
        }

        Ok(())
    }
}

impl PeerConfig {
    /// Create a peer with no endpoint, keepalive or allowed IPs
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            preshared_key: String::new(),
            keepalive: 0,
            endpoint: None,
            allowed_ips: Vec::new(),
        }
    }

    /// The first allowed IP, used as the lookup key for this peer's tunnel
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.allowed_ips.first().map(AllowedIp::addr)
    }

    /// Validate peer configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_hex_key(&self.public_key)?;
        validation::validate_preshared_key(&self.preshared_key)?;

        if let Some(endpoint) = &self.endpoint {
            validation::validate_endpoint(endpoint)?;
        }

        Ok(())
    }
}

pub(crate) fn default_mtu() -> u16 {
    1420
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a";

    #[test]
    fn test_new_defaults() {
        let config = DeviceConfig::new(KEY);
        assert_eq!(config.mtu, 1420);
        assert!(config.listen_port.is_none());
        assert!(config.peers.is_empty());
        assert!(config.addresses.is_empty());
    }

    #[test]
    fn test_add_and_bind_peer() {
        let mut config = DeviceConfig::new(KEY);
        let slot = config.add_peer(PeerConfig::new(KEY));
        config.bind_address(slot, "10.200.0.2".parse().unwrap());

        assert_eq!(slot, 0);
        assert_eq!(
            config.addresses,
            vec![LocalAddress {
                peer: 0,
                address: "10.200.0.2".parse().unwrap()
            }]
        );
        assert!(config.peer(0).is_some());
        assert!(config.peer(1).is_none());
    }

    #[test]
    fn test_primary_address() {
        let mut peer = PeerConfig::new(KEY);
        assert!(peer.primary_address().is_none());

        peer.allowed_ips = vec!["10.0.0.2/32".parse().unwrap(), "10.0.1.0/24".parse().unwrap()];
        assert_eq!(peer.primary_address(), Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_validate() {
        let mut config = DeviceConfig::new(KEY);
        let mut peer = PeerConfig::new(KEY);
        peer.endpoint = Some("203.0.113.1:51820".to_string());
        config.add_peer(peer);
        assert!(config.validate().is_ok());

        config.peers[0].endpoint = Some("vpn.example.com:51820".to_string());
        assert!(config.validate().is_err());
        config.peers[0].endpoint = None;

        config.mtu = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_peer() {
        let mut config = DeviceConfig::new(KEY);
        let mut peer = PeerConfig::new(KEY);
        peer.endpoint = Some("no-port".to_string());
        config.add_peer(peer);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Peer 0"));
    }

    #[test]
    fn test_json_roundtrip_keeps_order() {
        let mut config = DeviceConfig::new(KEY);
        config.dns = vec!["1.1.1.1".parse().unwrap()];
        config.add_peer(PeerConfig::new(KEY));
        config.add_peer(PeerConfig::new(KEY));
        config.bind_address(1, "10.0.0.9".parse().unwrap());
        config.bind_address(0, "10.0.0.8".parse().unwrap());

        let json = serde_json::to_string(&config).unwrap();
        let parsed: DeviceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.addresses[0].peer, 1);
    }
}
