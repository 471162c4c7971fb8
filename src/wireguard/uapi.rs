//! Control-protocol parser
//!
//! The device side of [`create_ipc_request`](super::create_ipc_request):
//! reads `key=value` lines into typed settings. Interface keys come first,
//! then each `public_key` opens a peer block that later peer keys apply to.

use crate::config::AllowedIp;
use crate::error::{Result, WgProxyError};
use crate::wireguard::{PresharedKey, PrivateKey, PublicKey};
use std::net::SocketAddr;

/// Parsed device settings
#[derive(Debug, Clone)]
pub struct UapiConfig {
    /// Local private key
    pub private_key: PrivateKey,
    /// UDP listen port (None = ephemeral)
    pub listen_port: Option<u16>,
    /// Peers, in request order
    pub peers: Vec<UapiPeer>,
}

/// Parsed peer block
#[derive(Debug, Clone)]
pub struct UapiPeer {
    /// Peer public key
    pub public_key: PublicKey,
    /// Preshared key (zero = none)
    pub preshared_key: PresharedKey,
    /// Persistent keepalive interval (None = disabled)
    pub keepalive: Option<u16>,
    /// Remote endpoint
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges, in request order
    pub allowed_ips: Vec<AllowedIp>,
}

impl UapiPeer {
    fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: PresharedKey::zero(),
            keepalive: None,
            endpoint: None,
            allowed_ips: Vec::new(),
        }
    }
}

fn line_error(line_no: usize, msg: impl std::fmt::Display) -> WgProxyError {
    WgProxyError::WireGuard(format!("line {}: {}", line_no, msg))
}

/// Parse a control-protocol request
pub fn parse(request: &str) -> Result<UapiConfig> {
    let mut private_key = None;
    let mut listen_port = None;
    let mut peers: Vec<UapiPeer> = Vec::new();

    for (index, line) in request.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| line_error(line_no, format!("expected key=value, got '{}'", line)))?;

        match key {
            "private_key" | "listen_port" if !peers.is_empty() => {
                return Err(line_error(
                    line_no,
                    format!("interface key '{}' after peer configuration", key),
                ));
            }
            "private_key" => {
                private_key = Some(PrivateKey::from_hex(value).map_err(|e| line_error(line_no, e))?);
            }
            "listen_port" => {
                let port: u16 = value
                    .parse()
                    .map_err(|e| line_error(line_no, format!("invalid listen_port: {}", e)))?;
                listen_port = Some(port);
            }
            "public_key" => {
                let public_key = PublicKey::from_hex(value).map_err(|e| line_error(line_no, e))?;
                peers.push(UapiPeer::new(public_key));
            }
            _ => {
                let peer = peers.last_mut().ok_or_else(|| {
                    line_error(line_no, format!("'{}' before any public_key", key))
                })?;
                apply_peer_key(peer, key, value).map_err(|e| line_error(line_no, e))?;
            }
        }
    }

    let private_key = private_key
        .ok_or_else(|| WgProxyError::WireGuard("missing private_key".to_string()))?;

    Ok(UapiConfig {
        private_key,
        listen_port,
        peers,
    })
}

fn apply_peer_key(peer: &mut UapiPeer, key: &str, value: &str) -> std::result::Result<(), String> {
    match key {
        "preshared_key" => {
            peer.preshared_key = PresharedKey::from_hex(value).map_err(|e| e.to_string())?;
        }
        "persistent_keepalive_interval" => {
            let secs: u16 = value
                .parse()
                .map_err(|e| format!("invalid persistent_keepalive_interval: {}", e))?;
            peer.keepalive = (secs > 0).then_some(secs);
        }
        "endpoint" => {
            let addr: SocketAddr = value
                .parse()
                .map_err(|e| format!("invalid endpoint '{}': {}", value, e))?;
            peer.endpoint = Some(addr);
        }
        "allowed_ip" => {
            let ip: AllowedIp = value.parse().map_err(|e: WgProxyError| e.to_string())?;
            peer.allowed_ips.push(ip);
        }
        other => return Err(format!("unknown key '{}'", other)),
    }
    Ok(())
}
