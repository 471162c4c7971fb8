//! Control-protocol request builder
//!
//! Serializes a [`DeviceConfig`] into the line-oriented `key=value` text a
//! WireGuard device accepts on its configuration socket. Line order is part
//! of the protocol: peer-scoped keys attach to the most recent `public_key`.

use crate::config::{DeviceConfig, LocalAddress};
use crate::error::Result;
use std::fmt::Write;
use std::net::IpAddr;

/// Allowed IPs emitted for a peer with none configured
const DEFAULT_ALLOWED_IPS: [&str; 2] = ["0.0.0.0/0", "::0/0"];

/// Everything a device needs to be brought up, derived once from a config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSetting {
    ipc_request: String,
    dns: Vec<IpAddr>,
    addresses: Vec<LocalAddress>,
    mtu: u16,
}

impl DeviceSetting {
    /// Control-protocol text for the device
    pub fn ipc_request(&self) -> &str {
        &self.ipc_request
    }

    /// DNS servers for the virtual stacks
    pub fn dns(&self) -> &[IpAddr] {
        &self.dns
    }

    /// Peer slot to local address bindings
    pub fn addresses(&self) -> &[LocalAddress] {
        &self.addresses
    }

    /// MTU for the virtual interfaces
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Whether the system resolver is used (no DNS servers configured)
    pub fn system_dns(&self) -> bool {
        self.dns.is_empty()
    }
}

/// Serialize the config into a control-protocol request and device settings
///
/// No semantic checks happen here; bad keys or prefixes are left for the
/// device to reject.
pub fn create_ipc_request(conf: &DeviceConfig) -> Result<DeviceSetting> {
    let mut request = String::new();

    writeln!(request, "private_key={}", conf.secret_key)?;

    if let Some(port) = conf.listen_port {
        writeln!(request, "listen_port={}", port)?;
    }

    for peer in &conf.peers {
        writeln!(request, "public_key={}", peer.public_key)?;
        writeln!(request, "persistent_keepalive_interval={}", peer.keepalive)?;
        writeln!(request, "preshared_key={}", peer.preshared_key)?;

        if let Some(endpoint) = &peer.endpoint {
            writeln!(request, "endpoint={}", endpoint)?;
        }

        if peer.allowed_ips.is_empty() {
            for ip in DEFAULT_ALLOWED_IPS {
                writeln!(request, "allowed_ip={}", ip)?;
            }
        } else {
            for ip in &peer.allowed_ips {
                writeln!(request, "allowed_ip={}", ip)?;
            }
        }
    }

    Ok(DeviceSetting {
        ipc_request: request,
        dns: conf.dns.clone(),
        addresses: conf.addresses.clone(),
        mtu: conf.mtu,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    fn peer(key: &str, keepalive: u16, allowed: &[&str]) -> PeerConfig {
        let mut peer = PeerConfig::new(key);
        peer.keepalive = keepalive;
        peer.allowed_ips = allowed.iter().map(|s| s.parse().unwrap()).collect();
        peer
    }

    #[test]
    fn test_single_peer_request() {
        let mut conf = DeviceConfig::new("kA...=");
        conf.add_peer(peer("kB...=", 25, &["10.0.0.2/32"]));

        let setting = create_ipc_request(&conf).unwrap();
        assert_eq!(
            setting.ipc_request(),
            "private_key=kA...=\n\
             public_key=kB...=\n\
             persistent_keepalive_interval=25\n\
             preshared_key=\n\
             allowed_ip=10.0.0.2/32\n"
        );
        assert!(setting.system_dns());
    }

    #[test]
    fn test_listen_port_follows_private_key() {
        let mut conf = DeviceConfig::new("priv");
        conf.listen_port = Some(51820);

        let setting = create_ipc_request(&conf).unwrap();
        assert_eq!(setting.ipc_request(), "private_key=priv\nlisten_port=51820\n");
    }

    #[test]
    fn test_default_allowed_ips() {
        let mut conf = DeviceConfig::new("priv");
        conf.add_peer(peer("pub", 0, &[]));

        let setting = create_ipc_request(&conf).unwrap();
        assert!(setting
            .ipc_request()
            .ends_with("allowed_ip=0.0.0.0/0\nallowed_ip=::0/0\n"));
    }

    #[test]
    fn test_endpoint_and_preshared_key() {
        let mut conf = DeviceConfig::new("priv");
        let mut p = peer("pub", 0, &["10.0.0.0/24", "fd00::/64"]);
        p.preshared_key = "0".repeat(64);
        p.endpoint = Some("vpn.example.com:51820".to_string());
        conf.add_peer(p);

        let setting = create_ipc_request(&conf).unwrap();
        let expected = format!(
            "private_key=priv\n\
             public_key=pub\n\
             persistent_keepalive_interval=0\n\
             preshared_key={}\n\
             endpoint=vpn.example.com:51820\n\
             allowed_ip=10.0.0.0/24\n\
             allowed_ip=fd00::/64\n",
            "0".repeat(64)
        );
        assert_eq!(setting.ipc_request(), expected);
    }

    #[test]
    fn test_peer_blocks_are_contiguous() {
        let mut conf = DeviceConfig::new("priv");
        conf.add_peer(peer("first", 10, &["10.0.0.1/32"]));
        conf.add_peer(peer("second", 20, &[]));

        let setting = create_ipc_request(&conf).unwrap();
        let lines: Vec<&str> = setting.ipc_request().lines().collect();
        assert_eq!(
            lines,
            vec![
                "private_key=priv",
                "public_key=first",
                "persistent_keepalive_interval=10",
                "preshared_key=",
                "allowed_ip=10.0.0.1/32",
                "public_key=second",
                "persistent_keepalive_interval=20",
                "preshared_key=",
                "allowed_ip=0.0.0.0/0",
                "allowed_ip=::0/0",
            ]
        );
        assert!(!setting.ipc_request().contains("\n\n"));
    }

    #[test]
    fn test_settings_carry_config() {
        let mut conf = DeviceConfig::new("priv");
        conf.dns = vec!["1.1.1.1".parse().unwrap()];
        conf.mtu = 1380;
        conf.add_peer(peer("pub", 0, &["10.0.0.2/32"]));
        conf.bind_address(0, "10.200.0.2".parse().unwrap());

        let setting = create_ipc_request(&conf).unwrap();
        assert_eq!(setting.dns(), conf.dns.as_slice());
        assert_eq!(setting.addresses(), conf.addresses.as_slice());
        assert_eq!(setting.mtu(), 1380);
        assert!(!setting.system_dns());
    }
}
