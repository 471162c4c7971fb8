//! Integration tests for tunnel orchestration with real devices
//!
//! These tests verify end-to-end tunnel functionality including:
//! - Starting tunnels with channel-backed stacks and boringtun devices
//! - Failure when no runtime is available to run the devices
//! - A packet crossing between two tunnels over loopback UDP
//!
//! No privileges are needed: devices only open UDP sockets.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use wgproxy::config::{AllowedIp, DeviceConfig, PeerConfig};
use wgproxy::wireguard::{LogLevel, PrivateKey};
use wgproxy::{start_wireguard, WgProxyError};

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn allowed(s: &str) -> AllowedIp {
    s.parse().unwrap()
}

/// Ask the OS for a UDP port that is free right now
fn free_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind probe socket");
    socket.local_addr().unwrap().port()
}

/// Minimal IPv4/UDP packet from `src` to `dst` with an empty payload
fn udp_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&28u16.to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet[20..22].copy_from_slice(&40000u16.to_be_bytes());
    packet[22..24].copy_from_slice(&9u16.to_be_bytes());
    packet[24..26].copy_from_slice(&8u16.to_be_bytes());
    packet
}

fn single_peer_config(local: &PrivateKey, remote: &PrivateKey) -> DeviceConfig {
    let mut conf = DeviceConfig::new(local.to_hex());
    let mut peer = PeerConfig::new(remote.public_key().to_hex());
    peer.allowed_ips = vec![allowed("10.0.0.2/32")];
    conf.add_peer(peer);
    conf.bind_address(0, addr("10.200.0.2"));
    conf
}

#[tokio::test]
async fn test_start_with_real_devices() {
    let local = PrivateKey::generate();
    let remote = PrivateKey::generate();
    let mut conf = single_peer_config(&local, &remote);
    conf.dns = vec![addr("1.1.1.1")];
    conf.mtu = 1380;

    let tunnels = start_wireguard(Arc::new(conf), LogLevel::Silent).unwrap();
    assert_eq!(tunnels.len(), 1);

    let tunnel = &tunnels["10.0.0.2"];
    assert!(!tunnel.system_dns());
    assert_eq!(tunnel.tnet().addresses(), &[addr("10.200.0.2")]);
    assert_eq!(tunnel.tnet().dns_servers(), &[addr("1.1.1.1")]);
    assert_eq!(tunnel.tnet().mtu(), 1380);
    assert!(tunnel.device().is_up());
    assert_eq!(tunnel.device().peer_count(), 1);
    assert!(tunnel.device().local_port().is_some());
    assert_eq!(tunnel.device().name(), "netstack-10.200.0.2");
}

#[tokio::test]
async fn test_invalid_key_reported_as_device_configuration() {
    let mut conf = DeviceConfig::new("kA...=");
    let mut peer = PeerConfig::new("kB...=");
    peer.allowed_ips = vec![allowed("10.0.0.2/32")];
    conf.add_peer(peer);
    conf.bind_address(0, addr("10.200.0.2"));

    let result = start_wireguard(Arc::new(conf), LogLevel::Silent);
    assert!(matches!(
        result,
        Err(WgProxyError::DeviceConfiguration { slot: 0, .. })
    ));
}

#[tokio::test]
async fn test_listen_port_in_use_reported_as_activation() {
    let occupied = UdpSocket::bind("0.0.0.0:0").expect("Failed to bind");
    let port = occupied.local_addr().unwrap().port();

    let mut conf = single_peer_config(&PrivateKey::generate(), &PrivateKey::generate());
    conf.listen_port = Some(port);

    let result = start_wireguard(Arc::new(conf), LogLevel::Silent);
    assert!(matches!(
        result,
        Err(WgProxyError::DeviceActivation { slot: 0, .. })
    ));
}

#[test]
fn test_start_outside_runtime_fails_activation() {
    let conf = single_peer_config(&PrivateKey::generate(), &PrivateKey::generate());

    match start_wireguard(Arc::new(conf), LogLevel::Silent) {
        Err(WgProxyError::DeviceActivation { slot, address, .. }) => {
            assert_eq!(slot, 0);
            assert_eq!(address, addr("10.200.0.2"));
        }
        other => panic!("expected activation error, got {:?}", other.map(|t| t.len())),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_packet_crosses_between_tunnels() {
    let alice_key = PrivateKey::generate();
    let bob_key = PrivateKey::generate();
    let bob_port = free_port();

    // Alice knows where Bob listens; Bob learns Alice's endpoint from the handshake
    let mut alice = DeviceConfig::new(alice_key.to_hex());
    let mut to_bob = PeerConfig::new(bob_key.public_key().to_hex());
    to_bob.endpoint = Some(format!("127.0.0.1:{}", bob_port));
    to_bob.allowed_ips = vec![allowed("10.0.0.2/32")];
    alice.add_peer(to_bob);
    alice.bind_address(0, addr("10.0.0.1"));

    let mut bob = DeviceConfig::new(bob_key.to_hex());
    bob.listen_port = Some(bob_port);
    let mut to_alice = PeerConfig::new(alice_key.public_key().to_hex());
    to_alice.allowed_ips = vec![allowed("10.0.0.1/32")];
    bob.add_peer(to_alice);
    bob.bind_address(0, addr("10.0.0.2"));

    let bob_tunnels = start_wireguard(Arc::new(bob), LogLevel::Verbose).unwrap();
    let alice_tunnels = start_wireguard(Arc::new(alice), LogLevel::Verbose).unwrap();

    let alice_stack = alice_tunnels["10.0.0.2"].tnet();
    let bob_stack = bob_tunnels["10.0.0.1"].tnet();
    let packet = udp_packet([10, 0, 0, 1], [10, 0, 0, 2]);

    // The first packet may be held until the handshake completes
    let mut received = None;
    for _ in 0..10 {
        alice_stack.send(packet.clone()).await.unwrap();
        if let Ok(Some(p)) = tokio::time::timeout(Duration::from_millis(500), bob_stack.recv()).await {
            received = Some(p);
            break;
        }
    }

    assert_eq!(received.expect("packet never arrived"), packet);

    let sent = alice_tunnels["10.0.0.2"].device().stats().await;
    assert!(sent.tx_packets > 0);
    // Every WireGuard message is at least 32 bytes on the wire
    assert!(sent.tx_bytes >= sent.tx_packets * 32);

    let received = bob_tunnels["10.0.0.1"].device().stats().await;
    assert!(received.rx_packets >= 1);
    assert_eq!(received.rx_bytes, received.rx_packets * packet.len() as u64);
    assert_eq!(received.errors, 0);
}
