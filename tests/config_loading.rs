//! Integration tests for loading configuration files

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use tempfile::NamedTempFile;
use wgproxy::config::{DeviceConfig, LocalAddress};
use wgproxy::tunnel::plan_tunnels;
use wgproxy::wireguard::create_ipc_request;
use wgproxy::WgProxyError;

const PRIVATE: &str = "6EtabScXwQA6E7QxVwNT26ypFGzxUMX4V1aA/rpSAno=";
const PRIVATE_HEX: &str = "e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a";
const PUBLIC: &str = "wgOS1LbZ8PhIqxBujZS1vE5CzVBiKBbpnbL2J3dBfzI=";
const PUBLIC_HEX: &str = "c20392d4b6d9f0f848ab106e8d94b5bc4e42cd50622816e99db2f62777417f32";

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(contents.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_load_toml_and_compile() {
    let file = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"
            listen_port = 51820

            [[peer]]
            public_key = "{PUBLIC}"
            endpoint = "203.0.113.1:51820"
            allowed_ips = ["10.0.0.2/32", "10.0.1.0/24"]
            persistent_keepalive = 25
            local_address = "10.200.0.2"
        "#
        ),
    );

    let conf = DeviceConfig::from_file(file.path()).unwrap();
    assert_eq!(conf.secret_key, PRIVATE_HEX);
    assert_eq!(
        conf.addresses,
        vec![LocalAddress {
            peer: 0,
            address: "10.200.0.2".parse().unwrap(),
        }]
    );

    let setting = create_ipc_request(&conf).unwrap();
    let zeroes = "0".repeat(64);
    assert_eq!(
        setting.ipc_request(),
        format!(
            "private_key={PRIVATE_HEX}\n\
             listen_port=51820\n\
             public_key={PUBLIC_HEX}\n\
             persistent_keepalive_interval=25\n\
             preshared_key={zeroes}\n\
             endpoint=203.0.113.1:51820\n\
             allowed_ip=10.0.0.2/32\n\
             allowed_ip=10.0.1.0/24\n"
        )
    );
    assert!(setting.system_dns());
    assert_eq!(setting.mtu(), 1420);

    let plans = plan_tunnels(&conf).unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].key(), "10.0.0.2");
}

#[test]
fn test_load_json() {
    let file = write_config(
        ".json",
        &format!(
            r#"{{
                "interface": {{ "private_key": "{PRIVATE}", "dns": ["1.1.1.1"], "mtu": 1380 }},
                "peer": [
                    {{ "public_key": "{PUBLIC}", "allowed_ips": ["fd00::2/128"], "local_address": "fd00:200::2" }}
                ]
            }}"#
        ),
    );

    let conf = DeviceConfig::from_file(file.path()).unwrap();
    let setting = create_ipc_request(&conf).unwrap();
    assert!(!setting.system_dns());
    assert_eq!(setting.dns(), &["1.1.1.1".parse::<IpAddr>().unwrap()]);
    assert_eq!(setting.mtu(), 1380);
    assert!(setting.ipc_request().contains("allowed_ip=fd00::2/128\n"));
    assert!(!setting.ipc_request().contains("listen_port="));
}

#[test]
fn test_peer_without_allowed_ips_gets_default_routes() {
    let file = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"

            [[peer]]
            public_key = "{PUBLIC}"
        "#
        ),
    );

    let conf = DeviceConfig::from_file(file.path()).unwrap();
    let setting = create_ipc_request(&conf).unwrap();
    assert!(setting
        .ipc_request()
        .ends_with("allowed_ip=0.0.0.0/0\nallowed_ip=::0/0\n"));

    // Unbound, so it is never asked for a primary address
    assert!(plan_tunnels(&conf).unwrap().is_empty());
}

#[test]
fn test_bound_peer_without_allowed_ips_fails_planning() {
    let file = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"

            [[peer]]
            public_key = "{PUBLIC}"
            local_address = "10.200.0.2"
        "#
        ),
    );

    let conf = DeviceConfig::from_file(file.path()).unwrap();
    assert!(matches!(plan_tunnels(&conf), Err(WgProxyError::Config(_))));
}

#[test]
fn test_invalid_files_rejected() {
    let bad_key = write_config(
        ".toml",
        r#"
        [interface]
        private_key = "not-base64"
    "#,
    );
    assert!(matches!(
        DeviceConfig::from_file(bad_key.path()),
        Err(WgProxyError::Config(_))
    ));

    let bad_cidr = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"

            [[peer]]
            public_key = "{PUBLIC}"
            allowed_ips = ["10.0.0.2"]
        "#
        ),
    );
    assert!(DeviceConfig::from_file(bad_cidr.path()).is_err());

    let bad_mtu = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"
            mtu = 0
        "#
        ),
    );
    assert!(DeviceConfig::from_file(bad_mtu.path()).is_err());
}

#[test]
fn test_hostname_endpoint_resolved_on_load() {
    let file = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"

            [[peer]]
            public_key = "{PUBLIC}"
            endpoint = "localhost:51820"
            allowed_ips = ["10.0.0.2/32"]
            local_address = "10.200.0.2"
        "#
        ),
    );

    let conf = DeviceConfig::from_file(file.path()).unwrap();
    let endpoint: SocketAddr = conf.peers[0]
        .endpoint
        .as_deref()
        .unwrap()
        .parse()
        .expect("endpoint should be ip:port after loading");
    assert!(endpoint.ip().is_loopback());
    assert_eq!(endpoint.port(), 51820);

    // The device parser accepts what the compiler emits
    let setting = create_ipc_request(&conf).unwrap();
    assert!(wgproxy::wireguard::uapi::parse(setting.ipc_request()).is_ok());
}

#[test]
fn test_unresolvable_endpoint_rejected_on_load() {
    let file = write_config(
        ".toml",
        &format!(
            r#"
            [interface]
            private_key = "{PRIVATE}"

            [[peer]]
            public_key = "{PUBLIC}"
            endpoint = "no-port"
        "#
        ),
    );

    let err = DeviceConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, WgProxyError::Config(_)));
    assert!(err.to_string().contains("Peer 0"));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = DeviceConfig::from_file(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(WgProxyError::Config(_))));
}
