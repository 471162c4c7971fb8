//! CIDR prefixes for peer allowed IPs

use crate::error::WgProxyError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An allowed IP range: address plus prefix length
///
/// The address is kept as written (host bits are not masked), so
/// `10.0.0.2/32` and `10.0.0.2/24` both report `10.0.0.2` from [`addr`].
///
/// [`addr`]: AllowedIp::addr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AllowedIp(IpNet);

impl AllowedIp {
    /// Create a prefix, rejecting lengths beyond the address family's width
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, WgProxyError> {
        IpNet::new(addr, prefix).map(Self).map_err(|_| {
            WgProxyError::Config(format!(
                "Prefix length {} is too long for IP address {}",
                prefix, addr
            ))
        })
    }

    /// Address portion
    pub fn addr(&self) -> IpAddr {
        self.0.addr()
    }

    /// Prefix length in bits
    pub fn prefix(&self) -> u8 {
        self.0.prefix_len()
    }

    /// Whether `ip` falls inside this range
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }
}

impl FromStr for AllowedIp {
    type Err = WgProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<IpNet>().map(Self).map_err(|e| {
            WgProxyError::Config(format!(
                "Invalid allowed IP '{}': {} (expected CIDR notation like 10.0.0.0/24)",
                s, e
            ))
        })
    }
}

impl TryFrom<String> for AllowedIp {
    type Error = WgProxyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AllowedIp> for String {
    fn from(ip: AllowedIp) -> Self {
        ip.to_string()
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
