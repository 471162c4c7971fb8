//! WireGuard key management
//!
//! Keys arrive in base64 (config files, `wg genkey`) and travel to the
//! device in hex (control protocol). This module converts between the two
//! and derives public keys using x25519.

use crate::error::{Result, WgProxyError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Key length in bytes
pub const KEY_LEN: usize = 32;

fn decode_base64(s: &str, what: &str) -> Result<[u8; KEY_LEN]> {
    let decoded = Zeroizing::new(
        BASE64
            .decode(s.trim())
            .map_err(|e| WgProxyError::Config(format!("Invalid base64 {}: {}", what, e)))?,
    );

    if decoded.len() != KEY_LEN {
        return Err(WgProxyError::Config(format!(
            "Invalid {} length: expected {} bytes, got {}",
            what,
            KEY_LEN,
            decoded.len()
        )));
    }

    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&decoded);
    Ok(bytes)
}

/// WireGuard private key (32 bytes, x25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; KEY_LEN]>,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self::from_bytes(secret.to_bytes())
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Parse a private key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_base64(s, "private key").map(Self::from_bytes)
    }

    /// Parse a private key from hex-encoded string
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut secret = Zeroizing::new([0u8; KEY_LEN]);
        hex::decode_to_slice(s.trim(), &mut secret[..])
            .map_err(|e| WgProxyError::WireGuard(format!("Invalid private key: {}", e)))?;
        Ok(Self { secret })
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Convert to hex-encoded string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.secret[..])
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        PublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes())
    }

    /// Convert into the x25519 secret boringtun expects
    pub fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(*self.secret)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.secret
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// WireGuard public key (32 bytes, x25519)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: [u8; KEY_LEN],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_base64(s, "public key").map(Self::from_bytes)
    }

    /// Parse a public key from hex-encoded string
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        hex::decode_to_slice(s.trim(), &mut key)
            .map_err(|e| WgProxyError::WireGuard(format!("Invalid public key: {}", e)))?;
        Ok(Self::from_bytes(key))
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Convert to hex-encoded string
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Convert into the x25519 key boringtun expects
    pub fn to_x25519(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.key)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Symmetric preshared key; all zeroes means "no preshared key"
#[derive(Clone)]
pub struct PresharedKey {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl PresharedKey {
    /// The all-zero key
    pub fn zero() -> Self {
        Self::from_bytes([0u8; KEY_LEN])
    }

    /// Create a preshared key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Parse a preshared key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        decode_base64(s, "preshared key").map(Self::from_bytes)
    }

    /// Parse a preshared key from hex; an empty string is the zero key
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::zero());
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        hex::decode_to_slice(s.trim(), &mut key[..])
            .map_err(|e| WgProxyError::WireGuard(format!("Invalid preshared key: {}", e)))?;
        Ok(Self { key })
    }

    /// Convert to hex-encoded string
    pub fn to_hex(&self) -> String {
        hex::encode(&self.key[..])
    }

    /// Whether this is the all-zero key
    pub fn is_zero(&self) -> bool {
        self.key.iter().all(|&b| b == 0)
    }

    /// Raw bytes, or None for the zero key
    pub fn to_option(&self) -> Option<[u8; KEY_LEN]> {
        if self.is_zero() {
            None
        } else {
            Some(*self.key)
        }
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("PresharedKey(none)")
        } else {
            f.write_str("PresharedKey([REDACTED])")
        }
    }
}
