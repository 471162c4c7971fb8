//! WireGuard protocol and device management
//!
//! This module turns configuration into control-protocol text, parses that
//! text on the device side, and runs boringtun-backed devices on top of
//! virtual interfaces.

mod device;
mod ipc;
mod keys;
pub mod uapi;

pub use device::{DeviceFactory, DeviceStats, LogLevel, TunnelDevice, UdpBind, WgDevice, WgDeviceFactory};
pub use ipc::{create_ipc_request, DeviceSetting};
pub use keys::{PresharedKey, PrivateKey, PublicKey, KEY_LEN};
