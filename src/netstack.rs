//! Virtual network stacks
//!
//! A virtual stack replaces a kernel TUN interface: the WireGuard device
//! holds the [`VirtualInterface`] end and exchanges whole IP packets with
//! the [`NetStack`] end, where a user-space IP stack takes over. Nothing
//! here touches the host's network configuration.

use crate::error::{Result, WgProxyError};
use std::net::IpAddr;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Packets buffered in each direction before senders wait
const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Creates a virtual interface and the stack that services it
pub trait StackFactory {
    /// Device-facing end
    type Interface;
    /// Application-facing end
    type Stack;

    /// Create a stack bound to `local_addresses`, resolving through `dns`
    fn create(
        &self,
        local_addresses: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> Result<(Self::Interface, Self::Stack)>;
}

/// Builds channel-backed virtual stacks
#[derive(Debug, Clone)]
pub struct ChannelStackFactory {
    queue_depth: usize,
}

impl ChannelStackFactory {
    /// Factory with a custom per-direction queue depth
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
        }
    }
}

impl Default for ChannelStackFactory {
    fn default() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }
}

impl StackFactory for ChannelStackFactory {
    type Interface = VirtualInterface;
    type Stack = NetStack;

    fn create(
        &self,
        local_addresses: &[IpAddr],
        dns: &[IpAddr],
        mtu: u16,
    ) -> Result<(VirtualInterface, NetStack)> {
        let first = local_addresses.first().ok_or_else(|| {
            WgProxyError::Config("Virtual stack needs at least one local address".to_string())
        })?;

        if mtu == 0 {
            return Err(WgProxyError::Config("MTU must be greater than 0".to_string()));
        }

        // device -> stack, stack -> device
        let (to_stack, from_device) = mpsc::channel(self.queue_depth);
        let (to_device, from_stack) = mpsc::channel(self.queue_depth);

        let name = format!("netstack-{}", first);
        debug!("Created virtual stack {} (mtu {}, {} dns)", name, mtu, dns.len());

        let interface = VirtualInterface {
            name,
            mtu,
            to_stack,
            from_stack,
        };

        let stack = NetStack {
            addresses: local_addresses.to_vec(),
            dns: dns.to_vec(),
            mtu,
            to_device,
            from_device: Mutex::new(from_device),
        };

        Ok((interface, stack))
    }
}

/// Device-facing end of a virtual stack
#[derive(Debug)]
pub struct VirtualInterface {
    name: String,
    mtu: u16,
    to_stack: mpsc::Sender<Vec<u8>>,
    from_stack: mpsc::Receiver<Vec<u8>>,
}

impl VirtualInterface {
    /// Interface name, for logging
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interface MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Split into the sender for decrypted packets and the receiver of
    /// packets the stack wants encrypted
    pub fn into_parts(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.to_stack, self.from_stack)
    }
}

/// Application-facing end of a virtual stack
#[derive(Debug)]
pub struct NetStack {
    addresses: Vec<IpAddr>,
    dns: Vec<IpAddr>,
    mtu: u16,
    to_device: mpsc::Sender<Vec<u8>>,
    from_device: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl NetStack {
    /// Local addresses of the interface
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// DNS servers (empty = system resolver)
    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns
    }

    /// Interface MTU
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Hand an IP packet to the device for encryption
    pub async fn send(&self, packet: Vec<u8>) -> Result<()> {
        if packet.len() > usize::from(self.mtu) {
            return Err(WgProxyError::PacketProcessing(format!(
                "Packet of {} bytes exceeds MTU {}",
                packet.len(),
                self.mtu
            )));
        }

        match packet.first().map(|b| b >> 4) {
            Some(4) | Some(6) => {}
            _ => {
                return Err(WgProxyError::PacketProcessing(
                    "Not an IPv4 or IPv6 packet".to_string(),
                ))
            }
        }

        self.to_device
            .send(packet)
            .await
            .map_err(|_| WgProxyError::PacketProcessing("Device is closed".to_string()))
    }

    /// Receive the next decrypted IP packet; None once the device is gone
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.from_device.lock().await.recv().await
    }

    /// Whether the device end has been dropped
    pub fn is_closed(&self) -> bool {
        self.to_device.is_closed()
    }
}
