//! Tunnel orchestration
//!
//! Builds one virtual tunnel per configured local address: a virtual
//! stack scoped to that address, a WireGuard device bound to the stack,
//! the compiled control-protocol text applied to the device, and the
//! device brought up.
//!
//! Construction runs in two passes. [`plan_tunnels`] resolves every
//! binding without allocating anything, so a bad binding fails before any
//! stack or device exists. The construction pass then builds each tunnel
//! in binding order and stops at the first failure.

use crate::config::{DeviceConfig, PeerConfig};
use crate::error::{Result, WgProxyError};
use crate::netstack::{ChannelStackFactory, NetStack, StackFactory};
use crate::wireguard::{
    create_ipc_request, DeviceFactory, DeviceSetting, LogLevel, TunnelDevice, UdpBind, WgDevice,
    WgDeviceFactory,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// A resolved binding: which peer slot, which local address, and the
/// address the resulting tunnel is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelPlan {
    /// Peer slot index
    pub slot: usize,
    /// Local address of the virtual stack
    pub local_address: IpAddr,
    /// The peer's first allowed IP
    pub primary_address: IpAddr,
}

impl TunnelPlan {
    /// Key of the tunnel in the orchestration result
    pub fn key(&self) -> String {
        self.primary_address.to_string()
    }
}

/// Resolve every local address binding to a tunnel plan, in binding order
///
/// Fails if a binding names a peer slot that does not exist, a bound peer
/// has no allowed IPs, or two bindings resolve to the same primary address.
pub fn plan_tunnels(conf: &DeviceConfig) -> Result<Vec<TunnelPlan>> {
    let mut plans = Vec::with_capacity(conf.addresses.len());
    let mut seen = HashSet::new();

    for binding in &conf.addresses {
        let peer = conf.peer(binding.peer).ok_or_else(|| {
            WgProxyError::Config(format!(
                "Local address {} is bound to peer slot {}, but only {} peer(s) are configured",
                binding.address,
                binding.peer,
                conf.peers.len()
            ))
        })?;

        let primary_address = peer.primary_address().ok_or_else(|| {
            WgProxyError::Config(format!(
                "Peer slot {} (local address {}) has no allowed IPs to key its tunnel by",
                binding.peer, binding.address
            ))
        })?;

        if !seen.insert(primary_address) {
            return Err(WgProxyError::Config(format!(
                "Peer slot {} (local address {}) reuses primary address {}",
                binding.peer, binding.address, primary_address
            )));
        }

        plans.push(TunnelPlan {
            slot: binding.peer,
            local_address: binding.address,
            primary_address,
        });
    }

    Ok(plans)
}

/// Probe sequence numbers per destination address
#[derive(Debug, Default)]
pub struct PingRecord {
    sequences: Mutex<HashMap<String, u64>>,
}

impl PingRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.sequences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the next sequence number for `destination`, starting at 0
    pub fn next_sequence(&self, destination: &str) -> u64 {
        let mut sequences = self.lock();
        let counter = sequences.entry(destination.to_string()).or_insert(0);
        let sequence = *counter;
        *counter += 1;
        sequence
    }

    /// Sequence number the next probe to `destination` will get, if any were sent
    pub fn peek(&self, destination: &str) -> Option<u64> {
        self.lock().get(destination).copied()
    }

    /// Forget `destination`, returning its pending sequence number
    pub fn remove(&self, destination: &str) -> Option<u64> {
        self.lock().remove(destination)
    }

    /// Number of destinations tracked
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no destination is tracked
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Owns a stack and the device bound to it
///
/// The device is closed before the stack is released.
struct TunnelHandles<S, D: TunnelDevice> {
    stack: S,
    device: D,
}

impl<S, D: TunnelDevice> Drop for TunnelHandles<S, D> {
    fn drop(&mut self) {
        self.device.close();
    }
}

/// A running tunnel: one virtual stack served by one WireGuard device
pub struct VirtualTun<S = NetStack, D: TunnelDevice = WgDevice> {
    handles: TunnelHandles<S, D>,
    conf: Arc<DeviceConfig>,
    slot: usize,
    local_address: IpAddr,
    system_dns: bool,
    ping_record: PingRecord,
}

impl<S, D: TunnelDevice> VirtualTun<S, D> {
    /// The virtual network stack
    pub fn tnet(&self) -> &S {
        &self.handles.stack
    }

    /// The WireGuard device
    pub fn device(&self) -> &D {
        &self.handles.device
    }

    /// The configuration the tunnel was built from
    pub fn conf(&self) -> &DeviceConfig {
        &self.conf
    }

    /// The peer this tunnel was built for
    pub fn peer(&self) -> Option<&PeerConfig> {
        self.conf.peer(self.slot)
    }

    /// Peer slot index
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Local address of the virtual stack
    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// Whether name resolution falls back to the system resolver
    pub fn system_dns(&self) -> bool {
        self.system_dns
    }

    /// Probe sequence bookkeeping
    pub fn ping_record(&self) -> &PingRecord {
        &self.ping_record
    }

    /// Close the device and release the stack
    pub fn close(self) {
        debug!("Closing tunnel for peer slot {} ({})", self.slot, self.local_address);
    }
}

impl<S, D: TunnelDevice> fmt::Debug for VirtualTun<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTun")
            .field("slot", &self.slot)
            .field("local_address", &self.local_address)
            .field("system_dns", &self.system_dns)
            .field("ping_destinations", &self.ping_record.len())
            .finish()
    }
}

/// Builds virtual tunnels from a configuration
#[derive(Debug, Clone)]
pub struct Orchestrator<S, D> {
    stacks: S,
    devices: D,
}

impl Orchestrator<ChannelStackFactory, WgDeviceFactory> {
    /// Orchestrator using channel-backed stacks and boringtun devices
    pub fn new() -> Self {
        Self::with_factories(ChannelStackFactory::default(), WgDeviceFactory)
    }
}

impl Default for Orchestrator<ChannelStackFactory, WgDeviceFactory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, D> Orchestrator<S, D>
where
    S: StackFactory,
    D: DeviceFactory<Interface = S::Interface>,
{
    /// Orchestrator using the given factories
    pub fn with_factories(stacks: S, devices: D) -> Self {
        Self { stacks, devices }
    }

    /// Build and start one tunnel per local address binding, keyed by
    /// each bound peer's first allowed IP
    ///
    /// The first failure aborts the call. Tunnels already built are
    /// dropped, which closes them; nothing is retried.
    pub fn start_wireguard(
        &self,
        conf: Arc<DeviceConfig>,
        log_level: LogLevel,
    ) -> Result<HashMap<String, VirtualTun<S::Stack, D::Device>>> {
        let plans = plan_tunnels(&conf)?;
        let setting = create_ipc_request(&conf)?;

        info!(
            "Starting {} tunnel(s) for {} configured peer(s)",
            plans.len(),
            conf.peers.len()
        );

        let mut tunnels = HashMap::with_capacity(plans.len());
        for plan in &plans {
            let tunnel = self.build(plan, &setting, Arc::clone(&conf), log_level)?;
            info!(
                "Tunnel {} up on {} (peer slot {})",
                plan.primary_address, plan.local_address, plan.slot
            );
            tunnels.insert(plan.key(), tunnel);
        }

        Ok(tunnels)
    }

    fn build(
        &self,
        plan: &TunnelPlan,
        setting: &DeviceSetting,
        conf: Arc<DeviceConfig>,
        log_level: LogLevel,
    ) -> Result<VirtualTun<S::Stack, D::Device>> {
        let (interface, stack) = self
            .stacks
            .create(&[plan.local_address], setting.dns(), setting.mtu())
            .map_err(|e| WgProxyError::StackCreation {
                slot: plan.slot,
                address: plan.local_address,
                reason: e.to_string(),
            })?;

        let device = self.devices.create(interface, UdpBind::default(), log_level);

        // From here on the pair is owned together and closed together on failure
        let mut handles = TunnelHandles { stack, device };

        debug!("Configuring device for peer slot {}", plan.slot);
        handles
            .device
            .ipc_set(setting.ipc_request())
            .map_err(|e| WgProxyError::DeviceConfiguration {
                slot: plan.slot,
                address: plan.local_address,
                reason: e.to_string(),
            })?;

        handles
            .device
            .up()
            .map_err(|e| WgProxyError::DeviceActivation {
                slot: plan.slot,
                address: plan.local_address,
                reason: e.to_string(),
            })?;

        Ok(VirtualTun {
            handles,
            conf,
            slot: plan.slot,
            local_address: plan.local_address,
            system_dns: setting.system_dns(),
            ping_record: PingRecord::new(),
        })
    }
}

/// Build and start tunnels with channel-backed stacks and boringtun devices
///
/// Must be called from within a tokio runtime; each device spawns its
/// packet processing tasks onto it.
pub fn start_wireguard(
    conf: Arc<DeviceConfig>,
    log_level: LogLevel,
) -> Result<HashMap<String, VirtualTun>> {
    Orchestrator::new().start_wireguard(conf, log_level)
}
