//! WireGuard device implementation
//!
//! A device is bound to one virtual interface. It is configured with
//! control-protocol text, and once up it runs boringtun for the WireGuard
//! protocol, a UDP socket for network communication, and the interface
//! channels for packet I/O.
//!
//! Architecture: each peer gets its own boringtun `Tunn`, as `Tunn`
//! represents a single pairwise tunnel. Outbound packets are routed to a
//! peer by longest-prefix match over the peers' allowed IPs.

use crate::config::AllowedIp;
use crate::error::{Result, WgProxyError};
use crate::netstack::VirtualInterface;
use crate::wireguard::uapi::{self, UapiConfig, UapiPeer};
use crate::wireguard::{PrivateKey, PublicKey};
use boringtun::noise::{Tunn, TunnResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

/// Maximum packet size for WireGuard
const MAX_PACKET_SIZE: usize = 65535;

/// Timer tick interval for WireGuard operations
const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// A WireGuard device driven through the control protocol
pub trait TunnelDevice: Send {
    /// Apply control-protocol text
    fn ipc_set(&mut self, request: &str) -> Result<()>;

    /// Start packet processing
    fn up(&mut self) -> Result<()>;

    /// Stop packet processing and release the interface
    fn close(&mut self);
}

/// Creates devices bound to a virtual interface
pub trait DeviceFactory {
    /// Interface the device attaches to
    type Interface;
    /// Device produced
    type Device: TunnelDevice;

    /// Create a device; construction cannot fail, configuration can
    fn create(&self, interface: Self::Interface, bind: UdpBind, log_level: LogLevel) -> Self::Device;
}

/// Device log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Log nothing
    Silent,
    /// Log errors only
    #[default]
    Error,
    /// Log errors, lifecycle events and per-packet activity
    Verbose,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Silent => write!(f, "silent"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Verbose => write!(f, "verbose"),
        }
    }
}

/// Gates device events on the configured [`LogLevel`]
#[derive(Debug, Clone)]
struct DeviceLogger {
    level: LogLevel,
    name: Arc<str>,
}

impl DeviceLogger {
    fn verbose(&self, args: fmt::Arguments<'_>) {
        if self.level >= LogLevel::Verbose {
            debug!(device = %self.name, "{}", args);
        }
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        if self.level >= LogLevel::Verbose {
            info!(device = %self.name, "{}", args);
        }
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        if self.level >= LogLevel::Error {
            error!(device = %self.name, "{}", args);
        }
    }
}

/// Local address the device's UDP socket binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpBind {
    addr: IpAddr,
}

impl UdpBind {
    /// Bind to a specific local address
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }

    /// Address the socket binds to
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Open a non-blocking socket on `port` (0 = ephemeral)
    fn open(&self, port: u16) -> Result<UdpSocket> {
        let listen_addr = SocketAddr::new(self.addr, port);

        let socket = UdpSocket::bind(listen_addr).map_err(|e| {
            WgProxyError::Platform(format!("Failed to bind UDP socket to {}: {}", listen_addr, e))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            WgProxyError::Platform(format!("Failed to set UDP socket to non-blocking: {}", e))
        })?;

        Ok(socket)
    }
}

impl Default for UdpBind {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// WireGuard device statistics
#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    /// Total bytes transmitted
    pub tx_bytes: u64,
    /// Total bytes received
    pub rx_bytes: u64,
    /// Total packets transmitted
    pub tx_packets: u64,
    /// Total packets received
    pub rx_packets: u64,
    /// Total errors encountered
    pub errors: u64,
}

/// Builds boringtun devices on channel-backed virtual interfaces
#[derive(Debug, Clone, Copy, Default)]
pub struct WgDeviceFactory;

impl DeviceFactory for WgDeviceFactory {
    type Interface = VirtualInterface;
    type Device = WgDevice;

    fn create(&self, interface: VirtualInterface, bind: UdpBind, log_level: LogLevel) -> WgDevice {
        WgDevice::new(interface, bind, log_level)
    }
}

/// Per-peer tunnel state
struct PeerTunnel {
    /// Peer's public key
    public_key: PublicKey,
    /// Boringtun tunnel instance for this peer
    tunn: Tunn,
    /// Current peer endpoint (updated when the peer roams)
    endpoint: Option<SocketAddr>,
    /// Allowed source/destination ranges
    allowed_ips: Vec<AllowedIp>,
    /// Persistent keepalive interval
    keepalive: Option<u16>,
}

impl PeerTunnel {
    fn new(local_private: &PrivateKey, peer: &UapiPeer, index: u32) -> Result<Self> {
        let tunn = Tunn::new(
            local_private.to_static_secret(),
            peer.public_key.to_x25519(),
            peer.preshared_key.to_option(),
            peer.keepalive,
            index,
            None, // No rate limiter for now
        )
        .map_err(|e| {
            WgProxyError::WireGuard(format!(
                "Failed to create Tunn for peer {}: {}",
                peer.public_key, e
            ))
        })?;

        Ok(Self {
            public_key: peer.public_key,
            tunn,
            endpoint: peer.endpoint,
            allowed_ips: peer.allowed_ips.clone(),
            keepalive: peer.keepalive,
        })
    }

    fn allows(&self, ip: &IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(ip))
    }
}

type PeerTable = Arc<Mutex<Vec<PeerTunnel>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Down,
    Up,
    Closed,
}

/// boringtun-backed WireGuard device
pub struct WgDevice {
    log: DeviceLogger,
    bind: UdpBind,
    /// Taken when the device comes up
    interface: Option<VirtualInterface>,
    /// Last configuration applied through `ipc_set`
    config: Option<UapiConfig>,
    state: DeviceState,
    local_port: Option<u16>,
    stats: Arc<RwLock<DeviceStats>>,
    /// Task handles for cleanup
    task_handles: Vec<JoinHandle<()>>,
}

impl WgDevice {
    /// Create a device bound to `interface`; nothing runs until [`up`](TunnelDevice::up)
    pub fn new(interface: VirtualInterface, bind: UdpBind, log_level: LogLevel) -> Self {
        let log = DeviceLogger {
            level: log_level,
            name: Arc::from(interface.name()),
        };

        Self {
            log,
            bind,
            interface: Some(interface),
            config: None,
            state: DeviceState::Down,
            local_port: None,
            stats: Arc::new(RwLock::new(DeviceStats::default())),
            task_handles: Vec::new(),
        }
    }

    /// Name of the interface the device is bound to
    pub fn name(&self) -> &str {
        &self.log.name
    }

    /// Whether packet processing is running
    pub fn is_up(&self) -> bool {
        self.state == DeviceState::Up
    }

    /// UDP port the device listens on, once up
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Number of configured peers
    pub fn peer_count(&self) -> usize {
        self.config.as_ref().map_or(0, |c| c.peers.len())
    }

    /// Get device statistics
    pub async fn stats(&self) -> DeviceStats {
        self.stats.read().await.clone()
    }

    /// Start all packet processing tasks
    fn start_tasks(
        &mut self,
        handle: &tokio::runtime::Handle,
        interface: VirtualInterface,
        socket: Arc<TokioUdpSocket>,
        peers: PeerTable,
    ) {
        let (to_stack, from_stack) = interface.into_parts();

        // Outbound task (stack -> encrypt -> UDP)
        let outbound_handle = handle.spawn(Self::outbound_task(
            from_stack,
            Arc::clone(&socket),
            Arc::clone(&peers),
            Arc::clone(&self.stats),
            self.log.clone(),
        ));

        // Inbound task (UDP -> decrypt -> stack)
        let inbound_handle = handle.spawn(Self::inbound_task(
            to_stack,
            Arc::clone(&socket),
            Arc::clone(&peers),
            Arc::clone(&self.stats),
            self.log.clone(),
        ));

        // Timer task for keepalive and rekey
        let timer_handle = handle.spawn(Self::timer_task(
            socket,
            peers,
            Arc::clone(&self.stats),
            self.log.clone(),
        ));

        self.task_handles.push(outbound_handle);
        self.task_handles.push(inbound_handle);
        self.task_handles.push(timer_handle);

        self.log.verbose(format_args!("All packet processing tasks started"));
    }

    /// Send one datagram and account for it
    async fn send_datagram(
        socket: &TokioUdpSocket,
        data: &[u8],
        endpoint: SocketAddr,
        stats: &RwLock<DeviceStats>,
        log: &DeviceLogger,
    ) -> bool {
        match socket.send_to(data, endpoint).await {
            Ok(sent) => {
                log.verbose(format_args!("Sent {} bytes to {}", sent, endpoint));
                let mut stats_guard = stats.write().await;
                stats_guard.tx_bytes += sent as u64;
                stats_guard.tx_packets += 1;
                true
            }
            Err(e) => {
                log.error(format_args!("UDP send error to {}: {}", endpoint, e));
                stats.write().await.errors += 1;
                false
            }
        }
    }

    /// Outbound packet processing: stack -> encrypt -> UDP
    async fn outbound_task(
        mut from_stack: mpsc::Receiver<Vec<u8>>,
        socket: Arc<TokioUdpSocket>,
        peers: PeerTable,
        stats: Arc<RwLock<DeviceStats>>,
        log: DeviceLogger,
    ) {
        log.verbose(format_args!("Outbound task started"));
        let mut wg_buffer = vec![0u8; MAX_PACKET_SIZE];

        while let Some(packet) = from_stack.recv().await {
            let Some(dst) = destination_address(&packet) else {
                log.verbose(format_args!("Dropping malformed outbound packet"));
                continue;
            };

            let mut peers_guard = peers.lock().await;
            let Some(index) = select_peer(&peers_guard, &dst) else {
                log.verbose(format_args!("No peer routes {}, dropping packet", dst));
                continue;
            };
            let peer = &mut peers_guard[index];

            match peer.tunn.encapsulate(&packet, &mut wg_buffer) {
                TunnResult::Done => {
                    log.verbose(format_args!("Packet queued for peer {}", peer.public_key));
                }
                TunnResult::Err(e) => {
                    log.error(format_args!("Encapsulation error for peer {}: {:?}", peer.public_key, e));
                    stats.write().await.errors += 1;
                }
                TunnResult::WriteToNetwork(data) => match peer.endpoint {
                    Some(endpoint) => {
                        Self::send_datagram(&socket, data, endpoint, &stats, &log).await;
                    }
                    None => {
                        log.verbose(format_args!("Peer {} has no endpoint yet", peer.public_key));
                    }
                },
                TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {
                    log.verbose(format_args!("Unexpected WriteToTunnel result in outbound path"));
                }
            }
        }

        log.verbose(format_args!("Outbound task stopped: interface closed"));
    }

    /// Inbound packet processing: UDP -> decrypt -> stack
    async fn inbound_task(
        to_stack: mpsc::Sender<Vec<u8>>,
        socket: Arc<TokioUdpSocket>,
        peers: PeerTable,
        stats: Arc<RwLock<DeviceStats>>,
        log: DeviceLogger,
    ) {
        log.verbose(format_args!("Inbound task started"));
        let mut udp_buffer = vec![0u8; MAX_PACKET_SIZE];
        let mut out_buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (n, src) = match socket.recv_from(&mut udp_buffer).await {
                Ok(received) => received,
                Err(e) => {
                    log.error(format_args!("UDP recv error: {}", e));
                    stats.write().await.errors += 1;
                    time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            log.verbose(format_args!("Received {} bytes from {}", n, src));

            let mut peers_guard = peers.lock().await;

            // A known endpoint goes straight to its peer; anything else is
            // offered to each peer until one accepts it (first contact, roaming)
            let known = peers_guard.iter().position(|p| p.endpoint == Some(src));
            let candidates: Vec<usize> = match known {
                Some(index) => vec![index],
                None => (0..peers_guard.len()).collect(),
            };

            let mut accepted = false;
            for index in candidates {
                let peer = &mut peers_guard[index];

                match peer.tunn.decapsulate(Some(src.ip()), &udp_buffer[..n], &mut out_buffer) {
                    TunnResult::Err(e) => {
                        if known.is_some() {
                            log.error(format_args!("Decapsulation error from {}: {:?}", src, e));
                        }
                        continue;
                    }
                    TunnResult::Done => {
                        log.verbose(format_args!("Packet decapsulated (no output)"));
                    }
                    TunnResult::WriteToNetwork(data) => {
                        Self::send_datagram(&socket, data, src, &stats, &log).await;

                        // Flush packets queued while the handshake was in progress
                        while let TunnResult::WriteToNetwork(data) =
                            peer.tunn.decapsulate(None, &[], &mut out_buffer)
                        {
                            Self::send_datagram(&socket, data, src, &stats, &log).await;
                        }
                    }
                    TunnResult::WriteToTunnelV4(data, addr) => {
                        Self::deliver(&to_stack, peer, data, IpAddr::V4(addr), &stats, &log).await;
                    }
                    TunnResult::WriteToTunnelV6(data, addr) => {
                        Self::deliver(&to_stack, peer, data, IpAddr::V6(addr), &stats, &log).await;
                    }
                }

                if peer.endpoint != Some(src) {
                    log.info(format_args!("Peer {} endpoint is now {}", peer.public_key, src));
                    peer.endpoint = Some(src);
                }
                accepted = true;
                break;
            }

            if !accepted {
                stats.write().await.errors += 1;
                if known.is_none() {
                    log.verbose(format_args!("Received packet from unknown endpoint: {}", src));
                }
            }
        }
    }

    /// Hand a decrypted packet to the stack if its source is allowed for the peer
    async fn deliver(
        to_stack: &mpsc::Sender<Vec<u8>>,
        peer: &PeerTunnel,
        data: &[u8],
        source: IpAddr,
        stats: &RwLock<DeviceStats>,
        log: &DeviceLogger,
    ) {
        if !peer.allows(&source) {
            log.verbose(format_args!(
                "Dropping packet from {} not allowed for peer {}",
                source, peer.public_key
            ));
            stats.write().await.errors += 1;
            return;
        }

        match to_stack.try_send(data.to_vec()) {
            Ok(()) => {
                log.verbose(format_args!("Delivered {} bytes from {} to stack", data.len(), source));
                let mut stats_guard = stats.write().await;
                stats_guard.rx_bytes += data.len() as u64;
                stats_guard.rx_packets += 1;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log.verbose(format_args!("Stack queue full, dropping packet"));
                stats.write().await.errors += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log.verbose(format_args!("Stack closed, dropping packet"));
            }
        }
    }

    /// Timer task for handshake initiation, keepalive and rekey
    async fn timer_task(
        socket: Arc<TokioUdpSocket>,
        peers: PeerTable,
        stats: Arc<RwLock<DeviceStats>>,
        log: DeviceLogger,
    ) {
        log.verbose(format_args!("Timer task started"));
        let mut interval = time::interval(TIMER_TICK_INTERVAL);
        let mut wg_buffer = vec![0u8; MAX_PACKET_SIZE];

        // Peers with a persistent keepalive are contacted right away
        {
            let mut peers_guard = peers.lock().await;
            for peer in peers_guard.iter_mut() {
                let (Some(endpoint), Some(_)) = (peer.endpoint, peer.keepalive) else {
                    continue;
                };
                if let TunnResult::WriteToNetwork(data) =
                    peer.tunn.format_handshake_initiation(&mut wg_buffer, false)
                {
                    log.verbose(format_args!("Initiating handshake with {}", endpoint));
                    Self::send_datagram(&socket, data, endpoint, &stats, &log).await;
                }
            }
        }

        loop {
            interval.tick().await;

            let mut peers_guard = peers.lock().await;

            for peer in peers_guard.iter_mut() {
                match peer.tunn.update_timers(&mut wg_buffer) {
                    TunnResult::Done => {}
                    TunnResult::Err(e) => {
                        log.verbose(format_args!("Timer update error for peer {}: {:?}", peer.public_key, e));
                    }
                    TunnResult::WriteToNetwork(data) => {
                        if let Some(endpoint) = peer.endpoint {
                            Self::send_datagram(&socket, data, endpoint, &stats, &log).await;
                        }
                    }
                    TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {
                        log.verbose(format_args!("Unexpected WriteToTunnel result in timer task"));
                    }
                }
            }
        }
    }
}

impl TunnelDevice for WgDevice {
    fn ipc_set(&mut self, request: &str) -> Result<()> {
        match self.state {
            DeviceState::Down => {}
            DeviceState::Up => {
                return Err(WgProxyError::InvalidState(
                    "Cannot reconfigure a running device".to_string(),
                ))
            }
            DeviceState::Closed => {
                return Err(WgProxyError::InvalidState("Device is closed".to_string()))
            }
        }

        let config = uapi::parse(request)?;
        self.log.info(format_args!(
            "Configuration applied: {} peer(s), listen port {:?}",
            config.peers.len(),
            config.listen_port
        ));
        self.config = Some(config);
        Ok(())
    }

    fn up(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Down => {}
            DeviceState::Up => return Ok(()),
            DeviceState::Closed => {
                return Err(WgProxyError::InvalidState("Device is closed".to_string()))
            }
        }

        let config = self.config.as_ref().ok_or_else(|| {
            WgProxyError::InvalidState("No configuration applied".to_string())
        })?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| WgProxyError::Platform(format!("No tokio runtime available: {}", e)))?;

        let mut peer_tunnels = Vec::with_capacity(config.peers.len());
        for (index, peer) in config.peers.iter().enumerate() {
            peer_tunnels.push(PeerTunnel::new(&config.private_key, peer, index as u32)?);
            self.log.verbose(format_args!("Created tunnel for peer {}", peer.public_key));
        }

        let std_socket = self.bind.open(config.listen_port.unwrap_or(0))?;

        let socket = {
            let _guard = handle.enter();
            TokioUdpSocket::from_std(std_socket).map_err(|e| {
                WgProxyError::Platform(format!("Failed to create tokio UdpSocket: {}", e))
            })?
        };

        let local_port = socket
            .local_addr()
            .map_err(|e| {
                WgProxyError::Platform(format!("Failed to get UDP socket local address: {}", e))
            })?
            .port();

        let interface = self.interface.take().ok_or_else(|| {
            WgProxyError::InvalidState("Interface already released".to_string())
        })?;

        self.log.info(format_args!(
            "UDP socket listening on port {} (requested: {:?})",
            local_port, config.listen_port
        ));

        self.start_tasks(
            &handle,
            interface,
            Arc::new(socket),
            Arc::new(Mutex::new(peer_tunnels)),
        );

        self.local_port = Some(local_port);
        self.state = DeviceState::Up;
        self.log.info(format_args!("Device is up"));
        Ok(())
    }

    fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }

        for handle in self.task_handles.drain(..) {
            handle.abort();
        }

        // Dropping the interface closes the stack's channels
        self.interface = None;
        self.state = DeviceState::Closed;
        self.log.info(format_args!("Device closed"));
    }
}

impl Drop for WgDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WgDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgDevice")
            .field("name", &self.log.name)
            .field("state", &self.state)
            .field("local_port", &self.local_port)
            .field("peers", &self.peer_count())
            .finish()
    }
}

/// Destination address of an IPv4 or IPv6 packet
fn destination_address(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Length of the longest allowed prefix containing `ip`
fn longest_match(allowed_ips: &[AllowedIp], ip: &IpAddr) -> Option<u8> {
    allowed_ips
        .iter()
        .filter(|net| net.contains(ip))
        .map(AllowedIp::prefix)
        .max()
}

/// Peer whose allowed IPs most specifically cover `dst`; ties go to the earlier peer
fn select_peer(peers: &[PeerTunnel], dst: &IpAddr) -> Option<usize> {
    let mut best: Option<(usize, u8)> = None;
    for (index, peer) in peers.iter().enumerate() {
        if let Some(len) = longest_match(&peer.allowed_ips, dst) {
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((index, len));
            }
        }
    }
    best.map(|(index, _)| index)
}
