//! DSU server: one UDP socket serving every bound slot.
//!
//! The server owns three kinds of tasks:
//!
//! - a receive loop answering version, port-info, and pad-data requests and
//!   maintaining the client table,
//! - one forwarding task per bound slot, woken by that slot's watch cell and
//!   pushing pad-data packets to subscribers,
//! - a sweep task expiring clients that have gone silent.
//!
//! The client table lock is only ever held to read or mutate the map; target
//! addresses are collected first and sends happen after the guard is dropped,
//! so a slow network path never stalls a pipeline writer.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::packet::{
    self, ClientRequest, DsuProtocolError, PadMeta, RegistrationTarget,
};
use crate::controller::pipeline::{ConnectionStatus, SlotSnapshot};

/// Default Cemuhook port expected by emulator clients.
pub const DSU_PORT: u16 = 26760;

/// How many successive ports to try when the configured one is taken.
pub const PORT_ATTEMPTS: u16 = 10;

/// Subscriptions expire after this much client silence.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum DsuError {
    #[error("all {attempts} DSU ports starting at {base} are in use")]
    PortExhausted { base: u16, attempts: u16 },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] DsuProtocolError),
}

#[derive(Debug, Clone)]
pub struct DsuConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub port_attempts: u16,
    pub server_id: u32,
}

impl Default for DsuConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DSU_PORT,
            port_attempts: PORT_ATTEMPTS,
            server_id: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ClientEntry {
    all_slots: bool,
    slots: HashSet<u8>,
    last_seen: Option<Instant>,
}

impl ClientEntry {
    fn subscribed(&self, slot: u8) -> bool {
        self.all_slots || self.slots.contains(&slot)
    }
}

struct SlotBinding {
    rx: watch::Receiver<SlotSnapshot>,
    counter: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

struct ServerShared {
    socket: Arc<UdpSocket>,
    server_id: u32,
    clients: Mutex<HashMap<SocketAddr, ClientEntry>>,
    slots: Mutex<HashMap<u8, SlotBinding>>,
}

/// Clone-able slot binder handed to the session manager; binding a slot
/// injects its watch receiver into the server's send path.
#[derive(Clone)]
pub struct DsuPublisher {
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
}

impl DsuPublisher {
    /// Binds `slot` to a pipeline's state cell. Rebinding replaces the
    /// previous pipeline's binding.
    pub fn bind_slot(&self, slot: u8, rx: watch::Receiver<SlotSnapshot>) {
        let counter = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(forward_loop(
            slot,
            rx.clone(),
            Arc::clone(&counter),
            Arc::clone(&self.shared),
            self.cancel.clone(),
        ));
        let binding = SlotBinding { rx, counter, task };

        let previous = {
            let mut slots = self.shared.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.insert(slot, binding)
        };
        if let Some(previous) = previous {
            previous.task.abort();
            debug!("slot {slot}: replaced previous DSU binding");
        }
    }
}

/// One DSU endpoint. Constructed by the session manager and torn down with
/// it; never global state.
pub struct DsuServer {
    shared: Arc<ServerShared>,
    port: u16,
    cancel: CancellationToken,
    core_tasks: Vec<JoinHandle<()>>,
}

impl DsuServer {
    /// Binds the configured port, falling back to successive ports while the
    /// bind fails with `AddrInUse`, up to the configured attempt budget.
    pub async fn bind(config: DsuConfig, cancel: CancellationToken) -> Result<Self, DsuError> {
        let mut socket = None;
        for attempt in 0..config.port_attempts.max(1) {
            let port = config.port + attempt;
            match UdpSocket::bind((config.bind_addr, port)).await {
                Ok(bound) => {
                    if attempt > 0 {
                        warn!(
                            "DSU port {} was in use; bound fallback port {port} \
                             (point the emulator here)",
                            config.port
                        );
                    }
                    socket = Some(bound);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    warn!("DSU port {port} already in use, trying {}", port + 1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let socket = socket.ok_or(DsuError::PortExhausted {
            base: config.port,
            attempts: config.port_attempts,
        })?;
        let port = socket.local_addr()?.port();
        info!("DSU server listening on {}:{port}", config.bind_addr);

        let shared = Arc::new(ServerShared {
            socket: Arc::new(socket),
            server_id: config.server_id,
            clients: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        });

        let core_tasks = vec![
            tokio::spawn(recv_loop(Arc::clone(&shared), cancel.clone())),
            tokio::spawn(sweep_loop(Arc::clone(&shared), cancel.clone())),
        ];

        Ok(Self {
            shared,
            port,
            cancel,
            core_tasks,
        })
    }

    /// The actually-bound port; differs from the configured one after a
    /// fallback.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn publisher(&self) -> DsuPublisher {
        DsuPublisher {
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
        }
    }

    /// Stops every server task, drops all subscriptions, and closes the
    /// socket.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.core_tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("DSU task failed during shutdown: {e}");
                }
            }
        }

        let bindings: Vec<SlotBinding> = {
            let mut slots = self.shared.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.drain().map(|(_, binding)| binding).collect()
        };
        for binding in bindings {
            if let Err(e) = binding.task.await {
                if !e.is_cancelled() {
                    error!("DSU slot task failed during shutdown: {e}");
                }
            }
        }

        self.shared
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("DSU server stopped");
    }
}

async fn recv_loop(shared: Arc<ServerShared>, cancel: CancellationToken) {
    let mut buf = [0u8; RECV_BUFFER];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok((len, addr)) => handle_request(&shared, &buf[..len], addr).await,
                Err(e) => warn!("DSU receive failed: {e}"),
            }
        }
    }
}

async fn handle_request(shared: &ServerShared, data: &[u8], addr: SocketAddr) {
    let request = match packet::parse_request(data) {
        Ok(request) => request,
        Err(e) => {
            // Malformed inbound traffic is dropped; subscriptions stay as
            // they were.
            debug!("dropping packet from {addr}: {e}");
            return;
        }
    };

    match request {
        ClientRequest::Version => {
            let response = packet::version_response(shared.server_id);
            if let Err(e) = shared.socket.send_to(&response, addr).await {
                debug!("version response to {addr} failed: {e}");
            }
        }
        ClientRequest::PortInfo { slots } => {
            touch_client(shared, addr);
            for slot in slots {
                let meta = slot_meta(shared, slot);
                let response = packet::port_info_response(shared.server_id, &meta);
                if let Err(e) = shared.socket.send_to(&response, addr).await {
                    debug!("port-info response to {addr} failed: {e}");
                }
            }
        }
        ClientRequest::PadData { target } => {
            register_client(shared, addr, target);
            // Reply immediately with the current state so a fresh client is
            // not left waiting for the next input tick.
            let active: Vec<(u8, SlotSnapshot, Arc<AtomicU32>)> = {
                let slots = shared.slots.lock().unwrap_or_else(|e| e.into_inner());
                slots
                    .iter()
                    .filter(|(slot, _)| match target {
                        RegistrationTarget::AllSlots => true,
                        RegistrationTarget::Slot(s) => s == **slot,
                        RegistrationTarget::Mac(mac) => mac_slot(&mac) == Some(**slot),
                    })
                    .map(|(slot, binding)| {
                        (*slot, *binding.rx.borrow(), Arc::clone(&binding.counter))
                    })
                    .collect()
            };
            for (slot, snapshot, counter) in active {
                if snapshot.status != ConnectionStatus::Active {
                    continue;
                }
                let counter = counter.fetch_add(1, Ordering::Relaxed) + 1;
                let meta =
                    PadMeta::for_slot(slot, true, snapshot.kind.dsu_connection_type());
                let packet =
                    packet::pad_data_packet(shared.server_id, &meta, &snapshot.state, counter);
                if let Err(e) = shared.socket.send_to(&packet, addr).await {
                    debug!("pad-data reply to {addr} failed: {e}");
                }
            }
        }
    }
}

fn touch_client(shared: &ServerShared, addr: SocketAddr) {
    let mut clients = shared.clients.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = clients.get_mut(&addr) {
        entry.last_seen = Some(Instant::now());
    }
}

fn register_client(shared: &ServerShared, addr: SocketAddr, target: RegistrationTarget) {
    let mut clients = shared.clients.lock().unwrap_or_else(|e| e.into_inner());
    let entry = clients.entry(addr).or_default();
    if entry.last_seen.is_none() {
        info!("DSU client {addr} subscribed ({target:?})");
    }
    entry.last_seen = Some(Instant::now());
    match target {
        RegistrationTarget::AllSlots => entry.all_slots = true,
        RegistrationTarget::Slot(slot) => {
            entry.slots.insert(slot);
        }
        RegistrationTarget::Mac(mac) => {
            if let Some(slot) = mac_slot(&mac) {
                entry.slots.insert(slot);
            }
        }
    }
}

/// Reverses the synthetic per-slot MAC back to its slot id.
fn mac_slot(mac: &[u8; 6]) -> Option<u8> {
    let expected = PadMeta::for_slot(mac[5], true, 0).mac;
    (*mac == expected).then_some(mac[5])
}

fn slot_meta(shared: &ServerShared, slot: u8) -> PadMeta {
    let slots = shared.slots.lock().unwrap_or_else(|e| e.into_inner());
    match slots.get(&slot) {
        Some(binding) => {
            let snapshot = *binding.rx.borrow();
            let connected = snapshot.status == ConnectionStatus::Active;
            let connection = if connected {
                snapshot.kind.dsu_connection_type()
            } else {
                0
            };
            PadMeta::for_slot(slot, connected, connection)
        }
        None => PadMeta::for_slot(slot, false, 0),
    }
}

/// Pushes a pad-data packet to every subscriber of `slot` whenever its state
/// cell changes. Ends when the pipeline drops its writer or the server stops.
async fn forward_loop(
    slot: u8,
    mut rx: watch::Receiver<SlotSnapshot>,
    counter: Arc<AtomicU32>,
    shared: Arc<ServerShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!("slot {slot}: pipeline gone, stopping DSU stream");
                    break;
                }
                let snapshot = *rx.borrow_and_update();
                if snapshot.status != ConnectionStatus::Active {
                    // Inactive slots push nothing; stale state never leaves
                    // the server.
                    continue;
                }

                let targets: Vec<SocketAddr> = {
                    let clients = shared.clients.lock().unwrap_or_else(|e| e.into_inner());
                    clients
                        .iter()
                        .filter(|(_, entry)| entry.subscribed(slot))
                        .map(|(addr, _)| *addr)
                        .collect()
                };
                if targets.is_empty() {
                    continue;
                }

                let counter = counter.fetch_add(1, Ordering::Relaxed) + 1;
                let meta = PadMeta::for_slot(slot, true, snapshot.kind.dsu_connection_type());
                let packet =
                    packet::pad_data_packet(shared.server_id, &meta, &snapshot.state, counter);
                for addr in targets {
                    if let Err(e) = shared.socket.send_to(&packet, addr).await {
                        debug!("pad-data to {addr} failed: {e}");
                    }
                }
            }
        }
    }
}

async fn sweep_loop(shared: Arc<ServerShared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let mut clients = shared.clients.lock().unwrap_or_else(|e| e.into_inner());
                clients.retain(|addr, entry| {
                    let keep = entry
                        .last_seen
                        .map(|seen| seen.elapsed() < CLIENT_TIMEOUT)
                        .unwrap_or(false);
                    if !keep {
                        info!("DSU client {addr} timed out");
                    }
                    keep
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::pipeline::ControllerState;
    use crate::dsu::packet::{
        encode_client_request, MSG_PAD_DATA, MSG_PORT_INFO, MSG_VERSION,
    };
    use crate::transport::TransportKind;
    use byteorder::{ByteOrder, LittleEndian};

    async fn start_server() -> (DsuServer, CancellationToken) {
        let cancel = CancellationToken::new();
        let server = DsuServer::bind(
            DsuConfig {
                port: 0, // let the OS pick, keeps tests conflict-free
                port_attempts: 1,
                ..DsuConfig::default()
            },
            cancel.clone(),
        )
        .await
        .unwrap();
        (server, cancel)
    }

    async fn client_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn server_addr(server: &DsuServer) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], server.port()))
    }

    fn pad_data_request_all() -> Vec<u8> {
        encode_client_request(MSG_PAD_DATA, &[0u8; 8])
    }

    async fn recv(client: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("expected a packet")
            .unwrap();
        buf[..len].to_vec()
    }

    async fn expect_silence(client: &UdpSocket) {
        let mut buf = [0u8; 256];
        let result =
            tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(result.is_err(), "unexpected packet received");
    }

    fn active_snapshot(sequence: u64) -> SlotSnapshot {
        SlotSnapshot {
            status: ConnectionStatus::Active,
            kind: TransportKind::Usb,
            state: ControllerState {
                sequence,
                main_x: 500,
                ..ControllerState::default()
            },
        }
    }

    fn initial_snapshot() -> SlotSnapshot {
        SlotSnapshot {
            status: ConnectionStatus::Connecting,
            kind: TransportKind::Usb,
            state: ControllerState::default(),
        }
    }

    #[tokio::test]
    async fn binds_fallback_port_when_occupied() {
        // Find a base where three consecutive ports are free, then occupy the
        // first two.
        let (base, _blockers) = loop {
            let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let base = probe.local_addr().unwrap().port();
            drop(probe);
            if base > u16::MAX - 3 {
                continue;
            }
            let b0 = std::net::UdpSocket::bind(("127.0.0.1", base));
            let b1 = std::net::UdpSocket::bind(("127.0.0.1", base + 1));
            let free = std::net::UdpSocket::bind(("127.0.0.1", base + 2));
            match (b0, b1, free) {
                (Ok(b0), Ok(b1), Ok(free)) => {
                    drop(free);
                    break (base, (b0, b1));
                }
                _ => continue,
            }
        };

        let cancel = CancellationToken::new();
        let server = DsuServer::bind(
            DsuConfig {
                port: base,
                port_attempts: 5,
                ..DsuConfig::default()
            },
            cancel.clone(),
        )
        .await
        .unwrap();
        assert_eq!(server.port(), base + 2);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_ports_are_fatal() {
        let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let cancel = CancellationToken::new();
        let result = DsuServer::bind(
            DsuConfig {
                port,
                port_attempts: 1,
                ..DsuConfig::default()
            },
            cancel,
        )
        .await;
        assert!(matches!(result, Err(DsuError::PortExhausted { .. })));
    }

    #[tokio::test]
    async fn answers_version_request() {
        let (server, _cancel) = start_server().await;
        let client = client_socket().await;

        client
            .send_to(&encode_client_request(MSG_VERSION, &[]), server_addr(&server))
            .await
            .unwrap();
        let response = recv(&client).await;
        assert_eq!(&response[0..4], b"DSUS");
        assert_eq!(LittleEndian::read_u32(&response[16..20]), MSG_VERSION);
        assert!(packet::checksum_matches(&response));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn port_info_reflects_slot_state() {
        let (server, _cancel) = start_server().await;
        let (tx, rx) = watch::channel(initial_snapshot());
        server.publisher().bind_slot(0, rx);

        let client = client_socket().await;
        let mut payload = [0u8; 6];
        LittleEndian::write_i32(&mut payload[0..4], 2);
        payload[4] = 0;
        payload[5] = 1;
        let request = encode_client_request(MSG_PORT_INFO, &payload);

        // Slot 0 bound but not yet active, slot 1 unbound.
        client.send_to(&request, server_addr(&server)).await.unwrap();
        let first = recv(&client).await;
        let second = recv(&client).await;
        assert_eq!(first[20], 0);
        assert_eq!(first[21], 0); // not connected yet
        assert_eq!(second[20], 1);
        assert_eq!(second[21], 0);

        tx.send(active_snapshot(1)).unwrap();
        client.send_to(&request, server_addr(&server)).await.unwrap();
        let first = recv(&client).await;
        assert_eq!(first[21], 2); // connected
        assert_eq!(first[23], 0x01); // USB

        server.shutdown().await;
    }

    #[tokio::test]
    async fn streams_ticks_to_subscribers_until_disconnect() {
        let (server, _cancel) = start_server().await;
        let (tx, rx) = watch::channel(initial_snapshot());
        server.publisher().bind_slot(0, rx);

        let client = client_socket().await;
        client
            .send_to(&pad_data_request_all(), server_addr(&server))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(active_snapshot(1)).unwrap();
        let first = recv(&client).await;
        assert_eq!(first.len(), packet::PAD_DATA_PACKET_LEN);
        assert_eq!(first[20], 0);
        let first_counter = LittleEndian::read_u32(&first[32..36]);

        tx.send(active_snapshot(2)).unwrap();
        let second = recv(&client).await;
        let second_counter = LittleEndian::read_u32(&second[32..36]);
        assert!(second_counter > first_counter);

        // Disconnect: the slot goes quiet even though a last state exists.
        tx.send_modify(|snapshot| snapshot.status = ConnectionStatus::Disconnected);
        expect_silence(&client).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn slots_are_independent() {
        let (server, _cancel) = start_server().await;
        let (tx0, rx0) = watch::channel(initial_snapshot());
        let (tx1, rx1) = watch::channel(initial_snapshot());
        let publisher = server.publisher();
        publisher.bind_slot(0, rx0);
        publisher.bind_slot(1, rx1);

        let client = client_socket().await;
        client
            .send_to(&pad_data_request_all(), server_addr(&server))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx0.send(active_snapshot(1)).unwrap();
        tx1.send(active_snapshot(1)).unwrap();
        let first = recv(&client).await;
        let second = recv(&client).await;
        let mut slots_seen = vec![first[20], second[20]];
        slots_seen.sort_unstable();
        assert_eq!(slots_seen, vec![0, 1]);

        // Pipeline 0 stops (writer dropped); slot 1 must keep streaming.
        drop(tx0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx1.send(active_snapshot(2)).unwrap();
        let packet = recv(&client).await;
        assert_eq!(packet[20], 1);
        expect_silence(&client).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn expired_clients_are_swept() {
        let (server, _cancel) = start_server().await;
        let (tx, rx) = watch::channel(initial_snapshot());
        server.publisher().bind_slot(0, rx);

        let Some(stale) = Instant::now().checked_sub(CLIENT_TIMEOUT + Duration::from_secs(1))
        else {
            return; // clock too close to boot to backdate
        };
        {
            let mut clients = server.shared.clients.lock().unwrap();
            let entry = clients.entry("127.0.0.1:9".parse().unwrap()).or_default();
            entry.all_slots = true;
            entry.last_seen = Some(stale);
        }

        // The sweep runs once a second.
        tokio::time::sleep(SWEEP_INTERVAL + Duration::from_millis(200)).await;
        assert!(server.shared.clients.lock().unwrap().is_empty());

        drop(tx);
        server.shutdown().await;
    }
}
