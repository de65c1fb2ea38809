//! Router front-end: typed client registry and framed-message demux.
//!
//! On every new connection the server runs the unit-type handshake: it
//! requests an [`UnitDefinition`](crate::net::frame::UnitDefinition) with a
//! 2-second receive timeout, retries with a `UuidCollision` message while
//! the announced UUID collides with an installed client, then registers
//! the client and spawns its receiver thread. Receiver threads poll with a
//! finite read timeout so abort flags are observed promptly.
//!
//! Send failures mark the client aborted and remove it from the registry;
//! broadcasts skip aborted clients and continue with the rest.

use crate::net::frame::{
    decode_payload, encode_empty_frame, MetaHeader, PackageType, UnitDefinition, UnitType,
    META_SIZE,
};
use crate::net::{FrameCallback, POLL_TIMEOUT_MS, RECEIVE_BUFFER_SIZE};
use crate::plan::ClientUuid;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One connected client.
pub struct ClientInfo {
    pub uuid: ClientUuid,
    pub unit_type: UnitType,
    pub pretty_name: String,
    stream: Mutex<TcpStream>,
    pub abort: AtomicBool,
}

impl ClientInfo {
    fn send_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)
    }

    fn shutdown(&self) {
        self.abort.store(true, Ordering::Release);
        let stream = self.stream.lock();
        let _ = stream.shutdown(Shutdown::Both);
    }
}

#[derive(Default)]
struct Registry {
    by_uuid: HashMap<ClientUuid, Arc<ClientInfo>>,
    receivers: Vec<JoinHandle<()>>,
}

struct ServerShared {
    listener: TcpListener,
    registry: Mutex<Registry>,
    callbacks: RwLock<HashMap<PackageType, FrameCallback>>,
    running: AtomicBool,
}

/// The central router's TCP server.
pub struct RouterServer {
    shared: Arc<ServerShared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RouterServer {
    pub fn bind(port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!(port, "router listening");
        Ok(Self {
            shared: Arc::new(ServerShared {
                listener,
                registry: Mutex::new(Registry::default()),
                callbacks: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.shared
            .listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Install (or replace) the handler for one package type.
    pub fn add_callback(&self, package_type: PackageType, callback: FrameCallback) {
        self.shared.callbacks.write().insert(package_type, callback);
    }

    /// Start accepting connections.
    pub fn start(&self) {
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *self.accept_thread.lock() = Some(thread::spawn(move || accept_loop(&shared)));
    }

    pub fn get_client(&self, uuid: ClientUuid) -> Option<Arc<ClientInfo>> {
        self.shared.registry.lock().by_uuid.get(&uuid).cloned()
    }

    /// `(pretty_name, uuid)` of every live client of the given type.
    pub fn uuids_for_type(&self, unit_type: UnitType) -> Vec<(String, ClientUuid)> {
        let registry = self.shared.registry.lock();
        registry
            .by_uuid
            .values()
            .filter(|c| c.unit_type == unit_type && !c.abort.load(Ordering::Acquire))
            .map(|c| (c.pretty_name.clone(), c.uuid))
            .collect()
    }

    /// Send to one client; failure aborts and removes it.
    pub fn send_to(&self, client: &Arc<ClientInfo>, bytes: &[u8]) -> bool {
        if client.abort.load(Ordering::Acquire) {
            return false;
        }
        match client.send_bytes(bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!(uuid = client.uuid, %err, "send failed, removing client");
                client.shutdown();
                self.shared.registry.lock().by_uuid.remove(&client.uuid);
                false
            }
        }
    }

    /// Send to a random live client of the given type.
    pub fn send_to_any_of_type(&self, unit_type: UnitType, bytes: &[u8]) -> bool {
        self.reroute_to_any_of_type(unit_type, None, bytes)
    }

    /// Send to a random live client of the type, excluding `exclude` (the
    /// unit a task is being rerouted away from).
    pub fn reroute_to_any_of_type(
        &self,
        unit_type: UnitType,
        exclude: Option<ClientUuid>,
        bytes: &[u8],
    ) -> bool {
        let candidates: Vec<Arc<ClientInfo>> = {
            let registry = self.shared.registry.lock();
            registry
                .by_uuid
                .values()
                .filter(|c| {
                    c.unit_type == unit_type
                        && !c.abort.load(Ordering::Acquire)
                        && Some(c.uuid) != exclude
                })
                .cloned()
                .collect()
        };
        let Some(client) = candidates.choose(&mut rand::thread_rng()) else {
            error!(?unit_type, "no client of requested type available");
            return false;
        };
        self.send_to(client, bytes)
    }

    /// Broadcast to every live client of the type. Aborted clients are
    /// skipped; individual failures do not stop the broadcast.
    pub fn send_to_all_of_type(&self, unit_type: UnitType, bytes: &[u8]) {
        let targets: Vec<Arc<ClientInfo>> = {
            let registry = self.shared.registry.lock();
            registry
                .by_uuid
                .values()
                .filter(|c| c.unit_type == unit_type && !c.abort.load(Ordering::Acquire))
                .cloned()
                .collect()
        };
        for client in targets {
            self.send_to(&client, bytes);
        }
    }

    pub fn send_to_all(&self, bytes: &[u8]) {
        let targets: Vec<Arc<ClientInfo>> = {
            let registry = self.shared.registry.lock();
            registry.by_uuid.values().cloned().collect()
        };
        for client in targets {
            self.send_to(&client, bytes);
        }
    }

    /// Drop clients whose abort flag is set.
    pub fn clear_aborted(&self) {
        let mut registry = self.shared.registry.lock();
        registry
            .by_uuid
            .retain(|_, client| !client.abort.load(Ordering::Acquire));
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.lock().by_uuid.len()
    }

    /// One line per client, for monitor requests.
    pub fn monitor_info(&self) -> String {
        let registry = self.shared.registry.lock();
        let mut out = String::new();
        for client in registry.by_uuid.values() {
            out.push_str(&format!(
                "{}\t{:?}\t{}\n",
                client.pretty_name, client.unit_type, client.uuid
            ));
        }
        out
    }

    /// Stop accepting, shut all client sockets down, join every thread.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        let (clients, receivers) = {
            let mut registry = self.shared.registry.lock();
            let clients: Vec<Arc<ClientInfo>> = registry.by_uuid.values().cloned().collect();
            (clients, std::mem::take(&mut registry.receivers))
        };
        for client in clients {
            client.shutdown();
        }
        for handle in receivers {
            let _ = handle.join();
        }
    }
}

impl Drop for RouterServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(shared: &Arc<ServerShared>) {
    while shared.running.load(Ordering::Acquire) {
        match shared.listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "new connection");
                if let Err(err) = handshake(shared, stream) {
                    warn!(%addr, %err, "handshake failed, discarding client");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS));
            }
            Err(err) => {
                error!(%err, "accept failed");
                thread::sleep(Duration::from_millis(POLL_TIMEOUT_MS));
            }
        }
    }
}

/// Read one complete frame with the stream's current read timeout.
fn read_frame(stream: &mut TcpStream) -> anyhow::Result<(MetaHeader, Vec<u8>)> {
    let mut meta = [0u8; META_SIZE];
    stream.read_exact(&mut meta)?;
    let header =
        MetaHeader::read_from(&meta).ok_or_else(|| anyhow::anyhow!("misaligned frame delimiter"))?;
    let mut payload = vec![0u8; header.payload_size as usize];
    stream.read_exact(&mut payload)?;
    Ok((header, payload))
}

/// Unit-type handshake with UUID-collision retry, then client install.
fn handshake(shared: &Arc<ServerShared>, mut stream: TcpStream) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    // Ask who is there; a client that takes longer than 2 s is dropped.
    stream.write_all(&encode_empty_frame(PackageType::UpdateUnitType, 0, 0))?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let (mut header, payload) = read_frame(&mut stream)?;
    if header.package_type != PackageType::UpdateUnitType {
        anyhow::bail!("expected a unit-type update, got {:?}", header.package_type);
    }
    let unit: UnitDefinition = decode_payload(&payload)?;

    // Random 64-bit UUIDs should never collide, but the retry costs
    // nothing and the registry must stay unique.
    loop {
        let collision = shared.registry.lock().by_uuid.contains_key(&header.src_uuid);
        if !collision {
            break;
        }
        warn!(uuid = header.src_uuid, "uuid collision, requesting a new one");
        stream.write_all(&encode_empty_frame(PackageType::UuidCollision, 0, 0))?;
        let (next_header, _) = read_frame(&mut stream)?;
        if next_header.package_type != PackageType::UpdateUnitType {
            anyhow::bail!("expected a unit-type update during collision retry");
        }
        header = next_header;
    }

    stream.set_read_timeout(Some(Duration::from_millis(POLL_TIMEOUT_MS)))?;
    let client = Arc::new(ClientInfo {
        uuid: header.src_uuid,
        unit_type: unit.unit_type,
        pretty_name: unit.pretty_name.clone(),
        stream: Mutex::new(stream.try_clone()?),
        abort: AtomicBool::new(false),
    });
    info!(
        uuid = client.uuid,
        unit_type = ?client.unit_type,
        name = %client.pretty_name,
        "client connected"
    );

    let receiver_shared = Arc::clone(shared);
    let receiver_client = Arc::clone(&client);
    let receiver = thread::spawn(move || receive_loop(&receiver_shared, &receiver_client, stream));

    let mut registry = shared.registry.lock();
    registry.by_uuid.insert(client.uuid, client);
    registry.receivers.push(receiver);
    Ok(())
}

fn receive_loop(shared: &Arc<ServerShared>, client: &Arc<ClientInfo>, mut stream: TcpStream) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut unprocessed = 0usize;

    while !client.abort.load(Ordering::Acquire) && shared.running.load(Ordering::Acquire) {
        if unprocessed == buf.len() {
            error!(uuid = client.uuid, "receive buffer overflow, dropping client");
            client.abort.store(true, Ordering::Release);
            break;
        }
        match stream.read(&mut buf[unprocessed..]) {
            Ok(0) => {
                debug!(uuid = client.uuid, "client disconnected");
                client.abort.store(true, Ordering::Release);
                break;
            }
            Ok(received) => {
                let filled = unprocessed + received;
                // A healthy stream always has the delimiter at byte 0; a
                // misaligned frame means the peer lost sync, so the
                // connection is closed rather than resynchronized.
                if filled >= 4
                    && u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"))
                        != crate::net::frame::FRAME_MAGIC
                {
                    error!(uuid = client.uuid, "misaligned frame delimiter, dropping client");
                    client.abort.store(true, Ordering::Release);
                    break;
                }
                let callbacks = shared.callbacks.read().clone();
                unprocessed =
                    crate::net::frame::extract_frames(&mut buf, filled, |header, payload| {
                        match callbacks.get(&header.package_type) {
                            Some(callback) => callback(header, payload),
                            None => {
                                warn!(package = ?header.package_type, "unknown package type, dropping frame");
                            }
                        }
                    });
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // Timeout: loop to observe the abort flag.
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(uuid = client.uuid, %err, "receive failed");
                client.abort.store(true, Ordering::Release);
                break;
            }
        }
    }
}
