//! Compute-unit side of the fabric connection.
//!
//! The client connects to the router, answers the unit-type handshake
//! (including transparent UUID regeneration on collision), and runs a
//! receiver thread dispatching framed messages to registered callbacks.
//! All sends go through [`UnitClient::notify_host`] and are serialized by
//! a stream mutex.

use crate::net::frame::{
    encode_frame, extract_frames, PackageType, UnitDefinition, UnitType,
};
use crate::net::{FrameCallback, POLL_TIMEOUT_MS, RECEIVE_BUFFER_SIZE};
use crate::plan::ClientUuid;
use parking_lot::{Condvar, Mutex, RwLock};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

struct ClientShared {
    write_stream: Mutex<TcpStream>,
    uuid: AtomicU64,
    unit_type: UnitType,
    pretty_name: String,
    callbacks: RwLock<HashMap<PackageType, FrameCallback>>,
    running: AtomicBool,
    closed: Mutex<bool>,
    closed_cv: Condvar,
}

/// A framed-message connection from a unit to the router.
pub struct UnitClient {
    shared: Arc<ClientShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UnitClient {
    /// Connect and generate a random client UUID. Callbacks must be
    /// installed before [`start`](Self::start).
    pub fn connect(
        ip: &str,
        port: u16,
        unit_type: UnitType,
        pretty_name: &str,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect((ip, port))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(POLL_TIMEOUT_MS)))?;
        info!(ip, port, name = pretty_name, "connected to router");
        Ok(Self {
            shared: Arc::new(ClientShared {
                write_stream: Mutex::new(stream.try_clone()?),
                uuid: AtomicU64::new(rand::thread_rng().next_u64()),
                unit_type,
                pretty_name: pretty_name.to_string(),
                callbacks: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                closed: Mutex::new(false),
                closed_cv: Condvar::new(),
            }),
            receiver: Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> ClientUuid {
        self.shared.uuid.load(Ordering::Acquire)
    }

    pub fn add_callback(&self, package_type: PackageType, callback: FrameCallback) {
        self.shared.callbacks.write().insert(package_type, callback);
    }

    /// Start the receiver thread.
    pub fn start(&self) -> anyhow::Result<()> {
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let stream = self.shared.write_stream.lock().try_clone()?;
        *self.receiver.lock() = Some(thread::spawn(move || receive_loop(&shared, stream)));
        Ok(())
    }

    /// Send raw, already-framed bytes to the router.
    pub fn notify_host(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut stream = self.shared.write_stream.lock();
        stream.write_all(bytes)?;
        Ok(())
    }

    /// Frame and send a payload.
    pub fn send<T: Serialize>(
        &self,
        package_type: PackageType,
        tgt_uuid: ClientUuid,
        payload: &T,
    ) -> anyhow::Result<()> {
        let bytes = encode_frame(package_type, self.uuid(), tgt_uuid, payload)?;
        self.notify_host(&bytes)
    }

    /// Convenience text message (tgt 0 addresses the router itself).
    pub fn text_response(&self, text: &str, tgt_uuid: ClientUuid) -> anyhow::Result<()> {
        self.send(PackageType::Text, tgt_uuid, &text.to_string())
    }

    /// Block until the connection is torn down.
    pub fn wait_until_closed(&self) {
        let mut closed = self.shared.closed.lock();
        while !*closed {
            self.shared.closed_cv.wait(&mut closed);
        }
    }

    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let stream = self.shared.write_stream.lock();
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        let mut closed = self.shared.closed.lock();
        *closed = true;
        self.shared.closed_cv.notify_all();
    }
}

impl Drop for UnitClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn announce(shared: &Arc<ClientShared>) {
    let unit = UnitDefinition {
        unit_type: shared.unit_type,
        pretty_name: shared.pretty_name.clone(),
    };
    let uuid = shared.uuid.load(Ordering::Acquire);
    match encode_frame(PackageType::UpdateUnitType, uuid, 0, &unit) {
        Ok(bytes) => {
            let mut stream = shared.write_stream.lock();
            if let Err(err) = stream.write_all(&bytes) {
                warn!(%err, "failed to announce unit type");
            }
        }
        Err(err) => warn!(%err, "failed to encode unit definition"),
    }
}

fn receive_loop(shared: &Arc<ClientShared>, mut stream: TcpStream) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    let mut unprocessed = 0usize;

    while shared.running.load(Ordering::Acquire) {
        match stream.read(&mut buf[unprocessed..]) {
            Ok(0) => {
                debug!("router closed the connection");
                break;
            }
            Ok(received) => {
                let callbacks = shared.callbacks.read().clone();
                unprocessed = extract_frames(&mut buf, unprocessed + received, |header, payload| {
                    match header.package_type {
                        // Handshake traffic is handled in place so UUID
                        // collisions stay invisible to the application.
                        PackageType::UpdateUnitType => announce(shared),
                        PackageType::UuidCollision => {
                            let fresh = rand::thread_rng().next_u64();
                            warn!(fresh, "router reported uuid collision, regenerating");
                            shared.uuid.store(fresh, Ordering::Release);
                            announce(shared);
                        }
                        other => match callbacks.get(&other) {
                            Some(callback) => callback(header, payload),
                            None => {
                                warn!(package = ?other, "unknown package type, dropping frame");
                            }
                        },
                    }
                });
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(%err, "receive failed, closing connection");
                break;
            }
        }
    }

    let mut closed = shared.closed.lock();
    *closed = true;
    shared.closed_cv.notify_all();
}
