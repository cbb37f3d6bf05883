//! Transport lifecycle: one remote endpoint's connection state machine,
//! feature set, identity matching, disconnect notification, and the
//! reader/writer pumps that move packets over its connection.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::{fmt, mem, thread};

use tether_proto::{INITIAL_MAX_PAYLOAD, Packet, read_packet, write_packet};
use tracing::{debug, trace, warn};

use crate::banner;
use crate::channel::ChannelTable;
use crate::error::{Error, Result};
use crate::hub::Event;

/// A raw ordered byte stream bound to one physical link.
///
/// Methods take `&self` so one reader thread and one writer thread can
/// drive the two directions concurrently. [`Connection::shutdown`] is
/// the kill switch: it must be callable from any thread, idempotent,
/// and must fail any in-flight or future read/write.
pub trait Connection: Send + Sync + 'static {
    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning how many bytes were consumed.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Severs the link.
    fn shutdown(&self);
}

/// Adapts a [`Connection`] to `std::io::Read` for the packet decoder.
struct ConnReader<'a>(&'a dyn Connection);

impl io::Read for ConnReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Adapts a [`Connection`] to `std::io::Write` for the packet encoder.
struct ConnWriter<'a>(&'a dyn Connection);

impl io::Write for ConnWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection established, handshake not yet complete.
    Connecting,
    /// Handshake received, waiting for authentication to finish.
    Authorizing,
    /// Authentication failed or awaiting user approval.
    Unauthorized,
    /// No live connection. Terminal unless a reconnect supplies one.
    Offline,
    /// Online, remote is in its bootloader.
    Bootloader,
    /// Online, remote is a regular device.
    Device,
    /// Online, remote is a host.
    Host,
    /// Online, remote is in recovery mode.
    Recovery,
    /// Online, remote is in rescue mode.
    Rescue,
    /// Online, remote is sideloading.
    Sideload,
}

impl ConnectionState {
    /// True for every state in which the remote can service requests.
    pub fn is_online(self) -> bool {
        matches!(
            self,
            Self::Bootloader
                | Self::Device
                | Self::Host
                | Self::Recovery
                | Self::Rescue
                | Self::Sideload
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Authorizing => "authorizing",
            Self::Unauthorized => "unauthorized",
            Self::Offline => "offline",
            Self::Bootloader => "bootloader",
            Self::Device => "device",
            Self::Host => "host",
            Self::Recovery => "recovery",
            Self::Rescue => "rescue",
            Self::Sideload => "sideload",
        };
        f.write_str(name)
    }
}

/// Which backend produced a transport's connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// USB bulk endpoints.
    Usb,
    /// Accepted or dialed TCP socket.
    LocalTcp,
    /// Accepted AF_VSOCK socket.
    LocalVsock,
    /// Endpoint resolved by the discovery subsystem.
    Discovered,
}

impl TransportKind {
    /// True for network-backed transports, which support address
    /// matching in [`Transport::matches_target`].
    pub fn is_local(self) -> bool {
        !matches!(self, Self::Usb)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Usb => "usb",
            Self::LocalTcp => "tcp",
            Self::LocalVsock => "vsock",
            Self::Discovered => "discovered",
        };
        f.write_str(name)
    }
}

/// Outcome of a reconnect policy when a connection breaks.
pub enum ReconnectDecision {
    /// Re-arm the transport with this fresh connection.
    Retry(Box<dyn Connection>),
    /// Give up; the transport goes offline and is destroyed.
    Abort,
}

impl fmt::Debug for ReconnectDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(_) => f.write_str("Retry(..)"),
            Self::Abort => f.write_str("Abort"),
        }
    }
}

/// Decides whether a broken transport gets a fresh connection.
///
/// Runs on a worker thread, never on the event loop, so it may block
/// (e.g. to redial).
pub type ReconnectPolicy = Arc<dyn Fn(&Arc<Transport>) -> ReconnectDecision + Send + Sync>;

/// A policy that never retries. Accepted sockets use this: the peer
/// redials if it still cares.
pub fn abort_reconnect() -> ReconnectPolicy {
    Arc::new(|_| ReconnectDecision::Abort)
}

type DisconnectFn = Box<dyn FnOnce(&Transport) + Send>;

#[derive(Default)]
struct DisconnectList {
    next_token: u64,
    entries: Vec<(u64, DisconnectFn)>,
}

/// The live link: connection plus the outbound packet queue feeding the
/// writer thread.
struct Link {
    conn: Arc<dyn Connection>,
    tx: Sender<Packet>,
}

/// One remote endpoint: state machine, feature set, identity, and the
/// multiplexed channels riding on its connection.
pub struct Transport {
    id: u64,
    serial: String,
    kind: TransportKind,
    devpath: Option<String>,
    state: Mutex<ConnectionState>,
    features: Mutex<HashSet<String>>,
    product: Mutex<String>,
    model: Mutex<String>,
    device: Mutex<String>,
    max_payload: AtomicUsize,
    kicked: AtomicBool,
    link_epoch: AtomicU64,
    authorized: AtomicBool,
    pending_banner: Mutex<Option<String>>,
    auth_token: Mutex<Option<Vec<u8>>>,
    link: Mutex<Option<Link>>,
    disconnects: Mutex<DisconnectList>,
    reconnect: ReconnectPolicy,
    channels: Mutex<ChannelTable>,
    events: Sender<Event>,
    weak_self: Weak<Transport>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub(crate) fn new(
        id: u64,
        serial: String,
        kind: TransportKind,
        devpath: Option<String>,
        reconnect: ReconnectPolicy,
        events: Sender<Event>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            serial,
            kind,
            devpath,
            state: Mutex::new(ConnectionState::Connecting),
            features: Mutex::new(HashSet::new()),
            product: Mutex::new(String::new()),
            model: Mutex::new(String::new()),
            device: Mutex::new(String::new()),
            max_payload: AtomicUsize::new(INITIAL_MAX_PAYLOAD),
            kicked: AtomicBool::new(false),
            link_epoch: AtomicU64::new(0),
            authorized: AtomicBool::new(false),
            pending_banner: Mutex::new(None),
            auth_token: Mutex::new(None),
            link: Mutex::new(None),
            disconnects: Mutex::new(DisconnectList::default()),
            reconnect,
            channels: Mutex::new(ChannelTable::new()),
            events,
            weak_self: weak.clone(),
        })
    }

    /// Registry-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Serial string identifying the remote endpoint.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Backend kind.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Stable device path, when the backend has one (USB).
    pub fn devpath(&self) -> Option<&str> {
        self.devpath.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut guard = lock(&self.state);
        trace!(serial = %self.serial, from = %*guard, to = %state, "state transition");
        *guard = state;
    }

    /// True when the remote can service requests.
    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Product name parsed from the banner.
    pub fn product(&self) -> String {
        lock(&self.product).clone()
    }

    /// Model parsed from the banner.
    pub fn model(&self) -> String {
        lock(&self.model).clone()
    }

    /// Device name parsed from the banner.
    pub fn device(&self) -> String {
        lock(&self.device).clone()
    }

    /// Snapshot of the negotiated feature set.
    pub fn features(&self) -> HashSet<String> {
        lock(&self.features).clone()
    }

    /// O(1) membership test on the feature set.
    pub fn has_feature(&self, name: &str) -> bool {
        lock(&self.features).contains(name)
    }

    /// Replaces the feature set from a comma-separated list.
    ///
    /// Duplicates collapse; an empty string clears the set.
    pub fn set_features(&self, serialized: &str) {
        let set: HashSet<String> = serialized
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
            .collect();
        *lock(&self.features) = set;
    }

    /// Applies a peer banner: product metadata, feature set, and the
    /// online state it reports. Malformed banners leave fields empty
    /// but still transition state.
    pub fn on_banner(&self, raw: &str) {
        let parsed = banner::parse(raw);
        *lock(&self.product) = parsed.product;
        *lock(&self.model) = parsed.model;
        *lock(&self.device) = parsed.device;
        self.set_features(&parsed.features.join(","));
        self.set_state(parsed.state);
    }

    /// Negotiated maximum payload for one packet on this transport.
    pub fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_payload(&self, limit: usize) {
        self.max_payload.store(limit, Ordering::Relaxed);
    }

    pub(crate) fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Relaxed)
    }

    pub(crate) fn set_authorized(&self) {
        self.authorized.store(true, Ordering::Relaxed);
    }

    pub(crate) fn stash_banner(&self, raw: String) {
        *lock(&self.pending_banner) = Some(raw);
    }

    pub(crate) fn take_stashed_banner(&self) -> Option<String> {
        lock(&self.pending_banner).take()
    }

    pub(crate) fn set_auth_token(&self, token: Vec<u8>) {
        *lock(&self.auth_token) = Some(token);
    }

    pub(crate) fn auth_token(&self) -> Option<Vec<u8>> {
        lock(&self.auth_token).clone()
    }

    pub(crate) fn reconnect_policy(&self) -> ReconnectPolicy {
        Arc::clone(&self.reconnect)
    }

    /// The channel table. Only the event loop and its helpers touch
    /// this; the lock is uncontended in practice.
    pub(crate) fn channels(&self) -> std::sync::MutexGuard<'_, ChannelTable> {
        lock(&self.channels)
    }

    /// Matches this transport against a target spec: exact serial,
    /// exact device path, `product:`/`model:`/`device:`-prefixed
    /// metadata, or (network transports only) a bare or
    /// `tcp:`/`vsock:`-prefixed `host[:port]` address.
    pub fn matches_target(&self, target: &str) -> bool {
        if target.is_empty() {
            return false;
        }
        if target == self.serial {
            return true;
        }
        if self.devpath.as_deref() == Some(target) {
            return true;
        }
        for (prefix, value) in [
            ("product:", self.product()),
            ("model:", self.model()),
            ("device:", self.device()),
        ] {
            if let Some(rest) = target.strip_prefix(prefix) {
                return !value.is_empty() && rest == value;
            }
        }
        self.kind.is_local() && self.matches_address(target)
    }

    /// Address matching against a `host:port` serial. Rejects unknown
    /// protocol prefixes, empty and non-numeric ports, and port
    /// mismatches.
    fn matches_address(&self, target: &str) -> bool {
        let Some((host, port_str)) = self.serial.rsplit_once(':') else {
            return false;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            return false;
        };
        let stripped = target
            .strip_prefix("tcp:")
            .or_else(|| target.strip_prefix("vsock:"))
            .unwrap_or(target);
        if stripped == host {
            return true;
        }
        match stripped.rsplit_once(':') {
            Some((h, p)) if h == host && !p.is_empty() => {
                p.parse::<u16>().map(|parsed| parsed == port).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Registers a callback invoked exactly once when this transport is
    /// destroyed. Returns a token for [`Transport::remove_disconnect`].
    pub fn add_disconnect(&self, f: impl FnOnce(&Transport) + Send + 'static) -> u64 {
        let mut guard = lock(&self.disconnects);
        let token = guard.next_token;
        guard.next_token += 1;
        guard.entries.push((token, Box::new(f)));
        token
    }

    /// Unregisters a disconnect callback before it fires.
    pub fn remove_disconnect(&self, token: u64) {
        let mut guard = lock(&self.disconnects);
        guard.entries.retain(|(t, _)| *t != token);
    }

    /// Fires every registered disconnect callback once and clears the
    /// registry. Safe with zero listeners; a second call is a no-op.
    pub fn run_disconnects(&self) {
        let entries = {
            let mut guard = lock(&self.disconnects);
            mem::take(&mut guard.entries)
        };
        // Lock released: a listener may re-enter (e.g. to inspect the
        // registry) without deadlocking.
        for (_, f) in entries {
            f(self);
        }
    }

    /// Queues a packet for the writer thread.
    pub(crate) fn send_packet(&self, packet: Packet) -> Result<()> {
        let guard = lock(&self.link);
        match guard.as_ref() {
            Some(link) => link.tx.send(packet).map_err(|_| Error::Offline),
            None => Err(Error::Offline),
        }
    }

    /// Arms the transport with a connection and starts its reader and
    /// writer pumps. Resets kick state: used for both first attach and
    /// reconnect.
    pub(crate) fn attach(self: &Arc<Self>, conn: Box<dyn Connection>) -> io::Result<()> {
        let conn: Arc<dyn Connection> = Arc::from(conn);
        let (tx, rx) = mpsc::channel::<Packet>();
        {
            let mut guard = lock(&self.link);
            *guard = Some(Link {
                conn: Arc::clone(&conn),
                tx,
            });
        }
        // The epoch fences off pump threads of a previous link: a stale
        // thread waking up after a reconnect must not kick the fresh one.
        let epoch = self.link_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.kicked.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);

        let writer_conn = Arc::clone(&conn);
        let writer_self = Arc::clone(self);
        thread::Builder::new()
            .name(format!("link-out-{}", self.serial))
            .spawn(move || {
                for packet in rx {
                    let max = writer_self.max_payload();
                    if let Err(e) = write_packet(&mut ConnWriter(&*writer_conn), &packet, max) {
                        if writer_self.link_epoch.load(Ordering::SeqCst) == epoch {
                            debug!(serial = %writer_self.serial, error = %e, "write failed");
                            writer_self.kick();
                        }
                        break;
                    }
                }
            })?;

        let reader_self = Arc::clone(self);
        thread::Builder::new()
            .name(format!("link-in-{}", self.serial))
            .spawn(move || {
                loop {
                    match read_packet(&mut ConnReader(&*conn), reader_self.max_payload()) {
                        Ok(packet) => {
                            if reader_self
                                .events
                                .send(Event::Received(Arc::clone(&reader_self), packet))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            if reader_self.link_epoch.load(Ordering::SeqCst) == epoch {
                                debug!(serial = %reader_self.serial, error = %e, "read failed");
                                reader_self.kick();
                            }
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Forces this transport offline: severs the connection and
    /// schedules channel teardown on the event loop.
    ///
    /// The universal cancellation primitive: idempotent and safe to
    /// call from any thread, including mid-I/O.
    pub fn kick(&self) {
        if self.kicked.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(serial = %self.serial, "kicking transport");
        self.set_state(ConnectionState::Offline);
        let link = lock(&self.link).take();
        if let Some(link) = link {
            // Dropping `tx` stops the writer; shutdown unblocks the reader.
            link.conn.shutdown();
        }
        if let Some(me) = self.weak_self.upgrade() {
            let _ = self.events.send(Event::ConnectionLost(me));
        }
    }
}


/// Locks a mutex, riding through poisoning.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
