//! The composition root: owns the registry, the router, and the
//! single-threaded event loop that serializes all packet dispatch and
//! channel callbacks.
//!
//! Backends register transports from their own threads; everything
//! else flows through the loop's event queue.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tether_proto::{
    AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, Command, MAX_PAYLOAD, Packet, VERSION,
};
use tracing::{debug, info, trace, warn};

use crate::banner::BannerConfig;
use crate::error::{Error, Result};
use crate::mux::Mux;
use crate::registry::TransportRegistry;
use crate::router::ServiceRouter;
use crate::transport::{
    Connection, ConnectionState, ReconnectDecision, ReconnectPolicy, Transport, TransportKind,
};

/// Verifies a signature over a challenge token.
pub type AuthVerifier = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Signs a challenge token received from a peer.
pub type AuthSigner = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Authentication plumbing. The cryptography itself lives outside the
/// core: these callbacks are the narrow interface the state machine
/// drives.
#[derive(Default, Clone)]
pub struct AuthConfig {
    /// Whether peers must authenticate before going online.
    pub required: bool,
    /// Checks `(token, signature)`; absent means accept.
    pub verifier: Option<AuthVerifier>,
    /// Produces a signature when this side is challenged.
    pub signer: Option<AuthSigner>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("required", &self.required)
            .field("verifier", &self.verifier.is_some())
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

/// Top-level configuration for a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// The identity this process advertises at handshake.
    pub banner: BannerConfig,
    /// Authentication policy.
    pub auth: AuthConfig,
}

impl HubConfig {
    /// Host-side defaults: sends the first CNXN, no authentication.
    pub fn host() -> Self {
        Self {
            banner: BannerConfig::host(),
            auth: AuthConfig::default(),
        }
    }

    /// Device-side defaults: answers CNXN, no authentication.
    pub fn device() -> Self {
        Self {
            banner: BannerConfig::device(),
            auth: AuthConfig::default(),
        }
    }
}

/// Everything the event loop reacts to. Worker threads only ever talk
/// to the loop by queueing one of these.
pub(crate) enum Event {
    /// A packet arrived on a transport.
    Received(Arc<Transport>, Packet),
    /// A transport's connection broke or was kicked.
    ConnectionLost(Arc<Transport>),
    /// A reconnect policy produced a fresh connection.
    Reconnected(Arc<Transport>, Box<dyn Connection>),
    /// A reconnect policy gave up; destroy the transport.
    Retire(Arc<Transport>),
    /// An outbound service open requested from outside the loop.
    OpenLocal {
        transport: Arc<Transport>,
        service: String,
        reply: Sender<io::Result<UnixStream>>,
    },
    /// A channel's reader worker produced a chunk.
    ServiceData {
        transport: Arc<Transport>,
        id: u32,
        data: Vec<u8>,
    },
    /// A channel's writer worker flushed an inbound payload.
    Flushed { transport: Arc<Transport>, id: u32 },
    /// A channel's service side terminated.
    ServiceClosed { transport: Arc<Transport>, id: u32 },
    /// Stop the loop.
    Shutdown,
}

struct Shared {
    registry: TransportRegistry,
    config: HubConfig,
    events: Sender<Event>,
    mux: Mux,
}

impl Shared {
    fn send_banner(&self, t: &Arc<Transport>) {
        let payload = self.config.banner.render().into_bytes();
        let _ = t.send_packet(Packet::new(
            Command::Cnxn,
            VERSION,
            u32::try_from(MAX_PAYLOAD).unwrap_or(u32::MAX),
            payload,
        ));
    }
}

/// The bridge core. Construct one per process, take handles where
/// needed, then let [`Hub::run`] own the calling thread.
pub struct Hub {
    shared: Arc<Shared>,
    events_rx: Receiver<Event>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle for registration and outbound opens from any
/// thread.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HubHandle")
    }
}

impl Hub {
    /// Builds a hub from a configuration and a routing table.
    pub fn new(config: HubConfig, router: ServiceRouter) -> Self {
        let (events, events_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            registry: TransportRegistry::new(),
            config,
            events: events.clone(),
            mux: Mux::new(Arc::new(router), events),
        });
        Self { shared, events_rx }
    }

    /// A handle usable from other threads.
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the event loop until [`HubHandle::shutdown`] is called or
    /// every handle is gone. Consumes the hub.
    pub fn run(self) {
        info!(role = %self.shared.config.banner.system_type, "event loop running");
        while let Ok(event) = self.events_rx.recv() {
            match event {
                Event::Received(t, packet) => self.dispatch(&t, packet),
                Event::ConnectionLost(t) => self.on_connection_lost(t),
                Event::Reconnected(t, conn) => self.on_reconnected(&t, conn),
                Event::Retire(t) => self.retire(&t),
                Event::OpenLocal {
                    transport,
                    service,
                    reply,
                } => {
                    let _ = reply.send(self.shared.mux.open_local(&transport, &service));
                }
                Event::ServiceData {
                    transport,
                    id,
                    data,
                } => self.shared.mux.service_data(&transport, id, data),
                Event::Flushed { transport, id } => self.shared.mux.flushed(&transport, id),
                Event::ServiceClosed { transport, id } => {
                    self.shared.mux.service_closed(&transport, id);
                }
                Event::Shutdown => break,
            }
        }
        // Tear down whatever is still registered.
        for t in self.shared.registry.list() {
            t.kick();
            self.shared.mux.close_all(&t);
            self.retire(&t);
        }
        info!("event loop stopped");
    }

    fn dispatch(&self, t: &Arc<Transport>, packet: Packet) {
        trace!(
            serial = %t.serial(),
            command = %packet.command,
            arg0 = packet.arg0,
            arg1 = packet.arg1,
            len = packet.payload.len(),
            "packet",
        );
        match packet.command {
            Command::Cnxn => self.on_cnxn(t, &packet),
            Command::Auth => self.on_auth(t, &packet),
            _ if !t.is_online() => {
                debug!(serial = %t.serial(), command = %packet.command, "stream packet before handshake");
            }
            Command::Open => self.shared.mux.handle_open(t, &packet),
            Command::Okay => self.shared.mux.handle_okay(t, &packet),
            Command::Clse => self.shared.mux.handle_clse(t, &packet),
            Command::Wrte => self.shared.mux.handle_wrte(t, packet),
        }
    }

    /// CNXN: negotiate the payload limit, then either finish the
    /// handshake or start the authentication exchange.
    fn on_cnxn(&self, t: &Arc<Transport>, packet: &Packet) {
        let advertised = packet.arg1 as usize;
        if advertised > 0 {
            t.set_max_payload(advertised.min(MAX_PAYLOAD));
        }
        debug!(
            serial = %t.serial(),
            version = packet.arg0,
            max_payload = t.max_payload(),
            "connection handshake",
        );
        let banner = String::from_utf8_lossy(&packet.payload).into_owned();

        if self.shared.config.auth.required && !t.is_authorized() {
            t.stash_banner(banner);
            t.set_state(ConnectionState::Authorizing);
            self.challenge(t);
        } else {
            self.finish_handshake(t, &banner);
        }
    }

    fn finish_handshake(&self, t: &Arc<Transport>, banner: &str) {
        t.on_banner(banner);
        if !self.shared.config.banner.is_host() {
            // The device side answers with its own identity.
            self.shared.send_banner(t);
        }
        info!(serial = %t.serial(), state = %t.state(), "transport online");
    }

    /// Sends a fresh AUTH challenge token.
    fn challenge(&self, t: &Arc<Transport>) {
        let token = auth_token();
        t.set_auth_token(token.clone());
        let _ = t.send_packet(Packet::new(Command::Auth, AUTH_TOKEN, 0, token));
    }

    fn on_auth(&self, t: &Arc<Transport>, packet: &Packet) {
        match packet.arg0 {
            AUTH_TOKEN => {
                // We are being challenged.
                if let Some(signer) = &self.shared.config.auth.signer {
                    let signature = signer(&packet.payload);
                    let _ = t.send_packet(Packet::new(Command::Auth, AUTH_SIGNATURE, 0, signature));
                } else {
                    warn!(serial = %t.serial(), "challenged but no signer is installed");
                }
            }
            AUTH_SIGNATURE => {
                let token = t.auth_token().unwrap_or_default();
                let accepted = match &self.shared.config.auth.verifier {
                    Some(verifier) => verifier(&token, &packet.payload),
                    None => true,
                };
                if accepted {
                    t.set_authorized();
                    let banner = t.take_stashed_banner().unwrap_or_default();
                    self.finish_handshake(t, &banner);
                } else {
                    warn!(serial = %t.serial(), "signature rejected");
                    t.set_state(ConnectionState::Unauthorized);
                    // Fresh challenge so the peer may try another key.
                    self.challenge(t);
                }
            }
            AUTH_RSAPUBLICKEY => {
                // Key approval flows live outside the core; until one
                // lands the transport stays unauthorized.
                warn!(serial = %t.serial(), "unapproved public key offered");
                t.set_state(ConnectionState::Unauthorized);
            }
            other => {
                debug!(serial = %t.serial(), code = other, "unknown auth subcode");
            }
        }
    }

    /// Channel teardown now; the reconnect decision happens on a worker
    /// thread because policies may dial.
    fn on_connection_lost(&self, t: Arc<Transport>) {
        debug!(serial = %t.serial(), "connection lost");
        self.shared.mux.close_all(&t);

        let events = self.shared.events.clone();
        let policy = t.reconnect_policy();
        let spawned = thread::Builder::new()
            .name(format!("reconnect-{}", t.serial()))
            .spawn(move || match policy(&t) {
                ReconnectDecision::Retry(conn) => {
                    let _ = events.send(Event::Reconnected(t, conn));
                }
                ReconnectDecision::Abort => {
                    let _ = events.send(Event::Retire(t));
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn reconnect worker");
        }
    }

    fn on_reconnected(&self, t: &Arc<Transport>, conn: Box<dyn Connection>) {
        info!(serial = %t.serial(), "reconnecting transport");
        match t.attach(conn) {
            Ok(()) => {
                if self.shared.config.banner.is_host() {
                    self.shared.send_banner(t);
                }
            }
            Err(e) => {
                warn!(serial = %t.serial(), error = %e, "reattach failed");
                self.retire(t);
            }
        }
    }

    /// Destroys a transport: removal from the registry gates the
    /// disconnect listeners so they fire exactly once.
    fn retire(&self, t: &Arc<Transport>) {
        if self.shared.registry.remove(t.id()).is_some() {
            info!(serial = %t.serial(), "transport removed");
            t.run_disconnects();
        }
    }
}

impl HubHandle {
    /// The transport registry.
    pub fn registry(&self) -> &TransportRegistry {
        &self.shared.registry
    }

    /// Registers a new transport over `conn` and starts draining it.
    ///
    /// Connections arriving without a serial get a synthesized
    /// `host-<n>` one. Host-role hubs open the handshake immediately.
    pub fn register(
        &self,
        conn: Box<dyn Connection>,
        kind: TransportKind,
        serial: Option<String>,
        devpath: Option<String>,
        reconnect: ReconnectPolicy,
    ) -> Result<Arc<Transport>> {
        let id = self.shared.registry.reserve_id();
        let serial = serial.unwrap_or_else(|| format!("host-{id}"));
        let t = Transport::new(
            id,
            serial,
            kind,
            devpath,
            reconnect,
            self.shared.events.clone(),
        );
        t.attach(conn)?;
        self.shared.registry.insert(Arc::clone(&t));
        info!(serial = %t.serial(), kind = %kind, "registered transport");
        if self.shared.config.banner.is_host() {
            self.shared.send_banner(&t);
        }
        Ok(t)
    }

    /// Dials `host:port` on a worker thread and registers the resulting
    /// transport with a redialing reconnect policy.
    pub fn connect(&self, host: &str, port: u16) {
        crate::backends::tcp::connect(self, host, port, TransportKind::LocalTcp);
    }

    /// Opens an outbound channel for `service` on `transport` and
    /// returns the local end of the stream. Usable from any thread.
    pub fn open(&self, transport: &Arc<Transport>, service: &str) -> Result<UnixStream> {
        let (reply, reply_rx) = mpsc::channel();
        self.shared
            .events
            .send(Event::OpenLocal {
                transport: Arc::clone(transport),
                service: service.to_owned(),
                reply,
            })
            .map_err(|_| Error::Offline)?;
        let stream = reply_rx.recv().map_err(|_| Error::Offline)??;
        Ok(stream)
    }

    /// Stops the event loop.
    pub fn shutdown(&self) {
        let _ = self.shared.events.send(Event::Shutdown);
    }
}

/// A 16-byte challenge token from the hashed process id and clock.
fn auth_token() -> Vec<u8> {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    let a = h.finish();
    h.write_u64(a);
    let b = h.finish();

    let mut token = Vec::with_capacity(16);
    token.extend_from_slice(&a.to_le_bytes());
    token.extend_from_slice(&b.to_le_bytes());
    token
}
