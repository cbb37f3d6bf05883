//! Table-driven service dispatch.
//!
//! Maps an inbound service request string to either a built-in channel
//! (sink/source), a subprocess, a device node, or an installed hook.
//! Dispatch is prefix/exact match over a fixed order; the first match
//! wins and there is no backtracking.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::services::{self, ServiceStream, shell};
use crate::transport::Transport;

/// What a routed request produced.
#[derive(Debug)]
pub enum Routed {
    /// A byte sink with the given budget (diagnostic).
    Sink(u64),
    /// A zero-block source with the given budget (diagnostic).
    Source(u64),
    /// A raw byte stream to bridge into the channel graph.
    Stream(ServiceStream),
}

/// Admission predicate consulted before privileged services dispatch.
pub type AdmissionFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// A blocking handler given one end of a socket pair on its own thread.
pub type WorkerHook = Arc<dyn Fn(UnixStream, &Arc<Transport>) + Send + Sync>;

/// Daemon-restart style requests delegated to the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartRequest {
    /// Restart with elevated privileges.
    Root,
    /// Restart with privileges dropped.
    Unroot,
    /// Restart listening on this TCP port.
    Tcp(u16),
    /// Restart listening on USB.
    Usb,
}

/// Installable handlers for services whose payload protocols live
/// outside the core. A missing hook means "no handler": the request is
/// refused with an immediate close, never a hang.
#[derive(Default)]
pub struct ServiceHooks {
    /// `sync:` file synchronization worker.
    pub file_sync: Option<WorkerHook>,
    /// `framebuffer:` capture worker.
    pub framebuffer: Option<WorkerHook>,
    /// `jdwp:<pid>` debugger attach; returns the debug stream.
    pub jdwp_connect: Option<Box<dyn Fn(u32) -> io::Result<ServiceStream> + Send + Sync>>,
    /// `track-jdwp` debugger process tracker worker.
    pub jdwp_tracker: Option<WorkerHook>,
    /// `reverse:<spec>` reverse-forward setup; `None` refuses the spec.
    pub reverse: Option<Box<dyn Fn(&str, &Arc<Transport>) -> Option<ServiceStream> + Send + Sync>>,
    /// `reboot:<target>`.
    pub reboot: Option<Box<dyn Fn(&str) -> io::Result<ServiceStream> + Send + Sync>>,
    /// `root:`/`unroot:`/`tcpip:<port>`/`usb:` restarts.
    pub restart: Option<Box<dyn Fn(RestartRequest) -> io::Result<ServiceStream> + Send + Sync>>,
    /// `remount:`/`backup:`/`restore:` maintenance commands, passed the
    /// service name and its argument tail.
    pub maintenance: Option<Box<dyn Fn(&str, &str) -> io::Result<ServiceStream> + Send + Sync>>,
}

impl std::fmt::Debug for ServiceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHooks")
            .field("file_sync", &self.file_sync.is_some())
            .field("framebuffer", &self.framebuffer.is_some())
            .field("jdwp_connect", &self.jdwp_connect.is_some())
            .field("jdwp_tracker", &self.jdwp_tracker.is_some())
            .field("reverse", &self.reverse.is_some())
            .field("reboot", &self.reboot.is_some())
            .field("restart", &self.restart.is_some())
            .field("maintenance", &self.maintenance.is_some())
            .finish()
    }
}

/// The dispatcher: fixed routing table plus admission policy.
pub struct ServiceRouter {
    admission: AdmissionFn,
    hooks: ServiceHooks,
}

impl std::fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl ServiceRouter {
    /// A router with the given hooks and a default-allow admission
    /// policy.
    pub fn new(hooks: ServiceHooks) -> Self {
        Self {
            admission: Box::new(|_| true),
            hooks,
        }
    }

    /// Replaces the admission predicate. A restricted operating mode
    /// installs a deny-by-default policy here.
    pub fn with_admission(mut self, admission: AdmissionFn) -> Self {
        self.admission = admission;
        self
    }

    fn allowed(&self, name: &str) -> bool {
        let ok = (self.admission)(name);
        if !ok {
            warn!(service = name, "admission predicate refused service");
        }
        ok
    }

    /// Resolves a service request for `transport`.
    ///
    /// `None` means no handler: unknown name, malformed argument, or
    /// admission refusal. The multiplexer answers with a close.
    pub fn route(&self, name: &str, transport: &Arc<Transport>) -> Option<Routed> {
        debug!(transport = %transport.serial(), service = name, "routing service request");

        // Channel-backed diagnostics and trackers come first, then the
        // stream-backed table; first match wins.
        if name == "track-jdwp" {
            return self.worker_hook("track-jdwp", self.hooks.jdwp_tracker.clone(), transport);
        }
        if let Some(rest) = name.strip_prefix("sink:") {
            return rest.parse::<u64>().ok().map(Routed::Sink);
        }
        if let Some(rest) = name.strip_prefix("source:") {
            return rest.parse::<u64>().ok().map(Routed::Source);
        }
        if name.starts_with("framebuffer:") {
            return self.worker_hook("framebuffer", self.hooks.framebuffer.clone(), transport);
        }
        if let Some(rest) = name.strip_prefix("remount:") {
            return self.maintenance("remount", rest);
        }
        if let Some(rest) = name.strip_prefix("reboot:") {
            if !self.allowed("reboot") {
                return None;
            }
            let hook = self.hooks.reboot.as_ref()?;
            return stream_or_log("reboot", hook(rest));
        }
        if name.starts_with("root:") {
            return self.restart("root", RestartRequest::Root);
        }
        if name.starts_with("unroot:") {
            return self.restart("unroot", RestartRequest::Unroot);
        }
        if let Some(rest) = name.strip_prefix("backup:") {
            return self.maintenance("backup", rest);
        }
        if name.starts_with("restore:") {
            return self.maintenance("restore", "");
        }
        if let Some(rest) = name.strip_prefix("tcpip:") {
            // Malformed port: reject before consulting anything else.
            let port = rest.parse::<u16>().ok()?;
            return self.restart("tcpip", RestartRequest::Tcp(port));
        }
        if name.starts_with("usb:") {
            return self.restart("usb", RestartRequest::Usb);
        }
        if let Some(rest) = name.strip_prefix("dev:") {
            return stream_or_log("dev", services::open_device(rest, false));
        }
        if let Some(rest) = name.strip_prefix("dev-raw:") {
            return stream_or_log("dev-raw", services::open_device(rest, true));
        }
        if let Some(rest) = name.strip_prefix("jdwp:") {
            let pid = rest.parse::<u32>().ok()?;
            let hook = self.hooks.jdwp_connect.as_ref()?;
            return stream_or_log("jdwp", hook(pid));
        }
        if let Some(rest) = name.strip_prefix("shell") {
            let request = shell::parse(rest)?;
            return stream_or_log("shell", shell::spawn(&request));
        }
        if let Some(rest) = name.strip_prefix("exec:") {
            let request = shell::ShellRequest {
                mode: shell::SubprocessMode::Raw,
                protocol: shell::StreamProtocol::None,
                term: "dumb".to_owned(),
                command: rest.to_owned(),
            };
            return stream_or_log("exec", shell::spawn(&request));
        }
        if name.starts_with("sync:") {
            return self.worker_hook("sync", self.hooks.file_sync.clone(), transport);
        }
        if let Some(rest) = name.strip_prefix("reverse:") {
            let hook = self.hooks.reverse.as_ref()?;
            return hook(rest, transport).map(Routed::Stream);
        }
        if name == "reconnect" {
            let t = Arc::clone(transport);
            let stream = services::spawn_worker("reconnect", move |mut sock| {
                let _ = sock.write_all(b"done");
                t.kick();
            });
            return stream_or_log("reconnect", stream);
        }
        if name == "spin" {
            if !self.allowed("spin") {
                return None;
            }
            let stream = services::spawn_worker("spin", |mut sock| {
                let _ = sock.write_all(b"spinning\n");
                loop {
                    std::thread::park();
                }
            });
            return stream_or_log("spin", stream);
        }

        debug!(service = name, "no handler for service");
        None
    }

    /// Admission-gated dispatch into the restart hook.
    fn restart(&self, gate: &str, request: RestartRequest) -> Option<Routed> {
        if !self.allowed(gate) {
            return None;
        }
        let hook = self.hooks.restart.as_ref()?;
        stream_or_log(gate, hook(request))
    }

    /// Admission-gated dispatch into the maintenance hook.
    fn maintenance(&self, service: &str, args: &str) -> Option<Routed> {
        if !self.allowed(service) {
            return None;
        }
        let hook = self.hooks.maintenance.as_ref()?;
        stream_or_log(service, hook(service, args))
    }

    /// Spawns a worker-thread hook over a socket pair.
    fn worker_hook(
        &self,
        label: &'static str,
        hook: Option<WorkerHook>,
        transport: &Arc<Transport>,
    ) -> Option<Routed> {
        let hook = hook?;
        let t = Arc::clone(transport);
        stream_or_log(
            label,
            services::spawn_worker(label, move |sock| hook(sock, &t)),
        )
    }
}

/// Converts a handler result into a routed stream, logging failures.
fn stream_or_log(label: &str, result: io::Result<ServiceStream>) -> Option<Routed> {
    match result {
        Ok(stream) => Some(Routed::Stream(stream)),
        Err(e) => {
            warn!(service = label, error = %e, "service handler failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;
    use crate::transport::{TransportKind, abort_reconnect};

    fn test_transport() -> Arc<Transport> {
        let (tx, _rx) = mpsc::channel();
        Transport::new(
            1,
            "router-test".to_owned(),
            TransportKind::LocalTcp,
            None,
            abort_reconnect(),
            tx,
        )
    }

    #[test]
    fn sink_and_source_parse_budgets() {
        let router = ServiceRouter::new(ServiceHooks::default());
        let t = test_transport();

        assert!(matches!(router.route("sink:1024", &t), Some(Routed::Sink(1024))));
        assert!(matches!(
            router.route("source:100", &t),
            Some(Routed::Source(100))
        ));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let router = ServiceRouter::new(ServiceHooks::default());
        let t = test_transport();

        assert!(router.route("sink:banana", &t).is_none());
        assert!(router.route("sink:", &t).is_none());
        assert!(router.route("sink:-1", &t).is_none());
        assert!(router.route("source:1e3", &t).is_none());
        assert!(router.route("jdwp:pid", &t).is_none());
        assert!(router.route("tcpip:notaport", &t).is_none());
    }

    #[test]
    fn unknown_service_is_unrouted() {
        let router = ServiceRouter::new(ServiceHooks::default());
        let t = test_transport();
        assert!(router.route("flurble:1", &t).is_none());
    }

    #[test]
    fn missing_hook_is_unrouted() {
        let router = ServiceRouter::new(ServiceHooks::default());
        let t = test_transport();
        assert!(router.route("sync:", &t).is_none());
        assert!(router.route("track-jdwp", &t).is_none());
        assert!(router.route("jdwp:42", &t).is_none());
    }

    #[test]
    fn admission_gates_privileged_services() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = ServiceHooks {
            restart: Some(Box::new(|_| {
                Err(io::Error::other("restart hook should not run"))
            })),
            ..ServiceHooks::default()
        };
        let gate_calls = Arc::clone(&calls);
        let router = ServiceRouter::new(hooks).with_admission(Box::new(move |_| {
            gate_calls.fetch_add(1, Ordering::SeqCst);
            false
        }));
        let t = test_transport();

        assert!(router.route("root:", &t).is_none());
        assert!(router.route("tcpip:5555", &t).is_none());
        assert!(router.route("usb:", &t).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn admission_does_not_gate_plain_services() {
        let router =
            ServiceRouter::new(ServiceHooks::default()).with_admission(Box::new(|_| false));
        let t = test_transport();
        // Unprivileged diagnostics still route under a deny-all policy.
        assert!(matches!(router.route("sink:16", &t), Some(Routed::Sink(16))));
    }

    #[test]
    fn worker_hook_gets_a_live_stream() {
        let hooks = ServiceHooks {
            file_sync: Some(Arc::new(|mut sock: UnixStream, _t| {
                use std::io::Write;
                let _ = sock.write_all(b"SYNC");
            })),
            ..ServiceHooks::default()
        };
        let router = ServiceRouter::new(hooks);
        let t = test_transport();

        let Some(Routed::Stream(stream)) = router.route("sync:", &t) else {
            panic!("expected a stream");
        };
        let (mut reader, _writer, _closer) = stream.split();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"SYNC");
    }
}
