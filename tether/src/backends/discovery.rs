//! Discovery backend: polls a name-resolution client for service
//! instances and dials the eligible ones.
//!
//! The first fatal error from the primary client switches the
//! subsystem to the fallback client. The transition is one-way for the
//! process lifetime; a later fix to the primary resolver does not
//! reactivate it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::hub::HubHandle;
use crate::transport::TransportKind;

/// A resolved service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Instance name as advertised.
    pub instance: String,
    /// Resolved address.
    pub address: String,
    /// Resolved port.
    pub port: u16,
}

/// Discovery failures, split by whether the next poll can succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Transient; logged and retried next cycle.
    Recoverable(String),
    /// The client is unusable; triggers the fallback switch.
    Fatal(String),
}

/// A name-resolution client.
pub trait DiscoveryClient: Send + 'static {
    /// Returns the currently known service instances.
    fn poll(&mut self) -> Result<Vec<DiscoveredService>, DiscoveryError>;
}

/// Which resolver the subsystem is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// The preferred client.
    Primary,
    /// The secondary client, active after a primary fatal error.
    Fallback,
}

/// Eligibility gate for auto-connecting to a discovered instance
/// (e.g. known-host checks for secure connect).
pub type ConnectGate = Box<dyn Fn(&DiscoveredService) -> bool + Send>;

/// Action taken for each eligible instance.
pub type Connector = Box<dyn Fn(&DiscoveredService) + Send>;

/// Handle to the discovery polling thread.
#[derive(Debug)]
pub struct DiscoverySupervisor {
    stop: Sender<()>,
    fallback_active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DiscoverySupervisor {
    /// The resolver currently in use.
    pub fn mode(&self) -> DiscoveryMode {
        if self.fallback_active.load(Ordering::SeqCst) {
            DiscoveryMode::Fallback
        } else {
            DiscoveryMode::Primary
        }
    }

    /// Stops the polling loop and waits for its thread.
    pub fn shutdown(mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Starts discovery with the default connector: dial every eligible
/// instance not already present in the registry.
pub fn start(
    hub: HubHandle,
    primary: impl DiscoveryClient,
    fallback: impl DiscoveryClient,
    gate: ConnectGate,
    interval: Duration,
) -> io::Result<DiscoverySupervisor> {
    let connector: Connector = Box::new(move |service| {
        let serial = format!("{}:{}", service.address, service.port);
        if hub.registry().by_serial(&serial).is_some() {
            return;
        }
        debug!(instance = %service.instance, serial, "auto-connecting to discovered service");
        super::tcp::connect(&hub, &service.address, service.port, TransportKind::Discovered);
    });
    start_with_connector(primary, fallback, gate, connector, interval)
}

/// Starts discovery with a custom connect action.
pub fn start_with_connector(
    primary: impl DiscoveryClient,
    fallback: impl DiscoveryClient,
    gate: ConnectGate,
    connector: Connector,
    interval: Duration,
) -> io::Result<DiscoverySupervisor> {
    let (stop, stop_rx) = mpsc::channel();
    let fallback_active = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fallback_active);
    let thread = thread::Builder::new()
        .name("discovery".to_owned())
        .spawn(move || poll_loop(primary, fallback, &gate, &connector, interval, &stop_rx, &flag))?;
    Ok(DiscoverySupervisor {
        stop,
        fallback_active,
        thread: Some(thread),
    })
}

fn poll_loop(
    mut primary: impl DiscoveryClient,
    mut fallback: impl DiscoveryClient,
    gate: &ConnectGate,
    connector: &Connector,
    interval: Duration,
    stop: &Receiver<()>,
    fallback_active: &AtomicBool,
) {
    loop {
        let using_fallback = fallback_active.load(Ordering::SeqCst);
        let result = if using_fallback {
            fallback.poll()
        } else {
            primary.poll()
        };

        match result {
            Ok(services) => {
                for service in services {
                    if gate(&service) {
                        connector(&service);
                    } else {
                        debug!(instance = %service.instance, "instance not eligible");
                    }
                }
            }
            Err(DiscoveryError::Recoverable(msg)) => {
                warn!(msg, "recoverable discovery error");
            }
            Err(DiscoveryError::Fatal(msg)) if using_fallback => {
                // The fallback has no further fallback; keep retrying.
                warn!(msg, "fallback resolver error");
            }
            Err(DiscoveryError::Fatal(msg)) => {
                error!(msg, "fatal discovery error, switching to fallback resolver");
                fallback_active.store(true, Ordering::SeqCst);
            }
        }

        match stop.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("discovery stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;

    struct Scripted {
        results: VecDeque<Result<Vec<DiscoveredService>, DiscoveryError>>,
        polls: Arc<AtomicUsize>,
    }

    impl DiscoveryClient for Scripted {
        fn poll(&mut self) -> Result<Vec<DiscoveredService>, DiscoveryError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.results.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn service(instance: &str) -> DiscoveredService {
        DiscoveredService {
            instance: instance.to_owned(),
            address: "192.0.2.1".to_owned(),
            port: 5555,
        }
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn fatal_primary_error_switches_to_fallback_forever() {
        let primary_polls = Arc::new(AtomicUsize::new(0));
        let fallback_polls = Arc::new(AtomicUsize::new(0));
        let primary = Scripted {
            results: VecDeque::from(vec![Err(DiscoveryError::Fatal("bind failed".to_owned()))]),
            polls: Arc::clone(&primary_polls),
        };
        let fallback = Scripted {
            results: VecDeque::new(),
            polls: Arc::clone(&fallback_polls),
        };

        let supervisor = start_with_connector(
            primary,
            fallback,
            Box::new(|_| true),
            Box::new(|_| {}),
            Duration::from_millis(10),
        )
        .unwrap();

        wait_for("fallback switch", || {
            supervisor.mode() == DiscoveryMode::Fallback
        });
        wait_for("fallback polls", || {
            fallback_polls.load(Ordering::SeqCst) >= 3
        });

        // The primary was abandoned after its single fatal poll.
        assert_eq!(primary_polls.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.mode(), DiscoveryMode::Fallback);

        supervisor.shutdown();
    }

    #[test]
    fn recoverable_errors_keep_the_primary() {
        let primary_polls = Arc::new(AtomicUsize::new(0));
        let primary = Scripted {
            results: VecDeque::from(vec![
                Err(DiscoveryError::Recoverable("flaky interface".to_owned())),
                Ok(Vec::new()),
            ]),
            polls: Arc::clone(&primary_polls),
        };
        let fallback = Scripted {
            results: VecDeque::new(),
            polls: Arc::new(AtomicUsize::new(0)),
        };

        let supervisor = start_with_connector(
            primary,
            fallback,
            Box::new(|_| true),
            Box::new(|_| {}),
            Duration::from_millis(10),
        )
        .unwrap();

        wait_for("primary retries", || primary_polls.load(Ordering::SeqCst) >= 3);
        assert_eq!(supervisor.mode(), DiscoveryMode::Primary);

        supervisor.shutdown();
    }

    #[test]
    fn gate_filters_instances_before_connect() {
        let connected: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&connected);

        let primary = Scripted {
            results: VecDeque::from(vec![Ok(vec![service("known"), service("unknown")])]),
            polls: Arc::new(AtomicUsize::new(0)),
        };
        let fallback = Scripted {
            results: VecDeque::new(),
            polls: Arc::new(AtomicUsize::new(0)),
        };

        let supervisor = start_with_connector(
            primary,
            fallback,
            Box::new(|s| s.instance == "known"),
            Box::new(move |s| {
                sink.lock().unwrap().push(s.instance.clone());
            }),
            Duration::from_millis(10),
        )
        .unwrap();

        wait_for("gated connect", || !connected.lock().unwrap().is_empty());
        supervisor.shutdown();

        assert_eq!(*connected.lock().unwrap(), vec!["known".to_owned()]);
    }
}
