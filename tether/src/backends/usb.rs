//! USB backend: periodic scan with mark-and-sweep garbage collection.
//!
//! Platform enumeration lives behind [`UsbEnumerator`]; this module
//! owns the scan cadence and the teardown of unplugged devices. Every
//! still-present device is marked each cycle and anything unmarked at
//! cycle end is kicked, which bounds teardown latency to one interval.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::hub::HubHandle;
use crate::transport::{Connection, ConnectionState, Transport, TransportKind, abort_reconnect};

/// One enumerated bridge-capable device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// Stable path-like identifier for the physical port.
    pub devpath: String,
    /// Device serial, used as the transport serial.
    pub serial: String,
}

/// Platform USB enumeration and endpoint access.
///
/// Implementations do the interface class/subclass/protocol matching
/// themselves and are expected to track a dead flag per handle so a
/// kicked device fails fast on I/O.
pub trait UsbEnumerator: Send + 'static {
    /// Lists the currently present devices.
    fn scan(&mut self) -> Vec<UsbDeviceInfo>;

    /// Opens the bulk endpoints of a previously scanned device.
    fn open(&mut self, info: &UsbDeviceInfo) -> io::Result<Box<dyn Connection>>;
}

struct Tracked {
    devpath: String,
    transport: Arc<Transport>,
    mark: bool,
}

/// Handle to the scanner thread.
#[derive(Debug)]
pub struct UsbScanner {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl UsbScanner {
    /// Stops the scan loop and waits for its thread. Already-attached
    /// transports stay up until their connections break.
    pub fn shutdown(mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Starts the scan loop with the given cycle interval.
pub fn start(
    hub: HubHandle,
    enumerator: impl UsbEnumerator,
    interval: Duration,
) -> io::Result<UsbScanner> {
    let (stop, stop_rx) = mpsc::channel();
    let thread = thread::Builder::new()
        .name("usb-scan".to_owned())
        .spawn(move || scan_loop(&hub, enumerator, interval, &stop_rx))?;
    Ok(UsbScanner {
        stop,
        thread: Some(thread),
    })
}

fn scan_loop(
    hub: &HubHandle,
    mut enumerator: impl UsbEnumerator,
    interval: Duration,
    stop: &Receiver<()>,
) {
    let mut tracked: Vec<Tracked> = Vec::new();
    loop {
        scan_once(hub, &mut enumerator, &mut tracked);
        match stop.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("usb scanner stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// One scan cycle: mark survivors, attach newcomers, sweep the rest.
fn scan_once(hub: &HubHandle, enumerator: &mut impl UsbEnumerator, tracked: &mut Vec<Tracked>) {
    for info in enumerator.scan() {
        let reopen = match tracked.iter_mut().find(|t| t.devpath == info.devpath) {
            Some(entry) if entry.transport.state() != ConnectionState::Offline => {
                entry.mark = true;
                continue;
            }
            // The transport died but the devpath is still present: the
            // device dropped and returned within one interval.
            Some(_) => true,
            None => false,
        };
        if reopen {
            tracked.retain(|t| t.devpath != info.devpath);
        }

        match enumerator.open(&info) {
            Ok(conn) => {
                match hub.register(
                    conn,
                    TransportKind::Usb,
                    Some(info.serial.clone()),
                    Some(info.devpath.clone()),
                    abort_reconnect(),
                ) {
                    Ok(transport) => {
                        info!(devpath = %info.devpath, serial = %info.serial, "usb device attached");
                        tracked.push(Tracked {
                            devpath: info.devpath,
                            transport,
                            mark: true,
                        });
                    }
                    Err(e) => {
                        warn!(devpath = %info.devpath, error = %e, "failed to register usb device");
                    }
                }
            }
            Err(e) => warn!(devpath = %info.devpath, error = %e, "failed to open usb device"),
        }
    }

    // Sweep: anything unmarked disappeared since the last cycle.
    tracked.retain_mut(|entry| {
        if entry.mark {
            entry.mark = false;
            true
        } else {
            debug!(devpath = %entry.devpath, "usb device removed");
            entry.transport.kick();
            false
        }
    });
}
