//! TCP backend: accept loop for inbound peers, dialer for outbound.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::hub::HubHandle;
use crate::transport::{
    Connection, ReconnectDecision, ReconnectPolicy, TransportKind, abort_reconnect,
};

/// A [`Connection`] over a TCP socket.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    /// Wraps a connected socket, disabling Nagle for packet latency.
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self { stream }
    }
}

impl Connection for TcpConnection {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Handle to a running accept loop.
#[derive(Debug)]
pub struct TcpServer {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Stops the accept loop and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Poke the listener so the blocking accept returns.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Starts an accept loop on `port`. Every accepted socket becomes a
/// transport with a synthesized serial and no reconnection (the peer
/// redials if it still cares).
pub fn spawn_listener(hub: HubHandle, port: u16) -> io::Result<TcpServer> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name(format!("tcp-listen-{port}"))
        .spawn(move || accept_loop(&hub, port, &flag))?;
    Ok(TcpServer {
        port,
        stop,
        thread: Some(thread),
    })
}

fn accept_loop(hub: &HubHandle, port: u16, stop: &AtomicBool) {
    let listener = loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => break listener,
            Err(e) if unrecoverable(&e) => {
                error!(port, error = %e, "cannot listen");
                return;
            }
            Err(e) => {
                debug!(port, error = %e, "cannot bind socket yet");
                thread::sleep(Duration::from_secs(1));
            }
        }
    };
    info!(port, "listening");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                debug!(%peer, "new connection");
                let conn = TcpConnection::new(stream);
                if let Err(e) = hub.register(
                    Box::new(conn),
                    TransportKind::LocalTcp,
                    None,
                    None,
                    abort_reconnect(),
                ) {
                    warn!(%peer, error = %e, "failed to register connection");
                }
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                warn!(port, error = %e, "accept failed");
            }
        }
    }
}

/// Bind errors that retrying cannot fix.
fn unrecoverable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported | io::ErrorKind::AddrNotAvailable
    )
}

/// Dials `host:port` on a worker thread; on success the transport is
/// registered under the `host:port` serial with a redialing policy.
pub fn connect(hub: &HubHandle, host: &str, port: u16, kind: TransportKind) {
    let hub = hub.clone();
    let host = host.to_owned();
    let serial = format!("{host}:{port}");
    let spawned = thread::Builder::new()
        .name(format!("tcp-dial-{serial}"))
        .spawn(move || match TcpStream::connect((host.as_str(), port)) {
            Ok(stream) => {
                let policy = redial_policy(host.clone(), port);
                let conn = TcpConnection::new(stream);
                if let Err(e) = hub.register(Box::new(conn), kind, Some(serial.clone()), None, policy)
                {
                    warn!(serial, error = %e, "failed to register dialed transport");
                }
            }
            Err(e) => {
                warn!(serial, error = %e, "dial failed");
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn dialer");
    }
}

/// One redial per connection break; abort once the endpoint is gone.
fn redial_policy(host: String, port: u16) -> ReconnectPolicy {
    Arc::new(move |_t| match TcpStream::connect((host.as_str(), port)) {
        Ok(stream) => ReconnectDecision::Retry(Box::new(TcpConnection::new(stream))),
        Err(_) => ReconnectDecision::Abort,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_connection_roundtrip_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let conn = TcpConnection::new(stream);
            let mut buf = [0u8; 4];
            let mut read = 0;
            while read < 4 {
                read += conn.read(&mut buf[read..]).unwrap();
            }
            assert_eq!(&buf, b"ping");
            assert_eq!(conn.write(b"pong").unwrap(), 4);
        });

        let conn = TcpConnection::new(TcpStream::connect(addr).unwrap());
        assert_eq!(conn.write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += conn.read(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"pong");
        server.join().unwrap();

        // After shutdown, reads observe EOF.
        conn.shutdown();
        assert_eq!(conn.read(&mut buf).unwrap_or(0), 0);
    }
}
