//! AF_VSOCK backend: accept loop over a libc-built listener.
//!
//! Built directly on libc; the socket setup is a handful of syscalls
//! and keeps the backend free of an async runtime.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::hub::HubHandle;
use crate::transport::{Connection, TransportKind, abort_reconnect};

/// A [`Connection`] over an accepted vsock socket.
#[derive(Debug)]
pub struct VsockConnection {
    fd: OwnedFd,
}

impl Connection for VsockConnection {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the fd is owned and open; buf bounds are passed through.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: the fd is owned and open; buf bounds are passed through.
        let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn shutdown(&self) {
        // SAFETY: shutting down an owned socket fd; safe to race with I/O.
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

/// Handle to a running vsock accept loop.
#[derive(Debug)]
pub struct VsockServer {
    listener: Arc<OwnedFd>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VsockServer {
    /// Stops the accept loop and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // SAFETY: shutting down the listener unblocks the accept call.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Binds a vsock listener on `port` and starts its accept loop.
pub fn spawn_listener(hub: HubHandle, port: u32) -> io::Result<VsockServer> {
    let listener = Arc::new(bind(port)?);
    info!(port, "listening on vsock");

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let accept_fd = Arc::clone(&listener);
    let thread = thread::Builder::new()
        .name(format!("vsock-listen-{port}"))
        .spawn(move || {
            loop {
                match accept(&accept_fd) {
                    Ok(fd) => {
                        if flag.load(Ordering::SeqCst) {
                            return;
                        }
                        debug!("new vsock connection");
                        let conn = VsockConnection { fd };
                        if let Err(e) = hub.register(
                            Box::new(conn),
                            TransportKind::LocalVsock,
                            None,
                            None,
                            abort_reconnect(),
                        ) {
                            warn!(error = %e, "failed to register vsock connection");
                        }
                    }
                    Err(e) => {
                        if !flag.load(Ordering::SeqCst) {
                            warn!(port, error = %e, "vsock accept failed");
                        }
                        return;
                    }
                }
            }
        })?;

    Ok(VsockServer {
        listener,
        stop,
        thread: Some(thread),
    })
}

/// Creates a vsock listener bound to `port` for any CID.
fn bind(port: u32) -> io::Result<OwnedFd> {
    // SAFETY: standard socket/bind/listen sequence; the fd is wrapped
    // into OwnedFd immediately after creation.
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = OwnedFd::from_raw_fd(fd);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as u16;
        addr.svm_cid = libc::VMADDR_CID_ANY;
        addr.svm_port = port;

        if libc::bind(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        if libc::listen(sock.as_raw_fd(), 8) < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(sock)
    }
}

/// Accepts one connection from the listener.
fn accept(listener: &OwnedFd) -> io::Result<OwnedFd> {
    // SAFETY: accept on a valid listening fd; the result is wrapped
    // into OwnedFd on success.
    unsafe {
        let fd = libc::accept(
            listener.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}
