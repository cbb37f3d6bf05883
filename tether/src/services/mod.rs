//! Service-side plumbing: raw byte-stream handles, worker threads, and
//! device-node access.
//!
//! A routed service hands the multiplexer a [`ServiceStream`]: one
//! reader half and one writer half, pumped by dedicated worker threads
//! so nothing blocks the event loop.

pub mod shell;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;

use tracing::debug;

/// Interrupts a service stream's blocked reader/writer when the
/// channel closes first. Streams without one (files, PTY masters)
/// release their workers on the next I/O completion instead.
pub type StreamCloser = Box<dyn Fn() + Send + Sync>;

/// A raw duplex byte stream produced by a service handler.
pub struct ServiceStream {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    closer: Option<StreamCloser>,
}

impl std::fmt::Debug for ServiceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceStream")
    }
}

impl ServiceStream {
    /// Wraps independently owned read and write halves.
    pub fn from_parts(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer: None,
        }
    }

    /// Attaches a closer invoked when the channel shuts down early.
    pub fn with_closer(mut self, closer: StreamCloser) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Wraps a socket, cloning it so both directions run concurrently.
    /// The closer severs the socket to unblock parked workers.
    pub fn from_unix(sock: UnixStream) -> io::Result<Self> {
        let writer = sock.try_clone()?;
        let kill = sock.try_clone()?;
        Ok(Self::from_parts(sock, writer).with_closer(Box::new(move || {
            let _ = kill.shutdown(std::net::Shutdown::Both);
        })))
    }

    /// Wraps an open file (device node).
    pub fn from_file(file: File) -> io::Result<Self> {
        let writer = file.try_clone()?;
        Ok(Self::from_parts(file, writer))
    }

    /// Splits into the worker halves plus the optional closer.
    pub(crate) fn split(
        self,
    ) -> (
        Box<dyn Read + Send>,
        Box<dyn Write + Send>,
        Option<StreamCloser>,
    ) {
        (self.reader, self.writer, self.closer)
    }
}

/// Runs `f` on its own named thread with one end of a socket pair and
/// returns the other end as the service's stream.
///
/// The worker owns its socket; when either side drops, the other
/// observes EOF.
pub fn spawn_worker(
    name: &str,
    f: impl FnOnce(UnixStream) + Send + 'static,
) -> io::Result<ServiceStream> {
    let (ours, theirs) = UnixStream::pair()?;
    debug!(worker = name, "spawning service worker");
    thread::Builder::new()
        .name(format!("svc-{name}"))
        .spawn(move || f(theirs))?;
    ServiceStream::from_unix(ours)
}

/// Opens a device node read/write. With `raw`, the terminal is put
/// into raw mode first.
pub(crate) fn open_device(path: &str, raw: bool) -> io::Result<ServiceStream> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    if raw {
        use nix::sys::termios::{self, SetArg};

        let mut attrs = termios::tcgetattr(&file).map_err(io::Error::from)?;
        termios::cfmakeraw(&mut attrs);
        termios::tcsetattr(&file, SetArg::TCSADRAIN, &attrs).map_err(io::Error::from)?;
    }
    ServiceStream::from_file(file)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn worker_sees_what_we_write() {
        let stream = spawn_worker("echo-test", |mut sock| {
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        })
        .unwrap();

        let (mut reader, mut writer, _closer) = stream.split();
        writer.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn open_device_on_regular_node() {
        use std::io::Seek;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();
        tmp.rewind().unwrap();

        let stream = open_device(tmp.path().to_str().unwrap(), false).unwrap();
        let (mut reader, _writer, _closer) = stream.split();
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn open_device_missing_node_fails() {
        assert!(open_device("/definitely/not/a/node", false).is_err());
    }
}
