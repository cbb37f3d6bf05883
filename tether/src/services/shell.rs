//! Subprocess shell service: PTY or pipe-backed, with an optional
//! length-prefixed stream protocol.
//!
//! A shell request looks like `shell[,arg1,arg2,...]:[command]`.
//! Recognized arguments select raw-vs-PTY mode, enable the framed
//! protocol, or override `$TERM`. Unrecognized arguments are ignored
//! so older daemons keep working against newer clients.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nix::pty::openpty;
use nix::unistd::dup;
use tracing::{debug, warn};

use super::ServiceStream;

/// Force a pipe-backed subprocess (no PTY).
pub const ARG_RAW: &str = "raw";
/// Force a PTY-backed subprocess.
pub const ARG_PTY: &str = "pty";
/// Enable the length-prefixed stream protocol.
pub const ARG_PROTOCOL: &str = "v2";

const TERM_PREFIX: &str = "TERM=";
const DEFAULT_TERM: &str = "dumb";

/// Frame id: client-to-process input bytes.
pub const ID_STDIN: u8 = 0;
/// Frame id: process stdout bytes.
pub const ID_STDOUT: u8 = 1;
/// Frame id: process stderr bytes.
pub const ID_STDERR: u8 = 2;
/// Frame id: process exit, one status byte of payload.
pub const ID_EXIT: u8 = 3;
/// Frame id: close the process's stdin.
pub const ID_CLOSE_STDIN: u8 = 4;

/// Ceiling on a single protocol frame payload.
const MAX_FRAME: u32 = 256 * 1024;

/// How the subprocess's stdio is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubprocessMode {
    /// Allocate a PTY; stdout and stderr merge through the master.
    Pty,
    /// Plain pipes, streams kept separate.
    Raw,
}

/// Whether the byte stream is wrapped in length-prefixed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// Raw bytes in both directions.
    None,
    /// `[id u8][len u32 le][payload]` frames carrying stdin, stdout,
    /// stderr, and the exit status as distinct streams.
    LengthPrefixed,
}

/// A parsed shell service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRequest {
    /// PTY or raw subprocess.
    pub mode: SubprocessMode,
    /// Optional framing protocol.
    pub protocol: StreamProtocol,
    /// Value for `$TERM` in PTY mode.
    pub term: String,
    /// Command line; empty means an interactive shell.
    pub command: String,
}

/// Parses the text after the `shell` prefix: `[,arg]*:[command]`.
///
/// Returns `None` when the argument/command delimiter is missing.
/// Defaults: PTY for an empty command, raw otherwise; no protocol;
/// `$TERM` set to `dumb`.
pub fn parse(request: &str) -> Option<ShellRequest> {
    let (args, command) = request.split_once(':')?;

    let mut req = ShellRequest {
        mode: if command.is_empty() {
            SubprocessMode::Pty
        } else {
            SubprocessMode::Raw
        },
        protocol: StreamProtocol::None,
        term: DEFAULT_TERM.to_owned(),
        command: command.to_owned(),
    };

    for arg in args.split(',') {
        if arg.is_empty() {
            continue;
        } else if arg == ARG_RAW {
            req.mode = SubprocessMode::Raw;
        } else if arg == ARG_PTY {
            req.mode = SubprocessMode::Pty;
        } else if arg == ARG_PROTOCOL {
            req.protocol = StreamProtocol::LengthPrefixed;
        } else if let Some(term) = arg.strip_prefix(TERM_PREFIX) {
            req.term = term.to_owned();
        } else {
            // Not an error, to allow for future expansion.
            warn!(argument = arg, "ignoring unknown shell service argument");
        }
    }
    Some(req)
}

/// Spawns the subprocess described by `req` and returns its stream.
pub fn spawn(req: &ShellRequest) -> io::Result<ServiceStream> {
    debug!(mode = ?req.mode, protocol = ?req.protocol, command = %req.command, "starting subprocess");
    match req.protocol {
        StreamProtocol::None => match req.mode {
            SubprocessMode::Raw => spawn_raw(req),
            SubprocessMode::Pty => {
                let (master_read, master_write, child) = spawn_pty(req)?;
                reap(child);
                Ok(ServiceStream::from_parts(master_read, master_write))
            }
        },
        StreamProtocol::LengthPrefixed => spawn_framed(req),
    }
}

/// Builds the command: `/bin/sh -c <cmd>`, or a bare shell when empty.
fn command_for(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    if !command.is_empty() {
        cmd.arg("-c").arg(command);
    }
    cmd
}

/// Pipe mode without framing: the child's stdio is one end of a socket
/// pair, stdout and stderr interleaved, and the other end is the
/// service stream.
fn spawn_raw(req: &ShellRequest) -> io::Result<ServiceStream> {
    let (ours, theirs) = UnixStream::pair()?;
    let fd: OwnedFd = theirs.into();
    let stdin_fd = fd.try_clone()?;
    let stdout_fd = fd.try_clone()?;

    let mut cmd = command_for(&req.command);
    cmd.stdin(Stdio::from(stdin_fd))
        .stdout(Stdio::from(stdout_fd))
        .stderr(Stdio::from(fd));

    let child = cmd.spawn()?;
    reap(child);
    ServiceStream::from_unix(ours)
}

/// PTY mode: the child gets a fresh session with the PTY slave as its
/// controlling terminal; we keep duplicated read/write handles on the
/// master.
fn spawn_pty(req: &ShellRequest) -> io::Result<(File, File, Child)> {
    let pty = openpty(None, None).map_err(io::Error::from)?;
    let slave_raw = pty.slave.as_raw_fd();

    let stdin_fd = dup_fd(&pty.slave, "stdin")?;
    let stdout_fd = dup_fd(&pty.slave, "stdout")?;
    let stderr_fd = dup_fd(&pty.slave, "stderr")?;

    let mut cmd = command_for(&req.command);
    cmd.env("TERM", &req.term);
    cmd.stdin(Stdio::from(stdin_fd))
        .stdout(Stdio::from(stdout_fd))
        .stderr(Stdio::from(stderr_fd));

    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(io::Error::other)?;
            if libc::ioctl(slave_raw, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    // The child owns its copies of the slave now.
    drop(pty.slave);

    let master_read = File::from(dup_fd(&pty.master, "master_read")?);
    let master_write = File::from(pty.master);
    Ok((master_read, master_write, child))
}

/// Length-prefixed protocol: bridge the child's streams into frames
/// over an internal socket pair.
fn spawn_framed(req: &ShellRequest) -> io::Result<ServiceStream> {
    let (ours, theirs) = UnixStream::pair()?;
    let frame_sink = Arc::new(Mutex::new(theirs.try_clone()?));

    match req.mode {
        SubprocessMode::Raw => {
            let mut cmd = command_for(&req.command);
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let mut child = cmd.spawn()?;

            let stdout = child.stdout.take().ok_or_else(no_pipe)?;
            let stderr = child.stderr.take().ok_or_else(no_pipe)?;
            let stdin = child.stdin.take().ok_or_else(no_pipe)?;

            let out_pump = pump_frames(ID_STDOUT, stdout, Arc::clone(&frame_sink));
            let err_pump = pump_frames(ID_STDERR, stderr, Arc::clone(&frame_sink));
            spawn_stdin_decoder(theirs, StdinTarget::Pipe(stdin));
            spawn_exit_reporter(child, vec![out_pump, err_pump], frame_sink);
        }
        SubprocessMode::Pty => {
            let (master_read, master_write, child) = spawn_pty(req)?;
            // Stdout and stderr are already merged by the PTY.
            let out_pump = pump_frames(ID_STDOUT, master_read, Arc::clone(&frame_sink));
            spawn_stdin_decoder(theirs, StdinTarget::Master(master_write));
            spawn_exit_reporter(child, vec![out_pump], frame_sink);
        }
    }
    ServiceStream::from_unix(ours)
}

fn no_pipe() -> io::Error {
    io::Error::other("child spawned without the requested pipe")
}

/// Copies a child output stream into frames tagged with `id`.
fn pump_frames(
    id: u8,
    mut from: impl Read + Send + 'static,
    sink: Arc<Mutex<UnixStream>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match from.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if write_frame(&sink, id, &buf[..n]).is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// Where decoded stdin frames are delivered.
enum StdinTarget {
    Pipe(ChildStdin),
    Master(File),
}

/// Decodes inbound frames: stdin payloads are forwarded to the child,
/// close-stdin drops the handle, anything else is skipped.
fn spawn_stdin_decoder(mut sock: UnixStream, target: StdinTarget) {
    thread::spawn(move || {
        let mut target = Some(target);
        loop {
            let (id, payload) = match read_frame(&mut sock) {
                Ok(frame) => frame,
                Err(_) => return,
            };
            match id {
                ID_STDIN => {
                    let Some(t) = target.as_mut() else { continue };
                    let result = match t {
                        StdinTarget::Pipe(stdin) => stdin.write_all(&payload),
                        StdinTarget::Master(master) => master.write_all(&payload),
                    };
                    if result.is_err() {
                        target = None;
                    }
                }
                ID_CLOSE_STDIN => target = None,
                _ => {}
            }
        }
    });
}

/// Waits for the output pumps and the child, then reports the exit
/// status as the final frame.
fn spawn_exit_reporter(
    mut child: Child,
    pumps: Vec<JoinHandle<()>>,
    sink: Arc<Mutex<UnixStream>>,
) {
    thread::spawn(move || {
        for pump in pumps {
            let _ = pump.join();
        }
        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        let byte = u8::try_from(code).unwrap_or(0xff);
        let _ = write_frame(&sink, ID_EXIT, &[byte]);
    });
}

/// Writes one `[id][len][payload]` frame atomically.
fn write_frame(sink: &Mutex<UnixStream>, id: u8, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    let mut sock = sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut header = [0u8; 5];
    header[0] = id;
    header[1..5].copy_from_slice(&len.to_le_bytes());
    sock.write_all(&header)?;
    sock.write_all(payload)
}

/// Reads one frame; bounds the payload length.
fn read_frame(r: &mut impl Read) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "oversized shell protocol frame",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok((header[0], payload))
}

/// Duplicates an `OwnedFd` with a descriptive error context.
fn dup_fd(fd: &OwnedFd, label: &str) -> io::Result<OwnedFd> {
    dup(fd).map_err(|e| io::Error::other(format!("dup {label}: {e}")))
}

/// Detached wait so exited children do not linger as zombies.
fn reap(mut child: Child) {
    thread::spawn(move || {
        let _ = child.wait();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_pty_for_interactive() {
        let req = parse(":").unwrap();
        assert_eq!(req.mode, SubprocessMode::Pty);
        assert_eq!(req.protocol, StreamProtocol::None);
        assert_eq!(req.term, "dumb");
        assert_eq!(req.command, "");
    }

    #[test]
    fn parse_defaults_raw_for_command() {
        let req = parse(":echo hi").unwrap();
        assert_eq!(req.mode, SubprocessMode::Raw);
        assert_eq!(req.command, "echo hi");
    }

    #[test]
    fn parse_recognized_arguments() {
        let req = parse(",pty,v2,TERM=xterm-256color:ls").unwrap();
        assert_eq!(req.mode, SubprocessMode::Pty);
        assert_eq!(req.protocol, StreamProtocol::LengthPrefixed);
        assert_eq!(req.term, "xterm-256color");
    }

    #[test]
    fn parse_ignores_unknown_arguments() {
        let req = parse(",futuristic,raw:true").unwrap();
        assert_eq!(req.mode, SubprocessMode::Raw);
        assert_eq!(req.command, "true");
    }

    #[test]
    fn parse_requires_delimiter() {
        assert!(parse("no-delimiter-here").is_none());
    }

    #[test]
    fn frame_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let sink = Mutex::new(a);
        write_frame(&sink, ID_STDOUT, b"payload").unwrap();

        let mut reader = b;
        let (id, payload) = read_frame(&mut reader).unwrap();
        assert_eq!(id, ID_STDOUT);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn raw_subprocess_echoes() {
        let req = parse(":printf out").unwrap();
        let stream = spawn(&req).unwrap();
        let (mut reader, _writer, _closer) = stream.split();

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"out");
    }

    #[test]
    fn framed_subprocess_reports_exit() {
        let req = parse(",raw,v2:printf out; exit 7").unwrap();
        let stream = spawn(&req).unwrap();
        let (mut reader, _writer, _closer) = stream.split();

        let mut stdout = Vec::new();
        let mut exit_code = None;
        loop {
            match read_frame(&mut reader) {
                Ok((ID_STDOUT, payload)) => stdout.extend(payload),
                Ok((ID_EXIT, payload)) => {
                    exit_code = payload.first().copied();
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert_eq!(stdout, b"out");
        assert_eq!(exit_code, Some(7));
    }
}
