//! Packet framing over any `Read`/`Write` stream.
//!
//! Each packet is a 24-byte header of six little-endian `u32` words
//! (command, arg0, arg1, payload length, payload checksum, magic)
//! followed by the payload bytes.

use std::io::{self, Read, Write};

use crate::command::Command;

/// Protocol version advertised in `CNXN` packets.
pub const VERSION: u32 = 0x0100_0000;

/// Process-wide ceiling on a packet payload (1 MiB).
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Conservative payload limit assumed before `CNXN` negotiation.
pub const INITIAL_MAX_PAYLOAD: usize = 4096;

/// Header size in bytes: six `u32` words.
pub const HEADER_LEN: usize = 24;

/// `AUTH` arg0: payload is a challenge token to be signed.
pub const AUTH_TOKEN: u32 = 1;
/// `AUTH` arg0: payload is a signature over the last token.
pub const AUTH_SIGNATURE: u32 = 2;
/// `AUTH` arg0: payload is a public key offered for approval.
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// One wire unit: command, two endpoint arguments, payload.
///
/// `arg0`/`arg1` carry the sender's and receiver's stream ids for the
/// multiplexing commands, and version/limit words for `CNXN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command word.
    pub command: Command,
    /// First argument (sender-local stream id, version, ...).
    pub arg0: u32,
    /// Second argument (receiver-local stream id, payload limit, ...).
    pub arg1: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Builds a packet.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    /// Byte-sum checksum of the payload.
    pub fn checksum(&self) -> u32 {
        self.payload
            .iter()
            .fold(0u32, |acc, b| acc.wrapping_add(u32::from(*b)))
    }
}

/// Encodes `packet` and writes header plus payload to `w`.
///
/// Refuses payloads larger than `max_payload`, mirroring the decode-side
/// bound so neither peer can be tricked into emitting an oversized frame.
pub fn write_packet<W: Write>(w: &mut W, packet: &Packet, max_payload: usize) -> io::Result<()> {
    if packet.payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "payload of {} bytes exceeds the {max_payload} byte limit",
                packet.payload.len()
            ),
        ));
    }
    let len = u32::try_from(packet.payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32::MAX"))?;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&packet.command.tag().to_le_bytes());
    header[4..8].copy_from_slice(&packet.arg0.to_le_bytes());
    header[8..12].copy_from_slice(&packet.arg1.to_le_bytes());
    header[12..16].copy_from_slice(&len.to_le_bytes());
    header[16..20].copy_from_slice(&packet.checksum().to_le_bytes());
    header[20..24].copy_from_slice(&packet.command.magic().to_le_bytes());

    w.write_all(&header)?;
    w.write_all(&packet.payload)?;
    w.flush()
}

/// Reads one packet from `r`, validating magic, length, and checksum.
///
/// A zero checksum word is accepted without verification so peers may
/// skip the payload sum.
pub fn read_packet<R: Read>(r: &mut R, max_payload: usize) -> io::Result<Packet> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;

    let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let raw_command = word(0);
    let arg0 = word(4);
    let arg1 = word(8);
    let len = word(12);
    let checksum = word(16);
    let magic = word(20);

    let command = Command::from_tag(raw_command).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown command tag {raw_command:#010x}"),
        )
    })?;
    if magic != command.magic() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad magic for {command}: {magic:#010x}"),
        ));
    }
    if len as usize > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload of {len} bytes exceeds the {max_payload} byte limit"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;

    let packet = Packet {
        command,
        arg0,
        arg1,
        payload,
    };
    if checksum != 0 && checksum != packet.checksum() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "checksum mismatch for {command}: header {checksum:#010x}, payload {:#010x}",
                packet.checksum()
            ),
        ));
    }
    Ok(packet)
}
