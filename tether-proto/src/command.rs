//! Packet command tags.

use std::fmt;

/// Packs a four-byte ASCII mnemonic into its on-wire `u32` form.
const fn tag(bytes: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*bytes)
}

/// The command word of a packet header.
///
/// Each variant is a four-character ASCII mnemonic packed little-endian
/// into a `u32`. The header's magic word is the bitwise complement of
/// the tag, which cheaply catches desynchronized streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Connection handshake; carries the version, the sender's maximum
    /// payload size, and its identity banner.
    Cnxn,
    /// Authentication step (token challenge, signature, or public key).
    Auth,
    /// Open a virtual stream for the service named in the payload.
    Open,
    /// Acknowledge an `Open` or a `Wrte`; returns one write credit.
    Okay,
    /// Close a virtual stream (or refuse an `Open`).
    Clse,
    /// Payload bytes for an established virtual stream.
    Wrte,
}

impl Command {
    /// All commands, in tag order.
    pub const ALL: [Self; 6] = [
        Self::Cnxn,
        Self::Auth,
        Self::Open,
        Self::Okay,
        Self::Clse,
        Self::Wrte,
    ];

    /// Returns the on-wire `u32` tag.
    pub const fn tag(self) -> u32 {
        match self {
            Self::Cnxn => tag(b"CNXN"),
            Self::Auth => tag(b"AUTH"),
            Self::Open => tag(b"OPEN"),
            Self::Okay => tag(b"OKAY"),
            Self::Clse => tag(b"CLSE"),
            Self::Wrte => tag(b"WRTE"),
        }
    }

    /// Maps an on-wire tag back to a command. `None` for unknown tags.
    pub fn from_tag(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == raw)
    }

    /// The expected magic word for this command.
    pub const fn magic(self) -> u32 {
        self.tag() ^ 0xffff_ffff
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cnxn => "CNXN",
            Self::Auth => "AUTH",
            Self::Open => "OPEN",
            Self::Okay => "OKAY",
            Self::Clse => "CLSE",
            Self::Wrte => "WRTE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_roundtrip() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_tag(cmd.tag()), Some(cmd));
        }
    }

    #[test]
    fn tags_are_ascii_mnemonics() {
        assert_eq!(Command::Cnxn.tag().to_le_bytes(), *b"CNXN");
        assert_eq!(Command::Wrte.tag().to_le_bytes(), *b"WRTE");
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(Command::from_tag(0xdead_beef), None);
    }

    #[test]
    fn magic_is_complement() {
        for cmd in Command::ALL {
            assert_eq!(cmd.magic(), !cmd.tag());
        }
    }
}
