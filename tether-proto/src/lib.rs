//! Wire packet format for the tether device bridge.
//!
//! One physical link carries many multiplexed virtual streams. The unit
//! of transfer is a [`Packet`]: a 24-byte fixed-layout header (six
//! little-endian `u32` words) followed by a bounded payload, suitable
//! for any reliable byte stream (USB bulk, TCP, vsock).

mod command;
mod packet;

pub use command::Command;
pub use packet::{
    AUTH_RSAPUBLICKEY, AUTH_SIGNATURE, AUTH_TOKEN, HEADER_LEN, INITIAL_MAX_PAYLOAD, MAX_PAYLOAD,
    Packet, VERSION, read_packet, write_packet,
};
