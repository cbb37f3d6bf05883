//! Connection backends: producers of raw byte streams for the hub.
//!
//! Each backend owns its blocking work (accept loops, scan cycles,
//! discovery polls) on dedicated threads and hands finished
//! connections to the hub via registration.

pub mod discovery;
pub mod tcp;
pub mod usb;
#[cfg(target_os = "linux")]
pub mod vsock;
