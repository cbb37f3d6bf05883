//! Channel multiplexing: turns one transport's packet stream into many
//! independent virtual streams with credit-based flow control.
//!
//! All methods here run on the event loop thread; the only other
//! parties are the per-channel worker pairs, which communicate back
//! exclusively through queued events.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender, TrySendError};
use std::thread;

use tether_proto::{Command, Packet};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelKind, StreamEndpoint};
use crate::hub::Event;
use crate::router::{Routed, ServiceRouter};
use crate::services::ServiceStream;
use crate::transport::Transport;

/// What a delivered WRTE did to the addressed channel.
enum WriteOutcome {
    /// Consumed; acknowledge immediately.
    Ack,
    /// Handed to the writer worker; acknowledge on flush.
    Deferred,
    /// The endpoint is finished; close the channel.
    Close,
    /// The peer exceeded its credit.
    Violation(&'static str),
    /// No such channel (stale id); ignore.
    Stale,
}

/// Per-transport packet dispatch and channel wiring.
pub(crate) struct Mux {
    router: Arc<ServiceRouter>,
    events: Sender<Event>,
}

impl Mux {
    pub fn new(router: Arc<ServiceRouter>, events: Sender<Event>) -> Self {
        Self { router, events }
    }

    /// Inbound OPEN: route the service, allocate a channel, answer
    /// OKAY, or refuse with CLSE.
    pub fn handle_open(&self, t: &Arc<Transport>, packet: &Packet) {
        let remote_id = packet.arg0;
        if remote_id == 0 {
            self.violation(t, "OPEN with zero stream id");
            return;
        }
        if t.channels().contains_remote(remote_id) {
            self.violation(t, "duplicate OPEN id");
            return;
        }

        let service = service_name(&packet.payload);
        match self.router.route(&service, t) {
            None => {
                debug!(serial = %t.serial(), service = %service, "refusing service open");
                let _ = t.send_packet(Packet::new(Command::Clse, 0, remote_id, Vec::new()));
            }
            Some(Routed::Sink(budget)) => {
                let local_id = t
                    .channels()
                    .allocate(ChannelKind::Sink { bytes_left: budget }, remote_id);
                let _ = t.send_packet(Packet::new(Command::Okay, local_id, remote_id, Vec::new()));
            }
            Some(Routed::Source(budget)) => {
                let local_id = t
                    .channels()
                    .allocate(ChannelKind::Source { bytes_left: budget }, remote_id);
                let _ = t.send_packet(Packet::new(Command::Okay, local_id, remote_id, Vec::new()));
                // The opener is implicitly ready; start pushing.
                self.push_source(t, local_id);
            }
            Some(Routed::Stream(stream)) => match self.wire_stream(t, stream, remote_id) {
                Ok(local_id) => {
                    let _ =
                        t.send_packet(Packet::new(Command::Okay, local_id, remote_id, Vec::new()));
                    self.grant_credit(t, local_id);
                }
                Err(e) => {
                    warn!(serial = %t.serial(), service = %service, error = %e, "failed to wire service stream");
                    let _ = t.send_packet(Packet::new(Command::Clse, 0, remote_id, Vec::new()));
                }
            },
        }
    }

    /// Inbound OKAY: learn the peer id on first contact, then treat it
    /// as one returned write credit.
    pub fn handle_okay(&self, t: &Arc<Transport>, packet: &Packet) {
        let local_id = packet.arg1;
        let push = {
            let mut channels = t.channels();
            let Some(entry) = channels.get_mut(local_id) else {
                trace!(serial = %t.serial(), id = local_id, "OKAY for unknown channel");
                return;
            };
            if entry.remote_id == 0 {
                entry.remote_id = packet.arg0;
            }
            match &entry.kind {
                ChannelKind::Source { .. } => true,
                ChannelKind::Stream(endpoint) => {
                    if let Some(credits) = &endpoint.credits {
                        let _ = credits.send(());
                    }
                    false
                }
                ChannelKind::Sink { .. } => false,
            }
        };
        if push {
            self.push_source(t, local_id);
        }
    }

    /// Inbound WRTE: deliver the payload to the endpoint under the
    /// one-outstanding-write credit scheme.
    pub fn handle_wrte(&self, t: &Arc<Transport>, packet: Packet) {
        let local_id = packet.arg1;
        let outcome = {
            let mut channels = t.channels();
            match channels.get_mut(local_id) {
                None => WriteOutcome::Stale,
                Some(entry) => {
                    if !entry.inbound_credit {
                        WriteOutcome::Violation("WRTE without credit")
                    } else {
                        entry.inbound_credit = false;
                        match &mut entry.kind {
                            ChannelKind::Sink { bytes_left } => {
                                let n = packet.payload.len() as u64;
                                if *bytes_left <= n {
                                    // Budget spent, possibly mid-write.
                                    WriteOutcome::Close
                                } else {
                                    *bytes_left -= n;
                                    WriteOutcome::Ack
                                }
                            }
                            // A source produces; writes to it are an error.
                            ChannelKind::Source { .. } => WriteOutcome::Close,
                            ChannelKind::Stream(endpoint) => match &endpoint.to_service {
                                None => WriteOutcome::Close,
                                Some(tx) => match tx.try_send(packet.payload) {
                                    Ok(()) => WriteOutcome::Deferred,
                                    Err(TrySendError::Full(_)) => {
                                        WriteOutcome::Violation("WRTE while a write is in flight")
                                    }
                                    Err(TrySendError::Disconnected(_)) => WriteOutcome::Close,
                                },
                            },
                        }
                    }
                }
            }
        };

        match outcome {
            WriteOutcome::Ack => self.acknowledge(t, local_id),
            WriteOutcome::Deferred => {}
            WriteOutcome::Close => self.close_channel(t, local_id),
            WriteOutcome::Violation(reason) => self.violation(t, reason),
            WriteOutcome::Stale => {
                trace!(serial = %t.serial(), id = local_id, "WRTE for unknown channel");
            }
        }
    }

    /// Inbound CLSE: tear down the addressed channel. Unknown ids are
    /// tolerated so duplicate closes stay no-ops.
    pub fn handle_clse(&self, t: &Arc<Transport>, packet: &Packet) {
        let local_id = packet.arg1;
        if let Some(mut entry) = t.channels().remove(local_id) {
            debug!(serial = %t.serial(), id = local_id, "peer closed channel");
            entry.kind.shutdown();
        }
    }

    /// A service worker flushed an inbound payload: return the credit.
    pub fn flushed(&self, t: &Arc<Transport>, local_id: u32) {
        self.acknowledge(t, local_id);
    }

    /// A service worker produced a chunk: forward it as WRTE. The
    /// worker already consumed one credit token for this chunk.
    pub fn service_data(&self, t: &Arc<Transport>, local_id: u32, data: Vec<u8>) {
        let ids = {
            let mut channels = t.channels();
            channels
                .get_mut(local_id)
                .map(|entry| (entry.local_id, entry.remote_id))
        };
        if let Some((local, remote)) = ids {
            let _ = t.send_packet(Packet::new(Command::Wrte, local, remote, data));
        }
    }

    /// A service worker hit EOF or an error: close the channel.
    pub fn service_closed(&self, t: &Arc<Transport>, local_id: u32) {
        self.close_channel(t, local_id);
    }

    /// Opens an outbound channel for `service` and returns the local
    /// end of its byte stream.
    pub fn open_local(&self, t: &Arc<Transport>, service: &str) -> io::Result<UnixStream> {
        if !t.is_online() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is not online",
            ));
        }
        let (ours, theirs) = UnixStream::pair()?;
        let stream = ServiceStream::from_unix(theirs)?;
        let local_id = self.wire_stream(t, stream, 0)?;

        let mut payload = service.as_bytes().to_vec();
        payload.push(0);
        let _ = t.send_packet(Packet::new(Command::Open, local_id, 0, payload));
        Ok(ours)
    }

    /// Closes every channel on a transport (teardown). No CLSE packets:
    /// the link is already gone.
    pub fn close_all(&self, t: &Arc<Transport>) {
        let entries = t.channels().drain();
        if !entries.is_empty() {
            debug!(serial = %t.serial(), count = entries.len(), "closing all channels");
        }
        for mut entry in entries {
            entry.kind.shutdown();
        }
    }

    /// Allocates a stream channel and spawns its worker pair.
    fn wire_stream(
        &self,
        t: &Arc<Transport>,
        stream: ServiceStream,
        remote_id: u32,
    ) -> io::Result<u32> {
        let (reader, writer, closer) = stream.split();
        let (data_tx, data_rx) = mpsc::sync_channel::<Vec<u8>>(1);
        let (credit_tx, credit_rx) = mpsc::channel::<()>();

        let local_id = t.channels().allocate(
            ChannelKind::Stream(StreamEndpoint {
                to_service: Some(data_tx),
                credits: Some(credit_tx),
                closer,
            }),
            remote_id,
        );

        let spawned = self
            .spawn_writer(t, local_id, writer, data_rx)
            .and_then(|()| self.spawn_reader(t, local_id, reader, credit_rx));
        if let Err(e) = spawned {
            if let Some(mut entry) = t.channels().remove(local_id) {
                entry.kind.shutdown();
            }
            return Err(e);
        }
        Ok(local_id)
    }

    /// Worker: drains inbound payloads into the service, reporting each
    /// flush back to the loop.
    fn spawn_writer(
        &self,
        t: &Arc<Transport>,
        local_id: u32,
        mut writer: Box<dyn Write + Send>,
        data_rx: mpsc::Receiver<Vec<u8>>,
    ) -> io::Result<()> {
        let events = self.events.clone();
        let transport = Arc::clone(t);
        thread::Builder::new()
            .name(format!("chan-out-{local_id}"))
            .spawn(move || {
                for chunk in data_rx {
                    if writer.write_all(&chunk).is_err() {
                        let _ = events.send(Event::ServiceClosed {
                            transport,
                            id: local_id,
                        });
                        return;
                    }
                    if events
                        .send(Event::Flushed {
                            transport: Arc::clone(&transport),
                            id: local_id,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                // Queue dropped: the channel was torn down already.
            })
            .map(|_| ())
    }

    /// Worker: reads service output one credit at a time and feeds it
    /// to the loop.
    fn spawn_reader(
        &self,
        t: &Arc<Transport>,
        local_id: u32,
        mut reader: Box<dyn Read + Send>,
        credit_rx: mpsc::Receiver<()>,
    ) -> io::Result<()> {
        let events = self.events.clone();
        let transport = Arc::clone(t);
        thread::Builder::new()
            .name(format!("chan-in-{local_id}"))
            .spawn(move || {
                loop {
                    // One chunk per credit keeps at most one WRTE in flight.
                    if credit_rx.recv().is_err() {
                        return;
                    }
                    let mut buf = vec![0u8; transport.max_payload()];
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => {
                            let _ = events.send(Event::ServiceClosed {
                                transport,
                                id: local_id,
                            });
                            return;
                        }
                        Ok(n) => {
                            buf.truncate(n);
                            if events
                                .send(Event::ServiceData {
                                    transport: Arc::clone(&transport),
                                    id: local_id,
                                    data: buf,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
            })
            .map(|_| ())
    }

    /// Emits the next zero-filled block of a source, or closes it once
    /// the budget is spent.
    fn push_source(&self, t: &Arc<Transport>, local_id: u32) {
        let next = {
            let mut channels = t.channels();
            let Some(entry) = channels.get_mut(local_id) else {
                return;
            };
            let ChannelKind::Source { bytes_left } = &mut entry.kind else {
                return;
            };
            let len = (*bytes_left).min(t.max_payload() as u64);
            if len == 0 {
                None
            } else {
                *bytes_left -= len;
                Some((entry.local_id, entry.remote_id, len as usize))
            }
        };
        match next {
            Some((local, remote, len)) => {
                let _ = t.send_packet(Packet::new(Command::Wrte, local, remote, vec![0u8; len]));
            }
            None => self.close_channel(t, local_id),
        }
    }

    /// Returns one inbound credit to the peer.
    fn acknowledge(&self, t: &Arc<Transport>, local_id: u32) {
        let ids = {
            let mut channels = t.channels();
            channels.get_mut(local_id).map(|entry| {
                entry.inbound_credit = true;
                (entry.local_id, entry.remote_id)
            })
        };
        if let Some((local, remote)) = ids {
            let _ = t.send_packet(Packet::new(Command::Okay, local, remote, Vec::new()));
        }
    }

    /// Locally initiated close: remove, release the endpoint, notify
    /// the peer once.
    fn close_channel(&self, t: &Arc<Transport>, local_id: u32) {
        if let Some(mut entry) = t.channels().remove(local_id) {
            entry.kind.shutdown();
            if entry.remote_id != 0 {
                let _ = t.send_packet(Packet::new(
                    Command::Clse,
                    entry.local_id,
                    entry.remote_id,
                    Vec::new(),
                ));
            }
        }
    }

    /// Grants the stream channel's reader worker one chunk of output.
    fn grant_credit(&self, t: &Arc<Transport>, local_id: u32) {
        let mut channels = t.channels();
        if let Some(entry) = channels.get_mut(local_id) {
            if let ChannelKind::Stream(endpoint) = &entry.kind {
                if let Some(credits) = &endpoint.credits {
                    let _ = credits.send(());
                }
            }
        }
    }

    /// Transport-fatal protocol error.
    fn violation(&self, t: &Arc<Transport>, reason: &str) {
        warn!(serial = %t.serial(), reason, "protocol violation");
        t.kick();
    }
}

/// Extracts the service name from an OPEN payload, dropping the
/// trailing NUL terminator.
fn service_name(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_strips_trailing_nul() {
        assert_eq!(service_name(b"shell:ls\0"), "shell:ls");
        assert_eq!(service_name(b"sink:42"), "sink:42");
        assert_eq!(service_name(b""), "");
        assert_eq!(service_name(b"\0"), "");
    }
}
