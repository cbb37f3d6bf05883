//! End-to-end multiplexing tests: a packet-speaking peer drives a hub
//! over an in-memory connection.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tether::{
    Connection, ConnectionState, Hub, HubConfig, HubHandle, ReconnectDecision, ServiceHooks,
    ServiceRouter, Transport, TransportKind, abort_reconnect,
};
use tether_proto::{Command, MAX_PAYLOAD, Packet, VERSION, read_packet, write_packet};

struct PipeConnection {
    stream: UnixStream,
}

impl Connection for PipeConnection {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// The remote end of the wire, speaking raw packets.
struct Peer {
    sock: UnixStream,
}

impl Peer {
    fn send(&mut self, packet: &Packet) {
        write_packet(&mut self.sock, packet, MAX_PAYLOAD).unwrap();
    }

    fn recv_result(&mut self) -> io::Result<Packet> {
        read_packet(&mut self.sock, MAX_PAYLOAD)
    }

    fn recv(&mut self) -> Packet {
        self.recv_result().unwrap()
    }

    fn recv_expect(&mut self, command: Command) -> Packet {
        let packet = self.recv();
        assert_eq!(packet.command, command, "unexpected {}", packet.command);
        packet
    }
}

fn spawn_hub(config: HubConfig) -> (HubHandle, thread::JoinHandle<()>) {
    let hub = Hub::new(config, ServiceRouter::new(ServiceHooks::default()));
    let handle = hub.handle();
    (handle, thread::spawn(move || hub.run()))
}

fn attach_peer(handle: &HubHandle) -> (Peer, Arc<Transport>) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let transport = handle
        .register(
            Box::new(PipeConnection { stream: ours }),
            TransportKind::LocalTcp,
            None,
            None,
            abort_reconnect(),
        )
        .unwrap();
    (Peer { sock: theirs }, transport)
}

/// Host-style CNXN with an explicit payload-size advertisement.
fn connect_packet(banner: &str, max_payload: u32) -> Packet {
    Packet::new(Command::Cnxn, VERSION, max_payload, banner.as_bytes().to_vec())
}

fn open_packet(remote_id: u32, service: &str) -> Packet {
    let mut payload = service.as_bytes().to_vec();
    payload.push(0);
    Packet::new(Command::Open, remote_id, 0, payload)
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn handshake_applies_banner_and_replies() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());
    let (mut peer, transport) = attach_peer(&handle);
    assert_eq!(transport.state(), ConnectionState::Connecting);

    peer.send(&connect_packet(
        "host::ro.product.name=foo;ro.product.model=bar;ro.product.device=baz;\
         features=woodly,doodly",
        MAX_PAYLOAD as u32,
    ));

    let reply = peer.recv_expect(Command::Cnxn);
    assert!(reply.payload.starts_with(b"device::"));

    assert_eq!(transport.state(), ConnectionState::Host);
    assert_eq!(transport.product(), "foo");
    assert_eq!(transport.model(), "bar");
    assert_eq!(transport.device(), "baz");
    let features = transport.features();
    assert_eq!(features.len(), 2);
    assert!(transport.has_feature("woodly"));
    assert!(transport.has_feature("doodly"));

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn sink_consumes_its_budget_then_closes() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());
    let (mut peer, _transport) = attach_peer(&handle);
    peer.send(&connect_packet("host::", MAX_PAYLOAD as u32));
    peer.recv_expect(Command::Cnxn);

    peer.send(&open_packet(1, "sink:1024"));
    let okay = peer.recv_expect(Command::Okay);
    assert_eq!(okay.arg1, 1);
    let sink_id = okay.arg0;

    // First half of the budget is consumed and acknowledged.
    peer.send(&Packet::new(Command::Wrte, 1, sink_id, vec![0xaa; 512]));
    let ack = peer.recv_expect(Command::Okay);
    assert_eq!((ack.arg0, ack.arg1), (sink_id, 1));

    // The write that exhausts the budget closes the channel instead.
    peer.send(&Packet::new(Command::Wrte, 1, sink_id, vec![0xbb; 512]));
    let close = peer.recv_expect(Command::Clse);
    assert_eq!((close.arg0, close.arg1), (sink_id, 1));

    // Writes after close and duplicate closes are ignored, not fatal.
    peer.send(&Packet::new(Command::Wrte, 1, sink_id, vec![0xcc; 16]));
    peer.send(&Packet::new(Command::Clse, 1, sink_id, Vec::new()));
    peer.send(&Packet::new(Command::Clse, 1, sink_id, Vec::new()));

    peer.send(&open_packet(2, "sink:10"));
    let okay = peer.recv_expect(Command::Okay);
    assert_eq!(okay.arg1, 2);
    assert_eq!(handle.registry().len(), 1);

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn source_respects_negotiated_max_payload_and_credit() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());
    let (mut peer, _transport) = attach_peer(&handle);

    // Advertise a 64-byte payload limit; the source must chunk to it.
    peer.send(&connect_packet("host::", 64));
    peer.recv_expect(Command::Cnxn);

    peer.send(&open_packet(1, "source:100"));
    let okay = peer.recv_expect(Command::Okay);
    let source_id = okay.arg0;

    let first = peer.recv_expect(Command::Wrte);
    assert_eq!(first.payload.len(), 64);
    assert!(first.payload.iter().all(|b| *b == 0));

    // One outstanding write per direction: nothing else may arrive
    // until we return the credit.
    peer.sock
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    assert!(peer.recv_result().is_err(), "source sent without credit");
    peer.sock
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    peer.send(&Packet::new(Command::Okay, 1, source_id, Vec::new()));
    let second = peer.recv_expect(Command::Wrte);
    assert_eq!(second.payload.len(), 36);

    peer.send(&Packet::new(Command::Okay, 1, source_id, Vec::new()));
    let close = peer.recv_expect(Command::Clse);
    assert_eq!((close.arg0, close.arg1), (source_id, 1));

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn unknown_and_malformed_services_are_refused() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());
    let (mut peer, _transport) = attach_peer(&handle);
    peer.send(&connect_packet("host::", MAX_PAYLOAD as u32));
    peer.recv_expect(Command::Cnxn);

    peer.send(&open_packet(7, "flurble:1"));
    let refuse = peer.recv_expect(Command::Clse);
    assert_eq!((refuse.arg0, refuse.arg1), (0, 7));

    peer.send(&open_packet(8, "sink:banana"));
    let refuse = peer.recv_expect(Command::Clse);
    assert_eq!((refuse.arg0, refuse.arg1), (0, 8));

    // The transport survives refusals.
    assert_eq!(handle.registry().len(), 1);

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn duplicate_open_id_is_transport_fatal() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());
    let (mut peer, transport) = attach_peer(&handle);
    peer.send(&connect_packet("host::", MAX_PAYLOAD as u32));
    peer.recv_expect(Command::Cnxn);

    peer.send(&open_packet(5, "sink:10"));
    peer.recv_expect(Command::Okay);

    peer.send(&open_packet(5, "sink:10"));

    wait_for("transport teardown", || handle.registry().is_empty());
    assert_eq!(transport.state(), ConnectionState::Offline);
    // The wire is dead from the peer's point of view too.
    assert!(peer.recv_result().is_err());

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn exec_service_streams_output_and_closes() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());
    let (mut peer, _transport) = attach_peer(&handle);
    peer.send(&connect_packet("host::", MAX_PAYLOAD as u32));
    peer.recv_expect(Command::Cnxn);

    peer.send(&open_packet(3, "exec:printf tethered"));
    let okay = peer.recv_expect(Command::Okay);
    let exec_id = okay.arg0;

    let output = peer.recv_expect(Command::Wrte);
    assert_eq!((output.arg0, output.arg1), (exec_id, 3));
    assert_eq!(output.payload, b"tethered");

    peer.send(&Packet::new(Command::Okay, 3, exec_id, Vec::new()));
    let close = peer.recv_expect(Command::Clse);
    assert_eq!((close.arg0, close.arg1), (exec_id, 3));

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn outbound_open_bridges_both_directions() {
    // This hub plays host: it sends the first CNXN and initiates opens.
    let (handle, loop_thread) = spawn_hub(HubConfig::host());
    let (mut peer, transport) = attach_peer(&handle);

    let hello = peer.recv_expect(Command::Cnxn);
    assert!(hello.payload.starts_with(b"host::"));
    peer.send(&connect_packet("device::", MAX_PAYLOAD as u32));
    wait_for("transport online", || transport.is_online());

    let opener = {
        let handle = handle.clone();
        let transport = Arc::clone(&transport);
        thread::spawn(move || handle.open(&transport, "sync:").unwrap())
    };

    let open = peer.recv_expect(Command::Open);
    assert_eq!(open.payload, b"sync:\0");
    let their_id = open.arg0;
    peer.send(&Packet::new(Command::Okay, 42, their_id, Vec::new()));

    let mut stream = opener.join().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Local writer -> wire.
    stream.write_all(b"LIST").unwrap();
    let data = peer.recv_expect(Command::Wrte);
    assert_eq!((data.arg0, data.arg1), (their_id, 42));
    assert_eq!(data.payload, b"LIST");
    peer.send(&Packet::new(Command::Okay, 42, their_id, Vec::new()));

    // Wire -> local reader, acknowledged once flushed.
    peer.send(&Packet::new(Command::Wrte, 42, their_id, b"DENT".to_vec()));
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"DENT");
    let ack = peer.recv_expect(Command::Okay);
    assert_eq!((ack.arg0, ack.arg1), (their_id, 42));

    // Peer close surfaces as EOF on the local stream.
    peer.send(&Packet::new(Command::Clse, 42, their_id, Vec::new()));
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    handle.shutdown();
    loop_thread.join().unwrap();
}

#[test]
fn reconnect_policy_replaces_connection_then_aborts() {
    let (handle, loop_thread) = spawn_hub(HubConfig::device());

    let (ours, theirs) = UnixStream::pair().unwrap();
    theirs
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut first_peer = Peer { sock: theirs };

    // One spare connection; after that the policy gives up.
    let (spare_ours, spare_theirs) = UnixStream::pair().unwrap();
    spare_theirs
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let spares = Arc::new(Mutex::new(VecDeque::from(vec![spare_ours])));
    let policy_spares = Arc::clone(&spares);

    let transport = handle
        .register(
            Box::new(PipeConnection { stream: ours }),
            TransportKind::LocalTcp,
            Some("replugged".to_owned()),
            None,
            Arc::new(move |_t| match policy_spares.lock().unwrap().pop_front() {
                Some(stream) => ReconnectDecision::Retry(Box::new(PipeConnection { stream })),
                None => ReconnectDecision::Abort,
            }),
        )
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    transport.add_disconnect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    first_peer.send(&connect_packet("host::", MAX_PAYLOAD as u32));
    first_peer.recv_expect(Command::Cnxn);
    wait_for("first handshake", || transport.is_online());

    // Break the first connection; the policy supplies the spare.
    drop(first_peer);
    let mut second_peer = Peer { sock: spare_theirs };
    second_peer.send(&connect_packet("host::", MAX_PAYLOAD as u32));
    second_peer.recv_expect(Command::Cnxn);
    wait_for("reconnected handshake", || transport.is_online());
    assert_eq!(handle.registry().len(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // Break it again: no spares left, the transport is destroyed.
    drop(second_peer);
    wait_for("abort teardown", || handle.registry().is_empty());
    wait_for("disconnect listener", || fired.load(Ordering::SeqCst) == 1);

    handle.shutdown();
    loop_thread.join().unwrap();
}
