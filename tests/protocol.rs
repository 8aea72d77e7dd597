//! End-to-end protocol tests: a server thread on one end of a
//! socketpair, a client on the other.

use byteorder::{ByteOrder, ReadBytesExt, LE};
use mediabus::client::{Client, Event};
use mediabus::conn::Connection;
use mediabus::graph::Direction;
use mediabus::pod::{PodBuilder, PodIter};
use mediabus::proto::{
    client_node_event, MemFlags, NodeInfo, NodeLifecycle, NodeUpdateFlags, ObjectKind,
    PortUpdateFlags, CORE_ID,
};
use mediabus::server::{NullSinkFactory, Server, TRANSPORT_AREA_SIZE};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::thread;

fn with_server<F>(setup: fn(&mut Server), test: F)
where
    F: FnOnce(Client),
{
    let (server_end, client_end) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || {
        let mut server = Server::new("test-server");
        setup(&mut server);
        server.handle_client(server_end).unwrap();
    });
    test(Client::from_stream(client_end));
    server.join().unwrap();
}

fn no_setup(_server: &mut Server) {}

#[test]
fn hello_carries_core_info() {
    with_server(no_setup, |mut client| {
        client.roundtrip().unwrap();
        let info = client.core_info().expect("hello arrived");
        assert_eq!(info.name, "test-server");
        assert_eq!(info.id, CORE_ID);
    });
}

// A sync request answers with exactly one done on the wire:
// header dest 0, opcode 1, a struct holding one int, no fds.
#[test]
fn sync_answers_done_at_wire_level() {
    let (server_end, mut raw) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || {
        let mut server = Server::new("wire");
        server.handle_client(server_end).unwrap();
    });

    let read_frame = |raw: &mut UnixStream| {
        let dest_id = raw.read_u32::<LE>().unwrap();
        let opcode = raw.read_u32::<LE>().unwrap();
        let length = raw.read_u32::<LE>().unwrap();
        let mut payload = vec![0u8; length as usize];
        raw.read_exact(&mut payload).unwrap();
        (dest_id, opcode, payload)
    };

    // the hello comes first
    let (dest, opcode, _) = read_frame(&mut raw);
    assert_eq!((dest, opcode), (0, 0));

    let mut payload = Vec::new();
    {
        let mut b = PodBuilder::new(&mut payload);
        b.begin_struct();
        b.push_int(7);
        b.end_struct();
    }
    let mut header = [0u8; 12];
    LE::write_u32(&mut header[0..4], 0);
    LE::write_u32(&mut header[4..8], 1); // core.sync
    LE::write_u32(&mut header[8..12], payload.len() as u32);
    raw.write_all(&header).unwrap();
    raw.write_all(&payload).unwrap();

    let (dest, opcode, payload) = read_frame(&mut raw);
    assert_eq!(dest, 0);
    assert_eq!(opcode, 1); // core.done
    assert_eq!(payload.len(), 28);
    let mut it = PodIter::new(&payload).unwrap();
    assert_eq!(it.pull_int().unwrap(), 7);
    it.finish().unwrap();

    drop(raw);
    server.join().unwrap();
}

fn advertise_node(server: &mut Server) {
    server.add_node_global(
        None,
        NodeInfo {
            name: "alsa-capture".to_string(),
            max_outputs: 2,
            n_outputs: 2,
            state: NodeLifecycle::Idle,
            ..Default::default()
        },
    );
}

// Bind a server-advertised global and watch its info arrive on the
// fresh id.
#[test]
fn bind_global_yields_node_info() {
    with_server(advertise_node, |mut client| {
        client.get_registry().unwrap();
        let globals = client.globals().to_vec();
        let (global_id, kind) = globals[0];
        assert_eq!(kind, ObjectKind::Node);

        let node_res = client.bind(global_id).unwrap();
        match client.next_event().unwrap() {
            Event::NodeInfo { id, info } => {
                assert_eq!(id, node_res);
                assert_eq!(info.name, "alsa-capture");
                assert_eq!(info.id, global_id);
            }
            other => panic!("expected node info, got {other:?}"),
        }
        client.roundtrip().unwrap();
    });
}

#[test]
fn create_node_through_factory() {
    fn setup(server: &mut Server) {
        server.add_factory(Box::new(NullSinkFactory));
    }
    with_server(setup, |mut client| {
        let node_res = client
            .create_node("support.null-sink", "silence", &[])
            .unwrap();
        match client.next_event().unwrap() {
            Event::NodeInfo { id, info } => {
                assert_eq!(id, node_res);
                assert_eq!(info.name, "silence");
                assert_eq!(info.n_inputs, 1);
            }
            other => panic!("expected node info, got {other:?}"),
        }
    });
}

#[test]
fn unknown_factory_is_reported_not_fatal() {
    with_server(no_setup, |mut client| {
        let err = client
            .create_node("no.such.factory", "x", &[])
            .unwrap_err();
        assert!(err.to_string().contains("no.such.factory"));
        // the connection survives a policy refusal
        client.roundtrip().unwrap();
    });
}

// Client-node setup hands over two descriptors: the transport area and
// the data wakeup channel.
#[test]
fn client_node_lifecycle_with_fds() {
    with_server(no_setup, |mut client| {
        let handle = client.create_client_node("remote-node", &[]).unwrap();
        assert_eq!(handle.transport_offset, 0);
        assert_eq!(handle.transport_size, TRANSPORT_AREA_SIZE);

        // the transport fd really is a shared area of that size
        let area = File::from(handle.transport_fd);
        assert_eq!(area.metadata().unwrap().len(), TRANSPORT_AREA_SIZE as u64);

        let mut format = Vec::new();
        {
            let mut b = PodBuilder::new(&mut format);
            b.begin_struct();
            b.push_string("audio/raw");
            b.end_struct();
        }
        client
            .update(
                handle.id,
                NodeUpdateFlags::MAX_INPUTS | NodeUpdateFlags::MAX_OUTPUTS,
                1,
                1,
                None,
            )
            .unwrap();
        client
            .port_update(
                handle.id,
                Direction::Output,
                0,
                PortUpdateFlags::POSSIBLE_FORMATS,
                std::slice::from_ref(&format),
                None,
                None,
            )
            .unwrap();
        client
            .state_change(handle.id, NodeLifecycle::Running)
            .unwrap();
        client.roundtrip().unwrap();

        // the node is advertised as a global while it lives
        client.get_registry().unwrap();
        assert_eq!(client.globals().len(), 1);
        assert_eq!(client.globals()[0].1, ObjectKind::Node);

        client.destroy(handle.id).unwrap();
        assert!(client.globals().is_empty());
    });
}

fn memfd_with(content: &[u8]) -> File {
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    let name = std::ffi::CString::new("protocol-test").unwrap();
    let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).unwrap();
    let mut file = File::from(fd);
    file.write_all(content).unwrap();
    file
}

// add_mem encodes the descriptor as int index 0 in the payload and
// ships exactly one fd as ancillary data; the receiver substitutes it
// back by position.
#[test]
fn add_mem_passes_the_descriptor() {
    let (a, b) = UnixStream::pair().unwrap();
    let mut server_conn = Connection::new(a);
    let mut client_conn = Connection::new(b);
    let memfd = memfd_with(b"shared region");

    {
        let (mut tx, _) = server_conn.split();
        client_node_event::add_mem(
            &mut tx,
            9,
            Direction::Input,
            0,
            1,
            2,
            memfd.as_fd(),
            MemFlags::READABLE | MemFlags::WRITABLE,
            0,
            4096,
        )
        .unwrap();
        tx.flush().unwrap();
    }

    let (_, mut rx) = client_conn.split();
    while rx.poll().unwrap() == 0 {}
    let (mut frames, fds) = rx.inbound();
    let frame = frames.next().unwrap();
    assert_eq!(frame.dest_id, 9);
    assert_eq!(frame.opcode, 6); // client_node.add_mem
    assert_eq!(fds.pending(), 1);

    fds.start_message();
    let mut it = PodIter::new(frame.payload).unwrap();
    assert_eq!(it.pull_int().unwrap() as u32, u32::from(Direction::Input));
    assert_eq!(it.pull_int().unwrap(), 0); // port
    assert_eq!(it.pull_int().unwrap(), 1); // mem id
    assert_eq!(it.pull_int().unwrap(), 2); // mem type
    let index = it.pull_fd_index().unwrap();
    assert_eq!(index, 0);
    let received = File::from(fds.take(index).unwrap());
    let mut content = [0u8; 13];
    received.read_exact_at(&mut content, 0).unwrap();
    assert_eq!(&content, b"shared region");
}

#[test]
fn client_update_and_sync_fence() {
    with_server(no_setup, |mut client| {
        let props = vec![
            ("application.name".to_string(), "tests".to_string()),
            ("application.pid".to_string(), "1".to_string()),
        ];
        client.client_update(&props).unwrap();
        // the fence proves the update committed before done came back
        client.roundtrip().unwrap();
        client.roundtrip().unwrap();
    });
}

#[test]
fn unknown_destination_closes_connection() {
    let (server_end, client_end) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || {
        let mut server = Server::new("strict");
        server.handle_client(server_end).err()
    });
    let mut conn = Connection::new(client_end);
    {
        let (mut tx, _) = conn.split();
        let mut buf = tx.begin_write();
        {
            let mut b = PodBuilder::new(&mut buf);
            b.begin_struct();
            b.push_int(1);
            b.end_struct();
        }
        tx.end_write(777, 0, buf);
        tx.flush().unwrap();
    }
    let err = server.join().unwrap();
    assert!(err.is_some(), "server should refuse the unknown id");
}
