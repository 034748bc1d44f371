//! Handshake: client connects to a listening server on localhost; the
//! established callback fires exactly once per side and both endpoints
//! end up with exactly one connection.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use strand::{ConnectOptions, Direction, EndpointOptionsBuilder, ListenOptions};

#[test]
fn handshake_establishes_exactly_once() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();

    let server_established = Arc::new(AtomicUsize::new(0));
    let (server_tx, server_rx) = common::flag();
    let counter = server_established.clone();
    let listen = ListenOptions {
        on_established: Some(Arc::new(move |_conn| {
            counter.fetch_add(1, Ordering::AcqRel);
            let _ = server_tx.send(());
        })),
        ..Default::default()
    };

    let (_net, server, client, creds) = common::pair(opts, listen);

    let client_established = Arc::new(AtomicUsize::new(0));
    let counter = client_established.clone();
    let conn = common::connect_established(
        &client,
        &server,
        &creds,
        ConnectOptions {
            on_established: Some(Arc::new(move |_conn| {
                counter.fetch_add(1, Ordering::AcqRel);
            })),
            ..Default::default()
        },
    );
    common::wait(&server_rx, "server-side establishment");

    assert_eq!(client_established.load(Ordering::Acquire), 1);
    assert_eq!(server_established.load(Ordering::Acquire), 1);

    assert_eq!(conn.direction().unwrap(), Direction::Outbound);
    assert_eq!(conn.remote_address().unwrap(), server.local_addr());

    let client_conns = client.get_all_conns(None).unwrap();
    let server_conns = server.get_all_conns(None).unwrap();
    assert_eq!(client_conns.len(), 1);
    assert_eq!(server_conns.len(), 1);
    assert_eq!(
        server_conns[0].direction().unwrap(),
        Direction::Inbound,
        "server side sees the connection as inbound"
    );

    // Direction filters partition the map.
    assert_eq!(client.get_all_conns(Some(Direction::Outbound)).unwrap().len(), 1);
    assert_eq!(client.get_all_conns(Some(Direction::Inbound)).unwrap().len(), 0);
}

#[test]
fn connect_to_closed_endpoint_fails() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();
    let (_net, server, client, creds) = common::pair(opts, ListenOptions::default());

    client.close();
    let result = client.connect(server.local_addr(), &creds, ConnectOptions::default());
    assert!(result.is_err(), "connect on a closed endpoint must fail");
}
