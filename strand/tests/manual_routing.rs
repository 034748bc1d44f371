//! Manual routing: no OS sockets, packets shuttled between two
//! endpoints by application hooks.

mod common;

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use strand::{
    ConnectOptions, Credentials, EndpointOptionsBuilder, Endpoint, ListenOptions, Network, Packet,
    Path,
};

fn forward(to: &Endpoint, path: Path, data: &[u8]) {
    // Flip the path: the sender's (local, remote) is the receiver's
    // (remote, local).
    to.receive_packet(Packet {
        path: Path {
            local: path.remote,
            remote: path.local,
        },
        ecn: None,
        data: BytesMut::from(data),
    });
}

#[test]
fn echo_over_manual_routing() {
    common::init_tracing();

    let server_addr: SocketAddr = "127.0.0.1:45001".parse().unwrap();
    let client_addr: SocketAddr = "127.0.0.1:45002".parse().unwrap();

    // Separate networks, as a tunneled deployment would have.
    let server_net = Network::new().unwrap();
    let client_net = Network::new().unwrap();

    let client_slot: Arc<OnceLock<Endpoint>> = Arc::new(OnceLock::new());
    let server_slot: Arc<OnceLock<Endpoint>> = Arc::new(OnceLock::new());

    let (echoed_tx, echoed_rx) = mpsc::sync_channel::<Vec<u8>>(1);

    let to_client = client_slot.clone();
    let server_opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-manual".to_vec()])
        .manual_routing(Arc::new(move |path, data| {
            if let Some(client) = to_client.get() {
                forward(client, path, data);
            }
        }))
        .build()
        .unwrap();
    let server = server_net.endpoint(server_addr, server_opts).unwrap();
    server_slot.set(server.clone()).ok();

    let creds = Credentials::ed25519_random().unwrap();
    server
        .listen(
            &creds,
            ListenOptions {
                stream_data_cb: Some(Arc::new(|stream, data| {
                    stream.send(data);
                    Ok(())
                })),
                ..Default::default()
            },
        )
        .unwrap();

    let to_server = server_slot.clone();
    let client_opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-manual".to_vec()])
        .manual_routing(Arc::new(move |path, data| {
            if let Some(server) = to_server.get() {
                forward(server, path, data);
            }
        }))
        .build()
        .unwrap();
    let client = client_net.endpoint(client_addr, client_opts).unwrap();
    client_slot.set(client.clone()).ok();

    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let stream = conn
        .open_stream_with(
            Some(Arc::new(move |_stream, data| {
                let _ = echoed_tx.send(data.to_vec());
                Ok(())
            })),
            None,
        )
        .unwrap();
    stream.send(&b"through the tunnel"[..]);

    let got = echoed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo never made it through the hooks");
    assert_eq!(got, b"through the tunnel");
}

#[test]
fn manual_routing_requires_hook_for_ingress_only() {
    // A manual endpoint opens no socket; binding a nonsense address is
    // fine because nothing binds.
    common::init_tracing();
    let net = Network::new().unwrap();
    let opts = EndpointOptionsBuilder::new()
        .manual_routing(Arc::new(|_path, _data| {}))
        .build()
        .unwrap();
    let ep = net
        .endpoint("203.0.113.7:9".parse().unwrap(), opts)
        .unwrap();
    assert_eq!(ep.local_addr(), "203.0.113.7:9".parse::<SocketAddr>().unwrap());
}
