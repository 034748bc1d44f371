//! The length-prefixed request protocol: command dispatch, replies,
//! error replies, and request timeouts.

mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use strand::{BtRequestStream, ConnectOptions, EndpointOptionsBuilder, ListenOptions};

fn bt_server_listen() -> ListenOptions {
    ListenOptions {
        stream_open_cb: Some(Arc::new(|stream| {
            let bt = match BtRequestStream::upgrade(&stream) {
                Ok(bt) => bt,
                Err(_) => return false,
            };
            bt.register_command("ping", |msg| {
                msg.respond(b"pong".to_vec(), false);
            });
            bt.register_command("shout", |msg| {
                let mut body = msg.body().to_vec();
                body.make_ascii_uppercase();
                msg.respond(body, false);
            });
            bt.register_command("fail", |msg| {
                msg.respond(b"no can do".to_vec(), true);
            });
            true
        })),
        ..Default::default()
    }
}

#[test]
fn command_reply_roundtrip() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-bt".to_vec()])
        .build()
        .unwrap();
    let (_net, server, client, creds) = common::pair(opts, bt_server_listen());
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let bt = conn.open_bt_stream(None).unwrap();

    let (tx, rx) = mpsc::sync_channel::<(bool, Vec<u8>)>(4);
    let reply_tx = tx.clone();
    bt.request("ping", b"".to_vec(), move |msg| {
        let _ = reply_tx.send((msg.ok(), msg.body().to_vec()));
    })
    .unwrap();

    let (ok, body) = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert!(ok);
    assert_eq!(body, b"pong");

    // A second request on the same stream, exercising id allocation.
    let reply_tx = tx.clone();
    bt.request("shout", b"quiet words".to_vec(), move |msg| {
        let _ = reply_tx.send((msg.ok(), msg.body().to_vec()));
    })
    .unwrap();
    let (ok, body) = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert!(ok);
    assert_eq!(body, b"QUIET WORDS");
}

#[test]
fn error_reply_is_flagged() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-bt".to_vec()])
        .build()
        .unwrap();
    let (_net, server, client, creds) = common::pair(opts, bt_server_listen());
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let bt = conn.open_bt_stream(None).unwrap();
    let (tx, rx) = mpsc::sync_channel::<(bool, bool, Vec<u8>)>(1);
    bt.request("fail", b"do the thing".to_vec(), move |msg| {
        let _ = tx.send((msg.is_error(), msg.timed_out(), msg.body().to_vec()));
    })
    .unwrap();

    let (is_error, timed_out, body) = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert!(is_error);
    assert!(!timed_out, "error replies are not timeouts");
    assert_eq!(body, b"no can do");
}

#[test]
fn unhandled_request_times_out() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-bt".to_vec()])
        .build()
        .unwrap();
    let (_net, server, client, creds) = common::pair(opts, bt_server_listen());
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let bt = conn.open_bt_stream(None).unwrap();
    bt.set_request_timeout(Duration::from_millis(1500));

    let begun = Instant::now();
    let (tx, rx) = mpsc::sync_channel::<bool>(1);
    bt.request("no-such-endpoint", b"hello?".to_vec(), move |msg| {
        let _ = tx.send(msg.timed_out());
    })
    .unwrap();

    let timed_out = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("timeout callback never fired");
    assert!(timed_out);
    assert!(
        begun.elapsed() >= Duration::from_millis(1400),
        "timed out earlier than configured"
    );
}

#[test]
fn requests_interleave_with_commands_both_ways() {
    // Both peers run commands on the same stream: the server registers
    // via the open callback, the client on its own handle.
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-bt".to_vec()])
        .build()
        .unwrap();

    let (server_bt_tx, server_bt_rx) = mpsc::sync_channel::<BtRequestStream>(1);
    let listen = ListenOptions {
        stream_open_cb: Some(Arc::new(move |stream| {
            let bt = match BtRequestStream::upgrade(&stream) {
                Ok(bt) => bt,
                Err(_) => return false,
            };
            bt.register_command("ping", |msg| msg.respond(b"pong".to_vec(), false));
            let _ = server_bt_tx.send(bt);
            true
        })),
        ..Default::default()
    };

    let (_net, server, client, creds) = common::pair(opts, listen);
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let client_bt = conn.open_bt_stream(None).unwrap();
    client_bt.register_command("whoami", |msg| msg.respond(b"client".to_vec(), false));

    // Client → server request.
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(1);
    client_bt
        .request("ping", b"".to_vec(), move |msg| {
            let _ = tx.send(msg.body().to_vec());
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"pong");

    // Server → client request over the same stream.
    let server_bt = server_bt_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server never saw the stream");
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(1);
    server_bt
        .request("whoami", b"".to_vec(), move |msg| {
            let _ = tx.send(msg.body().to_vec());
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"client");
}
