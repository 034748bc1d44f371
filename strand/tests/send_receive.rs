//! Small-message exchange: exact bytes delivered exactly once in each
//! direction, clean close code 0 on both sides.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use strand::{ConnectOptions, EndpointOptionsBuilder, ListenOptions};

const MSG: &[u8] = b"hello from the other siiiii-iiiiide";

#[test]
fn echo_roundtrip_with_clean_close() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();

    let server_recv_count = Arc::new(AtomicUsize::new(0));
    let (server_close_tx, server_close_rx) = mpsc::sync_channel::<u64>(1);

    let counter = server_recv_count.clone();
    let listen = ListenOptions {
        stream_data_cb: Some(Arc::new(move |stream, data| {
            assert_eq!(&data[..], MSG, "server received altered bytes");
            counter.fetch_add(1, Ordering::AcqRel);
            // Echo the same bytes back, then finish our side.
            stream.send(data);
            stream.close(0);
            Ok(())
        })),
        stream_close_cb: Some(Arc::new(move |_stream, code| {
            let _ = server_close_tx.send(code);
        })),
        ..Default::default()
    };

    let (_net, server, client, creds) = common::pair(opts, listen);
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let client_recv_count = Arc::new(AtomicUsize::new(0));
    let (client_data_tx, client_data_rx) = mpsc::sync_channel::<Vec<u8>>(1);
    let (client_close_tx, client_close_rx) = mpsc::sync_channel::<u64>(1);

    let counter = client_recv_count.clone();
    let stream = conn
        .open_stream_with(
            Some(Arc::new(move |_stream, data| {
                counter.fetch_add(1, Ordering::AcqRel);
                let _ = client_data_tx.send(data.to_vec());
                Ok(())
            })),
            Some(Arc::new(move |_stream, code| {
                let _ = client_close_tx.send(code);
            })),
        )
        .unwrap();

    stream.send(MSG);

    let echoed = client_data_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo never arrived");
    assert_eq!(echoed, MSG);
    assert_eq!(client_recv_count.load(Ordering::Acquire), 1);
    assert_eq!(server_recv_count.load(Ordering::Acquire), 1);

    // Finish the client side too; both close callbacks must fire with
    // code 0.
    stream.close(0);

    let server_code = server_close_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server close callback");
    let client_code = client_close_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("client close callback");
    assert_eq!(server_code, 0);
    assert_eq!(client_code, 0);
}

#[test]
fn close_callback_fires_exactly_once() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();
    let (_net, server, client, creds) = common::pair(opts, ListenOptions::default());
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let close_count = Arc::new(AtomicUsize::new(0));
    let counter = close_count.clone();
    let stream = conn
        .open_stream_with(
            None,
            Some(Arc::new(move |_stream, _code| {
                counter.fetch_add(1, Ordering::AcqRel);
            })),
        )
        .unwrap();

    stream.send(&b"one last thing"[..]);
    // Abrupt close twice: idempotent, one callback.
    stream.close(77);
    stream.close(77);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(close_count.load(Ordering::Acquire), 1);
}

#[test]
fn data_callback_error_closes_stream_not_connection() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();

    let (srv_close_tx, srv_close_rx) = mpsc::sync_channel::<u64>(1);
    let listen = ListenOptions {
        stream_data_cb: Some(Arc::new(move |_stream, _data| {
            // Simulated application failure.
            Err(strand::CallbackError)
        })),
        stream_close_cb: Some(Arc::new(move |_stream, code| {
            let _ = srv_close_tx.send(code);
        })),
        ..Default::default()
    };

    let (_net, server, client, creds) = common::pair(opts, listen);
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let stream = conn.open_stream().unwrap();
    stream.send(&b"boom"[..]);

    let code = srv_close_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server stream close");
    assert_eq!(code, strand::STREAM_ERROR_EXCEPTION);

    // The connection survives the stream failure.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(server.get_all_conns(None).unwrap().len(), 1);
    assert_eq!(client.get_all_conns(None).unwrap().len(), 1);
}
