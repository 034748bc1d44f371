//! Bulk transfer through the chunked producer, verified by digest: the
//! client streams a payload in 64 KiB chunks, the server hashes what
//! arrives and sends the 32-byte digest back.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use strand::{ConnectOptions, EndpointOptionsBuilder, ListenOptions};

const CHUNK: usize = 64 * 1024;
const TOTAL: usize = 4 * 1024 * 1024;

struct ServerSide {
    hasher: Sha256,
    received: usize,
}

#[test]
fn chunked_send_hash_check() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();

    let side = Arc::new(Mutex::new(ServerSide {
        hasher: Sha256::new(),
        received: 0,
    }));

    let state = side.clone();
    let listen = ListenOptions {
        stream_data_cb: Some(Arc::new(move |stream, data| {
            let mut state = state.lock().unwrap();
            state.hasher.update(&data);
            state.received += data.len();
            if state.received == TOTAL {
                let digest = state.hasher.clone().finalize();
                stream.send(Bytes::copy_from_slice(&digest));
                stream.close(0);
            }
            Ok(())
        })),
        ..Default::default()
    };

    let (_net, server, client, creds) = common::pair(opts, listen);
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let (digest_tx, digest_rx) = mpsc::sync_channel::<Vec<u8>>(1);
    let stream = conn
        .open_stream_with(
            Some(Arc::new(move |_stream, data| {
                let _ = digest_tx.send(data.to_vec());
                Ok(())
            })),
            None,
        )
        .unwrap();

    // Deterministic pseudo-random payload, produced chunk by chunk so
    // the whole body never sits in memory at once.
    let produced = Arc::new(AtomicUsize::new(0));
    let producer_progress = produced.clone();
    let local_hash = Arc::new(Mutex::new(Sha256::new()));
    let hash_in_producer = local_hash.clone();

    let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
    stream.send_chunks(
        move || {
            let offset = producer_progress.load(Ordering::Acquire);
            if offset >= TOTAL {
                return None;
            }
            let len = CHUNK.min(TOTAL - offset);
            let chunk: Vec<u8> = (offset..offset + len)
                .map(|i| (i as u64).wrapping_mul(2654435761).to_le_bytes()[0])
                .collect();
            hash_in_producer.lock().unwrap().update(&chunk);
            producer_progress.store(offset + len, Ordering::Release);
            Some(Bytes::from(chunk))
        },
        move |_stream| {
            let _ = done_tx.send(());
        },
        4,
    );

    done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("producer never finished");
    assert_eq!(produced.load(Ordering::Acquire), TOTAL);

    let remote_digest = digest_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("digest never arrived");
    let local_digest = local_hash.lock().unwrap().clone().finalize();
    assert_eq!(
        remote_digest,
        local_digest.to_vec(),
        "server hashed different bytes than the client sent"
    );
}

#[test]
fn watermark_fires_as_buffer_drains() {
    let opts = EndpointOptionsBuilder::new()
        .alpns(vec![b"strand-test".to_vec()])
        .build()
        .unwrap();
    let (_net, server, client, creds) = common::pair(opts, ListenOptions::default());
    let conn = common::connect_established(&client, &server, &creds, ConnectOptions::default());

    let stream = conn.open_stream().unwrap();
    let (fired_tx, fired_rx) = mpsc::sync_channel::<()>(4);
    stream.set_watermark(
        1024,
        256 * 1024,
        move |_stream| {
            let _ = fired_tx.send(());
        },
        false,
    );

    // Push enough to cross the high mark; the engine drains it and the
    // one-shot hook fires on the way down.
    let payload = vec![7u8; 512 * 1024];
    stream.send(payload);

    fired_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("watermark hook never fired");
}
