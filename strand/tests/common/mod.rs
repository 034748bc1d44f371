//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender};
use std::time::Duration;

use strand::{
    ConnectOptions, Connection, Credentials, Endpoint, EndpointOptions, ListenOptions, Network,
};

pub const HANDSHAKE_WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One network, a listening server endpoint, and a client endpoint.
pub fn pair(
    opts: EndpointOptions,
    listen: ListenOptions,
) -> (Network, Endpoint, Endpoint, Credentials) {
    init_tracing();
    let net = Network::new().expect("network");
    let server = net
        .endpoint("127.0.0.1:0".parse().unwrap(), opts.clone())
        .expect("server endpoint");
    let creds = Credentials::ed25519_random().expect("credentials");
    server.listen(&creds, listen).expect("listen");
    let client = net
        .endpoint("127.0.0.1:0".parse().unwrap(), opts)
        .expect("client endpoint");
    (net, server, client, creds)
}

/// Connect and block until the handshake completes.
pub fn connect_established(
    client: &Endpoint,
    server: &Endpoint,
    creds: &Credentials,
    mut opts: ConnectOptions,
) -> Connection {
    let (tx, rx) = mpsc::sync_channel::<()>(1);
    let prior = opts.on_established.take();
    opts.on_established = Some(Arc::new(move |conn| {
        if let Some(prior) = &prior {
            prior(conn);
        }
        let _ = tx.send(());
    }));
    let conn = client
        .connect(server.local_addr(), creds, opts)
        .expect("connect");
    rx.recv_timeout(HANDSHAKE_WAIT).expect("handshake timed out");
    conn
}

/// Channel-backed event flag usable from Arc'd callbacks.
pub fn flag() -> (SyncSender<()>, mpsc::Receiver<()>) {
    mpsc::sync_channel(64)
}

pub fn wait(rx: &mpsc::Receiver<()>, what: &str) {
    rx.recv_timeout(HANDSHAKE_WAIT)
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
