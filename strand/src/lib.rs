//! strand — a programmable QUIC transport library.
//!
//! strand drives the quinn-proto QUIC state machine over non-blocking
//! UDP from a single dedicated loop thread and exposes a callback-driven
//! API: endpoints that connect out and accept in, reliable multiplexed
//! byte streams, unreliable datagrams (optionally split across two
//! packets and reassembled), and a length-prefixed bencode RPC layer for
//! request/response protocols.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strand::{
//!     ConnectOptions, Credentials, EndpointOptionsBuilder, ListenOptions, Network,
//! };
//!
//! fn main() -> Result<(), strand::Error> {
//!     let net = Network::new()?;
//!     let opts = EndpointOptionsBuilder::new()
//!         .alpns(vec![b"my-proto".to_vec()])
//!         .build()?;
//!
//!     // Server side
//!     let server = net.endpoint("127.0.0.1:0".parse().unwrap(), opts.clone())?;
//!     let creds = Credentials::ed25519_random()?;
//!     server.listen(
//!         &creds,
//!         ListenOptions {
//!             stream_data_cb: Some(Arc::new(|stream, data| {
//!                 stream.send(data); // echo
//!                 Ok(())
//!             })),
//!             ..Default::default()
//!         },
//!     )?;
//!
//!     // Client side
//!     let client = net.endpoint("127.0.0.1:0".parse().unwrap(), opts)?;
//!     let conn = client.connect(server.local_addr(), &creds, ConnectOptions::default())?;
//!     let stream = conn.open_stream()?;
//!     stream.send(&b"hello"[..]);
//!     Ok(())
//! }
//! ```
//!
//! # Threading
//!
//! All transport state lives on the loop thread; application callbacks
//! run there too. Public handles ([`Endpoint`], [`Connection`],
//! [`Stream`], ...) are clonable and may be used from any thread; they
//! dispatch through the loop's job queue, or rendezvous synchronously
//! where a result is returned.
//!
//! # Platform
//!
//! Linux-first: the socket layer uses sendmsg/recvmsg with `UDP_SEGMENT`
//! (GSO) and TOS control messages. Other unixes work without GSO.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod socket;

// ── Public modules ──────────────────────────────────────────────────
pub mod btstream;
pub mod config;
pub mod connection;
pub mod creds;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod event_loop;
pub mod metrics;
pub mod network;
pub mod stream;
pub mod types;

// ── Re-exports: entry points ────────────────────────────────────────

/// Owns the loop thread and creates endpoints.
pub use network::Network;
/// Handle to the loop: job dispatch, timers, triggers.
pub use event_loop::EventLoop;

// ── Re-exports: transport handles ───────────────────────────────────

/// One bound UDP socket hosting connections.
pub use endpoint::Endpoint;
/// A QUIC connection.
pub use connection::Connection;
/// An ordered byte stream.
pub use stream::Stream;
/// A stream carrying the length-prefixed request protocol.
pub use btstream::BtRequestStream;
/// A decoded request-protocol message.
pub use btstream::BtMessage;
/// Default response timeout for BT requests.
pub use btstream::REQUEST_TIMEOUT;

// ── Re-exports: configuration ───────────────────────────────────────

/// TLS identity (certificate-backed or raw Ed25519).
pub use creds::Credentials;
/// Endpoint configuration.
pub use config::EndpointOptions;
/// Builder for [`EndpointOptions`] with validation.
pub use config::EndpointOptionsBuilder;
/// Per-connection callbacks for `connect()`.
pub use config::ConnectOptions;
/// Inbound defaults installed by `listen()`.
pub use config::ListenOptions;
/// Datagram policy (splitting mode and reassembly buffer size).
pub use config::DatagramConfig;
pub use config::{
    ConnClosedCb, ConnOpenCb, DatagramCb, SendHook, StreamCloseCb, StreamDataCb, StreamOpenCb,
};

// ── Re-exports: loop primitives ─────────────────────────────────────

/// Start/stop/is-running capability shared by loop event handles.
pub use event_loop::EventHandle;
/// Shared handle whose contents are released on the loop thread.
pub use event_loop::LoopBound;
/// Repeating timer handle.
pub use event_loop::Ticker;
/// Burst-then-cooldown event.
pub use event_loop::Trigger;

// ── Re-exports: types and errors ────────────────────────────────────

pub use error::{
    BPARSER_EXCEPTION, CallbackError, Error, STREAM_ERROR_CONNECTION_EXPIRED,
    STREAM_ERROR_EXCEPTION,
};
pub use types::{ConnectionID, Direction, Packet, Path, Splitting};
