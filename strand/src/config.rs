//! Endpoint and connection configuration.
//!
//! [`EndpointOptions`] carries everything an endpoint needs up front:
//! stream limits, ALPNs, timers, datagram policy, the static secret, and
//! the optional manual-routing hook. Build one via
//! [`EndpointOptionsBuilder`]; `build()` validates every value and fails
//! synchronously on bad input.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{CallbackError, Error};
use crate::stream::Stream;
use crate::types::{Path, Splitting};

/// Default allowance of concurrent peer-initiated bidirectional streams.
pub const DEFAULT_MAX_STREAMS: u64 = 32;

/// Default negotiated idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default rotating reassembly buffer size (datagram id slots).
pub const DEFAULT_DATAGRAM_BUFSIZE: usize = 4096;

/// Largest accepted reassembly buffer size.
pub const MAX_DATAGRAM_BUFSIZE: usize = 16384;

/// Minimum length of a caller-provided static secret.
pub const SECRET_MIN_SIZE: usize = 16;

// ── Callback types ──────────────────────────────────────────────────

/// Stream data callback. Returning `Err` closes the stream with
/// `STREAM_ERROR_EXCEPTION`; the connection survives.
pub type StreamDataCb = Arc<dyn Fn(Stream, Bytes) -> Result<(), CallbackError> + Send + Sync>;

/// Stream close callback; fires exactly once per stream with the
/// application error code (0 for a clean close).
pub type StreamCloseCb = Arc<dyn Fn(Stream, u64) + Send + Sync>;

/// Remote stream open callback. Returning `false` rejects the stream.
pub type StreamOpenCb = Arc<dyn Fn(Stream) -> bool + Send + Sync>;

/// Connection established callback; fires exactly once per connection.
pub type ConnOpenCb = Arc<dyn Fn(Connection) + Send + Sync>;

/// Connection closed callback; fires exactly once, with the peer's
/// application close code when one was received.
pub type ConnClosedCb = Arc<dyn Fn(Connection, u64) + Send + Sync>;

/// Datagram delivery callback. Receives the owning connection so the
/// handler can reply.
pub type DatagramCb = Arc<dyn Fn(Connection, Bytes) + Send + Sync>;

/// Outbound packet sink installed by
/// [`EndpointOptionsBuilder::manual_routing`].
pub type SendHook = Arc<dyn Fn(Path, &[u8]) + Send + Sync>;

// ── Endpoint options ────────────────────────────────────────────────

/// Datagram policy for an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct DatagramConfig {
    /// Splitting policy; with [`Splitting::Active`] each datagram may be
    /// sent as two tagged halves.
    pub splitting: Splitting,
    /// Rotating reassembly buffer size in datagram-id slots, split across
    /// four rows. Must be positive, at most [`MAX_DATAGRAM_BUFSIZE`] and
    /// divisible by 4.
    pub bufsize: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            splitting: Splitting::None,
            bufsize: DEFAULT_DATAGRAM_BUFSIZE,
        }
    }
}

/// Endpoint configuration. Construct via [`EndpointOptionsBuilder`].
#[derive(Clone)]
pub struct EndpointOptions {
    /// Concurrent bidirectional streams allowed to the peer.
    pub max_streams: u64,
    /// ALPN identifiers advertised on outbound connections.
    pub outbound_alpns: Vec<Vec<u8>>,
    /// ALPN identifiers accepted on inbound connections.
    pub inbound_alpns: Vec<Vec<u8>>,
    /// Wall-clock limit from the initial packet to handshake completion.
    /// `None` leaves only the idle timeout.
    pub handshake_timeout: Option<Duration>,
    /// PING interval keeping idle connections alive. Zero disables.
    pub keep_alive: Duration,
    /// Inactivity timeout negotiated with the peer; the lower of the two
    /// sides wins.
    pub idle_timeout: Duration,
    /// Datagram support. `None` disables datagrams entirely.
    pub datagrams: Option<DatagramConfig>,
    /// Pre-shared secret seeding stateless-reset and token derivation.
    /// `None` generates 32 random bytes at endpoint construction.
    pub static_secret: Option<Vec<u8>>,
    /// Outbound packet hook; when set, no OS socket is opened and
    /// [`Endpoint::receive_packet`](crate::Endpoint::receive_packet) is
    /// the ingress.
    pub manual_routing: Option<SendHook>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            outbound_alpns: Vec::new(),
            inbound_alpns: Vec::new(),
            handshake_timeout: None,
            keep_alive: Duration::ZERO,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            datagrams: None,
            static_secret: None,
            manual_routing: None,
        }
    }
}

impl EndpointOptions {
    /// Validate every option. Returns `Error::Config` on the first
    /// violation.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(dgram) = &self.datagrams {
            if dgram.bufsize == 0 {
                return Err(Error::Config("datagram bufsize must be positive".into()));
            }
            if dgram.bufsize > MAX_DATAGRAM_BUFSIZE {
                return Err(Error::Config(format!(
                    "datagram bufsize {} exceeds maximum {}",
                    dgram.bufsize, MAX_DATAGRAM_BUFSIZE
                )));
            }
            if dgram.bufsize % 4 != 0 {
                return Err(Error::Config(
                    "datagram bufsize must be divisible between 4 rows".into(),
                ));
            }
        }
        if let Some(secret) = &self.static_secret {
            if secret.len() < SECRET_MIN_SIZE {
                return Err(Error::Config(format!(
                    "static secret requires at least {SECRET_MIN_SIZE} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`EndpointOptions`] with `build()` validation.
///
/// # Example
///
/// ```rust,no_run
/// use strand::{EndpointOptionsBuilder, Splitting};
///
/// let opts = EndpointOptionsBuilder::new()
///     .max_streams(64)
///     .alpns(vec![b"strand-test".to_vec()])
///     .enable_datagrams(Splitting::Active, 4096)
///     .build()
///     .expect("invalid options");
/// ```
#[derive(Default)]
pub struct EndpointOptionsBuilder {
    opts: EndpointOptions,
}

impl EndpointOptionsBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the peer's concurrent bidirectional stream allowance.
    pub fn max_streams(mut self, n: u64) -> Self {
        self.opts.max_streams = n;
        self
    }

    /// Set ALPNs advertised on outbound connections.
    pub fn outbound_alpns(mut self, alpns: Vec<Vec<u8>>) -> Self {
        self.opts.outbound_alpns = alpns;
        self
    }

    /// Set ALPNs accepted on inbound connections.
    pub fn inbound_alpns(mut self, alpns: Vec<Vec<u8>>) -> Self {
        self.opts.inbound_alpns = alpns;
        self
    }

    /// Set both ALPN directions to the same values.
    pub fn alpns(mut self, alpns: Vec<Vec<u8>>) -> Self {
        self.opts.outbound_alpns = alpns.clone();
        self.opts.inbound_alpns = alpns;
        self
    }

    /// Limit the time a handshake may take before the connection is
    /// closed.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.opts.handshake_timeout = Some(timeout);
        self
    }

    /// Send keep-alive PINGs at this interval. Zero disables.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.opts.keep_alive = interval;
        self
    }

    /// Set the advertised idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.opts.idle_timeout = timeout;
        self
    }

    /// Enable datagrams with the given splitting policy and reassembly
    /// buffer size.
    pub fn enable_datagrams(mut self, splitting: Splitting, bufsize: usize) -> Self {
        self.opts.datagrams = Some(DatagramConfig { splitting, bufsize });
        self
    }

    /// Provide the static secret used for reset-token derivation. Must be
    /// at least [`SECRET_MIN_SIZE`] bytes; pass a hash rather than raw key
    /// material.
    pub fn static_secret(mut self, secret: Vec<u8>) -> Self {
        self.opts.static_secret = Some(secret);
        self
    }

    /// Divert outbound packets to `hook` instead of an OS socket.
    pub fn manual_routing(mut self, hook: SendHook) -> Self {
        self.opts.manual_routing = Some(hook);
        self
    }

    /// Validate and build the final [`EndpointOptions`].
    pub fn build(self) -> Result<EndpointOptions, Error> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

// ── Per-connection callbacks ────────────────────────────────────────

/// Callback bundle for an outbound connection.
#[derive(Default, Clone)]
pub struct ConnectOptions {
    /// TLS server name to present; defaults to "localhost".
    pub server_name: Option<String>,
    /// Fires once the handshake completes.
    pub on_established: Option<ConnOpenCb>,
    /// Fires once when the connection closes or is lost.
    pub on_closed: Option<ConnClosedCb>,
    /// Default data callback for peer-opened streams.
    pub stream_data_cb: Option<StreamDataCb>,
    /// Default close callback for peer-opened streams.
    pub stream_close_cb: Option<StreamCloseCb>,
    /// Invoked when the peer opens a stream.
    pub stream_open_cb: Option<StreamOpenCb>,
    /// Invoked for each delivered datagram.
    pub datagram_cb: Option<DatagramCb>,
}

/// Callback bundle installed by `listen()`, applied to every inbound
/// connection.
#[derive(Default, Clone)]
pub struct ListenOptions {
    /// Fires once per inbound connection when its handshake completes.
    pub on_established: Option<ConnOpenCb>,
    /// Fires once when an inbound connection closes.
    pub on_closed: Option<ConnClosedCb>,
    /// Default data callback for peer-opened streams.
    pub stream_data_cb: Option<StreamDataCb>,
    /// Default close callback for peer-opened streams.
    pub stream_close_cb: Option<StreamCloseCb>,
    /// Invoked when the peer opens a stream.
    pub stream_open_cb: Option<StreamOpenCb>,
    /// Invoked for each delivered datagram.
    pub datagram_cb: Option<DatagramCb>,
}

/// Build the engine transport parameters an endpoint's connections use.
pub(crate) fn transport_config(opts: &EndpointOptions) -> quinn_proto::TransportConfig {
    let mut tc = quinn_proto::TransportConfig::default();
    tc.max_concurrent_bidi_streams(
        quinn_proto::VarInt::from_u64(opts.max_streams).unwrap_or(quinn_proto::VarInt::MAX),
    );
    tc.max_concurrent_uni_streams(0u32.into());
    if opts.keep_alive > Duration::ZERO {
        tc.keep_alive_interval(Some(opts.keep_alive));
    }
    match quinn_proto::IdleTimeout::try_from(opts.idle_timeout) {
        Ok(idle) => {
            tc.max_idle_timeout(Some(idle));
        }
        Err(_) => {
            tc.max_idle_timeout(None);
        }
    }
    if opts.datagrams.is_some() {
        tc.datagram_receive_buffer_size(Some(1024 * 1024));
        tc.datagram_send_buffer_size(1024 * 1024);
    } else {
        tc.datagram_receive_buffer_size(None);
    }
    tc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_bufsize_bounds() {
        for ok in [4usize, 4096, 16384] {
            let r = EndpointOptionsBuilder::new()
                .enable_datagrams(Splitting::Active, ok)
                .build();
            assert!(r.is_ok(), "bufsize {ok} should be accepted");
        }
        for bad in [0usize, 5, 16388] {
            let r = EndpointOptionsBuilder::new()
                .enable_datagrams(Splitting::Active, bad)
                .build();
            assert!(r.is_err(), "bufsize {bad} should be rejected");
        }
    }

    #[test]
    fn test_static_secret_length() {
        assert!(EndpointOptionsBuilder::new()
            .static_secret(vec![7u8; 16])
            .build()
            .is_ok());
        assert!(EndpointOptionsBuilder::new()
            .static_secret(vec![7u8; 15])
            .build()
            .is_err());
    }

    #[test]
    fn test_defaults() {
        let opts = EndpointOptionsBuilder::new().build().unwrap();
        assert_eq!(opts.max_streams, DEFAULT_MAX_STREAMS);
        assert_eq!(opts.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert!(opts.datagrams.is_none());
        assert!(opts.static_secret.is_none());
    }
}
