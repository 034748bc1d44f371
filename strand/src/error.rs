use std::io;

use thiserror::Error;

/// Stream application error code: the stream was destroyed together with
/// its connection before being closed.
pub const STREAM_ERROR_CONNECTION_EXPIRED: u64 = (1 << 62) + 1;

/// Stream application error code: a stream data callback failed.
pub const STREAM_ERROR_EXCEPTION: u64 = (1 << 62) - 2;

/// Stream application error code: BT request protocol violation.
pub const BPARSER_EXCEPTION: u64 = (1 << 60) + 69;

/// Errors returned by strand operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration value; raised synchronously from builders
    /// and constructors.
    #[error("configuration: {0}")]
    Config(String),

    /// The event loop has been shut down.
    #[error("event loop closed")]
    LoopClosed,

    /// The endpoint has been closed.
    #[error("endpoint closed")]
    EndpointClosed,

    /// The connection is closing or draining and accepts no new work.
    #[error("connection closing")]
    ConnectionClosed,

    /// The connection no longer exists.
    #[error("unknown connection")]
    UnknownConnection,

    /// The stream no longer exists.
    #[error("unknown stream")]
    UnknownStream,

    /// The stream is closing and accepts no further data.
    #[error("stream closed")]
    StreamClosed,

    #[error("connect: {0}")]
    Connect(#[from] quinn_proto::ConnectError),

    #[error("connection: {0}")]
    Connection(#[from] quinn_proto::ConnectionError),

    #[error("write: {0}")]
    Write(#[from] quinn_proto::WriteError),

    #[error("read: {0}")]
    Read(#[from] quinn_proto::ReadError),

    /// Datagrams were not enabled on this endpoint.
    #[error("datagrams not enabled")]
    DatagramsDisabled,

    /// The datagram does not fit the current per-packet maximum.
    #[error("datagram of {size} bytes exceeds maximum of {max}")]
    DatagramTooLarge { size: usize, max: usize },

    /// TLS credential construction failed.
    #[error("tls: {0}")]
    Tls(String),

    #[error("bt protocol: {0}")]
    Bt(#[from] protocol_bt::ParseError),
}

/// Marker returned by a stream data callback to signal that it failed;
/// the stream is closed with [`STREAM_ERROR_EXCEPTION`] and the
/// connection survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackError;
