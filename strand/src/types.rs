//! Core wire-level types: connection ids, paths, packets.

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;
use quinn_proto::EcnCodepoint;
use rand::RngCore;

/// Maximum connection id length carried by the engine.
pub const MAX_CID_LEN: usize = 20;

/// Opaque connection identifier.
///
/// strand keys its connection maps with randomly generated ids; the
/// wire-level connection ids the engine negotiates with the peer route to
/// these via the endpoint's handle table. Compared bytewise, hashable,
/// displayed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionID {
    len: u8,
    data: [u8; MAX_CID_LEN],
}

impl ConnectionID {
    /// Generate a random full-length id.
    pub fn random() -> Self {
        let mut data = [0u8; MAX_CID_LEN];
        rand::thread_rng().fill_bytes(&mut data);
        Self {
            len: MAX_CID_LEN as u8,
            data,
        }
    }

    /// Construct from raw bytes. Panics if `bytes` exceeds [`MAX_CID_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_LEN, "connection id too long");
        let mut data = [0u8; MAX_CID_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u8,
            data,
        }
    }

    /// The id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Display for ConnectionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionID({self})")
    }
}

/// Direction a connection was established in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Locally initiated via `connect()`.
    Outbound,
    /// Accepted from a remote peer.
    Inbound,
}

/// The network path of a datagram or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// An inbound UDP datagram: path, ECN codepoint, payload.
#[derive(Debug)]
pub struct Packet {
    pub path: Path,
    pub ecn: Option<EcnCodepoint>,
    pub data: BytesMut,
}

/// Datagram splitting policy (see the datagram module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Splitting {
    /// Datagrams above the engine's per-packet maximum are rejected.
    #[default]
    None,
    /// Oversized datagrams are sent as two tagged halves and reassembled
    /// by the receiver.
    Active,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_random_unique() {
        let a = ConnectionID::random();
        let b = ConnectionID::random();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), MAX_CID_LEN);
    }

    #[test]
    fn test_cid_from_bytes() {
        let id = ConnectionID::from_bytes(&[0xab, 0xcd]);
        assert_eq!(id.as_bytes(), &[0xab, 0xcd]);
        assert_eq!(id.to_string(), "abcd");
    }

    #[test]
    #[should_panic(expected = "too long")]
    fn test_cid_too_long() {
        ConnectionID::from_bytes(&[0u8; 21]);
    }
}
