//! Unreliable datagrams with optional packet splitting.
//!
//! With splitting off, application datagrams map one-to-one onto engine
//! datagrams and anything over the engine's per-packet maximum is
//! rejected. With splitting on, every datagram carries a 2-byte
//! big-endian header:
//!
//! ```text
//!   bits 15..2   datagram id (14-bit counter, monotonic per connection)
//!   bits  1..0   tag: 00 whole, 01 first half, 10 second half
//! ```
//!
//! so an oversized datagram can travel as two engine datagrams and be
//! rejoined on arrival. Halves wait for their partner in a rotating
//! buffer of four rows indexed by datagram id; as the id window advances,
//! the oldest row is cleared and its unpaired halves are dropped without
//! delivery. That bounds reassembly memory no matter how much loss or
//! reordering the path produces.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::config::DatagramConfig;
use crate::error::Error;
use crate::metrics;
use crate::types::Splitting;

/// Bytes of header prepended to every datagram when splitting is active.
pub(crate) const DGRAM_HEADER_LEN: usize = 2;

const TAG_WHOLE: u16 = 0b00;
const TAG_FIRST: u16 = 0b01;
const TAG_SECOND: u16 = 0b10;

/// Which half of a split datagram a piece carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    First,
    Second,
}

/// Per-connection datagram state: splitting policy, id allocation, the
/// engine-blocked send queue, and the reassembly buffer.
pub(crate) struct DatagramEngine {
    splitting: Splitting,
    /// 14-bit id counter for outgoing split-mode datagrams.
    next_id: u16,
    /// Datagrams the engine refused with a full buffer, flushed when it
    /// signals unblocked.
    pub(crate) unsent: VecDeque<Bytes>,
    recv_buffer: RotatingBuffer,
}

impl DatagramEngine {
    pub(crate) fn new(config: &DatagramConfig) -> Self {
        Self {
            splitting: config.splitting,
            next_id: 0,
            unsent: VecDeque::new(),
            recv_buffer: RotatingBuffer::new(config.bufsize),
        }
    }

    /// Application-visible maximum for one datagram given the engine's
    /// per-packet maximum (`None` before the handshake settles).
    pub(crate) fn max_datagram_size(&self, engine_max: Option<usize>) -> usize {
        let engine_max = match engine_max {
            Some(m) => m,
            None => return 0,
        };
        match self.splitting {
            Splitting::None => engine_max,
            Splitting::Active => 2 * engine_max.saturating_sub(DGRAM_HEADER_LEN),
        }
    }

    /// Turn an application datagram into one or two engine datagrams.
    /// Size violations fail synchronously.
    pub(crate) fn prepare_send(
        &mut self,
        data: Bytes,
        engine_max: Option<usize>,
    ) -> Result<Vec<Bytes>, Error> {
        let max = self.max_datagram_size(engine_max);
        if data.len() > max {
            return Err(Error::DatagramTooLarge {
                size: data.len(),
                max,
            });
        }

        match self.splitting {
            Splitting::None => Ok(vec![data]),
            Splitting::Active => {
                let id = self.next_id;
                self.next_id = (self.next_id + 1) & 0x3fff;

                let engine_max = engine_max.unwrap_or(0);
                if data.len() + DGRAM_HEADER_LEN <= engine_max {
                    Ok(vec![encode_piece(id, TAG_WHOLE, &data)])
                } else {
                    let half = data.len() / 2;
                    Ok(vec![
                        encode_piece(id, TAG_FIRST, &data[..half]),
                        encode_piece(id, TAG_SECOND, &data[half..]),
                    ])
                }
            }
        }
    }

    /// Process an inbound engine datagram. Returns a complete application
    /// datagram when one is ready for delivery.
    pub(crate) fn receive(&mut self, data: Bytes) -> Option<Bytes> {
        match self.splitting {
            Splitting::None => Some(data),
            Splitting::Active => {
                if data.len() < DGRAM_HEADER_LEN {
                    debug!("dropping runt datagram of {} bytes", data.len());
                    return None;
                }
                let header = u16::from_be_bytes([data[0], data[1]]);
                let id = header >> 2;
                let payload = data.slice(DGRAM_HEADER_LEN..);
                match header & 0b11 {
                    TAG_WHOLE => Some(payload),
                    TAG_FIRST => self.recv_buffer.receive(id, Part::First, payload),
                    TAG_SECOND => self.recv_buffer.receive(id, Part::Second, payload),
                    _ => {
                        debug!("dropping datagram {id} with reserved tag");
                        None
                    }
                }
            }
        }
    }
}

fn encode_piece(id: u16, tag: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DGRAM_HEADER_LEN + payload.len());
    buf.put_u16((id << 2) | tag);
    buf.put_slice(payload);
    buf.freeze()
}

// ── Reassembly ──────────────────────────────────────────────────────

struct StoredHalf {
    id: u16,
    part: Part,
    data: Bytes,
}

/// Four-row rotating buffer of unpaired halves.
///
/// A half with id N lands in slot `[(N % bufsize) / rowsize][N % rowsize]`.
/// After storing into row `i`, the row two ahead is cleared, provided it
/// is the successor of the last row cleared; the cleared row's halves are
/// dropped, never delivered. Total capacity is bounded by `bufsize`
/// slots.
struct RotatingBuffer {
    rows: [Vec<Option<StoredHalf>>; 4],
    bufsize: usize,
    rowsize: usize,
    last_cleared: Option<usize>,
    held: [usize; 4],
}

impl RotatingBuffer {
    fn new(bufsize: usize) -> Self {
        assert!(bufsize > 0 && bufsize % 4 == 0, "bufsize must be 4-row divisible");
        let rowsize = bufsize / 4;
        Self {
            rows: std::array::from_fn(|_| {
                let mut row = Vec::with_capacity(rowsize);
                row.resize_with(rowsize, || None);
                row
            }),
            bufsize,
            rowsize,
            last_cleared: None,
            held: [0; 4],
        }
    }

    fn receive(&mut self, id: u16, part: Part, data: Bytes) -> Option<Bytes> {
        let idx = id as usize % self.bufsize;
        let row = idx / self.rowsize;
        let col = idx % self.rowsize;
        trace!("datagram {id} half at buffer pos [{row},{col}]");

        let slot = &mut self.rows[row][col];
        match slot.take() {
            Some(stored) if stored.id == id && stored.part != part => {
                self.held[row] -= 1;
                let mut whole = BytesMut::with_capacity(stored.data.len() + data.len());
                match stored.part {
                    Part::First => {
                        whole.put_slice(&stored.data);
                        whole.put_slice(&data);
                    }
                    Part::Second => {
                        whole.put_slice(&data);
                        whole.put_slice(&stored.data);
                    }
                }
                Some(whole.freeze())
            }
            previous => {
                // Duplicate or stale occupant: replace it.
                if previous.is_none() {
                    self.held[row] += 1;
                }
                *slot = Some(StoredHalf { id, part, data });
                self.rotate_from(row);
                None
            }
        }
    }

    /// Advance the clearing cursor: storing into row `i` clears the row
    /// two ahead, once per window step.
    fn rotate_from(&mut self, row: usize) {
        let to_clear = (row + 2) % 4;
        let next = match self.last_cleared {
            Some(last) => (last + 1) % 4,
            None => 0,
        };
        if to_clear == next {
            let dropped = self.held[to_clear];
            if dropped > 0 {
                debug!("rotating datagram buffer row {to_clear}, dropping {dropped} halves");
                metrics::DATAGRAMS_DROPPED.add(dropped as u64);
            }
            for slot in &mut self.rows[to_clear] {
                *slot = None;
            }
            self.held[to_clear] = 0;
            self.last_cleared = Some(to_clear);
        }
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.held.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(bufsize: usize) -> DatagramEngine {
        DatagramEngine::new(&DatagramConfig {
            splitting: Splitting::Active,
            bufsize,
        })
    }

    #[test]
    fn test_header_roundtrip() {
        let piece = encode_piece(0x1abc, TAG_SECOND, b"xy");
        assert_eq!(piece.len(), 4);
        let header = u16::from_be_bytes([piece[0], piece[1]]);
        assert_eq!(header >> 2, 0x1abc);
        assert_eq!(header & 0b11, TAG_SECOND);
        assert_eq!(&piece[2..], b"xy");
    }

    #[test]
    fn test_max_size_none_mode() {
        let e = DatagramEngine::new(&DatagramConfig {
            splitting: Splitting::None,
            bufsize: 4096,
        });
        assert_eq!(e.max_datagram_size(None), 0);
        assert_eq!(e.max_datagram_size(Some(1200)), 1200);
    }

    #[test]
    fn test_max_size_active_mode() {
        let e = engine(4096);
        assert_eq!(e.max_datagram_size(Some(1200)), 2 * (1200 - 2));
    }

    #[test]
    fn test_none_mode_rejects_oversize() {
        let mut e = DatagramEngine::new(&DatagramConfig {
            splitting: Splitting::None,
            bufsize: 4096,
        });
        let data = Bytes::from(vec![0u8; 1201]);
        assert!(matches!(
            e.prepare_send(data, Some(1200)),
            Err(Error::DatagramTooLarge { size: 1201, max: 1200 })
        ));
        let exact = Bytes::from(vec![0u8; 1200]);
        assert_eq!(e.prepare_send(exact, Some(1200)).unwrap().len(), 1);
    }

    #[test]
    fn test_small_datagram_goes_whole() {
        let mut e = engine(4096);
        let pieces = e.prepare_send(Bytes::from_static(b"hi"), Some(1200)).unwrap();
        assert_eq!(pieces.len(), 1);
        let header = u16::from_be_bytes([pieces[0][0], pieces[0][1]]);
        assert_eq!(header & 0b11, TAG_WHOLE);
    }

    #[test]
    fn test_split_roundtrip() {
        let mut tx = engine(4096);
        let mut rx = engine(4096);

        let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        let pieces = tx
            .prepare_send(Bytes::from(payload.clone()), Some(1200))
            .unwrap();
        assert_eq!(pieces.len(), 2);

        assert!(rx.receive(pieces[0].clone()).is_none());
        let whole = rx.receive(pieces[1].clone()).expect("second half completes");
        assert_eq!(&whole[..], &payload[..]);
    }

    #[test]
    fn test_split_reordered_halves() {
        let mut tx = engine(4096);
        let mut rx = engine(4096);

        let payload: Vec<u8> = (0..1999u32).map(|i| (i * 7) as u8).collect();
        let pieces = tx
            .prepare_send(Bytes::from(payload.clone()), Some(1200))
            .unwrap();

        assert!(rx.receive(pieces[1].clone()).is_none());
        let whole = rx.receive(pieces[0].clone()).expect("first half completes");
        assert_eq!(&whole[..], &payload[..]);
    }

    #[test]
    fn test_ids_monotonic_and_masked() {
        let mut e = engine(4096);
        e.next_id = 0x3fff;
        e.prepare_send(Bytes::from_static(b"a"), Some(1200)).unwrap();
        assert_eq!(e.next_id, 0, "id counter wraps at 14 bits");
    }

    #[test]
    fn test_rotation_drops_stale_halves() {
        // 16 slots: rows of 4. Store only the first half of datagram 0,
        // then push whole rows of ids past it; by the time the window
        // wraps, the stale half must be gone rather than mispaired.
        let mut rx = engine(16);

        assert!(rx
            .receive(encode_piece(0, TAG_FIRST, b"old").into())
            .is_none());
        assert_eq!(rx.recv_buffer.stored(), 1);

        // Advance through the id space without ever completing a pair.
        for id in 4..16u16 {
            assert!(rx
                .receive(encode_piece(id, TAG_FIRST, b"x").into())
                .is_none());
        }

        // Wrapped id 16 maps to slot 0's row; row 0 must have been
        // cleared by rotation, so the old half never pairs.
        let second = rx.receive(encode_piece(0, TAG_SECOND, b"new").into());
        assert!(second.is_none(), "stale half must not complete a pair");
    }

    #[test]
    fn test_buffer_capacity_bounded() {
        let mut rx = engine(16);
        for id in 0..64u16 {
            rx.receive(encode_piece(id, TAG_FIRST, b"x").into());
        }
        assert!(rx.recv_buffer.stored() <= 16);
    }
}
