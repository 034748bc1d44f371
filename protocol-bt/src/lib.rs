//! Bencode codec and length-prefixed framing for the strand BT request
//! protocol.
//!
//! Each message on the wire is an ASCII decimal length, a colon, then a
//! bencode list. This crate provides the pieces needed by both sides of
//! the protocol:
//!
//! - [`ListProducer`] / [`ListConsumer`]: a minimal bencode list codec
//!   covering byte strings and integers.
//! - [`parse_length`]: the length-prefix parser with its size limits.
//! - [`FrameAssembler`]: an incremental assembler that turns an arbitrary
//!   sequence of byte chunks into complete frames.
//!
//! # Example
//!
//! ```
//! use protocol_bt::{FrameAssembler, ListConsumer, ListProducer};
//!
//! // Encode a command frame.
//! let mut list = ListProducer::new();
//! list.append_bytes(b"C");
//! list.append_int(7);
//! list.append_bytes(b"ping");
//! list.append_bytes(b"payload");
//! let frame = list.into_framed();
//!
//! // Reassemble and decode it, possibly from split chunks.
//! let mut assembler = FrameAssembler::new();
//! let frames = assembler.push(&frame).unwrap();
//! let mut body = ListConsumer::new(&frames[0]).unwrap();
//! assert_eq!(body.next_bytes().unwrap(), b"C");
//! assert_eq!(body.next_int().unwrap(), 7);
//! ```

mod error;
mod framing;
mod value;

pub use error::ParseError;
pub use framing::{FrameAssembler, MAX_FRAME_LEN, MAX_FRAME_LEN_ENCODED, parse_length};
pub use value::{ListConsumer, ListProducer};
