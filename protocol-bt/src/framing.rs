//! Length-prefix parsing and incremental frame assembly.
//!
//! The wire format for each message is `<decimal-length>:<payload>`. The
//! length prefix may arrive split across chunks, so [`FrameAssembler`]
//! buffers partial prefixes and partial payloads between calls.

use crate::error::ParseError;

/// Maximum payload bytes a single frame may announce.
pub const MAX_FRAME_LEN: usize = 10_000_000;

/// Maximum bytes (digits plus colon) a valid length prefix can occupy.
///
/// Seeing this many bytes without a colon means the input cannot be a
/// valid prefix, regardless of what follows.
pub const MAX_FRAME_LEN_ENCODED: usize = 9;

/// Parse a length prefix from the front of `input`.
///
/// Returns `Ok(None)` when no colon has arrived yet (caller should buffer
/// and retry), or `Ok(Some((consumed, len)))` where `consumed` counts the
/// digits plus the colon.
///
/// Errors on a zero length, a length above [`MAX_FRAME_LEN`], non-digit
/// characters before the colon, or a prefix that has already run past
/// [`MAX_FRAME_LEN_ENCODED`] bytes without terminating.
pub fn parse_length(input: &[u8]) -> Result<Option<(usize, usize)>, ParseError> {
    let colon = match input.iter().position(|&b| b == b':') {
        Some(pos) => pos,
        None => {
            if input.len() >= MAX_FRAME_LEN_ENCODED {
                return Err(ParseError::UnterminatedLength);
            }
            return Ok(None);
        }
    };

    let digits = &input[..colon];
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidLength);
    }

    let mut len: usize = 0;
    for &b in digits {
        len = len
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(ParseError::InvalidLength)?;
    }

    if len == 0 {
        return Err(ParseError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ParseError::FrameTooLarge(len));
    }

    Ok(Some((colon + 1, len)))
}

/// Incremental frame assembler.
///
/// Feed arbitrary chunks of stream data via [`push`](Self::push); complete
/// frames come out in arrival order. A parse error is terminal: the caller
/// is expected to tear the stream down.
#[derive(Default)]
pub struct FrameAssembler {
    /// Partial length prefix carried over between chunks.
    size_buf: Vec<u8>,
    /// Partial payload of the frame currently being assembled.
    buf: Vec<u8>,
    /// Announced length of the current frame; 0 while parsing the prefix.
    current_len: usize,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning any frames it completed.
    pub fn push(&mut self, mut data: &[u8]) -> Result<Vec<Vec<u8>>, ParseError> {
        let mut frames = Vec::new();

        while !data.is_empty() {
            if self.current_len == 0 {
                if !self.size_buf.is_empty() {
                    // Resume a split prefix: top the carry buffer up to the
                    // maximum prefix size before retrying the parse.
                    let prev = self.size_buf.len();
                    let take = data.len().min(MAX_FRAME_LEN_ENCODED);
                    self.size_buf.extend_from_slice(&data[..take]);
                    match parse_length(&self.size_buf)? {
                        Some((consumed, len)) => {
                            self.current_len = len;
                            data = &data[consumed - prev..];
                            self.size_buf.clear();
                        }
                        None => return Ok(frames),
                    }
                } else {
                    match parse_length(data)? {
                        Some((consumed, len)) => {
                            self.current_len = len;
                            data = &data[consumed..];
                        }
                        None => {
                            self.size_buf.extend_from_slice(data);
                            return Ok(frames);
                        }
                    }
                }
            }

            debug_assert!(self.current_len > 0);

            if self.buf.len() + data.len() >= self.current_len {
                // Enough for a complete frame; carve it out and continue
                // with whatever trails it in this chunk.
                let need = self.current_len - self.buf.len();
                self.buf.extend_from_slice(&data[..need]);
                data = &data[need..];
                frames.push(std::mem::take(&mut self.buf));
                self.current_len = 0;
            } else {
                self.buf.reserve(self.current_len - self.buf.len());
                self.buf.extend_from_slice(data);
                return Ok(frames);
            }
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_length_incomplete() {
        assert_eq!(parse_length(b"").unwrap(), None);
        assert_eq!(parse_length(b"12").unwrap(), None);
    }

    #[test]
    fn test_parse_length_ok() {
        assert_eq!(parse_length(b"5:hello").unwrap(), Some((2, 5)));
        assert_eq!(parse_length(b"10000000:").unwrap(), Some((9, 10_000_000)));
    }

    #[test]
    fn test_parse_length_zero() {
        assert_eq!(parse_length(b"0:"), Err(ParseError::EmptyFrame));
    }

    #[test]
    fn test_parse_length_too_large() {
        assert_eq!(
            parse_length(b"10000001:"),
            Err(ParseError::FrameTooLarge(10_000_001))
        );
    }

    #[test]
    fn test_parse_length_garbage() {
        assert_eq!(parse_length(b"5x:"), Err(ParseError::InvalidLength));
        assert_eq!(parse_length(b":"), Err(ParseError::InvalidLength));
    }

    #[test]
    fn test_parse_length_unterminated() {
        // Nine digits with no colon can never become a valid prefix.
        assert_eq!(
            parse_length(b"123456789"),
            Err(ParseError::UnterminatedLength)
        );
    }

    #[test]
    fn test_assemble_whole() {
        let mut a = FrameAssembler::new();
        let frames = a.push(b"5:hello3:abc").unwrap();
        assert_eq!(frames, vec![b"hello".to_vec(), b"abc".to_vec()]);
    }

    #[test]
    fn test_assemble_split_payload() {
        let mut a = FrameAssembler::new();
        assert!(a.push(b"11:hello").unwrap().is_empty());
        let frames = a.push(b" world").unwrap();
        assert_eq!(frames, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn test_assemble_split_prefix() {
        let mut a = FrameAssembler::new();
        assert!(a.push(b"1").unwrap().is_empty());
        assert!(a.push(b"1").unwrap().is_empty());
        let frames = a.push(b":hello world").unwrap();
        assert_eq!(frames, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn test_assemble_byte_at_a_time() {
        let mut a = FrameAssembler::new();
        let mut frames = Vec::new();
        for &b in b"3:abc2:xy".iter() {
            frames.extend(a.push(&[b]).unwrap());
        }
        assert_eq!(frames, vec![b"abc".to_vec(), b"xy".to_vec()]);
    }

    #[test]
    fn test_assemble_error_propagates() {
        let mut a = FrameAssembler::new();
        assert!(a.push(b"0:").is_err());
    }
}
