//! Minimal bencode list codec.
//!
//! Only the shapes used by the request protocol are supported: a single
//! top-level list whose elements are byte strings and integers. The
//! consumer is strict about canonical encoding (no leading zeros, no
//! negative zero) so a malformed peer is rejected rather than
//! round-tripped.

use crate::error::ParseError;

/// Incremental encoder for a bencode list.
///
/// Elements are appended in order; [`finish`](Self::finish) closes the
/// list, [`into_framed`](Self::into_framed) additionally prepends the
/// `<len>:` wire prefix.
pub struct ListProducer {
    buf: Vec<u8>,
}

impl ListProducer {
    /// Start a new list.
    pub fn new() -> Self {
        Self { buf: vec![b'l'] }
    }

    /// Append a byte string element.
    pub fn append_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data.len().to_string().as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(data);
        self
    }

    /// Append an integer element.
    pub fn append_int(&mut self, value: i64) -> &mut Self {
        self.buf.push(b'i');
        self.buf.extend_from_slice(value.to_string().as_bytes());
        self.buf.push(b'e');
        self
    }

    /// Close the list and return the encoded bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(b'e');
        self.buf
    }

    /// Close the list and return it with the `<len>:` frame prefix.
    pub fn into_framed(self) -> Vec<u8> {
        let body = self.finish();
        let mut framed = Vec::with_capacity(body.len() + 12);
        framed.extend_from_slice(body.len().to_string().as_bytes());
        framed.push(b':');
        framed.extend_from_slice(&body);
        framed
    }
}

impl Default for ListProducer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder over an encoded bencode list.
///
/// Borrows the input; byte-string elements are returned as subslices.
pub struct ListConsumer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ListConsumer<'a> {
    /// Open a list. Fails unless the input starts with `l`.
    pub fn new(data: &'a [u8]) -> Result<Self, ParseError> {
        if data.first() != Some(&b'l') {
            return Err(ParseError::Bencode("expected list"));
        }
        Ok(Self { data, pos: 1 })
    }

    /// True once the cursor sits on the list terminator.
    pub fn at_end(&self) -> bool {
        self.data.get(self.pos) == Some(&b'e')
    }

    /// Consume the next element as a byte string.
    pub fn next_bytes(&mut self) -> Result<&'a [u8], ParseError> {
        let rest = &self.data[self.pos..];
        let colon = rest
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::Bencode("unterminated string length"))?;
        let len = parse_decimal(&rest[..colon])?;
        let start = self.pos + colon + 1;
        let end = start
            .checked_add(len)
            .ok_or(ParseError::Bencode("string length overflow"))?;
        if end > self.data.len() {
            return Err(ParseError::Bencode("string runs past end of list"));
        }
        self.pos = end;
        Ok(&self.data[start..end])
    }

    /// Consume the next element as an integer.
    pub fn next_int(&mut self) -> Result<i64, ParseError> {
        let rest = &self.data[self.pos..];
        if rest.first() != Some(&b'i') {
            return Err(ParseError::Bencode("expected integer"));
        }
        let end = rest
            .iter()
            .position(|&b| b == b'e')
            .ok_or(ParseError::Bencode("unterminated integer"))?;
        let digits = &rest[1..end];
        let (neg, digits) = match digits.split_first() {
            Some((&b'-', tail)) => (true, tail),
            _ => (false, digits),
        };
        if digits.is_empty() {
            return Err(ParseError::Bencode("empty integer"));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(ParseError::Bencode("leading zero in integer"));
        }
        if neg && digits == b"0" {
            return Err(ParseError::Bencode("negative zero"));
        }
        let magnitude = parse_decimal(digits)? as i64;
        self.pos += end + 1;
        Ok(if neg { -magnitude } else { magnitude })
    }
}

/// Parse an ASCII decimal with no sign and no leading zeros (except "0").
fn parse_decimal(digits: &[u8]) -> Result<usize, ParseError> {
    if digits.is_empty() {
        return Err(ParseError::Bencode("empty number"));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(ParseError::Bencode("leading zero"));
    }
    let mut value: usize = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ParseError::Bencode("non-digit in number"));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(ParseError::Bencode("number overflow"))?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_consume() {
        let mut p = ListProducer::new();
        p.append_bytes(b"C").append_int(42).append_bytes(b"ping");
        p.append_bytes(b"");
        let encoded = p.finish();
        assert_eq!(encoded, b"l1:Ci42e4:ping0:e");

        let mut c = ListConsumer::new(&encoded).unwrap();
        assert_eq!(c.next_bytes().unwrap(), b"C");
        assert_eq!(c.next_int().unwrap(), 42);
        assert_eq!(c.next_bytes().unwrap(), b"ping");
        assert_eq!(c.next_bytes().unwrap(), b"");
        assert!(c.at_end());
    }

    #[test]
    fn test_negative_int() {
        let mut p = ListProducer::new();
        p.append_int(-17);
        let encoded = p.finish();
        let mut c = ListConsumer::new(&encoded).unwrap();
        assert_eq!(c.next_int().unwrap(), -17);
    }

    #[test]
    fn test_framed_prefix() {
        let mut p = ListProducer::new();
        p.append_bytes(b"R").append_int(0).append_bytes(b"ok");
        let framed = p.into_framed();
        // body = "l1:Ri0e2:oke" (12 bytes)
        assert_eq!(framed, b"12:l1:Ri0e2:oke");
    }

    #[test]
    fn test_reject_not_a_list() {
        assert!(ListConsumer::new(b"i5e").is_err());
        assert!(ListConsumer::new(b"").is_err());
    }

    #[test]
    fn test_reject_malformed_int() {
        let mut c = ListConsumer::new(b"li007ee").unwrap();
        assert!(c.next_int().is_err());
        let mut c = ListConsumer::new(b"li-0ee").unwrap();
        assert!(c.next_int().is_err());
        let mut c = ListConsumer::new(b"liee").unwrap();
        assert!(c.next_int().is_err());
        let mut c = ListConsumer::new(b"li12").unwrap();
        assert!(c.next_int().is_err());
    }

    #[test]
    fn test_reject_truncated_string() {
        let mut c = ListConsumer::new(b"l5:abce").unwrap();
        assert!(c.next_bytes().is_err());
        let mut c = ListConsumer::new(b"l5abc").unwrap();
        assert!(c.next_bytes().is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let mut c = ListConsumer::new(b"l3:abce").unwrap();
        assert!(c.next_int().is_err());
    }
}
