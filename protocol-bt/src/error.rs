//! Error type for bencode and framing operations.

/// Error type for bencode parsing and frame assembly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    /// Not fatal - the caller should buffer more data and retry.
    #[error("incomplete data")]
    Incomplete,

    /// The length prefix could not be parsed as a decimal number.
    #[error("invalid length prefix")]
    InvalidLength,

    /// A zero-length frame was announced.
    #[error("empty frame")]
    EmptyFrame,

    /// The announced frame length exceeds the maximum.
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    /// The length prefix ran past the maximum encoded size without a colon.
    #[error("unterminated length prefix")]
    UnterminatedLength,

    /// Malformed bencode data (static description of the violation).
    #[error("bencode error: {0}")]
    Bencode(&'static str),
}

impl ParseError {
    /// Returns true if this error indicates more data is needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}
