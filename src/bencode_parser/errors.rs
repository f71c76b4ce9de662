use thiserror::Error;

/// Errors produced while decoding bencoded data.
///
/// Offsets are byte positions into the buffer handed to [`parse`](super::parse).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("invalid integer at byte {offset}")]
    InvalidInteger { offset: usize },

    #[error("number out of range at byte {offset}")]
    OutOfRange { offset: usize },

    #[error("unexpected input at byte {offset}")]
    Syntax { offset: usize },

    #[error("nesting deeper than {} levels at byte {offset}", super::parser::MAX_DEPTH)]
    TooDeep { offset: usize },

    #[error("trailing data after value at byte {offset}")]
    TrailingData { offset: usize },
}
