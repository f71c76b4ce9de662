use thiserror::Error;

use crate::bencode_parser::BencodeError;

/// Errors that end a download before or instead of any peer traffic.
///
/// Per-peer failures never surface here: they are
/// [`SessionError`](crate::peer::session::SessionError)s contained inside the
/// orchestrator's worker loops.
#[derive(Debug, Error)]
pub enum Error {
    /// The metadata descriptor is missing fields or is internally inconsistent.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    /// The descriptor is not valid bencode.
    #[error("malformed descriptor: {0}")]
    Bencode(#[from] BencodeError),

    /// Every discovery source failed, or none returned a peer.
    #[error("peer discovery failed: {0}")]
    DiscoveryFailure(String),

    /// The download stopped before every piece was verified.
    #[error("download incomplete: {completed} of {total} pieces verified")]
    Incomplete { completed: usize, total: usize },

    /// Reading the descriptor or writing the finished download failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedDescriptor(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
