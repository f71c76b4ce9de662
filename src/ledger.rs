use log::warn;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::peer::message::Bitfield;
use crate::torrent::{HASH_LEN, Torrent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    /// At least one session is fetching it. The piece stays selectable.
    InFlight,
    Verified,
}

/// Outcome of a submission that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The bytes matched and the piece is now verified.
    Accepted,
    /// Another session got there first. Nothing changed.
    AlreadyVerified,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PieceError {
    #[error("piece {index} failed hash check")]
    HashMismatch { index: usize },

    #[error("piece {index} does not exist")]
    OutOfRange { index: usize },

    #[error("piece {index} has {actual} bytes, expected {expected}")]
    WrongSize {
        index: usize,
        expected: u64,
        actual: usize,
    },
}

#[derive(Debug)]
struct PieceRecord {
    expected_hash: [u8; HASH_LEN],
    size: u64,
    in_flight: usize,
    bytes: Option<Vec<u8>>,
}

/// Per-piece download state shared by every session of a transfer.
///
/// The ledger is the only owner of verified piece data. A piece becomes
/// `Verified` only once its bytes hash to the expected digest, and stays so.
#[derive(Debug)]
pub struct PieceLedger {
    pieces: Vec<PieceRecord>,
    completed: usize,
    completed_bytes: u64,
    total_bytes: u64,
}

impl PieceLedger {
    pub fn new(torrent: &Torrent) -> Self {
        let pieces = (0..torrent.piece_count())
            .filter_map(|i| {
                Some(PieceRecord {
                    expected_hash: *torrent.piece_hash(i)?,
                    size: torrent.piece_size(i)?,
                    in_flight: 0,
                    bytes: None,
                })
            })
            .collect();

        Self {
            pieces,
            completed: 0,
            completed_bytes: 0,
            total_bytes: torrent.total_size(),
        }
    }

    /// Lowest-indexed piece that is not verified and that `bitfield` offers.
    pub fn select_next(&self, bitfield: &Bitfield) -> Option<usize> {
        self.pieces
            .iter()
            .enumerate()
            .find(|(i, piece)| piece.bytes.is_none() && bitfield.has_piece(*i))
            .map(|(i, _)| i)
    }

    pub fn begin_fetch(&mut self, index: usize) {
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.in_flight += 1;
        }
    }

    pub fn end_fetch(&mut self, index: usize) {
        if let Some(piece) = self.pieces.get_mut(index) {
            piece.in_flight = piece.in_flight.saturating_sub(1);
        }
    }

    /// Checks `bytes` against the expected hash of piece `index` and stores
    /// them on a match. The first valid submission wins; later ones for the
    /// same piece change nothing.
    pub fn try_submit(&mut self, index: usize, bytes: Vec<u8>) -> Result<Submission, PieceError> {
        let piece = self
            .pieces
            .get_mut(index)
            .ok_or(PieceError::OutOfRange { index })?;

        if piece.bytes.is_some() {
            return Ok(Submission::AlreadyVerified);
        }
        if bytes.len() as u64 != piece.size {
            return Err(PieceError::WrongSize {
                index,
                expected: piece.size,
                actual: bytes.len(),
            });
        }

        let digest: [u8; HASH_LEN] = Sha1::digest(&bytes).into();
        if digest != piece.expected_hash {
            return Err(PieceError::HashMismatch { index });
        }

        self.completed += 1;
        self.completed_bytes += piece.size;
        piece.bytes = Some(bytes);
        Ok(Submission::Accepted)
    }

    /// Boolean form of [`try_submit`](Self::try_submit): true iff piece
    /// `index` is verified afterwards.
    pub fn submit(&mut self, index: usize, bytes: Vec<u8>) -> bool {
        match self.try_submit(index, bytes) {
            Ok(_) => true,
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.pieces.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn status(&self, index: usize) -> Option<PieceStatus> {
        let piece = self.pieces.get(index)?;
        Some(if piece.bytes.is_some() {
            PieceStatus::Verified
        } else if piece.in_flight > 0 {
            PieceStatus::InFlight
        } else {
            PieceStatus::Missing
        })
    }

    pub fn verified_piece(&self, index: usize) -> Option<&[u8]> {
        self.pieces.get(index)?.bytes.as_deref()
    }

    /// Verified pieces in index order. Stops at the first gap.
    pub fn verified_pieces(&self) -> impl Iterator<Item = &[u8]> {
        self.pieces.iter().map_while(|piece| piece.bytes.as_deref())
    }
}
