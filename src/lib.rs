//! A BitTorrent downloader.
//!
//! [`Torrent`] describes the content, [`PieceLedger`] tracks which pieces are
//! verified, and [`BitTorrentClient`] runs a bounded pool of peer sessions
//! against that ledger until every piece hash-checks.

pub mod bencode_parser;
pub mod config;
pub mod error;
pub mod ledger;
pub mod peer;
pub mod storage;
pub mod torrent;
pub mod tracker;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::{Value, encode, parse};
pub use error::{Error, Result};
pub use ledger::PieceLedger;
pub use peer::client::{BitTorrentClient, DownloadSummary};
pub use peer::{Peer, PeerId};
pub use torrent::{Torrent, parse_torrent_bytes, parse_torrent_file};
