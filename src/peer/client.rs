use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use indicatif::HumanBytes;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

use crate::config::DownloadConfig;
use crate::ledger::{PieceLedger, Submission};
use crate::peer::session::{PeerSession, SessionError};
use crate::peer::{Peer, PeerId};
use crate::torrent::Torrent;

/// Where a download stood when every worker had stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub completed_pieces: usize,
    pub piece_count: usize,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    /// Candidates a session was attempted with.
    pub peers_tried: usize,
}

impl DownloadSummary {
    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.piece_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The download completed or was cancelled.
    Stopped,
    /// The peer has nothing left that we need.
    Exhausted,
    /// The peer kept sending bad data; `last` is the piece that tipped it over.
    TooManyHashFailures { last: usize },
}

type PeerQueue = Arc<Mutex<VecDeque<Peer>>>;

/// Drives a bounded pool of peer sessions against one shared piece ledger.
///
/// Cloning is cheap and every clone observes the same ledger and the same
/// cancellation flag.
#[derive(Clone)]
pub struct BitTorrentClient {
    torrent: Arc<Torrent>,
    ledger: Arc<Mutex<PieceLedger>>,
    config: DownloadConfig,
    peer_id: PeerId,
    cancelled: Arc<AtomicBool>,
    /// Flipped once the download is complete or cancelled. Fetches in
    /// progress are abandoned when it does.
    halt: Arc<watch::Sender<bool>>,
}

impl BitTorrentClient {
    pub fn new(torrent: Torrent, peer_id: PeerId, config: DownloadConfig) -> Self {
        let ledger = PieceLedger::new(&torrent);
        Self {
            torrent: Arc::new(torrent),
            ledger: Arc::new(Mutex::new(ledger)),
            config,
            peer_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            halt: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    pub fn ledger(&self) -> Arc<Mutex<PieceLedger>> {
        Arc::clone(&self.ledger)
    }

    /// Stops every worker. Fetches in progress are abandoned.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.halt.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub async fn is_complete(&self) -> bool {
        self.ledger.lock().await.is_complete()
    }

    /// `(completed_bytes, total_bytes)`.
    pub async fn progress(&self) -> (u64, u64) {
        let ledger = self.ledger.lock().await;
        (ledger.completed_bytes(), ledger.total_bytes())
    }

    /// Downloads from `peers` until the ledger is complete, the client is
    /// cancelled, or every candidate has been used up.
    ///
    /// At most `max_peers` sessions are open at once. The remaining
    /// candidates wait in a queue and replace sessions as they end.
    pub async fn start_download(&self, peers: Vec<Peer>) -> DownloadSummary {
        let mut seen = HashSet::new();
        let queue: VecDeque<Peer> = peers.into_iter().filter(|p| seen.insert(*p)).collect();
        let workers = self.config.max_peers.min(queue.len());
        info!(
            "downloading {} ({}, {} pieces) from {} candidate peers with {} workers",
            self.torrent.name(),
            HumanBytes(self.torrent.total_size()),
            self.torrent.piece_count(),
            queue.len(),
            workers
        );

        let queue: PeerQueue = Arc::new(Mutex::new(queue));
        let peers_tried = Arc::new(AtomicUsize::new(0));

        let deadline = self.config.timeout.map(|limit| {
            let client = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("download timed out after {limit:?}");
                client.cancel();
            })
        });

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let client = self.clone();
            let queue = Arc::clone(&queue);
            let peers_tried = Arc::clone(&peers_tried);
            set.spawn(async move { client.worker(queue, peers_tried).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("worker task failed: {e}");
            }
        }
        if let Some(handle) = deadline {
            handle.abort();
        }

        let ledger = self.ledger.lock().await;
        let summary = DownloadSummary {
            completed_pieces: ledger.completed_count(),
            piece_count: ledger.piece_count(),
            completed_bytes: ledger.completed_bytes(),
            total_bytes: ledger.total_bytes(),
            peers_tried: peers_tried.load(Ordering::SeqCst),
        };
        if summary.is_complete() {
            info!("download complete: {}", HumanBytes(summary.total_bytes));
        } else {
            warn!(
                "download stopped with {}/{} pieces",
                summary.completed_pieces, summary.piece_count
            );
        }
        summary
    }

    /// Resolves once the download is complete or cancelled.
    async fn halted(&self) {
        let mut rx = self.halt.subscribe();
        // The sender lives as long as `self`, so this only returns on halt.
        let _ = rx.wait_for(|halted| *halted).await;
    }

    async fn should_stop(&self) -> bool {
        self.is_cancelled() || self.ledger.lock().await.is_complete()
    }

    async fn worker(&self, queue: PeerQueue, peers_tried: Arc<AtomicUsize>) {
        loop {
            if self.should_stop().await {
                break;
            }
            let Some(peer) = queue.lock().await.pop_front() else {
                break;
            };
            peers_tried.fetch_add(1, Ordering::SeqCst);

            match self.run_session(peer).await {
                Ok(end) => debug!("{peer}: session ended ({end:?})"),
                Err(e) => warn!("{e}"),
            }
        }
    }

    /// Piece `index` as it goes on the wire: `(index, size)`.
    fn wire_piece(&self, index: usize) -> Option<(u32, u32)> {
        let size = self.torrent.piece_size(index)?;
        Some((u32::try_from(index).ok()?, u32::try_from(size).ok()?))
    }

    async fn run_session(&self, peer: Peer) -> Result<SessionEnd, SessionError> {
        let connecting = PeerSession::<TcpStream>::connect(
            peer,
            *self.torrent.info_hash(),
            *self.peer_id.as_bytes(),
            &self.config,
        );
        let mut session = tokio::select! {
            session = connecting => session?,
            () = self.halted() => return Ok(SessionEnd::Stopped),
        };
        let piece_count = self.torrent.piece_count();
        info!(
            "{peer}: ready, offers {}/{} pieces",
            session.bitfield().count_available(piece_count),
            piece_count
        );

        let mut hash_failures = 0;
        let end = loop {
            let index = {
                let mut ledger = self.ledger.lock().await;
                if self.is_cancelled() || ledger.is_complete() {
                    break SessionEnd::Stopped;
                }
                match ledger.select_next(session.bitfield()) {
                    Some(index) => {
                        ledger.begin_fetch(index);
                        index
                    }
                    None => break SessionEnd::Exhausted,
                }
            };

            let Some((wire_index, size)) = self.wire_piece(index) else {
                self.ledger.lock().await.end_fetch(index);
                break SessionEnd::Exhausted;
            };
            let fetched = tokio::select! {
                fetched = session.fetch_piece(wire_index, size) => Some(fetched),
                () = self.halted() => None,
            };
            let Some(fetched) = fetched else {
                self.ledger.lock().await.end_fetch(index);
                debug!("{peer}: abandoning piece {index}");
                break SessionEnd::Stopped;
            };

            let outcome = {
                let mut ledger = self.ledger.lock().await;
                ledger.end_fetch(index);
                fetched.map(|bytes| {
                    let outcome = ledger.try_submit(index, bytes);
                    if ledger.is_complete() {
                        self.halt.send_replace(true);
                    }
                    (outcome, ledger.completed_bytes(), ledger.total_bytes())
                })
            };
            match outcome? {
                (Ok(Submission::Accepted), done, total) => info!(
                    "piece {index} verified from {peer} ({} / {})",
                    HumanBytes(done),
                    HumanBytes(total)
                ),
                (Ok(Submission::AlreadyVerified), _, _) => {
                    debug!("piece {index} from {peer} was already verified")
                }
                (Err(e), _, _) => {
                    hash_failures += 1;
                    warn!("{peer}: {e}");
                    if hash_failures >= self.config.max_hash_failures {
                        warn!(
                            "{peer}: dropped after {hash_failures} bad pieces, last was piece {index}"
                        );
                        break SessionEnd::TooManyHashFailures { last: index };
                    }
                }
            }
        };

        session.close().await;
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;

    fn torrent() -> Torrent {
        Torrent::new(
            [0; 20],
            "x",
            4,
            vec![[1; 20], [2; 20]],
            vec![FileEntry {
                path: "x".into(),
                length: 7,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_summary_is_complete() {
        let mut summary = DownloadSummary {
            completed_pieces: 2,
            piece_count: 2,
            completed_bytes: 7,
            total_bytes: 7,
            peers_tried: 1,
        };
        assert!(summary.is_complete());
        summary.completed_pieces = 1;
        assert!(!summary.is_complete());
    }

    #[test]
    fn test_wire_piece() {
        let client = BitTorrentClient::new(torrent(), PeerId::generate(), DownloadConfig::default());
        assert_eq!(client.wire_piece(0), Some((0, 4)));
        assert_eq!(client.wire_piece(1), Some((1, 3)));
        assert_eq!(client.wire_piece(2), None);
    }

    #[tokio::test]
    async fn test_no_peers_finishes_immediately() {
        let client = BitTorrentClient::new(torrent(), PeerId::generate(), DownloadConfig::default());
        let summary = client.start_download(vec![]).await;

        assert_eq!(summary.peers_tried, 0);
        assert_eq!(summary.completed_pieces, 0);
        assert!(!summary.is_complete());
        assert_eq!(client.progress().await, (0, 7));
    }

    #[tokio::test]
    async fn test_cancel_before_start_contacts_nobody() {
        let client = BitTorrentClient::new(torrent(), PeerId::generate(), DownloadConfig::default());
        client.cancel();

        let peers = vec![Peer::new(std::net::Ipv4Addr::LOCALHOST, 1)];
        let summary = client.start_download(peers).await;

        assert!(client.is_cancelled());
        assert_eq!(summary.peers_tried, 0);
        assert!(!client.is_complete().await);
    }
}
