use std::time::Duration;

pub const DEFAULT_MAX_PEERS: usize = 10;
pub const DEFAULT_LISTEN_PORT: u16 = 6881;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_HASH_FAILURES: usize = 3;

/// Tunables for a download run.
///
/// Built with [`Default`] and adjusted through the `with_*` setters:
///
/// ```
/// use rs_swarm::config::DownloadConfig;
/// use std::time::Duration;
///
/// let config = DownloadConfig::default()
///     .with_max_peers(4)
///     .with_timeout(Some(Duration::from_secs(600)));
/// assert_eq!(config.max_peers, 4);
/// ```
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Upper bound on simultaneously open peer sessions.
    pub max_peers: usize,
    /// Deadline for opening the TCP stream to a peer.
    pub connect_timeout: Duration,
    /// Deadline for each read from an established peer.
    pub read_timeout: Duration,
    /// Reject handshakes whose info hash differs from ours. When false only
    /// the protocol label is checked.
    pub verify_info_hash: bool,
    /// Hash mismatches tolerated from one peer before it is dropped.
    pub max_hash_failures: usize,
    /// Port reported to trackers.
    pub listen_port: u16,
    /// Optional deadline for the whole download.
    pub timeout: Option<Duration>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            connect_timeout: CONNECTION_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            verify_info_hash: true,
            max_hash_failures: MAX_HASH_FAILURES,
            listen_port: DEFAULT_LISTEN_PORT,
            timeout: None,
        }
    }
}

impl DownloadConfig {
    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_verify_info_hash(mut self, verify: bool) -> Self {
        self.verify_info_hash = verify;
        self
    }

    pub fn with_max_hash_failures(mut self, failures: usize) -> Self {
        self.max_hash_failures = failures.max(1);
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}
