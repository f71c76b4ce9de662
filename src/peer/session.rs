use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::DownloadConfig;
use crate::peer::Peer;
use crate::peer::handshake::{HANDSHAKE_LEN, Handshake};
use crate::peer::message::{
    BlockData, BlockRequest, Bitfield, Frame, Message, MessageId, read_frame, write_message,
};

/// Wire unit of a piece request.
pub const BLOCK_SIZE: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    AwaitingBitmap,
    Ready,
    FetchingBlock { index: u32, begin: u32 },
    Closed,
}

/// Why a single peer session ended. These never abort the whole download.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer {addr} unreachable: {source}")]
    PeerUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: SocketAddr, reason: String },

    #[error("transfer from {addr} failed: {reason}")]
    TransferFailed { addr: SocketAddr, reason: String },

    #[error("session with {addr} is closed")]
    Closed { addr: SocketAddr },

    #[error("session with {addr} is {state:?}, expected {expected:?}")]
    InvalidState {
        addr: SocketAddr,
        state: SessionState,
        expected: SessionState,
    },
}

async fn deadline<T>(limit: Duration, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}

/// `(begin, length)` of each block of a piece, in ascending offset order.
pub fn block_layout(size: u32) -> impl Iterator<Item = (u32, u32)> {
    (0..size)
        .step_by(BLOCK_SIZE as usize)
        .map(move |begin| (begin, BLOCK_SIZE.min(size - begin)))
}

/// One connection to one remote peer.
///
/// The session walks `Disconnected -> Connecting -> Handshaking ->
/// AwaitingBitmap -> Ready <-> FetchingBlock`, and any failure moves it to
/// `Closed` for good. It never hashes data; whole pieces are handed back to
/// the caller for validation.
#[derive(Debug)]
pub struct PeerSession<S = TcpStream> {
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    read_timeout: Duration,
    verify_info_hash: bool,
    state: SessionState,
    stream: Option<S>,
    remote: Option<Handshake>,
    bitfield: Bitfield,
    bytes_downloaded: u64,
}

impl PeerSession<TcpStream> {
    /// Opens a TCP connection and drives the session up to `Ready`.
    pub async fn connect(
        peer: Peer,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: &DownloadConfig,
    ) -> Result<Self, SessionError> {
        let addr = peer.addr();
        let mut session = Self::new(addr, info_hash, peer_id, config);
        session.state = SessionState::Connecting;

        let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(session.fail_unreachable(e)),
            Err(_) => {
                let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                return Err(session.fail_unreachable(e));
            }
        };
        debug!("connected to {addr}");

        session.attach(stream)?;
        session.handshake().await?;
        session.await_bitmap().await?;
        Ok(session)
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: &DownloadConfig,
    ) -> Self {
        Self {
            addr,
            info_hash,
            peer_id,
            read_timeout: config.read_timeout,
            verify_info_hash: config.verify_info_hash,
            state: SessionState::Disconnected,
            stream: None,
            remote: None,
            bitfield: Bitfield::default(),
            bytes_downloaded: 0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// The handshake the peer answered with, once it has been accepted.
    pub fn remote(&self) -> Option<&Handshake> {
        self.remote.as_ref()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Hands an already-open stream to the session.
    pub fn attach(&mut self, stream: S) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disconnected | SessionState::Connecting => {
                self.stream = Some(stream);
                self.state = SessionState::Handshaking;
                Ok(())
            }
            _ => Err(self.state_error(SessionState::Disconnected)),
        }
    }

    pub async fn handshake(&mut self) -> Result<&Handshake, SessionError> {
        self.expect_state(SessionState::Handshaking)?;

        let read_timeout = self.read_timeout;
        let ours = Handshake::new(self.info_hash, self.peer_id).serialize();
        let mut reply = [0u8; HANDSHAKE_LEN];

        let Some(stream) = self.stream.as_mut() else {
            return Err(self.closed());
        };
        let exchanged = async {
            deadline(read_timeout, stream.write_all(&ours)).await?;
            deadline(read_timeout, stream.read_exact(&mut reply)).await?;
            Ok::<_, io::Error>(())
        }
        .await;
        if let Err(e) = exchanged {
            return Err(self.fail_handshake(e.to_string()));
        }

        let remote = match Handshake::deserialize(&reply) {
            Ok(remote) => remote,
            Err(reason) => return Err(self.fail_handshake(reason)),
        };
        if remote.infohash != self.info_hash {
            if self.verify_info_hash {
                return Err(self.fail_handshake("info hash mismatch"));
            }
            warn!("{}: accepting handshake with a different info hash", self.addr);
        }

        debug!(
            "{}: handshake accepted from {}",
            self.addr,
            String::from_utf8_lossy(&remote.peer_id)
        );
        self.state = SessionState::AwaitingBitmap;
        Ok(self.remote.insert(remote))
    }

    /// Reads frames until the peer's bitfield arrives.
    pub async fn await_bitmap(&mut self) -> Result<&Bitfield, SessionError> {
        self.expect_state(SessionState::AwaitingBitmap)?;

        let read_timeout = self.read_timeout;
        let waited = timeout(read_timeout, async {
            loop {
                let frame = self.next_frame().await?;
                if let Some(bitfield) = self.bitmap_step(frame) {
                    return Ok::<_, SessionError>(bitfield);
                }
            }
        })
        .await;
        self.bitfield = match waited {
            Ok(bitfield) => bitfield?,
            Err(_) => {
                return Err(self.fail_transfer(format!("no bitfield within {read_timeout:?}")));
            }
        };
        self.state = SessionState::Ready;
        Ok(&self.bitfield)
    }

    fn bitmap_step(&self, frame: Frame) -> Option<Bitfield> {
        match frame {
            Frame::KeepAlive => None,
            Frame::Message(msg) if msg.kind == MessageId::Bitfield => Bitfield::try_from(msg).ok(),
            Frame::Message(msg) => {
                debug!("{}: dropping {:?} before bitfield", self.addr, msg.kind);
                None
            }
            Frame::Unknown { id, .. } => {
                debug!("{}: dropping unknown message {id} before bitfield", self.addr);
                None
            }
        }
    }

    /// Downloads piece `index` of `size` bytes block by block.
    ///
    /// The bytes are returned unverified. On any failure the partial piece is
    /// discarded and the session is closed.
    pub async fn fetch_piece(&mut self, index: u32, size: u32) -> Result<Vec<u8>, SessionError> {
        self.expect_state(SessionState::Ready)?;

        let mut piece = Vec::with_capacity(size as usize);
        for (begin, length) in block_layout(size) {
            self.state = SessionState::FetchingBlock { index, begin };
            let request = BlockRequest {
                index,
                begin,
                length,
            };
            self.send(request.into()).await?;

            // Keep-alives and stray frames do not extend the wait for a block.
            let read_timeout = self.read_timeout;
            let waited = timeout(read_timeout, self.await_block()).await;
            let data = match waited {
                Ok(data) => data?,
                Err(_) => {
                    return Err(self.fail_transfer(format!(
                        "block {index}:{begin} timed out after {read_timeout:?}"
                    )));
                }
            };
            if data.len() != length as usize {
                return Err(self.fail_transfer(format!(
                    "block {index}:{begin} has {} bytes, requested {length}",
                    data.len()
                )));
            }

            self.bytes_downloaded += data.len() as u64;
            piece.extend_from_slice(&data);
        }

        self.state = SessionState::Ready;
        Ok(piece)
    }

    async fn await_block(&mut self) -> Result<Vec<u8>, SessionError> {
        loop {
            let frame = self.next_frame().await?;
            if let Some(data) = self.block_step(frame) {
                return Ok(data);
            }
        }
    }

    fn block_step(&mut self, frame: Frame) -> Option<Vec<u8>> {
        let SessionState::FetchingBlock { index, begin } = self.state else {
            return None;
        };

        let msg = match frame {
            Frame::Message(msg) => msg,
            Frame::KeepAlive | Frame::Unknown { .. } => return None,
        };
        match msg.kind {
            MessageId::Piece => match BlockData::try_from(msg) {
                Ok(block) if block.index == index && block.begin == begin => Some(block.data),
                Ok(block) => {
                    debug!(
                        "{}: skipping block {}:{} while waiting for {index}:{begin}",
                        self.addr, block.index, block.begin
                    );
                    None
                }
                Err(reason) => {
                    debug!("{}: skipping piece frame: {reason}", self.addr);
                    None
                }
            },
            MessageId::Have => {
                if let Some(have) = msg.have_index() {
                    self.bitfield.set_piece(have as usize);
                }
                None
            }
            MessageId::Bitfield => {
                self.bitfield = Bitfield::from(msg.payload);
                None
            }
            _ => None,
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.state = SessionState::Closed;
    }

    async fn send(&mut self, message: Message) -> Result<(), SessionError> {
        let read_timeout = self.read_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.closed());
        };
        let result = deadline(read_timeout, write_message(stream, &message)).await;
        result.map_err(|e| self.fail_transfer(e.to_string()))
    }

    async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        let read_timeout = self.read_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.closed());
        };
        let result = deadline(read_timeout, read_frame(stream)).await;
        result.map_err(|e| self.fail_transfer(e.to_string()))
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.state_error(expected))
        }
    }

    fn state_error(&self, expected: SessionState) -> SessionError {
        if self.state == SessionState::Closed {
            return self.closed();
        }
        SessionError::InvalidState {
            addr: self.addr,
            state: self.state,
            expected,
        }
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed { addr: self.addr }
    }

    fn shut(&mut self) {
        self.stream = None;
        self.state = SessionState::Closed;
    }

    fn fail_unreachable(&mut self, source: io::Error) -> SessionError {
        self.shut();
        SessionError::PeerUnreachable {
            addr: self.addr,
            source,
        }
    }

    fn fail_handshake(&mut self, reason: impl Into<String>) -> SessionError {
        self.shut();
        SessionError::HandshakeFailed {
            addr: self.addr,
            reason: reason.into(),
        }
    }

    fn fail_transfer(&mut self, reason: impl Into<String>) -> SessionError {
        self.shut();
        SessionError::TransferFailed {
            addr: self.addr,
            reason: reason.into(),
        }
    }
}
