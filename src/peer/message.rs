use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer: a 2 MiB block plus the piece header.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024 + 13;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Piece),
            8 => Ok(Self::Cancel),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageId, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn have(index: u32) -> Self {
        Self::new(MessageId::Have, index.to_be_bytes().to_vec())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let total_len = 1 + self.payload.len(); // 1 byte for ID
        let mut buf = Vec::with_capacity(4 + total_len);

        buf.extend_from_slice(&(total_len as u32).to_be_bytes()); // 4-byte length
        buf.push(self.kind as u8); // 1-byte message ID
        buf.extend_from_slice(&self.payload); // payload

        buf
    }

    /// Piece index announced by a `have` message.
    pub fn have_index(&self) -> Option<u32> {
        if self.kind != MessageId::Have {
            return None;
        }
        read_u32(&self.payload, 0)
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// One length-prefixed unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A zero length prefix.
    KeepAlive,
    Message(Message),
    /// A message id this client does not know. Its payload has been consumed.
    Unknown { id: u8, len: usize },
}

/// Reads one frame.
///
/// Unknown message ids are skipped over rather than treated as errors so
/// that protocol extensions never break the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Frame::KeepAlive);
    }
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut id = [0u8; 1];
    reader.read_exact(&mut id).await?;
    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload).await?;

    Ok(match MessageId::try_from(id[0]) {
        Ok(kind) => Frame::Message(Message { kind, payload }),
        Err(()) => Frame::Unknown { id: id[0], len },
    })
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> io::Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await
}

/// A `request` for one block of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl From<BlockRequest> for Message {
    fn from(req: BlockRequest) -> Self {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&req.index.to_be_bytes());
        payload.extend_from_slice(&req.begin.to_be_bytes());
        payload.extend_from_slice(&req.length.to_be_bytes());
        Message::new(MessageId::Request, payload)
    }
}

impl TryFrom<&Message> for BlockRequest {
    type Error = &'static str;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        if msg.kind != MessageId::Request || msg.payload.len() != 12 {
            return Err("Not a request message");
        }
        Ok(BlockRequest {
            index: read_u32(&msg.payload, 0).ok_or("Not a request message")?,
            begin: read_u32(&msg.payload, 4).ok_or("Not a request message")?,
            length: read_u32(&msg.payload, 8).ok_or("Not a request message")?,
        })
    }
}

/// The body of a `piece` message: one block of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

impl From<BlockData> for Message {
    fn from(block: BlockData) -> Self {
        let mut payload = Vec::with_capacity(8 + block.data.len());
        payload.extend_from_slice(&block.index.to_be_bytes());
        payload.extend_from_slice(&block.begin.to_be_bytes());
        payload.extend_from_slice(&block.data);
        Message::new(MessageId::Piece, payload)
    }
}

impl TryFrom<Message> for BlockData {
    type Error = &'static str;

    fn try_from(mut msg: Message) -> Result<Self, Self::Error> {
        if msg.kind != MessageId::Piece {
            return Err("Not a piece message");
        }
        let index = read_u32(&msg.payload, 0).ok_or("Truncated piece message")?;
        let begin = read_u32(&msg.payload, 4).ok_or("Truncated piece message")?;
        let data = msg.payload.split_off(8);
        Ok(BlockData { index, begin, data })
    }
}

/// A peer's piece availability, most significant bit first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    pub fn has_piece(&self, index: usize) -> bool {
        let byte = index / 8;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        (self.bits[byte] >> bit) & 1 == 1
    }

    /// Marks `index` available. Indices past the end are ignored.
    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn from_piece_count(count: usize) -> Self {
        Bitfield {
            bits: vec![0; count.div_ceil(8)],
        }
    }

    /// Number of the first `piece_count` pieces that are available.
    pub fn count_available(&self, piece_count: usize) -> usize {
        (0..piece_count).filter(|&i| self.has_piece(i)).count()
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Self {
        Bitfield { bits }
    }
}

impl From<Bitfield> for Message {
    fn from(b: Bitfield) -> Self {
        Message {
            kind: MessageId::Bitfield,
            payload: b.bits,
        }
    }
}

impl TryFrom<Message> for Bitfield {
    type Error = &'static str;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        if msg.kind != MessageId::Bitfield {
            return Err("Not a bitfield message");
        }
        Ok(Bitfield { bits: msg.payload })
    }
}
