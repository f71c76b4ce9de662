use crate::peer::{PSTR, PSTR_LEN};

pub const HANDSHAKE_LEN: usize = 68;

/// The fixed-size opening message of every peer connection.
///
/// Layout: `pstrlen (19) | "BitTorrent protocol" | 8 reserved | info hash | peer id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub infohash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(infohash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { infohash, peer_id }
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        // buf[20..28] is already zero (reserved)
        buf[28..48].copy_from_slice(&self.infohash);
        buf[48..68].copy_from_slice(&self.peer_id);

        buf
    }

    /// Parses a peer's handshake. Reserved bytes are ignored.
    pub fn deserialize(buf: &[u8]) -> Result<Self, &'static str> {
        if buf.len() != HANDSHAKE_LEN {
            return Err("handshake has wrong length");
        }
        if buf[0] != PSTR_LEN || &buf[1..20] != PSTR.as_bytes() {
            return Err("unexpected protocol label");
        }

        let mut infohash = [0u8; 20];
        infohash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { infohash, peer_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_handshake(infohash: [u8; 20], peer_id: [u8; 20]) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PSTR_LEN;
        buf[1..20].copy_from_slice(PSTR.as_bytes());
        buf[28..48].copy_from_slice(&infohash);
        buf[48..68].copy_from_slice(&peer_id);
        buf
    }

    #[test]
    fn test_handshake_serialize() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let serialized = handshake.serialize();

        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &[1u8; 20]);
        assert_eq!(&serialized[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_handshake_deserialize_valid() {
        let buf = raw_handshake([3u8; 20], [4u8; 20]);
        let handshake = Handshake::deserialize(&buf).unwrap();

        assert_eq!(handshake.infohash, [3u8; 20]);
        assert_eq!(handshake.peer_id, [4u8; 20]);
    }

    #[test]
    fn test_handshake_deserialize_invalid_length() {
        assert_eq!(
            Handshake::deserialize(&[0u8; 67]),
            Err("handshake has wrong length")
        );
    }

    #[test]
    fn test_handshake_deserialize_invalid_pstr_len() {
        let mut buf = raw_handshake([0; 20], [0; 20]);
        buf[0] = PSTR_LEN + 1;

        assert_eq!(Handshake::deserialize(&buf), Err("unexpected protocol label"));
    }

    #[test]
    fn test_handshake_deserialize_invalid_pstr() {
        let mut buf = raw_handshake([0; 20], [0; 20]);
        buf[1..20].copy_from_slice(b"Invalid protocol!!X");

        assert_eq!(Handshake::deserialize(&buf), Err("unexpected protocol label"));
    }

    #[test]
    fn test_handshake_deserialize_with_non_zero_reserved_bytes() {
        let mut buf = raw_handshake([17u8; 20], [18u8; 20]);
        buf[20..28].fill(0xFF);

        let handshake = Handshake::deserialize(&buf).unwrap();
        assert_eq!(handshake.infohash, [17u8; 20]);
        assert_eq!(handshake.peer_id, [18u8; 20]);
    }
}
