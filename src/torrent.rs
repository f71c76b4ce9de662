use sha1::{Digest, Sha1};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::bencode_parser::{Value, encode, parse};
use crate::error::{Error, Result};

pub const HASH_LEN: usize = 20;

/// One file of the download, in descriptor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the output directory, starting with the torrent name.
    pub path: PathBuf,
    pub length: u64,
}

/// Immutable description of a transfer, derived from its metainfo.
///
/// Construction validates that the piece hashes exactly cover `total_size`:
/// every piece but the last is `piece_length` bytes and the last one holds
/// the non-empty remainder.
#[derive(Debug, Clone)]
pub struct Torrent {
    announce: Option<String>,
    announce_list: Vec<Vec<String>>,
    name: String,
    piece_length: u64,
    pieces: Vec<[u8; HASH_LEN]>,
    files: Vec<FileEntry>,
    total_size: u64,
    info_hash: [u8; HASH_LEN],
}

impl Torrent {
    pub fn new(
        info_hash: [u8; HASH_LEN],
        name: impl Into<String>,
        piece_length: u64,
        pieces: Vec<[u8; HASH_LEN]>,
        files: Vec<FileEntry>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(Error::malformed("piece length is zero"));
        }
        if piece_length > u64::from(u32::MAX) {
            return Err(Error::malformed("piece length does not fit the wire format"));
        }
        if pieces.is_empty() {
            return Err(Error::malformed("no piece hashes"));
        }

        let total_size = files
            .iter()
            .try_fold(0u64, |acc, f| acc.checked_add(f.length))
            .ok_or_else(|| Error::malformed("total size overflows"))?;

        let full_pieces = (pieces.len() as u64 - 1)
            .checked_mul(piece_length)
            .ok_or_else(|| Error::malformed("piece count overflows"))?;
        let last = total_size
            .checked_sub(full_pieces)
            .ok_or_else(|| Error::malformed("last piece size is negative"))?;
        if last == 0 {
            return Err(Error::malformed("last piece size is zero"));
        }
        if last > piece_length {
            return Err(Error::malformed(format!(
                "{} piece hashes do not cover {} bytes",
                pieces.len(),
                total_size
            )));
        }

        Ok(Self {
            announce: None,
            announce_list: Vec::new(),
            name: name.into(),
            piece_length,
            pieces,
            files,
            total_size,
            info_hash,
        })
    }

    pub fn info_hash(&self) -> &[u8; HASH_LEN] {
        &self.info_hash
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Size in bytes of piece `index`, or `None` past the last piece.
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        let count = self.pieces.len();
        if index >= count {
            None
        } else if index == count - 1 {
            Some(self.total_size - (count as u64 - 1) * self.piece_length)
        } else {
            Some(self.piece_length)
        }
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; HASH_LEN]> {
        self.pieces.get(index)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Tracker URLs: `announce` first, then every `announce-list` tier,
    /// without duplicates.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let candidates = self
            .announce
            .iter()
            .chain(self.announce_list.iter().flatten());
        for url in candidates {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

fn missing(key: &[u8], what: &str) -> Error {
    Error::malformed(format!("'{}' {}", String::from_utf8_lossy(key), what))
}

fn get_string(dict: &Value, key: &[u8]) -> Result<String> {
    dict.get(key)
        .ok_or_else(|| missing(key, "is missing"))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| missing(key, "is not a string"))
}

fn get_u64(dict: &Value, key: &[u8]) -> Result<u64> {
    let value = dict
        .get(key)
        .ok_or_else(|| missing(key, "is missing"))?
        .as_integer()
        .ok_or_else(|| missing(key, "is not an integer"))?;
    u64::try_from(value).map_err(|_| missing(key, "is negative"))
}

fn parse_files(info: &Value, name: &str) -> Result<Vec<FileEntry>> {
    if info.get(b"length").is_some() {
        return Ok(vec![FileEntry {
            path: PathBuf::from(name),
            length: get_u64(info, b"length")?,
        }]);
    }

    let files = info
        .get(b"files")
        .ok_or_else(|| Error::malformed("neither 'length' nor 'files' present"))?
        .as_list()
        .ok_or_else(|| Error::malformed("'files' is not a list"))?;

    files
        .iter()
        .map(|file| {
            let components = file
                .get(b"path")
                .and_then(Value::as_list)
                .filter(|parts| !parts.is_empty())
                .ok_or_else(|| Error::malformed("file entry without a path"))?;

            let mut path = PathBuf::from(name);
            for part in components {
                let part = part
                    .as_str()
                    .ok_or_else(|| Error::malformed("path component is not a string"))?;
                path.push(part);
            }

            Ok(FileEntry {
                path,
                length: get_u64(file, b"length")?,
            })
        })
        .collect()
}

fn parse_announce_list(root: &Value) -> Vec<Vec<String>> {
    root.get(b"announce-list")
        .and_then(Value::as_list)
        .map(|tiers| {
            tiers
                .iter()
                .filter_map(Value::as_list)
                .map(|tier| {
                    tier.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|tier| !tier.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse torrent from file path
pub fn parse_torrent_file(path: impl AsRef<Path>) -> Result<Torrent> {
    let data = fs::read(path)?;
    parse_torrent_bytes(&data)
}

/// Parse torrent from byte slice
pub fn parse_torrent_bytes(data: &[u8]) -> Result<Torrent> {
    let root = parse(data)?;
    if root.as_dict().is_none() {
        return Err(Error::malformed("expected top-level dictionary"));
    }

    let info = root
        .get(b"info")
        .filter(|info| info.as_dict().is_some())
        .ok_or_else(|| Error::malformed("missing 'info' dictionary"))?;
    let info_hash: [u8; HASH_LEN] = Sha1::digest(encode(info)).into();

    let name = get_string(info, b"name")?;
    let piece_length = get_u64(info, b"piece length")?;

    let pieces_blob = info
        .get(b"pieces")
        .and_then(Value::as_bytes)
        .ok_or_else(|| Error::malformed("missing 'pieces'"))?;
    if pieces_blob.len() % HASH_LEN != 0 {
        return Err(Error::malformed(format!(
            "'pieces' length {} is not a multiple of {}",
            pieces_blob.len(),
            HASH_LEN
        )));
    }
    let pieces = pieces_blob
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let files = parse_files(info, &name)?;

    let mut torrent = Torrent::new(info_hash, name, piece_length, pieces, files)?;
    torrent.announce = get_string(&root, b"announce").ok();
    torrent.announce_list = parse_announce_list(&root);
    Ok(torrent)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn bytes(b: &[u8]) -> Value {
        Value::Bytes(b.to_vec())
    }

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dictionary(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
        Sha1::digest(data).into()
    }

    /// Metainfo bytes for a single-file torrent over `contents`.
    pub(crate) fn single_file_metainfo(contents: &[u8], piece_length: usize) -> Vec<u8> {
        let pieces: Vec<u8> = contents
            .chunks(piece_length)
            .flat_map(|chunk| sha1(chunk))
            .collect();
        let info = dict(vec![
            ("length", Value::Integer(contents.len() as i64)),
            ("name", bytes(b"sample.bin")),
            ("piece length", Value::Integer(piece_length as i64)),
            ("pieces", Value::Bytes(pieces)),
        ]);
        encode(&dict(vec![
            ("announce", bytes(b"http://tracker.example.com/announce")),
            ("info", info),
        ]))
    }

    #[test]
    fn test_parse_single_file() {
        let data = single_file_metainfo(b"ABCDEFG", 4);
        let torrent = parse_torrent_bytes(&data).unwrap();

        assert_eq!(torrent.name(), "sample.bin");
        assert_eq!(torrent.piece_count(), 2);
        assert_eq!(torrent.piece_length(), 4);
        assert_eq!(torrent.total_size(), 7);
        assert_eq!(torrent.piece_hash(0), Some(&sha1(b"ABCD")));
        assert_eq!(torrent.piece_hash(1), Some(&sha1(b"EFG")));
        assert_eq!(torrent.piece_hash(2), None);
        assert_eq!(
            torrent.announce_urls(),
            vec!["http://tracker.example.com/announce".to_string()]
        );
    }

    #[test]
    fn test_info_hash_is_digest_of_encoded_info() {
        let data = single_file_metainfo(b"ABCDEFG", 4);
        let torrent = parse_torrent_bytes(&data).unwrap();
        let info = parse(&data).unwrap().get(b"info").cloned().unwrap();

        assert_eq!(torrent.info_hash(), &sha1(&encode(&info)));
    }

    #[test]
    fn test_piece_sizes_sum_to_total() {
        let contents = vec![7u8; 10_000];
        let torrent = parse_torrent_bytes(&single_file_metainfo(&contents, 4096)).unwrap();

        let sizes: Vec<u64> = (0..torrent.piece_count())
            .map(|i| torrent.piece_size(i).unwrap())
            .collect();
        assert_eq!(sizes, vec![4096, 4096, 1808]);
        assert_eq!(sizes.iter().sum::<u64>(), torrent.total_size());
        assert_eq!(torrent.piece_size(3), None);
    }

    #[test]
    fn test_exact_multiple_last_piece_is_full() {
        let torrent = Torrent::new(
            [0; 20],
            "x",
            4,
            vec![[1; 20], [2; 20]],
            vec![FileEntry {
                path: "x".into(),
                length: 8,
            }],
        )
        .unwrap();
        assert_eq!(torrent.piece_size(1), Some(4));
    }

    #[test]
    fn test_multi_file_layout() {
        let info = dict(vec![
            (
                "files",
                Value::List(vec![
                    dict(vec![
                        ("length", Value::Integer(3)),
                        ("path", Value::List(vec![bytes(b"a.txt")])),
                    ]),
                    dict(vec![
                        ("length", Value::Integer(5)),
                        ("path", Value::List(vec![bytes(b"sub"), bytes(b"b.txt")])),
                    ]),
                ]),
            ),
            ("name", bytes(b"album")),
            ("piece length", Value::Integer(4)),
            ("pieces", Value::Bytes(vec![0u8; 40])),
        ]);
        let data = encode(&dict(vec![
            ("announce", bytes(b"udp://one:80")),
            (
                "announce-list",
                Value::List(vec![
                    Value::List(vec![bytes(b"udp://one:80")]),
                    Value::List(vec![bytes(b"http://two/announce")]),
                ]),
            ),
            ("info", info),
        ]));

        let torrent = parse_torrent_bytes(&data).unwrap();
        assert_eq!(torrent.total_size(), 8);
        assert_eq!(torrent.files().len(), 2);
        assert_eq!(torrent.files()[1].path, PathBuf::from("album/sub/b.txt"));
        assert_eq!(
            torrent.announce_urls(),
            vec!["udp://one:80".to_string(), "http://two/announce".to_string()]
        );
    }

    #[test]
    fn test_rejects_bad_pieces_length() {
        let info = dict(vec![
            ("length", Value::Integer(7)),
            ("name", bytes(b"x")),
            ("piece length", Value::Integer(4)),
            ("pieces", Value::Bytes(vec![0u8; 39])),
        ]);
        let data = encode(&dict(vec![("info", info)]));

        assert_matches!(parse_torrent_bytes(&data), Err(Error::MalformedDescriptor(_)));
    }

    #[test]
    fn test_rejects_missing_length_and_files() {
        let info = dict(vec![
            ("name", bytes(b"x")),
            ("piece length", Value::Integer(4)),
            ("pieces", Value::Bytes(vec![0u8; 20])),
        ]);
        let data = encode(&dict(vec![("info", info)]));

        assert_matches!(parse_torrent_bytes(&data), Err(Error::MalformedDescriptor(_)));
    }

    #[test]
    fn test_rejects_hash_count_mismatch() {
        // Three hashes but only enough bytes for two pieces.
        let files = vec![FileEntry {
            path: "x".into(),
            length: 7,
        }];
        assert_matches!(
            Torrent::new([0; 20], "x", 4, vec![[0; 20]; 3], files.clone()),
            Err(Error::MalformedDescriptor(_))
        );
        // One hash for more than one piece of data.
        assert_matches!(
            Torrent::new([0; 20], "x", 4, vec![[0; 20]], files),
            Err(Error::MalformedDescriptor(_))
        );
    }

    #[test]
    fn test_rejects_non_bencode() {
        assert_matches!(parse_torrent_bytes(b"not bencode"), Err(Error::Bencode(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert_matches!(
            parse_torrent_file("/nonexistent/definitely/missing.torrent"),
            Err(Error::Io(_))
        );
    }
}
