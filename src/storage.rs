use std::path::{Component, Path, PathBuf};

use log::info;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::ledger::PieceLedger;
use crate::torrent::Torrent;

/// Keeps only plain components of a descriptor path so that nothing can be
/// written outside the output directory.
pub fn sanitize_path(path: &Path) -> PathBuf {
    let clean: PathBuf = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();

    if clean.as_os_str().is_empty() {
        PathBuf::from("download")
    } else {
        clean
    }
}

/// Writes the verified payload into the descriptor's file layout under
/// `output_dir` and returns the paths written, in descriptor order.
pub async fn save_download(
    torrent: &Torrent,
    ledger: &PieceLedger,
    output_dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>> {
    if !ledger.is_complete() {
        return Err(Error::Incomplete {
            completed: ledger.completed_count(),
            total: ledger.piece_count(),
        });
    }

    let mut pieces = ledger.verified_pieces();
    let mut current: &[u8] = &[];
    let mut written = Vec::with_capacity(torrent.files().len());

    for entry in torrent.files() {
        let path = output_dir.as_ref().join(sanitize_path(&entry.path));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&path).await?;
        let mut remaining = entry.length;
        while remaining > 0 {
            if current.is_empty() {
                current = pieces.next().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "payload ran out")
                })?;
            }
            let take = current.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            file.write_all(&current[..take]).await?;
            current = &current[take..];
            remaining -= take as u64;
        }
        file.flush().await?;

        info!("wrote {}", path.display());
        written.push(path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileEntry;
    use assert_matches::assert_matches;
    use sha1::{Digest, Sha1};

    fn sha1(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn multi_file_torrent() -> Torrent {
        // "ABCDEFG" split as "ABC" + "DEFG" across 4-byte pieces.
        Torrent::new(
            [0; 20],
            "album",
            4,
            vec![sha1(b"ABCD"), sha1(b"EFG")],
            vec![
                FileEntry {
                    path: "album/a.txt".into(),
                    length: 3,
                },
                FileEntry {
                    path: "album/sub/b.txt".into(),
                    length: 4,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path(Path::new("a/b.txt")), PathBuf::from("a/b.txt"));
        assert_eq!(
            sanitize_path(Path::new("/etc/../passwd")),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(sanitize_path(Path::new("./x")), PathBuf::from("x"));
        assert_eq!(sanitize_path(Path::new("..")), PathBuf::from("download"));
    }

    #[tokio::test]
    async fn test_save_multi_file() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file_torrent();
        let mut ledger = PieceLedger::new(&torrent);
        ledger.submit(0, b"ABCD".to_vec());
        ledger.submit(1, b"EFG".to_vec());

        let written = save_download(&torrent, &ledger, dir.path()).await.unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("album/a.txt")).unwrap(), b"ABC");
        assert_eq!(
            std::fs::read(dir.path().join("album/sub/b.txt")).unwrap(),
            b"DEFG"
        );
    }

    #[tokio::test]
    async fn test_save_incomplete_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = multi_file_torrent();
        let mut ledger = PieceLedger::new(&torrent);
        ledger.submit(1, b"EFG".to_vec());

        assert_matches!(
            save_download(&torrent, &ledger, dir.path()).await,
            Err(Error::Incomplete {
                completed: 1,
                total: 2
            })
        );
        assert!(!dir.path().join("album").exists());
    }
}
