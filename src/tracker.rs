use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use log::{info, warn};
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::bencode_parser::{BencodeError, Value, parse};
use crate::error::Error;
use crate::peer::Peer;

pub mod udp;

const USER_AGENT: &str = "rs_swarm/0.1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Failure of a single discovery source.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid tracker url: {0}")]
    Url(#[from] url::ParseError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker answered with status {0}")]
    Status(StatusCode),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("tracker returned error: {0}")]
    Failure(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("timeout")]
    Timeout,
}

/// What we tell a tracker about ourselves.
#[derive(Debug, Clone, Copy)]
pub struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub left: u64,
}

fn encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

fn build_tracker_url(announce: &str, req: &Announce) -> Result<String, url::ParseError> {
    let mut base = Url::parse(announce)?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
        encode_bytes(&req.info_hash),
        encode_bytes(&req.peer_id),
        req.port,
        req.left
    );
    let query = match base.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
        _ => query,
    };

    base.set_query(Some(&query));
    Ok(base.to_string())
}

/// Decodes a compact IPv4 peer list: 4 address bytes then a big-endian port.
pub(crate) fn extract_peers(bytes: &[u8]) -> Option<Vec<Peer>> {
    if bytes.len() % 6 != 0 {
        return None;
    }
    let peers = bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer::new(ip, port)
        })
        .collect();

    Some(peers)
}

fn extract_peers6(bytes: &[u8]) -> Option<Vec<Peer>> {
    if bytes.len() % 18 != 0 {
        return None;
    }
    let peers = bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            Peer::new(Ipv6Addr::from(octets), port)
        })
        .collect();

    Some(peers)
}

/// A `{ip, port}` dictionary entry. Hostnames are not resolved.
fn dict_peer(entry: &Value) -> Option<Peer> {
    let ip: IpAddr = entry.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get(b"port")?.as_integer()?).ok()?;
    Some(Peer::new(ip, port))
}

/// Reads the peers out of an HTTP tracker's bencoded answer.
pub fn parse_announce_response(body: &[u8]) -> Result<Vec<Peer>, TrackerError> {
    let root = parse(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse("not a dictionary".into()));
    }
    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .unwrap_or_else(|| "unknown".into());
        return Err(TrackerError::Failure(reason));
    }

    let mut peers = match root.get(b"peers") {
        Some(Value::Bytes(compact)) => extract_peers(compact).ok_or_else(|| {
            TrackerError::InvalidResponse("compact peer list is not a multiple of 6".into())
        })?,
        Some(Value::List(entries)) => entries.iter().filter_map(dict_peer).collect(),
        _ => return Err(TrackerError::InvalidResponse("missing 'peers'".into())),
    };
    if let Some(compact6) = root.get(b"peers6").and_then(Value::as_bytes) {
        peers.extend(extract_peers6(compact6).unwrap_or_default());
    }

    Ok(peers)
}

async fn announce_http(
    client: &Client,
    announce: &str,
    req: &Announce,
) -> Result<Vec<Peer>, TrackerError> {
    let url = build_tracker_url(announce, req)?;
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(TrackerError::Status(response.status()));
    }

    let body = response.bytes().await?;
    parse_announce_response(&body)
}

async fn announce(client: &Client, url: &str, req: &Announce) -> Result<Vec<Peer>, TrackerError> {
    let scheme = Url::parse(url)?.scheme().to_string();
    match scheme.as_str() {
        "http" | "https" => announce_http(client, url, req).await,
        "udp" => udp::announce(url, req).await,
        _ => Err(TrackerError::UnsupportedScheme(scheme)),
    }
}

/// Asks every tracker in turn and returns the union of their peers.
///
/// A failing tracker is logged and skipped. It is only an error when no
/// tracker produced a single peer.
pub async fn discover_peers(urls: &[String], req: &Announce) -> Result<Vec<Peer>, Error> {
    if urls.is_empty() {
        return Err(Error::DiscoveryFailure("no trackers to ask".into()));
    }

    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::DiscoveryFailure(e.to_string()))?;

    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    let mut failures = Vec::new();
    for url in urls {
        match announce(&client, url, req).await {
            Ok(found) => {
                info!("{url} returned {} peers", found.len());
                peers.extend(found.into_iter().filter(|peer| seen.insert(*peer)));
            }
            Err(e) => {
                warn!("tracker {url} failed: {e}");
                failures.push(format!("{url}: {e}"));
            }
        }
    }

    if !peers.is_empty() {
        Ok(peers)
    } else if failures.is_empty() {
        Err(Error::DiscoveryFailure("trackers returned no peers".into()))
    } else {
        Err(Error::DiscoveryFailure(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode_parser::encode;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn create_test_request() -> Announce {
        Announce {
            info_hash: [
                1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
            ],
            peer_id: *b"-RS0001-abcdefghijkl",
            port: 6881,
            left: 1048576,
        }
    }

    fn response(entries: Vec<(&str, Value)>) -> Vec<u8> {
        encode(&Value::Dictionary(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect::<BTreeMap<_, _>>(),
        ))
    }

    #[test]
    fn test_build_tracker_url() {
        let url =
            build_tracker_url("http://tracker.example.com:8080/announce", &create_test_request())
                .unwrap();

        assert!(url.starts_with("http://tracker.example.com:8080/announce?"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("left=1048576"));
        assert!(url.contains("info_hash=%01%02%03"));
        assert!(url.contains("peer_id=%2DRS0001%2Dabcdefghijkl"));
    }

    #[test]
    fn test_build_tracker_url_invalid_announce() {
        assert!(build_tracker_url("invalid_url", &create_test_request()).is_err());
    }

    #[test]
    fn test_build_tracker_url_with_query_params() {
        let url = build_tracker_url(
            "http://tracker.example.com:8080/announce?existing=param",
            &create_test_request(),
        )
        .unwrap();

        assert!(url.contains("?existing=param&info_hash="));
        assert!(url.contains("port=6881"));
    }

    #[test]
    fn test_extract_peers_valid() {
        // Peer 1: 192.168.1.1:6881, Peer 2: 10.0.0.1:8080
        let peer_data = vec![
            192, 168, 1, 1, 0x1A, 0xE1, // Peer 1
            10, 0, 0, 1, 0x1F, 0x90, // Peer 2
        ];

        let peers = extract_peers(&peer_data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], Peer::new(Ipv4Addr::new(192, 168, 1, 1), 6881));
        assert_eq!(peers[1], Peer::new(Ipv4Addr::new(10, 0, 0, 1), 8080));
    }

    #[test]
    fn test_extract_peers_empty() {
        assert_eq!(extract_peers(&[]).unwrap().len(), 0);
    }

    #[test]
    fn test_extract_peers_invalid_length() {
        assert!(extract_peers(&[192, 168, 1, 1, 0x1A]).is_none());
    }

    #[test]
    fn test_extract_peers_port_endianness() {
        let peers = extract_peers(&[192, 168, 1, 1, 0x01, 0x00]).unwrap();
        assert_eq!(peers[0].port, 256);

        let peers = extract_peers(&[192, 168, 1, 1, 0x00, 0x01]).unwrap();
        assert_eq!(peers[0].port, 1);
    }

    #[test]
    fn test_parse_compact_response() {
        let body = response(vec![
            ("interval", Value::Integer(1800)),
            ("peers", Value::Bytes(vec![127, 0, 0, 1, 0x1A, 0xE1])),
        ]);

        let peers = parse_announce_response(&body).unwrap();
        assert_eq!(peers, vec![Peer::new(Ipv4Addr::LOCALHOST, 6881)]);
    }

    #[test]
    fn test_parse_dictionary_response() {
        let peer = |ip: &str, port: i64| {
            Value::Dictionary(BTreeMap::from([
                (b"ip".to_vec(), Value::Bytes(ip.as_bytes().to_vec())),
                (b"port".to_vec(), Value::Integer(port)),
            ]))
        };
        let body = response(vec![(
            "peers",
            Value::List(vec![
                peer("10.0.0.2", 51413),
                peer("not.an.address", 1),
                peer("::1", 6881),
                peer("10.0.0.3", 70000),
            ]),
        )]);

        let peers = parse_announce_response(&body).unwrap();
        assert_eq!(
            peers,
            vec![
                Peer::new(Ipv4Addr::new(10, 0, 0, 2), 51413),
                Peer::new(Ipv6Addr::LOCALHOST, 6881),
            ]
        );
    }

    #[test]
    fn test_parse_failure_reason() {
        let body = response(vec![(
            "failure reason",
            Value::Bytes(b"torrent not registered".to_vec()),
        )]);

        assert_matches!(
            parse_announce_response(&body),
            Err(TrackerError::Failure(reason)) if reason == "torrent not registered"
        );
    }

    #[test]
    fn test_parse_bad_responses() {
        assert_matches!(
            parse_announce_response(b"garbage"),
            Err(TrackerError::Bencode(_))
        );
        assert_matches!(
            parse_announce_response(&response(vec![("interval", Value::Integer(5))])),
            Err(TrackerError::InvalidResponse(_))
        );
        assert_matches!(
            parse_announce_response(&response(vec![("peers", Value::Bytes(vec![1, 2, 3]))])),
            Err(TrackerError::InvalidResponse(_))
        );
    }

    #[test]
    fn test_parse_deeply_nested_response() {
        assert_matches!(
            parse_announce_response(&[b'l'; 200_000]),
            Err(TrackerError::Bencode(BencodeError::TooDeep { .. }))
        );
    }

    #[tokio::test]
    async fn test_discover_peers_no_trackers() {
        assert_matches!(
            discover_peers(&[], &create_test_request()).await,
            Err(Error::DiscoveryFailure(_))
        );
    }

    #[tokio::test]
    async fn test_discover_peers_all_sources_fail() {
        let urls = vec!["wss://tracker.example.com".to_string(), "nonsense".to_string()];

        assert_matches!(
            discover_peers(&urls, &create_test_request()).await,
            Err(Error::DiscoveryFailure(reason)) if reason.contains("unsupported")
        );
    }

    /// Answers one HTTP request with `body`.
    async fn serve_once(listener: TcpListener, body: Vec<u8>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 4096];
        let _ = stream.read(&mut request).await.unwrap();

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_peers_skips_failing_source_and_dedups() {
        let body = response(vec![(
            "peers",
            Value::Bytes(vec![
                10, 0, 0, 1, 0x1A, 0xE1, // 10.0.0.1:6881
                10, 0, 0, 1, 0x1A, 0xE1, // duplicate
                10, 0, 0, 2, 0x1A, 0xE1, // 10.0.0.2:6881
            ]),
        )]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_once(listener, body));

        let urls = vec![
            "ftp://tracker.example.com/announce".to_string(),
            format!("http://127.0.0.1:{port}/announce"),
        ];
        let peers = discover_peers(&urls, &create_test_request()).await.unwrap();

        assert_eq!(
            peers,
            vec![
                Peer::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
                Peer::new(Ipv4Addr::new(10, 0, 0, 2), 6881),
            ]
        );
    }

    #[tokio::test]
    async fn test_discover_peers_skips_deeply_nested_body() {
        let hostile = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hostile_port = hostile.local_addr().unwrap().port();
        let nested = [&b"d5:peers"[..], &[b'l'; 100_000]].concat();
        tokio::spawn(serve_once(hostile, nested));

        let body = response(vec![("peers", Value::Bytes(vec![10, 0, 0, 3, 0x1A, 0xE1]))]);
        let honest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let honest_port = honest.local_addr().unwrap().port();
        tokio::spawn(serve_once(honest, body));

        let urls = vec![
            format!("http://127.0.0.1:{hostile_port}/announce"),
            format!("http://127.0.0.1:{honest_port}/announce"),
        ];
        let peers = discover_peers(&urls, &create_test_request()).await.unwrap();

        assert_eq!(peers, vec![Peer::new(Ipv4Addr::new(10, 0, 0, 3), 6881)]);
    }
}
