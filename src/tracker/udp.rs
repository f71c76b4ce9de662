use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use rand::Rng as _;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;
use url::Url;

use super::{Announce, TrackerError, extract_peers};
use crate::peer::Peer;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const UDP_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn connect_request(transaction_id: u32) -> [u8; 16] {
    let mut request = [0u8; 16];
    request[..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    request[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    request[12..].copy_from_slice(&transaction_id.to_be_bytes());
    request
}

fn announce_request(connection_id: u64, transaction_id: u32, key: u32, req: &Announce) -> Vec<u8> {
    let mut request = Vec::with_capacity(98);
    request.extend_from_slice(&connection_id.to_be_bytes());
    request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    request.extend_from_slice(&transaction_id.to_be_bytes());
    request.extend_from_slice(&req.info_hash);
    request.extend_from_slice(&req.peer_id);
    request.extend_from_slice(&0u64.to_be_bytes()); // downloaded
    request.extend_from_slice(&req.left.to_be_bytes());
    request.extend_from_slice(&0u64.to_be_bytes()); // uploaded
    request.extend_from_slice(&2u32.to_be_bytes()); // event: started
    request.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = default)
    request.extend_from_slice(&key.to_be_bytes());
    request.extend_from_slice(&(-1i32).to_be_bytes()); // num_want (-1 = default)
    request.extend_from_slice(&req.port.to_be_bytes());
    request
}

/// Common header check. Returns the action of a well-formed reply.
fn check_header(response: &[u8], transaction_id: u32) -> Result<u32, TrackerError> {
    if response.len() < 8 {
        return Err(TrackerError::InvalidResponse("response too short".into()));
    }
    let action = read_u32(response, 0);
    if read_u32(response, 4) != transaction_id {
        return Err(TrackerError::InvalidResponse("transaction id mismatch".into()));
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&response[8..]).into_owned();
        return Err(TrackerError::Failure(message));
    }
    Ok(action)
}

fn parse_connect_response(response: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    let action = check_header(response, transaction_id)?;
    if action != ACTION_CONNECT || response.len() < 16 {
        return Err(TrackerError::InvalidResponse("connect response mismatch".into()));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&response[8..16]);
    Ok(u64::from_be_bytes(id))
}

fn parse_announce_response(response: &[u8], transaction_id: u32) -> Result<Vec<Peer>, TrackerError> {
    let action = check_header(response, transaction_id)?;
    if action != ACTION_ANNOUNCE || response.len() < 20 {
        return Err(TrackerError::InvalidResponse("announce response mismatch".into()));
    }
    debug!(
        "udp announce: interval {}s, {} leechers, {} seeders",
        read_u32(response, 8),
        read_u32(response, 12),
        read_u32(response, 16)
    );
    extract_peers(&response[20..])
        .ok_or_else(|| TrackerError::InvalidResponse("truncated peer list".into()))
}

async fn resolve(url: &str) -> Result<SocketAddr, TrackerError> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| TrackerError::InvalidResponse(format!("no host in {url}")))?;
    let port = parsed
        .port()
        .ok_or_else(|| TrackerError::InvalidResponse(format!("no port in {url}")))?;

    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| TrackerError::InvalidResponse(format!("{host} did not resolve")))
}

async fn send_and_receive(
    socket: &UdpSocket,
    request: &[u8],
    base_timeout: Duration,
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];

    for attempt in 0..MAX_RETRIES {
        socket.send(request).await?;

        match timeout(base_timeout * (1 << attempt), socket.recv(&mut buf)).await {
            Ok(Ok(n)) => return Ok(buf[..n].to_vec()),
            Ok(Err(e)) => return Err(TrackerError::Io(e)),
            Err(_) => continue,
        }
    }

    Err(TrackerError::Timeout)
}

/// Runs the connect then announce exchange against a `udp://host:port` tracker.
pub async fn announce(url: &str, req: &Announce) -> Result<Vec<Peer>, TrackerError> {
    announce_with_timeout(url, req, UDP_TIMEOUT).await
}

async fn announce_with_timeout(
    url: &str,
    req: &Announce,
    base_timeout: Duration,
) -> Result<Vec<Peer>, TrackerError> {
    let addr = resolve(url).await?;
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;

    let transaction_id: u32 = rand::rng().random();
    let response = send_and_receive(&socket, &connect_request(transaction_id), base_timeout).await?;
    let connection_id = parse_connect_response(&response, transaction_id)?;

    let transaction_id: u32 = rand::rng().random();
    let key: u32 = rand::rng().random();
    let request = announce_request(connection_id, transaction_id, key, req);
    let response = send_and_receive(&socket, &request, base_timeout).await?;
    parse_announce_response(&response, transaction_id)
}
