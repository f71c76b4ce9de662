use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use rs_swarm::config::{DEFAULT_LISTEN_PORT, DEFAULT_MAX_PEERS, DownloadConfig};
use rs_swarm::storage::save_download;
use rs_swarm::tracker::{Announce, discover_peers};
use rs_swarm::{BitTorrentClient, Error, PeerId, Result, parse_torrent_file};

/// Download the content described by a .torrent file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The .torrent file describing the download.
    torrent: PathBuf,

    /// Directory the downloaded files are written to.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Maximum number of peers downloaded from at once.
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    max_peers: usize,

    /// Port reported to trackers.
    #[arg(short, long, default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Give up after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Accept peers whose handshake carries a different info hash.
    #[arg(long)]
    lenient_handshake: bool,
}

const PROGRESS_TICK: Duration = Duration::from_millis(250);

fn progress_bar(name: &str, total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    bar.set_message(name.to_string());
    bar
}

async fn run(args: Args) -> Result<()> {
    let torrent = parse_torrent_file(&args.torrent)?;
    info!(
        "{}: {} pieces of {} bytes",
        torrent.name(),
        torrent.piece_count(),
        torrent.piece_length()
    );

    let config = DownloadConfig::default()
        .with_max_peers(args.max_peers)
        .with_listen_port(args.port)
        .with_verify_info_hash(!args.lenient_handshake)
        .with_timeout(args.timeout.map(Duration::from_secs));
    let peer_id = PeerId::generate();

    let announce = Announce {
        info_hash: *torrent.info_hash(),
        peer_id: *peer_id.as_bytes(),
        port: config.listen_port,
        left: torrent.total_size(),
    };
    let peers = discover_peers(&torrent.announce_urls(), &announce).await?;

    let client = BitTorrentClient::new(torrent, peer_id, config);
    let bar = progress_bar(client.torrent().name(), client.torrent().total_size());
    let ticker = {
        let client = client.clone();
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                let (done, _) = client.progress().await;
                bar.set_position(done);
                tokio::time::sleep(PROGRESS_TICK).await;
            }
        })
    };

    let summary = client.start_download(peers).await;
    ticker.abort();
    bar.set_position(summary.completed_bytes);
    if !summary.is_complete() {
        bar.abandon_with_message("incomplete");
        return Err(Error::Incomplete {
            completed: summary.completed_pieces,
            total: summary.piece_count,
        });
    }

    bar.finish_with_message("done");

    let shared = client.ledger();
    let ledger = shared.lock().await;
    save_download(client.torrent(), &ledger, &args.output).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
