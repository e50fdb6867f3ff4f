use std::path::PathBuf;
use riptide::{Engine, Event, Settings};

const DEFAULT_PORT: u16 = 6881;

#[tokio::main]
async fn main() {

    let state_dir = std::env::var("RIPTIDE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".riptide"));

    let settings = match Settings::load(&state_dir.join("settings.bencode")) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("cannot load settings: {}", e);
            std::process::exit(1);
        }
    };

    let level = if settings.enable_logging {
        tracing::Level::INFO
    } else {
        tracing::Level::ERROR
    };
    let sub = tracing_subscriber::fmt().with_max_level(level).finish();
    tracing::subscriber::set_global_default(sub).expect("subscriber installs once");

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("usage: riptide <torrent file>...");
        std::process::exit(2);
    }

    let mut engine = match Engine::spawn(state_dir, DEFAULT_PORT) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("cannot start engine: {}", e);
            std::process::exit(1);
        }
    };

    let report = engine.add_torrents(paths, None, None).await;
    tracing::info!(
        "added {}, skipped {}, failed {}",
        report.added,
        report.skipped,
        report.failed
    );
    for (path, error) in &report.errors {
        tracing::error!("{}: {}", path.display(), error);
    }
    if report.added == 0 {
        engine.shutdown().await;
        std::process::exit(1);
    }

    loop {
        tokio::select! {

            event = engine.next_event() => {
                match event {
                    Some(Event::ProgressTick { torrents }) => {
                        for t in torrents {
                            tracing::info!(
                                "{}: {} {}/{} bytes, {} peers, down {} B/s, up {} B/s",
                                t.name,
                                t.state,
                                t.verified_size,
                                t.total_size,
                                t.peers_active,
                                t.download_rate,
                                t.upload_rate,
                            );
                        }
                    }
                    Some(Event::PieceVerified { piece, .. }) => {
                        tracing::debug!("piece {} verified", piece);
                    }
                    Some(Event::StateChanged { id, state }) => {
                        tracing::info!("torrent {} is now {}", hex::encode(id), state);
                    }
                    Some(Event::TorrentAdded { name, .. }) => {
                        tracing::info!("added torrent {}", name);
                    }
                    Some(Event::Error { kind, message, .. }) => {
                        tracing::warn!("{} error: {}", kind, message);
                    }
                    None => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
}
