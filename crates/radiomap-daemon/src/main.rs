use std::sync::Arc;

use radiomap_daemon::core::{DaemonCore, DaemonEvent};
use radiomap_daemon::directory::DirectoryClient;
use radiomap_daemon::http::{self, HttpState};
use radiomap_daemon::mpv::MpvOutput;
use radiomap_daemon::{logging, BroadcastMessage};
use radiomap_proto::config::Config;
use radiomap_proto::favorites::FavoritesStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can feed it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let log_path = logging::init(broadcast_tx.clone())?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let favorites = FavoritesStore::open(&config.favorites.file);
    info!(
        "{} favorites loaded from {:?}",
        favorites.len(),
        favorites.path()
    );

    let directory = Arc::new(DirectoryClient::new(&config.directory)?);
    info!("Station directory: {}", directory.base_url());

    let audio = Arc::new(MpvOutput::new(
        config.mpv.binary.clone(),
        config.playback.default_volume,
    ));

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = mpsc::channel::<DaemonEvent>(256);

    let daemon_core = DaemonCore::new(
        &config,
        directory.clone(),
        audio.clone(),
        favorites.clone(),
        broadcast_tx.clone(),
        event_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            HttpState {
                state_manager: daemon_core.state_manager(),
                event_tx: event_tx.clone(),
                directory,
                favorites,
            },
        );
    } else {
        warn!("HTTP API disabled; nothing can drive the daemon");
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(DaemonEvent::Shutdown).await;
        }
    });

    info!("Daemon initialised, running event loop");
    daemon_core.run(event_rx).await?;
    audio.shutdown().await;

    Ok(())
}
