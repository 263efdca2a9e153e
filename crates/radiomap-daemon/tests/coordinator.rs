mod common;

use std::sync::Arc;

use common::{playback_config, stations, wait_for, FakeAudio, FakeDirectory};
use radiomap_daemon::core::{DaemonCore, DaemonEvent};
use radiomap_daemon::BroadcastMessage;
use radiomap_proto::config::Config;
use radiomap_proto::favorites::FavoritesStore;
use radiomap_proto::protocol::{CatalogScope, Command, Severity, TransportState};
use radiomap_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};

struct Running {
    state: Arc<StateManager>,
    tx: mpsc::Sender<DaemonEvent>,
    audio: Arc<FakeAudio>,
    directory: Arc<FakeDirectory>,
    favorites: FavoritesStore,
    broadcast_rx: broadcast::Receiver<BroadcastMessage>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl Running {
    async fn send(&self, cmd: Command) {
        self.tx.send(DaemonEvent::ClientCommand(cmd)).await.unwrap();
    }

    async fn select_country(&self, name: &str) {
        self.send(Command::SelectScope {
            scope: CatalogScope::Country {
                name: name.to_string(),
            },
        })
        .await;
    }
}

fn start(directory: FakeDirectory, audio: Arc<FakeAudio>) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let favorites = FavoritesStore::open(dir.path().join("favorites.json"));
    let directory = Arc::new(directory);

    let mut config = Config::default();
    config.playback = playback_config();
    config.directory.station_limit = 100;

    let (broadcast_tx, broadcast_rx) = broadcast::channel(256);
    let (tx, rx) = mpsc::channel(64);
    let core = DaemonCore::new(
        &config,
        directory.clone(),
        audio.clone(),
        favorites.clone(),
        broadcast_tx,
        tx.clone(),
    );
    let state = core.state_manager();
    let task = tokio::spawn(core.run(rx));

    Running {
        state,
        tx,
        audio,
        directory,
        favorites,
        broadcast_rx,
        task,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_top_list_is_loaded_at_startup() {
    let app = start(FakeDirectory::new(stations("Top", 5)), FakeAudio::new());

    let state = wait_for(&app.state, "top list", |s| s.stations.len() == 5).await;
    assert_eq!(state.scope, Some(CatalogScope::Top { limit: 100 }));
    assert!(!state.loading);
    assert_eq!(app.directory.queries(), vec!["top/100".to_string()]);
}

#[tokio::test]
async fn test_browse_play_pause_and_favorite() {
    let directory =
        FakeDirectory::new(stations("Top", 3)).with_country("France", stations("France", 12));
    let app = start(directory, FakeAudio::auto_start());
    wait_for(&app.state, "top list", |s| s.stations.len() == 3).await;

    app.select_country("France").await;
    let state = wait_for(&app.state, "France list", |s| {
        s.stations.len() == 12 && !s.loading
    })
    .await;
    let third = state.stations[2].clone();

    app.send(Command::PlayIndex { idx: 2 }).await;
    let state = wait_for(&app.state, "playing", |s| {
        s.session.transport == TransportState::Playing
    })
    .await;
    assert_eq!(state.session.station.as_ref(), Some(&third));
    let notice = state.last_notice.unwrap();
    assert_eq!(notice.title, "Now Playing");
    assert_eq!(notice.body, third.name);

    app.send(Command::TogglePlay).await;
    wait_for(&app.state, "paused", |s| {
        s.session.transport == TransportState::Paused
    })
    .await;
    assert_eq!(app.audio.plays().len(), 1);

    app.send(Command::ToggleFavorite).await;
    let state = wait_for(&app.state, "favorite", |s| s.session.favorite).await;
    assert_eq!(state.favorites, vec![third.clone()]);

    // A second view of the same store sees it too.
    let other_view = app.favorites.clone();
    assert!(other_view.is_favorite(&third.url));
    assert_eq!(other_view.list(), vec![third.clone()]);
}

#[tokio::test]
async fn test_favorite_removed_elsewhere_clears_session_flag() {
    let app = start(FakeDirectory::new(stations("Top", 2)), FakeAudio::auto_start());
    wait_for(&app.state, "top list", |s| s.stations.len() == 2).await;

    app.send(Command::PlayIndex { idx: 0 }).await;
    app.send(Command::ToggleFavorite).await;
    let state = wait_for(&app.state, "favorite", |s| s.session.favorite).await;
    let url = state.session.station.unwrap().url;

    assert!(app.favorites.remove(&url).unwrap());
    let state = wait_for(&app.state, "flag cleared", |s| !s.session.favorite).await;
    assert!(state.favorites.is_empty());
}

#[tokio::test]
async fn test_play_from_favorites_list() {
    let app = start(FakeDirectory::new(Vec::new()), FakeAudio::auto_start());
    let saved = stations("Saved", 2);
    for s in &saved {
        app.favorites.add(s.clone()).unwrap();
    }

    app.send(Command::PlayFavorite { idx: 1 }).await;
    let state = wait_for(&app.state, "playing favorite", |s| {
        s.session.transport == TransportState::Playing
    })
    .await;
    assert_eq!(state.session.station.as_ref(), Some(&saved[1]));
    assert!(state.session.favorite);
}

#[tokio::test]
async fn test_playback_failure_surfaces_error_without_retry() {
    let app = start(FakeDirectory::new(stations("Top", 1)), FakeAudio::new());
    wait_for(&app.state, "top list", |s| s.stations.len() == 1).await;

    app.send(Command::PlayIndex { idx: 0 }).await;
    let state = wait_for(&app.state, "loading", |s| {
        s.session.transport == TransportState::Loading
    })
    .await;
    app.audio.resolve(
        state.session.generation,
        Err(radiomap_daemon::playback::AudioError::Rejected("unsupported".into())),
    );

    let state = wait_for(&app.state, "error", |s| {
        s.session.transport == TransportState::Error
    })
    .await;
    let notice = state.last_notice.unwrap();
    assert_eq!(notice.severity, Severity::Error);
    assert_eq!(notice.title, "Playback Error");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(app.audio.plays().len(), 1);
}

#[tokio::test]
async fn test_later_scope_wins_when_earlier_query_finishes_last() {
    let directory = FakeDirectory::new(Vec::new())
        .with_country("Austria", stations("Austria", 4))
        .with_country("Belgium", stations("Belgium", 2));
    let hold_austria = directory.gate("Austria");
    let app = start(directory, FakeAudio::new());

    app.select_country("Austria").await;
    app.select_country("Belgium").await;
    wait_for(&app.state, "Belgium list", |s| {
        s.stations.len() == 2 && !s.loading
    })
    .await;

    hold_austria.send(()).unwrap();
    // Let the Austria result reach the loop and be dropped.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let state = app.state.get_state().await;
    assert_eq!(
        state.scope,
        Some(CatalogScope::Country {
            name: "Belgium".to_string()
        })
    );
    assert_eq!(state.stations.len(), 2);
    assert!(state.stations[0].name.starts_with("Belgium"));
}

#[tokio::test]
async fn test_directory_failure_keeps_previous_list() {
    let app = start(FakeDirectory::new(stations("Top", 4)), FakeAudio::new());
    wait_for(&app.state, "top list", |s| s.stations.len() == 4).await;

    app.select_country("Atlantis").await;
    let state = wait_for(&app.state, "failure", |s| s.catalog_error.is_some()).await;

    assert_eq!(state.stations.len(), 4);
    assert!(!state.loading);
    let notice = state.last_notice.unwrap();
    assert_eq!(notice.severity, Severity::Error);
    assert_eq!(notice.title, "Directory Unavailable");
}

#[tokio::test]
async fn test_notices_and_state_updates_are_broadcast() {
    let mut app = start(FakeDirectory::new(stations("Top", 1)), FakeAudio::auto_start());
    wait_for(&app.state, "top list", |s| s.stations.len() == 1).await;

    app.send(Command::PlayIndex { idx: 0 }).await;
    wait_for(&app.state, "playing", |s| {
        s.session.transport == TransportState::Playing
    })
    .await;

    let mut saw_state = false;
    let mut now_playing = None;
    while let Ok(msg) = app.broadcast_rx.try_recv() {
        match msg {
            BroadcastMessage::StateUpdated => saw_state = true,
            BroadcastMessage::Notice(n) if n.title == "Now Playing" => now_playing = Some(n),
            _ => {}
        }
    }
    assert!(saw_state);
    assert_eq!(now_playing.map(|n| n.body), Some("Top 1".to_string()));
}

#[tokio::test]
async fn test_shutdown_releases_audio() {
    let app = start(FakeDirectory::new(stations("Top", 1)), FakeAudio::auto_start());
    wait_for(&app.state, "top list", |s| s.stations.len() == 1).await;
    app.send(Command::PlayIndex { idx: 0 }).await;
    let state = wait_for(&app.state, "playing", |s| {
        s.session.transport == TransportState::Playing
    })
    .await;

    app.tx.send(DaemonEvent::Shutdown).await.unwrap();
    app.task.await.unwrap().unwrap();
    assert_eq!(app.audio.releases(), vec![state.session.generation]);
    assert!(app.audio.live().is_empty());
}
