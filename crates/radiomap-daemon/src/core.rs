//! DaemonCore: single-owner event loop for all mutable state.
//!
//! Every input (HTTP commands, directory results, play attempt outcomes,
//! volume ticks, favorites changes) arrives as a `DaemonEvent` on one mpsc
//! channel and is handled to completion before the next one.  DaemonCore
//! owns `CatalogState` and `PlaybackManager` exclusively; no other task
//! touches them.
//!
//! Network work never runs inside the loop.  Directory queries and play
//! attempts are spawned as tasks that report back with the sequence token or
//! generation they were issued under, and the state machines drop anything
//! that is no longer current.
//!
//! After each event the `CoordinatorState` snapshot is published through
//! `StateManager` and a `BroadcastMessage::StateUpdated` goes out.

use std::sync::Arc;

use radiomap_proto::config::Config;
use radiomap_proto::favorites::{FavoritesStore, Subscription};
use radiomap_proto::protocol::{CatalogScope, Command, Notice, Station};
use radiomap_proto::state::{CoordinatorState, StateManager};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogOutcome, CatalogState};
use crate::directory::{DirectoryError, StationDirectory};
use crate::playback::{AudioOutput, PlaybackManager, SessionEvent};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from the HTTP API.
    ClientCommand(Command),
    /// A directory query finished.  `seq` is the ticket it was issued under.
    CatalogResolved {
        seq: u64,
        result: Result<Vec<Station>, DirectoryError>,
    },
    /// Play attempt outcome, stream failure, deadline or volume tick.
    Session(SessionEvent),
    /// The favorites store changed (from any call site).
    FavoritesChanged,
    /// Shutdown requested.
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    directory: Arc<dyn StationDirectory>,
    favorites: FavoritesStore,
    catalog: CatalogState,
    playback: PlaybackManager,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    last_notice: Option<Notice>,
    /// Scope issued before the first event is handled.
    initial_scope: CatalogScope,
    _favorites_subscription: Subscription,
}

impl DaemonCore {
    /// Must be called inside a tokio runtime: spawns the forwarders that feed
    /// session events and favorites changes into `event_tx`.
    pub fn new(
        config: &Config,
        directory: Arc<dyn StationDirectory>,
        audio: Arc<dyn AudioOutput>,
        favorites: FavoritesStore,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        // Session events get their own channel plus one forwarder into the loop.
        let (session_tx, mut session_rx) = mpsc::channel::<SessionEvent>(64);
        let core_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = session_rx.recv().await {
                if core_tx.send(DaemonEvent::Session(evt)).await.is_err() {
                    break;
                }
            }
        });

        // Store callbacks are synchronous; a Notify coalesces bursts and a
        // task turns them into loop events.
        let changed = Arc::new(Notify::new());
        let subscription = favorites.subscribe({
            let changed = Arc::clone(&changed);
            move |_: &[Station]| changed.notify_one()
        });
        let core_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                changed.notified().await;
                if core_tx.send(DaemonEvent::FavoritesChanged).await.is_err() {
                    break;
                }
            }
        });

        let playback = PlaybackManager::new(audio, favorites.clone(), &config.playback, session_tx);
        let initial = CoordinatorState {
            session: playback.session().clone(),
            favorites: favorites.list(),
            ..Default::default()
        };

        Self {
            directory,
            favorites,
            catalog: CatalogState::new(),
            playback,
            state_manager: Arc::new(StateManager::new(initial)),
            event_tx,
            broadcast_tx,
            last_notice: None,
            initial_scope: CatalogScope::Top {
                limit: config.directory.station_limit,
            },
            _favorites_subscription: subscription,
        }
    }

    /// Borrow the state manager (for use by the HTTP server).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");

        self.select_scope(self.initial_scope.clone());
        self.publish().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("DaemonCore: event channel closed, shutting down");
                    break;
                }
                Some(DaemonEvent::Shutdown) => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                Some(DaemonEvent::ClientCommand(cmd)) => {
                    info!("DaemonCore: command {:?}", cmd);
                    self.handle_command(cmd).await;
                }
                Some(DaemonEvent::CatalogResolved { seq, result }) => {
                    self.on_catalog_resolved(seq, result);
                }
                Some(DaemonEvent::Session(evt)) => {
                    let notice = self.playback.handle_event(evt).await;
                    self.notify(notice);
                }
                Some(DaemonEvent::FavoritesChanged) => {
                    debug!("DaemonCore: favorites changed ({} stored)", self.favorites.len());
                    self.playback.refresh_favorite();
                }
            }
            self.publish().await;
        }

        self.cleanup().await;
        Ok(())
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SelectScope { scope } => self.select_scope(scope),
            Command::PlayIndex { idx } => match self.catalog.station(idx).cloned() {
                Some(station) => self.play(station).await,
                None => warn!("DaemonCore: no catalog station at index {}", idx),
            },
            Command::PlayFavorite { idx } => match self.favorites.list().get(idx).cloned() {
                Some(station) => self.play(station).await,
                None => warn!("DaemonCore: no favorite at index {}", idx),
            },
            Command::TogglePlay => {
                let notice = self.playback.toggle_play().await;
                self.notify(notice);
            }
            Command::Volume { value } => self.playback.set_volume(value),
            Command::ToggleMute => self.playback.toggle_mute().await,
            Command::ToggleFavorite => {
                let notice = self.playback.toggle_favorite();
                self.notify(notice);
            }
        }
    }

    fn select_scope(&mut self, scope: CatalogScope) {
        let ticket = self.catalog.select_scope(scope);
        info!("DaemonCore: querying {} (seq={})", ticket.scope, ticket.seq);
        let directory = Arc::clone(&self.directory);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = directory.query(&ticket.scope).await;
            let _ = tx
                .send(DaemonEvent::CatalogResolved {
                    seq: ticket.seq,
                    result,
                })
                .await;
        });
    }

    fn on_catalog_resolved(&mut self, seq: u64, result: Result<Vec<Station>, DirectoryError>) {
        let label = self
            .catalog
            .scope()
            .map(ToString::to_string)
            .unwrap_or_default();
        match self.catalog.resolve(seq, result) {
            CatalogOutcome::Published(n) => {
                info!("DaemonCore: {} stations for {}", n, label);
            }
            CatalogOutcome::Failed(msg) => {
                warn!("DaemonCore: directory query for {} failed: {}", label, msg);
                self.notify(Some(Notice::error(
                    "Directory Unavailable",
                    format!("Could not load {}: {}", label, msg),
                )));
            }
            CatalogOutcome::Stale => {}
        }
    }

    async fn play(&mut self, station: Station) {
        let notice = self.playback.select_station(station).await;
        self.notify(notice);
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn notify(&mut self, notice: Option<Notice>) {
        if let Some(notice) = notice {
            debug!("DaemonCore: notice {:?} '{}'", notice.severity, notice.title);
            let _ = self
                .broadcast_tx
                .send(BroadcastMessage::Notice(notice.clone()));
            self.last_notice = Some(notice);
        }
    }

    async fn publish(&self) {
        let snapshot = CoordinatorState {
            rev: 0,
            scope: self.catalog.scope().cloned(),
            stations: self.catalog.stations().to_vec(),
            loading: self.catalog.is_loading(),
            catalog_error: self.catalog.error().map(str::to_string),
            session: self.playback.session().clone(),
            favorites: self.favorites.list(),
            last_notice: self.last_notice.clone(),
        };
        self.state_manager.publish(snapshot).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn cleanup(&mut self) {
        info!("DaemonCore: cleanup, releasing audio");
        self.playback.dispose().await;
    }
}
