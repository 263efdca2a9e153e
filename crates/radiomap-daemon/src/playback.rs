//! Playback session manager.
//!
//! Owns the single `PlaybackSession` and the audio output.  Every play
//! attempt gets a fresh generation; asynchronous results (attempt outcome,
//! stream failure, start deadline) carry the generation they belong to and
//! are ignored unless it is still current.  That is the whole race guard:
//! rapid station switches can never let an older, slower "now playing"
//! overwrite a newer selection.
//!
//! ```text
//!   select_station / toggle_play (Paused|Error)
//!         │  release(previous generation)          ← awaited inline
//!         │  play(new generation, url) → PlayAttempt ← awaited inline (claims output)
//!         └─ spawn: PlayAttempt outcome → SessionEvent::AttemptResolved
//! ```
//!
//! The manager never blocks on the network itself.  It is driven by the
//! coordinator loop, which feeds `SessionEvent`s back in one at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use radiomap_proto::config::PlaybackConfig;
use radiomap_proto::favorites::FavoritesStore;
use radiomap_proto::protocol::{Generation, Notice, PlaybackSession, Station, TransportState};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::volume::VolumeCoalescer;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    /// The output refused the source (bad URL, unsupported format).
    #[error("stream rejected: {0}")]
    Rejected(String),

    /// The stream started negotiating and then failed.
    #[error("stream failed: {0}")]
    Stream(String),

    /// The attempt was cut short by a newer load or a release.
    #[error("playback interrupted")]
    Interrupted,

    /// The output itself (player process, device) is unavailable.
    #[error("audio output unavailable: {0}")]
    Backend(String),

    #[error("stream did not start within {0:?}")]
    StartTimeout(Duration),
}

/// Resolves once the output knows whether the attempt is audible.
pub type PlayAttempt = oneshot::Receiver<Result<(), AudioError>>;

/// Stream failure reported by the output after (or while) starting.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub generation: Generation,
    pub reason: String,
}

/// Audio output boundary.  Resources are keyed by generation so a release
/// for an old generation never touches a newer one.
#[async_trait]
pub trait AudioOutput: Send + Sync + 'static {
    /// Claim the output for `generation`, point it at `url` and start
    /// playing.  Returns once the source is set; the attempt outcome arrives
    /// on the returned receiver.
    async fn play(&self, generation: Generation, url: &str) -> Result<PlayAttempt, AudioError>;

    async fn pause(&self, generation: Generation) -> Result<(), AudioError>;

    /// `volume` in 0.0..=1.0.
    async fn set_volume(&self, volume: f32) -> Result<(), AudioError>;

    async fn set_muted(&self, muted: bool) -> Result<(), AudioError>;

    /// Stop and free the resource for `generation`.  A no-op when that
    /// generation no longer owns the output.
    async fn release(&self, generation: Generation) -> Result<(), AudioError>;

    /// Mid-play stream failures.
    fn failures(&self) -> broadcast::Receiver<StreamFailure>;
}

/// Asynchronous results fed back into the manager by the coordinator.
#[derive(Debug)]
pub enum SessionEvent {
    AttemptResolved {
        generation: Generation,
        result: Result<(), AudioError>,
    },
    StreamFailed(StreamFailure),
    StartTimeout {
        generation: Generation,
    },
    VolumeTick,
}

pub struct PlaybackManager {
    audio: Arc<dyn AudioOutput>,
    favorites: FavoritesStore,
    session: PlaybackSession,
    /// True while the output holds a resource for `session.generation`.
    resource_live: bool,
    volume: VolumeCoalescer,
    volume_interval: Duration,
    start_timeout: Option<Duration>,
    events: mpsc::Sender<SessionEvent>,
}

impl PlaybackManager {
    /// Must be called inside a tokio runtime: spawns the forwarder that turns
    /// output failures into `SessionEvent::StreamFailed`.
    pub fn new(
        audio: Arc<dyn AudioOutput>,
        favorites: FavoritesStore,
        config: &PlaybackConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let mut failures = audio.failures();
        let failure_tx = events.clone();
        tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(failure) => {
                        if failure_tx
                            .send(SessionEvent::StreamFailed(failure))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("playback: missed {} stream failure reports", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let start_timeout = (config.start_timeout_secs > 0)
            .then(|| Duration::from_secs(config.start_timeout_secs));

        Self {
            audio,
            favorites,
            session: PlaybackSession::new(config.default_volume),
            resource_live: false,
            volume: VolumeCoalescer::new(),
            volume_interval: Duration::from_millis(config.volume_interval_ms),
            start_timeout,
            events,
        }
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn transport(&self) -> TransportState {
        self.session.transport
    }

    /// Replace the current session with one for `station` and start it.
    pub async fn select_station(&mut self, station: Station) -> Option<Notice> {
        info!("playback: select '{}' ({})", station.name, station.url);
        self.teardown().await;
        self.session.favorite = self.favorites.is_favorite(&station.url);
        self.session.station = Some(station);
        self.start_attempt().await
    }

    /// Playing → Paused locally; Paused/Error → fresh attempt on the same
    /// station; Loading → abandon the attempt and sit in Paused.
    pub async fn toggle_play(&mut self) -> Option<Notice> {
        match self.session.transport {
            TransportState::Idle => None,
            TransportState::Playing => {
                if let Err(e) = self.audio.pause(self.session.generation).await {
                    warn!("playback: pause failed: {}", e);
                }
                self.session.transport = TransportState::Paused;
                None
            }
            TransportState::Loading => {
                self.teardown().await;
                // Anything still in flight for the abandoned attempt is stale now.
                self.session.generation += 1;
                self.session.transport = TransportState::Paused;
                None
            }
            TransportState::Paused | TransportState::Error => {
                self.teardown().await;
                self.start_attempt().await
            }
        }
    }

    /// Bookkeeping updates immediately; the audible change is coalesced to
    /// one per interval carrying the newest value.
    pub fn set_volume(&mut self, value: i32) {
        let value = value.clamp(0, 100) as u8;
        self.session.volume = value;
        if self.volume.offer(value) {
            let tx = self.events.clone();
            let interval = self.volume_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                let _ = tx.send(SessionEvent::VolumeTick).await;
            });
        }
    }

    pub async fn toggle_mute(&mut self) {
        self.session.muted = !self.session.muted;
        if let Err(e) = self.audio.set_muted(self.session.muted).await {
            warn!("playback: set_muted({}) failed: {}", self.session.muted, e);
        }
    }

    /// Flip the current station's favorite status in the store, then read
    /// the flag back from the store.
    pub fn toggle_favorite(&mut self) -> Option<Notice> {
        let station = self.session.station.clone()?;
        let result = if self.favorites.is_favorite(&station.url) {
            self.favorites
                .remove(&station.url)
                .map(|_| Notice::info("Removed from Favorites", station.name.clone()))
        } else {
            self.favorites
                .add(station.clone())
                .map(|_| Notice::success("Added to Favorites", station.name.clone()))
        };
        self.refresh_favorite();
        Some(result.unwrap_or_else(|e| {
            warn!("playback: favorite toggle failed: {}", e);
            Notice::error("Favorites", format!("Could not update favorites: {}", e))
        }))
    }

    /// Re-derive the cached favorite flag after any store change.
    pub fn refresh_favorite(&mut self) {
        self.session.favorite = self
            .session
            .station
            .as_ref()
            .is_some_and(|s| self.favorites.is_favorite(&s.url));
    }

    pub async fn handle_event(&mut self, event: SessionEvent) -> Option<Notice> {
        match event {
            SessionEvent::AttemptResolved { generation, result } => {
                self.on_attempt_resolved(generation, result).await
            }
            SessionEvent::StreamFailed(failure) => {
                if failure.generation != self.session.generation
                    || !matches!(
                        self.session.transport,
                        TransportState::Loading | TransportState::Playing
                    )
                {
                    debug!("playback: ignoring stale stream failure g={}", failure.generation);
                    return None;
                }
                warn!("playback: stream failed: {}", failure.reason);
                self.fail(AudioError::Stream(failure.reason)).await
            }
            SessionEvent::StartTimeout { generation } => {
                if generation != self.session.generation
                    || self.session.transport != TransportState::Loading
                {
                    return None;
                }
                let limit = self.start_timeout.unwrap_or_default();
                warn!("playback: no audio after {:?}, marking Error", limit);
                self.fail(AudioError::StartTimeout(limit)).await
            }
            SessionEvent::VolumeTick => {
                if let Some(value) = self.volume.fire() {
                    debug!("playback: applying volume {}", value);
                    if let Err(e) = self.audio.set_volume(f32::from(value) / 100.0).await {
                        warn!("playback: set_volume failed: {}", e);
                    }
                }
                None
            }
        }
    }

    /// Release the live resource.  Used on shutdown.
    pub async fn dispose(&mut self) {
        self.teardown().await;
    }

    // ── internals ─────────────────────────────────────────────────────────────

    async fn on_attempt_resolved(
        &mut self,
        generation: Generation,
        result: Result<(), AudioError>,
    ) -> Option<Notice> {
        if generation != self.session.generation {
            debug!(
                "playback: stale attempt g={} (current {}) resolved {:?}",
                generation,
                self.session.generation,
                result.as_ref().err()
            );
            if let Err(e) = self.audio.release(generation).await {
                debug!("playback: release of stale g={} failed: {}", generation, e);
            }
            return None;
        }
        if self.session.transport != TransportState::Loading {
            return None;
        }
        match result {
            Ok(()) => {
                self.session.transport = TransportState::Playing;
                let name = self.station_name();
                info!("playback: now playing '{}' (g={})", name, generation);
                Some(Notice::success("Now Playing", name))
            }
            Err(e) => {
                warn!("playback: attempt g={} failed: {}", generation, e);
                self.fail(e).await
            }
        }
    }

    async fn start_attempt(&mut self) -> Option<Notice> {
        let url = self.session.station.as_ref()?.url.clone();
        self.session.generation += 1;
        let generation = self.session.generation;
        self.session.transport = TransportState::Loading;

        let attempt = match self.audio.play(generation, &url).await {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!("playback: output refused g={}: {}", generation, e);
                return self.fail(e).await;
            }
        };
        self.resource_live = true;

        let tx = self.events.clone();
        tokio::spawn(async move {
            let result = attempt.await.unwrap_or(Err(AudioError::Interrupted));
            let _ = tx
                .send(SessionEvent::AttemptResolved { generation, result })
                .await;
        });

        if let Some(limit) = self.start_timeout {
            let tx = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let _ = tx.send(SessionEvent::StartTimeout { generation }).await;
            });
        }
        None
    }

    async fn teardown(&mut self) {
        if !self.resource_live {
            return;
        }
        self.resource_live = false;
        if let Err(e) = self.audio.release(self.session.generation).await {
            warn!(
                "playback: release g={} failed: {}",
                self.session.generation, e
            );
        }
    }

    async fn fail(&mut self, error: AudioError) -> Option<Notice> {
        self.teardown().await;
        self.session.transport = TransportState::Error;
        Some(Notice::error(
            "Playback Error",
            format!("Unable to play {}: {}", self.station_name(), error),
        ))
    }

    fn station_name(&self) -> String {
        self.session
            .station
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }
}
