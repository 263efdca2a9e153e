#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use radiomap_daemon::directory::{CountryPreview, DirectoryError, Result as DirResult, StationDirectory};
use radiomap_daemon::playback::{AudioError, AudioOutput, PlayAttempt, StreamFailure};
use radiomap_proto::config::PlaybackConfig;
use radiomap_proto::protocol::{Generation, Station};
use radiomap_proto::state::{CoordinatorState, StateManager};
use reqwest::StatusCode;
use tokio::sync::{broadcast, oneshot};

pub fn station(name: &str) -> Station {
    Station {
        name: name.to_string(),
        url: format!("http://streams.test/{}", name.to_lowercase().replace(' ', "-")),
        tags: Some("pop,news".to_string()),
        ..Station::default()
    }
}

pub fn stations(prefix: &str, n: usize) -> Vec<Station> {
    (1..=n).map(|i| station(&format!("{} {}", prefix, i))).collect()
}

pub fn playback_config() -> PlaybackConfig {
    PlaybackConfig {
        default_volume: 100,
        volume_interval_ms: 20,
        start_timeout_secs: 0,
    }
}

// ── fake audio output ─────────────────────────────────────────────────────────

#[derive(Default)]
struct AudioLog {
    live: HashSet<Generation>,
    max_live: usize,
    pending: HashMap<Generation, oneshot::Sender<Result<(), AudioError>>>,
    plays: Vec<(Generation, String)>,
    pauses: Vec<Generation>,
    releases: Vec<Generation>,
    volumes: Vec<f32>,
    mutes: Vec<bool>,
}

/// Records every call.  Play attempts stay pending until `resolve` unless
/// the fake was built with `auto_start`.
pub struct FakeAudio {
    log: Mutex<AudioLog>,
    auto_start: bool,
    failures: broadcast::Sender<StreamFailure>,
}

impl FakeAudio {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    /// Every attempt succeeds as soon as it is issued.
    pub fn auto_start() -> Arc<Self> {
        Self::build(true)
    }

    fn build(auto_start: bool) -> Arc<Self> {
        let (failures, _) = broadcast::channel(8);
        Arc::new(Self {
            log: Mutex::new(AudioLog::default()),
            auto_start,
            failures,
        })
    }

    /// Complete the pending attempt for `generation`.
    pub fn resolve(&self, generation: Generation, result: Result<(), AudioError>) -> bool {
        let tx = self.log.lock().unwrap().pending.remove(&generation);
        tx.map(|tx| tx.send(result).is_ok()).unwrap_or(false)
    }

    pub fn fail_stream(&self, generation: Generation, reason: &str) {
        let _ = self.failures.send(StreamFailure {
            generation,
            reason: reason.to_string(),
        });
    }

    pub fn plays(&self) -> Vec<(Generation, String)> {
        self.log.lock().unwrap().plays.clone()
    }

    pub fn pauses(&self) -> Vec<Generation> {
        self.log.lock().unwrap().pauses.clone()
    }

    pub fn releases(&self) -> Vec<Generation> {
        self.log.lock().unwrap().releases.clone()
    }

    pub fn volumes(&self) -> Vec<f32> {
        self.log.lock().unwrap().volumes.clone()
    }

    pub fn mutes(&self) -> Vec<bool> {
        self.log.lock().unwrap().mutes.clone()
    }

    pub fn live(&self) -> HashSet<Generation> {
        self.log.lock().unwrap().live.clone()
    }

    /// Highest number of simultaneously live resources ever observed.
    pub fn max_live(&self) -> usize {
        self.log.lock().unwrap().max_live
    }
}

#[async_trait]
impl AudioOutput for FakeAudio {
    async fn play(&self, generation: Generation, url: &str) -> Result<PlayAttempt, AudioError> {
        let (tx, rx) = oneshot::channel();
        let mut log = self.log.lock().unwrap();
        log.plays.push((generation, url.to_string()));
        log.live.insert(generation);
        log.max_live = log.max_live.max(log.live.len());
        if self.auto_start {
            let _ = tx.send(Ok(()));
        } else {
            log.pending.insert(generation, tx);
        }
        Ok(rx)
    }

    async fn pause(&self, generation: Generation) -> Result<(), AudioError> {
        self.log.lock().unwrap().pauses.push(generation);
        Ok(())
    }

    async fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        self.log.lock().unwrap().volumes.push(volume);
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), AudioError> {
        self.log.lock().unwrap().mutes.push(muted);
        Ok(())
    }

    async fn release(&self, generation: Generation) -> Result<(), AudioError> {
        let mut log = self.log.lock().unwrap();
        log.releases.push(generation);
        log.live.remove(&generation);
        Ok(())
    }

    fn failures(&self) -> broadcast::Receiver<StreamFailure> {
        self.failures.subscribe()
    }
}

// ── fake directory ────────────────────────────────────────────────────────────

/// In-memory directory.  Unknown countries fail with 503.  A gate holds a
/// country query until the test opens it.
#[derive(Default)]
pub struct FakeDirectory {
    top: Vec<Station>,
    countries: Mutex<HashMap<String, Vec<Station>>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    queries: Mutex<Vec<String>>,
}

impl FakeDirectory {
    pub fn new(top: Vec<Station>) -> Self {
        Self {
            top,
            ..Default::default()
        }
    }

    pub fn with_country(self, name: &str, stations: Vec<Station>) -> Self {
        self.countries
            .lock()
            .unwrap()
            .insert(name.to_string(), stations);
        self
    }

    /// Hold queries for `name` until the returned sender fires.
    pub fn gate(&self, name: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(name.to_string(), rx);
        tx
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl StationDirectory for FakeDirectory {
    async fn query_top(&self, limit: usize) -> DirResult<Vec<Station>> {
        self.queries.lock().unwrap().push(format!("top/{}", limit));
        Ok(self.top.iter().take(limit).cloned().collect())
    }

    async fn query_by_country(&self, name: &str) -> DirResult<Vec<Station>> {
        self.queries.lock().unwrap().push(format!("country/{}", name));
        let gate = self.gates.lock().unwrap().remove(name);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.countries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(DirectoryError::Status(StatusCode::SERVICE_UNAVAILABLE))
    }

    async fn query_by_tag(&self, tag: &str) -> DirResult<Vec<Station>> {
        self.queries.lock().unwrap().push(format!("tag/{}", tag));
        Ok(self
            .top
            .iter()
            .filter(|s| s.tag_list().contains(&tag))
            .cloned()
            .collect())
    }

    async fn list_countries(&self) -> DirResult<Vec<String>> {
        let mut names: Vec<String> = self.countries.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_tags(&self) -> DirResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn preview_country(&self, _name: &str) -> DirResult<CountryPreview> {
        Ok(CountryPreview::default())
    }
}

// ── polling ───────────────────────────────────────────────────────────────────

/// Poll the published snapshot until `pred` holds, or panic after 3 s.
pub async fn wait_for<F>(state: &StateManager, what: &str, pred: F) -> CoordinatorState
where
    F: Fn(&CoordinatorState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let snapshot = state.get_state().await;
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}: {:#?}", what, snapshot);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
