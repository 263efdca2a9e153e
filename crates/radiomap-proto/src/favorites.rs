//! Persistent favorites set shared by every view that shows favorite status.
//!
//! `FavoritesStore` is a cheap handle; clone it into each consumer instead of
//! keeping a private copy of the set.  Every mutation that changes the set is
//! written to disk before it becomes visible, then every current subscriber
//! is called once, synchronously, with the new snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info, warn};

use crate::protocol::Station;

pub type Result<T> = std::result::Result<T, FavoritesError>;

#[derive(Debug, thiserror::Error)]
pub enum FavoritesError {
    #[error("failed to persist favorites: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode favorites: {0}")]
    Json(#[from] serde_json::Error),
}

type Listener = Arc<dyn Fn(&[Station]) + Send + Sync>;

struct Inner {
    path: PathBuf,
    state: Mutex<FavoritesState>,
}

#[derive(Default)]
struct FavoritesState {
    stations: Vec<Station>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

#[derive(Clone)]
pub struct FavoritesStore {
    inner: Arc<Inner>,
}

/// Keeps a change listener registered.  Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    store: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            lock(&inner).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(inner: &Inner) -> MutexGuard<'_, FavoritesState> {
    // A panicking listener never runs under the lock, so poisoned data is intact.
    inner.state.lock().unwrap_or_else(|e| e.into_inner())
}

impl FavoritesStore {
    /// Load the set stored at `path`.  A missing file is an empty set; an
    /// unreadable one is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stations = load(&path);
        info!("favorites: {} stations from {}", stations.len(), path.display());
        Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(FavoritesState {
                    stations,
                    ..FavoritesState::default()
                }),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn list(&self) -> Vec<Station> {
        lock(&self.inner).stations.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_favorite(&self, url: &str) -> bool {
        lock(&self.inner).stations.iter().any(|s| s.url == url)
    }

    /// Add `station`.  Returns `false` (and does nothing) if its URL is
    /// already present.
    pub fn add(&self, station: Station) -> Result<bool> {
        self.mutate(|stations| {
            if stations.iter().any(|s| s.url == station.url) {
                return false;
            }
            stations.push(station);
            true
        })
    }

    /// Remove the station with this URL.  Returns `false` if it was absent.
    pub fn remove(&self, url: &str) -> Result<bool> {
        self.mutate(|stations| {
            let before = stations.len();
            stations.retain(|s| s.url != url);
            stations.len() != before
        })
    }

    /// Register `on_change`, called with the full set after every change.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(&[Station]) + Send + Sync + 'static,
    {
        let mut state = lock(&self.inner);
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((id, Arc::new(on_change)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut Vec<Station>) -> bool) -> Result<bool> {
        let (snapshot, listeners) = {
            let mut state = lock(&self.inner);
            let mut next = state.stations.clone();
            if !apply(&mut next) {
                return Ok(false);
            }
            save(&self.inner.path, &next)?;
            state.stations = next;
            let listeners: Vec<Listener> =
                state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (state.stations.clone(), listeners)
        };

        debug!(
            "favorites: changed ({} stations), notifying {} listeners",
            snapshot.len(),
            listeners.len()
        );
        for listener in listeners {
            listener(&snapshot);
        }
        Ok(true)
    }
}

fn load(path: &Path) -> Vec<Station> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("favorites: cannot read {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<Station>>(&content) {
        Ok(mut stations) => {
            // An older or hand-edited file may repeat URLs; first entry wins.
            let mut seen = std::collections::HashSet::new();
            stations.retain(|s| seen.insert(s.url.clone()));
            stations
        }
        Err(e) => {
            warn!("favorites: ignoring corrupt {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn save(path: &Path, stations: &[Station]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(stations)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
