use crate::protocol::{CatalogScope, Notice, PlaybackSession, Station};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-only snapshot of everything a view renders.  `rev` increases on
/// every publish so pollers can tell whether anything changed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoordinatorState {
    #[serde(default)]
    pub rev: u64,
    pub scope: Option<CatalogScope>,
    pub stations: Vec<Station>,
    pub loading: bool,
    pub catalog_error: Option<String>,
    pub session: PlaybackSession,
    pub favorites: Vec<Station>,
    pub last_notice: Option<Notice>,
}

/// Shared snapshot cell.  Only the coordinator loop writes; HTTP handlers
/// and other observers read.
pub struct StateManager {
    state: Arc<RwLock<CoordinatorState>>,
}

impl StateManager {
    pub fn new(initial: CoordinatorState) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn get_state(&self) -> CoordinatorState {
        self.state.read().await.clone()
    }

    /// Replace the snapshot, bumping `rev`.  Returns the new revision.
    pub async fn publish(&self, mut next: CoordinatorState) -> u64 {
        let mut state = self.state.write().await;
        next.rev = state.rev + 1;
        *state = next;
        state.rev
    }
}
