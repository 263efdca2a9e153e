//! Catalog selection state: the chosen scope and the station list it produced.
//!
//! Every `select_scope` hands out a ticket carrying a fresh sequence token.
//! A query result is applied only if its token is still the latest one, so a
//! slow earlier query can never overwrite a faster later one.  Failures keep
//! the previous list on screen.

use radiomap_proto::protocol::{CatalogScope, Station};
use tracing::debug;

use crate::directory::DirectoryError;

/// Issued by `select_scope`; carried by the query task and handed back with
/// the result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTicket {
    pub seq: u64,
    pub scope: CatalogScope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogOutcome {
    /// The result was current and is now visible (station count).
    Published(usize),
    /// The result was current but the query failed; previous list kept.
    Failed(String),
    /// Superseded by a newer selection.  Nothing changed.
    Stale,
}

#[derive(Debug, Default)]
pub struct CatalogState {
    seq: u64,
    scope: Option<CatalogScope>,
    stations: Vec<Station>,
    loading: bool,
    error: Option<String>,
}

impl CatalogState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new selection, superseding whatever is in flight.
    pub fn select_scope(&mut self, scope: CatalogScope) -> QueryTicket {
        self.seq += 1;
        self.scope = Some(scope.clone());
        self.loading = true;
        self.error = None;
        QueryTicket {
            seq: self.seq,
            scope,
        }
    }

    pub fn resolve(
        &mut self,
        seq: u64,
        result: Result<Vec<Station>, DirectoryError>,
    ) -> CatalogOutcome {
        if seq != self.seq {
            debug!("catalog: dropping stale result seq={} latest={}", seq, self.seq);
            return CatalogOutcome::Stale;
        }
        self.loading = false;
        match result {
            Ok(stations) => {
                let n = stations.len();
                self.stations = stations;
                self.error = None;
                CatalogOutcome::Published(n)
            }
            Err(e) => {
                let msg = e.to_string();
                self.error = Some(msg.clone());
                CatalogOutcome::Failed(msg)
            }
        }
    }

    pub fn scope(&self) -> Option<&CatalogScope> {
        self.scope.as_ref()
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn station(&self, idx: usize) -> Option<&Station> {
        self.stations.get(idx)
    }

    /// Stations whose name or tags contain `query`.
    pub fn filtered(&self, query: &str) -> Vec<Station> {
        self.stations
            .iter()
            .filter(|s| s.matches(query))
            .cloned()
            .collect()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
