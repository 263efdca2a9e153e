use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// One internet radio stream and its directory metadata.
///
/// Stations are immutable snapshots of a directory record.  Identity is the
/// stream URL: two stations with the same `url` are the same station no matter
/// how the rest of the metadata differs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Station {
    pub name: String,
    /// Playable stream locator.  Opaque; also the identity key.
    pub url: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    /// Comma-separated genre labels, free text.
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub votes: u64,
    #[serde(default)]
    pub click_count: u64,
}

impl Station {
    /// Individual genre labels, trimmed, empties dropped.
    pub fn tag_list(&self) -> Vec<&str> {
        self.tags
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Case-insensitive substring match on name or tags.  An empty query
    /// matches everything.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return true;
        }
        self.name.to_lowercase().contains(&q)
            || self
                .tags
                .as_deref()
                .is_some_and(|t| t.to_lowercase().contains(&q))
    }
}

impl PartialEq for Station {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Station {}

impl Hash for Station {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

/// The user's current browsing criterion.  Replaced wholesale on every
/// re-selection, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CatalogScope {
    Top { limit: usize },
    Country { name: String },
    Tag { name: String },
}

impl fmt::Display for CatalogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogScope::Top { limit } => write!(f, "top {}", limit),
            CatalogScope::Country { name } => write!(f, "{}", name),
            CatalogScope::Tag { name } => write!(f, "#{}", name),
        }
    }
}

/// Transport state of the single playback session.
///
/// Transitions:
///   Idle -> Loading -> Playing <-> Paused
///   Loading | Playing -> Error -> Loading (explicit retry only)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Error,
}

/// Monotonic marker assigned to every play attempt.  Results carrying an
/// older generation than the session's current one are discarded.
pub type Generation = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackSession {
    pub station: Option<Station>,
    pub transport: TransportState,
    /// 0..=100
    pub volume: u8,
    pub muted: bool,
    pub generation: Generation,
    /// Cached from the favorites store; re-derived after every store change.
    pub favorite: bool,
}

impl PlaybackSession {
    pub fn new(volume: u8) -> Self {
        Self {
            station: None,
            transport: TransportState::Idle,
            volume: volume.min(100),
            muted: false,
            generation: 0,
            favorite: false,
        }
    }
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self::new(100)
    }
}

/// User-initiated operations.  Each maps onto exactly one coordinator call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    SelectScope { scope: CatalogScope },
    /// Pick a station by index in the current catalog list.
    PlayIndex { idx: usize },
    /// Pick a station by index in the favorites list.
    PlayFavorite { idx: usize },
    TogglePlay,
    Volume { value: i32 },
    ToggleMute,
    ToggleFavorite,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// A transient user-facing notification.  Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notice {
    pub severity: Severity,
    pub title: String,
    pub body: String,
}

impl Notice {
    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn success(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: Severity::Success,
            title: title.into(),
            body: body.into(),
        }
    }

    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            title: title.into(),
            body: body.into(),
        }
    }
}
