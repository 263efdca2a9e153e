//! Station directory client.
//!
//! Thin typed wrapper over a radio-browser compatible JSON API.  Each call is
//! one HTTP GET; raw records are normalized into `Station` values and records
//! without a usable stream URL are dropped.  Every failure (non-2xx status,
//! transport error, undecodable payload) is a `DirectoryError`, which callers
//! treat as "directory unavailable": recoverable, never fatal.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use radiomap_proto::config::DirectoryConfig;
use radiomap_proto::protocol::{CatalogScope, Station};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// The directory could not answer.  All variants are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory returned HTTP {0}")]
    Status(StatusCode),

    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("directory payload could not be parsed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid directory URL: {0}")]
    InvalidUrl(String),
}

/// Small sample used for the hover preview of a country.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountryPreview {
    pub top_stations: Vec<PreviewStation>,
    pub popular_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewStation {
    pub name: String,
    pub icon_url: Option<String>,
}

const PREVIEW_SAMPLE: usize = 5;
const PREVIEW_STATIONS: usize = 3;
const PREVIEW_TAGS: usize = 3;

/// Source of station listings.  `DirectoryClient` is the network
/// implementation; the coordinator only sees this trait.
#[async_trait]
pub trait StationDirectory: Send + Sync {
    async fn query_top(&self, limit: usize) -> Result<Vec<Station>>;
    async fn query_by_country(&self, name: &str) -> Result<Vec<Station>>;
    async fn query_by_tag(&self, tag: &str) -> Result<Vec<Station>>;
    /// Country names with at least one station, alphabetical.
    async fn list_countries(&self) -> Result<Vec<String>>;
    /// Tag names with at least one station, most used first.
    async fn list_tags(&self) -> Result<Vec<String>>;
    async fn preview_country(&self, name: &str) -> Result<CountryPreview>;

    /// The single query implied by `scope`.
    async fn query(&self, scope: &CatalogScope) -> Result<Vec<Station>> {
        match scope {
            CatalogScope::Top { limit } => self.query_top(*limit).await,
            CatalogScope::Country { name } => self.query_by_country(name).await,
            CatalogScope::Tag { name } => self.query_by_tag(name).await,
        }
    }
}

// ── wire records ──────────────────────────────────────────────────────────────

/// Directory station record.  The API is loose about nulls, so everything is
/// optional here and tightened in `normalize`.
#[derive(Debug, Default, Deserialize)]
struct RawStation {
    name: Option<String>,
    url: Option<String>,
    url_resolved: Option<String>,
    favicon: Option<String>,
    tags: Option<String>,
    bitrate: Option<i64>,
    codec: Option<String>,
    country: Option<String>,
    countrycode: Option<String>,
    language: Option<String>,
    votes: Option<i64>,
    clickcount: Option<i64>,
}

/// Entry of the `/countries` and `/tags` listings.
#[derive(Debug, Deserialize)]
struct RawNameCount {
    name: Option<String>,
    #[serde(default)]
    stationcount: i64,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn non_negative(n: Option<i64>) -> u64 {
    n.unwrap_or(0).max(0) as u64
}

impl RawStation {
    /// `None` when the record has no stream URL to play.
    fn normalize(self) -> Option<Station> {
        let url = non_empty(self.url).or_else(|| non_empty(self.url_resolved))?;
        let name = non_empty(self.name).unwrap_or_else(|| url.clone());
        Some(Station {
            name,
            url,
            icon_url: non_empty(self.favicon),
            tags: non_empty(self.tags),
            bitrate_kbps: self
                .bitrate
                .filter(|b| *b > 0)
                .and_then(|b| u32::try_from(b).ok()),
            codec: non_empty(self.codec),
            country: non_empty(self.country).unwrap_or_default(),
            language: non_empty(self.language).unwrap_or_default(),
            votes: non_negative(self.votes),
            click_count: non_negative(self.clickcount),
        })
    }

    /// The directory's country index is fuzzy; keep only records that really
    /// claim `country` and carry a country code.
    fn is_from_country(&self, country: &str) -> bool {
        let named = self
            .country
            .as_deref()
            .is_some_and(|c| c.trim().eq_ignore_ascii_case(country.trim()));
        let coded = self
            .countrycode
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        named && coded
    }
}

fn normalize_all(raw: Vec<RawStation>) -> Vec<Station> {
    let total = raw.len();
    let stations: Vec<Station> = raw.into_iter().filter_map(RawStation::normalize).collect();
    if stations.len() != total {
        debug!(
            "directory: dropped {} records without a stream url",
            total - stations.len()
        );
    }
    stations
}

fn country_names(raw: Vec<RawNameCount>) -> Vec<String> {
    let mut names: Vec<String> = raw
        .into_iter()
        .filter(|c| c.stationcount > 0)
        .filter_map(|c| non_empty(c.name))
        .collect();
    names.sort();
    names.dedup();
    names
}

fn tag_names(mut raw: Vec<RawNameCount>, cap: usize) -> Vec<String> {
    raw.retain(|t| t.stationcount > 0);
    // Stable sort keeps the directory's order among equally popular tags.
    raw.sort_by(|a, b| b.stationcount.cmp(&a.stationcount));
    raw.into_iter()
        .filter_map(|t| non_empty(t.name))
        .take(cap)
        .collect()
}

fn build_preview(sample: &[Station]) -> CountryPreview {
    let top_stations = sample
        .iter()
        .take(PREVIEW_STATIONS)
        .map(|s| PreviewStation {
            name: s.name.clone(),
            icon_url: s.icon_url.clone(),
        })
        .collect();

    let mut seen = HashSet::new();
    let popular_tags = sample
        .iter()
        .flat_map(|s| s.tag_list())
        .filter(|t| seen.insert(t.to_string()))
        .take(PREVIEW_TAGS)
        .map(str::to_string)
        .collect();

    CountryPreview {
        top_stations,
        popular_tags,
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DirectoryClient {
    client: Client,
    base_url: Url,
    station_limit: usize,
    tag_limit: usize,
}

impl DirectoryClient {
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| DirectoryError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::InvalidUrl(config.base_url.clone()));
        }
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url,
            station_limit: config.station_limit,
            tag_limit: config.tag_limit,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `base_url` + percent-encoded path segments + query.
    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!("directory: GET {}", url);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("directory: {} returned {}", url, status);
            return Err(DirectoryError::Status(status));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn ranked_query(&self, limit: usize) -> Vec<(&'static str, String)> {
        vec![
            ("hidebroken", "true".to_string()),
            ("limit", limit.to_string()),
            ("order", "clickcount".to_string()),
        ]
    }
}

#[async_trait]
impl StationDirectory for DirectoryClient {
    async fn query_top(&self, limit: usize) -> Result<Vec<Station>> {
        let url = self.endpoint(
            &["stations", "topclick", &limit.to_string()],
            &[("hidebroken", "true".to_string())],
        )?;
        let raw: Vec<RawStation> = self.get_json(url).await?;
        Ok(normalize_all(raw))
    }

    async fn query_by_country(&self, name: &str) -> Result<Vec<Station>> {
        let url = self.endpoint(
            &["stations", "bycountry", name],
            &self.ranked_query(self.station_limit),
        )?;
        let mut raw: Vec<RawStation> = self.get_json(url).await?;
        raw.retain(|r| r.is_from_country(name));
        Ok(normalize_all(raw))
    }

    async fn query_by_tag(&self, tag: &str) -> Result<Vec<Station>> {
        let url = self.endpoint(
            &["stations", "bytag", tag],
            &self.ranked_query(self.station_limit),
        )?;
        let raw: Vec<RawStation> = self.get_json(url).await?;
        Ok(normalize_all(raw))
    }

    async fn list_countries(&self) -> Result<Vec<String>> {
        let url = self.endpoint(&["countries"], &[])?;
        let raw: Vec<RawNameCount> = self.get_json(url).await?;
        Ok(country_names(raw))
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let url = self.endpoint(&["tags"], &[])?;
        let raw: Vec<RawNameCount> = self.get_json(url).await?;
        Ok(tag_names(raw, self.tag_limit))
    }

    async fn preview_country(&self, name: &str) -> Result<CountryPreview> {
        let url = self.endpoint(
            &["stations", "bycountry", name],
            &self.ranked_query(PREVIEW_SAMPLE),
        )?;
        let raw: Vec<RawStation> = self.get_json(url).await?;
        Ok(build_preview(&normalize_all(raw)))
    }
}
