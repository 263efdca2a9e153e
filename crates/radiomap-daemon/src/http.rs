use crate::core::DaemonEvent;
use crate::directory::{CountryPreview, StationDirectory};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use radiomap_proto::favorites::FavoritesStore;
use radiomap_proto::protocol::{CatalogScope, Command, Station};
use radiomap_proto::state::{CoordinatorState, StateManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub directory: Arc<dyn StationDirectory>,
    pub favorites: FavoritesStore,
}

/// Catalog entry with its index, so filtered results can still be played
/// through `/api/play/:idx`.
#[derive(Serialize)]
struct IndexedStation {
    idx: usize,
    #[serde(flatten)]
    station: Station,
}

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
}

#[derive(Deserialize)]
struct FavoriteParams {
    url: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/stations", get(get_stations))
        .route("/api/scope/top/:limit", post(scope_top))
        .route("/api/scope/country/:name", post(scope_country))
        .route("/api/scope/tag/:name", post(scope_tag))
        .route("/api/countries", get(get_countries))
        .route("/api/tags", get(get_tags))
        .route("/api/preview/:country", get(get_preview))
        .route("/api/play/:idx", post(play_station))
        .route("/api/favorites/:idx/play", post(play_favorite))
        .route("/api/toggle", post(toggle_play))
        .route("/api/volume/:volume", post(set_volume))
        .route("/api/mute", post(toggle_mute))
        .route("/api/favorite", post(toggle_favorite))
        .route("/api/favorites", get(get_favorites).delete(delete_favorite))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("HTTP API: daemon loop is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

// ── reads ─────────────────────────────────────────────────────────────────────

async fn get_state(State(state): State<HttpState>) -> Json<CoordinatorState> {
    Json(state.state_manager.get_state().await)
}

async fn get_stations(
    State(state): State<HttpState>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<IndexedStation>> {
    let snapshot = state.state_manager.get_state().await;
    let q = params.q.unwrap_or_default();
    let stations = snapshot
        .stations
        .into_iter()
        .enumerate()
        .filter(|(_, s)| s.matches(&q))
        .map(|(idx, station)| IndexedStation { idx, station })
        .collect();
    Json(stations)
}

async fn get_countries(State(state): State<HttpState>) -> Result<Json<Vec<String>>, StatusCode> {
    state.directory.list_countries().await.map(Json).map_err(|e| {
        warn!("HTTP API: country list unavailable: {}", e);
        StatusCode::BAD_GATEWAY
    })
}

async fn get_tags(State(state): State<HttpState>) -> Result<Json<Vec<String>>, StatusCode> {
    state.directory.list_tags().await.map(Json).map_err(|e| {
        warn!("HTTP API: tag list unavailable: {}", e);
        StatusCode::BAD_GATEWAY
    })
}

async fn get_preview(
    State(state): State<HttpState>,
    Path(country): Path<String>,
) -> Result<Json<CountryPreview>, StatusCode> {
    state
        .directory
        .preview_country(&country)
        .await
        .map(Json)
        .map_err(|e| {
            warn!("HTTP API: preview for {} unavailable: {}", country, e);
            StatusCode::BAD_GATEWAY
        })
}

async fn get_favorites(State(state): State<HttpState>) -> Json<Vec<Station>> {
    Json(state.favorites.list())
}

// ── commands ──────────────────────────────────────────────────────────────────

async fn scope_top(State(state): State<HttpState>, Path(limit): Path<usize>) -> StatusCode {
    info!("HTTP API: top {}", limit);
    dispatch(&state, Command::SelectScope { scope: CatalogScope::Top { limit } }).await
}

async fn scope_country(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    info!("HTTP API: country {}", name);
    dispatch(&state, Command::SelectScope { scope: CatalogScope::Country { name } }).await
}

async fn scope_tag(State(state): State<HttpState>, Path(name): Path<String>) -> StatusCode {
    info!("HTTP API: tag {}", name);
    dispatch(&state, Command::SelectScope { scope: CatalogScope::Tag { name } }).await
}

async fn play_station(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    info!("HTTP API: Play station {}", idx);
    dispatch(&state, Command::PlayIndex { idx }).await
}

async fn play_favorite(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    info!("HTTP API: Play favorite {}", idx);
    dispatch(&state, Command::PlayFavorite { idx }).await
}

async fn toggle_play(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::TogglePlay).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    info!("HTTP API: Set volume to {}%", volume);
    dispatch(&state, Command::Volume { value: volume }).await
}

async fn toggle_mute(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::ToggleMute).await
}

async fn toggle_favorite(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::ToggleFavorite).await
}

/// Removal goes straight to the store; the daemon loop hears about it
/// through its subscription.
async fn delete_favorite(
    State(state): State<HttpState>,
    Query(params): Query<FavoriteParams>,
) -> StatusCode {
    match state.favorites.remove(&params.url) {
        Ok(true) => StatusCode::OK,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!("HTTP API: could not remove favorite: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
