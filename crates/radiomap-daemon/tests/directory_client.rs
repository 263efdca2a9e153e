use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use radiomap_daemon::directory::{DirectoryClient, DirectoryError, StationDirectory};
use radiomap_proto::config::DirectoryConfig;
use radiomap_proto::protocol::CatalogScope;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Requests seen by the fake directory, path + query.
type Seen = Arc<Mutex<Vec<String>>>;

fn record(seen: &Seen, uri: &Uri) {
    seen.lock().unwrap().push(uri.to_string());
}

async fn by_country(
    State(seen): State<Seen>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    uri: Uri,
) -> Response {
    record(&seen, &uri);
    if name == "Atlantis" {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let limit: usize = params.get("limit").and_then(|l| l.parse().ok()).unwrap_or(100);
    let mut records: Vec<Value> = (1..=12)
        .map(|i| {
            let favicon = if i == 1 { "http://icons.test/1.png" } else { "" };
            let tags = if i % 2 == 0 { "pop,rock" } else { "news" };
            json!({
                "name": format!("{} {}", name, i),
                "url": format!("http://stream.test/{}/{}", name, i),
                "favicon": favicon,
                "tags": tags,
                "bitrate": 128,
                "codec": "MP3",
                "country": name,
                "countrycode": "FR",
                "language": "french",
                "votes": 10,
                "clickcount": 100 - i
            })
        })
        .collect();
    // Fuzzy index noise: wrong country, missing code, no stream.
    records.push(json!({"name": "Elsewhere", "url": "http://x", "country": "Belgium", "countrycode": "BE"}));
    records.push(json!({"name": "Uncoded", "url": "http://y", "country": name, "countrycode": ""}));
    records.push(json!({"name": "Silent", "url": "", "country": name, "countrycode": "FR"}));
    records.truncate(limit.max(1));
    Json(records).into_response()
}

async fn top_click(
    State(seen): State<Seen>,
    Path(limit): Path<usize>,
    uri: Uri,
) -> Json<Vec<Value>> {
    record(&seen, &uri);
    Json(
        (0..limit.min(3))
            .map(|i| json!({"name": format!("Top {}", i), "url_resolved": format!("http://top/{}", i)}))
            .collect(),
    )
}

async fn by_tag(State(seen): State<Seen>, uri: Uri) -> &'static str {
    record(&seen, &uri);
    "<html>not json</html>"
}

async fn countries() -> Json<Value> {
    Json(json!([
        {"name": "France", "stationcount": 900},
        {"name": "Austria", "stationcount": 120},
        {"name": "Nowhere", "stationcount": 0},
        {"name": "", "stationcount": 3},
        {"name": "France", "stationcount": 1}
    ]))
}

async fn tags() -> Json<Value> {
    Json(json!([
        {"name": "news", "stationcount": 50},
        {"name": "jazz", "stationcount": 300},
        {"name": "dead", "stationcount": 0},
        {"name": "pop", "stationcount": 900}
    ]))
}

async fn serve() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/json/stations/bycountry/:name", get(by_country))
        .route("/json/stations/topclick/:limit", get(top_click))
        .route("/json/stations/bytag/:tag", get(by_tag))
        .route("/json/countries", get(countries))
        .route("/json/tags", get(tags))
        .with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/json", addr), seen)
}

fn client(base_url: &str) -> DirectoryClient {
    DirectoryClient::new(&DirectoryConfig {
        base_url: base_url.to_string(),
        tag_limit: 2,
        ..DirectoryConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_country_query_filters_and_normalizes() {
    let (base, seen) = serve().await;
    let stations = client(&base).query_by_country("France").await.unwrap();

    assert_eq!(stations.len(), 12);
    assert!(stations.iter().all(|s| s.country == "France"));
    assert_eq!(stations[0].icon_url.as_deref(), Some("http://icons.test/1.png"));
    assert_eq!(stations[1].icon_url, None);
    assert_eq!(stations[0].bitrate_kbps, Some(128));
    assert_eq!(stations[1].tag_list(), vec!["pop", "rock"]);

    let request = seen.lock().unwrap()[0].clone();
    assert!(request.starts_with("/json/stations/bycountry/France?"), "{}", request);
    assert!(request.contains("hidebroken=true"));
    assert!(request.contains("order=clickcount"));
    assert!(request.contains("limit=100"));
}

#[tokio::test]
async fn test_scope_dispatch_hits_top_endpoint() {
    let (base, seen) = serve().await;
    let stations = client(&base)
        .query(&CatalogScope::Top { limit: 100 })
        .await
        .unwrap();
    assert_eq!(stations.len(), 3);
    assert_eq!(stations[2].url, "http://top/2");
    assert_eq!(
        seen.lock().unwrap()[0],
        "/json/stations/topclick/100?hidebroken=true"
    );
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let (base, _) = serve().await;
    match client(&base).query_by_country("Atlantis").await {
        Err(DirectoryError::Status(status)) => assert_eq!(status.as_u16(), 500),
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undecodable_payload_is_an_error() {
    let (base, _) = serve().await;
    let err = client(&base).query_by_tag("jazz").await.unwrap_err();
    assert!(matches!(err, DirectoryError::Decode(_)), "{:?}", err);
}

#[tokio::test]
async fn test_unreachable_directory_is_an_error() {
    // Bind then drop to get a port nobody listens on.
    let port = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let err = client(&format!("http://127.0.0.1:{}/json", port))
        .list_countries()
        .await
        .unwrap_err();
    assert!(matches!(err, DirectoryError::Transport(_)), "{:?}", err);
}

#[tokio::test]
async fn test_country_and_tag_name_lists() {
    let (base, _) = serve().await;
    let directory = client(&base);

    assert_eq!(
        directory.list_countries().await.unwrap(),
        vec!["Austria".to_string(), "France".to_string()]
    );
    // Most used first, capped at tag_limit.
    assert_eq!(
        directory.list_tags().await.unwrap(),
        vec!["pop".to_string(), "jazz".to_string()]
    );
}

#[tokio::test]
async fn test_country_preview_samples_five() {
    let (base, seen) = serve().await;
    let preview = client(&base).preview_country("France").await.unwrap();

    assert_eq!(preview.top_stations.len(), 3);
    assert_eq!(preview.top_stations[0].name, "France 1");
    assert_eq!(preview.popular_tags, vec!["news", "pop", "rock"]);
    assert!(seen.lock().unwrap()[0].contains("limit=5"));
}
