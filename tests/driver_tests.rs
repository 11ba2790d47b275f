mod common;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use common::serve;
use conveyor::clock;
use conveyor::config::types::{ExtractConfig, HttpJsonConfig, PaginationConfig, TimestampFormat};
use conveyor::drivers::HttpJsonSource;
use conveyor::error::ErrorKind;
use conveyor::http::HttpClient;
use conveyor::storage::CheckpointValue;
use conveyor::worker::PullSource;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Queries = Arc<Mutex<Vec<HashMap<String, String>>>>;

fn source_config(base: &str, pagination: PaginationConfig) -> HttpJsonConfig {
    HttpJsonConfig {
        url: format!("{}/events", base),
        query: BTreeMap::from([("limit".to_string(), "2".to_string())]),
        items: "/items".to_string(),
        extract: ExtractConfig {
            timestamp: "/ts".to_string(),
            timestamp_format: TimestampFormat::Auto,
            id: Some("/id".to_string()),
        },
        pagination,
    }
}

fn source(base: &str, pagination: PaginationConfig) -> HttpJsonSource {
    HttpJsonSource::new(
        "events",
        HttpClient::builder("vendor").build().unwrap(),
        source_config(base, pagination),
        Duration::from_secs(60),
        Duration::ZERO,
        clock::system(),
    )
}

/// Three cursor pages: C2, C3, then an empty page.
async fn cursor_vendor(queries: Queries) -> String {
    serve(Router::new().route(
        "/events",
        get(move |Query(q): Query<HashMap<String, String>>| {
            let queries = queries.clone();
            async move {
                queries.lock().unwrap().push(q.clone());
                let body = match q.get("after").map(String::as_str) {
                    None => json!({
                        "items": [
                            {"id": "e1", "ts": 1_700_000_001},
                            {"id": "e2", "ts": 1_700_000_002},
                            {"id": "e3", "ts": 1_700_000_003}
                        ],
                        "next": "C2"
                    }),
                    Some("C2") => json!({
                        "items": [
                            {"id": "e4", "ts": 1_700_000_004},
                            {"id": "e5"}
                        ],
                        "next": "C3"
                    }),
                    _ => json!({"items": [], "next": "C4"}),
                };
                Json(body)
            }
        }),
    ))
    .await
}

#[tokio::test]
async fn test_cursor_pages_until_empty() {
    let queries = Queries::default();
    let base = cursor_vendor(queries.clone()).await;
    let mut source = source(
        &base,
        PaginationConfig::Cursor {
            next: "/next".to_string(),
            param: "after".to_string(),
        },
    );

    let first = source.fetch(None).await.unwrap();
    assert_eq!(first.events.len(), 3);
    assert_eq!(first.next_cursor, Some(CheckpointValue::Cursor("C2".to_string())));

    let second = source.fetch(first.next_cursor.as_ref()).await.unwrap();
    assert_eq!(second.events.len(), 1);
    assert_eq!(second.rejected.len(), 1);
    assert_eq!(second.rejected[0].fingerprint.as_deref(), Some("e5"));
    assert_eq!(second.next_cursor, Some(CheckpointValue::Cursor("C3".to_string())));

    // An empty page keeps the position instead of jumping to C4
    let third = source.fetch(second.next_cursor.as_ref()).await.unwrap();
    assert!(third.is_empty());
    assert_eq!(third.next_cursor, Some(CheckpointValue::Cursor("C3".to_string())));

    let queries = queries.lock().unwrap();
    assert_eq!(queries[0].get("after"), None);
    assert_eq!(queries[0]["limit"], "2");
    assert_eq!(queries[1]["after"], "C2");
    assert_eq!(queries[2]["after"], "C3");
}

#[tokio::test]
async fn test_since_advances_past_newest_event() {
    let queries = Queries::default();
    let q2 = queries.clone();
    let base = serve(Router::new().route(
        "/events",
        get(move |Query(q): Query<HashMap<String, String>>| {
            let queries = q2.clone();
            async move {
                let first = q.get("since").map(String::as_str) != Some("2024-01-01T00:00:09.001Z");
                queries.lock().unwrap().push(q);
                if first {
                    Json(json!({"items": [
                        {"id": "a", "ts": "2024-01-01T00:00:09Z"},
                        {"id": "b", "ts": "2024-01-01T00:00:05Z"}
                    ]}))
                } else {
                    Json(json!({"items": []}))
                }
            }
        }),
    ))
    .await;
    let mut source = source(
        &base,
        PaginationConfig::Since {
            param: "since".to_string(),
            lookback: Duration::from_secs(3600),
        },
    );

    let page = source.fetch(None).await.unwrap();
    let next = page.next_cursor.clone().unwrap();
    assert_eq!(
        next,
        CheckpointValue::Timestamp(
            DateTime::parse_from_rfc3339("2024-01-01T00:00:09.001Z")
                .unwrap()
                .with_timezone(&Utc)
        )
    );

    let empty = source.fetch(Some(&next)).await.unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.next_cursor, None);

    let queries = queries.lock().unwrap();
    // No checkpoint yet: the lookback decides the first lower bound
    assert!(queries[0].contains_key("since"));
    assert_eq!(queries[1]["since"], "2024-01-01T00:00:09.001Z");
}

#[tokio::test]
async fn test_window_mode_walks_closed_windows() {
    let queries = Queries::default();
    let q2 = queries.clone();
    let base = serve(Router::new().route(
        "/events",
        get(move |Query(q): Query<HashMap<String, String>>| {
            let queries = q2.clone();
            async move {
                queries.lock().unwrap().push(q);
                Json(json!({"items": []}))
            }
        }),
    ))
    .await;
    let mut source = source(
        &base,
        PaginationConfig::Window {
            start_param: "from".to_string(),
            end_param: "to".to_string(),
            start_time: Duration::from_secs(150),
            horizon: None,
        },
    );

    let mut cursor: Option<CheckpointValue> = None;
    let mut windows = 0;
    loop {
        let page = source.fetch(cursor.as_ref()).await.unwrap();
        match page.next_cursor {
            Some(next) => {
                windows += 1;
                cursor = Some(next);
            }
            None => break,
        }
    }
    // 150s back with 60s windows: two closed windows, the third is still open
    assert_eq!(windows, 2);

    let queries = queries.lock().unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0]["to"], queries[1]["from"]);
    let end = match cursor {
        Some(CheckpointValue::Timestamp(ts)) => ts,
        other => panic!("unexpected cursor {:?}", other),
    };
    assert!(end <= Utc::now());
}

#[tokio::test]
async fn test_non_array_items_is_a_parse_error() {
    let base = serve(Router::new().route(
        "/events",
        get(|| async { Json(json!({"items": {"oops": true}})) }),
    ))
    .await;
    let mut source = source(&base, PaginationConfig::Single);
    let err = source.fetch(None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}
