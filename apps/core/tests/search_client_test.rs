use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use searchy_core::client::{ClientError, ClientSettings, Outcome, SearchClient};
use searchy_core::config::{EmptyQueryPolicy, SearchConfig};
use searchy_core::model::ResultSource;
use searchy_core::transport::HttpBackend;

/// Answers `/search` with one hit named after the query. "cat" is slow.
async fn serve(searches: Arc<AtomicUsize>) -> String {
    let app = Router::new()
        .route(
            "/search",
            post(move |Json(body): Json<Value>| {
                let searches = searches.clone();
                async move {
                    searches.fetch_add(1, Ordering::SeqCst);
                    let query = body["query"].as_str().unwrap_or_default().to_string();
                    if query == "cat" {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                    }
                    Json(json!({"results": [{"path": format!("/photos/{query}.jpg"), "similarity": 0.8}]}))
                }
            }),
        )
        .route(
            "/recent",
            post(|| async { Json(json!({"results": [{"path": "/photos/latest.jpg", "similarity": 1.0}]})) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base_url: String, debounce_ms: u64, empty_query: EmptyQueryPolicy) -> SearchClient {
    let config = SearchConfig {
        debounce_ms,
        empty_query,
        ..Default::default()
    };
    SearchClient::new(
        Arc::new(HttpBackend::new(base_url)),
        ClientSettings::from(&config),
    )
}

#[tokio::test]
async fn slow_stale_response_never_overwrites_newer_query() {
    let searches = Arc::new(AtomicUsize::new(0));
    let client = client(serve(searches.clone()).await, 10, EmptyQueryPolicy::Recent);

    let first = client.submit("cat", None);
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.submit("dog", None).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first.unwrap(), Outcome::Superseded { generation: 1 }));
    let delivered = second.unwrap().delivered().unwrap();
    assert_eq!(delivered.generation, 2);
    assert_eq!(delivered.hits[0].path, Path::new("/photos/dog.jpg"));
}

#[tokio::test]
async fn burst_of_keystrokes_sends_one_request() {
    let searches = Arc::new(AtomicUsize::new(0));
    let client = client(serve(searches.clone()).await, 150, EmptyQueryPolicy::Recent);

    let mut pending = Vec::new();
    for query in ["d", "do", "dog", "dogs"] {
        let client = client.clone();
        pending.push(tokio::spawn(async move { client.submit(query, None).await }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut delivered = Vec::new();
    for handle in pending {
        if let Some(results) = handle.await.unwrap().unwrap().delivered() {
            delivered.push(results);
        }
    }

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].generation, 4);
    assert_eq!(searches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_query_follows_configured_policy() {
    let searches = Arc::new(AtomicUsize::new(0));
    let base_url = serve(searches.clone()).await;

    let recent = client(base_url.clone(), 10, EmptyQueryPolicy::Recent)
        .submit("   ", None)
        .await
        .unwrap()
        .delivered()
        .unwrap();
    assert_eq!(recent.source, ResultSource::Recent);
    assert_eq!(recent.hits.len(), 1);

    let cleared = client(base_url, 10, EmptyQueryPolicy::Clear)
        .submit("", None)
        .await
        .unwrap()
        .delivered()
        .unwrap();
    assert_eq!(cleared.source, ResultSource::Cleared);
    assert!(cleared.is_empty());
    assert_eq!(searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failure_of_latest_request_is_reported() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let client = client(format!("http://127.0.0.1:{port}"), 0, EmptyQueryPolicy::Recent);

    let error = client.submit("cat", None).await.unwrap_err();

    assert!(matches!(error, ClientError::ConnectionFailed(_)));
}
