use std::path::Path;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use searchy_core::client::ClientError;
use searchy_core::model::{SearchParams, SearchRequest};
use searchy_core::transport::{HttpBackend, SearchBackend};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn request(query: &str) -> SearchRequest {
    SearchRequest::new(
        query,
        SearchParams {
            limit: 5,
            threshold: 0.2,
        },
        1,
    )
}

#[tokio::test]
async fn search_sends_contract_body_and_decodes_ranked_hits() {
    let app = Router::new().route(
        "/search",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["query"], "sunset beach");
            assert_eq!(body["limit"], 5);
            Json(json!({
                "results": [
                    {"path": "/photos/a.jpg", "similarity": 0.91, "ocr_text": "SALE"},
                    {"path": "/photos/b.png", "similarity": 0.42}
                ],
                "stats": {"total_time": 0.01}
            }))
        }),
    );
    let backend = HttpBackend::new(serve(app).await);

    let hits = backend.search(&request("  sunset beach ")).await.unwrap();

    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].path, Path::new("/photos/a.jpg"));
    assert_eq!(hits[0].ocr_text.as_deref(), Some("SALE"));
    assert!(hits[0].score > hits[1].score);
}

#[tokio::test]
async fn recent_and_similar_use_their_own_routes() {
    let app = Router::new()
        .route(
            "/recent",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"results": [{"path": format!("/r/{}", body["count"]), "similarity": 1.0}]}))
            }),
        )
        .route(
            "/similar",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"results": [{"path": body["path"], "similarity": 0.99}]}))
            }),
        );
    let backend = HttpBackend::new(serve(app).await);

    let recent = backend.recent(12).await.unwrap();
    assert_eq!(recent[0].path, Path::new("/r/12"));

    let similar = backend.similar(Path::new("/photos/cat.jpg"), 3).await.unwrap();
    assert_eq!(similar[0].path, Path::new("/photos/cat.jpg"));
}

#[tokio::test]
async fn backend_reported_error_is_surfaced() {
    let app = Router::new().route(
        "/search",
        post(|| async { Json(json!({"error": "model not loaded"})) }),
    );
    let backend = HttpBackend::new(serve(app).await);

    let error = backend.search(&request("cat")).await.unwrap_err();

    assert_eq!(error, ClientError::Backend("model not loaded".to_string()));
}

#[tokio::test]
async fn non_json_error_status_maps_to_backend_error() {
    let app = Router::new().route(
        "/search",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let backend = HttpBackend::new(serve(app).await);

    let error = backend.search(&request("cat")).await.unwrap_err();

    assert!(matches!(error, ClientError::Backend(message) if message.contains("500")));
}

#[tokio::test]
async fn malformed_success_body_is_a_decode_failure() {
    let app = Router::new().route("/search", post(|| async { "not json" }));
    let backend = HttpBackend::new(serve(app).await);

    let error = backend.search(&request("cat")).await.unwrap_err();

    assert!(matches!(error, ClientError::DecodeFailed(_)));
}

#[tokio::test]
async fn nothing_listening_is_a_connection_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let backend = HttpBackend::new(format!("http://127.0.0.1:{port}"));

    let error = backend.search(&request("cat")).await.unwrap_err();

    assert!(matches!(error, ClientError::ConnectionFailed(_)));
}

#[tokio::test]
async fn backend_dying_mid_request_is_a_connection_failure() {
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0_u8; 1024];
        let _ = socket.read(&mut buf).await;
        drop(socket);
    });
    let backend = HttpBackend::new(format!("http://{addr}"));

    let error = backend.search(&request("cat")).await.unwrap_err();

    assert!(matches!(error, ClientError::ConnectionFailed(_)));
}
