use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::client::ClientError;
use crate::contract::{
    RecentBody, ResultsEnvelope, SearchBody, SimilarBody, RECENT_PATH, SEARCH_PATH, SIMILAR_PATH,
};
use crate::model::{SearchHit, SearchRequest};

/// Request/response seam between the query client and whatever serves the contract.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ClientError>;
    async fn recent(&self, count: u32) -> Result<Vec<SearchHit>, ClientError>;
    async fn similar(&self, path: &Path, limit: u32) -> Result<Vec<SearchHit>, ClientError>;
}

/// HTTP/JSON client for a backend listening on loopback.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

pub fn http_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .no_proxy()
        .build()
        .unwrap_or_else(|error| {
            tracing::warn!(%error, "falling back to default http client");
            reqwest::Client::new()
        })
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(http_client(Duration::from_secs(2)), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_for_hits<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Vec<SearchHit>, ClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        let envelope = match serde_json::from_slice::<ResultsEnvelope>(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ClientError::Backend(format!("{url} returned {status}")));
            }
            Err(error) => return Err(ClientError::DecodeFailed(error.to_string())),
        };

        envelope.into_hits().map_err(ClientError::Backend)
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, ClientError> {
        self.post_for_hits(SEARCH_PATH, &SearchBody::from(request))
            .await
    }

    async fn recent(&self, count: u32) -> Result<Vec<SearchHit>, ClientError> {
        self.post_for_hits(RECENT_PATH, &RecentBody { count }).await
    }

    async fn similar(&self, path: &Path, limit: u32) -> Result<Vec<SearchHit>, ClientError> {
        let body = SimilarBody {
            path: path.to_string_lossy().into_owned(),
            limit,
        };
        self.post_for_hits(SIMILAR_PATH, &body).await
    }
}

fn map_reqwest_error(error: reqwest::Error) -> ClientError {
    if error.is_timeout() {
        ClientError::Timeout
    } else if error.is_decode() {
        ClientError::DecodeFailed(error.to_string())
    } else {
        ClientError::ConnectionFailed(error.to_string())
    }
}
