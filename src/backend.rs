//! Forwarding to a live backend.
//!
//! The pipeline only needs "forward this request, give me the response or an
//! error"; [`HttpBackend`] provides that over HTTP.

use crate::config::BackendConfig;
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Headers that describe a single connection and must not be copied across.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::PROXY_AUTHENTICATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build backend client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("backend transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Request as sent to the backend.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Original path including the query string
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Backend answer, relayed verbatim unless it is a 404.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    /// A 404 means the endpoint is not implemented upstream yet.
    pub fn is_miss(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError>;
}

/// Remove per-connection headers before relaying in either direction.
///
/// Besides the fixed list, any header named as a token in a `Connection`
/// value is connection-scoped and dropped too.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect();
    for name in &listed {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        reqwest::Url::parse(&config.url).map_err(|e| BackendError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(BackendError::Client)?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn target(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn forward(&self, request: ForwardRequest) -> Result<BackendResponse, BackendError> {
        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let response = self
            .client
            .request(request.method, self.target(&request.path_and_query))
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(BackendError::Transport)?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await.map_err(BackendError::Transport)?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}
