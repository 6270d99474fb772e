//! HTTP surface: health check at `/`, everything else through the pipeline.

use crate::pipeline::{SimRequest, Simulator};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

const ALLOWED_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Build the router for a simulator.
pub fn router(simulator: Arc<Simulator>) -> Router {
    let cors = simulator.settings().cors;

    let router = Router::new()
        .route("/", any(health_handler))
        .fallback(simulate_handler)
        .with_state(simulator);

    if cors {
        router.layer(middleware::from_fn(cors_middleware))
    } else {
        router
    }
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    simulator: Arc<Simulator>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Mock server listening");
    }
    axum::serve(listener, router(simulator))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_handler() -> Response {
    let body = serde_json::to_string_pretty(&json!({ "result": true, "message": "" }))
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn simulate_handler(State(simulator): State<Arc<Simulator>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, simulator.settings().max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, path = %parts.uri.path(), "Failed to buffer request body");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let request = SimRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    };

    simulator.handle(request).await.into_response()
}

/// Permissive CORS; preflight requests are answered directly.
async fn cors_middleware(request: Request, next: Next) -> Response {
    let requested_headers = request
        .headers()
        .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned();

    let mut response = if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        if let Some(requested) = requested_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
            headers.insert(
                header::VARY,
                HeaderValue::from_static("Access-Control-Request-Headers"),
            );
        }
        response
    } else {
        next.run(request).await
    };

    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn simulator(root: &std::path::Path, cors: bool) -> Arc<Simulator> {
        let mut config = ServerConfig::default();
        config.fixtures.root = root.to_path_buf();
        config.settings.cors = cors;
        Arc::new(Simulator::new(&config).unwrap())
    }

    async fn start(simulator: Arc<Simulator>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, simulator, std::future::pending()));
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let base = start(simulator(dir.path(), true)).await;

        let response = reqwest::get(format!("{}/?_error=500", base)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let bytes = response.bytes().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "result": true, "message": "" }));
    }

    #[tokio::test]
    async fn test_cors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let base = start(simulator(dir.path(), true)).await;
        let client = reqwest::Client::new();

        let response = client.get(format!("{}/missing", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );

        let response = client
            .request(reqwest::Method::OPTIONS, format!("{}/missing", base))
            .header("access-control-request-headers", "dist,content-type")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get("access-control-allow-headers").unwrap(),
            "dist,content-type"
        );
    }

    #[tokio::test]
    async fn test_cors_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let base = start(simulator(dir.path(), false)).await;

        let response = reqwest::get(format!("{}/missing", base)).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
