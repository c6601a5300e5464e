//! HTTP middleware for request ids and request metrics.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::{MatchedPath, Request},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const UNMATCHED_ENDPOINT: &str = "unmatched";

/// Extension type for storing model name in response
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Extension type for storing provider name in response
#[derive(Clone, Debug)]
pub struct ProviderName(pub String);

/// Extension type carrying the request id to handlers
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Assign a request id (honoring an inbound `x-request-id`), scope it for logging
/// and echo it on the response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track active requests, duration and status per route.
    ///
    /// The endpoint label is the matched route template so path parameters do
    /// not inflate label cardinality. Model and provider labels come from
    /// [`ModelName`] / [`ProviderName`] response extensions set by handlers. For
    /// streaming responses the measured duration is time to first byte.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| UNMATCHED_ENDPOINT.to_string());
        if endpoint == "/metrics" {
            return next.run(request).await;
        }
        let method = request.method().to_string();

        let metrics = get_metrics();
        let active = metrics.active_requests.with_label_values(&[&endpoint]);
        active.inc();

        let start = Instant::now();
        let response = next.run(request).await;
        let elapsed = start.elapsed().as_secs_f64();
        active.dec();

        let status = response.status().as_u16().to_string();
        let extensions = response.extensions();
        let model = extensions
            .get::<ModelName>()
            .map(|m| m.0.as_str())
            .unwrap_or("unknown");
        let provider = extensions
            .get::<ProviderName>()
            .map(|p| p.0.as_str())
            .unwrap_or("unknown");

        metrics
            .request_count
            .with_label_values(&[&method, &endpoint, model, provider, &status])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method, &endpoint, model, provider])
            .observe(elapsed);

        tracing::info!(
            method = %method,
            endpoint = %endpoint,
            status = %status,
            model = model,
            provider = provider,
            duration_ms = (elapsed * 1000.0) as u64,
            "Request finished"
        );

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logging::get_request_id;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        response::IntoResponse,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_middleware_tracks_request() {
        async fn handler() -> impl IntoResponse {
            let mut response = "ok".into_response();
            response
                .extensions_mut()
                .insert(ModelName("mw-test-model".to_string()));
            response
                .extensions_mut()
                .insert(ProviderName("mw-test-provider".to_string()));
            response
        }

        let app = Router::new()
            .route("/test", get(handler))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let count = get_metrics()
            .request_count
            .with_label_values(&["GET", "/test", "mw-test-model", "mw-test-provider", "200"])
            .get();
        assert!(count >= 1);
    }

    #[tokio::test]
    async fn test_endpoint_label_uses_route_template() {
        async fn handler() -> &'static str {
            "ok"
        }

        let app = Router::new()
            .route("/items/:id", get(handler))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let request = Request::builder()
            .uri("/items/42")
            .body(Body::empty())
            .unwrap();
        app.oneshot(request).await.unwrap();

        let count = get_metrics()
            .request_count
            .with_label_values(&["GET", "/items/:id", "unknown", "unknown", "200"])
            .get();
        assert!(count >= 1);
    }

    #[tokio::test]
    async fn test_request_id_generated_and_scoped() {
        async fn handler() -> String {
            get_request_id()
        }

        let app = Router::new()
            .route("/id", get(handler))
            .layer(middleware::from_fn(request_id_middleware));

        let request = Request::builder().uri("/id").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        let header = response.headers()[REQUEST_ID_HEADER]
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), header);
        assert!(uuid::Uuid::parse_str(&header).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_honors_inbound_header() {
        async fn handler() -> &'static str {
            "ok"
        }

        let app = Router::new()
            .route("/id", get(handler))
            .layer(middleware::from_fn(request_id_middleware));

        let request = Request::builder()
            .uri("/id")
            .header(REQUEST_ID_HEADER, "trace-123")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "trace-123");
    }
}
