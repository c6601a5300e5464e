//! HTTP request handlers for the gateway.
//!
//! This module implements the OpenAI-compatible chat endpoint plus the
//! operational endpoints (models, health, load balancer stats, rate-limit
//! status, metrics) and assembles them into an axum [`Router`].

use crate::api::auth::Authenticator;
use crate::api::models::{
    ApiErrorDetail, ApiErrorResponse, ChatCompletionRequest, ChatCompletionResponse, Choice,
    ConfigurationHealth, DatabaseHealth, Delta, HealthComponents, HealthResponse,
    LoadBalancerHealth, Message, ModelInfo, ModelList, RateLimitStatus, ServiceInfo,
    StreamChoice, StreamChunk, Usage,
};
use crate::api::streaming::sse_response;
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::logging::{generate_request_id, get_request_id};
use crate::core::metrics::get_metrics;
use crate::core::middleware::{request_id_middleware, MetricsMiddleware, ModelName, ProviderName};
use crate::core::rate_limiter::RateLimiter;
use crate::services::completion_router::{CompletionRouter, RequestContext};
use crate::services::load_balancer::LoadBalancerStats;
use crate::services::provider_pool::{
    InstanceSnapshot, LoadBalancingAlgorithm, PoolStats, ProviderStatus,
};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use utoipa::{IntoParams, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub router: Arc<CompletionRouter>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticator: Arc<Authenticator>,
    pub database_configured: bool,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        chat_completions,
        list_models,
        health,
        load_balancer_stats,
        rate_limit_status,
        root,
    ),
    components(
        schemas(
            ChatCompletionRequest,
            ChatCompletionResponse,
            Message,
            Choice,
            Usage,
            StreamChunk,
            StreamChoice,
            Delta,
            ModelList,
            ModelInfo,
            HealthResponse,
            HealthComponents,
            ConfigurationHealth,
            LoadBalancerHealth,
            DatabaseHealth,
            LoadBalancerStats,
            PoolStats,
            InstanceSnapshot,
            ProviderStatus,
            LoadBalancingAlgorithm,
            RateLimitStatus,
            ServiceInfo,
            ApiErrorResponse,
            ApiErrorDetail,
        )
    ),
    tags(
        (name = "completions", description = "OpenAI-compatible chat completions"),
        (name = "models", description = "Configured logical models"),
        (name = "operations", description = "Health, load balancing and rate-limit status")
    ),
    info(
        title = "ChatVault Gateway API",
        version = "1.0.0",
        description = "OpenAI-compatible chat completion gateway with load balancing and usage accounting."
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}

/// Build the application router with request-id and metrics middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/load-balancer/stats", get(load_balancer_stats))
        .route("/v1/rate-limit", get(rate_limit_status))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(MetricsMiddleware::track_metrics))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn current_request_id() -> String {
    let id = get_request_id();
    if id.is_empty() {
        generate_request_id()
    } else {
        id
    }
}

/// Shape checks on the body. Model lookup happens in the router.
fn validate_chat_request(request: &ChatCompletionRequest) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(AppError::BadRequest("'model' is required".into()));
    }
    if request.messages.is_empty() {
        return Err(AppError::BadRequest("'messages' must not be empty".into()));
    }
    for (index, message) in request.messages.iter().enumerate() {
        if message.role.trim().is_empty() {
            return Err(AppError::BadRequest(format!(
                "messages[{}] is missing 'role'",
                index
            )));
        }
        if message.content.is_null() {
            return Err(AppError::BadRequest(format!(
                "messages[{}] is missing 'content'",
                index
            )));
        }
    }
    Ok(())
}

/// Caller-supplied generation parameters. Defaults are filled in by the router.
fn build_overrides(request: &ChatCompletionRequest) -> Map<String, Value> {
    let mut overrides: Map<String, Value> = request
        .extra
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(temperature) = request.temperature {
        overrides.insert("temperature".into(), Value::from(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        overrides.insert("max_tokens".into(), Value::from(max_tokens));
    }
    overrides
}

/// Handle chat completion requests.
///
/// This is the main endpoint for OpenAI-compatible chat completions.
/// Supports both streaming and non-streaming responses.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion, or an SSE stream when `stream` is true", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request or unknown model", body = ApiErrorResponse),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorResponse),
        (status = 403, description = "Model not allowed for caller", body = ApiErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = ApiErrorResponse),
        (status = 502, description = "Upstream error", body = ApiErrorResponse),
        (status = 503, description = "No healthy instance", body = ApiErrorResponse),
        (status = 504, description = "Upstream timeout", body = ApiErrorResponse)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let identity = match state.authenticator.authenticate(&headers) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let (allowed, info) = state.rate_limiter.admit(&identity);
    if !allowed {
        get_metrics().rate_limit_rejections.inc();
        tracing::warn!(user_id = %identity, limit = info.limit, "Rate limit exceeded");
        return AppError::RateLimitExceeded(info).into_response();
    }

    let mut response = match handle_chat_completion(&state, identity, payload).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };
    info.apply_headers(response.headers_mut());
    response
}

async fn handle_chat_completion(
    state: &AppState,
    identity: String,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    validate_chat_request(&request)?;
    state
        .authenticator
        .validate_model_access(&identity, &request.model)?;

    let request_id = current_request_id();
    let provider = state
        .router
        .models()
        .get_provider(&request.model)
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let streaming = request.is_streaming();
    let model = request.model.clone();
    let ctx = RequestContext {
        request_id: request_id.clone(),
        user_id: identity.clone(),
        overrides: build_overrides(&request),
        model: request.model,
        messages: request.messages,
    };

    tracing::debug!(
        request_id = %request_id,
        user_id = %identity,
        model = %model,
        streaming,
        "Routing chat completion"
    );

    let mut response = crate::with_request_context!(request_id, identity, async {
        if streaming {
            let frames = state.router.complete_stream(ctx).await?;
            Ok::<Response, AppError>(sse_response(frames))
        } else {
            let completion = state.router.complete(ctx).await?;
            Ok(Json(completion).into_response())
        }
    })?;

    response.extensions_mut().insert(ModelName(model));
    response.extensions_mut().insert(ProviderName(provider));
    Ok(response)
}

/// List models visible to the caller.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Configured models", body = ModelList),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorResponse)
    )
)]
pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ModelList>> {
    let identity = state.authenticator.authenticate(&headers)?;
    let created = chrono::Utc::now().timestamp();
    let models = state.router.models();

    let data = models
        .list_models()
        .into_iter()
        .filter(|name| {
            state
                .authenticator
                .validate_model_access(&identity, name)
                .is_ok()
        })
        .map(|name| ModelInfo {
            owned_by: models
                .get_provider(&name)
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            id: name,
            object: "model".to_string(),
            created,
        })
        .collect();

    Ok(Json(ModelList {
        object: "list".to_string(),
        data,
    }))
}

/// Service health with component summaries.
#[utoipa::path(
    get,
    path = "/health",
    tag = "operations",
    security(()),
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.router.load_balancer().stats();
    let status = if stats.healthy_pools == stats.total_pools {
        "healthy"
    } else if stats.healthy_pools > 0 {
        "degraded"
    } else {
        "unhealthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        components: HealthComponents {
            configuration: ConfigurationHealth {
                models: state.config.model_list.len(),
            },
            load_balancer: LoadBalancerHealth {
                total_pools: stats.total_pools,
                healthy_pools: stats.healthy_pools,
            },
            database: DatabaseHealth {
                configured: state.database_configured,
            },
        },
    })
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatsQuery {
    /// Restrict the report to one logical model
    pub model: Option<String>,
}

/// Load balancer statistics, for every pool or a single model.
#[utoipa::path(
    get,
    path = "/v1/load-balancer/stats",
    tag = "operations",
    params(StatsQuery),
    responses(
        (status = 200, description = "Pool statistics", body = LoadBalancerStats),
        (status = 400, description = "Unknown model", body = ApiErrorResponse),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorResponse)
    )
)]
pub async fn load_balancer_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>> {
    state.authenticator.authenticate(&headers)?;
    let load_balancer = state.router.load_balancer();

    let value = match query.model {
        Some(model) => {
            let stats = load_balancer
                .pool_stats(&model)
                .ok_or(AppError::UnknownModel(model))?;
            serde_json::to_value(stats)?
        }
        None => serde_json::to_value(load_balancer.stats())?,
    };
    Ok(Json(value))
}

/// Caller's current rate-limit window. Does not consume a request slot.
#[utoipa::path(
    get,
    path = "/v1/rate-limit",
    tag = "operations",
    responses(
        (status = 200, description = "Current window", body = RateLimitStatus),
        (status = 401, description = "Missing or invalid credentials", body = ApiErrorResponse)
    )
)]
pub async fn rate_limit_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    let identity = state.authenticator.authenticate(&headers)?;
    let info = state.rate_limiter.stats(&identity);

    let mut response = Json(RateLimitStatus {
        identity,
        limit: info.limit,
        remaining: info.remaining,
        reset: info.reset,
        window_seconds: info.window_seconds,
    })
    .into_response();
    info.apply_headers(response.headers_mut());
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/",
    tag = "operations",
    security(()),
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    )
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        docs: "/swagger-ui".to_string(),
        endpoints: [
            "POST /v1/chat/completions",
            "GET /v1/models",
            "GET /v1/load-balancer/stats",
            "GET /v1/rate-limit",
            "GET /health",
            "GET /metrics",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    })
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}
