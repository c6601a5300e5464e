//! Per-request orchestration: validate, select, invoke, account.
//!
//! Every request moves through `Validating -> Selecting -> Invoking ->
//! {Succeeded, Failed} -> Logged`. Validation and selection failures return
//! before any upstream traffic. Anything that fails during invocation is
//! reported against the serving instance and still produces a [`UsageRecord`].

use crate::api::models::{ChatCompletionResponse, Message, Usage};
use crate::api::streaming::{SharedStreamState, StreamingPipeline};
use crate::api::upstream::{UpstreamClient, UpstreamRequest, UpstreamStream};
use crate::core::error::{AppError, Result};
use crate::core::error_types::RequestOutcome;
use crate::core::metrics::get_metrics;
use crate::core::usage_logger::{append_best_effort, UsageRecord, UsageStore};
use crate::services::cost_table::CostTable;
use crate::services::load_balancer::LoadBalancer;
use crate::services::model_registry::{strip_provider_prefix, ModelConfigResolver, ModelParams};
use crate::services::provider_pool::ProviderInstance;
use futures::stream::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One inbound chat request after authentication.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    /// Caller-supplied parameters (temperature, max_tokens, ...)
    pub overrides: Map<String, Value>,
}

pub struct CompletionRouter {
    models: Arc<dyn ModelConfigResolver>,
    load_balancer: Arc<LoadBalancer>,
    upstream: Arc<dyn UpstreamClient>,
    usage_store: Arc<dyn UsageStore>,
    costs: Arc<dyn CostTable>,
    cost_calculation: bool,
    usage_logging: bool,
}

impl CompletionRouter {
    pub fn new(
        models: Arc<dyn ModelConfigResolver>,
        load_balancer: Arc<LoadBalancer>,
        upstream: Arc<dyn UpstreamClient>,
        usage_store: Arc<dyn UsageStore>,
        costs: Arc<dyn CostTable>,
    ) -> Self {
        Self {
            models,
            load_balancer,
            upstream,
            usage_store,
            costs,
            cost_calculation: true,
            usage_logging: true,
        }
    }

    pub fn with_cost_calculation(mut self, enabled: bool) -> Self {
        self.cost_calculation = enabled;
        self
    }

    pub fn with_usage_logging(mut self, enabled: bool) -> Self {
        self.usage_logging = enabled;
        self
    }

    pub fn models(&self) -> &Arc<dyn ModelConfigResolver> {
        &self.models
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    fn validate(&self, ctx: &RequestContext) -> Result<ModelParams> {
        if ctx.messages.is_empty() {
            return Err(AppError::BadRequest("messages must not be empty".into()));
        }
        self.models
            .get_params(&ctx.model)
            .ok_or_else(|| AppError::UnknownModel(ctx.model.clone()))
    }

    fn build_upstream_request(
        params: &ModelParams,
        instance: &ProviderInstance,
        ctx: &RequestContext,
    ) -> Result<UpstreamRequest> {
        let settings = instance.settings();
        let api_base = settings
            .base_url
            .clone()
            .or_else(|| params.api_base.clone())
            .or_else(|| params.provider.default_api_base().map(str::to_string))
            .ok_or_else(|| {
                AppError::Internal(format!("no api_base configured for model '{}'", ctx.model))
            })?;

        Ok(UpstreamRequest {
            provider: params.provider,
            model: strip_provider_prefix(&params.upstream_model).to_string(),
            api_base,
            api_key: settings.api_key.clone().or_else(|| params.api_key.clone()),
            messages: ctx.messages.clone(),
            params: merge_params(&params.extra, &ctx.overrides),
        })
    }

    fn price(&self, params: &ModelParams, usage: &Usage) -> f64 {
        if !self.cost_calculation {
            return 0.0;
        }
        self.costs.price_for(
            strip_provider_prefix(&params.upstream_model),
            usage.prompt_tokens,
            usage.completion_tokens,
        )
    }

    async fn log_usage(&self, record: UsageRecord) {
        if self.usage_logging {
            append_best_effort(self.usage_store.as_ref(), record).await;
        }
    }

    /// Accounting guard for a request that has just been counted as active on
    /// `instance`. It settles the request as cancelled if dropped unfinished.
    fn in_flight(
        &self,
        params: &ModelParams,
        instance: &ProviderInstance,
        ctx: &RequestContext,
        provider: &str,
        stream_state: Option<SharedStreamState>,
    ) -> InFlightGuard {
        InFlightGuard {
            load_balancer: Arc::clone(&self.load_balancer),
            usage_store: self.usage_logging.then(|| Arc::clone(&self.usage_store)),
            costs: self.cost_calculation.then(|| Arc::clone(&self.costs)),
            priced_model: strip_provider_prefix(&params.upstream_model).to_string(),
            instance_id: instance.id().to_string(),
            provider: provider.to_string(),
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id.clone(),
            model: ctx.model.clone(),
            start: Instant::now(),
            stream_state,
            finished: false,
        }
    }

    /// Non-streaming completion.
    pub async fn complete(&self, ctx: RequestContext) -> Result<ChatCompletionResponse> {
        let params = self.validate(&ctx)?;
        let instance = self.load_balancer.select_instance(&ctx.model)?;
        let request = Self::build_upstream_request(&params, &instance, &ctx)?;
        let provider = params.provider.to_string();

        instance.record_request_start();
        let mut guard = self.in_flight(&params, &instance, &ctx, &provider, None);
        let start = guard.start;
        let timeout = instance.timeout();
        let result = match tokio::time::timeout(timeout, self.upstream.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(&provider, timeout)),
        };
        guard.disarm();
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut record = UsageRecord::new(&ctx.request_id, &ctx.user_id, &ctx.model, &provider);
        record.instance_id = Some(instance.id().to_string());
        record.response_time_ms = elapsed_ms as u64;

        match result {
            Ok(completion) => {
                self.load_balancer
                    .record_request_result(&ctx.model, instance.id(), true, Some(elapsed_ms));

                let usage = completion.usage.unwrap_or_default();
                let usage = Usage {
                    total_tokens: if usage.total_tokens > 0 {
                        usage.total_tokens
                    } else {
                        usage.prompt_tokens + usage.completion_tokens
                    },
                    ..usage
                };
                let cost = self.price(&params, &usage);
                record_success_metrics(&ctx.model, &provider, &usage, cost, elapsed_ms);

                record.input_tokens = usage.prompt_tokens;
                record.output_tokens = usage.completion_tokens;
                record.total_tokens = usage.total_tokens;
                record.cost = cost;
                self.log_usage(record).await;

                tracing::info!(
                    request_id = %ctx.request_id,
                    model = %ctx.model,
                    provider = %provider,
                    instance_id = %instance.id(),
                    total_tokens = usage.total_tokens,
                    response_time_ms = elapsed_ms as u64,
                    "Completion succeeded"
                );

                Ok(ChatCompletionResponse {
                    id: if completion.id.is_empty() {
                        format!("chatcmpl-{}", ctx.request_id)
                    } else {
                        completion.id
                    },
                    object: "chat.completion".to_string(),
                    created: if completion.created > 0 {
                        completion.created
                    } else {
                        chrono::Utc::now().timestamp()
                    },
                    model: ctx.model.clone(),
                    choices: completion.choices,
                    usage: Some(usage),
                })
            }
            Err(error) => {
                self.load_balancer
                    .record_request_result(&ctx.model, instance.id(), false, Some(elapsed_ms));

                record.success = false;
                record.status_code = error.status_code().as_u16();
                record.error_detail = Some(error.to_string());
                self.log_usage(record).await;

                tracing::error!(
                    request_id = %ctx.request_id,
                    model = %ctx.model,
                    provider = %provider,
                    instance_id = %instance.id(),
                    outcome = %outcome_of(&error),
                    error = %error,
                    "Completion failed"
                );
                Err(error)
            }
        }
    }

    /// Streaming completion as a sequence of SSE frames.
    ///
    /// Validation and selection errors are returned directly. Once an instance is
    /// chosen every failure, including failing to open the stream, is delivered
    /// in-band as an error frame followed by `[DONE]`. Dropping the returned
    /// stream stops reading from upstream and records whatever usage was seen.
    pub async fn complete_stream(
        &self,
        ctx: RequestContext,
    ) -> Result<impl Stream<Item = String> + Send + 'static> {
        let params = self.validate(&ctx)?;
        let instance = self.load_balancer.select_instance(&ctx.model)?;
        let request = Self::build_upstream_request(&params, &instance, &ctx)?;
        let provider = params.provider.to_string();

        instance.record_request_start();
        let pipeline = StreamingPipeline::new(&ctx.request_id, &ctx.model);
        let mut guard = self.in_flight(&params, &instance, &ctx, &provider, Some(pipeline.state()));
        let timeout = instance.timeout();

        let upstream: UpstreamStream =
            match tokio::time::timeout(timeout, self.upstream.complete_stream(&request)).await {
                Ok(Ok(stream)) => with_chunk_timeout(stream, timeout, provider.clone()),
                Ok(Err(e)) => futures::stream::once(async move { Err(e) }).boxed(),
                Err(_) => {
                    let e = timeout_error(&provider, timeout);
                    futures::stream::once(async move { Err(e) }).boxed()
                }
            };

        let frames = pipeline.run(upstream);

        Ok(async_stream::stream! {
            let mut frames = Box::pin(frames);
            let mut failure: Option<AppError> = None;
            while let Some(item) = frames.next().await {
                match item {
                    Ok(frame) => yield frame,
                    Err(e) => failure = Some(e),
                }
            }
            if let Some((record, store)) = guard.finish(failure.as_ref()) {
                append_best_effort(store.as_ref(), record).await;
            }
        })
    }
}

/// Accounting for one in-flight request. The outcome is recorded exactly once:
/// by the stream on completion, or on drop when the caller goes away first.
/// A non-streaming call settles its own result and disarms the guard.
struct InFlightGuard {
    load_balancer: Arc<LoadBalancer>,
    usage_store: Option<Arc<dyn UsageStore>>,
    costs: Option<Arc<dyn CostTable>>,
    priced_model: String,
    instance_id: String,
    provider: String,
    request_id: String,
    user_id: String,
    model: String,
    start: Instant,
    stream_state: Option<SharedStreamState>,
    finished: bool,
}

impl InFlightGuard {
    fn disarm(&mut self) {
        self.finished = true;
    }

    /// Report the outcome to the load balancer and metrics, returning the usage
    /// record to persist when logging is enabled.
    fn finish(
        &mut self,
        failure: Option<&AppError>,
    ) -> Option<(UsageRecord, Arc<dyn UsageStore>)> {
        if self.finished {
            return None;
        }
        self.finished = true;

        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let streaming = self.stream_state.is_some();
        let (usage, completed) = match &self.stream_state {
            Some(state) => {
                let state = state.lock().unwrap_or_else(PoisonError::into_inner);
                (state.usage(), state.completed)
            }
            None => (Usage::default(), false),
        };

        let (success, outcome, status, detail) = match failure {
            Some(error) => (
                false,
                outcome_of(error),
                error.status_code().as_u16(),
                Some(error.to_string()),
            ),
            None if completed => (true, RequestOutcome::Success, 200, None),
            None => (
                false,
                RequestOutcome::Cancelled,
                AppError::ClientDisconnect.status_code().as_u16(),
                Some(AppError::ClientDisconnect.to_string()),
            ),
        };

        self.load_balancer
            .record_request_result(&self.model, &self.instance_id, success, Some(elapsed_ms));

        let cost = self
            .costs
            .as_ref()
            .map(|c| c.price_for(&self.priced_model, usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or(0.0);

        if streaming {
            get_metrics()
                .stream_outcomes
                .with_label_values(&[&self.model, outcome.as_str()])
                .inc();
        }
        if success {
            record_success_metrics(&self.model, &self.provider, &usage, cost, elapsed_ms);
        }

        tracing::info!(
            request_id = %self.request_id,
            model = %self.model,
            provider = %self.provider,
            instance_id = %self.instance_id,
            outcome = %outcome,
            streaming,
            total_tokens = usage.total_tokens,
            response_time_ms = elapsed_ms as u64,
            "Request finished"
        );

        let store = self.usage_store.clone()?;
        let mut record = UsageRecord::new(&self.request_id, &self.user_id, &self.model, &self.provider);
        record.instance_id = Some(self.instance_id.clone());
        record.input_tokens = usage.prompt_tokens;
        record.output_tokens = usage.completion_tokens;
        record.total_tokens = usage.total_tokens;
        record.cost = cost;
        record.response_time_ms = elapsed_ms as u64;
        record.status_code = status;
        record.success = success;
        record.streaming = streaming;
        record.error_detail = detail;
        Some((record, store))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some((record, store)) = self.finish(None) else {
            return;
        };
        // Drop cannot await; hand the write to the runtime if one is still around
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    append_best_effort(store.as_ref(), record).await;
                });
            }
            Err(_) => tracing::warn!(
                request_id = %record.request_id,
                "No runtime available to persist usage for dropped request"
            ),
        }
    }
}

/// Defaults, then per-model parameters, then caller overrides.
fn merge_params(model_extra: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    merged.insert("temperature".into(), Value::from(DEFAULT_TEMPERATURE));
    merged.insert("max_tokens".into(), Value::from(DEFAULT_MAX_TOKENS));
    for (key, value) in model_extra.iter().chain(overrides.iter()) {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Apply the instance timeout to every wait for the next chunk.
fn with_chunk_timeout(upstream: UpstreamStream, timeout: Duration, provider: String) -> UpstreamStream {
    async_stream::stream! {
        let mut upstream = upstream;
        loop {
            match tokio::time::timeout(timeout, upstream.next()).await {
                Ok(Some(item)) => {
                    let failed = item.is_err();
                    yield item;
                    if failed {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    yield Err(timeout_error(&provider, timeout));
                    break;
                }
            }
        }
    }
    .boxed()
}

fn timeout_error(provider: &str, timeout: Duration) -> AppError {
    AppError::UpstreamTimeout {
        provider: provider.to_string(),
        timeout_secs: timeout.as_secs(),
    }
}

fn outcome_of(error: &AppError) -> RequestOutcome {
    if error.is_timeout() {
        RequestOutcome::Timeout
    } else if matches!(error, AppError::ClientDisconnect) {
        RequestOutcome::Cancelled
    } else if error.is_upstream_failure() {
        RequestOutcome::UpstreamError
    } else {
        RequestOutcome::Rejected
    }
}

fn record_success_metrics(model: &str, provider: &str, usage: &Usage, cost: f64, elapsed_ms: f64) {
    let metrics = get_metrics();
    metrics
        .token_usage
        .with_label_values(&[model, provider, "input"])
        .inc_by(usage.prompt_tokens as u64);
    metrics
        .token_usage
        .with_label_values(&[model, provider, "output"])
        .inc_by(usage.completion_tokens as u64);
    if cost > 0.0 {
        metrics
            .usage_cost
            .with_label_values(&[model, provider])
            .inc_by(cost);
    }
    metrics
        .upstream_latency
        .with_label_values(&[model, provider])
        .observe(elapsed_ms / 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_params_precedence() {
        let mut model_extra = Map::new();
        model_extra.insert("temperature".into(), json!(0.1));
        model_extra.insert("top_p".into(), json!(0.5));
        let mut overrides = Map::new();
        overrides.insert("top_p".into(), json!(0.9));

        let merged = merge_params(&model_extra, &overrides);
        assert_eq!(merged["temperature"], json!(0.1));
        assert_eq!(merged["top_p"], json!(0.9));
        assert_eq!(merged["max_tokens"], json!(4096));
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            outcome_of(&timeout_error("openai", Duration::from_secs(3))),
            RequestOutcome::Timeout
        );
        assert_eq!(
            outcome_of(&AppError::Upstream {
                provider: "openai".into(),
                status: Some(500),
                message: "boom".into()
            }),
            RequestOutcome::UpstreamError
        );
        assert_eq!(outcome_of(&AppError::ClientDisconnect), RequestOutcome::Cancelled);
        assert_eq!(
            outcome_of(&AppError::Internal("x".into())),
            RequestOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn test_chunk_timeout_ends_stalled_stream() {
        let stalled = futures::stream::pending::<Result<crate::api::upstream::UpstreamChunk>>().boxed();
        let items: Vec<_> = with_chunk_timeout(stalled, Duration::from_millis(20), "ollama".into())
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AppError::UpstreamTimeout { .. })));
    }
}
