//! Streaming pipeline tests: upstream SSE in, client SSE frames out.

use chatvault_gateway::{
    api::{
        models::{Delta, Message, StreamChoice, Usage},
        streaming::{StreamingPipeline, SSE_DONE},
        upstream::{OpenAiCompatibleClient, UpstreamChunk, UpstreamClient, UpstreamRequest},
    },
    core::AppError,
    services::ProviderKind,
};
use futures::stream::{self, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn content_chunk(text: &str) -> UpstreamChunk {
    UpstreamChunk {
        id: Some("chatcmpl-up".into()),
        model: Some("gpt-4o-2024".into()),
        created: Some(1_700_000_000),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                role: None,
                content: Some(text.into()),
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

fn usage_chunk(prompt: u32, completion: u32) -> UpstreamChunk {
    UpstreamChunk {
        usage: Some(Usage::new(prompt, completion)),
        ..Default::default()
    }
}

fn payload(frame: &str) -> Value {
    let data = frame
        .strip_prefix("data: ")
        .and_then(|f| f.strip_suffix("\n\n"))
        .expect("frame is an SSE data line");
    serde_json::from_str(data).expect("frame carries JSON")
}

async fn collect(
    pipeline: StreamingPipeline,
    chunks: Vec<Result<UpstreamChunk, AppError>>,
) -> (Vec<String>, Option<AppError>) {
    let frames = pipeline.run(stream::iter(chunks).boxed());
    futures::pin_mut!(frames);
    let mut out = Vec::new();
    let mut error = None;
    while let Some(item) = frames.next().await {
        match item {
            Ok(frame) => out.push(frame),
            Err(e) => error = Some(e),
        }
    }
    (out, error)
}

#[tokio::test]
async fn test_content_frames_keep_upstream_order() {
    let pipeline = StreamingPipeline::new("req-1", "gpt-4");
    let (frames, error) = collect(
        pipeline,
        vec![
            Ok(content_chunk("Hel")),
            Ok(content_chunk("lo")),
            Ok(content_chunk("!")),
        ],
    )
    .await;

    assert!(error.is_none());
    assert_eq!(frames.len(), 5);
    let texts: Vec<Value> = frames[..3]
        .iter()
        .map(|f| payload(f)["choices"][0]["delta"]["content"].clone())
        .collect();
    assert_eq!(texts, vec![json!("Hel"), json!("lo"), json!("!")]);
    for frame in &frames[..3] {
        assert_eq!(payload(frame)["usage"], Value::Null);
        assert_eq!(payload(frame)["object"], json!("chat.completion.chunk"));
    }
    assert_eq!(frames[4], SSE_DONE);
}

#[tokio::test]
async fn test_usage_only_chunk_becomes_final_usage_frame() {
    let pipeline = StreamingPipeline::new("req-2", "gpt-4");
    let state = pipeline.state();
    let (frames, _) = collect(
        pipeline,
        vec![Ok(content_chunk("Hi")), Ok(usage_chunk(12, 3))],
    )
    .await;

    // content, usage, [DONE]; the usage-only chunk is not echoed on its own
    assert_eq!(frames.len(), 3);
    let usage_frame = payload(&frames[1]);
    assert_eq!(usage_frame["choices"], json!([]));
    assert_eq!(
        usage_frame["usage"],
        json!({"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15})
    );
    assert_eq!(usage_frame["id"], json!("chatcmpl-up"));
    assert_eq!(usage_frame["model"], json!("gpt-4o-2024"));

    let state = state.lock().unwrap();
    assert!(state.completed);
    assert_eq!(state.content_frames, 1);
    assert_eq!(state.usage(), Usage::new(12, 3));
}

#[tokio::test]
async fn test_split_usage_reports_are_merged() {
    let pipeline = StreamingPipeline::new("req-3", "gpt-4");
    let state = pipeline.state();
    let first = UpstreamChunk {
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 0,
            total_tokens: 0,
        }),
        ..content_chunk("a")
    };
    let last = UpstreamChunk {
        usage: Some(Usage {
            prompt_tokens: 0,
            completion_tokens: 7,
            total_tokens: 0,
        }),
        ..Default::default()
    };
    collect(pipeline, vec![Ok(first), Ok(last)]).await;

    assert_eq!(state.lock().unwrap().usage(), Usage::new(20, 7));
}

#[tokio::test]
async fn test_missing_upstream_metadata_uses_fallbacks() {
    let pipeline = StreamingPipeline::new("req-4", "local-llama");
    let bare = UpstreamChunk {
        choices: content_chunk("x").choices,
        ..Default::default()
    };
    let (frames, _) = collect(pipeline, vec![Ok(bare)]).await;

    let first = payload(&frames[0]);
    assert_eq!(first["id"], json!("chatcmpl-req-4"));
    assert_eq!(first["model"], json!("local-llama"));
    assert!(first["created"].as_i64().unwrap() > 0);

    // Zero usage is still reported
    let usage = payload(&frames[1]);
    assert_eq!(usage["usage"]["total_tokens"], json!(0));
}

#[tokio::test]
async fn test_upstream_error_ends_stream_in_band() {
    let pipeline = StreamingPipeline::new("req-5", "gpt-4");
    let state = pipeline.state();
    let (frames, error) = collect(
        pipeline,
        vec![
            Ok(content_chunk("partial")),
            Err(AppError::Upstream {
                provider: "openai".into(),
                status: Some(500),
                message: "overloaded".into(),
            }),
            Ok(content_chunk("never sent")),
        ],
    )
    .await;

    assert_eq!(frames.len(), 3);
    let error_frame = payload(&frames[1]);
    assert_eq!(error_frame["choices"][0]["finish_reason"], json!("error"));
    assert!(error_frame["choices"][0]["delta"]["content"]
        .as_str()
        .unwrap()
        .starts_with("Error: "));
    assert_eq!(frames[2], SSE_DONE);
    assert!(matches!(error, Some(AppError::Upstream { .. })));
    assert!(!state.lock().unwrap().completed);
}

#[tokio::test]
async fn test_upstream_sse_through_pipeline() {
    let server = MockServer::start().await;
    let body = [
        r#"data: {"id":"chatcmpl-9","model":"gpt-4o","created":1700000001,"choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-9","model":"gpt-4o","created":1700000001,"choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        r#"data: {"id":"chatcmpl-9","model":"gpt-4o","created":1700000001,"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        r#"data: {"id":"chatcmpl-9","model":"gpt-4o","created":1700000001,"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1,"total_tokens":6}}"#,
        "data: [DONE]",
        "",
    ]
    .join("\n\n");

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "stream": true,
            "stream_options": {"include_usage": true}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiCompatibleClient::new(reqwest::Client::new());
    let request = UpstreamRequest {
        provider: ProviderKind::OpenAi,
        model: "gpt-4o".into(),
        api_base: format!("{}/v1", server.uri()),
        api_key: Some("sk-test".into()),
        messages: vec![Message::new("user", "Hi")],
        params: Map::new(),
    };
    let upstream = client.complete_stream(&request).await.unwrap();

    let pipeline = StreamingPipeline::new("req-6", "gpt-4");
    let state = pipeline.state();
    let frames: Vec<String> = pipeline
        .run(upstream)
        .filter_map(|item| async move { item.ok() })
        .collect()
        .await;

    assert_eq!(frames.len(), 5);
    assert_eq!(payload(&frames[1])["choices"][0]["delta"]["content"], json!("Hello"));
    assert_eq!(payload(&frames[2])["choices"][0]["finish_reason"], json!("stop"));
    assert_eq!(payload(&frames[3])["usage"]["total_tokens"], json!(6));
    assert_eq!(frames[4], SSE_DONE);
    assert_eq!(state.lock().unwrap().usage(), Usage::new(5, 1));
}
