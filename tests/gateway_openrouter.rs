use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use refine_harness::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use refine_harness::gateway::{
    Attribution, ChatModel, ChatRequest, FinishReason, GatewayConfig, Message, NoopUsageSink,
    ProviderError, ProviderGateway, TallyUsageSink,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 20,
                "cost_details": { "upstream_inference_cost": 0.000001 }
            }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let resp = adapter.chat(&req).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(
        resp.cost_nanodollars,
        refine_harness::gateway::chat_cost("anthropic/claude-3-haiku", 10, 20)
    );
    assert_eq!(resp.upstream_cost_nanodollars, Some(1_000));
}

#[tokio::test]
async fn openrouter_detects_refusal_from_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot comply with that request." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = adapter.chat(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
}

#[tokio::test]
async fn openrouter_classifies_http_429_as_rate_limit_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = adapter.chat(&req).await.unwrap_err();
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_succeeds() {
    let server = MockServer::start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));
    let second = ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{
            "message": { "content": "ok" },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    }));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls,
            first,
            second,
        })
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
            attempt_timeout: None,
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let resp = gateway.chat(req).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn openrouter_classifies_401_as_fatal_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "No auth credentials found", "code": 401 }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-bad", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(0),
            attempt_timeout: None,
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = gateway.chat(req).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unauthorized { .. }), "{err:?}");
    assert!(err.is_fatal());
    assert_eq!(err.context().and_then(|c| c.provider_code.as_deref()), Some("401"));

    // Fatal errors are not retried.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn provider_gateway_records_usage_for_every_attempt() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": { "message": "overloaded" }
        })))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let tally = Arc::new(TallyUsageSink::new());
    let gateway = ProviderGateway::with_config(
        adapter,
        tally.clone(),
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(0),
            attempt_timeout: None,
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = gateway.chat(req).await.unwrap_err();
    assert!(err.is_retryable());

    let totals = tally.totals();
    assert_eq!(totals.calls, 3);
    assert_eq!(totals.failed_calls, 3);
}

#[tokio::test]
async fn attempt_timeout_bounds_each_try_and_retries_after_expiry() {
    let server = MockServer::start().await;

    let ok = json!({
        "choices": [{ "message": { "content": "ok" }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    });
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ok.clone())
                .set_delay(Duration::from_secs(2)),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let tally = Arc::new(TallyUsageSink::new());
    let gateway = ProviderGateway::with_config(
        adapter,
        tally.clone(),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
            attempt_timeout: Some(Duration::from_millis(300)),
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let resp = gateway.chat(req).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // The expired attempt is recorded as a failed call.
    let totals = tally.totals();
    assert_eq!(totals.calls, 2);
    assert_eq!(totals.failed_calls, 1);
}

#[tokio::test]
async fn attempt_timeout_surfaces_as_timeout_once_retries_run_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
            attempt_timeout: Some(Duration::from_millis(200)),
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("anthropic/claude-3-haiku"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    );

    let err = gateway.chat(req).await.unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(limit, None) if limit == Duration::from_millis(200)));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
