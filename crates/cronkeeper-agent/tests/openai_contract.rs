//! HTTP contract of the OpenAI provider against a mock server.

use cronkeeper_agent::{ChatRequest, LlmProvider, OpenAiProvider, ProviderError};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 3}
    })
}

fn request() -> ChatRequest {
    ChatRequest::single_turn("gpt-4o", "You are terse.", "Say hi", 2000)
}

#[tokio::test]
async fn sends_bearer_auth_and_parses_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "max_tokens": 2000,
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "Say hi"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hi")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("sk-test".into(), Some(server.uri()));
    let resp = provider.send(&request()).await.unwrap();

    assert_eq!(resp.content, "hi");
    assert_eq!(resp.tokens_in, 12);
    assert_eq!(resp.tokens_out, 3);
    assert_eq!(resp.stop_reason, "stop");
}

#[tokio::test]
async fn api_error_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("bad".into(), Some(server.uri()));
    match provider.send(&request()).await {
        Err(ProviderError::Api { status, message }) => {
            assert_eq!(status, 401);
            assert!(message.contains("invalid api key"));
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_reads_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("k".into(), Some(server.uri()));
    assert!(matches!(
        provider.send(&request()).await,
        Err(ProviderError::RateLimited { retry_after_ms: 7000 })
    ));
}

#[tokio::test]
async fn empty_choices_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"model": "gpt-4o", "choices": []})),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new("k".into(), Some(server.uri()));
    assert!(matches!(
        provider.send(&request()).await,
        Err(ProviderError::Parse(_))
    ));
}

#[tokio::test]
async fn missing_key_fails_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("x")))
        .expect(0)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(String::new(), Some(server.uri()));
    assert!(matches!(
        provider.send(&request()).await,
        Err(ProviderError::Unavailable(_))
    ));
}
