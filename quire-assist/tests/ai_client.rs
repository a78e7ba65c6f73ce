//! Chat-completions client against a mock HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use quire_assist::{AiConfig, AssistError, ChatCompletionClient, GrammarChecker, TextTransform};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COMPLETIONS: &str = "/v4/chat/completions";

fn client(server: &MockServer) -> ChatCompletionClient {
    ChatCompletionClient::new(AiConfig {
        endpoint: format!("{}{COMPLETIONS}", server.uri()),
        api_key: "test-key".to_string(),
        timeout: Duration::from_secs(5),
        ..AiConfig::default()
    })
    .unwrap()
}

fn reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    }))
}

async fn mount(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_transform_returns_first_choice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(COMPLETIONS))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "glm-4-flash",
            "stream": false,
            "messages": [{ "role": "user", "content": "say hi" }]
        })))
        .respond_with(reply("hi there"))
        .expect(1)
        .mount(&server)
        .await;

    let reply = client(&server).transform("say hi").await;
    assert_eq!(reply.as_deref(), Ok("hi there"));
}

#[tokio::test]
async fn test_http_error_is_unavailable() {
    let server = MockServer::start().await;
    mount(&server, ResponseTemplate::new(500).set_body_json(json!({ "error": "boom" }))).await;
    assert_eq!(client(&server).transform("x").await, Err(AssistError::Unavailable));
}

#[tokio::test]
async fn test_unparseable_body_is_unavailable() {
    let server = MockServer::start().await;
    mount(&server, ResponseTemplate::new(200).set_body_string("<html>oops</html>")).await;
    assert_eq!(client(&server).transform("x").await, Err(AssistError::Unavailable));
}

#[tokio::test]
async fn test_no_choices_is_unavailable() {
    let server = MockServer::start().await;
    mount(&server, ResponseTemplate::new(200).set_body_json(json!({ "choices": [] }))).await;
    assert_eq!(client(&server).transform("x").await, Err(AssistError::Unavailable));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_unavailable() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = ChatCompletionClient::new(AiConfig {
        endpoint: format!("http://127.0.0.1:{port}{COMPLETIONS}"),
        api_key: "test-key".to_string(),
        timeout: Duration::from_secs(5),
        ..AiConfig::default()
    })
    .unwrap();
    assert_eq!(client.transform("x").await, Err(AssistError::Unavailable));
}

#[tokio::test]
async fn test_grammar_check_with_prose_reply_is_empty() {
    let server = MockServer::start().await;
    mount(&server, reply("Looks fine to me!")).await;

    let checker = GrammarChecker::new(Arc::new(client(&server)));
    assert_eq!(checker.check_text("Their going home.").await, Ok(vec![]));
}

#[tokio::test]
async fn test_grammar_check_parses_fenced_reply() {
    let server = MockServer::start().await;
    let content = "```json\n{\"issues\":[{\"type\":\"grammar\",\"position\":{\"start\":0,\"end\":5},\
                   \"original\":\"Their\",\"suggestion\":\"They're\",\"reason\":\"contraction\",\
                   \"severity\":\"high\"}]}\n```";
    mount(&server, reply(content)).await;

    let checker = GrammarChecker::new(Arc::new(client(&server)));
    let issues = checker.check_text("Their going home.").await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].suggestion, "They're");

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    let prompt = body["messages"][0]["content"].as_str().unwrap();
    assert!(prompt.contains("Their going home."));
}

#[tokio::test]
async fn test_grammar_check_transport_failure_propagates() {
    let server = MockServer::start().await;
    mount(&server, ResponseTemplate::new(503)).await;

    let checker = GrammarChecker::new(Arc::new(client(&server)));
    assert_eq!(checker.check_text("Their going home.").await, Err(AssistError::Unavailable));
}

#[test]
fn test_config_from_env_requires_key() {
    std::env::remove_var("QUIRE_AI_API_KEY");
    assert!(matches!(AiConfig::from_env(), Err(AssistError::Config(_))));

    std::env::set_var("QUIRE_AI_API_KEY", "from-env");
    let config = AiConfig::from_env().unwrap();
    assert_eq!(config.api_key, "from-env");
    std::env::remove_var("QUIRE_AI_API_KEY");
}
