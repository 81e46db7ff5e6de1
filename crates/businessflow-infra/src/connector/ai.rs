//! `ai_inference` connector: one chat completion against an OpenAI-compatible
//! API.
//!
//! Input is either a single `prompt` or a full `messages` array, plus
//! optional `system`, `model`, `max_tokens` and `temperature`:
//!
//! ```json
//! { "system": "Classify the ticket.", "prompt": "{{context.ticket.body}}" }
//! ```
//!
//! Output: `{ "content", "model", "finish_reason", "usage" }`. Requests are
//! non-streaming. The API key is read from the environment variable named in
//! `[ai] api_key_env` and is wrapped in [`SecretString`].

use std::time::Duration;

use businessflow_core::workflow::connector::{Connector, ConnectorContext, ConnectorError};
use businessflow_types::config::AiConnectorConfig;
use futures_util::future::BoxFuture;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connector for the `ai_inference` capability.
///
/// Does not derive Debug; the API key must never reach log output.
pub struct AiInferenceConnector {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

impl AiInferenceConnector {
    /// Build from config, reading the key from `config.api_key_env`.
    ///
    /// A missing key is allowed so keyless local endpoints work.
    pub fn from_config(config: &AiConnectorConfig) -> Result<Self, reqwest::Error> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        if api_key.is_none() {
            tracing::debug!(
                env = %config.api_key_env,
                "no AI API key in environment, sending unauthenticated requests"
            );
        }
        Self::new(config, api_key)
    }

    pub fn new(config: &AiConnectorConfig, api_key: Option<SecretString>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            api_key,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_request(&self, input: &Value) -> Result<ChatRequest, ConnectorError> {
        let mut messages = Vec::new();
        if let Some(system) = input.get("system").and_then(Value::as_str) {
            messages.push(ChatMessage {
                role: "system".into(),
                content: system.to_string(),
            });
        }
        match (input.get("messages"), input.get("prompt")) {
            (Some(list), _) if !list.is_null() => {
                let list: Vec<ChatMessage> = serde_json::from_value(list.clone()).map_err(|e| {
                    ConnectorError::invalid_input(format!(
                        "'messages' must be a list of {{role, content}}: {e}"
                    ))
                })?;
                messages.extend(list);
            }
            (_, Some(Value::String(prompt))) => messages.push(ChatMessage {
                role: "user".into(),
                content: prompt.clone(),
            }),
            (_, Some(other)) if !other.is_null() => messages.push(ChatMessage {
                role: "user".into(),
                content: other.to_string(),
            }),
            _ => {
                return Err(ConnectorError::invalid_input(
                    "either 'prompt' or 'messages' is required",
                ));
            }
        }
        if !messages.iter().any(|m| m.role != "system") {
            return Err(ConnectorError::invalid_input("no user message to send"));
        }

        let max_tokens = match input.get("max_tokens") {
            None | Some(Value::Null) => self.max_tokens,
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| ConnectorError::invalid_input("'max_tokens' must be a positive integer"))?,
        };

        Ok(ChatRequest {
            model: input
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&self.model)
                .to_string(),
            messages,
            max_tokens,
            temperature: input.get("temperature").and_then(Value::as_f64),
            stream: false,
        })
    }

    async fn complete(&self, input: Value, ctx: ConnectorContext) -> Result<Value, ConnectorError> {
        let body = self.build_request(&input)?;
        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = %ctx.step_id,
            model = %body.model,
            "sending chat completion"
        );

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .timeout(ctx.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| {
                ConnectorError::transient(format!("inference request failed: {e}"))
            })?,
            _ = ctx.cancel.cancelled() => {
                return Err(ConnectorError::transient("inference request cancelled"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {status}: {error_body}");
            return Err(match status.as_u16() {
                429 => ConnectorError::rate_limited(detail),
                408 => ConnectorError::transient(detail),
                s if s >= 500 => ConnectorError::transient(detail),
                _ => ConnectorError::permanent(detail),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::permanent(format!("failed to parse response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ConnectorError::permanent("response contained no choices"))?;

        Ok(json!({
            "content": choice.message.content.unwrap_or_default(),
            "model": parsed.model.unwrap_or(body.model),
            "finish_reason": choice.finish_reason,
            "usage": parsed.usage,
        }))
    }
}

impl Connector for AiInferenceConnector {
    fn capability(&self) -> &str {
        "ai_inference"
    }

    fn execute(
        &self,
        input: Value,
        ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>> {
        Box::pin(self.complete(input, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use businessflow_types::execution::ConnectorErrorKind;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ConnectorContext {
        ConnectorContext {
            run_id: Uuid::now_v7(),
            step_id: "classify".to_string(),
            attempt: 1,
            timeout: Duration::from_secs(5),
            cancel: CancellationToken::new(),
        }
    }

    fn connector(endpoint: &str, key: Option<&str>) -> AiInferenceConnector {
        let config = AiConnectorConfig {
            endpoint: endpoint.to_string(),
            ..AiConnectorConfig::default()
        };
        AiInferenceConnector::new(&config, key.map(|k| SecretString::from(k.to_string()))).unwrap()
    }

    #[test]
    fn test_build_request_from_prompt() {
        let ai = connector("http://localhost/v1/", None);
        assert_eq!(ai.endpoint, "http://localhost/v1");

        let req = ai
            .build_request(&json!({ "system": "be brief", "prompt": "hi", "max_tokens": 16 }))
            .unwrap();
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.max_tokens, 16);
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].content, "hi");
        assert!(!req.stream);
    }

    #[test]
    fn test_build_request_rejects_bad_input() {
        let ai = connector("http://localhost/v1", None);
        for bad in [
            json!({}),
            json!({ "system": "only a system prompt" }),
            json!({ "messages": "not a list" }),
            json!({ "prompt": "hi", "max_tokens": 0 }),
        ] {
            let err = ai.build_request(&bad).unwrap_err();
            assert_eq!(err.kind, ConnectorErrorKind::InvalidInput, "{bad}");
        }
    }

    #[tokio::test]
    async fn test_completion_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini-2024",
                "choices": [{ "message": { "role": "assistant", "content": "billing" }, "finish_reason": "stop" }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 1 }
            })))
            .mount(&server)
            .await;

        let ai = connector(&format!("{}/v1", server.uri()), Some("sk-test"));
        let out = ai
            .execute(json!({ "prompt": "Which queue?" }), ctx())
            .await
            .unwrap();
        assert_eq!(out["content"], "billing");
        assert_eq!(out["model"], "gpt-4o-mini-2024");
        assert_eq!(out["finish_reason"], "stop");
        assert_eq!(out["usage"]["prompt_tokens"], 12);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(path("/limited/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(path("/denied/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = connector(&format!("{}/limited", server.uri()), None)
            .execute(json!({ "prompt": "x" }), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::RateLimited);

        let err = connector(&format!("{}/denied", server.uri()), None)
            .execute(json!({ "prompt": "x" }), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Permanent);
    }
}
