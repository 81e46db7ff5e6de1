//! `http` connector: one outbound HTTP request per attempt.
//!
//! Input:
//!
//! ```json
//! {
//!   "method": "POST",
//!   "url": "https://api.example.com/orders",
//!   "headers": { "x-tenant": "acme" },
//!   "query": { "page": 2 },
//!   "body": { "id": 42 }
//! }
//! ```
//!
//! Output: `{ "status": 200, "headers": { ... }, "body": <json or text> }`.
//!
//! Network failures and 5xx responses are transient, 429 is rate-limited and
//! any other 4xx is permanent.

use std::time::Duration;

use businessflow_core::workflow::connector::{Connector, ConnectorContext, ConnectorError};
use businessflow_types::config::HttpConnectorConfig;
use futures_util::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value, json};

/// Connector for the `http` capability.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

/// A validated request built from step input.
#[derive(Debug, PartialEq)]
struct HttpRequestSpec {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl HttpConnector {
    pub fn new(config: &HttpConnectorConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    async fn send(&self, input: Value, ctx: ConnectorContext) -> Result<Value, ConnectorError> {
        let spec = parse_request(&input)?;
        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = %ctx.step_id,
            method = %spec.method,
            url = %spec.url,
            "sending http request"
        );

        let mut request = self
            .client
            .request(spec.method, &spec.url)
            .timeout(ctx.timeout)
            .query(&spec.query);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = tokio::select! {
            result = request.send() => result.map_err(classify_transport)?,
            _ = ctx.cancel.cancelled() => {
                return Err(ConnectorError::transient("http request cancelled"));
            }
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let text = response.text().await.map_err(classify_transport)?;

        if let Some(err) = classify_status(status, &text) {
            return Err(err);
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }
}

impl Connector for HttpConnector {
    fn capability(&self) -> &str {
        "http"
    }

    fn execute(
        &self,
        input: Value,
        ctx: ConnectorContext,
    ) -> BoxFuture<'_, Result<Value, ConnectorError>> {
        Box::pin(self.send(input, ctx))
    }
}

// ---------------------------------------------------------------------------
// Input parsing and error classification
// ---------------------------------------------------------------------------

fn parse_request(input: &Value) -> Result<HttpRequestSpec, ConnectorError> {
    let url = input
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConnectorError::invalid_input("'url' must be a non-empty string"))?;

    let method = match input.get("method") {
        None | Some(Value::Null) => Method::GET,
        Some(Value::String(m)) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
            .map_err(|_| ConnectorError::invalid_input(format!("invalid method '{m}'")))?,
        Some(_) => return Err(ConnectorError::invalid_input("'method' must be a string")),
    };

    Ok(HttpRequestSpec {
        method,
        url: url.to_string(),
        headers: string_pairs(input, "headers")?,
        query: string_pairs(input, "query")?,
        body: input.get("body").filter(|b| !b.is_null()).cloned(),
    })
}

/// Flatten an object of scalars into name/value pairs.
fn string_pairs(input: &Value, field: &str) -> Result<Vec<(String, String)>, ConnectorError> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(_) | Value::Bool(_) => v.to_string(),
                    _ => {
                        return Err(ConnectorError::invalid_input(format!(
                            "'{field}.{k}' must be a string, number or boolean"
                        )));
                    }
                };
                Ok((k.clone(), v))
            })
            .collect(),
        Some(_) => Err(ConnectorError::invalid_input(format!("'{field}' must be an object"))),
    }
}

fn classify_status(status: StatusCode, body: &str) -> Option<ConnectorError> {
    if status.is_success() || status.is_redirection() || status.is_informational() {
        return None;
    }
    let detail = format!("HTTP {status}: {}", truncate(body, 512));
    Some(match status.as_u16() {
        429 => ConnectorError::rate_limited(detail),
        408 => ConnectorError::transient(detail),
        s if s >= 500 => ConnectorError::transient(detail),
        _ => ConnectorError::permanent(detail),
    })
}

fn classify_transport(e: reqwest::Error) -> ConnectorError {
    if e.is_builder() {
        ConnectorError::invalid_input(format!("invalid request: {e}"))
    } else if e.is_decode() {
        ConnectorError::permanent(format!("failed to read response: {e}"))
    } else {
        ConnectorError::transient(format!("http request failed: {e}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
