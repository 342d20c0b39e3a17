//! LLM client (C3): a single Anthropic-compatible `createMessage` RPC with a
//! bounded retry schedule for rate limiting and transient server errors
//! (§5), cancellation-aware between backoff sleeps.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use conductor_wire::{ContentBlock, CreateMessageRequest, CreateMessageResponse, StopReason};

/// Backoffs applied between attempts on HTTP 429 (§5).
const RATE_LIMIT_BACKOFFS_MS: [u64; 6] = [2_000, 4_000, 8_000, 16_000, 32_000, 60_000];
/// Backoffs applied between attempts on a transient 5xx (§5).
const SERVER_ERROR_BACKOFFS_MS: [u64; 3] = [2_000, 4_000, 8_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    ApiError,
    RateLimited,
    Timeout,
    ApiOverloaded,
    ResponseEmpty,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Classifies a raw transport/HTTP outcome into the executor's error
/// taxonomy (§4.2), grounded in the same "map everything unknown to a safe
/// default" principle as the tool-loop bound.
pub fn provider_error_code(status: Option<StatusCode>, timed_out: bool) -> ProviderErrorCode {
    if timed_out {
        return ProviderErrorCode::Timeout;
    }
    match status {
        Some(StatusCode::TOO_MANY_REQUESTS) => ProviderErrorCode::RateLimited,
        Some(StatusCode::SERVICE_UNAVAILABLE) | Some(StatusCode::BAD_GATEWAY) => {
            ProviderErrorCode::ApiOverloaded
        }
        Some(s) if s.is_server_error() => ProviderErrorCode::ApiOverloaded,
        Some(s) if s.is_client_error() => ProviderErrorCode::ApiError,
        Some(_) => ProviderErrorCode::Unknown,
        None => ProviderErrorCode::Unknown,
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
        cancel: CancellationToken,
    ) -> Result<CreateMessageResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct AnthropicClientConfig {
    pub api_key: String,
    pub base_url: String,
}

impl Default for AnthropicClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

pub struct AnthropicClient {
    config: AnthropicClientConfig,
    http: Client,
}

impl AnthropicClient {
    pub fn new(config: AnthropicClientConfig) -> Self {
        Self {
            config,
            http: Client::new(),
        }
    }

    async fn attempt(
        &self,
        request: &CreateMessageRequest,
    ) -> Result<CreateMessageResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let started = Instant::now();
        let body = to_anthropic_body(request);

        let send = self
            .http
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header("x-api-key", &self.config.api_key)
            .timeout(Duration::from_millis(request.timeout_ms))
            .json(&body)
            .send()
            .await;

        let response = match send {
            Ok(resp) => resp,
            Err(err) => {
                let code = provider_error_code(err.status(), err.is_timeout());
                return Err(ProviderError {
                    code,
                    message: err.to_string(),
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let code = provider_error_code(Some(status), false);
            return Err(ProviderError {
                code,
                message: format!("anthropic request failed with status {status}: {text}"),
            });
        }

        let value: Value = response.json().await.map_err(|err| ProviderError {
            code: ProviderErrorCode::Unknown,
            message: err.to_string(),
        })?;

        from_anthropic_body(&value, request.model.clone(), started.elapsed())
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
        cancel: CancellationToken,
    ) -> Result<CreateMessageResponse, ProviderError> {
        let mut timeout_retried = false;
        let mut rate_limit_attempt = 0usize;
        let mut server_error_attempt = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError {
                    code: ProviderErrorCode::Unknown,
                    message: "request cancelled".to_string(),
                });
            }

            match self.attempt(&request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let backoff_ms = match err.code {
                        ProviderErrorCode::RateLimited => {
                            let delay = RATE_LIMIT_BACKOFFS_MS.get(rate_limit_attempt).copied();
                            rate_limit_attempt += 1;
                            delay
                        }
                        ProviderErrorCode::ApiOverloaded => {
                            let delay = SERVER_ERROR_BACKOFFS_MS.get(server_error_attempt).copied();
                            server_error_attempt += 1;
                            delay
                        }
                        ProviderErrorCode::Timeout if !timeout_retried => {
                            timeout_retried = true;
                            Some(0)
                        }
                        _ => None,
                    };

                    let Some(backoff_ms) = backoff_ms else {
                        return Err(err);
                    };

                    if backoff_ms > 0 {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                            _ = cancel.cancelled() => {
                                return Err(ProviderError {
                                    code: ProviderErrorCode::Unknown,
                                    message: "request cancelled during backoff".to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}

fn to_anthropic_body(request: &CreateMessageRequest) -> Value {
    let messages = request
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": match m.role {
                    conductor_wire::MessageRole::System => "system",
                    conductor_wire::MessageRole::User => "user",
                    conductor_wire::MessageRole::Assistant => "assistant",
                },
                "content": m.blocks.iter().map(content_block_to_wire).collect::<Vec<_>>(),
            })
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": request.model,
        "system": request.system,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });
    if let Some(tools) = &request.tools {
        body["tools"] = json!(tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            }))
            .collect::<Vec<_>>());
    }
    body
}

fn content_block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

fn from_anthropic_body(
    value: &Value,
    model: String,
    elapsed: Duration,
) -> Result<CreateMessageResponse, ProviderError> {
    let blocks = value
        .get("content")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if blocks.is_empty() {
        return Err(ProviderError {
            code: ProviderErrorCode::ResponseEmpty,
            message: "anthropic response contained no content blocks".to_string(),
        });
    }

    let mut text = String::new();
    let mut content_blocks = Vec::new();
    let mut tool_use_blocks = Vec::new();
    for block in &blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                let t = block.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                text.push_str(t);
                content_blocks.push(ContentBlock::Text { text: t.to_string() });
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let tool_block = ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                };
                tool_use_blocks.push(tool_block.clone());
                content_blocks.push(tool_block);
            }
            _ => {}
        }
    }

    let stop_reason_raw = value.get("stop_reason").and_then(|v| v.as_str()).unwrap_or("end_turn");
    let input_tokens = value
        .get("usage")
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = value
        .get("usage")
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(CreateMessageResponse {
        content: text,
        model,
        input_tokens,
        output_tokens,
        stop_reason: StopReason::from_wire_str(stop_reason_raw),
        duration_ms: elapsed.as_millis() as u64,
        tool_use_blocks,
        content_blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_and_overload_and_timeout() {
        assert_eq!(
            provider_error_code(Some(StatusCode::TOO_MANY_REQUESTS), false),
            ProviderErrorCode::RateLimited
        );
        assert_eq!(
            provider_error_code(Some(StatusCode::SERVICE_UNAVAILABLE), false),
            ProviderErrorCode::ApiOverloaded
        );
        assert_eq!(provider_error_code(None, true), ProviderErrorCode::Timeout);
        assert_eq!(
            provider_error_code(Some(StatusCode::BAD_REQUEST), false),
            ProviderErrorCode::ApiError
        );
    }

    #[test]
    fn parses_text_and_tool_use_blocks() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "t1", "name": "web_search__search", "input": {"query": "x"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let response = from_anthropic_body(&raw, "claude-opus".to_string(), Duration::from_millis(42))
            .expect("parses");
        assert_eq!(response.content, "hello");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_use_blocks.len(), 1);
        assert_eq!(response.input_tokens, 10);
        assert_eq!(response.output_tokens, 5);
    }

    #[test]
    fn empty_content_is_response_empty_error() {
        let raw = json!({"content": [], "stop_reason": "end_turn"});
        let err = from_anthropic_body(&raw, "claude-opus".to_string(), Duration::ZERO)
            .expect_err("empty content should error");
        assert_eq!(err.code, ProviderErrorCode::ResponseEmpty);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let client = AnthropicClient::new(AnthropicClientConfig {
            api_key: "test".to_string(),
            base_url: "http://127.0.0.1:1".to_string(),
        });
        let request = CreateMessageRequest {
            model: "claude-opus".to_string(),
            system: "system".to_string(),
            messages: vec![],
            max_tokens: 10,
            timeout_ms: 50,
            tools: None,
        };
        let result = client.create_message(request, CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
