//! HTTP/SSE-backed [`AgentInvoker`] talking to the Anthropic Messages API.
//!
//! Features carried over from the API client this was built from: connection pooling
//! and reuse via a shared [`reqwest::Client`], a token-bucket limiter in front of every
//! request, and exponential-backoff retry for transient failures. What's new is that a
//! single invocation is a *stream*: the request body always sets `stream: true`, and the
//! response's Server-Sent Events are translated into the domain's [`AgentMessage`] union
//! as they arrive rather than buffered into one reply.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client as ReqwestClient, StatusCode};
use std::time::Duration;

use super::rate_limiter::TokenBucketRateLimiter;
use super::retry::RetryPolicy;
use super::streaming::SseEventStream;
use super::types::{Message, MessageRequest};
use crate::domain::error::AgentInvokerError;
use crate::domain::models::{ModelTier, TokenUsage};
use crate::domain::ports::{AgentInvoker, AgentMessage, InvokeRequest, ResultSubtype};

fn model_id(tier: ModelTier) -> &'static str {
    match tier.normalize() {
        ModelTier::Opus => "claude-opus-4-1-20250805",
        ModelTier::Sonnet | ModelTier::Haiku => "claude-sonnet-4-5-20250929",
    }
}

fn error_from_status(status: StatusCode, body: String) -> AgentInvokerError {
    match status {
        StatusCode::BAD_REQUEST => AgentInvokerError::InvalidRequest(body),
        StatusCode::UNAUTHORIZED => AgentInvokerError::InvalidApiKey,
        StatusCode::TOO_MANY_REQUESTS => AgentInvokerError::RateLimited {
            retry_after_secs: None,
        },
        s if s.is_server_error() => AgentInvokerError::ServerError(format!("{status}: {body}")),
        _ => AgentInvokerError::Unknown(format!("{status}: {body}")),
    }
}

pub struct AnthropicInvokerConfig {
    pub api_key: String,
    pub base_url: String,
    pub rate_limit_rps: f64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for AnthropicInvokerConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            base_url: "https://api.anthropic.com".to_string(),
            rate_limit_rps: 10.0,
            max_retries: 3,
            initial_backoff_ms: 10_000,
            max_backoff_ms: 300_000,
            timeout_secs: 300,
            max_tokens: 8192,
        }
    }
}

/// Production [`AgentInvoker`]: one HTTP request per invocation, streamed.
pub struct AnthropicInvoker {
    http_client: ReqwestClient,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    rate_limiter: TokenBucketRateLimiter,
    retry_policy: RetryPolicy,
}

impl AnthropicInvoker {
    pub fn new(api_key: String) -> Result<Self, AgentInvokerError> {
        Self::with_config(AnthropicInvokerConfig {
            api_key,
            ..Default::default()
        })
    }

    pub fn with_config(config: AnthropicInvokerConfig) -> Result<Self, AgentInvokerError> {
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| AgentInvokerError::Unknown(format!("failed to build http client: {e}")))?;

        Ok(Self {
            http_client,
            api_key: config.api_key,
            base_url: config.base_url,
            max_tokens: config.max_tokens,
            rate_limiter: TokenBucketRateLimiter::new(config.rate_limit_rps),
            retry_policy: RetryPolicy::new(
                config.max_retries,
                config.initial_backoff_ms,
                config.max_backoff_ms,
            ),
        })
    }

    async fn open_stream(
        &self,
        request: &MessageRequest,
    ) -> Result<reqwest::Response, AgentInvokerError> {
        let response = self
            .http_client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| AgentInvokerError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        Err(error_from_status(status, body))
    }
}

#[async_trait]
impl AgentInvoker for AnthropicInvoker {
    async fn invoke(
        &self,
        request: InvokeRequest,
    ) -> Result<BoxStream<'static, Result<AgentMessage, AgentInvokerError>>, AgentInvokerError> {
        let body = MessageRequest {
            model: model_id(request.model).to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt.into(),
            }],
            max_tokens: self.max_tokens,
            system: Some(format!(
                "You are operating in the git worktree at {}.",
                request.cwd.display()
            )),
            stream: Some(true),
            ..Default::default()
        };

        self.rate_limiter
            .acquire()
            .await
            .map_err(|e| AgentInvokerError::Unknown(format!("rate limiter: {e}")))?;

        let response = self
            .retry_policy
            .execute(|| self.open_stream(&body))
            .await?;

        Ok(messages_from_sse(SseEventStream::new(response.bytes_stream())).boxed())
    }
}

/// Translate a raw SSE stream into [`AgentMessage`]s, accumulating assistant text and
/// usage across deltas so the final `message_stop` can emit one `Result`.
fn messages_from_sse(
    raw: SseEventStream,
) -> impl futures::Stream<Item = Result<AgentMessage, AgentInvokerError>> {
    struct State {
        stream: SseEventStream,
        text: String,
        usage: TokenUsage,
    }

    let state = State {
        stream: raw,
        text: String::new(),
        usage: TokenUsage::default(),
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            return match state.stream.next().await {
                Some(Ok(event)) => match event.event_type.as_str() {
                    "message_start" => {
                        if let Some(input) = event
                            .data
                            .get("message")
                            .and_then(|m| m.get("usage"))
                            .and_then(|u| u.get("input_tokens"))
                            .and_then(serde_json::Value::as_u64)
                        {
                            state.usage.input = input;
                        }
                        Some((Ok(AgentMessage::Progress { detail: "started".into() }), Some(state)))
                    }
                    "content_block_start" => {
                        if let Some(name) = event
                            .data
                            .get("content_block")
                            .and_then(|b| b.get("name"))
                            .and_then(|n| n.as_str())
                        {
                            Some((Ok(AgentMessage::ToolUse { name: name.to_string() }), Some(state)))
                        } else {
                            continue;
                        }
                    }
                    "content_block_delta" => {
                        if let Some(text) = event
                            .data
                            .get("delta")
                            .and_then(|d| d.get("text"))
                            .and_then(|t| t.as_str())
                        {
                            state.text.push_str(text);
                            let chunk = text.to_string();
                            Some((Ok(AgentMessage::ContentBlock { text: chunk }), Some(state)))
                        } else {
                            continue;
                        }
                    }
                    "message_delta" => {
                        if let Some(output) = event
                            .data
                            .get("usage")
                            .and_then(|u| u.get("output_tokens"))
                            .and_then(serde_json::Value::as_u64)
                        {
                            state.usage.output = output;
                        }
                        continue;
                    }
                    "message_stop" => {
                        let message = AgentMessage::Result {
                            subtype: ResultSubtype::Success,
                            text: state.text,
                            tokens: state.usage,
                        };
                        Some((Ok(message), None))
                    }
                    _ => continue,
                },
                Some(Err(e)) => Some((Err(AgentInvokerError::Unknown(e.to_string())), None)),
                None => None,
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_model_tiers_to_ids() {
        assert_eq!(model_id(ModelTier::Opus), "claude-opus-4-1-20250805");
        assert_eq!(model_id(ModelTier::Sonnet), "claude-sonnet-4-5-20250929");
        assert_eq!(model_id(ModelTier::Haiku), model_id(ModelTier::Sonnet));
    }

    #[test]
    fn maps_status_codes_to_error_classes() {
        assert!(error_from_status(StatusCode::UNAUTHORIZED, String::new()).is_permanent());
        assert!(error_from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert!(error_from_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).is_transient());
    }

    #[test]
    fn builds_with_defaults() {
        let invoker = AnthropicInvoker::new("test-key".to_string());
        assert!(invoker.is_ok());
    }
}
