//! StatelessLLMNode: one OpenAI-compatible chat completion per `execute`
//! (spec.md §4.2). Two concrete subkinds (OpenRouter, GLM) differ only in
//! defaults/headers (spec.md §3 "Node (abstract)").

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::context::ExecutionContext;
use crate::error::ErrorType;
use crate::node::llm::{messages_from_input, Usage};
use crate::node::{check_preconditions, ExecError, Node};
use crate::result::NodeResult;

/// Provider-specific defaults/headers (spec.md §3: "two concrete subkinds
/// differ only in defaults/headers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenRouter,
    Glm,
}

#[derive(Debug, Clone, Default)]
pub struct OpenRouterDefaults;

#[derive(Debug, Clone, Default)]
pub struct GlmDefaults {
    /// GLM may inject reasoning-mode flags (spec.md §4.2 step 1).
    pub thinking: bool,
}

/// Exponential-backoff retry policy for `StatelessLLMNode`'s HTTP POST
/// (spec.md §4.2 step 3): `base · 2^attempt` capped at `max_delay`, up to
/// `max_retries` attempts, on 429/500/502/503/504.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << attempt.min(16));
        Duration::from_millis(scaled.min(self.max_delay.as_millis()) as u64)
    }

    fn is_retryable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }
}

pub struct StatelessLLMNode {
    id: String,
    provider: Provider,
    model: String,
    api_key: String,
    base_url: String,
    timeout: Duration,
    retry: RetryConfig,
    glm_thinking: bool,
    client: OnceCell<reqwest::Client>,
}

impl StatelessLLMNode {
    pub fn new(id: impl Into<String>, provider: Provider, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = match provider {
            Provider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
            Provider::Glm => "https://open.bigmodel.cn/api/paas/v4/chat/completions",
        }
        .to_string();
        Self {
            id: id.into(),
            provider,
            model: model.into(),
            api_key: api_key.into(),
            base_url,
            timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            glm_thinking: false,
            client: OnceCell::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_glm_thinking(mut self, thinking: bool) -> Self {
        self.glm_thinking = thinking;
        self
    }

    async fn client(&self) -> Result<&reqwest::Client, String> {
        self.client
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| e.to_string())
            })
            .await
    }

    /// Composes the request body: model, messages, provider defaults, then
    /// caller-supplied extra parameters override those defaults (spec.md
    /// §4.2 step 1).
    fn build_request(&self, messages: &[Value], extra: &Value) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if self.provider == Provider::Glm && self.glm_thinking {
            body["thinking"] = json!({"type": "enabled"});
        }
        if let Value::Object(extra_obj) = extra {
            if let Value::Object(body_obj) = &mut body {
                for (k, v) in extra_obj {
                    body_obj.insert(k.clone(), v.clone());
                }
            }
        }
        body
    }

    /// Reproducible trace id derived from a hash of the request body
    /// (SPEC_FULL.md §C.6, original_source `RequestTracer`).
    fn trace_id(body: &Value) -> String {
        let mut hasher = DefaultHasher::new();
        body.to_string().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[async_trait]
impl Node for StatelessLLMNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &str {
        match self.provider {
            Provider::OpenRouter => "openrouter",
            Provider::Glm => "glm",
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<NodeResult, ExecError> {
        check_preconditions(ctx)?;
        let input = ctx.input.clone();
        let (messages, extra) = messages_from_input(&input);
        let messages_json: Vec<Value> = messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect();
        let body = self.build_request(&messages_json, &extra);
        let trace_id = Self::trace_id(&body);
        tracing::info!(node_id = %self.id, trace_id = %trace_id, "llm request composed");

        let client = match self.client().await {
            Ok(c) => c,
            Err(e) => {
                return Ok(NodeResult::err(self.node_type(), &self.id, input, e, ErrorType::InternalError));
            }
        };

        let mut attempt = 0u32;
        loop {
            let send = client
                .post(&self.base_url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .timeout(ctx.timeout.unwrap_or(self.timeout))
                .send()
                .await;

            match send {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status >= 200 && status < 300 {
                        let parsed: Value = match resp.json().await {
                            Ok(v) => v,
                            Err(e) => {
                                return Ok(NodeResult::err(
                                    self.node_type(),
                                    &self.id,
                                    input,
                                    format!("invalid response body: {e}"),
                                    ErrorType::InternalError,
                                ));
                            }
                        };
                        return Ok(self.build_success(input, parsed, trace_id, attempt));
                    }

                    let body_text = resp.text().await.unwrap_or_default();
                    if RetryConfig::is_retryable_status(status) && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        tracing::warn!(node_id = %self.id, attempt, status, "retrying llm request after {delay:?}");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let error_type = ErrorType::from_status(status);
                    return Ok(NodeResult::err(
                        self.node_type(),
                        &self.id,
                        input,
                        format!("http {status}: {body_text}"),
                        error_type,
                    )
                    .with_attributes(json!({"trace_id": trace_id, "retries": attempt, "status": status})));
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Ok(NodeResult::err(
                            self.node_type(),
                            &self.id,
                            input,
                            e.to_string(),
                            ErrorType::Timeout,
                        ));
                    }
                    if attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        tracing::warn!(node_id = %self.id, attempt, "retrying llm request after network error: {e}");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(NodeResult::err(
                        self.node_type(),
                        &self.id,
                        input,
                        e.to_string(),
                        ErrorType::NetworkError,
                    ));
                }
            }
        }
    }
}

impl StatelessLLMNode {
    fn build_success(&self, input: Value, parsed: Value, trace_id: String, retries: u32) -> NodeResult {
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let finish_reason = parsed["choices"][0]["finish_reason"].as_str().unwrap_or("stop").to_string();
        let usage: Usage = serde_json::from_value(parsed["usage"].clone()).unwrap_or_default();
        NodeResult::ok(self.node_type(), &self.id, input, Value::String(content)).with_attributes(json!({
            "usage": usage,
            "model": self.model,
            "finish_reason": finish_reason,
            "retries": retries,
            "trace_id": trace_id,
            "raw_message": parsed["choices"][0]["message"],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_backs_off_exponentially_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn retryable_statuses_match_spec() {
        for s in [429, 500, 502, 503, 504] {
            assert!(RetryConfig::is_retryable_status(s), "{s} should be retryable");
        }
        for s in [200, 400, 401, 403, 404] {
            assert!(!RetryConfig::is_retryable_status(s), "{s} should not be retryable");
        }
    }

    #[test]
    fn trace_id_is_reproducible_for_identical_bodies() {
        let body = json!({"model": "x", "messages": []});
        assert_eq!(StatelessLLMNode::trace_id(&body), StatelessLLMNode::trace_id(&body));
    }

    #[test]
    fn build_request_applies_extra_overrides_over_defaults() {
        let node = StatelessLLMNode::new("llm", Provider::Glm, "glm-4", "key").with_glm_thinking(true);
        let extra = json!({"thinking": {"type": "disabled"}, "temperature": 0.2});
        let body = node.build_request(&[], &extra);
        assert_eq!(body["thinking"]["type"], "disabled");
        assert_eq!(body["temperature"], 0.2);
    }
}
