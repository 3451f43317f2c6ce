//! HTTP transport for the two local-LLM API dialects: OpenAI-compatible
//! `/chat/completions` and Ollama-native `/api/chat`. Retries transient
//! failures with exponential backoff and halves `num_ctx` on an Ollama OOM.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use thiserror::Error;

use super::middleware::{LLMRequest, LlmCaller};
use super::response_parser::{extract_thinking, parse_tool_calls_from_text, NativeToolCallAccumulator, StreamEvent, StreamProcessor};
use crate::harness::types::{LLMResponse, ToolCall, Usage};

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 1;

const OOM_KEYWORDS: [&str; 7] = [
    "out of memory",
    "oom",
    "exit status 2",
    "not enough memory",
    "alloc",
    "unexpectedly stopped",
    "resource limitations",
];

fn is_oom_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    OOM_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Errors that cross the transport boundary. Handlers that just need to
/// propagate use `anyhow::Result`; this is for call sites that branch on
/// *why* a request failed (e.g. deciding whether to shrink the context).
#[derive(Debug, Error)]
pub enum LlmTransportError {
    #[error("LLM API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("LLM API returned a client error: {0}")]
    ClientError(String),
    #[error("exhausted {0} retries against {1}")]
    RetriesExhausted(u32, String),
}

/// Which dialect a [`ProfileSpec`] speaks. Ollama's native API drops the
/// `/v1` suffix and uses `/api/chat` instead of `/chat/completions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    OpenAi,
    Ollama,
}

/// Connection details for one model endpoint, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ProfileSpec {
    pub url: String,
    pub api_key: String,
    pub api_type: ApiType,
    pub extra_params: serde_json::Map<String, Value>,
    /// Model names by tier, smallest/fastest first. Always non-empty.
    pub models: Vec<String>,
}

impl ProfileSpec {
    pub fn from_env() -> Self {
        let cfg = crate::harness::config::LlmConfig::from_env();
        let api_type = if cfg.api_base.contains("11434") || cfg.api_base.contains("ollama") {
            ApiType::Ollama
        } else {
            ApiType::OpenAi
        };
        let models = std::env::var("SKILLLITE_MODEL_TIERS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect::<Vec<_>>())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec![cfg.model.clone()]);
        Self { url: cfg.api_base, api_key: cfg.api_key, api_type, extra_params: serde_json::Map::new(), models }
    }

    pub fn model_for_tier(&self, tier: usize) -> String {
        self.models.get(tier).cloned().unwrap_or_else(|| self.models.last().cloned().unwrap_or_default())
    }

    pub fn tier_count(&self) -> usize {
        self.models.len()
    }

    /// The model one tier above `current`, or `current` unchanged if it's
    /// already the top (or unrecognized) tier. Used by the error-recovery
    /// middleware's `EscalateModel` strategy.
    pub fn next_tier_model(&self, current: &str) -> String {
        let tier = self.models.iter().position(|m| m == current).unwrap_or(0);
        let next = (tier + 1).min(self.models.len().saturating_sub(1));
        self.models.get(next).cloned().unwrap_or_else(|| current.to_string())
    }
}

/// Async client for OpenAI-compatible and Ollama-native LLM APIs.
pub struct AsyncLlmClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    profile: ProfileSpec,
    base_url: String,
    last_response: Mutex<Option<LLMResponse>>,
}

impl AsyncLlmClient {
    pub fn new(profile: ProfileSpec) -> Self {
        let base_url = match profile.api_type {
            ApiType::Ollama => profile.url.trim_end_matches('/').trim_end_matches("/v1").to_string(),
            ApiType::OpenAi => profile.url.trim_end_matches('/').to_string(),
        };
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client");
        let stream_http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build streaming HTTP client");
        Self { http, stream_http, profile, base_url, last_response: Mutex::new(None) }
    }

    fn auth_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", self.profile.api_key).parse().unwrap(),
        );
        headers
    }

    pub async fn chat(&self, request: &LLMRequest) -> LLMResponse {
        match self.profile.api_type {
            ApiType::Ollama => self.chat_ollama(request).await,
            ApiType::OpenAi => self.chat_openai(request).await,
        }
    }

    async fn chat_openai(&self, request: &LLMRequest) -> LLMResponse {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                payload["tools"] = json!(tools);
                if let Some(choice) = &request.tool_choice {
                    payload["tool_choice"] = json!(choice);
                }
            }
        }
        merge_extra(&mut payload, &self.profile.extra_params);

        let start = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            let resp = self
                .http
                .post(format!("{}/chat/completions", self.base_url))
                .headers(self.auth_headers())
                .json(&payload)
                .send()
                .await;

            match resp {
                Ok(resp) if is_retryable_status(resp.status()) => {
                    last_error = format!("status {}", resp.status());
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                    continue;
                }
                Ok(resp) if !resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if (400..500).contains(&status.as_u16()) && status.as_u16() != 429 {
                        return error_response(format!("LLM API Error: {status}: {body}"));
                    }
                    last_error = format!("{status}: {body}");
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                }
                Ok(resp) => {
                    let data: Value = match resp.json().await {
                        Ok(v) => v,
                        Err(_) => return error_response("LLM API Error: invalid JSON response"),
                    };
                    return parse_openai_response(data, &request.model, start.elapsed().as_millis() as u64);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                }
            }
        }
        error_response(format!("LLM API Error: {last_error}"))
    }

    async fn chat_ollama(&self, request: &LLMRequest) -> LLMResponse {
        let mut options = json!({
            "temperature": request.temperature,
            "num_predict": request.max_tokens,
        });
        if request.context_length > 0 {
            options["num_ctx"] = json!(request.context_length);
        }
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": false,
            "options": options,
        });
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                payload["tools"] = json!(tools);
            }
        }
        merge_extra(&mut payload, &self.profile.extra_params);

        let start = Instant::now();
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRIES {
            let resp = self
                .http
                .post(format!("{}/api/chat", self.base_url))
                .headers(self.auth_headers())
                .json(&payload)
                .send()
                .await;

            match resp {
                Ok(resp) if is_retryable_status(resp.status()) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if status.as_u16() == 500 && is_oom_error(&body) {
                        shrink_num_ctx(&mut payload);
                    }
                    last_error = format!("{status}: {body}");
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                }
                Ok(resp) if !resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if (400..500).contains(&status.as_u16()) && status.as_u16() != 429 {
                        return error_response(format!("Ollama API Error: {status}: {body}"));
                    }
                    last_error = format!("{status}: {body}");
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                }
                Ok(resp) => {
                    let data: Value = match resp.json().await {
                        Ok(v) => v,
                        Err(_) => return error_response("Ollama API Error: invalid JSON"),
                    };
                    return parse_ollama_response(data, &request.model, start.elapsed().as_millis() as u64);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                }
            }
        }
        error_response(format!("Ollama API Error: {last_error}"))
    }

    /// Stream a completion, returning the surfaced events in order. The
    /// terminal [`LLMResponse`] is retained and fetched with
    /// [`AsyncLlmClient::last_response`].
    pub async fn chat_stream(&self, request: &LLMRequest) -> anyhow::Result<Vec<StreamEvent>> {
        match self.profile.api_type {
            ApiType::Ollama => self.chat_stream_ollama(request).await,
            ApiType::OpenAi => self.chat_stream_openai(request).await,
        }
    }

    async fn chat_stream_openai(&self, request: &LLMRequest) -> anyhow::Result<Vec<StreamEvent>> {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                payload["tools"] = json!(tools);
            }
        }
        merge_extra(&mut payload, &self.profile.extra_params);

        let start = Instant::now();
        let mut events = Vec::new();
        let mut chunks_yielded = false;
        let known_tools = request_tool_names(request);

        for attempt in 0..MAX_RETRIES {
            let mut processor = StreamProcessor::new();
            let mut native_tc = NativeToolCallAccumulator::new();
            let mut model_name = request.model.clone();
            let mut usage = None;

            let resp = self
                .stream_http
                .post(format!("{}/chat/completions", self.base_url))
                .headers(self.auth_headers())
                .json(&payload)
                .send()
                .await?;

            if is_retryable_status(resp.status()) {
                tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                continue;
            }
            if !resp.status().is_success() {
                anyhow::bail!("LLM API error ({}): {}", resp.status(), resp.text().await.unwrap_or_default());
            }

            let mut buffer = String::new();
            let mut stream = resp.bytes_stream();
            let mut transport_error: Option<String> = None;

            'lines: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        transport_error = Some(e.to_string());
                        break 'lines;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if !line.starts_with("data: ") {
                        continue;
                    }
                    let data_str = line[6..].trim();
                    if data_str == "[DONE]" {
                        break 'lines;
                    }
                    let Ok(data) = serde_json::from_str::<Value>(data_str) else { continue };
                    if let Some(m) = data.get("model").and_then(Value::as_str) {
                        model_name = m.to_string();
                    }
                    if let Some(u) = data.get("usage") {
                        if !u.is_null() {
                            usage = serde_json::from_value(u.clone()).ok();
                        }
                    }
                    if let Some(choice) = data.get("choices").and_then(Value::as_array).and_then(|c| c.first()) {
                        let Some(delta) = choice.get("delta") else { continue };
                        native_tc.feed(delta);
                        if let Some(text) = delta.get("content").and_then(Value::as_str) {
                            if !text.is_empty() {
                                for event in processor.feed(text) {
                                    chunks_yielded = true;
                                    events.push(event);
                                }
                            }
                        }
                    }
                }
            }

            if let Some(e) = transport_error {
                if chunks_yielded {
                    *self.last_response.lock().unwrap() = Some(LLMResponse {
                        content: format!("[LLM API Error: stream interrupted: {e}]"),
                        finish_reason: Some("error".to_string()),
                        latency_ms: start.elapsed().as_millis() as u64,
                        ..Default::default()
                    });
                    return Ok(events);
                }
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(std::time::Duration::from_secs(BACKOFF_BASE_SECS << attempt)).await;
                    continue;
                }
                anyhow::bail!("LLM stream error: {e}");
            }

            let (thinking, content, mut tool_calls) = processor.finish(&known_tools);
            if native_tc.has_calls() {
                let mut native = native_tc.finalize();
                native.append(&mut tool_calls);
                tool_calls = native;
            }
            *self.last_response.lock().unwrap() = Some(LLMResponse {
                content,
                thinking: if thinking.is_empty() { None } else { Some(thinking) },
                tool_calls,
                finish_reason: Some("stop".to_string()),
                usage,
                model: model_name,
                raw_response: None,
                latency_ms: start.elapsed().as_millis() as u64,
            });
            return Ok(events);
        }
        anyhow::bail!("LLM stream exhausted retries")
    }

    async fn chat_stream_ollama(&self, request: &LLMRequest) -> anyhow::Result<Vec<StreamEvent>> {
        let mut options = json!({
            "temperature": request.temperature,
            "num_predict": request.max_tokens,
        });
        if request.context_length > 0 {
            options["num_ctx"] = json!(request.context_length);
        }
        let payload = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
            "options": options,
        });

        let start = Instant::now();
        let mut events = Vec::new();
        let known_tools = request_tool_names(request);

        let resp = self
            .stream_http
            .post(format!("{}/api/chat", self.base_url))
            .headers(self.auth_headers())
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Ollama stream error ({}): {}", resp.status(), resp.text().await.unwrap_or_default());
        }

        let mut processor = StreamProcessor::new();
        let mut model_name = request.model.clone();
        let mut usage = None;
        let mut buffer = String::new();
        let mut stream = resp.bytes_stream();

        'lines: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer = buffer[pos + 1..].to_string();
                if line.is_empty() {
                    continue;
                }
                let Ok(data) = serde_json::from_str::<Value>(&line) else { continue };
                if let Some(m) = data.get("model").and_then(Value::as_str) {
                    model_name = m.to_string();
                }
                if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    usage = ollama_usage(&data);
                    break 'lines;
                }
                if let Some(text) = data.get("message").and_then(|m| m.get("content")).and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.extend(processor.feed(text));
                    }
                }
            }
        }

        let (thinking, content, tool_calls) = processor.finish(&known_tools);
        *self.last_response.lock().unwrap() = Some(LLMResponse {
            content,
            thinking: if thinking.is_empty() { None } else { Some(thinking) },
            tool_calls,
            finish_reason: Some("stop".to_string()),
            usage,
            model: model_name,
            raw_response: None,
            latency_ms: start.elapsed().as_millis() as u64,
        });
        Ok(events)
    }

    pub fn last_response(&self) -> Option<LLMResponse> {
        self.last_response.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmCaller for AsyncLlmClient {
    async fn call(&self, request: LLMRequest) -> anyhow::Result<LLMResponse> {
        Ok(self.chat(&request).await)
    }
}

fn request_tool_names(request: &LLMRequest) -> Vec<String> {
    let Some(tools) = &request.tools else { return Vec::new() };
    tools
        .iter()
        .filter_map(|t| {
            t.get("function").and_then(|f| f.get("name")).or_else(|| t.get("name")).and_then(Value::as_str).map(str::to_string)
        })
        .collect()
}

fn merge_extra(payload: &mut Value, extra: &serde_json::Map<String, Value>) {
    if let Some(obj) = payload.as_object_mut() {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
}

fn shrink_num_ctx(payload: &mut Value) {
    let current = payload["options"]["num_ctx"].as_u64().unwrap_or(0);
    if current > 8192 {
        payload["options"]["num_ctx"] = json!(current / 2);
    }
}

fn error_response(content: impl Into<String>) -> LLMResponse {
    LLMResponse { content: content.into(), finish_reason: Some("error".to_string()), ..Default::default() }
}

fn parse_openai_response(data: Value, fallback_model: &str, latency_ms: u64) -> LLMResponse {
    let Some(choice) = data.get("choices").and_then(Value::as_array).and_then(|c| c.first()) else {
        return error_response("LLM API Error: empty choices");
    };
    let message = choice.get("message").cloned().unwrap_or(Value::Null);
    let raw_content = message.get("content").and_then(Value::as_str).unwrap_or("");
    let finish = choice.get("finish_reason").and_then(Value::as_str).map(str::to_string);
    let (thinking, clean_content) = extract_thinking(raw_content);

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(native) = message.get("tool_calls").and_then(Value::as_array) {
        for tc in native {
            let func = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = func.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let args_str = func.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments = serde_json::from_str::<Value>(args_str).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default();
            tool_calls.push(ToolCall { name, arguments, raw: tc.to_string() });
        }
    }
    if tool_calls.is_empty() && !clean_content.is_empty() {
        tool_calls = parse_tool_calls_from_text(&clean_content, &[]);
    }

    LLMResponse {
        content: clean_content,
        thinking: if thinking.is_empty() { None } else { Some(thinking) },
        tool_calls,
        finish_reason: finish,
        usage: data.get("usage").and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok()),
        model: data.get("model").and_then(Value::as_str).unwrap_or(fallback_model).to_string(),
        raw_response: Some(data),
        latency_ms,
    }
}

fn ollama_usage(data: &Value) -> Option<Usage> {
    let prompt = data.get("prompt_eval_count").and_then(Value::as_u64);
    let completion = data.get("eval_count").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    let prompt = prompt.unwrap_or(0);
    let completion = completion.unwrap_or(0);
    Some(Usage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion })
}

fn parse_ollama_response(data: Value, fallback_model: &str, latency_ms: u64) -> LLMResponse {
    let message = data.get("message").cloned().unwrap_or(Value::Null);
    let raw_content = message.get("content").and_then(Value::as_str).unwrap_or("");
    let (thinking, clean_content) = extract_thinking(raw_content);

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    if let Some(native) = message.get("tool_calls").and_then(Value::as_array) {
        for tc in native {
            let func = tc.get("function").cloned().unwrap_or(Value::Null);
            let name = func.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let arguments = match func.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok().and_then(|v| v.as_object().cloned()).unwrap_or_default(),
                Some(Value::Object(map)) => map.clone(),
                _ => serde_json::Map::new(),
            };
            tool_calls.push(ToolCall { name, arguments, raw: tc.to_string() });
        }
    }
    if tool_calls.is_empty() && !clean_content.is_empty() {
        tool_calls = parse_tool_calls_from_text(&clean_content, &[]);
    }

    LLMResponse {
        content: clean_content,
        thinking: if thinking.is_empty() { None } else { Some(thinking) },
        tool_calls,
        finish_reason: data.get("done_reason").and_then(Value::as_str).map(str::to_string).or_else(|| Some("stop".to_string())),
        usage: ollama_usage(&data),
        model: data.get("model").and_then(Value::as_str).unwrap_or(fallback_model).to_string(),
        raw_response: Some(data),
        latency_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiered_profile() -> ProfileSpec {
        ProfileSpec {
            url: "http://localhost:11434/v1".into(),
            api_key: String::new(),
            api_type: ApiType::Ollama,
            extra_params: serde_json::Map::new(),
            models: vec!["small".into(), "medium".into(), "large".into()],
        }
    }

    #[test]
    fn next_tier_model_steps_up_one_tier() {
        let profile = tiered_profile();
        assert_eq!(profile.next_tier_model("small"), "medium");
        assert_eq!(profile.next_tier_model("medium"), "large");
    }

    #[test]
    fn next_tier_model_stays_at_the_top() {
        let profile = tiered_profile();
        assert_eq!(profile.next_tier_model("large"), "large");
    }

    #[test]
    fn next_tier_model_unknown_current_escalates_from_the_bottom() {
        let profile = tiered_profile();
        assert_eq!(profile.next_tier_model("unknown-model"), "medium");
    }

    #[test]
    fn detects_oom_keywords() {
        assert!(is_oom_error("CUDA out of memory"));
        assert!(is_oom_error("model runner process exited: exit status 2"));
        assert!(!is_oom_error("connection refused"));
    }

    #[test]
    fn shrinks_num_ctx_only_above_floor() {
        let mut payload = json!({"options": {"num_ctx": 16384}});
        shrink_num_ctx(&mut payload);
        assert_eq!(payload["options"]["num_ctx"], json!(8192));

        let mut at_floor = json!({"options": {"num_ctx": 8192}});
        shrink_num_ctx(&mut at_floor);
        assert_eq!(at_floor["options"]["num_ctx"], json!(8192));
    }

    #[test]
    fn parses_openai_response_with_tool_call() {
        let data = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"name": "read_file", "arguments": "{\"path\": \"a\"}"}}],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let response = parse_openai_response(data, "gpt-4o", 10);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "read_file");
    }

    #[test]
    fn parses_ollama_response_with_string_arguments() {
        let data = json!({
            "model": "qwen2.5:7b",
            "message": {
                "content": "",
                "tool_calls": [{"function": {"name": "shell", "arguments": "{\"command\": \"ls\"}"}}],
            },
            "done_reason": "stop",
        });
        let response = parse_ollama_response(data, "qwen2.5:7b", 5);
        assert_eq!(response.tool_calls[0].name, "shell");
        assert_eq!(response.tool_calls[0].arguments.get("command").unwrap(), "ls");
    }
}
