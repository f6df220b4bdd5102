use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::sse::{data_payload, LineBuffer};
use super::{
    finish_stream, function_tools, pricing, send_checked, send_json, token_count, ProviderAdapter,
};
use crate::error::ProviderError;
use crate::types::{
    CostDetails, FinishReason, GenerationRequest, LlmResponse, ModelInfo, ProviderCapabilities,
    StreamEvent, TokenUsage, ToolCall,
};

/// OpenAI-compatible provider. Works with OpenAI, OpenRouter, Groq,
/// Mistral, LM Studio, or any server that implements `/v1/chat/completions`.
pub struct OpenAiAdapter {
    id: String,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    free: bool,
}

impl OpenAiAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            id: "openai".into(),
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            free: false,
        }
    }

    /// Register under a different provider id (e.g. `"openrouter"`).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set an API key (required for OpenAI, OpenRouter, etc.).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Local servers never cost anything.
    pub fn local(mut self) -> Self {
        self.free = true;
        self
    }

    fn build_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !request.stop_sequences.is_empty() {
            body["stop"] = json!(request.stop_sequences);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(p) = request.frequency_penalty {
            body["frequency_penalty"] = json!(p);
        }
        if let Some(p) = request.presence_penalty {
            body["presence_penalty"] = json!(p);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(function_tools(&request.tools));
        }
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        req.json(body)
    }

    fn cost(&self, model: &str, usage: &TokenUsage) -> CostDetails {
        if self.free {
            CostDetails::free()
        } else {
            pricing::cost_for(model, usage)
        }
    }

    fn response(
        &self,
        model: String,
        text: String,
        usage: TokenUsage,
        finish_reason: FinishReason,
        tool_calls: Vec<ToolCall>,
    ) -> LlmResponse {
        LlmResponse {
            cost: self.cost(&model, &usage),
            text,
            model,
            provider: self.id.clone(),
            usage,
            finish_reason,
            tool_calls,
            metadata: Value::Null,
        }
    }

    async fn stream_inner(
        &self,
        request: &GenerationRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<LlmResponse, ProviderError> {
        let body = self.build_body(request, true);
        let resp = send_checked(self.post(&body)).await?;

        let mut bytes = resp.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut text = String::new();
        let mut calls = ToolCallDeltas::default();
        let mut usage = TokenUsage::default();
        let mut finish = None;
        let mut model = request.model.clone();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Request(e.to_string()))?;
            for line in lines.push(&chunk) {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }
                let parsed: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "skipping unparsable stream line");
                        continue;
                    }
                };

                if let Some(m) = parsed["model"].as_str() {
                    model = m.to_string();
                }
                if parsed["usage"].is_object() {
                    usage = parse_usage(&parsed["usage"]);
                }

                let choice = &parsed["choices"][0];
                if let Some(reason) = choice["finish_reason"].as_str() {
                    finish = Some(map_finish_reason(reason));
                }

                let delta = &choice["delta"];
                if let Some(token) = delta["content"].as_str() {
                    if !token.is_empty() {
                        text.push_str(token);
                        let _ = tx.send(StreamEvent::Token(token.to_string())).await;
                    }
                }
                if let Some(deltas) = delta["tool_calls"].as_array() {
                    for d in deltas {
                        calls.apply(d);
                    }
                    let _ = tx
                        .send(StreamEvent::ToolCalls {
                            calls: calls.snapshot(),
                            complete: false,
                        })
                        .await;
                }
            }
        }

        let tool_calls = calls.snapshot();
        if !tool_calls.is_empty() {
            let _ = tx
                .send(StreamEvent::ToolCalls {
                    calls: tool_calls.clone(),
                    complete: true,
                })
                .await;
        }

        let finish_reason = finish.unwrap_or(if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });
        Ok(self.response(model, text, usage, finish_reason, tool_calls))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, request: GenerationRequest) -> Result<LlmResponse, ProviderError> {
        let body = self.build_body(&request, false);
        debug!(provider = %self.id, model = %request.model, "chat completion request");

        let parsed = send_json(self.post(&body)).await?;

        let choice = &parsed["choices"][0];
        let message = &choice["message"];
        if !message.is_object() {
            return Err(ProviderError::Parse("response contained no choices".into()));
        }

        let tool_calls: Vec<ToolCall> = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|tc| {
                        ToolCall::new(
                            tc["id"].as_str().unwrap_or(""),
                            tc["function"]["name"].as_str().unwrap_or(""),
                            tc["function"]["arguments"].as_str().unwrap_or("{}"),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let text = match message["content"].as_str() {
            Some(t) => t.to_string(),
            None if !tool_calls.is_empty() => String::new(),
            None => return Err(ProviderError::Parse("message has no content".into())),
        };

        let finish_reason = map_finish_reason(choice["finish_reason"].as_str().unwrap_or("stop"));
        let model = parsed["model"]
            .as_str()
            .unwrap_or(&request.model)
            .to_string();

        Ok(self.response(model, text, parse_usage(&parsed["usage"]), finish_reason, tool_calls))
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<LlmResponse, ProviderError> {
        let result = self.stream_inner(&request, &tx).await;
        finish_stream(&tx, result).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let mut req = self.client.get(format!("{}/v1/models", self.base_url));
        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        let parsed = send_json(req).await?;

        let data = parsed["data"]
            .as_array()
            .ok_or_else(|| ProviderError::Parse("model list has no data field".into()))?;

        let caps = self.capabilities();
        let mut models: Vec<ModelInfo> = data
            .iter()
            .filter_map(|m| m["id"].as_str())
            .map(|id| {
                let (input, output) = if self.free {
                    (0.0, 0.0)
                } else {
                    pricing::rates(id).unwrap_or((0.0, 0.0))
                };
                ModelInfo {
                    id: id.to_string(),
                    name: id.to_string(),
                    provider: self.id.clone(),
                    context_window: caps.max_context_window,
                    max_output_tokens: 16_384,
                    supports_json: caps.supports_json,
                    supports_images: caps.supports_images,
                    supports_functions: caps.supports_functions,
                    supports_streaming: caps.supports_streaming,
                    input_cost_per_million: input,
                    output_cost_per_million: output,
                }
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_streaming: true,
            supports_json: true,
            supports_images: true,
            supports_functions: true,
            max_context_window: 128_000,
        }
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "stop" => FinishReason::Stop,
        other => {
            debug!(finish_reason = %other, "unknown finish_reason, treating as stop");
            FinishReason::Stop
        }
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let prompt = token_count(&usage["prompt_tokens"]);
    let completion = token_count(&usage["completion_tokens"]);
    let mut parsed = TokenUsage::new(prompt, completion);
    if usage["total_tokens"].is_u64() {
        parsed.total_tokens = token_count(&usage["total_tokens"]);
    }
    parsed
}

/// Highest `index` accepted in a tool-call delta.
const MAX_TOOL_CALL_INDEX: usize = 128;

/// Tool calls arrive as fragments keyed by `index`: the first fragment
/// carries id and name, later ones append to the argument string.
#[derive(Default)]
struct ToolCallDeltas {
    calls: Vec<ToolCall>,
}

impl ToolCallDeltas {
    fn apply(&mut self, delta: &Value) {
        let raw = delta["index"].as_u64().unwrap_or(0);
        let index = match usize::try_from(raw) {
            Ok(index) if index <= MAX_TOOL_CALL_INDEX => index,
            _ => {
                debug!(index = raw, "skipping tool call delta with out-of-range index");
                return;
            }
        };
        if self.calls.len() <= index {
            self.calls.resize_with(index + 1, ToolCall::default);
        }
        let call = &mut self.calls[index];
        if let Some(id) = delta["id"].as_str() {
            call.id = id.to_string();
        }
        if let Some(name) = delta["function"]["name"].as_str() {
            call.name.push_str(name);
        }
        if let Some(args) = delta["function"]["arguments"].as_str() {
            call.arguments.push_str(args);
        }
    }

    fn snapshot(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter(|c| !c.name.is_empty())
            .cloned()
            .collect()
    }
}
