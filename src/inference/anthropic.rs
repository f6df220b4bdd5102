use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::sse::{data_payload, LineBuffer};
use super::{finish_stream, pricing, send_checked, send_json, token_count, ProviderAdapter};
use crate::error::ProviderError;
use crate::types::{
    FinishReason, GenerationRequest, LlmResponse, ModelInfo, ProviderCapabilities, StreamEvent,
    TokenUsage, ToolCall,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const JSON_INSTRUCTION: &str = "Respond only with a single valid JSON document.";

/// Claude API client via Anthropic's messages endpoint.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_client(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{ "role": "user", "content": request.prompt }],
        });

        // No native JSON mode, so ask for it in the system prompt.
        let system = match (&request.system_prompt, request.json_mode) {
            (Some(s), true) => Some(format!("{s}\n\n{JSON_INSTRUCTION}")),
            (Some(s), false) => Some(s.clone()),
            (None, true) => Some(JSON_INSTRUCTION.to_string()),
            (None, false) => None,
        };
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }

        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(request.stop_sequences);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.clone());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.authed(self.client.post(format!("{}/v1/messages", self.base_url)))
            .header("content-type", "application/json")
            .json(body)
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
            cost: pricing::cost_for(&model, &usage),
            text,
            model,
            provider: "anthropic".into(),
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
        let mut calls: Vec<ToolCall> = Vec::new();
        // content block index -> position in `calls`
        let mut call_blocks: HashMap<u64, usize> = HashMap::new();
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;
        let mut finish = FinishReason::Stop;
        let mut model = request.model.clone();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Request(e.to_string()))?;
            for line in lines.push(&chunk) {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                let event: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "skipping unparsable stream line");
                        continue;
                    }
                };

                match event["type"].as_str().unwrap_or("") {
                    "message_start" => {
                        let message = &event["message"];
                        if let Some(m) = message["model"].as_str() {
                            model = m.to_string();
                        }
                        input_tokens = token_count(&message["usage"]["input_tokens"]);
                    }
                    "content_block_start" => {
                        let block = &event["content_block"];
                        if block["type"] == "tool_use" {
                            let index = event["index"].as_u64().unwrap_or(0);
                            call_blocks.insert(index, calls.len());
                            calls.push(ToolCall::new(
                                block["id"].as_str().unwrap_or(""),
                                block["name"].as_str().unwrap_or(""),
                                "",
                            ));
                        }
                    }
                    "content_block_delta" => {
                        let delta = &event["delta"];
                        match delta["type"].as_str() {
                            Some("text_delta") => {
                                let token = delta["text"].as_str().unwrap_or("");
                                if !token.is_empty() {
                                    text.push_str(token);
                                    let _ = tx.send(StreamEvent::Token(token.to_string())).await;
                                }
                            }
                            Some("input_json_delta") => {
                                let index = event["index"].as_u64().unwrap_or(0);
                                if let Some(&pos) = call_blocks.get(&index) {
                                    calls[pos]
                                        .arguments
                                        .push_str(delta["partial_json"].as_str().unwrap_or(""));
                                    let _ = tx
                                        .send(StreamEvent::ToolCalls {
                                            calls: calls.clone(),
                                            complete: false,
                                        })
                                        .await;
                                }
                            }
                            _ => {}
                        }
                    }
                    "message_delta" => {
                        if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                            finish = map_stop_reason(reason);
                        }
                        if event["usage"]["output_tokens"].is_u64() {
                            output_tokens = token_count(&event["usage"]["output_tokens"]);
                        }
                    }
                    "message_stop" => break 'read,
                    "error" => {
                        return Err(ProviderError::Request(
                            event["error"]["message"]
                                .as_str()
                                .unwrap_or("stream error")
                                .to_string(),
                        ));
                    }
                    _ => {}
                }
            }
        }

        if !calls.is_empty() {
            let _ = tx
                .send(StreamEvent::ToolCalls {
                    calls: calls.clone(),
                    complete: true,
                })
                .await;
        }

        Ok(self.response(
            model,
            text,
            TokenUsage::new(input_tokens, output_tokens),
            finish,
            calls,
        ))
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<LlmResponse, ProviderError> {
        let body = self.build_body(&request, false);
        debug!(model = %request.model, "anthropic messages request");

        let parsed = send_json(self.post(&body)).await?;

        let finish_reason = map_stop_reason(parsed["stop_reason"].as_str().unwrap_or("end_turn"));

        let blocks = parsed["content"]
            .as_array()
            .ok_or_else(|| ProviderError::Parse("response has no content".into()))?;

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text_parts.push(block["text"].as_str().unwrap_or("")),
                Some("tool_use") => tool_calls.push(ToolCall::new(
                    block["id"].as_str().unwrap_or(""),
                    block["name"].as_str().unwrap_or(""),
                    block["input"].to_string(),
                )),
                _ => {}
            }
        }

        let usage = TokenUsage::new(
            token_count(&parsed["usage"]["input_tokens"]),
            token_count(&parsed["usage"]["output_tokens"]),
        );
        let model = parsed["model"]
            .as_str()
            .unwrap_or(&request.model)
            .to_string();

        Ok(self.response(model, text_parts.concat(), usage, finish_reason, tool_calls))
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
        let req = self.authed(self.client.get(format!("{}/v1/models", self.base_url)));
        let parsed = send_json(req).await?;

        let data = parsed["data"]
            .as_array()
            .ok_or_else(|| ProviderError::Parse("model list has no data field".into()))?;

        let caps = self.capabilities();
        Ok(data
            .iter()
            .filter_map(|m| {
                let id = m["id"].as_str()?;
                let (input, output) = pricing::rates(id).unwrap_or((0.0, 0.0));
                Some(ModelInfo {
                    id: id.to_string(),
                    name: m["display_name"].as_str().unwrap_or(id).to_string(),
                    provider: "anthropic".into(),
                    context_window: caps.max_context_window,
                    max_output_tokens: 8192,
                    supports_json: caps.supports_json,
                    supports_images: caps.supports_images,
                    supports_functions: caps.supports_functions,
                    supports_streaming: caps.supports_streaming,
                    input_cost_per_million: input,
                    output_cost_per_million: output,
                })
            })
            .collect())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_streaming: true,
            supports_json: true,
            supports_images: true,
            supports_functions: true,
            max_context_window: 200_000,
        }
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}
