use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::sse::LineBuffer;
use super::{
    finish_stream, function_tools, send_checked, send_json, token_count, ProviderAdapter,
};
use crate::error::ProviderError;
use crate::types::{
    CostDetails, FinishReason, GenerationRequest, LlmResponse, ModelInfo, ProviderCapabilities,
    StreamEvent, TokenUsage, ToolCall,
};

/// Ollama provider using the native `/api/chat` endpoint. Local, so every
/// generation costs zero.
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaAdapter {
    /// Connect to a local Ollama instance at the default address.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "http://localhost:11434".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
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

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(function_tools(&request.tools));
        }
        if request.json_mode {
            body["format"] = json!("json");
        }

        let mut options = serde_json::Map::new();
        if let Some(max) = request.max_tokens {
            options.insert("num_predict".into(), json!(max));
        }
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            options.insert("top_p".into(), json!(p));
        }
        if !request.stop_sequences.is_empty() {
            options.insert("stop".into(), json!(request.stop_sequences));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/api/chat", self.base_url))
            .header("content-type", "application/json")
            .json(body)
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
        let mut calls = Vec::new();
        let mut last: Option<Value> = None;

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Request(e.to_string()))?;
            for line in lines.push(&chunk) {
                apply_line(&line, &mut text, &mut calls, &mut last, tx).await?;
            }
        }
        if let Some(tail) = lines.finish() {
            apply_line(&tail, &mut text, &mut calls, &mut last, tx).await?;
        }

        if !calls.is_empty() {
            let _ = tx
                .send(StreamEvent::ToolCalls {
                    calls: calls.clone(),
                    complete: true,
                })
                .await;
        }

        let last = last.unwrap_or(Value::Null);
        Ok(build_response(&last, &request.model, text, calls))
    }
}

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Newline-delimited JSON, one object per line. The final object has
/// `done: true`. Returns the new token, if any, and the parsed line.
/// Forward one NDJSON line. An `error` object ends the stream.
async fn apply_line(
    line: &str,
    text: &mut String,
    calls: &mut Vec<ToolCall>,
    last: &mut Option<Value>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<(), ProviderError> {
    let Some((token, parsed)) = handle_line(line, text, calls) else {
        return Ok(());
    };
    if let Some(token) = token {
        let _ = tx.send(StreamEvent::Token(token)).await;
    }
    if let Some(err) = parsed["error"].as_str() {
        return Err(ProviderError::Request(err.to_string()));
    }
    if parsed["done"].as_bool() == Some(true) {
        *last = Some(parsed);
    }
    Ok(())
}

fn handle_line(
    line: &str,
    text: &mut String,
    calls: &mut Vec<ToolCall>,
) -> Option<(Option<String>, Value)> {
    if line.trim().is_empty() {
        return None;
    }
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping unparsable stream line");
            return None;
        }
    };
    let token = parsed["message"]["content"]
        .as_str()
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    if let Some(ref t) = token {
        text.push_str(t);
    }
    let offset = calls.len();
    calls.extend(parse_tool_calls(&parsed["message"], offset));
    Some((token, parsed))
}

/// Ollama doesn't return tool call ids, so they are generated from the
/// call's position.
fn parse_tool_calls(message: &Value, offset: usize) -> Vec<ToolCall> {
    message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(i, tc)| {
                    let name = tc["function"]["name"].as_str().unwrap_or("");
                    let arguments = match &tc["function"]["arguments"] {
                        Value::String(s) => s.clone(),
                        Value::Null => "{}".to_string(),
                        other => other.to_string(),
                    };
                    ToolCall::new(format!("ollama_{}_{}", name, offset + i), name, arguments)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn build_response(parsed: &Value, model: &str, text: String, tool_calls: Vec<ToolCall>) -> LlmResponse {
    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else if parsed["done_reason"].as_str() == Some("length") {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };

    LlmResponse {
        text,
        model: parsed["model"].as_str().unwrap_or(model).to_string(),
        provider: "ollama".into(),
        usage: TokenUsage::new(
            token_count(&parsed["prompt_eval_count"]),
            token_count(&parsed["eval_count"]),
        ),
        cost: CostDetails::free(),
        finish_reason,
        tool_calls,
        metadata: json!({
            "total_duration": parsed["total_duration"],
        }),
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<LlmResponse, ProviderError> {
        let body = self.build_body(&request, false);
        debug!(model = %request.model, "ollama chat request");

        let parsed = send_json(self.post(&body)).await?;

        let message = &parsed["message"];
        let text = message["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Parse("response has no message content".into()))?
            .to_string();
        let calls = parse_tool_calls(message, 0);

        Ok(build_response(&parsed, &request.model, text, calls))
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
        let parsed = send_json(self.client.get(format!("{}/api/tags", self.base_url))).await?;

        let models = parsed["models"]
            .as_array()
            .ok_or_else(|| ProviderError::Parse("tag list has no models field".into()))?;

        let caps = self.capabilities();
        Ok(models
            .iter()
            .filter_map(|m| m["name"].as_str())
            .map(|name| ModelInfo {
                id: name.to_string(),
                name: name.to_string(),
                provider: "ollama".into(),
                context_window: caps.max_context_window,
                max_output_tokens: 4096,
                supports_json: caps.supports_json,
                supports_images: caps.supports_images,
                supports_functions: caps.supports_functions,
                supports_streaming: caps.supports_streaming,
                input_cost_per_million: 0.0,
                output_cost_per_million: 0.0,
            })
            .collect())
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_streaming: true,
            supports_json: true,
            supports_images: false,
            supports_functions: true,
            max_context_window: 32_768,
        }
    }
}
