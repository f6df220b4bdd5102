pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod pricing;
pub mod sse;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{GenerationRequest, LlmResponse, ModelInfo, ProviderCapabilities, StreamEvent};

/// One vendor's generation API. Vendor differences stay inside the adapter;
/// callers only ever pick an adapter by id.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key, e.g. `"openai"` or `"ollama"`.
    fn id(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<LlmResponse, ProviderError>;

    /// Stream a generation, pushing events into `tx` as they arrive.
    ///
    /// Failures are always reported as [`StreamEvent::Error`] before the
    /// `Err` is returned. The default falls back to a single-shot call.
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<LlmResponse, ProviderError> {
        let result = self.generate(request).await;
        if let Ok(ref response) = result {
            if !response.text.is_empty() {
                let _ = tx.send(StreamEvent::Token(response.text.clone())).await;
            }
            if !response.tool_calls.is_empty() {
                let _ = tx
                    .send(StreamEvent::ToolCalls {
                        calls: response.tool_calls.clone(),
                        complete: true,
                    })
                    .await;
            }
        }
        finish_stream(&tx, result).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Liveness check. Never fails, any error means "not available".
    async fn is_available(&self) -> bool {
        match self.list_models().await {
            Ok(_) => true,
            Err(e) => {
                debug!(provider = %self.id(), error = %e, "availability check failed");
                false
            }
        }
    }
}

/// Emit the terminal event for a stream and hand the result back.
pub(crate) async fn finish_stream(
    tx: &mpsc::Sender<StreamEvent>,
    result: Result<LlmResponse, ProviderError>,
) -> Result<LlmResponse, ProviderError> {
    match result {
        Ok(response) => {
            let _ = tx.send(StreamEvent::Complete(response.clone())).await;
            Ok(response)
        }
        Err(e) => {
            let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            Err(e)
        }
    }
}

/// Send a prepared request and turn non-2xx statuses into `ApiError`.
pub(crate) async fn send_checked(
    builder: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    let resp = builder
        .send()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        return Err(ProviderError::ApiError {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}

/// Send, check status and parse the body as JSON.
pub(crate) async fn send_json(builder: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
    let text = send_checked(builder)
        .await?
        .text()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))
}

/// Convert `{name, description, input_schema}` tool definitions to the
/// OpenAI function-calling shape. Ollama uses the same shape.
pub(crate) fn function_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool["name"].as_str()?;
            let description = tool.get("description").cloned().unwrap_or(Value::Null);
            let parameters = tool
                .get("input_schema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}}));

            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": description,
                    "parameters": parameters,
                }
            }))
        })
        .collect()
}

/// Token count from a usage field. Missing is 0, oversized saturates.
pub(crate) fn token_count(value: &Value) -> u32 {
    value
        .as_u64()
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

#[cfg(test)]
pub(crate) mod test_server {
    //! In-process HTTP server for adapter wire tests.

    use std::net::SocketAddr;

    use axum::Router;
    use tokio::net::TcpListener;

    pub async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}
