use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::handler::{ToolDef, ToolHandler};
use super::{ToolEvent, ToolExecutor};
use crate::types::{ToolCall, ToolCallResult};

/// Catalog of available tools. Stores definitions, provides schemas and
/// dispatches calls to handlers by name.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. The schema is the complete JSON tool definition
    /// (name, description, input_schema) sent to the LLM.
    pub fn add(
        mut self,
        name: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        self.tools.push(ToolDef {
            name: name.into(),
            schema,
            handler: Box::new(handler),
        });
        self
    }

    /// All tool schemas for the LLM API request.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    /// Run one tool by name.
    pub async fn execute(&self, name: &str, input: &Value) -> Result<Value, String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        tool.handler.call(input).await
    }

    async fn execute_call(&self, call: &ToolCall) -> ToolCallResult {
        let started = Instant::now();
        let outcome = match call.parsed_arguments() {
            Ok(input) => self.execute(&call.name, &input).await,
            Err(e) => Err(format!("invalid tool arguments: {e}")),
        };
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => ToolCallResult::ok(&call.id, value, elapsed),
            Err(e) => {
                warn!(tool = %call.name, id = %call.id, error = %e, "tool call failed");
                ToolCallResult::failed(&call.id, e, elapsed)
            }
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute_tool_calls(
        &self,
        provider: &str,
        calls: &[ToolCall],
        events: Option<&mpsc::Sender<ToolEvent>>,
    ) -> Vec<ToolCallResult> {
        debug!(provider = %provider, calls = calls.len(), "executing tool calls");

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if let Some(tx) = events {
                let _ = tx
                    .send(ToolEvent::Started {
                        id: call.id.clone(),
                        name: call.name.clone(),
                    })
                    .await;
            }

            let result = self.execute_call(call).await;

            if let Some(tx) = events {
                let _ = tx
                    .send(ToolEvent::Finished {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        success: result.success,
                        execution_time_ms: result.execution_time_ms,
                    })
                    .await;
            }
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, input: &Value) -> Result<Value, String> {
            Ok(input.clone())
        }
    }

    struct ErrorTool;

    #[async_trait]
    impl ToolHandler for ErrorTool {
        async fn call(&self, _input: &Value) -> Result<Value, String> {
            Err("tool failed".into())
        }
    }

    fn test_registry() -> ToolRegistry {
        ToolRegistry::new()
            .add(
                "echo",
                json!({
                    "name": "echo",
                    "description": "Echoes input",
                    "input_schema": {"type": "object", "properties": {}}
                }),
                EchoTool,
            )
            .add("fail", json!({"name": "fail"}), ErrorTool)
    }

    #[test]
    fn schemas_in_registration_order() {
        let reg = test_registry();
        let schemas = reg.schemas();
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0]["name"], "echo");
        assert_eq!(reg.tool_names(), vec!["echo", "fail"]);
    }

    #[tokio::test]
    async fn each_call_succeeds_or_fails_independently() {
        let reg = test_registry();
        let calls = vec![
            ToolCall::new("1", "echo", r#"{"x": 1}"#),
            ToolCall::new("2", "fail", "{}"),
            ToolCall::new("3", "missing", "{}"),
            ToolCall::new("4", "echo", r#"{"x": "#),
        ];

        let results = reg.execute_tool_calls("openai", &calls, None).await;
        assert_eq!(results.len(), 4);
        assert!(results[0].success);
        assert_eq!(results[0].result, Some(json!({"x": 1})));
        assert_eq!(results[1].error.as_deref(), Some("tool failed"));
        assert!(results[2].error.as_deref().unwrap().contains("unknown tool"));
        assert!(results[3].error.as_deref().unwrap().contains("invalid tool arguments"));
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn emits_start_and_finish_events() {
        let reg = test_registry();
        let (tx, mut rx) = mpsc::channel(8);
        reg.execute_tool_calls("openai", &[ToolCall::new("1", "echo", "{}")], Some(&tx))
            .await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ToolEvent::Started { name, .. } if name == "echo"));
        assert!(matches!(events[1], ToolEvent::Finished { success: true, .. }));
    }
}
