pub mod handler;
pub mod registry;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{ToolCall, ToolCallResult};

pub use handler::{ToolDef, ToolHandler};
pub use registry::ToolRegistry;

/// Lifecycle notifications while tool calls run.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Started { id: String, name: String },
    Finished { id: String, name: String, success: bool, execution_time_ms: u64 },
}

/// Runs model-issued tool calls on behalf of the orchestrator.
///
/// Every call gets its own result, in input order. Implementations must
/// cope with arguments that are not valid JSON (streamed calls can be cut
/// short) by failing that call alone.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool_calls(
        &self,
        provider: &str,
        calls: &[ToolCall],
        events: Option<&mpsc::Sender<ToolEvent>>,
    ) -> Vec<ToolCallResult>;
}
