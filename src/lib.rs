pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod inference;
pub mod orchestrator;
pub mod registry;
pub mod tools;
pub mod tracker;
pub mod types;

pub use batch::{
    BatchExecutor, BatchOptions, BatchRequest, BatchSummary, BudgetValidator, ImageGenerator,
    InMemoryUsageTracker, PromptExecutionResult, RequestExecutor, SequenceManager, UsageTracker,
};
pub use config::{LlmSettings, ProviderSettings, DEFAULT_MAX_TOOL_ITERATIONS};
pub use context::{FileReader, FsFileReader, NoVault};
pub use error::{OrchestratorError, ProviderError};
pub use inference::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter, ProviderAdapter};
pub use orchestrator::{
    ExecuteOptions, ExecutionResult, Orchestrator, ResponseStream, StreamItem, StreamOptions,
};
pub use registry::AdapterRegistry;
pub use tools::{ToolEvent, ToolExecutor, ToolHandler, ToolRegistry};
pub use tracker::ToolCallTracker;
pub use types::{
    ChatMessage, CostDetails, FinishReason, GenerationRequest, LlmResponse, ModelInfo,
    ProviderCapabilities, Role, StreamEvent, TokenUsage, ToolCall, ToolCallResult,
};
