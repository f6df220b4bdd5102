//! Single entry point for running prompts against whichever provider the
//! caller (or the settings) picks.

pub mod stream;
pub mod transcript;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LlmSettings;
use crate::context::{build_prompt_with_files, FileReader, NoVault};
use crate::error::OrchestratorError;
use crate::inference::ProviderAdapter;
use crate::registry::AdapterRegistry;
use crate::tools::{ToolEvent, ToolExecutor};
use crate::types::{
    ChatMessage, CostDetails, FinishReason, GenerationRequest, ModelInfo, Role, TokenUsage,
};

pub use stream::{ResponseStream, StreamItem};

/// Options for a single-shot prompt.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Vault-relative files whose contents are prepended to the prompt.
    pub filepaths: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub json_mode: bool,
}

impl ExecuteOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_files(mut self, paths: Vec<String>) -> Self {
        self.filepaths = paths;
        self
    }
}

/// Outcome of [`Orchestrator::execute_prompt`]. Failures are reported here,
/// never as an `Err`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub response: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost: Option<CostDetails>,
    pub finish_reason: Option<FinishReason>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Options for a streamed, tool-calling generation.
#[derive(Default)]
pub struct StreamOptions {
    pub system_prompt: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Tool definitions offered to the model. Empty disables tool calling.
    pub tools: Vec<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub cancel: Option<CancellationToken>,
    pub tool_events: Option<mpsc::Sender<ToolEvent>>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_tool_events(mut self, tx: mpsc::Sender<ToolEvent>) -> Self {
        self.tool_events = Some(tx);
        self
    }
}

/// Picks adapters, assembles prompts and drives the tool-call loop.
pub struct Orchestrator {
    settings: LlmSettings,
    registry: AdapterRegistry,
    tools: Option<Arc<dyn ToolExecutor>>,
    files: Arc<dyn FileReader>,
}

impl Orchestrator {
    pub fn new(settings: LlmSettings) -> Self {
        let registry = AdapterRegistry::from_settings(&settings);
        Self {
            settings,
            registry,
            tools: None,
            files: Arc::new(NoVault),
        }
    }

    /// Register an extra adapter. Dropped by the next `update_settings`.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.registry.register(adapter);
        self
    }

    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(executor);
        self
    }

    /// Source for `ExecuteOptions::filepaths`. Without one, every file
    /// becomes an inline error marker.
    pub fn with_file_reader(mut self, reader: Arc<dyn FileReader>) -> Self {
        self.files = reader;
        self
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Replace the settings and rebuild every adapter from scratch.
    pub fn update_settings(&mut self, settings: LlmSettings) {
        self.registry.rebuild(&settings);
        self.settings = settings;
    }

    pub fn available_providers(&self) -> Vec<String> {
        self.registry.available()
    }

    /// Configured default `(provider, model)`, if both are set.
    pub fn default_selection(&self) -> Option<(String, String)> {
        Some((
            self.settings.default_provider.clone()?,
            self.settings.default_model.clone()?,
        ))
    }

    /// Models from every registered adapter, in provider id order. Adapters
    /// that fail to list are skipped.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        for adapter in self.registry.adapters() {
            match adapter.list_models().await {
                Ok(list) => models.extend(list),
                Err(e) => warn!(provider = %adapter.id(), error = %e, "failed to list models"),
            }
        }
        models
    }

    /// Resolve an adapter and model from explicit choices or the defaults.
    pub fn resolve(
        &self,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> Result<(Arc<dyn ProviderAdapter>, String), OrchestratorError> {
        let default_provider = self.settings.default_provider.as_deref();
        let provider = provider.or(default_provider).ok_or_else(|| {
            OrchestratorError::Configuration(
                "no provider specified and no default provider configured".into(),
            )
        })?;

        // The default model only makes sense for the default provider.
        let model = model
            .or_else(|| {
                (Some(provider) == default_provider)
                    .then(|| self.settings.default_model.as_deref())
                    .flatten()
            })
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "no model specified for provider '{provider}'"
                ))
            })?;

        let adapter =
            self.registry
                .get(provider)
                .ok_or_else(|| OrchestratorError::ProviderUnavailable {
                    requested: provider.to_string(),
                    available: self.registry.available(),
                })?;

        Ok((adapter, model.to_string()))
    }

    /// Run one prompt to completion.
    pub async fn execute_prompt(&self, options: ExecuteOptions) -> ExecutionResult {
        let (adapter, model) =
            match self.resolve(options.provider.as_deref(), options.model.as_deref()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(error = %e, "cannot execute prompt");
                    return ExecutionResult::failure(e.to_string());
                }
            };

        let prompt =
            build_prompt_with_files(self.files.as_ref(), &options.filepaths, &options.prompt).await;

        let request = GenerationRequest {
            model: model.clone(),
            prompt,
            system_prompt: options.system_prompt,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stop_sequences: options.stop_sequences,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            tools: Vec::new(),
            json_mode: options.json_mode,
        };

        debug!(provider = %adapter.id(), model = %model, "executing prompt");
        match adapter.generate(request).await {
            Ok(response) => {
                info!(
                    provider = %response.provider,
                    model = %response.model,
                    tokens = response.usage.total_tokens,
                    "prompt executed"
                );
                ExecutionResult {
                    success: true,
                    response: Some(response.text),
                    provider: Some(response.provider),
                    model: Some(response.model),
                    usage: Some(response.usage),
                    cost: Some(response.cost),
                    finish_reason: Some(response.finish_reason),
                    error: None,
                }
            }
            Err(e) => {
                warn!(provider = %adapter.id(), model = %model, error = %e, "prompt failed");
                ExecutionResult {
                    provider: Some(adapter.id().to_string()),
                    model: Some(model),
                    ..ExecutionResult::failure(e.to_string())
                }
            }
        }
    }

    /// Start a streamed generation over `messages`.
    ///
    /// Resolution problems are returned immediately. Everything after that
    /// arrives through the stream: a provider failure in the first round is
    /// yielded as an `Err` item, later failures only end the stream early.
    pub fn generate_response_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: StreamOptions,
    ) -> Result<ResponseStream, OrchestratorError> {
        if !messages.iter().any(|m| m.role == Role::User) {
            return Err(OrchestratorError::Validation(
                "a streamed generation needs at least one user message".into(),
            ));
        }
        let (adapter, model) =
            self.resolve(options.provider.as_deref(), options.model.as_deref())?;

        let buffer = self.settings.stream_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = options
            .cancel
            .map(|token| token.child_token())
            .unwrap_or_default();

        let job = stream::StreamJob {
            adapter,
            executor: self.tools.clone(),
            model,
            system_prompt: options.system_prompt,
            messages,
            tools: options.tools,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            max_iterations: self.settings.max_tool_iterations,
            buffer,
            cancel,
            tool_events: options.tool_events,
        };
        tokio::spawn(stream::run(job, tx));

        Ok(ResponseStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FsFileReader;
    use crate::error::ProviderError;
    use crate::inference::finish_stream;
    use crate::types::{LlmResponse, ProviderCapabilities, StreamEvent, ToolCall, ToolCallResult};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    // --- Mock Provider ---

    /// One scripted streaming round: tokens, then optional tool calls.
    #[derive(Clone)]
    struct Script {
        tokens: Vec<&'static str>,
        calls: Vec<ToolCall>,
    }

    fn text(tokens: Vec<&'static str>) -> Result<Script, ProviderError> {
        Ok(Script {
            tokens,
            calls: vec![],
        })
    }

    fn tool_round(tokens: Vec<&'static str>, id: &str) -> Result<Script, ProviderError> {
        Ok(Script {
            tokens,
            calls: vec![ToolCall::new(id, "search", r#"{"q":"rust"}"#)],
        })
    }

    struct MockProvider {
        id: String,
        rounds: Mutex<VecDeque<Result<Script, ProviderError>>>,
        /// Served once the queue is empty.
        fallback: Option<Script>,
        prompts: StdMutex<Vec<GenerationRequest>>,
        models: Vec<ModelInfo>,
    }

    impl MockProvider {
        fn new(id: &str, rounds: Vec<Result<Script, ProviderError>>) -> Self {
            Self {
                id: id.into(),
                rounds: Mutex::new(rounds.into_iter().collect()),
                fallback: None,
                prompts: StdMutex::new(Vec::new()),
                models: vec![],
            }
        }

        fn always(id: &str, script: Script) -> Self {
            Self {
                fallback: Some(script),
                ..Self::new(id, vec![])
            }
        }

        fn requests(&self) -> Vec<GenerationRequest> {
            self.prompts.lock().unwrap().clone()
        }

        async fn next_round(&self, request: GenerationRequest) -> Result<Script, ProviderError> {
            self.prompts.lock().unwrap().push(request);
            match self.rounds.lock().await.pop_front() {
                Some(round) => round,
                None => self
                    .fallback
                    .clone()
                    .ok_or_else(|| ProviderError::Request("no more mock responses".into())),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(&self, request: GenerationRequest) -> Result<LlmResponse, ProviderError> {
            let model = request.model.clone();
            let script = self.next_round(request).await?;
            let mut response = LlmResponse::text(&self.id, model, script.tokens.concat());
            response.usage = TokenUsage::new(1, 1);
            response.tool_calls = script.calls;
            Ok(response)
        }

        async fn generate_stream(
            &self,
            request: GenerationRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<LlmResponse, ProviderError> {
            let model = request.model.clone();
            let script = match self.next_round(request).await {
                Ok(script) => script,
                Err(e) => return finish_stream(&tx, Err(e)).await,
            };
            for token in &script.tokens {
                let _ = tx.send(StreamEvent::Token(token.to_string())).await;
            }
            if !script.calls.is_empty() {
                // A truncated snapshot first, like a real vendor stream.
                let mut partial = script.calls.clone();
                partial[0].arguments.truncate(3);
                let _ = tx
                    .send(StreamEvent::ToolCalls {
                        calls: partial,
                        complete: false,
                    })
                    .await;
                let _ = tx
                    .send(StreamEvent::ToolCalls {
                        calls: script.calls.clone(),
                        complete: false,
                    })
                    .await;
            }
            let mut response = LlmResponse::text(&self.id, model, script.tokens.concat());
            response.tool_calls = script.calls;
            finish_stream(&tx, Ok(response)).await
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(self.models.clone())
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                supports_streaming: true,
                supports_json: false,
                supports_images: false,
                supports_functions: true,
                max_context_window: 8192,
            }
        }
    }

    // --- Counting tool executor ---

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ToolExecutor for CountingExecutor {
        async fn execute_tool_calls(
            &self,
            _provider: &str,
            calls: &[ToolCall],
            _events: Option<&mpsc::Sender<ToolEvent>>,
        ) -> Vec<ToolCallResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            calls
                .iter()
                .map(|c| {
                    if self.fail {
                        ToolCallResult::failed(&c.id, "boom", 1)
                    } else {
                        ToolCallResult::ok(&c.id, json!("found 3 notes"), 1)
                    }
                })
                .collect()
        }
    }

    // --- Helpers ---

    fn orchestrator(provider: MockProvider) -> Orchestrator {
        Orchestrator::new(LlmSettings::default()).with_adapter(Arc::new(provider))
    }

    fn search_tool() -> Vec<Value> {
        vec![json!({
            "name": "search",
            "description": "Search notes",
            "input_schema": {"type": "object", "properties": {"q": {"type": "string"}}}
        })]
    }

    async fn drain(mut stream: ResponseStream) -> Vec<Result<StreamItem, OrchestratorError>> {
        let mut items = Vec::new();
        while let Some(item) = stream.recv().await {
            items.push(item);
        }
        items
    }

    // --- execute_prompt ---

    #[tokio::test]
    async fn execute_prompt_without_provider_reports_error() {
        let orch = Orchestrator::new(LlmSettings::default());
        let result = orch.execute_prompt(ExecuteOptions::new("Hi")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("provider"));
    }

    #[tokio::test]
    async fn execute_prompt_with_stub_adapter() {
        let orch = orchestrator(MockProvider::new("local", vec![text(vec!["hello"])]));
        let result = orch
            .execute_prompt(ExecuteOptions::new("Hi").with_provider("local", "m"))
            .await;

        assert!(result.success);
        assert_eq!(result.response.as_deref(), Some("hello"));
        assert_eq!(result.usage.unwrap().total_tokens, 2);
        assert_eq!(result.cost.unwrap().total_cost, 0.0);
        assert_eq!(result.provider.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn unknown_provider_lists_alternatives() {
        let orch = orchestrator(MockProvider::new("local", vec![]));
        let result = orch
            .execute_prompt(ExecuteOptions::new("Hi").with_provider("groq", "llama"))
            .await;
        let error = result.error.unwrap();
        assert!(error.contains("groq"));
        assert!(error.contains("local"));
    }

    #[tokio::test]
    async fn defaults_fill_missing_provider_and_model() {
        let provider = Arc::new(MockProvider::new("local", vec![text(vec!["ok"])]));
        let orch = Orchestrator::new(LlmSettings::default().with_default("local", "m"))
            .with_adapter(provider.clone());

        let result = orch.execute_prompt(ExecuteOptions::new("Hi")).await;
        assert!(result.success);
        assert_eq!(provider.requests()[0].model, "m");
    }

    #[tokio::test]
    async fn provider_failure_is_reported_not_raised() {
        let orch = orchestrator(MockProvider::new(
            "local",
            vec![Err(ProviderError::ApiError {
                status: 500,
                body: "down".into(),
            })],
        ));
        let result = orch
            .execute_prompt(ExecuteOptions::new("Hi").with_provider("local", "m"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn file_context_is_prepended() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.md"), "alpha").await.unwrap();
        let provider = Arc::new(MockProvider::new("local", vec![text(vec!["ok"])]));
        let orch = Orchestrator::new(LlmSettings::default())
            .with_adapter(provider.clone())
            .with_file_reader(Arc::new(FsFileReader::new(dir.path())));

        let result = orch
            .execute_prompt(
                ExecuteOptions::new("Summarize")
                    .with_provider("local", "m")
                    .with_files(vec!["a.md".into(), "gone.md".into()]),
            )
            .await;

        assert!(result.success);
        let prompt = &provider.requests()[0].prompt;
        assert!(prompt.starts_with("Context from files:"));
        assert!(prompt.contains("--- a.md ---\nalpha"));
        assert!(prompt.contains("--- gone.md ---\n[Error reading file:"));
        assert!(prompt.ends_with("Summarize"));
    }

    #[tokio::test]
    async fn files_fail_closed_without_a_vault() {
        let provider = Arc::new(MockProvider::new("local", vec![text(vec!["ok"])]));
        let orch = Orchestrator::new(LlmSettings::default()).with_adapter(provider.clone());

        let result = orch
            .execute_prompt(
                ExecuteOptions::new("Summarize")
                    .with_provider("local", "m")
                    .with_files(vec!["Cargo.toml".into()]),
            )
            .await;

        assert!(result.success);
        let prompt = &provider.requests()[0].prompt;
        assert!(prompt.contains("--- Cargo.toml ---\n[Error reading file: no vault configured]"));
        assert!(!prompt.contains("[package]"));
    }

    // --- settings and models ---

    #[tokio::test]
    async fn list_models_is_stable_between_updates() {
        let mut provider = MockProvider::new("local", vec![]);
        provider.models = vec![ModelInfo {
            id: "m".into(),
            name: "m".into(),
            provider: "local".into(),
            context_window: 8192,
            max_output_tokens: 1024,
            supports_json: false,
            supports_images: false,
            supports_functions: true,
            supports_streaming: true,
            input_cost_per_million: 0.0,
            output_cost_per_million: 0.0,
        }];
        let orch = orchestrator(provider);

        let first = orch.list_models().await;
        let second = orch.list_models().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn update_settings_rebuilds_registry() {
        let mut orch = orchestrator(MockProvider::new("local", vec![]));
        assert_eq!(orch.available_providers(), vec!["local"]);

        orch.update_settings(LlmSettings::default().with_provider(
            "ollama",
            crate::config::ProviderSettings::local("http://localhost:11434"),
        ));
        assert_eq!(orch.available_providers(), vec!["ollama"]);
        assert_eq!(orch.default_selection(), None);
    }

    // --- streaming ---

    #[tokio::test]
    async fn chunks_concatenate_to_final_content() {
        let orch = orchestrator(MockProvider::new(
            "local",
            vec![text(vec!["Hel", "lo", " world"])],
        ));
        let stream = orch
            .generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new().with_provider("local", "m"),
            )
            .unwrap();

        let items: Vec<StreamItem> = drain(stream).await.into_iter().map(Result::unwrap).collect();
        let last = items.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.content, "Hello world");
        let joined: String = items.iter().map(|i| i.chunk.as_str()).collect();
        assert_eq!(joined, last.content);
        assert_eq!(items.iter().filter(|i| i.complete).count(), 1);
    }

    #[tokio::test]
    async fn stream_is_a_futures_stream() {
        let orch = orchestrator(MockProvider::new("local", vec![text(vec!["a", "b"])]));
        let stream = orch
            .generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new().with_provider("local", "m"),
            )
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn tool_calls_are_executed_and_fed_back() {
        let provider = Arc::new(MockProvider::new(
            "local",
            vec![
                tool_round(vec!["Searching. "], "c1"),
                text(vec!["Found ", "3."]),
            ],
        ));
        let executor = Arc::new(CountingExecutor::default());
        let orch = Orchestrator::new(LlmSettings::default())
            .with_adapter(provider.clone())
            .with_tool_executor(executor.clone());

        let last = orch
            .generate_response_stream(
                vec![ChatMessage::user("Find rust notes")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_tools(search_tool()),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(last.content, "Searching. Found 3.");
        assert_eq!(last.tool_calls.len(), 1);
        assert_eq!(last.tool_calls[0].arguments, r#"{"q":"rust"}"#);
        assert_eq!(last.tool_calls[0].success, Some(true));
        assert_eq!(last.tool_calls[0].result, Some(json!("found 3 notes")));

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].prompt, transcript::CONTINUATION_PROMPT);
        let system = requests[1].system_prompt.as_deref().unwrap();
        assert!(system.contains("User: Find rust notes"));
        assert!(system.contains("Tool result (c1): found 3 notes"));
        assert!(!requests[1].tools.is_empty());
    }

    #[tokio::test]
    async fn iteration_cap_stops_runaway_tool_loops() {
        let provider = MockProvider::always(
            "local",
            Script {
                tokens: vec!["again "],
                calls: vec![ToolCall::new("c", "search", "{}")],
            },
        );
        let executor = Arc::new(CountingExecutor::default());
        let orch = orchestrator(provider).with_tool_executor(executor.clone());

        let items: Vec<StreamItem> = drain(
            orch.generate_response_stream(
                vec![ChatMessage::user("loop")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_tools(search_tool()),
            )
            .unwrap(),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 15);
        let notice = &items[items.len() - 2];
        assert!(notice.chunk.contains("Ask the user"));
        let last = items.last().unwrap();
        assert!(last.complete);
        assert_eq!(last.tool_calls.len(), 15);
        let joined: String = items.iter().map(|i| i.chunk.as_str()).collect();
        assert_eq!(joined, last.content);
    }

    #[tokio::test]
    async fn first_round_failure_is_yielded_as_error() {
        let orch = orchestrator(MockProvider::new(
            "local",
            vec![Err(ProviderError::ApiError {
                status: 401,
                body: "bad key".into(),
            })],
        ));
        let items = drain(
            orch.generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new().with_provider("local", "m"),
            )
            .unwrap(),
        )
        .await;

        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(OrchestratorError::Provider(ProviderError::ApiError { status: 401, .. }))
        ));
    }

    #[tokio::test]
    async fn continuation_failure_keeps_partial_output() {
        let orch = orchestrator(MockProvider::new(
            "local",
            vec![
                tool_round(vec!["Let me look. "], "c1"),
                Err(ProviderError::Request("connection reset".into())),
            ],
        ))
        .with_tool_executor(Arc::new(CountingExecutor::default()));

        let last = orch
            .generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_tools(search_tool()),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        assert!(last.complete);
        assert_eq!(last.content, "Let me look. ");
        assert_eq!(last.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn failed_tools_are_reported_to_the_model() {
        let provider = Arc::new(MockProvider::new(
            "local",
            vec![tool_round(vec![], "c1"), text(vec!["Sorry."])],
        ));
        let executor = Arc::new(CountingExecutor {
            fail: true,
            ..Default::default()
        });
        let orch = Orchestrator::new(LlmSettings::default())
            .with_adapter(provider.clone())
            .with_tool_executor(executor);

        let last = orch
            .generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_tools(search_tool()),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        assert_eq!(last.content, "Sorry.");
        assert_eq!(last.tool_calls[0].success, Some(false));
        assert_eq!(last.tool_calls[0].error.as_deref(), Some("boom"));
        let system = provider.requests()[1].system_prompt.clone().unwrap();
        assert!(system.contains("Tool result (c1): Error: boom"));
    }

    #[tokio::test]
    async fn calls_without_executor_end_the_stream() {
        let orch = orchestrator(MockProvider::new("local", vec![tool_round(vec!["x"], "c1")]));
        let last = orch
            .generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_tools(search_tool()),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        assert_eq!(last.tool_calls.len(), 1);
        assert_eq!(last.tool_calls[0].success, None);
    }

    #[tokio::test]
    async fn tool_calls_ignored_without_tool_definitions() {
        let provider = Arc::new(MockProvider::new(
            "local",
            vec![tool_round(vec!["t"], "c1"), text(vec!["t"])],
        ));
        let executor = Arc::new(CountingExecutor::default());
        let orch = Orchestrator::new(LlmSettings::default())
            .with_adapter(provider.clone())
            .with_tool_executor(executor.clone());

        let last = orch
            .generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new().with_provider("local", "m"),
            )
            .unwrap()
            .finish()
            .await
            .unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(last.content, "t");
        assert_eq!(last.tool_calls.len(), 1);
        assert_eq!(last.tool_calls[0].success, None);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_producer() {
        let provider = Arc::new(MockProvider::always(
            "local",
            Script {
                tokens: vec!["again "],
                calls: vec![ToolCall::new("c", "search", "{}")],
            },
        ));
        let settings = LlmSettings {
            stream_buffer: 1,
            ..Default::default()
        };
        let orch = Orchestrator::new(settings)
            .with_adapter(provider.clone())
            .with_tool_executor(Arc::new(CountingExecutor::default()));

        let mut stream = orch
            .generate_response_stream(
                vec![ChatMessage::user("loop")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_tools(search_tool()),
            )
            .unwrap();
        assert!(stream.recv().await.unwrap().is_ok());
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let rounds = provider.requests().len();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(provider.requests().len(), rounds);
        assert!(rounds <= 2);
    }

    #[tokio::test]
    async fn cancelled_stream_ends_without_final_item() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = orchestrator(MockProvider::new("local", vec![text(vec!["never"])]));
        let items = drain(
            orch.generate_response_stream(
                vec![ChatMessage::user("Hi")],
                StreamOptions::new()
                    .with_provider("local", "m")
                    .with_cancel(cancel),
            )
            .unwrap(),
        )
        .await;
        assert!(items.is_empty());
    }

    #[test]
    fn stream_requires_a_user_message() {
        let orch = orchestrator(MockProvider::new("local", vec![]));
        let err = orch
            .generate_response_stream(
                vec![ChatMessage::system("only system")],
                StreamOptions::new().with_provider("local", "m"),
            )
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn stream_resolution_errors_are_eager() {
        let orch = Orchestrator::new(LlmSettings::default());
        let err = orch
            .generate_response_stream(vec![ChatMessage::user("Hi")], StreamOptions::new())
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }
}
