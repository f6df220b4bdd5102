//! Batch execution: many text/image requests, run in ascending `sequence`
//! waves with every member of a wave running concurrently.

pub mod budget;
pub mod executor;
pub mod results;
pub mod sequencer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::OrchestratorError;
use crate::types::{CostDetails, TokenUsage};

pub use budget::{BudgetStatus, BudgetValidation, BudgetValidator, InMemoryUsageTracker, UsageTracker};
pub use executor::{GeneratedImage, ImageGenerator, RequestExecutor};
pub use results::{BatchSummary, ExecutionStats, ResultProcessor};
pub use sequencer::{ExecutionContext, SequenceManager};

/// Scheduling fields shared by every batch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub sequence: u32,
    /// Bookkeeping tag. Does not affect concurrency within a sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub include_previous_results: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_from_steps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRequest {
    #[serde(flatten)]
    pub step: BatchStep,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_files: Vec<String>,
    /// Opaque follow-up for the host (e.g. write the answer to a note).
    /// Carried through to the result untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    #[serde(flatten)]
    pub step: BatchStep,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchRequest {
    Text(TextRequest),
    Image(ImageRequest),
}

impl BatchRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        BatchRequest::Text(TextRequest {
            prompt: prompt.into(),
            ..Default::default()
        })
    }

    pub fn image(prompt: impl Into<String>) -> Self {
        BatchRequest::Image(ImageRequest {
            prompt: prompt.into(),
            ..Default::default()
        })
    }

    pub fn step(&self) -> &BatchStep {
        match self {
            BatchRequest::Text(r) => &r.step,
            BatchRequest::Image(r) => &r.step,
        }
    }

    pub fn step_mut(&mut self) -> &mut BatchStep {
        match self {
            BatchRequest::Text(r) => &mut r.step,
            BatchRequest::Image(r) => &mut r.step,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            BatchRequest::Text(r) => &r.prompt,
            BatchRequest::Image(r) => &r.prompt,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            BatchRequest::Text(_) => RequestKind::Text,
            BatchRequest::Image(_) => RequestKind::Image,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.step_mut().id = Some(id.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.step_mut().sequence = sequence;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        match &mut self {
            BatchRequest::Text(r) => {
                r.provider = Some(provider.into());
                r.model = Some(model.into());
            }
            BatchRequest::Image(r) => {
                r.provider = Some(provider.into());
                r.model = Some(model.into());
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Text,
    Image,
}

/// Outcome of one batch request. Exactly one per input request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptExecutionResult {
    pub id: Option<String>,
    pub kind: RequestKind,
    pub sequence: u32,
    pub parallel_group: Option<String>,
    pub success: bool,
    pub response: Option<String>,
    /// Where an image request's output was written.
    pub image_path: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub cost: Option<CostDetails>,
    pub error: Option<String>,
    pub action: Option<Value>,
    pub execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PromptExecutionResult {
    pub(crate) fn pending(request: &BatchRequest, started_at: DateTime<Utc>) -> Self {
        let step = request.step();
        Self {
            id: step.id.clone(),
            kind: request.kind(),
            sequence: step.sequence,
            parallel_group: step.parallel_group.clone(),
            success: false,
            response: None,
            image_path: None,
            provider: None,
            model: None,
            usage: None,
            cost: None,
            error: None,
            action: None,
            execution_time_ms: 0,
            started_at,
            finished_at: started_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Also produce one merged text block with per-provider attribution.
    pub merge_responses: bool,
}

/// Sequencing plus summarising, the usual entry point for a batch.
pub struct BatchExecutor {
    sequencer: SequenceManager,
}

impl BatchExecutor {
    pub fn new(executor: RequestExecutor) -> Self {
        Self {
            sequencer: SequenceManager::new(executor),
        }
    }

    pub async fn run(
        &self,
        requests: Vec<BatchRequest>,
        options: BatchOptions,
    ) -> Result<BatchSummary, OrchestratorError> {
        if requests.is_empty() {
            return Err(OrchestratorError::Validation("batch has no requests".into()));
        }

        let results = self.sequencer.execute(&requests).await;
        let summary = ResultProcessor::summarize(results, options.merge_responses);
        info!(
            executed = summary.stats.total_executed,
            failed = summary.stats.total_failed,
            cost = summary.stats.total_cost,
            "batch finished"
        );
        Ok(summary)
    }
}
