use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::budget::BudgetValidator;
use super::{BatchRequest, ImageRequest, PromptExecutionResult, TextRequest};
use crate::error::OrchestratorError;
use crate::orchestrator::{ExecuteOptions, Orchestrator};
use crate::types::CostDetails;

/// What an image backend hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// Where the image was saved.
    pub path: String,
    pub model: String,
    pub cost: Option<CostDetails>,
}

/// Image generation backend. Bound to a single provider.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn provider(&self) -> &str;

    async fn generate_image(&self, request: &ImageRequest) -> Result<GeneratedImage, String>;
}

/// Runs one batch request: validate, check budget, execute, record usage.
pub struct RequestExecutor {
    orchestrator: Arc<Orchestrator>,
    budget: Option<BudgetValidator>,
    images: Option<Arc<dyn ImageGenerator>>,
}

impl RequestExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            budget: None,
            images: None,
        }
    }

    pub fn with_budget(mut self, budget: BudgetValidator) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_image_generator(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(images);
        self
    }

    /// Execute `request`, optionally prefixed with results of earlier steps.
    /// Never fails: problems are recorded on the result.
    pub async fn execute(
        &self,
        request: &BatchRequest,
        context: Option<String>,
    ) -> PromptExecutionResult {
        let started = Instant::now();
        let mut result = PromptExecutionResult::pending(request, Utc::now());

        let outcome = match self.validate(request) {
            Ok(()) => self.run(request, context, &mut result).await,
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = outcome {
            warn!(id = ?result.id, sequence = result.sequence, error = %e, "batch request failed");
            result.success = false;
            result.error = Some(e);
        }
        result.execution_time_ms = started.elapsed().as_millis() as u64;
        result.finished_at = Utc::now();
        result
    }

    pub fn validate(&self, request: &BatchRequest) -> Result<(), OrchestratorError> {
        if request.prompt().trim().is_empty() {
            return Err(OrchestratorError::Validation("prompt is empty".into()));
        }
        if let BatchRequest::Image(image) = request {
            let Some(generator) = &self.images else {
                return Err(OrchestratorError::Validation(
                    "image generation is not configured".into(),
                ));
            };
            if let Some(provider) = image.provider.as_deref() {
                if provider != generator.provider() {
                    return Err(OrchestratorError::Validation(format!(
                        "image generation only supports provider '{}', got '{provider}'",
                        generator.provider()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        request: &BatchRequest,
        context: Option<String>,
        result: &mut PromptExecutionResult,
    ) -> Result<(), String> {
        if let Some(budget) = &self.budget {
            budget.check().await.map_err(|e| e.to_string())?;
        }

        match request {
            BatchRequest::Text(text) => self.run_text(text, context, result).await?,
            BatchRequest::Image(image) => self.run_image(image, result).await?,
        }

        if let (Some(budget), Some(cost), Some(provider)) =
            (&self.budget, &result.cost, &result.provider)
        {
            budget.record(provider, cost.total_cost).await;
        }
        Ok(())
    }

    async fn run_text(
        &self,
        request: &TextRequest,
        context: Option<String>,
        result: &mut PromptExecutionResult,
    ) -> Result<(), String> {
        let prompt = match context {
            Some(context) => format!("{context}\n\n---\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };
        let options = ExecuteOptions {
            prompt,
            system_prompt: request.system_prompt.clone(),
            provider: request.provider.clone(),
            model: request.model.clone(),
            filepaths: request.context_files.clone(),
            ..Default::default()
        };

        let executed = self.orchestrator.execute_prompt(options).await;
        result.provider = executed.provider;
        result.model = executed.model;
        result.action = request.action.clone();
        if !executed.success {
            return Err(executed.error.unwrap_or_else(|| "prompt failed".into()));
        }

        debug!(id = ?result.id, "text request succeeded");
        result.success = true;
        result.response = executed.response;
        result.usage = executed.usage;
        result.cost = executed.cost;
        Ok(())
    }

    async fn run_image(
        &self,
        request: &ImageRequest,
        result: &mut PromptExecutionResult,
    ) -> Result<(), String> {
        let Some(generator) = &self.images else {
            return Err("image generation is not configured".into());
        };

        let image = generator
            .generate_image(request)
            .await
            .map_err(|e| format!("image generation failed: {e}"))?;

        result.success = true;
        result.provider = Some(generator.provider().to_string());
        result.model = Some(image.model);
        result.image_path = Some(image.path);
        result.cost = image.cost;
        Ok(())
    }
}
