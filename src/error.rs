#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{}", unavailable_message(.requested, .available))]
    ProviderUnavailable {
        requested: String,
        available: Vec<String>,
    },
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("tool execution failed: {0}")]
    ToolExecution(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("generation cancelled")]
    Cancelled,
}

fn unavailable_message(requested: &str, available: &[String]) -> String {
    if available.is_empty() {
        format!("provider '{requested}' is not available. No providers are configured")
    } else {
        format!(
            "provider '{requested}' is not available. Available providers: {}",
            available.join(", ")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Rate limits, server-side failures and transport errors may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Request(_) => true,
            ProviderError::ApiError { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Parse(_) | ProviderError::Unsupported(_) => false,
        }
    }
}
