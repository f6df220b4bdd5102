use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::error::OrchestratorError;

/// Source of truth for spend. Read before each request, written after each
/// successful one.
#[async_trait]
pub trait UsageTracker: Send + Sync {
    /// Spend so far in the current period, USD.
    async fn current_spend(&self) -> f64;

    /// Spending ceiling. `None` means unlimited.
    async fn budget_limit(&self) -> Option<f64>;

    async fn record_usage(&self, provider: &str, cost: f64);
}

#[derive(Default)]
struct Ledger {
    total: f64,
    by_provider: BTreeMap<String, f64>,
}

/// Process-local tracker.
pub struct InMemoryUsageTracker {
    limit: Option<f64>,
    ledger: Mutex<Ledger>,
}

impl InMemoryUsageTracker {
    pub fn new(limit: Option<f64>) -> Self {
        Self {
            limit,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Limit taken from `settings.budget`.
    pub fn from_settings(settings: &LlmSettings) -> Self {
        Self::new(settings.budget)
    }

    /// Start from an existing spend, e.g. one loaded from disk.
    pub fn with_spend(self, spend: f64) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                total: spend,
                by_provider: BTreeMap::new(),
            }),
            ..self
        }
    }

    pub async fn spend_by_provider(&self) -> BTreeMap<String, f64> {
        self.ledger.lock().await.by_provider.clone()
    }
}

#[async_trait]
impl UsageTracker for InMemoryUsageTracker {
    async fn current_spend(&self) -> f64 {
        self.ledger.lock().await.total
    }

    async fn budget_limit(&self) -> Option<f64> {
        self.limit
    }

    async fn record_usage(&self, provider: &str, cost: f64) {
        let mut ledger = self.ledger.lock().await;
        ledger.total += cost;
        *ledger.by_provider.entry(provider.to_string()).or_default() += cost;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub remaining: f64,
    pub limit: f64,
    pub current_spend: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetValidation {
    pub is_valid: bool,
    /// `None` when no limit is configured.
    pub status: Option<BudgetStatus>,
    pub error: Option<String>,
}

/// Advisory spend gate. Check-then-act: two requests started together can
/// both pass before either records its cost.
#[derive(Clone)]
pub struct BudgetValidator {
    tracker: Arc<dyn UsageTracker>,
}

impl BudgetValidator {
    pub fn new(tracker: Arc<dyn UsageTracker>) -> Self {
        Self { tracker }
    }

    pub async fn validate(&self) -> BudgetValidation {
        let Some(limit) = self.tracker.budget_limit().await else {
            return BudgetValidation {
                is_valid: true,
                status: None,
                error: None,
            };
        };
        let current_spend = self.tracker.current_spend().await;
        let status = BudgetStatus {
            remaining: (limit - current_spend).max(0.0),
            limit,
            current_spend,
        };

        if current_spend >= limit {
            warn!(spend = current_spend, limit, "budget exhausted");
            return BudgetValidation {
                is_valid: false,
                status: Some(status),
                error: Some(format!(
                    "spend of ${current_spend:.2} has reached the ${limit:.2} limit"
                )),
            };
        }

        debug!(remaining = status.remaining, "budget ok");
        BudgetValidation {
            is_valid: true,
            status: Some(status),
            error: None,
        }
    }

    /// [`validate`](Self::validate) as a `Result`.
    pub async fn check(&self) -> Result<Option<BudgetStatus>, OrchestratorError> {
        let validation = self.validate().await;
        if validation.is_valid {
            Ok(validation.status)
        } else {
            Err(OrchestratorError::BudgetExceeded(
                validation.error.unwrap_or_default(),
            ))
        }
    }

    pub async fn record(&self, provider: &str, cost: f64) {
        if cost > 0.0 {
            self.tracker.record_usage(provider, cost).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_is_always_valid() {
        let validator = BudgetValidator::new(Arc::new(InMemoryUsageTracker::new(None)));
        let v = validator.validate().await;
        assert!(v.is_valid);
        assert!(v.status.is_none());
    }

    #[tokio::test]
    async fn reports_remaining_budget() {
        let tracker = Arc::new(InMemoryUsageTracker::new(Some(10.0)).with_spend(4.0));
        let status = BudgetValidator::new(tracker).check().await.unwrap().unwrap();
        assert_eq!(status.remaining, 6.0);
        assert_eq!(status.current_spend, 4.0);
    }

    #[tokio::test]
    async fn exhausted_budget_is_rejected() {
        let tracker = Arc::new(InMemoryUsageTracker::new(Some(1.0)));
        let validator = BudgetValidator::new(tracker.clone());
        validator.record("openai", 0.6).await;
        validator.record("anthropic", 0.5).await;

        let v = validator.validate().await;
        assert!(!v.is_valid);
        assert_eq!(v.status.unwrap().remaining, 0.0);
        assert!(v.error.unwrap().contains("limit"));
        assert!(matches!(
            validator.check().await,
            Err(OrchestratorError::BudgetExceeded(_))
        ));

        let by_provider = tracker.spend_by_provider().await;
        assert_eq!(by_provider["openai"], 0.6);
    }

    #[tokio::test]
    async fn limit_comes_from_settings() {
        let settings = LlmSettings {
            budget: Some(25.0),
            ..Default::default()
        };
        let tracker = InMemoryUsageTracker::from_settings(&settings);
        assert_eq!(tracker.budget_limit().await, Some(25.0));
    }

    #[tokio::test]
    async fn free_usage_is_not_recorded() {
        let tracker = Arc::new(InMemoryUsageTracker::new(Some(1.0)));
        BudgetValidator::new(tracker.clone()).record("ollama", 0.0).await;
        assert!(tracker.spend_by_provider().await.is_empty());
    }
}
