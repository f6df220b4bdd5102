use serde::Serialize;

use super::PromptExecutionResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_executed: usize,
    pub total_succeeded: usize,
    pub total_failed: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub average_execution_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub results: Vec<PromptExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<String>,
    pub stats: ExecutionStats,
}

/// Aggregates a finished batch.
pub struct ResultProcessor;

impl ResultProcessor {
    pub fn summarize(results: Vec<PromptExecutionResult>, merge_responses: bool) -> BatchSummary {
        let stats = Self::stats(&results);
        let merged = merge_responses.then(|| Self::merge(&results));
        BatchSummary {
            results,
            merged,
            stats,
        }
    }

    pub fn stats(results: &[PromptExecutionResult]) -> ExecutionStats {
        let total_executed = results.len();
        let total_succeeded = results.iter().filter(|r| r.success).count();
        let total_tokens = results
            .iter()
            .filter_map(|r| r.usage)
            .map(|u| u64::from(u.total_tokens))
            .sum();
        let total_cost = results
            .iter()
            .filter_map(|r| r.cost.as_ref())
            .map(|c| c.total_cost)
            .sum();
        let average_execution_ms = if total_executed == 0 {
            0.0
        } else {
            results.iter().map(|r| r.execution_time_ms as f64).sum::<f64>()
                / total_executed as f64
        };

        ExecutionStats {
            total_executed,
            total_succeeded,
            total_failed: total_executed - total_succeeded,
            total_tokens,
            total_cost,
            average_execution_ms,
        }
    }

    /// Successful text responses as one document, each section attributed
    /// as `provider (model)`.
    pub fn merge(results: &[PromptExecutionResult]) -> String {
        results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.success)
            .filter_map(|(i, r)| {
                let text = r.response.as_deref()?;
                let title = r.id.clone().unwrap_or_else(|| format!("Response {}", i + 1));
                let source = match (&r.provider, &r.model) {
                    (Some(p), Some(m)) => format!("{p} ({m})"),
                    (Some(p), None) => p.clone(),
                    _ => "unknown provider".to_string(),
                };
                Some(format!("## {title}\n*{source}*\n\n{text}"))
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchRequest, PromptExecutionResult};
    use crate::types::{CostDetails, TokenUsage};
    use chrono::Utc;

    fn result(id: &str, success: bool, ms: u64) -> PromptExecutionResult {
        let mut r = PromptExecutionResult::pending(&BatchRequest::text("x").with_id(id), Utc::now());
        r.success = success;
        r.execution_time_ms = ms;
        if success {
            r.response = Some(format!("answer {id}"));
            r.provider = Some("openai".into());
            r.model = Some("gpt-4o".into());
            r.usage = Some(TokenUsage::new(10, 5));
            r.cost = Some(CostDetails::new(0.001, 0.002));
        } else {
            r.error = Some("boom".into());
        }
        r
    }

    #[test]
    fn aggregates_counts_tokens_and_latency() {
        let results = vec![result("a", true, 100), result("b", false, 50), result("c", true, 150)];
        let stats = ResultProcessor::stats(&results);
        assert_eq!(stats.total_executed, 3);
        assert_eq!(stats.total_succeeded, 2);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_tokens, 30);
        assert!((stats.total_cost - 0.006).abs() < 1e-12);
        assert_eq!(stats.average_execution_ms, 100.0);
    }

    #[test]
    fn merge_skips_failures_and_attributes_sources() {
        let merged = ResultProcessor::merge(&[result("a", true, 1), result("b", false, 1)]);
        assert_eq!(merged, "## a\n*openai (gpt-4o)*\n\nanswer a");
    }

    #[test]
    fn empty_batch_has_zero_average() {
        let summary = ResultProcessor::summarize(vec![], true);
        assert_eq!(summary.stats.average_execution_ms, 0.0);
        assert_eq!(summary.merged.as_deref(), Some(""));
    }
}
