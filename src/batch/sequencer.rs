use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::executor::RequestExecutor;
use super::{BatchRequest, BatchStep, PromptExecutionResult};

/// Results gathered so far in one batch call. Only written between
/// sequences, never while one is running.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    previous_results: BTreeMap<u32, Vec<PromptExecutionResult>>,
    all_results: Vec<PromptExecutionResult>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: PromptExecutionResult) {
        self.previous_results
            .entry(result.sequence)
            .or_default()
            .push(result.clone());
        self.all_results.push(result);
    }

    pub fn results_for_sequence(&self, sequence: u32) -> &[PromptExecutionResult] {
        self.previous_results
            .get(&sequence)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn all_results(&self) -> &[PromptExecutionResult] {
        &self.all_results
    }

    /// Context text for `step`: the named steps if it lists any, otherwise
    /// every earlier result if it asks for them.
    pub fn context_for(&self, step: &BatchStep) -> Option<String> {
        let selected: Vec<&PromptExecutionResult> = if !step.context_from_steps.is_empty() {
            step.context_from_steps
                .iter()
                .filter_map(|id| {
                    let found = self
                        .all_results
                        .iter()
                        .find(|r| r.id.as_deref() == Some(id.as_str()));
                    if found.is_none() {
                        warn!(step = %id, "referenced step has no earlier result");
                    }
                    found
                })
                .collect()
        } else if step.include_previous_results {
            self.all_results
                .iter()
                .filter(|r| r.sequence < step.sequence)
                .collect()
        } else {
            return None;
        };

        if selected.is_empty() {
            return None;
        }

        let sections: Vec<String> = selected.iter().map(|r| render_result(r)).collect();
        Some(format!("Previous results:\n\n{}", sections.join("\n\n")))
    }
}

fn render_result(result: &PromptExecutionResult) -> String {
    let mut label = match &result.id {
        Some(id) => format!("Step {id}"),
        None => format!("Sequence {} result", result.sequence),
    };
    if let Some(group) = &result.parallel_group {
        label.push_str(&format!(" [{group}]"));
    }

    let body = match (result.success, &result.response, &result.image_path) {
        (true, Some(text), _) => text.clone(),
        (true, None, Some(path)) => format!("[Image saved to {path}]"),
        (true, None, None) => String::new(),
        (false, ..) => format!(
            "[Failed: {}]",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    };
    format!("--- {label} ---\n{body}")
}

/// Runs requests in ascending `sequence` waves. Everything in a wave runs
/// concurrently; a wave only starts once the previous one has finished.
pub struct SequenceManager {
    executor: RequestExecutor,
}

impl SequenceManager {
    pub fn new(executor: RequestExecutor) -> Self {
        Self { executor }
    }

    /// One result per request, in input order. Individual failures never
    /// stop the batch.
    pub async fn execute(&self, requests: &[BatchRequest]) -> Vec<PromptExecutionResult> {
        let mut sequences: Vec<u32> = requests.iter().map(|r| r.step().sequence).collect();
        sequences.sort_unstable();
        sequences.dedup();

        let mut context = ExecutionContext::new();
        let mut slots: Vec<Option<PromptExecutionResult>> = vec![None; requests.len()];

        for sequence in sequences {
            let indices: Vec<usize> = requests
                .iter()
                .enumerate()
                .filter(|(_, r)| r.step().sequence == sequence)
                .map(|(i, _)| i)
                .collect();
            info!(sequence, requests = indices.len(), "running sequence");

            let wave = indices.iter().map(|&i| {
                let request = &requests[i];
                let extra = context.context_for(request.step());
                self.executor.execute(request, extra)
            });
            let results = join_all(wave).await;

            for (i, result) in indices.into_iter().zip(results) {
                debug!(sequence, index = i, success = result.success, "request finished");
                context.record(result.clone());
                slots[i] = Some(result);
            }
        }

        slots.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::testing::{orchestrator, EchoProvider};
    use std::sync::Arc;

    fn manager() -> (Arc<EchoProvider>, SequenceManager) {
        let provider = Arc::new(EchoProvider::default());
        let manager = SequenceManager::new(RequestExecutor::new(orchestrator(provider.clone())));
        (provider, manager)
    }

    fn position(events: &[String], event: &str) -> usize {
        events.iter().position(|e| e == event).unwrap()
    }

    #[tokio::test]
    async fn sequences_run_in_ascending_waves() {
        let (provider, manager) = manager();
        let requests = vec![
            BatchRequest::text("s2").with_sequence(2),
            BatchRequest::text("s0a"),
            BatchRequest::text("s1").with_sequence(1),
            BatchRequest::text("s0b"),
        ];

        let results = manager.execute(&requests).await;
        assert_eq!(results.len(), 4);
        let sequences: Vec<u32> = results.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![2, 0, 1, 0]);

        let events = provider.events();
        let s1_start = position(&events, "start:s1");
        assert!(position(&events, "end:s0a") < s1_start);
        assert!(position(&events, "end:s0b") < s1_start);
        assert!(position(&events, "end:s1") < position(&events, "start:s2"));
        // Same-sequence requests overlap.
        assert!(position(&events, "start:s0b") < position(&events, "end:s0a"));
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_sequences() {
        let (_, manager) = manager();
        let requests = vec![
            BatchRequest::text("FAIL"),
            BatchRequest::text("next").with_sequence(1),
        ];
        let results = manager.execute(&requests).await;
        assert!(!results[0].success);
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn previous_results_flow_into_later_steps() {
        let (provider, manager) = manager();
        let mut later = BatchRequest::text("use it").with_sequence(1);
        later.step_mut().include_previous_results = true;
        let requests = vec![BatchRequest::text("first").with_id("one"), later];

        manager.execute(&requests).await;
        let prompts = provider.prompts.lock().unwrap().clone();
        assert_eq!(prompts[0], "first");
        assert!(prompts[1].starts_with("Previous results:"));
        assert!(prompts[1].contains("--- Step one ---\necho: first"));
    }

    #[tokio::test]
    async fn named_steps_select_specific_results() {
        let (provider, manager) = manager();
        let mut later = BatchRequest::text("compare").with_sequence(1);
        later.step_mut().context_from_steps = vec!["b".into()];
        let requests = vec![
            BatchRequest::text("alpha").with_id("a"),
            BatchRequest::text("beta").with_id("b"),
            later,
        ];

        manager.execute(&requests).await;
        let prompts = provider.prompts.lock().unwrap().clone();
        let last = prompts.last().unwrap();
        assert!(last.contains("echo: beta"));
        assert!(!last.contains("echo: alpha"));
    }

    #[test]
    fn no_context_unless_requested() {
        let context = ExecutionContext::new();
        assert!(context.context_for(&BatchStep::default()).is_none());
        assert!(context.results_for_sequence(0).is_empty());
    }
}
