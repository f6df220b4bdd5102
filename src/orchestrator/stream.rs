//! The streamed generation loop: stream a round, run any requested tools,
//! feed the results back and stream again until the model stops asking.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transcript;
use crate::error::{OrchestratorError, ProviderError};
use crate::inference::ProviderAdapter;
use crate::tools::{ToolEvent, ToolExecutor};
use crate::tracker::ToolCallTracker;
use crate::types::{ChatMessage, GenerationRequest, StreamEvent, ToolCall};

/// One item of a streamed response.
///
/// `content` is everything streamed so far. The last item has
/// `complete == true`, an empty `chunk` and every executed tool call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamItem {
    pub chunk: String,
    pub complete: bool,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Consumer side of a streamed generation. Dropping it stops the producer.
pub struct ResponseStream {
    rx: mpsc::Receiver<Result<StreamItem, OrchestratorError>>,
}

impl ResponseStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<StreamItem, OrchestratorError>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Result<StreamItem, OrchestratorError>> {
        self.rx.recv().await
    }

    /// Drain the stream and return its final item.
    pub async fn finish(mut self) -> Result<StreamItem, OrchestratorError> {
        let mut last = None;
        while let Some(item) = self.rx.recv().await {
            last = Some(item?);
        }
        last.ok_or(OrchestratorError::Cancelled)
    }
}

impl futures::Stream for ResponseStream {
    type Item = Result<StreamItem, OrchestratorError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Everything the producer task needs, owned.
pub(crate) struct StreamJob {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub executor: Option<Arc<dyn ToolExecutor>>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_iterations: usize,
    pub buffer: usize,
    pub cancel: CancellationToken,
    pub tool_events: Option<mpsc::Sender<ToolEvent>>,
}

type Output = mpsc::Sender<Result<StreamItem, OrchestratorError>>;

enum Round {
    Done { text: String, calls: Vec<ToolCall> },
    Failed(ProviderError),
    Stopped,
}

pub(crate) fn limit_notice(max_iterations: usize) -> String {
    format!(
        "\n\n[Stopped after {max_iterations} rounds of tool calls. \
         Ask the user whether to continue before calling more tools.]"
    )
}

/// Producer task body. Sends chunks into `out` until the model stops
/// requesting tools, the iteration cap is hit, or the consumer goes away.
pub(crate) async fn run(mut job: StreamJob, out: Output) {
    let provider = job.adapter.id().to_string();
    let mut history = std::mem::take(&mut job.messages);
    let mut content = String::new();
    let mut executed: Vec<ToolCall> = Vec::new();
    let mut iterations = 0usize;

    loop {
        if job.cancel.is_cancelled() {
            info!(provider = %provider, iterations, "stream cancelled");
            return;
        }

        let round = stream_round(&job, &history, &out, &mut content).await;
        let (text, calls) = match round {
            Round::Stopped => {
                debug!(provider = %provider, "stream stopped by consumer or cancellation");
                return;
            }
            Round::Failed(e) if iterations == 0 => {
                warn!(provider = %provider, error = %e, "stream failed");
                let _ = out.send(Err(e.into())).await;
                return;
            }
            Round::Failed(e) => {
                warn!(provider = %provider, iteration = iterations, error = %e, "continuation stream failed, keeping partial output");
                break;
            }
            Round::Done { text, calls } => (text, calls),
        };

        let Some(executor) = job
            .executor
            .as_ref()
            .filter(|_| !calls.is_empty() && !job.tools.is_empty())
        else {
            if !calls.is_empty() {
                debug!(provider = %provider, calls = calls.len(), "tool calls requested but no tools or executor supplied");
                executed.extend(calls);
            }
            break;
        };

        if iterations >= job.max_iterations {
            warn!(provider = %provider, max = job.max_iterations, "tool iteration limit reached");
            let notice = limit_notice(job.max_iterations);
            content.push_str(&notice);
            let item = StreamItem {
                chunk: notice,
                complete: false,
                content: content.clone(),
                tool_calls: Vec::new(),
            };
            if out.send(Ok(item)).await.is_err() {
                return;
            }
            break;
        }
        iterations += 1;

        info!(provider = %provider, iteration = iterations, calls = calls.len(), "executing tool calls");
        let results = tokio::select! {
            r = executor.execute_tool_calls(&provider, &calls, job.tool_events.as_ref()) => r,
            _ = job.cancel.cancelled() => {
                info!(provider = %provider, "stream cancelled during tool execution");
                return;
            }
        };

        let mut resolved = calls.clone();
        for call in &mut resolved {
            if let Some(result) = results.iter().find(|r| r.id == call.id) {
                call.apply_result(result);
            }
        }
        executed.extend(resolved);
        history.extend(transcript::tool_exchange(&text, &calls, &results));
    }

    let _ = out
        .send(Ok(StreamItem {
            chunk: String::new(),
            complete: true,
            content,
            tool_calls: executed,
        }))
        .await;
}

/// Stream one generation, forwarding tokens as they arrive.
async fn stream_round(
    job: &StreamJob,
    history: &[ChatMessage],
    out: &Output,
    content: &mut String,
) -> Round {
    let (system_prompt, prompt) = transcript::flatten(job.system_prompt.as_deref(), history);
    let mut request = GenerationRequest::new(&job.model, prompt).with_tools(job.tools.clone());
    request.system_prompt = system_prompt;
    request.temperature = job.temperature;
    request.max_tokens = job.max_tokens;

    let (tx, mut rx) = mpsc::channel(job.buffer);
    let generation = job.adapter.generate_stream(request, tx);

    let forward = async {
        let mut text = String::new();
        let mut tracker = ToolCallTracker::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(token) if token.is_empty() => {}
                StreamEvent::Token(token) => {
                    text.push_str(&token);
                    content.push_str(&token);
                    let item = StreamItem {
                        chunk: token,
                        complete: false,
                        content: content.clone(),
                        tool_calls: Vec::new(),
                    };
                    if out.send(Ok(item)).await.is_err() {
                        job.cancel.cancel();
                        break;
                    }
                }
                StreamEvent::ToolCalls { calls, complete } => {
                    tracker.observe(&calls, complete);
                }
                StreamEvent::Complete(_) | StreamEvent::Error(_) => {}
            }
        }
        (text, tracker)
    };

    let joined = async { tokio::join!(generation, forward) };
    let (result, (text, tracker)) = tokio::select! {
        r = joined => r,
        _ = job.cancel.cancelled() => return Round::Stopped,
    };

    if job.cancel.is_cancelled() {
        return Round::Stopped;
    }

    match result {
        Ok(response) => {
            // Adapters that only report calls on the final response.
            let calls = if tracker.is_empty() {
                response.tool_calls
            } else {
                tracker.into_calls()
            };
            Round::Done { text, calls }
        }
        Err(e) => Round::Failed(e),
    }
}
