//! Flattening chat history into a system prompt plus one literal prompt.
//!
//! Adapters only take a single prompt, so earlier turns travel inside the
//! system prompt as role-prefixed lines. Only the newest user message is
//! sent as the prompt itself.

use serde_json::Value;

use crate::types::{ChatMessage, Role, ToolCall, ToolCallResult};

/// Sent as the prompt once tool results follow the last user message.
pub const CONTINUATION_PROMPT: &str =
    "Continue your response using the tool results in the conversation above.";

/// Returns `(system_prompt, prompt)` for the next generation round.
pub fn flatten(system: Option<&str>, messages: &[ChatMessage]) -> (Option<String>, String) {
    let latest_user = messages.iter().rposition(|m| m.role == Role::User);

    let (history, prompt): (Vec<&ChatMessage>, String) = match latest_user {
        Some(idx) if idx == messages.len() - 1 => (
            messages[..idx].iter().collect(),
            messages[idx].content.clone(),
        ),
        _ => (messages.iter().collect(), CONTINUATION_PROMPT.to_string()),
    };

    let rendered: Vec<String> = history.iter().map(|m| render(m)).collect();

    let system = match (system, rendered.is_empty()) {
        (Some(s), true) => Some(s.to_string()),
        (None, true) => None,
        (Some(s), false) => Some(format!(
            "{s}\n\nConversation history:\n{}",
            rendered.join("\n\n")
        )),
        (None, false) => Some(format!("Conversation history:\n{}", rendered.join("\n\n"))),
    };

    (system, prompt)
}

fn render(message: &ChatMessage) -> String {
    match message.role {
        Role::Tool => format!(
            "Tool result ({}): {}",
            message.tool_call_id.as_deref().unwrap_or("unknown"),
            message.content
        ),
        role => {
            let mut line = format!("{}: {}", role.label(), message.content);
            for call in &message.tool_calls {
                line.push_str(&format!(
                    "\n{} called tool `{}` (id {}) with arguments: {}",
                    role.label(),
                    call.name,
                    call.id,
                    call.arguments
                ));
            }
            line
        }
    }
}

/// The assistant turn that requested `calls`, followed by one tool message
/// per result.
pub fn tool_exchange(
    assistant_text: &str,
    calls: &[ToolCall],
    results: &[ToolCallResult],
) -> Vec<ChatMessage> {
    let mut assistant = ChatMessage::assistant(assistant_text);
    assistant.tool_calls = calls.to_vec();

    let mut out = vec![assistant];
    for result in results {
        let body = if result.success {
            match &result.result {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        } else {
            format!("Error: {}", result.error.as_deref().unwrap_or("tool failed"))
        };
        out.push(ChatMessage::tool(&result.id, body));
    }
    out
}
