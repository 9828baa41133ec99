//! Streaming observability for agent invocations.
//!
//! Tool calls, tool results, and text chunks are forwarded to an optional
//! callback as they arrive. Events are ordered; a `ToolResult` always
//! follows its matching `ToolCall`.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// One observable event from a running agent.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    ToolCall { name: String, input: Value },
    ToolResult { success: bool, error: Option<String> },
    Text(String),
}

/// Callback receiving stream events. Shared across threads because each
/// invocation runs on its own dedicated thread.
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// A callback that narrates events through tracing.
pub fn tracing_callback() -> StreamCallback {
    Arc::new(|event| match event {
        StreamEvent::ToolCall { name, input } => {
            info!(tool = %name, input = %preview(&input), "agent tool call");
        }
        StreamEvent::ToolResult { success, error } => {
            if success {
                info!("agent tool result ok");
            } else {
                info!(error = error.as_deref().unwrap_or(""), "agent tool result failed");
            }
        }
        StreamEvent::Text(text) => {
            info!(text = %truncate(&text, 120), "agent text");
        }
    })
}

fn preview(input: &Value) -> String {
    let rendered = input
        .get("command")
        .or_else(|| input.get("file_path"))
        .or_else(|| input.get("pattern"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| input.to_string());
    truncate(&rendered, 60)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
