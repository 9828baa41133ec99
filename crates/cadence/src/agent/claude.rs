//! `claude` CLI-backed agent runtime.
//!
//! Drives the Claude Code CLI in print mode with stream-json output. Each
//! stdout line is a JSON event; assistant tool_use and text blocks are
//! forwarded to the stream callback, tool_result blocks produce
//! ToolResult events, and the final `result` record carries the
//! structured output. The declared schema is embedded in the prompt so
//! the agent knows the shape it must emit; the shim re-validates
//! independently either way.

use super::stream::{StreamCallback, StreamEvent};
use super::{AgentError, AgentRequest, AgentRuntime, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ClaudeCliRuntime;

impl ClaudeCliRuntime {
    pub fn new() -> Self {
        Self
    }

    fn full_prompt(request: &AgentRequest) -> String {
        format!(
            "{}\n\nRespond with a final JSON object conforming to this schema, and nothing else:\n{}",
            request.prompt, request.schema
        )
    }
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    async fn invoke(
        &self,
        request: &AgentRequest,
        events: Option<StreamCallback>,
    ) -> Result<Value> {
        let prompt = Self::full_prompt(request);

        let mut cmd = Command::new("claude");
        cmd.arg("-p")
            .arg("--dangerously-skip-permissions")
            .arg("--model")
            .arg(&request.model)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg(&prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        debug!(model = %request.model, agent = %request.agent_type, "spawning claude process");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::runtime("claude CLI not found")
            } else {
                AgentError::runtime(format!("failed to spawn claude: {e}"))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::runtime("claude stdout unavailable"))?;
        // Drain stderr concurrently so a chatty process cannot block on a
        // full pipe.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                use tokio::io::AsyncReadExt;
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });
        let mut lines = BufReader::new(stdout).lines();

        let mut structured_output: Option<Value> = None;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AgentError::runtime(format!("reading claude output: {e}")))?
        {
            let Ok(event) = serde_json::from_str::<Value>(&line) else {
                // Non-JSON noise on stdout is skipped, not fatal.
                continue;
            };
            match event.get("type").and_then(Value::as_str) {
                Some("assistant") => forward_assistant_blocks(&event, events.as_ref()),
                Some("user") => forward_tool_results(&event, events.as_ref()),
                Some("result") => {
                    structured_output = extract_structured_output(&event);
                    if let Some(err) = event.get("error").and_then(Value::as_str) {
                        warn!(error = %err, "claude reported an error result");
                    }
                }
                _ => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::runtime(format!("waiting for claude: {e}")))?;
        let stderr_output = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(AgentError::runtime(format!(
                "claude exited with status {}: {}",
                status.code().unwrap_or(-1),
                stderr_output.trim()
            )));
        }

        structured_output.ok_or(AgentError::NoStructuredOutput)
    }
}

fn forward_assistant_blocks(event: &Value, events: Option<&StreamCallback>) {
    let Some(events) = events else { return };
    let blocks = event
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_use") => events(StreamEvent::ToolCall {
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            }),
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events(StreamEvent::Text(text.to_string()));
                }
            }
            _ => {}
        }
    }
}

fn forward_tool_results(event: &Value, events: Option<&StreamCallback>) {
    let Some(events) = events else { return };
    let blocks = event
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_result") {
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            events(StreamEvent::ToolResult {
                success: !is_error,
                error: is_error
                    .then(|| block.get("content").map(|c| c.to_string()))
                    .flatten(),
            });
        }
    }
}

/// The result record carries structured output directly, or as a JSON
/// string in `result` (possibly fenced).
fn extract_structured_output(event: &Value) -> Option<Value> {
    if let Some(output) = event.get("structured_output") {
        if !output.is_null() {
            return Some(output.clone());
        }
    }
    let text = event.get("result").and_then(Value::as_str)?;
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed).ok()
}
