//! Agent invocation shim.
//!
//! Every language-model invocation runs in a freshly spawned OS thread
//! owning its own single-threaded tokio scheduler. When the invocation
//! returns, the whole scheduler is torn down, so any cancellation-scope
//! corruption or global-state leak inside the agent runtime dies with it.
//! Teardown panics are swallowed once a result has been obtained.
//!
//! The caller supplies a structured-output schema. The runtime is asked to
//! conform to it, and the shim independently re-validates by deserializing
//! into the caller's typed struct. "The agent emitted nothing structured"
//! and "the payload violates the schema" are distinct fatal errors.

pub mod capture;
pub mod claude;
pub mod stream;

use crate::retry::{classify_message, classify_status, RetryClass};
use async_trait::async_trait;
use capture::OutputCapture;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use stream::StreamCallback;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent finished without emitting structured output.
    #[error("no structured output received from agent")]
    NoStructuredOutput,
    /// The agent emitted a payload that violates the declared schema.
    #[error("structured output failed schema validation: {0}")]
    SchemaValidationFailed(String),
    /// The agent runtime itself failed (transport, process, API).
    #[error("agent runtime error: {message}")]
    Runtime {
        message: String,
        status_code: Option<u16>,
    },
    /// The isolation thread died before producing a result.
    #[error("agent invocation thread failed: {0}")]
    Isolation(String),
}

impl AgentError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            status_code: None,
        }
    }

    /// Retry classification: structured status codes win, then the message
    /// table. Protocol violations are always fatal.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::NoStructuredOutput | Self::SchemaValidationFailed(_) => RetryClass::Fatal,
            Self::Runtime {
                message,
                status_code,
            } => status_code
                .and_then(classify_status)
                .unwrap_or_else(|| classify_message(message)),
            Self::Isolation(message) => classify_message(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// One agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Recorded in the capture log (`planner`, `executor`, ...).
    pub agent_type: String,
    pub prompt: String,
    pub model: String,
    /// Working directory for the agent's tools; the orchestrator's own
    /// cwd is never handed out.
    pub working_dir: Option<PathBuf>,
    /// JSON schema the structured output must conform to.
    pub schema: Value,
}

/// The underlying agent runtime: something that can take a prompt and
/// produce schema-conforming JSON, streaming events along the way.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(&self, request: &AgentRequest, events: Option<StreamCallback>)
        -> Result<Value>;
}

/// The invocation shim wrapping any [`AgentRuntime`].
#[derive(Clone)]
pub struct AgentShim {
    runtime: Arc<dyn AgentRuntime>,
    capture: OutputCapture,
}

impl std::fmt::Debug for AgentShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentShim").finish_non_exhaustive()
    }
}

impl AgentShim {
    pub fn new(runtime: Arc<dyn AgentRuntime>, capture: OutputCapture) -> Self {
        Self { runtime, capture }
    }

    /// Invoke the agent and return the raw structured output.
    ///
    /// Blocks the calling thread; async callers go through
    /// `spawn_blocking`. Returns the JSON payload and the capture file it
    /// was appended to (when capture succeeded).
    pub fn invoke_value(
        &self,
        request: AgentRequest,
        events: Option<StreamCallback>,
    ) -> Result<(Value, Option<PathBuf>)> {
        let runtime = Arc::clone(&self.runtime);
        let thread_request = request.clone();

        let handle = std::thread::Builder::new()
            .name(format!("cadence-agent-{}", request.agent_type))
            .spawn(move || {
                let scheduler = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| AgentError::Isolation(e.to_string()))?;

                let result = scheduler.block_on(runtime.invoke(&thread_request, events));

                // Tear the scheduler down inside the same thread. Cleanup
                // panics from leaked tasks must not mask an obtained result.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(scheduler)))
                    .is_err()
                {
                    warn!("agent scheduler teardown panicked; result retained");
                }
                result
            })
            .map_err(|e| AgentError::Isolation(e.to_string()))?;

        let value = handle
            .join()
            .map_err(|_| AgentError::Isolation("invocation thread panicked".to_string()))??;

        let capture_path = self
            .capture
            .capture(&request.agent_type, &request.prompt, &value);
        debug!(agent = %request.agent_type, "agent invocation complete");
        Ok((value, capture_path))
    }

    /// Invoke the agent and re-validate its output into `T`.
    pub fn invoke<T: serde::de::DeserializeOwned>(
        &self,
        request: AgentRequest,
        events: Option<StreamCallback>,
    ) -> Result<(T, Option<PathBuf>)> {
        let (value, capture_path) = self.invoke_value(request, events)?;
        let typed = serde_json::from_value(value)
            .map_err(|e| AgentError::SchemaValidationFailed(e.to_string()))?;
        Ok((typed, capture_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct CannedRuntime {
        payload: std::result::Result<Value, String>,
        calls: AtomicUsize,
        seen_threads: Mutex<Vec<String>>,
    }

    impl CannedRuntime {
        fn ok(payload: Value) -> Self {
            Self {
                payload: Ok(payload),
                calls: AtomicUsize::new(0),
                seen_threads: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                payload: Err(message.to_string()),
                calls: AtomicUsize::new(0),
                seen_threads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentRuntime for CannedRuntime {
        async fn invoke(
            &self,
            _request: &AgentRequest,
            events: Option<StreamCallback>,
        ) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_threads.lock().unwrap().push(
                std::thread::current()
                    .name()
                    .unwrap_or("unnamed")
                    .to_string(),
            );
            if let Some(events) = events {
                events(stream::StreamEvent::Text("working".to_string()));
            }
            match &self.payload {
                Ok(value) => Ok(value.clone()),
                Err(message) => Err(AgentError::runtime(message.clone())),
            }
        }
    }

    fn request(agent_type: &str) -> AgentRequest {
        AgentRequest {
            agent_type: agent_type.to_string(),
            prompt: "do the thing".to_string(),
            model: "sonnet".to_string(),
            working_dir: None,
            schema: json!({"type": "object"}),
        }
    }

    #[derive(Debug, Deserialize)]
    struct Greeting {
        greeting: String,
    }

    #[test]
    fn typed_invoke_validates_payload() {
        let dir = TempDir::new().unwrap();
        let shim = AgentShim::new(
            Arc::new(CannedRuntime::ok(json!({"greeting": "hello"}))),
            OutputCapture::new(dir.path()),
        );

        let (greeting, capture_path): (Greeting, _) =
            shim.invoke(request("planner"), None).unwrap();
        assert_eq!(greeting.greeting, "hello");
        assert!(capture_path.unwrap().exists());
    }

    #[test]
    fn schema_mismatch_is_distinct_fatal_error() {
        let dir = TempDir::new().unwrap();
        let shim = AgentShim::new(
            Arc::new(CannedRuntime::ok(json!({"unexpected": 1}))),
            OutputCapture::new(dir.path()),
        );

        let result: Result<(Greeting, _)> = shim.invoke(request("planner"), None);
        let err = result.unwrap_err();
        assert!(matches!(err, AgentError::SchemaValidationFailed(_)));
        assert_eq!(err.retry_class(), RetryClass::Fatal);
    }

    #[test]
    fn each_invocation_runs_on_its_own_thread() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(CannedRuntime::ok(json!({})));
        let shim = AgentShim::new(
            Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
            OutputCapture::new(dir.path()),
        );

        shim.invoke_value(request("executor"), None).unwrap();
        shim.invoke_value(request("executor"), None).unwrap();

        let threads = runtime.seen_threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads.iter().all(|n| n.starts_with("cadence-agent-")));
        // The shim's own thread is never the invocation thread.
        assert!(!threads
            .iter()
            .any(|n| n == std::thread::current().name().unwrap_or("unnamed")));
    }

    #[test]
    fn runtime_errors_carry_classification() {
        let dir = TempDir::new().unwrap();
        let shim = AgentShim::new(
            Arc::new(CannedRuntime::failing("rate limit exceeded")),
            OutputCapture::new(dir.path()),
        );
        let err = shim.invoke_value(request("verifier"), None).unwrap_err();
        assert_eq!(err.retry_class(), RetryClass::Transient);

        let shim = AgentShim::new(
            Arc::new(CannedRuntime::failing("invalid api key")),
            OutputCapture::new(dir.path()),
        );
        let err = shim.invoke_value(request("verifier"), None).unwrap_err();
        assert_eq!(err.retry_class(), RetryClass::Fatal);
    }

    #[test]
    fn status_code_overrides_message() {
        let err = AgentError::Runtime {
            message: "looks harmless".to_string(),
            status_code: Some(403),
        };
        assert_eq!(err.retry_class(), RetryClass::Fatal);

        let err = AgentError::Runtime {
            message: "invalid api key".to_string(),
            status_code: Some(503),
        };
        assert_eq!(err.retry_class(), RetryClass::Transient);
    }

    #[test]
    fn streaming_events_are_forwarded() {
        let dir = TempDir::new().unwrap();
        let shim = AgentShim::new(
            Arc::new(CannedRuntime::ok(json!({}))),
            OutputCapture::new(dir.path()),
        );

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let callback: StreamCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        shim.invoke_value(request("planner"), Some(callback)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_structured_output_is_fatal() {
        assert_eq!(
            AgentError::NoStructuredOutput.retry_class(),
            RetryClass::Fatal
        );
    }
}
