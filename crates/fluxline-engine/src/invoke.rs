//! Step invocation: dispatching a resolved input to a provider, in
//! mock or real mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{codes, NodeExecutionError};

/// Default per-step timeout when a node does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// How long the mock invoker pretends to work. Long enough to exercise
/// concurrency in tests, short enough to keep them fast.
const MOCK_LATENCY_MS: u64 = 5;

/// Whether steps hit real providers or return canned responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Mock,
    Real,
}

/// Transport-level failure reported by a [`ProviderCaller`].
#[derive(Debug, Clone)]
pub struct ProviderCallError {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl ProviderCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Backend that carries a step's input to a named provider and returns
/// its output. The service crate supplies an HTTP implementation; tests
/// supply in-process fakes.
#[async_trait]
pub trait ProviderCaller: Send + Sync {
    async fn call(&self, provider_ref: &str, input: &Value) -> Result<Value, ProviderCallError>;
}

/// Invokes a single step, honoring the run mode and the per-step timeout.
#[derive(Clone)]
pub struct StepInvoker {
    mode: RunMode,
    caller: Arc<dyn ProviderCaller>,
}

impl StepInvoker {
    pub fn new(mode: RunMode, caller: Arc<dyn ProviderCaller>) -> Self {
        Self { mode, caller }
    }

    /// Mock-only invoker for runs that never reach a backend.
    pub fn mock() -> Self {
        Self::new(RunMode::Mock, Arc::new(NoProviderCaller))
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Runs one step against `provider_ref` with the already-resolved
    /// `input`. The timeout covers the provider call only, not queueing
    /// in the engine.
    pub async fn invoke(
        &self,
        step_id: &str,
        provider_ref: &str,
        input: &Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, NodeExecutionError> {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        match self.mode {
            RunMode::Mock => {
                tokio::time::sleep(Duration::from_millis(MOCK_LATENCY_MS)).await;
                Ok(mock_output(step_id, provider_ref, input))
            }
            RunMode::Real => {
                log::debug!("step '{}' calling provider '{}'", step_id, provider_ref);
                match tokio::time::timeout(timeout, self.caller.call(provider_ref, input)).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(NodeExecutionError {
                        code: err.code.unwrap_or_else(|| codes::PROVIDER_ERROR.to_string()),
                        message: err.message,
                        details: err.details,
                    }),
                    Err(_) => Err(NodeExecutionError::timeout(timeout.as_millis() as u64)),
                }
            }
        }
    }
}

/// Deterministic canned output for mock runs. Includes the resolved
/// input so traces show what substitution produced.
fn mock_output(step_id: &str, provider_ref: &str, input: &Value) -> Value {
    json!({
        "text": format!("mock response from {}", provider_ref),
        "provider": provider_ref,
        "stepId": step_id,
        "echo": input,
        "mock": true,
    })
}

/// Caller used behind mock mode; real mode with this caller is a
/// configuration mistake and fails every step.
struct NoProviderCaller;

#[async_trait]
impl ProviderCaller for NoProviderCaller {
    async fn call(&self, provider_ref: &str, _input: &Value) -> Result<Value, ProviderCallError> {
        Err(ProviderCallError::new(format!(
            "no provider backend configured (ref '{}')",
            provider_ref
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowCaller;

    #[async_trait]
    impl ProviderCaller for SlowCaller {
        async fn call(&self, _r: &str, _i: &Value) -> Result<Value, ProviderCallError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    struct EchoCaller;

    #[async_trait]
    impl ProviderCaller for EchoCaller {
        async fn call(&self, provider_ref: &str, input: &Value) -> Result<Value, ProviderCallError> {
            Ok(json!({"ref": provider_ref, "input": input}))
        }
    }

    #[tokio::test]
    async fn mock_mode_never_touches_the_caller() {
        let invoker = StepInvoker::new(RunMode::Mock, Arc::new(SlowCaller));
        let out = invoker
            .invoke("fetch", "llm/chat", &json!({"q": "hi"}), Some(50))
            .await
            .unwrap();
        assert_eq!(out["provider"], json!("llm/chat"));
        assert_eq!(out["mock"], json!(true));
        assert_eq!(out["echo"]["q"], json!("hi"));
    }

    #[tokio::test]
    async fn real_mode_passes_through() {
        let invoker = StepInvoker::new(RunMode::Real, Arc::new(EchoCaller));
        let out = invoker
            .invoke("fetch", "llm/chat", &json!({"q": "hi"}), None)
            .await
            .unwrap();
        assert_eq!(out["ref"], json!("llm/chat"));
    }

    #[tokio::test]
    async fn real_mode_times_out() {
        let invoker = StepInvoker::new(RunMode::Real, Arc::new(SlowCaller));
        let err = invoker
            .invoke("fetch", "llm/chat", &json!({}), Some(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn caller_errors_become_node_errors() {
        let invoker = StepInvoker::new(RunMode::Real, Arc::new(NoProviderCaller));
        let err = invoker
            .invoke("fetch", "llm/chat", &json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::PROVIDER_ERROR);
    }
}
