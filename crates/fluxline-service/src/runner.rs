//! Run orchestration: resolve the schema, seed the system scope, run
//! the engine, and keep completed traces around for polling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use fluxline_engine::trace::RunError;
use fluxline_engine::{
    ExecutionEngine, ProviderCaller, RunMode, RunOutcome, StepInvoker, StepLog,
};

use crate::error::{Result, ServiceError};
use crate::store::SchemaStore;

/// A request to execute one stored schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub schema_id: String,
    /// Specific schema version; latest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub mode: RunMode,
    /// Seeds the `form.*` scope.
    #[serde(default)]
    pub input_data: Value,
}

/// The completed run as handed to API callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub success: bool,
    /// Unique run identifier; pollable via [`PipelineRunner::get_run`].
    pub test_id: String,
    pub mode: RunMode,
    pub logs: Vec<StepLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub elapsed_ms: u64,
}

impl RunResponse {
    fn from_outcome(test_id: String, mode: RunMode, outcome: RunOutcome) -> Self {
        Self {
            success: outcome.success,
            test_id,
            mode,
            logs: outcome.logs,
            final_output: outcome.final_output,
            failed_at_step: outcome.failed_at_step,
            error: outcome.error,
            elapsed_ms: outcome.elapsed_ms,
        }
    }
}

/// Runs stored schemas and retains completed traces.
///
/// Mock runs never touch the provider caller; real runs go through the
/// caller supplied at construction.
pub struct PipelineRunner {
    store: Arc<RwLock<SchemaStore>>,
    caller: Arc<dyn ProviderCaller>,
    runs: RwLock<HashMap<String, RunResponse>>,
}

impl PipelineRunner {
    pub fn new(store: Arc<RwLock<SchemaStore>>, caller: Arc<dyn ProviderCaller>) -> Self {
        Self {
            store,
            caller,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Execute a run request to completion.
    ///
    /// The trace is stored under the returned `testId` for later polling.
    pub async fn run(&self, request: RunRequest) -> Result<RunResponse> {
        let schema = self
            .store
            .read()
            .get(&request.schema_id, request.version)
            .cloned()
            .ok_or_else(|| ServiceError::SchemaNotFound {
                id: request.schema_id.clone(),
                version: request.version,
            })?;

        let test_id = format!("run-{}", Uuid::new_v4());
        let system = json!({
            "runId": test_id,
            "schemaVersion": schema.version,
            "timestamp": Utc::now().to_rfc3339(),
        });

        log::info!(
            "run {} starting: schema '{}' v{} ({:?} mode)",
            test_id,
            schema.id,
            schema.version,
            request.mode
        );

        let invoker = match request.mode {
            RunMode::Mock => StepInvoker::mock(),
            RunMode::Real => StepInvoker::new(RunMode::Real, Arc::clone(&self.caller)),
        };
        let engine = ExecutionEngine::new(invoker);
        let outcome = engine.execute(&schema, &request.input_data, &system).await;

        let response = RunResponse::from_outcome(test_id.clone(), request.mode, outcome);
        self.runs.write().insert(test_id, response.clone());
        Ok(response)
    }

    /// Fetch a completed run's trace by test id.
    pub fn get_run(&self, test_id: &str) -> Result<RunResponse> {
        self.runs
            .read()
            .get(test_id)
            .cloned()
            .ok_or_else(|| ServiceError::RunNotFound {
                test_id: test_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fluxline_engine::{ProviderCallError, SchemaBuilder};

    struct EchoCaller;

    #[async_trait]
    impl ProviderCaller for EchoCaller {
        async fn call(
            &self,
            provider_ref: &str,
            input: &Value,
        ) -> std::result::Result<Value, ProviderCallError> {
            Ok(json!({"ref": provider_ref, "text": "echo", "input": input}))
        }
    }

    fn runner_with_schema() -> PipelineRunner {
        let mut store = SchemaStore::new();
        store
            .insert(
                SchemaBuilder::new("greet", 1)
                    .provider("draft", "llm/chat", json!({"prompt": "{{form.name}}"}))
                    .post_process("shape", "fmt/json", json!({"raw": "{{node.draft.text}}"}))
                    .end("done")
                    .edge("draft", "shape")
                    .edge("shape", "done")
                    .variable("form.name", "string")
                    .build(),
            )
            .unwrap();
        PipelineRunner::new(Arc::new(RwLock::new(store)), Arc::new(EchoCaller))
    }

    #[tokio::test]
    async fn mock_run_completes_and_is_pollable() {
        let runner = runner_with_schema();
        let response = runner
            .run(RunRequest {
                schema_id: "greet".into(),
                version: None,
                mode: RunMode::Mock,
                input_data: json!({"name": "Ada"}),
            })
            .await
            .unwrap();

        assert!(response.success);
        assert!(response.test_id.starts_with("run-"));
        assert_eq!(response.logs.len(), 3);

        let polled = runner.get_run(&response.test_id).unwrap();
        assert_eq!(polled.test_id, response.test_id);
        assert_eq!(polled.logs.len(), 3);
    }

    #[tokio::test]
    async fn real_run_uses_the_caller() {
        let runner = runner_with_schema();
        let response = runner
            .run(RunRequest {
                schema_id: "greet".into(),
                version: None,
                mode: RunMode::Real,
                input_data: json!({"name": "Ada"}),
            })
            .await
            .unwrap();
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.logs[0].output.as_ref().unwrap()["ref"], json!("llm/chat"));
    }

    #[tokio::test]
    async fn unknown_schema_is_an_error() {
        let runner = runner_with_schema();
        let err = runner
            .run(RunRequest {
                schema_id: "missing".into(),
                version: None,
                mode: RunMode::Mock,
                input_data: json!({}),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SchemaNotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_run_is_an_error() {
        let runner = runner_with_schema();
        assert!(matches!(
            runner.get_run("run-nope"),
            Err(ServiceError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn system_scope_carries_the_run_id() {
        let mut store = SchemaStore::new();
        store
            .insert(
                SchemaBuilder::new("sys", 1)
                    .provider("a", "llm/chat", json!({"run": "{{system.runId}}"}))
                    .end("done")
                    .edge("a", "done")
                    .variable("system.runId", "string")
                    .build(),
            )
            .unwrap();
        let runner = PipelineRunner::new(Arc::new(RwLock::new(store)), Arc::new(EchoCaller));

        let response = runner
            .run(RunRequest {
                schema_id: "sys".into(),
                version: None,
                mode: RunMode::Mock,
                input_data: json!({}),
            })
            .await
            .unwrap();
        assert!(response.success);
        let run_field = response.logs[0].input["run"].as_str().unwrap();
        assert_eq!(run_field, response.test_id);
    }
}
