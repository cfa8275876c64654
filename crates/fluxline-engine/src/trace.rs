//! Run traces: per-step logs and the overall run outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeExecutionError;
use crate::schema::NodeType;

/// Lifecycle of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Declared for wire compatibility with consumers that model queued
    /// steps. Logs enter a trace only once a step has started, so the
    /// engine itself never emits this status.
    Pending,
    Running,
    Success,
    Failed,
}

/// One entry in a run trace, recorded when the step finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    pub step_id: String,
    pub node_type: NodeType,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Resolved input as handed to the step, after variable substitution.
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeExecutionError>,
}

impl StepLog {
    pub fn begin(step_id: impl Into<String>, node_type: NodeType, input: Value) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            node_type,
            status: StepStatus::Running,
            start_time: now,
            end_time: now,
            input,
            output: None,
            error: None,
        }
    }

    pub fn succeed(mut self, output: Option<Value>) -> Self {
        self.status = StepStatus::Success;
        self.end_time = Utc::now();
        self.output = output;
        self
    }

    pub fn fail(mut self, error: NodeExecutionError) -> Self {
        self.status = StepStatus::Failed;
        self.end_time = Utc::now();
        self.error = Some(error);
        self
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

/// Append-only collector for step logs. Branch logs are appended in
/// branch order at join resolution, so traces stay deterministic even
/// though branches run concurrently.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    logs: Vec<StepLog>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, log: StepLog) {
        log::debug!(
            "step '{}' [{}] finished: {:?} ({}ms)",
            log.step_id,
            log.node_type,
            log.status,
            log.duration_ms()
        );
        self.logs.push(log);
    }

    pub fn extend(&mut self, logs: Vec<StepLog>) {
        for log in logs {
            self.record(log);
        }
    }

    pub fn logs(&self) -> &[StepLog] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<StepLog> {
        self.logs
    }
}

/// Summary of a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Final result of executing a pipeline schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub success: bool,
    pub logs: Vec<StepLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub elapsed_ms: u64,
}

impl RunOutcome {
    pub fn success(logs: Vec<StepLog>, final_output: Option<Value>, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            logs,
            final_output,
            failed_at_step: None,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failure(
        logs: Vec<StepLog>,
        failed_at_step: Option<String>,
        message: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        let step_id = failed_at_step.clone();
        Self {
            success: false,
            logs,
            final_output: None,
            failed_at_step,
            error: Some(RunError {
                message: message.into(),
                step_id,
            }),
            elapsed_ms,
        }
    }
}
