//! Error types for the pipeline engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validate::ValidationReport;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error codes carried by [`NodeExecutionError`]
pub mod codes {
    /// The per-step timeout elapsed before the collaborator responded.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The provider/processor collaborator reported a failure.
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
    /// The collaborator returned a payload the engine could not use.
    pub const BAD_RESPONSE: &str = "BAD_RESPONSE";
    /// A step's input template referenced a path absent from the context.
    pub const UNRESOLVED_VARIABLE: &str = "UNRESOLVED_VARIABLE";
    /// A condition expression failed to parse or evaluate.
    pub const EXPRESSION_ERROR: &str = "EXPRESSION_ERROR";
}

/// A normalized provider/processor failure
///
/// Every collaborator error is reduced to this shape before it enters a
/// step log, so the trace always carries a specific code and message.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct NodeExecutionError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl NodeExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach collaborator-supplied detail to this error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// A per-step timeout failure.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("step did not complete within {}ms", timeout_ms),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.code == codes::TIMEOUT
    }
}

/// Errors that can occur in the pipeline engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Schema failed validation; execution never began.
    #[error("schema validation failed: {0}")]
    Validation(ValidationReport),

    /// A template referenced a path absent from the execution context.
    ///
    /// Validation proves references statically; at runtime this surfaces
    /// when a provider output lacks a field a later template expects.
    #[error("undefined variable '{path}' referenced by node '{node_id}'")]
    UndefinedVariable { path: String, node_id: String },

    /// A provider/processor step failed.
    #[error("node execution failed: {0}")]
    NodeExecution(#[from] NodeExecutionError),

    /// A join's strategy could not be satisfied.
    #[error("join '{join_id}' strategy not satisfied: {message}")]
    JoinStrategy { join_id: String, message: String },

    /// A condition expression could not be parsed or evaluated.
    #[error("invalid expression on node '{node_id}': {message}")]
    Expression { node_id: String, message: String },

    /// No outgoing edge matched the handle the walk needed to follow.
    #[error("no edge from node '{node_id}' handle '{handle}'")]
    MissingEdge { node_id: String, handle: String },

    /// The run (or a branch of it) was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// The schema could not be compiled into an executable plan.
    ///
    /// Compilation runs on validated schemas, so this surfaces only when a
    /// caller skips validation.
    #[error("plan error: {0}")]
    Plan(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Create an expression error for a node.
    pub fn expression(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// The node-execution payload, if this is a step failure.
    pub fn as_node_error(&self) -> Option<&NodeExecutionError> {
        match self {
            EngineError::NodeExecution(e) => Some(e),
            _ => None,
        }
    }
}
