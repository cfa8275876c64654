//! Fluxline Engine - pipeline orchestration for AI feature workflows
//!
//! This crate is the core of Fluxline: it models operator-authored
//! workflow schemas, proves they are executable, and runs them. It
//! supports:
//!
//! - Tagged node schemas (PROVIDER, CONDITION, POST_PROCESS, END, FORK, JOIN)
//! - Static validation: structure, acyclicity, reachability, variable closure
//! - `{{scope.path}}` templating over form, system, and node scopes
//! - Concurrent fork/join branches with ALL/ANY/FIRST merge strategies
//! - Deterministic mock runs with traces shaped like real runs
//!
//! # Architecture
//!
//! Schemas flow through three stages:
//!
//! - `validate`: four ordered check classes over the raw schema
//! - `plan`: compilation into a cacheable [`plan::ExecutionPlan`]
//! - `engine`: the walk that executes the plan and records a trace
//!
//! # Example
//!
//! ```ignore
//! use fluxline_engine::{ExecutionEngine, StepInvoker};
//! use fluxline_engine::schema::SchemaBuilder;
//! use serde_json::json;
//!
//! let schema = SchemaBuilder::new("greet", 1)
//!     .provider("draft", "llm/chat", json!({"prompt": "{{form.name}}"}))
//!     .end("done")
//!     .edge("draft", "done")
//!     .variable("form.name", "string")
//!     .build();
//!
//! let engine = ExecutionEngine::new(StepInvoker::mock());
//! let outcome = engine.execute(&schema, &json!({"name": "Ada"}), &json!({})).await;
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod expr;
pub mod graph;
pub mod invoke;
pub mod plan;
pub mod schema;
pub mod trace;
pub mod validate;
pub mod vars;

// Re-export key types
pub use context::{BranchContext, ContextView, ExecutionContext, StepContext};
pub use engine::ExecutionEngine;
pub use error::{EngineError, NodeExecutionError, Result};
pub use invoke::{ProviderCallError, ProviderCaller, RunMode, StepInvoker};
pub use plan::ExecutionPlan;
pub use schema::{Edge, JoinStrategy, Node, NodeId, NodeType, PipelineSchema, SchemaBuilder};
pub use trace::{RunOutcome, StepLog, StepStatus};
pub use validate::{ValidationReport, ValidatorConfig, Violation};
