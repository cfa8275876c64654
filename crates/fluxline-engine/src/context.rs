//! Per-run execution context
//!
//! The context is a flat map from resolved variable path to value, seeded
//! with `form.*` and `system.*` before execution and extended with
//! `node.<id>.*` as steps complete. It is owned by exactly one run and
//! never shared across runs; fork branches get a copy-on-read view that
//! writes only to branch-local keys until the join merges them back.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Read access to resolved variable paths
pub trait ContextView {
    /// Look up a dotted path, e.g. `form.age` or `node.draft.text`.
    fn lookup(&self, path: &str) -> Option<&Value>;
}

/// Mutable context surface the execution walk writes through
pub trait StepContext: ContextView + Send {
    /// Record a completed step's output under `node.<id>.*`.
    fn record_output(&mut self, node_id: &str, output: &Value);

    /// Fold a branch overlay back in, as a join admits the branch.
    fn absorb(&mut self, overlay: ExecutionContext);

    /// Materialize the full visible state (used to seed nested branches).
    fn snapshot(&self) -> ExecutionContext;
}

/// The run-owned variable store
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from form data and system metadata.
    ///
    /// Nested objects are flattened to dotted paths; each intermediate
    /// object is stored as well, so both `form.user` and `form.user.name`
    /// resolve.
    pub fn seeded(form: &Value, system: &Value) -> Self {
        let mut ctx = Self::new();
        ctx.insert_tree("form", form);
        ctx.insert_tree("system", system);
        ctx
    }

    /// Get a value by exact path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    /// Set a single path.
    pub fn set(&mut self, path: impl Into<String>, value: Value) {
        self.values.insert(path.into(), value);
    }

    /// Check if a path exists.
    pub fn contains(&self, path: &str) -> bool {
        self.values.contains_key(path)
    }

    /// Number of stored paths.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all stored paths and values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Merge another context's entries into this one (join-time merge).
    pub fn merge(&mut self, other: ExecutionContext) {
        self.values.extend(other.values);
    }

    /// Insert `value` at `prefix`, recursing into object fields so every
    /// nested path is individually addressable.
    fn insert_tree(&mut self, prefix: &str, value: &Value) {
        self.values.insert(prefix.to_string(), value.clone());
        if let Value::Object(map) = value {
            for (key, sub) in map {
                self.insert_tree(&format!("{}.{}", prefix, key), sub);
            }
        }
    }
}

impl ContextView for ExecutionContext {
    fn lookup(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }
}

impl StepContext for ExecutionContext {
    fn record_output(&mut self, node_id: &str, output: &Value) {
        self.insert_tree(&format!("node.{}", node_id), output);
    }

    fn absorb(&mut self, overlay: ExecutionContext) {
        self.merge(overlay);
    }

    fn snapshot(&self) -> ExecutionContext {
        self.clone()
    }
}

/// Copy-on-read view for a fork branch
///
/// Reads fall through to the shared snapshot taken at fork time; writes
/// land in a branch-local overlay. The overlay is merged into the trunk
/// context only when the join admits the branch.
#[derive(Debug, Clone)]
pub struct BranchContext {
    base: Arc<ExecutionContext>,
    overlay: ExecutionContext,
}

impl BranchContext {
    /// Create a branch view over a shared snapshot.
    pub fn new(base: Arc<ExecutionContext>) -> Self {
        Self {
            base,
            overlay: ExecutionContext::new(),
        }
    }

    /// Consume the view, returning the branch-local writes.
    pub fn into_overlay(self) -> ExecutionContext {
        self.overlay
    }
}

impl ContextView for BranchContext {
    fn lookup(&self, path: &str) -> Option<&Value> {
        self.overlay.get(path).or_else(|| self.base.get(path))
    }
}

impl StepContext for BranchContext {
    fn record_output(&mut self, node_id: &str, output: &Value) {
        self.overlay.record_output(node_id, output);
    }

    fn absorb(&mut self, overlay: ExecutionContext) {
        self.overlay.merge(overlay);
    }

    fn snapshot(&self) -> ExecutionContext {
        let mut merged = (*self.base).clone();
        merged.merge(self.overlay.clone());
        merged
    }
}
