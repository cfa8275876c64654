//! Pipeline schema model
//!
//! These types define the structure of feature pipelines: nodes, edges,
//! variable declarations, and their metadata. A schema is authored and
//! versioned externally and handed to the engine read-only; a new version
//! is a new value, never mutated in place.

use serde::{Deserialize, Serialize};

/// Unique identifier for a node
pub type NodeId = String;

/// Edge handle for the `true` output of a CONDITION node
pub const HANDLE_TRUE: &str = "true";

/// Edge handle for the `false` output of a CONDITION node
pub const HANDLE_FALSE: &str = "false";

/// Build the edge handle for branch `i` of a FORK node (`branch-0`, `branch-1`, ...)
pub fn branch_handle(index: usize) -> String {
    format!("branch-{}", index)
}

/// Parse a `branch-i` handle back into its index
pub fn parse_branch_handle(handle: &str) -> Option<usize> {
    handle.strip_prefix("branch-")?.parse().ok()
}

/// The kind of a node, without its payload
///
/// Used wherever only the discriminant matters (step logs, validation
/// messages). Kept in sync with [`Node`] by `Node::node_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Provider,
    Condition,
    PostProcess,
    End,
    Fork,
    Join,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Provider => "PROVIDER",
            NodeType::Condition => "CONDITION",
            NodeType::PostProcess => "POST_PROCESS",
            NodeType::End => "END",
            NodeType::Fork => "FORK",
            NodeType::Join => "JOIN",
        };
        write!(f, "{}", s)
    }
}

/// Merge strategy of a JOIN node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinStrategy {
    /// Wait for every branch to succeed; any branch failure fails the join.
    All,
    /// Wait for the first branch to succeed; all branches failing fails the join.
    Any,
    /// Adopt the outcome of the first branch to complete, success or failure.
    First,
}

impl std::fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JoinStrategy::All => "ALL",
            JoinStrategy::Any => "ANY",
            JoinStrategy::First => "FIRST",
        };
        write!(f, "{}", s)
    }
}

/// A node in a pipeline schema
///
/// Closed sum over the six node kinds; all engine logic matches this set
/// exhaustively, so adding a node type is a compile-time-visible change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Node {
    /// Invokes one external AI provider.
    #[serde(rename = "PROVIDER", rename_all = "camelCase")]
    Provider {
        id: NodeId,
        /// Reference to the provider registered with the surrounding service.
        provider_ref: String,
        /// Object template; string values may contain `{{scope.path}}` placeholders.
        input_template: serde_json::Value,
        /// Per-step timeout in milliseconds (real mode only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Boolean expression over resolved variables; routes to `true`/`false` edges.
    #[serde(rename = "CONDITION", rename_all = "camelCase")]
    Condition { id: NodeId, expression: String },

    /// Invokes one post-processing step.
    #[serde(rename = "POST_PROCESS", rename_all = "camelCase")]
    PostProcess {
        id: NodeId,
        processor_ref: String,
        input_template: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Terminal node; reaching it ends the run successfully.
    #[serde(rename = "END", rename_all = "camelCase")]
    End { id: NodeId },

    /// Splits execution into `branch_count` concurrent branches.
    #[serde(rename = "FORK", rename_all = "camelCase")]
    Fork { id: NodeId, branch_count: usize },

    /// Merges the branches of the matching FORK under a strategy.
    #[serde(rename = "JOIN", rename_all = "camelCase")]
    Join { id: NodeId, strategy: JoinStrategy },
}

impl Node {
    /// The node's unique identifier.
    pub fn id(&self) -> &str {
        match self {
            Node::Provider { id, .. }
            | Node::Condition { id, .. }
            | Node::PostProcess { id, .. }
            | Node::End { id }
            | Node::Fork { id, .. }
            | Node::Join { id, .. } => id,
        }
    }

    /// The node's kind discriminant.
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Provider { .. } => NodeType::Provider,
            Node::Condition { .. } => NodeType::Condition,
            Node::PostProcess { .. } => NodeType::PostProcess,
            Node::End { .. } => NodeType::End,
            Node::Fork { .. } => NodeType::Fork,
            Node::Join { .. } => NodeType::Join,
        }
    }

    /// Whether this node produces `node.<id>.*` output fields.
    pub fn is_producer(&self) -> bool {
        matches!(self, Node::Provider { .. } | Node::PostProcess { .. })
    }

    /// The object template this node resolves before executing, if any.
    pub fn input_template(&self) -> Option<&serde_json::Value> {
        match self {
            Node::Provider { input_template, .. } | Node::PostProcess { input_template, .. } => {
                Some(input_template)
            }
            _ => None,
        }
    }
}

/// An edge connecting two nodes
///
/// `source_handle` disambiguates multi-output nodes: `true`/`false` for
/// CONDITION, `branch-i` for FORK. Absent for single-output nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node ID
    pub source: NodeId,
    /// Target node ID
    pub target: NodeId,
    /// Source handle name, where the source has more than one output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    /// Create an edge from a single-output node.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    /// Create an edge from a specific output handle.
    pub fn with_handle(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: Some(handle.into()),
        }
    }
}

/// A declared input variable (`form.*` or `system.*` scope)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDecl {
    /// Dotted path including scope prefix, e.g. `form.age`.
    pub path: String,
    /// Declared value type (informational).
    #[serde(rename = "type", default)]
    pub var_type: String,
}

impl VariableDecl {
    pub fn new(path: impl Into<String>, var_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            var_type: var_type.into(),
        }
    }
}

/// Authoring lifecycle status of a schema version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

/// A complete, versioned pipeline schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSchema {
    /// Unique identifier for this pipeline.
    pub id: String,
    /// Monotonic version; a new version is a new value.
    pub version: u32,
    /// Nodes in the pipeline.
    pub nodes: Vec<Node>,
    /// Edges connecting nodes.
    pub edges: Vec<Edge>,
    /// Declared form/system input variables.
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    /// Authoring lifecycle status.
    #[serde(default)]
    pub status: SchemaStatus,
}

impl PipelineSchema {
    /// Find a node by ID.
    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Get edges entering a node.
    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target == node_id)
    }

    /// Get edges leaving a node.
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// The entry node: the unique node with no inbound edges.
    ///
    /// Returns `None` when no such node exists or more than one does;
    /// the validator reports either case as a structural violation.
    pub fn entry_node(&self) -> Option<&Node> {
        let mut entries = self
            .nodes
            .iter()
            .filter(|n| self.incoming_edges(n.id()).next().is_none());
        let first = entries.next()?;
        if entries.next().is_some() {
            return None;
        }
        Some(first)
    }
}

/// Fluent builder for constructing pipeline schemas
///
/// # Example
///
/// ```ignore
/// let schema = SchemaBuilder::new("summarize", 1)
///     .provider("draft", "openai-chat", serde_json::json!({"prompt": "{{form.text}}"}))
///     .end("done")
///     .edge("draft", "done")
///     .variable("form.text", "string")
///     .build();
/// ```
pub struct SchemaBuilder {
    id: String,
    version: u32,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    variables: Vec<VariableDecl>,
    status: SchemaStatus,
}

impl SchemaBuilder {
    /// Start a new schema.
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            nodes: Vec::new(),
            edges: Vec::new(),
            variables: Vec::new(),
            status: SchemaStatus::Draft,
        }
    }

    /// Add a PROVIDER node.
    pub fn provider(
        mut self,
        id: impl Into<String>,
        provider_ref: impl Into<String>,
        input_template: serde_json::Value,
    ) -> Self {
        self.nodes.push(Node::Provider {
            id: id.into(),
            provider_ref: provider_ref.into(),
            input_template,
            timeout_ms: None,
        });
        self
    }

    /// Set a timeout on the most recently added PROVIDER/POST_PROCESS node.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        if let Some(Node::Provider { timeout_ms, .. } | Node::PostProcess { timeout_ms, .. }) =
            self.nodes.last_mut()
        {
            *timeout_ms = Some(ms);
        }
        self
    }

    /// Add a CONDITION node.
    pub fn condition(mut self, id: impl Into<String>, expression: impl Into<String>) -> Self {
        self.nodes.push(Node::Condition {
            id: id.into(),
            expression: expression.into(),
        });
        self
    }

    /// Add a POST_PROCESS node.
    pub fn post_process(
        mut self,
        id: impl Into<String>,
        processor_ref: impl Into<String>,
        input_template: serde_json::Value,
    ) -> Self {
        self.nodes.push(Node::PostProcess {
            id: id.into(),
            processor_ref: processor_ref.into(),
            input_template,
            timeout_ms: None,
        });
        self
    }

    /// Add an END node.
    pub fn end(mut self, id: impl Into<String>) -> Self {
        self.nodes.push(Node::End { id: id.into() });
        self
    }

    /// Add a FORK node.
    pub fn fork(mut self, id: impl Into<String>, branch_count: usize) -> Self {
        self.nodes.push(Node::Fork {
            id: id.into(),
            branch_count,
        });
        self
    }

    /// Add a JOIN node.
    pub fn join(mut self, id: impl Into<String>, strategy: JoinStrategy) -> Self {
        self.nodes.push(Node::Join {
            id: id.into(),
            strategy,
        });
        self
    }

    /// Add an edge from a single-output node.
    pub fn edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    /// Add an edge from a specific output handle.
    pub fn edge_from(
        mut self,
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.edges.push(Edge::with_handle(source, handle, target));
        self
    }

    /// Declare a form/system variable.
    pub fn variable(mut self, path: impl Into<String>, var_type: impl Into<String>) -> Self {
        self.variables.push(VariableDecl::new(path, var_type));
        self
    }

    /// Set the schema status.
    pub fn status(mut self, status: SchemaStatus) -> Self {
        self.status = status;
        self
    }

    /// Build the schema.
    pub fn build(self) -> PipelineSchema {
        PipelineSchema {
            id: self.id,
            version: self.version,
            nodes: self.nodes,
            edges: self.edges,
            variables: self.variables,
            status: self.status,
        }
    }
}
