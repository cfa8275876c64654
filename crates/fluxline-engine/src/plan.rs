//! DAG compiler
//!
//! Converts a validated schema into an executable plan: a topological
//! ordering plus, for each FORK/JOIN pair, the node membership of every
//! branch. The compiler is pure data transformation; a plan can be cached
//! and reused across runs of the same schema version.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::graph;
use crate::schema::{branch_handle, Node, NodeId, PipelineSchema};

/// One branch of a fork: its entry node and every node it owns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPlan {
    /// First node of the branch (target of the `branch-i` edge).
    pub head: NodeId,
    /// All nodes belonging to this branch, in topological order.
    /// Includes the head and any nested fork/join pairs; excludes the
    /// enclosing join.
    pub members: Vec<NodeId>,
}

/// A fork's resolved shape: its matching join and its branches in index order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkPlan {
    /// The JOIN node every branch converges on.
    pub join: NodeId,
    /// Branches indexed by their `branch-i` handle.
    pub branches: Vec<BranchPlan>,
}

/// An executable plan compiled from a validated schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Schema this plan was compiled from.
    pub schema_id: String,
    /// Schema version; a plan is only valid for its exact version.
    pub version: u32,
    /// Entry node of the walk.
    pub entry: NodeId,
    /// Full topological ordering of the schema.
    pub topo_order: Vec<NodeId>,
    /// Fork id → resolved branch grouping.
    pub forks: HashMap<NodeId, ForkPlan>,
}

/// Compile a validated schema into an executable plan.
pub fn compile(schema: &PipelineSchema) -> Result<ExecutionPlan> {
    let entry = schema
        .entry_node()
        .ok_or_else(|| EngineError::Plan("schema has no unique entry node".to_string()))?
        .id()
        .to_string();

    let topo_order = graph::topo_sort(schema)
        .map_err(|members| EngineError::Plan(format!("cycle through nodes {:?}", members)))?;

    let forks = map_forks(schema, &topo_order)?;

    Ok(ExecutionPlan {
        schema_id: schema.id.clone(),
        version: schema.version,
        entry,
        topo_order,
        forks,
    })
}

/// Resolve every FORK to its matching JOIN and branch membership.
///
/// Branch membership is computed by forward traversal from each `branch-i`
/// edge; nested fork/join pairs are balanced with a depth counter, so a
/// JOIN encountered at depth zero is the enclosing fork's join.
pub(crate) fn map_forks(
    schema: &PipelineSchema,
    topo_order: &[NodeId],
) -> Result<HashMap<NodeId, ForkPlan>> {
    let topo_index: HashMap<&str, usize> = topo_order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut forks = HashMap::new();
    for node in &schema.nodes {
        let Node::Fork { id, branch_count } = node else {
            continue;
        };

        let mut join: Option<NodeId> = None;
        let mut branches = Vec::with_capacity(*branch_count);

        for i in 0..*branch_count {
            let handle = branch_handle(i);
            let head = schema
                .outgoing_edges(id)
                .find(|e| e.source_handle.as_deref() == Some(handle.as_str()))
                .map(|e| e.target.clone())
                .ok_or_else(|| {
                    EngineError::Plan(format!("fork '{}' has no '{}' edge", id, handle))
                })?;

            let (mut members, branch_join) = trace_branch(schema, id, &head)?;
            match (&join, branch_join) {
                (None, found) => join = Some(found),
                (Some(expected), found) if *expected == found => {}
                (Some(expected), found) => {
                    return Err(EngineError::Plan(format!(
                        "fork '{}' branches converge on different joins ('{}' vs '{}')",
                        id, expected, found
                    )));
                }
            }

            members.sort_by_key(|m| topo_index.get(m.as_str()).copied().unwrap_or(usize::MAX));
            branches.push(BranchPlan { head, members });
        }

        let join = join
            .ok_or_else(|| EngineError::Plan(format!("fork '{}' declares no branches", id)))?;
        forks.insert(id.clone(), ForkPlan { join, branches });
    }
    Ok(forks)
}

/// Walk forward from a branch head until the enclosing join.
///
/// Returns the branch's member set and the join it terminates at.
fn trace_branch(
    schema: &PipelineSchema,
    fork_id: &str,
    head: &str,
) -> Result<(Vec<NodeId>, NodeId)> {
    let mut members: Vec<NodeId> = Vec::new();
    let mut seen: HashSet<(String, usize)> = HashSet::new();
    let mut stack: Vec<(String, usize)> = vec![(head.to_string(), 0)];
    let mut join: Option<NodeId> = None;

    // Nesting deeper than the schema's fork count means a cycle re-entered
    // a fork; bail out rather than walking forever.
    let max_depth = schema
        .nodes
        .iter()
        .filter(|n| matches!(n, Node::Fork { .. }))
        .count();

    while let Some((node_id, depth)) = stack.pop() {
        if depth > max_depth {
            return Err(EngineError::Plan(format!(
                "fork '{}' branch nesting exceeds the schema's fork count",
                fork_id
            )));
        }
        if !seen.insert((node_id.clone(), depth)) {
            continue;
        }
        let node = schema.find_node(&node_id).ok_or_else(|| {
            EngineError::Plan(format!("edge references unknown node '{}'", node_id))
        })?;

        let next_depth = match node {
            Node::Join { .. } if depth == 0 => {
                match &join {
                    None => join = Some(node_id.clone()),
                    Some(expected) if *expected == node_id => {}
                    Some(expected) => {
                        return Err(EngineError::Plan(format!(
                            "branch of fork '{}' reaches joins '{}' and '{}'",
                            fork_id, expected, node_id
                        )));
                    }
                }
                continue; // The enclosing join is not a branch member.
            }
            Node::Join { .. } => depth - 1,
            Node::Fork { .. } => depth + 1,
            Node::End { .. } => {
                return Err(EngineError::Plan(format!(
                    "branch of fork '{}' reaches END '{}' without a join",
                    fork_id, node_id
                )));
            }
            _ => depth,
        };

        if !members.contains(&node_id) {
            members.push(node_id.clone());
        }
        for edge in schema.outgoing_edges(&node_id) {
            stack.push((edge.target.clone(), next_depth));
        }
    }

    let join = join.ok_or_else(|| {
        EngineError::Plan(format!(
            "branch '{}' of fork '{}' never reaches a join",
            head, fork_id
        ))
    })?;
    Ok((members, join))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JoinStrategy, SchemaBuilder};
    use serde_json::json;

    fn fork_schema() -> PipelineSchema {
        SchemaBuilder::new("forked", 1)
            .provider("pre", "p", json!({}))
            .fork("fork", 2)
            .provider("a", "p", json!({}))
            .provider("a2", "p", json!({}))
            .provider("b", "p", json!({}))
            .join("join", JoinStrategy::All)
            .end("end")
            .edge("pre", "fork")
            .edge_from("fork", "branch-0", "a")
            .edge_from("fork", "branch-1", "b")
            .edge("a", "a2")
            .edge("a2", "join")
            .edge("b", "join")
            .edge("join", "end")
            .build()
    }

    #[test]
    fn test_compile_produces_topo_order() {
        let plan = compile(&fork_schema()).unwrap();
        assert_eq!(plan.entry, "pre");
        let pos = |id: &str| plan.topo_order.iter().position(|n| n == id).unwrap();
        assert!(pos("pre") < pos("fork"));
        assert!(pos("fork") < pos("join"));
        assert!(pos("a") < pos("a2"));
        assert!(pos("join") < pos("end"));
    }

    #[test]
    fn test_branch_grouping() {
        let plan = compile(&fork_schema()).unwrap();
        let fork = &plan.forks["fork"];
        assert_eq!(fork.join, "join");
        assert_eq!(fork.branches.len(), 2);
        assert_eq!(fork.branches[0].head, "a");
        assert_eq!(fork.branches[0].members, vec!["a", "a2"]);
        assert_eq!(fork.branches[1].members, vec!["b"]);
    }

    #[test]
    fn test_nested_forks() {
        let schema = SchemaBuilder::new("nested", 1)
            .provider("pre", "p", json!({}))
            .fork("outer", 2)
            .fork("inner", 2)
            .provider("i0", "p", json!({}))
            .provider("i1", "p", json!({}))
            .join("inner-join", JoinStrategy::All)
            .provider("solo", "p", json!({}))
            .join("outer-join", JoinStrategy::All)
            .end("end")
            .edge("pre", "outer")
            .edge_from("outer", "branch-0", "inner")
            .edge_from("outer", "branch-1", "solo")
            .edge_from("inner", "branch-0", "i0")
            .edge_from("inner", "branch-1", "i1")
            .edge("i0", "inner-join")
            .edge("i1", "inner-join")
            .edge("inner-join", "outer-join")
            .edge("solo", "outer-join")
            .edge("outer-join", "end")
            .build();

        let plan = compile(&schema).unwrap();
        let outer = &plan.forks["outer"];
        assert_eq!(outer.join, "outer-join");
        // The nested pair belongs to branch 0 of the outer fork.
        assert!(outer.branches[0].members.contains(&"inner".to_string()));
        assert!(outer.branches[0].members.contains(&"inner-join".to_string()));
        assert!(!outer.branches[0].members.contains(&"outer-join".to_string()));
        assert_eq!(outer.branches[1].members, vec!["solo"]);

        let inner = &plan.forks["inner"];
        assert_eq!(inner.join, "inner-join");
        assert_eq!(inner.branches[0].members, vec!["i0"]);
    }

    #[test]
    fn test_branch_without_join_is_rejected() {
        let schema = SchemaBuilder::new("bad", 1)
            .fork("fork", 2)
            .provider("a", "p", json!({}))
            .provider("b", "p", json!({}))
            .end("end")
            .edge_from("fork", "branch-0", "a")
            .edge_from("fork", "branch-1", "b")
            .edge("a", "end")
            .edge("b", "end")
            .build();
        assert!(compile(&schema).is_err());
    }

    #[test]
    fn test_plan_is_cacheable() {
        let plan = compile(&fork_schema()).unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let restored: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.topo_order, plan.topo_order);
        assert_eq!(restored.forks["fork"].join, "join");
    }
}
