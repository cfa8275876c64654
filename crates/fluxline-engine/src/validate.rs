//! Static schema validation.
//!
//! Checks run in four classes: structural rules, acyclicity,
//! reachability, then variable closure. A failing class stops the later
//! classes, since they build on its guarantees, but every violation
//! within a class is reported.

use std::collections::{HashMap, HashSet};

use crate::expr::Expression;
use crate::graph;
use crate::plan;
use crate::schema::{
    parse_branch_handle, Edge, Node, NodeId, PipelineSchema, HANDLE_FALSE, HANDLE_TRUE,
};
use crate::vars::{self, Scope};

/// A single validation failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    UnknownEdgeEndpoint {
        source: NodeId,
        target: NodeId,
        missing: NodeId,
    },
    DuplicateNodeId {
        node_id: NodeId,
    },
    NoEntryNode,
    MultipleEntryNodes {
        node_ids: Vec<NodeId>,
    },
    EndHasOutgoing {
        node_id: NodeId,
    },
    WrongOutgoingCount {
        node_id: NodeId,
        expected: usize,
        found: usize,
    },
    UnexpectedHandle {
        node_id: NodeId,
        handle: String,
    },
    ConditionHandles {
        node_id: NodeId,
    },
    ForkBranchMismatch {
        node_id: NodeId,
        expected: usize,
        found: usize,
    },
    ForkHandleInvalid {
        node_id: NodeId,
        handle: Option<String>,
    },
    ForkHandleDuplicate {
        node_id: NodeId,
        handle: String,
    },
    JoinWithoutFork {
        join_id: NodeId,
    },
    JoinInDegree {
        join_id: NodeId,
        expected: usize,
        found: usize,
    },
    BranchStructure {
        message: String,
    },
    Cycle {
        members: Vec<NodeId>,
    },
    Unreachable {
        node_id: NodeId,
    },
    NoReachableEnd,
    UnknownScope {
        node_id: NodeId,
        path: String,
    },
    UndeclaredVariable {
        node_id: NodeId,
        path: String,
    },
    NodeRefNotProducer {
        node_id: NodeId,
        path: String,
    },
    NodeRefNotGuaranteed {
        node_id: NodeId,
        path: String,
    },
    InvalidExpression {
        node_id: NodeId,
        message: String,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::UnknownEdgeEndpoint {
                source,
                target,
                missing,
            } => write!(
                f,
                "edge '{}' -> '{}' references unknown node '{}'",
                source, target, missing
            ),
            Violation::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id '{}'", node_id)
            }
            Violation::NoEntryNode => write!(f, "schema has no entry node (every node has an incoming edge)"),
            Violation::MultipleEntryNodes { node_ids } => write!(
                f,
                "schema has multiple entry nodes: {}",
                node_ids.join(", ")
            ),
            Violation::EndHasOutgoing { node_id } => {
                write!(f, "END node '{}' must not have outgoing edges", node_id)
            }
            Violation::WrongOutgoingCount {
                node_id,
                expected,
                found,
            } => write!(
                f,
                "node '{}' must have exactly {} outgoing edge(s), found {}",
                node_id, expected, found
            ),
            Violation::UnexpectedHandle { node_id, handle } => write!(
                f,
                "node '{}' has a single output but its edge names handle '{}'",
                node_id, handle
            ),
            Violation::ConditionHandles { node_id } => write!(
                f,
                "CONDITION node '{}' must have exactly one '{}' edge and one '{}' edge",
                node_id, HANDLE_TRUE, HANDLE_FALSE
            ),
            Violation::ForkBranchMismatch {
                node_id,
                expected,
                found,
            } => write!(
                f,
                "FORK node '{}' declares {} branches but has {} outgoing edges",
                node_id, expected, found
            ),
            Violation::ForkHandleInvalid { node_id, handle } => match handle {
                Some(h) => write!(
                    f,
                    "FORK node '{}' edge handle '{}' is not a valid branch handle",
                    node_id, h
                ),
                None => write!(f, "FORK node '{}' has an edge without a branch handle", node_id),
            },
            Violation::ForkHandleDuplicate { node_id, handle } => write!(
                f,
                "FORK node '{}' has more than one edge on handle '{}'",
                node_id, handle
            ),
            Violation::JoinWithoutFork { join_id } => {
                write!(f, "JOIN node '{}' is not paired with any FORK", join_id)
            }
            Violation::JoinInDegree {
                join_id,
                expected,
                found,
            } => write!(
                f,
                "JOIN node '{}' must receive {} branch edge(s), found {}",
                join_id, expected, found
            ),
            Violation::BranchStructure { message } => write!(f, "{}", message),
            Violation::Cycle { members } => {
                write!(f, "schema contains a cycle involving: {}", members.join(", "))
            }
            Violation::Unreachable { node_id } => {
                write!(f, "node '{}' is unreachable from the entry node", node_id)
            }
            Violation::NoReachableEnd => {
                write!(f, "no END node is reachable from the entry node")
            }
            Violation::UnknownScope { node_id, path } => write!(
                f,
                "node '{}' references '{}' which is not in the form, system, or node scope",
                node_id, path
            ),
            Violation::UndeclaredVariable { node_id, path } => write!(
                f,
                "node '{}' references undeclared variable '{}'",
                node_id, path
            ),
            Violation::NodeRefNotProducer { node_id, path } => write!(
                f,
                "node '{}' references '{}' but the referenced node does not produce output",
                node_id, path
            ),
            Violation::NodeRefNotGuaranteed { node_id, path } => write!(
                f,
                "node '{}' references '{}' but the referenced node is not guaranteed to have executed",
                node_id, path
            ),
            Violation::InvalidExpression { node_id, message } => write!(
                f,
                "CONDITION node '{}' has an invalid expression: {}",
                node_id, message
            ),
        }
    }
}

/// Knobs for checks whose severity is debatable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorConfig {
    /// Treat unreachable nodes as violations instead of warnings.
    pub unreachable_is_error: bool,
}

/// Outcome of validating a schema.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    pub warnings: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable messages, violations first.
    pub fn messages(&self) -> Vec<String> {
        self.violations
            .iter()
            .chain(self.warnings.iter())
            .map(|v| v.to_string())
            .collect()
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "valid");
        }
        let msgs: Vec<String> = self.violations.iter().map(|v| v.to_string()).collect();
        write!(f, "{} violation(s): {}", msgs.len(), msgs.join("; "))
    }
}

/// Validate a schema with default settings.
pub fn validate(schema: &PipelineSchema) -> ValidationReport {
    validate_with(schema, &ValidatorConfig::default())
}

/// Validate a schema, reporting per-class violations and warnings.
pub fn validate_with(schema: &PipelineSchema, config: &ValidatorConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    structural(schema, &mut report);
    if !report.violations.is_empty() {
        return report;
    }

    let topo_order = match graph::topo_sort(schema) {
        Ok(order) => order,
        Err(members) => {
            report.violations.push(Violation::Cycle { members });
            return report;
        }
    };

    // Structural checks guarantee a unique entry exists.
    let entry = match schema.entry_node() {
        Some(node) => node.id().to_string(),
        None => return report,
    };

    let reachable = graph::reachable_from(schema, &entry);
    for node in &schema.nodes {
        if !reachable.contains(node.id()) {
            let violation = Violation::Unreachable {
                node_id: node.id().to_string(),
            };
            if config.unreachable_is_error {
                report.violations.push(violation);
            } else {
                log::warn!("schema '{}': {}", schema.id, violation);
                report.warnings.push(violation);
            }
        }
    }
    let end_reachable = schema
        .nodes
        .iter()
        .any(|n| matches!(n, Node::End { .. }) && reachable.contains(n.id()));
    if !end_reachable {
        report.violations.push(Violation::NoReachableEnd);
    }
    if !report.violations.is_empty() {
        return report;
    }

    closure(schema, &entry, &topo_order, &mut report);
    report
}

fn structural(schema: &PipelineSchema, report: &mut ValidationReport) {
    let mut ids: HashSet<&str> = HashSet::new();
    for node in &schema.nodes {
        if !ids.insert(node.id()) {
            report.violations.push(Violation::DuplicateNodeId {
                node_id: node.id().to_string(),
            });
        }
    }

    for edge in &schema.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !ids.contains(endpoint.as_str()) {
                report.violations.push(Violation::UnknownEdgeEndpoint {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    let mut entries: Vec<NodeId> = schema
        .nodes
        .iter()
        .filter(|n| schema.incoming_edges(n.id()).next().is_none())
        .map(|n| n.id().to_string())
        .collect();
    match entries.len() {
        0 => report.violations.push(Violation::NoEntryNode),
        1 => {}
        _ => {
            entries.sort();
            report
                .violations
                .push(Violation::MultipleEntryNodes { node_ids: entries });
        }
    }

    for node in &schema.nodes {
        let outgoing: Vec<&Edge> = schema.outgoing_edges(node.id()).collect();
        match node {
            Node::End { id } => {
                if !outgoing.is_empty() {
                    report.violations.push(Violation::EndHasOutgoing {
                        node_id: id.clone(),
                    });
                }
            }
            Node::Provider { id, .. } | Node::PostProcess { id, .. } => {
                if outgoing.len() != 1 {
                    report.violations.push(Violation::WrongOutgoingCount {
                        node_id: id.clone(),
                        expected: 1,
                        found: outgoing.len(),
                    });
                }
                for edge in &outgoing {
                    if let Some(handle) = &edge.source_handle {
                        report.violations.push(Violation::UnexpectedHandle {
                            node_id: id.clone(),
                            handle: handle.clone(),
                        });
                    }
                }
            }
            Node::Condition { id, .. } => {
                let handles: Vec<Option<&str>> = outgoing
                    .iter()
                    .map(|e| e.source_handle.as_deref())
                    .collect();
                let ok = handles.len() == 2
                    && handles.contains(&Some(HANDLE_TRUE))
                    && handles.contains(&Some(HANDLE_FALSE));
                if !ok {
                    report.violations.push(Violation::ConditionHandles {
                        node_id: id.clone(),
                    });
                }
            }
            Node::Fork {
                id, branch_count, ..
            } => {
                if outgoing.len() != *branch_count {
                    report.violations.push(Violation::ForkBranchMismatch {
                        node_id: id.clone(),
                        expected: *branch_count,
                        found: outgoing.len(),
                    });
                }
                let mut seen: HashSet<usize> = HashSet::new();
                for edge in &outgoing {
                    let index = edge.source_handle.as_deref().and_then(parse_branch_handle);
                    match index {
                        Some(i) if i < *branch_count => {
                            if !seen.insert(i) {
                                report.violations.push(Violation::ForkHandleDuplicate {
                                    node_id: id.clone(),
                                    handle: edge
                                        .source_handle
                                        .clone()
                                        .unwrap_or_default(),
                                });
                            }
                        }
                        _ => report.violations.push(Violation::ForkHandleInvalid {
                            node_id: id.clone(),
                            handle: edge.source_handle.clone(),
                        }),
                    }
                }
            }
            Node::Join { id, .. } => {
                if outgoing.len() != 1 {
                    report.violations.push(Violation::WrongOutgoingCount {
                        node_id: id.clone(),
                        expected: 1,
                        found: outgoing.len(),
                    });
                }
                for edge in &outgoing {
                    if let Some(handle) = &edge.source_handle {
                        report.violations.push(Violation::UnexpectedHandle {
                            node_id: id.clone(),
                            handle: handle.clone(),
                        });
                    }
                }
            }
        }
    }

    // Fork/join pairing builds on the per-node rules above.
    if report.violations.is_empty() {
        pairing(schema, report);
    }
}

fn pairing(schema: &PipelineSchema, report: &mut ValidationReport) {
    let forks = match plan::map_forks(schema, &[]) {
        Ok(forks) => forks,
        Err(err) => {
            report.violations.push(Violation::BranchStructure {
                message: err.to_string(),
            });
            return;
        }
    };

    let mut claimed: HashMap<&str, usize> = HashMap::new();
    for fork in forks.values() {
        *claimed.entry(fork.join.as_str()).or_default() += 1;
    }

    for node in &schema.nodes {
        let Node::Join { id, .. } = node else {
            continue;
        };
        match claimed.get(id.as_str()) {
            None => report.violations.push(Violation::JoinWithoutFork {
                join_id: id.clone(),
            }),
            Some(1) => {}
            Some(_) => report.violations.push(Violation::BranchStructure {
                message: format!("JOIN node '{}' is claimed by more than one FORK", id),
            }),
        }
    }

    for (fork_id, fork) in &forks {
        let expected = fork.branches.len();
        let found = schema.incoming_edges(&fork.join).count();
        if found != expected {
            log::debug!(
                "fork '{}' join '{}' in-degree mismatch ({} vs {})",
                fork_id,
                fork.join,
                found,
                expected
            );
            report.violations.push(Violation::JoinInDegree {
                join_id: fork.join.clone(),
                expected,
                found,
            });
        }
    }
}

/// Variable closure: every reference a node makes must be a declared
/// input or the output of a producer that runs before it on every path.
///
/// "Before it on every path" is dominator membership, widened by ALL
/// joins: once an ALL join has run, every branch member has run, so a
/// node dominated by the join may read branch outputs. ANY and FIRST
/// joins guarantee nothing about which branch ran.
fn closure(
    schema: &PipelineSchema,
    entry: &str,
    topo_order: &[NodeId],
    report: &mut ValidationReport,
) {
    let mut doms = graph::dominators(schema, entry, topo_order);
    if let Ok(forks) = plan::map_forks(schema, topo_order) {
        widen_past_all_joins(schema, &forks, &mut doms);
    }
    let declared: Vec<&str> = schema.variables.iter().map(|v| v.path.as_str()).collect();

    for node in &schema.nodes {
        let mut refs: Vec<String> = Vec::new();
        if let Some(template) = node.input_template() {
            refs.extend(vars::template_refs(template));
        }
        if let Node::Condition { id, expression } = node {
            match Expression::parse(expression) {
                Ok(expr) => refs.extend(expr.referenced_paths()),
                Err(message) => {
                    report.violations.push(Violation::InvalidExpression {
                        node_id: id.clone(),
                        message,
                    });
                    continue;
                }
            }
        }

        let mut checked: HashSet<&str> = HashSet::new();
        for path in &refs {
            if !checked.insert(path.as_str()) {
                continue;
            }
            check_reference(schema, node, path, &declared, &doms, report);
        }
    }
}

/// Add ALL-join branch members to the dominator set of every node the
/// join dominates.
fn widen_past_all_joins(
    schema: &PipelineSchema,
    forks: &HashMap<NodeId, plan::ForkPlan>,
    doms: &mut HashMap<NodeId, HashSet<NodeId>>,
) {
    for (fork_id, fork) in forks {
        if !is_all_join(schema, &fork.join) {
            continue;
        }
        let extra = guaranteed_members(schema, forks, fork_id);
        for set in doms.values_mut() {
            if set.contains(&fork.join) {
                set.extend(extra.iter().cloned());
            }
        }
    }
}

fn is_all_join(schema: &PipelineSchema, join_id: &str) -> bool {
    matches!(
        schema.find_node(join_id),
        Some(Node::Join {
            strategy: crate::schema::JoinStrategy::All,
            ..
        })
    )
}

/// Members of a fork's branches that are certain to have run once its
/// ALL join resolves. Members inside nested non-ALL forks are excluded;
/// nested ALL forks contribute recursively.
fn guaranteed_members(
    schema: &PipelineSchema,
    forks: &HashMap<NodeId, plan::ForkPlan>,
    fork_id: &str,
) -> HashSet<NodeId> {
    let mut extra = HashSet::new();
    let Some(fork) = forks.get(fork_id) else {
        return extra;
    };
    for branch in &fork.branches {
        let mut nested: HashSet<&str> = HashSet::new();
        for member in &branch.members {
            if let Some(inner) = forks.get(member.as_str()) {
                for inner_branch in &inner.branches {
                    nested.extend(inner_branch.members.iter().map(|m| m.as_str()));
                }
            }
        }
        for member in &branch.members {
            if !nested.contains(member.as_str()) {
                extra.insert(member.clone());
            }
            if forks.contains_key(member.as_str()) && is_all_join(schema, &forks[member.as_str()].join)
            {
                extra.extend(guaranteed_members(schema, forks, member));
            }
        }
    }
    extra
}

fn check_reference(
    schema: &PipelineSchema,
    node: &Node,
    path: &str,
    declared: &[&str],
    doms: &HashMap<NodeId, HashSet<NodeId>>,
    report: &mut ValidationReport,
) {
    match Scope::of(path) {
        None => report.violations.push(Violation::UnknownScope {
            node_id: node.id().to_string(),
            path: path.to_string(),
        }),
        Some(Scope::Form) | Some(Scope::System) => {
            let covered = declared
                .iter()
                .any(|decl| path == *decl || path.starts_with(&format!("{}.", decl)));
            if !covered {
                report.violations.push(Violation::UndeclaredVariable {
                    node_id: node.id().to_string(),
                    path: path.to_string(),
                });
            }
        }
        Some(Scope::Node) => {
            let Some(target) = vars::node_ref(path) else {
                report.violations.push(Violation::UnknownScope {
                    node_id: node.id().to_string(),
                    path: path.to_string(),
                });
                return;
            };
            let producer = schema
                .find_node(target)
                .is_some_and(|n| n.is_producer());
            if !producer {
                report.violations.push(Violation::NodeRefNotProducer {
                    node_id: node.id().to_string(),
                    path: path.to_string(),
                });
                return;
            }
            // A node dominates itself, but it cannot read its own output.
            let guaranteed = target != node.id()
                && doms
                    .get(node.id())
                    .is_some_and(|set| set.contains(target));
            if !guaranteed {
                report.violations.push(Violation::NodeRefNotGuaranteed {
                    node_id: node.id().to_string(),
                    path: path.to_string(),
                });
            }
        }
    }
}
