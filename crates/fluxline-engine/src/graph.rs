//! Graph analysis over pipeline schemas
//!
//! Shared helpers for the validator and compiler: topological ordering with
//! cycle-member reporting (Kahn's algorithm), reachability, and dominator
//! sets for the execute-before relation.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::schema::{NodeId, PipelineSchema};

/// Topologically sort the schema's nodes.
///
/// Node order is stable with respect to declaration order. On a cycle,
/// returns `Err` with the ids of the cycle members. Kahn's algorithm also
/// leaves nodes that are merely downstream of a cycle undrained, so the
/// undrained set is filtered to nodes that can reach themselves.
pub fn topo_sort(schema: &PipelineSchema) -> Result<Vec<NodeId>, Vec<NodeId>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for node in &schema.nodes {
        in_degree.insert(node.id(), 0);
    }
    for edge in &schema.edges {
        if let Some(deg) = in_degree.get_mut(edge.target.as_str()) {
            *deg += 1;
        }
    }

    let mut queue: VecDeque<&str> = schema
        .nodes
        .iter()
        .map(|n| n.id())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(schema.nodes.len());
    while let Some(node_id) = queue.pop_front() {
        order.push(node_id.to_string());
        for edge in &schema.edges {
            if edge.source == node_id {
                if let Some(deg) = in_degree.get_mut(edge.target.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(&edge.target);
                    }
                }
            }
        }
    }

    if order.len() < schema.nodes.len() {
        let drained: HashSet<&str> = order.iter().map(String::as_str).collect();
        let undrained: HashSet<&str> = schema
            .nodes
            .iter()
            .map(|n| n.id())
            .filter(|id| !drained.contains(id))
            .collect();
        let cycle_members = schema
            .nodes
            .iter()
            .map(|n| n.id())
            .filter(|id| undrained.contains(id) && on_cycle(schema, id, &undrained))
            .map(str::to_string)
            .collect();
        return Err(cycle_members);
    }
    Ok(order)
}

/// Whether `node_id` can reach itself within the `within` subgraph.
fn on_cycle(schema: &PipelineSchema, node_id: &str, within: &HashSet<&str>) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for edge in schema.outgoing_edges(node_id) {
        if within.contains(edge.target.as_str()) && seen.insert(edge.target.as_str()) {
            queue.push_back(&edge.target);
        }
    }
    while let Some(current) = queue.pop_front() {
        if current == node_id {
            return true;
        }
        for edge in schema.outgoing_edges(current) {
            if within.contains(edge.target.as_str()) && seen.insert(edge.target.as_str()) {
                queue.push_back(&edge.target);
            }
        }
    }
    false
}

/// All node ids reachable from `start` (inclusive) along directed edges.
pub fn reachable_from(schema: &PipelineSchema, start: &str) -> HashSet<NodeId> {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    if schema.find_node(start).is_some() {
        seen.insert(start.to_string());
        queue.push_back(start);
    }
    while let Some(node_id) = queue.pop_front() {
        for edge in schema.outgoing_edges(node_id) {
            if seen.insert(edge.target.clone()) {
                queue.push_back(&edge.target);
            }
        }
    }
    seen
}

/// Dominator sets over the DAG: for each reachable node, the set of nodes
/// (including itself) that appear on *every* path from the entry to it.
///
/// A node `X` provably executes before node `N` on every path reaching `N`
/// exactly when `X` is in `dominators(N)` and `X != N`. `order` must be a
/// topological ordering of the schema.
pub fn dominators(
    schema: &PipelineSchema,
    entry: &str,
    order: &[NodeId],
) -> HashMap<NodeId, HashSet<NodeId>> {
    let mut dom: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
    dom.insert(entry.to_string(), HashSet::from([entry.to_string()]));

    for node_id in order {
        if node_id == entry {
            continue;
        }
        // Intersect the dominator sets of all (reachable) predecessors.
        let mut merged: Option<HashSet<NodeId>> = None;
        for edge in schema.incoming_edges(node_id) {
            let Some(pred_dom) = dom.get(edge.source.as_str()) else {
                continue;
            };
            merged = Some(match merged {
                None => pred_dom.clone(),
                Some(acc) => acc.intersection(pred_dom).cloned().collect(),
            });
        }
        if let Some(mut set) = merged {
            set.insert(node_id.clone());
            dom.insert(node_id.clone(), set);
        }
        // Unreachable nodes get no dominator entry.
    }
    dom
}
