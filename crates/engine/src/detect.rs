//! Walks CFG nodes and annotates them with mitigation instances from the
//! active pattern catalog.
//!
//! Detection order is deterministic: catalog order first, then node order
//! (ascending id), so repeated runs over identical input produce identical
//! instance lists. Instance lists only ever grow.

use catalog::PatternCatalog;
use ir::{
    CfgNodeKind, CodeEvent, ControlFlowGraph, MitigationInstance, MitigationScope, NodeId,
};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Annotates `graph` with every catalog match and returns the number of
/// instances recorded.
pub fn detect_mitigations(
    graph: &mut ControlFlowGraph,
    catalog: &PatternCatalog,
    module_level: bool,
) -> usize {
    let mut found: Vec<(NodeId, MitigationInstance)> = Vec::new();

    for compiled in catalog.iter() {
        for node in graph.nodes.values() {
            for event in &node.events {
                if !compiled.matches(event) {
                    continue;
                }
                let scope = if module_level {
                    MitigationScope::Module
                } else if dominates_exits(graph, node.id) {
                    MitigationScope::Function
                } else {
                    MitigationScope::Block
                };
                let instance = MitigationInstance {
                    pattern_id: compiled.id().to_string(),
                    file: graph.file.clone(),
                    line: event.line(),
                    mitigates: compiled.pattern.mitigates.clone(),
                    scope,
                    protected_vars: protected_vars(event),
                    confidence: compiled.pattern.confidence,
                };
                debug!(
                    function = %graph.name,
                    pattern = %instance.pattern_id,
                    line = instance.line,
                    scope = ?scope,
                    "mitigation detected"
                );
                found.push((node.id, instance));
            }
        }
    }

    let count = found.len();
    for (node_id, instance) in found {
        if let Some(node) = graph.node_mut(node_id) {
            node.mitigations.push(instance);
        }
    }
    count
}

fn protected_vars(event: &CodeEvent) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    match event {
        CodeEvent::Call {
            args, assigned_to, ..
        } => {
            vars.extend(args.iter().filter(|a| is_identifier(a)).cloned());
            if let Some(target) = assigned_to {
                vars.insert(target.clone());
            }
        }
        CodeEvent::Guard { args, .. } => {
            vars.extend(args.iter().filter(|a| is_identifier(a)).cloned());
        }
    }
    vars
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

/// True when every path from entry to any exit passes through `node`:
/// removing it must leave no exit reachable.
fn dominates_exits(graph: &ControlFlowGraph, node: NodeId) -> bool {
    if graph.entry == node {
        return true;
    }
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([graph.entry]);
    while let Some(n) = queue.pop_front() {
        if n == node || !visited.insert(n) {
            continue;
        }
        if graph.exits.contains(&n) && graph.node(n).map(|x| x.kind) != Some(CfgNodeKind::Throw)
        {
            // A normal exit is reachable without the candidate node.
            return false;
        }
        for e in graph.successors(n) {
            if e.to != node && !visited.contains(&e.to) {
                queue.push_back(e.to);
            }
        }
    }
    true
}
