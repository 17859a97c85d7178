//! Control flow graph representation for one function.
//!
//! Nodes are basic blocks or control points, edges carry the transition
//! kind. Graphs are created once per function per run by the engine's
//! builder, annotated in place by the mitigation detector, and discarded
//! after the function's findings are emitted.

use crate::{MitigationInstance, Span};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
/// Identifier of a node within its owning graph.
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Kind of a CFG node. Fixed at creation.
pub enum CfgNodeKind {
    Entry,
    Exit,
    /// Exceptional exit (uncaught throw).
    Throw,
    Basic,
    Branch,
    Merge,
    LoopHeader,
    LoopBody,
    Call,
    /// Async boundary. Mitigation context established earlier in the same
    /// function stays valid past it; cross-function tracking does not.
    Await,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Kind of a CFG edge.
pub enum EdgeKind {
    Sequential,
    BranchTrue,
    BranchFalse,
    LoopBack,
    LoopExit,
    Exception,
    Return,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Transition between two nodes of the owning graph.
pub struct CfgEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
    /// Branch value label for per-case switch edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// What a node contains, extracted at build time so later passes never
/// re-walk the AST.
pub enum CodeEvent {
    /// A call expression: `assigned_to` is set when the result is bound.
    Call {
        name: String,
        #[serde(default)]
        module: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        assigned_to: Option<String>,
        line: usize,
    },
    /// A call used as a branch condition (`if (isValid(x))`).
    Guard {
        name: String,
        #[serde(default)]
        module: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        line: usize,
    },
}

impl CodeEvent {
    pub fn name(&self) -> &str {
        match self {
            CodeEvent::Call { name, .. } | CodeEvent::Guard { name, .. } => name,
        }
    }

    pub fn line(&self) -> usize {
        match self {
            CodeEvent::Call { line, .. } | CodeEvent::Guard { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
/// Outcome of resolving a call site against the run's function set.
pub enum Resolution {
    /// Callee is another analyzed function.
    Resolved { function_id: String },
    /// Callee named but not part of the changed set (library, framework).
    External,
    /// Computed callee. Never resolvable statically.
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Call recorded during lowering, resolved by the orchestrator before path
/// analysis runs.
pub struct CallSite {
    pub node: NodeId,
    pub callee: String,
    #[serde(default)]
    pub module: Option<String>,
    pub resolution: Resolution,
    pub line: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Basic block or control point.
pub struct CfgNode {
    pub id: NodeId,
    pub kind: CfgNodeKind,
    pub span: Span,
    #[serde(default)]
    pub events: Vec<CodeEvent>,
    /// Grows monotonically during detection, never shrinks.
    #[serde(default)]
    pub mitigations: Vec<MitigationInstance>,
    #[serde(default)]
    pub tainted: BTreeSet<String>,
}

impl CfgNode {
    pub fn new(id: NodeId, kind: CfgNodeKind, span: Span) -> Self {
        Self {
            id,
            kind,
            span,
            events: Vec::new(),
            mitigations: Vec::new(),
            tainted: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One function's execution shape.
pub struct ControlFlowGraph {
    /// Function id this graph was lowered from.
    pub id: String,
    pub name: String,
    pub file: String,
    pub span: Span,
    pub nodes: BTreeMap<NodeId, CfgNode>,
    pub edges: Vec<CfgEdge>,
    pub entry: NodeId,
    pub exits: Vec<NodeId>,
    pub call_sites: Vec<CallSite>,
}

/// Structural defect found by [`ControlFlowGraph::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphDefect {
    MissingEntry,
    NoExit,
    DanglingEdge { from: NodeId, to: NodeId },
}

impl fmt::Display for GraphDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphDefect::MissingEntry => write!(f, "entry node missing from node map"),
            GraphDefect::NoExit => write!(f, "graph has no exit node"),
            GraphDefect::DanglingEdge { from, to } => {
                write!(f, "edge {from} -> {to} references a missing node")
            }
        }
    }
}

impl ControlFlowGraph {
    /// Successor (target, edge) pairs of `node` in edge insertion order.
    pub fn successors(&self, node: NodeId) -> impl Iterator<Item = &CfgEdge> {
        self.edges.iter().filter(move |e| e.from == node)
    }

    pub fn node(&self, id: NodeId) -> Option<&CfgNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut CfgNode> {
        self.nodes.get_mut(&id)
    }

    /// First node whose span covers `line`, preferring the tightest span.
    /// Used to anchor a candidate sink onto the graph.
    pub fn node_at_line(&self, line: usize) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.span.line <= line && line <= n.span.end_line)
            .min_by_key(|n| (n.span.end_line - n.span.line, n.id))
            .map(|n| n.id)
    }

    /// Checks the structural invariants: exactly one entry present in the
    /// node map, at least one exit, every edge endpoint exists.
    pub fn validate(&self) -> Result<(), GraphDefect> {
        if !self.nodes.contains_key(&self.entry) {
            return Err(GraphDefect::MissingEntry);
        }
        if self.exits.is_empty() {
            return Err(GraphDefect::NoExit);
        }
        for e in &self.edges {
            if !self.nodes.contains_key(&e.from) || !self.nodes.contains_key(&e.to) {
                return Err(GraphDefect::DanglingEdge {
                    from: e.from,
                    to: e.to,
                });
            }
        }
        Ok(())
    }

    /// Exports the graph to DOT format for debugging.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph CFG {\n");
        for node in self.nodes.values() {
            out.push_str(&format!(
                "    {} [label=\"{:?}:{}\"];\n",
                node.id.0, node.kind, node.span.line
            ));
        }
        for e in &self.edges {
            out.push_str(&format!(
                "    {} -> {} [label=\"{:?}\"];\n",
                e.from.0, e.to.0, e.kind
            ));
        }
        out.push('}');
        out
    }
}
