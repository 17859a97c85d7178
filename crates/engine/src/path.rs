//! Reachability and path-coverage analysis.
//!
//! Computes which execution paths reach a candidate sink and how many of
//! them carry an applicable mitigation. Callee functions are summarized up
//! to a bounded depth with a per-run memo cache; anything the analysis
//! cannot resolve statically (dynamic callees, depth overruns, mitigation
//! context carried across async boundaries between functions) is assumed
//! unmitigated, so degradation always fails toward reporting.

use crate::budget::AnalysisBudget;
use crate::cfg::build_cfg;
use crate::detect::detect_mitigations;
use catalog::PatternCatalog;
use ir::{
    CfgNodeKind, ControlFlowGraph, EdgeKind, MitigationInstance, NodeId,
    PotentialVulnerability, Resolution, SourceFile, SourceFunction, VulnType,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Ceiling on enumerated paths per query; hitting it degrades the result.
pub const MAX_PATHS: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
/// Why a coverage result is weaker than a full analysis would be.
pub enum DegradeReason {
    DepthLimit,
    DynamicCall,
    AsyncBoundary,
    PathCap,
    NodeLimit,
    UnanchoredSink,
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DegradeReason::DepthLimit => "call depth limit reached",
            DegradeReason::DynamicCall => "dynamic call not resolvable",
            DegradeReason::AsyncBoundary => "mitigation context not tracked across async boundary",
            DegradeReason::PathCap => "path enumeration capped",
            DegradeReason::NodeLimit => "node visit limit reached",
            DegradeReason::UnanchoredSink => "sink not anchored to the control flow graph",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
/// One path through a CFG from entry toward a sink.
pub struct ExecutionPath {
    pub nodes: Vec<NodeId>,
    pub mitigations: Vec<String>,
    pub complete: bool,
    pub signature: String,
}

/// Deterministic signature of a node sequence, for dedup.
pub fn path_signature(nodes: &[NodeId]) -> String {
    let mut hasher = blake3::Hasher::new();
    for n in nodes {
        hasher.update(&n.0.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Clone, Default)]
/// Result of a coverage query for one sink.
pub struct PathCoverage {
    pub paths_total: usize,
    pub paths_covered: usize,
    /// Human-readable descriptions of the uncovered paths.
    pub unprotected: Vec<String>,
    /// Pattern ids credited on at least one covered path.
    pub mitigations: BTreeSet<String>,
    /// Deepest call frame consulted while answering the query.
    pub depth_reached: u64,
    pub degraded: BTreeSet<DegradeReason>,
}

#[derive(Debug, Clone, Default)]
/// What a callee guarantees to every caller: the vulnerability types for
/// which every complete path through it carries an applicable mitigation,
/// with the pattern ids that provided the cover.
pub struct FunctionSummary {
    pub guaranteed: BTreeMap<VulnType, BTreeSet<String>>,
}

#[derive(Debug, Default)]
struct QueryState {
    depth_reached: u64,
    degraded: BTreeSet<DegradeReason>,
}

/// Per-run shared analysis state: lowered graphs, callee summaries and the
/// module-scope instances collected per file. Shared mutable pieces are
/// lock-guarded so per-file fan-out can run in parallel.
pub struct AnalysisContext<'a> {
    pub budget: &'a AnalysisBudget,
    catalog: &'a PatternCatalog,
    functions: HashMap<String, &'a SourceFunction>,
    name_index: HashMap<String, Vec<String>>,
    graphs: Mutex<HashMap<String, Option<Arc<ControlFlowGraph>>>>,
    summaries: Mutex<HashMap<String, Option<Arc<FunctionSummary>>>>,
    in_progress: Mutex<HashSet<String>>,
    module_instances: Mutex<HashMap<String, Arc<Vec<MitigationInstance>>>>,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(
        files: &'a [SourceFile],
        catalog: &'a PatternCatalog,
        budget: &'a AnalysisBudget,
    ) -> Self {
        let mut functions = HashMap::new();
        let mut name_index: HashMap<String, Vec<String>> = HashMap::new();
        for file in files {
            for func in &file.functions {
                functions.insert(func.id.clone(), func);
                name_index
                    .entry(func.name.clone())
                    .or_default()
                    .push(func.id.clone());
            }
        }
        Self {
            budget,
            catalog,
            functions,
            name_index,
            graphs: Mutex::new(HashMap::new()),
            summaries: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(HashSet::new()),
            module_instances: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves named call sites against the run's function set: a
    /// same-file match wins, otherwise a globally unique name resolves,
    /// anything else stays external.
    pub fn resolve_call_sites(&self, graph: &mut ControlFlowGraph) {
        let file = graph.file.clone();
        for cs in &mut graph.call_sites {
            if cs.resolution != Resolution::External {
                continue;
            }
            let Some(candidates) = self.name_index.get(&cs.callee) else {
                continue;
            };
            let same_file: Vec<&String> = candidates
                .iter()
                .filter(|fid| {
                    self.functions
                        .get(*fid)
                        .is_some_and(|f| f.file == file && f.id != graph.id)
                })
                .collect();
            let chosen = match same_file.as_slice() {
                [only] => Some((*only).clone()),
                [] if candidates.len() == 1 && candidates[0] != graph.id => {
                    Some(candidates[0].clone())
                }
                _ => None,
            };
            if let Some(function_id) = chosen {
                cs.resolution = Resolution::Resolved { function_id };
            }
        }
    }

    /// Registers a graph the orchestrator already lowered and annotated.
    pub fn insert_graph(&self, graph: Arc<ControlFlowGraph>) {
        self.graphs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(graph.id.clone(), Some(graph));
    }

    /// Records the module-scope instances collected for a file.
    pub fn set_module_instances(&self, file: &str, instances: Vec<MitigationInstance>) {
        self.module_instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file.to_string(), Arc::new(instances));
    }

    fn module_instances_for(&self, file: &str) -> Arc<Vec<MitigationInstance>> {
        self.module_instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    /// Fetches a callee graph, lowering and annotating it on demand when
    /// its file has not been processed yet.
    fn graph(&self, function_id: &str) -> Option<Arc<ControlFlowGraph>> {
        if let Some(cached) = self
            .graphs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(function_id)
        {
            return cached.clone();
        }
        let built = self.functions.get(function_id).and_then(|func| {
            match build_cfg(func) {
                Ok(mut graph) => {
                    detect_mitigations(&mut graph, self.catalog, func.is_module_init);
                    self.resolve_call_sites(&mut graph);
                    Some(Arc::new(graph))
                }
                Err(e) => {
                    debug!(function = %func.name, error = %e, "callee lowering failed");
                    None
                }
            }
        });
        self.graphs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(function_id.to_string(), built.clone());
        built
    }

    /// Summarizes a callee at the given depth. Depth is an explicit
    /// parameter checked against the budget's effective ceiling; cycles
    /// and failures summarize to `None`, which callers treat as
    /// unmitigated.
    fn summarize(
        &self,
        function_id: &str,
        depth: u64,
        state: &mut QueryState,
    ) -> Option<Arc<FunctionSummary>> {
        state.depth_reached = state.depth_reached.max(depth);
        if depth > self.budget.effective_call_depth() {
            state.degraded.insert(DegradeReason::DepthLimit);
            return None;
        }
        if let Some(cached) = self
            .summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(function_id)
        {
            return cached.clone();
        }
        {
            let mut in_progress = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
            if !in_progress.insert(function_id.to_string()) {
                // Recursive call chain; cut conservatively.
                return None;
            }
        }
        let summary = self
            .graph(function_id)
            .map(|graph| Arc::new(self.compute_summary(&graph, depth, state)));
        self.in_progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(function_id);
        // A summary computed close to the depth ceiling may under-credit
        // nested callees; caching it anyway only errs toward reporting.
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(function_id.to_string(), summary.clone());
        summary
    }

    /// Intersects per-path credit over every complete entry-to-exit path:
    /// a type is guaranteed only if each path covers it.
    fn compute_summary(
        &self,
        graph: &ControlFlowGraph,
        depth: u64,
        state: &mut QueryState,
    ) -> FunctionSummary {
        let mut targets: BTreeSet<NodeId> = graph.exits.iter().copied().collect();
        let (reachable, truncated) = reachable_nodes(graph, self.budget.node_visit_limit());
        targets.retain(|t| reachable.contains(t));
        if truncated || targets.is_empty() {
            return FunctionSummary::default();
        }

        let module_insts = self.module_instances_for(&graph.file);
        let mut guaranteed: Option<BTreeMap<VulnType, BTreeSet<String>>> = None;
        let mut capped = false;
        let mut budget_left = MAX_PATHS;
        for target in targets {
            let (paths, hit_cap) = enumerate_paths(graph, graph.entry, target, &reachable, budget_left);
            capped |= hit_cap;
            budget_left = budget_left.saturating_sub(paths.len());
            for path in &paths {
                let credits = self.credits_on_path(graph, path, &module_insts, depth, state);
                guaranteed = Some(match guaranteed {
                    None => credits,
                    Some(prev) => intersect_credits(prev, credits),
                });
                if guaranteed.as_ref().is_some_and(BTreeMap::is_empty) {
                    return FunctionSummary::default();
                }
            }
            if budget_left == 0 {
                capped = true;
                break;
            }
        }
        if capped {
            // Unenumerated paths might be uncovered; guarantee nothing.
            return FunctionSummary::default();
        }
        FunctionSummary {
            guaranteed: guaranteed.unwrap_or_default(),
        }
    }

    /// Everything credited along one path: same-function instances plus
    /// bounded-depth callee guarantees at call nodes. Awaited calls do
    /// not carry callee mitigation context across the boundary.
    fn credits_on_path(
        &self,
        graph: &ControlFlowGraph,
        path: &[NodeId],
        module_insts: &[MitigationInstance],
        depth: u64,
        state: &mut QueryState,
    ) -> BTreeMap<VulnType, BTreeSet<String>> {
        let mut credits: BTreeMap<VulnType, BTreeSet<String>> = BTreeMap::new();
        for inst in module_insts {
            credit(&mut credits, &inst.mitigates, [inst.pattern_id.clone()]);
        }
        for nid in path {
            let Some(node) = graph.node(*nid) else { continue };
            for inst in &node.mitigations {
                credit(&mut credits, &inst.mitigates, [inst.pattern_id.clone()]);
            }
            let callee_sites = graph.call_sites.iter().filter(|c| c.node == *nid);
            for cs in callee_sites {
                match (&cs.resolution, node.kind) {
                    (Resolution::Resolved { function_id }, CfgNodeKind::Call) => {
                        if let Some(summary) = self.summarize(function_id, depth + 1, state) {
                            for (t, pids) in &summary.guaranteed {
                                credits
                                    .entry(t.clone())
                                    .or_default()
                                    .extend(pids.iter().cloned());
                            }
                        }
                    }
                    (Resolution::Resolved { .. }, CfgNodeKind::Await) => {
                        state.degraded.insert(DegradeReason::AsyncBoundary);
                    }
                    (Resolution::Dynamic, _) => {
                        state.degraded.insert(DegradeReason::DynamicCall);
                    }
                    _ => {}
                }
            }
        }
        credits
    }
}

fn credit(
    credits: &mut BTreeMap<VulnType, BTreeSet<String>>,
    types: &BTreeSet<VulnType>,
    pattern_ids: impl IntoIterator<Item = String> + Clone,
) {
    for t in types {
        credits
            .entry(t.clone())
            .or_default()
            .extend(pattern_ids.clone());
    }
}

fn intersect_credits(
    a: BTreeMap<VulnType, BTreeSet<String>>,
    b: BTreeMap<VulnType, BTreeSet<String>>,
) -> BTreeMap<VulnType, BTreeSet<String>> {
    let mut out = BTreeMap::new();
    for (t, ids_a) in a {
        if let Some(ids_b) = b.get(&t) {
            out.insert(t, ids_a.union(ids_b).cloned().collect());
        }
    }
    out
}

/// Forward traversal from the entry with an inclusive pre-increment
/// ceiling check: a limit of N processes exactly N nodes and a limit of 0
/// processes none. Returns the visited set and whether the limit stopped
/// the traversal early.
pub fn reachable_nodes(graph: &ControlFlowGraph, limit: u64) -> (BTreeSet<NodeId>, bool) {
    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    let mut queue = VecDeque::from([graph.entry]);
    let mut processed: u64 = 0;
    while let Some(node) = queue.pop_front() {
        if visited.contains(&node) {
            continue;
        }
        if processed == limit {
            return (visited, true);
        }
        processed += 1;
        visited.insert(node);
        for e in graph.successors(node) {
            if !visited.contains(&e.to) {
                queue.push_back(e.to);
            }
        }
    }
    (visited, false)
}

/// Enumerates simple paths (no node revisits, so loop back edges are
/// traversed at most implicitly once) from `from` to `to` inside the
/// `allowed` node set, up to `cap` paths.
fn enumerate_paths(
    graph: &ControlFlowGraph,
    from: NodeId,
    to: NodeId,
    allowed: &BTreeSet<NodeId>,
    cap: usize,
) -> (Vec<Vec<NodeId>>, bool) {
    let mut paths = Vec::new();
    if cap == 0 || !allowed.contains(&from) {
        return (paths, cap == 0);
    }
    if from == to {
        paths.push(vec![from]);
        return (paths, false);
    }

    let succ: HashMap<NodeId, Vec<NodeId>> = allowed
        .iter()
        .map(|&n| {
            (
                n,
                graph
                    .successors(n)
                    .map(|e| e.to)
                    .filter(|t| allowed.contains(t))
                    .collect(),
            )
        })
        .collect();

    let mut stack: Vec<(NodeId, usize)> = vec![(from, 0)];
    let mut on_path: HashSet<NodeId> = HashSet::from([from]);
    let mut capped = false;

    while let Some(frame) = stack.last_mut() {
        let node = frame.0;
        let next = succ[&node].get(frame.1).copied();
        frame.1 += 1;
        match next {
            None => {
                stack.pop();
                on_path.remove(&node);
            }
            Some(next) if next == to => {
                if paths.len() == cap {
                    capped = true;
                    break;
                }
                let mut path: Vec<NodeId> = stack.iter().map(|(n, _)| *n).collect();
                path.push(to);
                paths.push(path);
            }
            Some(next) => {
                if !on_path.contains(&next) {
                    stack.push((next, 0));
                    on_path.insert(next);
                }
            }
        }
    }
    (paths, capped)
}

/// Renders a path for finding metadata,
/// e.g. `entry@L1 -> branch@L3[false] -> call@L7 -> sink@L9`.
fn describe_path(graph: &ControlFlowGraph, path: &[NodeId]) -> String {
    let mut out = String::new();
    for (i, nid) in path.iter().enumerate() {
        let Some(node) = graph.node(*nid) else { continue };
        if i > 0 {
            out.push_str(" -> ");
        }
        let kind = match node.kind {
            CfgNodeKind::Entry => "entry",
            CfgNodeKind::Exit => "exit",
            CfgNodeKind::Throw => "throw",
            CfgNodeKind::Basic => "block",
            CfgNodeKind::Branch => "branch",
            CfgNodeKind::Merge => "merge",
            CfgNodeKind::LoopHeader => "loop",
            CfgNodeKind::LoopBody => "loop-body",
            CfgNodeKind::Call => "call",
            CfgNodeKind::Await => "await",
        };
        let label = if i == path.len() - 1 && node.kind != CfgNodeKind::Entry {
            "sink"
        } else {
            kind
        };
        out.push_str(&format!("{label}@L{}", node.span.line));
        if i + 1 < path.len() {
            let taken = graph
                .edges
                .iter()
                .find(|e| e.from == *nid && e.to == path[i + 1]);
            if let Some(edge) = taken {
                match (&edge.kind, &edge.label) {
                    (_, Some(l)) => out.push_str(&format!("[{l}]")),
                    (EdgeKind::BranchTrue, None) => out.push_str("[true]"),
                    (EdgeKind::BranchFalse, None) => out.push_str("[false]"),
                    (EdgeKind::Exception, None) => out.push_str("[exception]"),
                    _ => {}
                }
            }
        }
    }
    out
}

/// Mitigation types that satisfy this sink: the declared requirements
/// when present, otherwise the sink's own vulnerability type.
fn wanted_types(vuln: &PotentialVulnerability) -> BTreeSet<VulnType> {
    if vuln.required_mitigations.is_empty() {
        BTreeSet::from([vuln.vuln_type.clone()])
    } else {
        vuln.required_mitigations.clone()
    }
}

/// Answers one coverage query: how many paths reach the sink and how many
/// of them carry a mitigation applicable to the sink's vulnerability type.
pub fn analyze_paths(
    ctx: &AnalysisContext<'_>,
    graph: &ControlFlowGraph,
    vuln: &PotentialVulnerability,
) -> PathCoverage {
    let mut coverage = PathCoverage::default();
    let Some(sink) = graph.node_at_line(vuln.line) else {
        coverage.degraded.insert(DegradeReason::UnanchoredSink);
        return coverage;
    };

    let (reachable, truncated) = reachable_nodes(graph, ctx.budget.node_visit_limit());
    if truncated {
        coverage.degraded.insert(DegradeReason::NodeLimit);
    }
    if !reachable.contains(&sink) {
        // Either dead code or cut off by the node limit; no path evidence
        // either way.
        return coverage;
    }

    let (paths, capped) = enumerate_paths(graph, graph.entry, sink, &reachable, MAX_PATHS);
    if capped {
        coverage.degraded.insert(DegradeReason::PathCap);
    }

    let module_insts = ctx.module_instances_for(&graph.file);
    let wanted = wanted_types(vuln);
    let mut state = QueryState::default();
    let mut seen_signatures = BTreeSet::new();
    for path_nodes in &paths {
        let signature = path_signature(path_nodes);
        if !seen_signatures.insert(signature.clone()) {
            continue;
        }
        let credits = ctx.credits_on_path(graph, path_nodes, &module_insts, 0, &mut state);
        let credited: Vec<String> = credits
            .iter()
            .filter(|(t, _)| wanted.contains(*t))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        let path = ExecutionPath {
            nodes: path_nodes.clone(),
            mitigations: credited,
            complete: !capped,
            signature,
        };
        coverage.paths_total += 1;
        if path.mitigations.is_empty() {
            coverage.unprotected.push(describe_path(graph, &path.nodes));
        } else {
            coverage.paths_covered += 1;
            coverage.mitigations.extend(path.mitigations);
        }
    }
    coverage.depth_reached = state.depth_reached;
    coverage.degraded.extend(state.degraded);
    debug!(
        function = %graph.name,
        sink_line = vuln.line,
        total = coverage.paths_total,
        covered = coverage.paths_covered,
        "path coverage computed"
    );
    coverage
}
