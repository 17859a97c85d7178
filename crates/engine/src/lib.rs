//! Control-flow-aware mitigation analysis engine.
//!
//! Sequences the per-function pipeline across a change set: lower each
//! parsed body into a CFG, annotate it with catalog matches, compute path
//! coverage for every candidate risk point, and emit findings with the
//! suppression/downgrade rules applied. The run-wide budget is consulted
//! at every unit boundary; per-function failures are logged and skipped,
//! and budget termination returns partial results instead of failing the
//! run.

use anyhow::Context as _;
use catalog::{build_catalog, MitigationConfiguration, PatternCatalog};
use ir::{
    ControlFlowGraph, MitigationInstance, MitigationScope, PotentialVulnerability, ReportLevel,
    SourceFile,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

pub mod budget;
pub mod cfg;
pub mod detect;
pub mod findings;
pub mod path;

pub use budget::{AnalysisBudget, BudgetConfig, BudgetError, BudgetStatus};
pub use cfg::{build_cfg, CfgError};
pub use detect::detect_mitigations;
pub use findings::{
    fingerprint, generate_finding, ControlFlowFinding, FindingMetadata, SOURCE_AGENT,
};
pub use path::{
    analyze_paths, reachable_nodes, AnalysisContext, DegradeReason, ExecutionPath,
    FunctionSummary, PathCoverage, MAX_PATHS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// Resolved engine configuration handed over by the pipeline.
pub struct EngineConfig {
    pub enabled: bool,
    pub budget: BudgetConfig,
    pub mitigations: MitigationConfiguration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget: BudgetConfig::default(),
            mitigations: MitigationConfiguration::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
/// One entry of the run's auditable decision log.
pub struct DecisionEntry {
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    pub level: ReportLevel,
    pub message: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
/// Aggregate result of one run.
pub struct RunResult {
    pub findings: Vec<ControlFlowFinding>,
    pub files_analyzed: u64,
    pub functions_analyzed: u64,
    pub budget_status: BudgetStatus,
    pub degraded: bool,
    pub decisions: Vec<DecisionEntry>,
}

struct DecisionLog<'a> {
    budget: &'a AnalysisBudget,
    entries: Vec<DecisionEntry>,
}

impl<'a> DecisionLog<'a> {
    fn new(budget: &'a AnalysisBudget) -> Self {
        Self {
            budget,
            entries: Vec::new(),
        }
    }

    fn push(&mut self, level: ReportLevel, message: impl Into<String>, context: serde_json::Value) {
        self.entries.push(DecisionEntry {
            elapsed_ms: self.budget.elapsed_ms(),
            level,
            message: message.into(),
            context,
        });
    }
}

/// Files analyzed last (and dropped first) once the budget degrades.
fn is_low_priority(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ["test", "spec", "fixture", "mock", "generated", "snapshot", "__snapshots__"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Runs the whole analysis over a change set. Fails only on malformed
/// budget configuration; everything else degrades or skips.
pub fn analyze_files(files: &[SourceFile], config: &EngineConfig) -> anyhow::Result<RunResult> {
    let budget = AnalysisBudget::new(&config.budget)
        .context("analysis budget configuration rejected")?;
    let mut log = DecisionLog::new(&budget);

    if !config.enabled {
        log.push(
            ReportLevel::Info,
            "control flow analysis disabled by configuration",
            json!({}),
        );
        return Ok(RunResult {
            findings: Vec::new(),
            files_analyzed: 0,
            functions_analyzed: 0,
            budget_status: budget.status(),
            degraded: false,
            decisions: log.entries,
        });
    }

    let build = build_catalog(&config.mitigations);
    for e in &build.errors {
        log.push(
            ReportLevel::Warning,
            format!("custom pattern rejected: {}", e.message),
            json!({ "code": e.code, "path": e.path }),
        );
    }
    for w in &build.warnings {
        log.push(ReportLevel::Warning, w.clone(), json!({}));
    }
    let catalog = build.catalog;
    let ctx = AnalysisContext::new(files, &catalog, &budget);

    let mut queue: VecDeque<&SourceFile> = files.iter().collect();
    let mut deferred: VecDeque<&SourceFile> = VecDeque::new();
    let mut findings: Vec<ControlFlowFinding> = Vec::new();
    let mut prev_status = budget.status();

    loop {
        let status = budget.refresh();
        note_status_change(&mut prev_status, status, &mut log);
        if status >= BudgetStatus::Exceeded {
            break;
        }
        let file = if let Some(f) = queue.pop_front() {
            if status >= BudgetStatus::Warning && is_low_priority(&f.path) {
                log.push(
                    ReportLevel::Info,
                    "low-priority file deferred under budget pressure",
                    json!({ "file": f.path }),
                );
                deferred.push_back(f);
                continue;
            }
            f
        } else if let Some(f) = deferred.pop_front() {
            f
        } else {
            break;
        };

        let keep_going = process_file(&ctx, &catalog, file, &mut findings, &mut log);
        if !keep_going {
            break;
        }
        budget.add_file();
    }

    let final_status = budget.refresh();
    note_status_change(&mut prev_status, final_status, &mut log);
    for skipped in queue.into_iter().chain(deferred) {
        log.push(
            ReportLevel::Info,
            "file skipped: budget exhausted",
            json!({ "file": skipped.path, "lowPriority": is_low_priority(&skipped.path) }),
        );
    }

    dedup_findings(&mut findings);
    let degraded =
        final_status >= BudgetStatus::Warning || findings.iter().any(|f| f.metadata.degraded);

    Ok(RunResult {
        findings,
        files_analyzed: budget.files_analyzed(),
        functions_analyzed: budget.functions_analyzed(),
        budget_status: final_status,
        degraded,
        decisions: log.entries,
    })
}

fn note_status_change(
    prev: &mut BudgetStatus,
    status: BudgetStatus,
    log: &mut DecisionLog<'_>,
) {
    if status > *prev {
        log.push(
            ReportLevel::Info,
            format!("analysis budget status changed to {status}"),
            json!({
                "linesAnalyzed": log.budget.lines_analyzed(),
                "filesAnalyzed": log.budget.files_analyzed(),
            }),
        );
        *prev = status;
    }
}

/// Lowers and annotates a file's functions (in parallel, collected in
/// input order), then walks its candidates sequentially. Returns false
/// when the run must stop immediately.
fn process_file(
    ctx: &AnalysisContext<'_>,
    catalog: &PatternCatalog,
    file: &SourceFile,
    findings: &mut Vec<ControlFlowFinding>,
    log: &mut DecisionLog<'_>,
) -> bool {
    debug!(file = %file.path, functions = file.functions.len(), "analyzing file");

    type Lowered = Option<Result<ControlFlowGraph, (String, usize, String)>>;
    let lowered: Vec<Lowered> = file
        .functions
        .par_iter()
        .map(|func| {
            if ctx.budget.status() == BudgetStatus::Terminated {
                return None;
            }
            ctx.budget.add_lines(
                (func.span.end_line.saturating_sub(func.span.line) + 1) as u64,
            );
            match cfg::build_cfg(func) {
                Ok(mut graph) => {
                    detect::detect_mitigations(&mut graph, catalog, func.is_module_init);
                    ctx.resolve_call_sites(&mut graph);
                    Some(Ok(graph))
                }
                Err(e) => Some(Err((func.name.clone(), func.span.line, e.to_string()))),
            }
        })
        .collect();

    let mut module_instances: Vec<MitigationInstance> = Vec::new();
    let mut graphs: Vec<Arc<ControlFlowGraph>> = Vec::new();
    for item in lowered {
        match item {
            None => {
                log.push(
                    ReportLevel::Info,
                    "analysis terminated mid-file; returning partial results",
                    json!({ "file": file.path }),
                );
                return false;
            }
            Some(Err((name, line, error))) => {
                log.push(
                    ReportLevel::Warning,
                    format!("function '{name}' skipped: {error}"),
                    json!({ "file": file.path, "line": line }),
                );
            }
            Some(Ok(mut graph)) => {
                ctx.budget.add_function();
                mark_tainted(&mut graph, &file.candidates);
                if let Some(func) = file.functions.iter().find(|f| f.id == graph.id) {
                    if func.is_module_init {
                        for node in graph.nodes.values() {
                            module_instances.extend(
                                node.mitigations
                                    .iter()
                                    .filter(|m| m.scope == MitigationScope::Module)
                                    .cloned(),
                            );
                        }
                    }
                }
                let arc = Arc::new(graph);
                ctx.insert_graph(arc.clone());
                graphs.push(arc);
            }
        }
    }
    ctx.set_module_instances(&file.path, module_instances);

    for vuln in &file.candidates {
        let status = ctx.budget.refresh();
        if status == BudgetStatus::Terminated {
            log.push(
                ReportLevel::Info,
                "analysis terminated before remaining candidates",
                json!({ "file": file.path }),
            );
            return false;
        }
        analyze_candidate(ctx, &graphs, vuln, findings, log);
    }
    true
}

fn analyze_candidate(
    ctx: &AnalysisContext<'_>,
    graphs: &[Arc<ControlFlowGraph>],
    vuln: &PotentialVulnerability,
    findings: &mut Vec<ControlFlowFinding>,
    log: &mut DecisionLog<'_>,
) {
    let graph = enclosing_graph(graphs, vuln);
    let (coverage, function) = match graph {
        Some(g) => (path::analyze_paths(ctx, g, vuln), g.name.clone()),
        None => {
            let mut c = PathCoverage::default();
            c.degraded.insert(DegradeReason::UnanchoredSink);
            (c, vuln.function.clone().unwrap_or_default())
        }
    };
    let budget_degraded = ctx.budget.status() >= BudgetStatus::Warning;
    match generate_finding(vuln, &coverage, budget_degraded, &function) {
        Some(finding) => {
            log.push(
                ReportLevel::Info,
                format!(
                    "finding emitted: {} ({} of {} paths covered)",
                    finding.rule_id, coverage.paths_covered, coverage.paths_total
                ),
                json!({
                    "candidate": vuln.id,
                    "fingerprint": finding.fingerprint,
                    "mitigationStatus": finding.metadata.mitigation_status,
                }),
            );
            findings.push(finding);
        }
        None => {
            log.push(
                ReportLevel::Info,
                "finding suppressed: every path to the sink is mitigated",
                json!({
                    "candidate": vuln.id,
                    "pathsTotal": coverage.paths_total,
                    "mitigations": coverage.mitigations,
                }),
            );
        }
    }
}

/// Picks the function whose span contains the candidate's sink line,
/// preferring a declared function-name match, then the tightest span.
fn enclosing_graph<'g>(
    graphs: &'g [Arc<ControlFlowGraph>],
    vuln: &PotentialVulnerability,
) -> Option<&'g Arc<ControlFlowGraph>> {
    let containing = graphs
        .iter()
        .filter(|g| g.span.line <= vuln.line && vuln.line <= g.span.end_line);
    if let Some(name) = &vuln.function {
        let named: Vec<_> = containing
            .clone()
            .filter(|g| &g.name == name)
            .collect();
        if let Some(best) = named
            .into_iter()
            .min_by_key(|g| g.span.end_line - g.span.line)
        {
            return Some(best);
        }
    }
    containing.min_by_key(|g| g.span.end_line - g.span.line)
}

/// Marks the candidate's tainted variable on the nodes the upstream
/// scanner located.
fn mark_tainted(graph: &mut ControlFlowGraph, candidates: &[PotentialVulnerability]) {
    for vuln in candidates {
        let Some(var) = &vuln.variable else { continue };
        for line in [Some(vuln.line), vuln.tainted_source].into_iter().flatten() {
            if let Some(node_id) = graph.node_at_line(line) {
                if let Some(node) = graph.node_mut(node_id) {
                    node.tainted.insert(var.clone());
                }
            }
        }
    }
}

/// First-emitted finding wins for each fingerprint.
fn dedup_findings(findings: &mut Vec<ControlFlowFinding>) {
    let mut seen = HashSet::new();
    findings.retain(|f| seen.insert(f.fingerprint.clone()));
}
