//! Turns a risk point plus its path coverage into a finding, or decides
//! not to.
//!
//! Full coverage is the one intentionally silent outcome. Zero coverage
//! emits at the original severity. Partial coverage downgrades exactly one
//! severity step and is never suppressed.

use crate::path::{DegradeReason, PathCoverage};
use ir::{MitigationStatus, PotentialVulnerability, ReportLevel, Severity};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fixed source-agent tag carried by every emitted finding.
pub const SOURCE_AGENT: &str = "control-flow-analysis";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Analysis metadata explaining why a finding was emitted, downgraded or
/// marked degraded.
pub struct FindingMetadata {
    pub mitigation_status: MitigationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_severity: Option<Severity>,
    pub paths_covered: usize,
    pub paths_total: usize,
    pub unprotected_paths: Vec<String>,
    /// Pattern ids credited on covered paths.
    pub mitigations_detected: Vec<String>,
    pub analysis_depth: u64,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Output record of the engine.
pub struct ControlFlowFinding {
    pub severity: Severity,
    pub level: ReportLevel,
    pub file: String,
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// `cfa/<vulnerability-type>`.
    pub rule_id: String,
    pub source: String,
    pub fingerprint: String,
    pub metadata: FindingMetadata,
}

/// Stable identity of a finding across runs. A pure function of rule id,
/// file, enclosing function, vulnerability type and mitigation status;
/// line numbers are deliberately excluded so formatting shifts do not
/// mint new findings.
pub fn fingerprint(
    rule_id: &str,
    file: &str,
    function: &str,
    vuln_type: &str,
    status: MitigationStatus,
) -> String {
    blake3::hash(format!("{rule_id}\u{1f}{file}\u{1f}{function}\u{1f}{vuln_type}\u{1f}{status}").as_bytes())
        .to_hex()
        .to_string()
}

const MAX_LISTED_PATHS: usize = 5;

/// Applies the suppression/downgrade rules. Returns `None` only for full
/// coverage, which is the single intended silent outcome.
pub fn generate_finding(
    vuln: &PotentialVulnerability,
    coverage: &PathCoverage,
    budget_degraded: bool,
    function: &str,
) -> Option<ControlFlowFinding> {
    let status = if coverage.paths_total > 0 && coverage.paths_covered == coverage.paths_total {
        MitigationStatus::Full
    } else if coverage.paths_covered > 0 {
        MitigationStatus::Partial
    } else {
        MitigationStatus::None
    };

    let degraded = budget_degraded || !coverage.degraded.is_empty();
    // Conservative fallbacks (depth limit, dynamic calls, async
    // boundaries) only ever reduce coverage, so full coverage still
    // suppresses under them. A truncated enumeration is different:
    // `paths_total` is then not the real total and cannot justify
    // suppression.
    let truncated = coverage.degraded.contains(&DegradeReason::PathCap)
        || coverage.degraded.contains(&DegradeReason::NodeLimit);
    if status == MitigationStatus::Full && !truncated {
        debug!(
            id = %vuln.id,
            paths = coverage.paths_total,
            "all paths mitigated; finding suppressed"
        );
        return None;
    }
    let status = if status == MitigationStatus::Full {
        MitigationStatus::Partial
    } else {
        status
    };

    let severity = match status {
        MitigationStatus::Partial => vuln.severity.downgraded(),
        _ => vuln.severity,
    };
    let original_severity = (severity != vuln.severity).then_some(vuln.severity);

    let mut message = match status {
        MitigationStatus::Partial => format!(
            "{}: {} of {} execution paths to this sink carry a recognized mitigation",
            vuln.description, coverage.paths_covered, coverage.paths_total
        ),
        _ => format!(
            "{}: none of {} execution paths to this sink carry a recognized mitigation",
            vuln.description,
            coverage.paths_total.max(1)
        ),
    };
    if !coverage.unprotected.is_empty() {
        message.push_str("; unprotected: ");
        let listed: Vec<&str> = coverage
            .unprotected
            .iter()
            .take(MAX_LISTED_PATHS)
            .map(String::as_str)
            .collect();
        message.push_str(&listed.join("; "));
        let extra = coverage.unprotected.len().saturating_sub(MAX_LISTED_PATHS);
        if extra > 0 {
            message.push_str(&format!(" (+{extra} more)"));
        }
    }

    let suggestion = Some(format!(
        "apply a {} mitigation on every path that reaches line {}",
        vuln.vuln_type, vuln.line
    ));

    let degraded_reason = if coverage.degraded.is_empty() {
        budget_degraded.then(|| "analysis budget degraded".to_string())
    } else {
        Some(
            coverage
                .degraded
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    };

    let rule_id = format!("cfa/{}", vuln.vuln_type);
    Some(ControlFlowFinding {
        severity,
        level: severity.report_level(),
        file: vuln.file.clone(),
        line: vuln.line,
        end_line: vuln.end_line,
        message,
        suggestion,
        fingerprint: fingerprint(
            &rule_id,
            &vuln.file,
            function,
            vuln.vuln_type.as_str(),
            status,
        ),
        rule_id,
        source: SOURCE_AGENT.to_string(),
        metadata: FindingMetadata {
            mitigation_status: status,
            original_severity,
            paths_covered: coverage.paths_covered,
            paths_total: coverage.paths_total,
            unprotected_paths: coverage.unprotected.clone(),
            mitigations_detected: coverage.mitigations.iter().cloned().collect(),
            analysis_depth: coverage.depth_reached,
            degraded,
            degraded_reason,
        },
    })
}
