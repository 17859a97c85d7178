//! Main types for the analysis intermediate representation.
//!
//! The `ast` module holds the parsed function bodies handed over by the
//! surrounding pipeline; the `cfg` module holds the control flow graph the
//! engine lowers them into. Both share the [`Span`] structure for location
//! data. The root module defines the vulnerability and mitigation vocabulary
//! used across the workspace.

pub mod ast;
pub mod cfg;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub use ast::{
    Callee, CatchClause, Expr, SourceFile, SourceFunction, Span, Stmt, SwitchCase,
};
pub use cfg::{
    CallSite, CfgEdge, CfgNode, CfgNodeKind, CodeEvent, ControlFlowGraph, EdgeKind, NodeId,
    Resolution,
};

/// Normalized vulnerability type identifier, e.g. `sql-injection`.
///
/// Kept open rather than a closed enum so custom mitigation patterns can
/// declare types the built-in catalog does not know about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct VulnType(String);

impl VulnType {
    /// Builds a normalized type: trimmed, lowercased, spaces and
    /// underscores collapsed to `-`.
    pub fn new(raw: &str) -> Self {
        let norm: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '_' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        Self(norm)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VulnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VulnType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Built-in vulnerability types recognized by the default catalog.
pub mod vuln_types {
    pub const SQL_INJECTION: &str = "sql-injection";
    pub const XSS: &str = "xss";
    pub const COMMAND_INJECTION: &str = "command-injection";
    pub const PATH_TRAVERSAL: &str = "path-traversal";
    pub const SSRF: &str = "ssrf";
    pub const DESERIALIZATION: &str = "deserialization";
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
/// Severity assigned to a risk point before any downgrade.
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One downgrade step: Critical→High→Medium→Low; Low stays Low.
    pub fn downgraded(self) -> Self {
        match self {
            Severity::Critical => Severity::High,
            Severity::High => Severity::Medium,
            Severity::Medium => Severity::Low,
            Severity::Low => Severity::Low,
        }
    }

    /// Report level a severity maps onto in emitted findings.
    pub fn report_level(self) -> ReportLevel {
        match self {
            Severity::Critical | Severity::High => ReportLevel::Error,
            Severity::Medium => ReportLevel::Warning,
            Severity::Low => ReportLevel::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Level of an emitted finding as reported to the review pipeline.
pub enum ReportLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportLevel::Info => "info",
            ReportLevel::Warning => "warning",
            ReportLevel::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
/// Tightest program unit a detected mitigation protects.
pub enum MitigationScope {
    Block,
    Function,
    Module,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// How much of the path set reaching a sink is protected.
pub enum MitigationStatus {
    None,
    Partial,
    Full,
}

impl fmt::Display for MitigationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MitigationStatus::None => "none",
            MitigationStatus::Partial => "partial",
            MitigationStatus::Full => "full",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A pattern match found in code during detection.
pub struct MitigationInstance {
    /// Catalog pattern that matched. Always references a pattern that
    /// exists in the active catalog at detection time.
    pub pattern_id: String,
    pub file: String,
    pub line: usize,
    /// Vulnerability types this instance is allowed to cover. Copied from
    /// the pattern's `mitigates` set; coverage checks never credit a type
    /// outside it.
    pub mitigates: BTreeSet<VulnType>,
    pub scope: MitigationScope,
    /// Variables or paths the mitigation protects, when derivable from the
    /// match (call arguments, assignment target).
    pub protected_vars: BTreeSet<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A risk point (sink) reported by the upstream pattern-based scanners.
pub struct PotentialVulnerability {
    pub id: String,
    /// Exactly one vulnerability type per instance.
    pub vuln_type: VulnType,
    pub file: String,
    pub line: usize,
    #[serde(default)]
    pub end_line: Option<usize>,
    /// Enclosing function name, when the upstream scanner resolved it.
    #[serde(default)]
    pub function: Option<String>,
    /// Line of the tainted source feeding the sink, if known.
    #[serde(default)]
    pub tainted_source: Option<usize>,
    /// Variable flowing into the sink, if known.
    #[serde(default)]
    pub variable: Option<String>,
    /// Mitigation types that would address this sink. Empty means "any
    /// pattern declaring the vulnerability type".
    #[serde(default)]
    pub required_mitigations: BTreeSet<VulnType>,
    pub severity: Severity,
    pub description: String,
}

#[cfg(test)]
mod tests;
