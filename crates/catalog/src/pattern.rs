//! Declarative mitigation pattern model.
//!
//! Patterns are plain data until the catalog compiles them; the compiled
//! form carries the pre-built regular expression so matching never compiles
//! at scan time.

use ir::{CodeEvent, VulnType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Shape of code a pattern's criteria match against.
pub enum CriteriaKind {
    /// Plain call expression.
    Call,
    /// Call whose result is bound to a variable.
    Assignment,
    /// Call used as a branch condition.
    Guard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Positional constraint on a call argument.
pub struct ArgConstraint {
    pub position: usize,
    /// Rendered argument text must equal this value.
    pub equals: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Match criteria of a mitigation pattern. Call-shaped criteria must carry
/// at least a `call_name` or a `name_pattern`.
pub struct MatchCriteria {
    pub kind: CriteriaKind,
    /// Exact callee name.
    #[serde(default)]
    pub call_name: Option<String>,
    /// Regular expression over the callee name. Validated for bounded
    /// complexity before a custom pattern is accepted.
    #[serde(default)]
    pub name_pattern: Option<String>,
    /// Module the callee must have been imported from.
    #[serde(default)]
    pub import_source: Option<String>,
    #[serde(default)]
    pub arg_constraints: Vec<ArgConstraint>,
    /// The call result must be bound to a variable.
    #[serde(default)]
    pub requires_binding: bool,
}

impl MatchCriteria {
    pub fn call(name: &str) -> Self {
        Self {
            kind: CriteriaKind::Call,
            call_name: Some(name.to_string()),
            name_pattern: None,
            import_source: None,
            arg_constraints: Vec::new(),
            requires_binding: false,
        }
    }

    pub fn call_matching(pattern: &str) -> Self {
        Self {
            kind: CriteriaKind::Call,
            call_name: None,
            name_pattern: Some(pattern.to_string()),
            import_source: None,
            arg_constraints: Vec::new(),
            requires_binding: false,
        }
    }

    pub fn guard_matching(pattern: &str) -> Self {
        Self {
            kind: CriteriaKind::Guard,
            call_name: None,
            name_pattern: Some(pattern.to_string()),
            import_source: None,
            arg_constraints: Vec::new(),
            requires_binding: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Declarative rule recognizing a protective code shape.
pub struct MitigationPattern {
    /// Unique within an active catalog.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Vulnerability types this pattern addresses. Never empty in a valid
    /// pattern; coverage checks only credit types listed here.
    pub mitigates: BTreeSet<VulnType>,
    pub criteria: MatchCriteria,
    /// In (0, 1].
    pub confidence: f64,
    #[serde(default)]
    pub builtin: bool,
    /// Deprecation reason; deprecated patterns still match but are flagged.
    #[serde(default)]
    pub deprecated: Option<String>,
}

#[derive(Debug, Clone)]
/// Pattern plus its regex, compiled once at catalog build time.
pub struct CompiledPattern {
    pub pattern: MitigationPattern,
    name_regex: Option<Regex>,
}

impl CompiledPattern {
    /// Compiles the pattern's name regex. The caller has already validated
    /// custom patterns, so a failure here is a defect in a built-in.
    pub(crate) fn compile(pattern: MitigationPattern) -> Result<Self, regex::Error> {
        let name_regex = match &pattern.criteria.name_pattern {
            Some(p) => Some(Regex::new(p)?),
            None => None,
        };
        Ok(Self {
            pattern,
            name_regex,
        })
    }

    pub fn id(&self) -> &str {
        &self.pattern.id
    }

    /// Tests an extracted code event against this pattern's criteria.
    pub fn matches(&self, event: &CodeEvent) -> bool {
        let criteria = &self.pattern.criteria;
        let (name, module, args, assigned) = match event {
            CodeEvent::Call {
                name,
                module,
                args,
                assigned_to,
                ..
            } => (name, module, args, assigned_to.is_some()),
            CodeEvent::Guard {
                name, module, args, ..
            } => (name, module, args, false),
        };

        let shape_ok = match criteria.kind {
            CriteriaKind::Call => matches!(event, CodeEvent::Call { .. }),
            CriteriaKind::Assignment => matches!(
                event,
                CodeEvent::Call {
                    assigned_to: Some(_),
                    ..
                }
            ),
            CriteriaKind::Guard => matches!(event, CodeEvent::Guard { .. }),
        };
        if !shape_ok {
            return false;
        }

        if let Some(expected) = &criteria.call_name {
            if name != expected {
                return false;
            }
        }
        if let Some(re) = &self.name_regex {
            if !re.is_match(name) {
                return false;
            }
        }
        if let Some(source) = &criteria.import_source {
            if module.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        for c in &criteria.arg_constraints {
            match args.get(c.position) {
                Some(arg) if arg == &c.equals => {}
                _ => return false,
            }
        }
        if criteria.requires_binding && !assigned {
            return false;
        }
        true
    }
}
