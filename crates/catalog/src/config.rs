//! User-declared catalog customization and its validation.
//!
//! Custom patterns must be declarative and side-effect-free: the only
//! executable thing they carry is a name regex, which is bounded-complexity
//! checked and compiled once at catalog build time. Invalid patterns are
//! rejected individually; the rest of the configuration still loads.

use crate::pattern::MitigationPattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pattern ids/names that must never be claimed as mitigations. These are
/// the dangerous primitives the risk catalog itself flags.
pub const RESERVED_NAMES: &[&str] = &["eval", "exec", "system", "spawn", "deserialize"];

/// Longest accepted name-pattern source.
pub const MAX_PATTERN_LEN: usize = 256;
/// Largest accepted counted-repetition bound.
pub const MAX_REPETITION: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
/// Resolved user customization handed over by the pipeline.
pub struct MitigationConfiguration {
    #[serde(default)]
    pub custom_patterns: Vec<MitigationPattern>,
    #[serde(default)]
    pub overrides: Vec<PatternOverride>,
    #[serde(default)]
    pub disabled_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Confidence/deprecation adjustment keyed by pattern id.
pub struct PatternOverride {
    pub pattern_id: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub deprecated: Option<String>,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("{code} at {path}: {message}")]
/// Structured rejection of one configuration element.
pub struct ConfigError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Configuration path of the offending element,
    /// e.g. `custom_patterns[2].criteria.name_pattern`.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ReservedName,
    MissingCriteria,
    EmptyMitigates,
    InvalidPattern,
    PatternTooComplex,
    InvalidConfidence,
    DuplicatePattern,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ReservedName => "reserved-name",
            ErrorCode::MissingCriteria => "missing-criteria",
            ErrorCode::EmptyMitigates => "empty-mitigates",
            ErrorCode::InvalidPattern => "invalid-pattern",
            ErrorCode::PatternTooComplex => "pattern-too-complex",
            ErrorCode::InvalidConfidence => "invalid-confidence",
            ErrorCode::DuplicatePattern => "duplicate-pattern",
        };
        write!(f, "{s}")
    }
}

fn err(code: ErrorCode, path: String, message: String) -> ConfigError {
    ConfigError {
        code,
        path,
        message,
    }
}

/// Validates one custom pattern. Returns every defect found, so a user can
/// fix a pattern in one pass.
pub fn validate_pattern(pattern: &MitigationPattern, index: usize) -> Vec<ConfigError> {
    let base = format!("custom_patterns[{index}]");
    let mut errors = Vec::new();

    for reserved in RESERVED_NAMES {
        if pattern.id.eq_ignore_ascii_case(reserved)
            || pattern.name.eq_ignore_ascii_case(reserved)
        {
            errors.push(err(
                ErrorCode::ReservedName,
                format!("{base}.name"),
                format!("'{reserved}' is a reserved name and cannot be declared as a mitigation"),
            ));
        }
    }

    if pattern.mitigates.is_empty() {
        errors.push(err(
            ErrorCode::EmptyMitigates,
            format!("{base}.mitigates"),
            "pattern must declare at least one vulnerability type".to_string(),
        ));
    }

    // Every criteria kind matches against a call shape, so a name is
    // always required.
    if pattern.criteria.call_name.is_none() && pattern.criteria.name_pattern.is_none() {
        errors.push(err(
            ErrorCode::MissingCriteria,
            format!("{base}.criteria"),
            "call-shaped criteria must name a call_name or a name_pattern".to_string(),
        ));
    }

    if let Some(src) = &pattern.criteria.name_pattern {
        match check_pattern_complexity(src) {
            Ok(()) => {
                if let Err(e) = regex::Regex::new(src) {
                    errors.push(err(
                        ErrorCode::InvalidPattern,
                        format!("{base}.criteria.name_pattern"),
                        format!("name_pattern does not compile: {e}"),
                    ));
                }
            }
            Err(reason) => errors.push(err(
                ErrorCode::PatternTooComplex,
                format!("{base}.criteria.name_pattern"),
                reason,
            )),
        }
    }

    if !(pattern.confidence > 0.0 && pattern.confidence <= 1.0) {
        errors.push(err(
            ErrorCode::InvalidConfidence,
            format!("{base}.confidence"),
            format!("confidence {} is outside (0, 1]", pattern.confidence),
        ));
    }

    errors
}

/// Rejects name-patterns that could backtrack catastrophically or grow
/// unboundedly: oversized sources, quantified groups that themselves
/// contain a quantifier, and counted repetitions above [`MAX_REPETITION`].
pub fn check_pattern_complexity(pattern: &str) -> Result<(), String> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(format!(
            "pattern is {} bytes, longer than the {MAX_PATTERN_LEN}-byte bound",
            pattern.len()
        ));
    }

    // Tracks, per open group, whether a quantifier appeared inside it.
    let mut group_stack: Vec<bool> = Vec::new();
    // True when the previous token was a group close whose body contained
    // a quantifier.
    let mut closed_quantified_group = false;
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
                closed_quantified_group = false;
            }
            '[' => {
                // Character classes cannot nest quantifiers; skip to the
                // closing bracket.
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    if inner == ']' && prev != '\\' {
                        break;
                    }
                    prev = inner;
                }
                closed_quantified_group = false;
            }
            '(' => {
                group_stack.push(false);
                closed_quantified_group = false;
            }
            ')' => {
                closed_quantified_group = group_stack.pop().unwrap_or(false);
            }
            '*' | '+' => {
                if closed_quantified_group {
                    return Err(format!(
                        "quantifier '{c}' applied to a group that already contains a quantifier"
                    ));
                }
                if let Some(top) = group_stack.last_mut() {
                    *top = true;
                }
                closed_quantified_group = false;
            }
            '{' => {
                let mut bound = String::new();
                for inner in chars.by_ref() {
                    if inner == '}' {
                        break;
                    }
                    bound.push(inner);
                }
                let max = bound
                    .rsplit(',')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .parse::<u32>()
                    .ok();
                if let Some(max) = max {
                    if max > MAX_REPETITION {
                        return Err(format!(
                            "repetition bound {max} exceeds the {MAX_REPETITION} limit"
                        ));
                    }
                }
                if closed_quantified_group {
                    return Err(
                        "counted repetition applied to a group that already contains a quantifier"
                            .to_string(),
                    );
                }
                if let Some(top) = group_stack.last_mut() {
                    *top = true;
                }
                closed_quantified_group = false;
            }
            '?' => {
                // Optionality does not multiply; also covers lazy modifiers
                // and group flags.
                closed_quantified_group = false;
            }
            _ => {
                closed_quantified_group = false;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{CriteriaKind, MatchCriteria};
    use ir::VulnType;
    use std::collections::BTreeSet;

    fn custom(id: &str, criteria: MatchCriteria) -> MitigationPattern {
        MitigationPattern {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            mitigates: [VulnType::new("xss")].into_iter().collect(),
            criteria,
            confidence: 0.8,
            builtin: false,
            deprecated: None,
        }
    }

    #[test]
    fn accepts_simple_alternation() {
        assert!(check_pattern_complexity(r"^(escapeHtml|encodeHTML)$").is_ok());
    }

    #[test]
    fn rejects_nested_quantifiers() {
        assert!(check_pattern_complexity(r"(a+)+").is_err());
        assert!(check_pattern_complexity(r"(a*)*b").is_err());
        assert!(check_pattern_complexity(r"(x|y+)*").is_err());
        assert!(check_pattern_complexity(r"(a+){2,5}").is_err());
    }

    #[test]
    fn rejects_oversized_bounds_and_sources() {
        assert!(check_pattern_complexity(r"a{1,500}").is_err());
        assert!(check_pattern_complexity(r"a{1,50}").is_ok());
        let long = "a".repeat(MAX_PATTERN_LEN + 1);
        assert!(check_pattern_complexity(&long).is_err());
    }

    #[test]
    fn quantified_class_inside_group_is_fine_when_group_unquantified() {
        assert!(check_pattern_complexity(r"(abc+)").is_ok());
        assert!(check_pattern_complexity(r"([a-z]+)$").is_ok());
    }

    #[test]
    fn reserved_name_is_rejected_with_code() {
        let p = custom("eval", MatchCriteria::call("eval"));
        let errors = validate_pattern(&p, 0);
        assert!(errors.iter().any(|e| e.code == ErrorCode::ReservedName));
        assert!(errors[0].path.starts_with("custom_patterns[0]"));
    }

    #[test]
    fn missing_criteria_and_empty_mitigates_reported_together() {
        let mut p = custom(
            "my-pattern",
            MatchCriteria {
                kind: CriteriaKind::Call,
                call_name: None,
                name_pattern: None,
                import_source: None,
                arg_constraints: Vec::new(),
                requires_binding: false,
            },
        );
        p.mitigates = BTreeSet::new();
        let errors = validate_pattern(&p, 3);
        let codes: Vec<_> = errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&ErrorCode::MissingCriteria));
        assert!(codes.contains(&ErrorCode::EmptyMitigates));
    }

    #[test]
    fn confidence_outside_unit_interval_is_rejected() {
        let mut p = custom("m1", MatchCriteria::call("sanitize"));
        p.confidence = 0.0;
        assert!(validate_pattern(&p, 0)
            .iter()
            .any(|e| e.code == ErrorCode::InvalidConfidence));
        p.confidence = 1.5;
        assert!(validate_pattern(&p, 0)
            .iter()
            .any(|e| e.code == ErrorCode::InvalidConfidence));
    }
}
