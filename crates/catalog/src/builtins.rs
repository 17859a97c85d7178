//! Built-in mitigation patterns shipped with the engine.
//!
//! Grouped by the vulnerability type they address. Ordering here is the
//! catalog order, which detection relies on for determinism.

use crate::pattern::{CriteriaKind, MatchCriteria, MitigationPattern};
use ir::{vuln_types, VulnType};
use std::collections::BTreeSet;

fn mitigates(types: &[&str]) -> BTreeSet<VulnType> {
    types.iter().map(|t| VulnType::new(t)).collect()
}

fn builtin(
    id: &str,
    name: &str,
    types: &[&str],
    criteria: MatchCriteria,
    confidence: f64,
) -> MitigationPattern {
    MitigationPattern {
        id: id.to_string(),
        name: name.to_string(),
        description: None,
        mitigates: mitigates(types),
        criteria,
        confidence,
        builtin: true,
        deprecated: None,
    }
}

/// The built-in catalog, in deterministic declaration order.
pub fn builtin_patterns() -> Vec<MitigationPattern> {
    vec![
        builtin(
            "parameterized-query",
            "Parameterized query construction",
            &[vuln_types::SQL_INJECTION],
            MatchCriteria::call_matching(r"^(prepare|prepareStatement|preparedStatement|execute_prepared)$"),
            0.95,
        ),
        builtin(
            "query-placeholder-bind",
            "Placeholder binding on a prepared statement",
            &[vuln_types::SQL_INJECTION],
            MatchCriteria {
                kind: CriteriaKind::Call,
                call_name: Some("bind".to_string()),
                name_pattern: None,
                import_source: None,
                arg_constraints: Vec::new(),
                requires_binding: false,
            },
            0.85,
        ),
        builtin(
            "sql-identifier-escape",
            "SQL identifier escaping helper",
            &[vuln_types::SQL_INJECTION],
            MatchCriteria::call_matching(r"^(escapeId|escape_identifier|quote_ident)$"),
            0.8,
        ),
        builtin(
            "escape-html",
            "HTML entity escaping with bound result",
            &[vuln_types::XSS],
            MatchCriteria {
                requires_binding: true,
                ..MatchCriteria::call_matching(
                    r"^(escapeHtml|escape_html|htmlspecialchars|encodeHTML|htmlEncode)$",
                )
            },
            0.9,
        ),
        builtin(
            "sanitize-html",
            "HTML sanitizer library",
            &[vuln_types::XSS],
            MatchCriteria::call_matching(r"^(sanitizeHtml|sanitize_html|sanitize|purify)$"),
            0.85,
        ),
        builtin(
            "shell-escape",
            "Shell argument escaping",
            &[vuln_types::COMMAND_INJECTION],
            MatchCriteria::call_matching(r"^(shellEscape|shell_escape|quote|escapeshellarg)$"),
            0.9,
        ),
        builtin(
            "command-allowlist-guard",
            "Command allowlist membership check",
            &[vuln_types::COMMAND_INJECTION],
            MatchCriteria::guard_matching(r"^(isAllowedCommand|is_allowed_command|validateCommand)$"),
            0.8,
        ),
        builtin(
            "path-containment-guard",
            "Canonical path containment check",
            &[vuln_types::PATH_TRAVERSAL],
            MatchCriteria::guard_matching(r"^(isPathInside|is_path_inside|withinBase|isSubPath)$"),
            0.85,
        ),
        builtin(
            "path-canonicalize",
            "Path canonicalization with bound result",
            &[vuln_types::PATH_TRAVERSAL],
            MatchCriteria {
                requires_binding: true,
                ..MatchCriteria::call_matching(r"^(realpath|canonicalize|normalize)$")
            },
            0.5,
        ),
        builtin(
            "url-allowlist-guard",
            "Outbound URL allowlist check",
            &[vuln_types::SSRF],
            MatchCriteria::guard_matching(r"^(isAllowedHost|is_allowed_host|isAllowedUrl|validateUrl)$"),
            0.85,
        ),
        builtin(
            "schema-validate",
            "Schema validation before use",
            &[vuln_types::DESERIALIZATION],
            MatchCriteria::call_matching(r"^(validateSchema|validate_schema|safeParse|safe_parse)$"),
            0.8,
        ),
        builtin(
            "safe-load",
            "Safe deserialization entry point",
            &[vuln_types::DESERIALIZATION],
            MatchCriteria::call_matching(r"^(safeLoad|safe_load)$"),
            0.9,
        ),
    ]
}
