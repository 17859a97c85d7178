mod common;

use catalog::{MatchCriteria, MitigationConfiguration, MitigationPattern, PatternOverride};
use common::*;
use engine::{analyze_files, BudgetConfig, BudgetStatus, EngineConfig};
use ir::{MitigationStatus, Severity, Span, VulnType};

fn config() -> EngineConfig {
    EngineConfig::default()
}

/// Scenario: every branch sanitizes before the sink, so the finding is
/// suppressed entirely.
#[test]
fn fully_mitigated_sink_produces_zero_findings() {
    let f = func(
        "f1",
        "handler",
        "app.ts",
        (1, 10),
        vec![
            iff(
                nm("flag", 2),
                vec![let_call("input", "escapeHtml", vec![nm("input", 3)], 3)],
                Some(vec![let_call("input", "sanitize", vec![nm("input", 5)], 5)]),
                Span { line: 2, end_line: 6 },
            ),
            call_stmt("render", vec![nm("input", 8)], 8),
        ],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![candidate("v1", "xss", "app.ts", 8, Severity::High)],
    )];
    let result = analyze_files(&files, &config()).unwrap();
    assert!(result.findings.is_empty());
    assert_eq!(result.budget_status, BudgetStatus::Ok);
    assert!(!result.degraded);
    assert!(result
        .decisions
        .iter()
        .any(|d| d.message.contains("suppressed")));
}

/// Scenario: only one of two branches sanitizes; one finding, downgraded
/// one step, naming the unprotected branch.
#[test]
fn partially_mitigated_sink_is_downgraded_not_suppressed() {
    let f = func(
        "f1",
        "handler",
        "app.ts",
        (1, 10),
        vec![
            iff(
                nm("flag", 2),
                vec![let_call("input", "escapeHtml", vec![nm("input", 3)], 3)],
                None,
                Span { line: 2, end_line: 4 },
            ),
            call_stmt("render", vec![nm("input", 6)], 6),
        ],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![candidate("v1", "xss", "app.ts", 6, Severity::Critical)],
    )];
    let result = analyze_files(&files, &config()).unwrap();
    assert_eq!(result.findings.len(), 1);
    let finding = &result.findings[0];
    assert_eq!(finding.severity, Severity::High);
    assert_eq!(finding.metadata.original_severity, Some(Severity::Critical));
    assert_eq!(finding.metadata.mitigation_status, MitigationStatus::Partial);
    assert!(finding.message.contains("1 of 2 execution paths"));
    assert_eq!(finding.metadata.unprotected_paths.len(), 1);
}

/// Scenario: a custom pattern claiming the reserved name `eval` is
/// rejected with a structured code while its siblings still load.
#[test]
fn reserved_pattern_name_is_rejected_but_run_continues() {
    let mut cfg = config();
    cfg.mitigations = MitigationConfiguration {
        custom_patterns: vec![
            MitigationPattern {
                id: "eval".into(),
                name: "eval".into(),
                description: None,
                mitigates: [VulnType::new("xss")].into_iter().collect(),
                criteria: MatchCriteria::call("eval"),
                confidence: 0.9,
                builtin: false,
                deprecated: None,
            },
            MitigationPattern {
                id: "team-sanitizer".into(),
                name: "team sanitizer".into(),
                description: None,
                mitigates: [VulnType::new("xss")].into_iter().collect(),
                criteria: MatchCriteria::call("teamSanitize"),
                confidence: 0.9,
                builtin: false,
                deprecated: None,
            },
        ],
        ..Default::default()
    };

    let f = func(
        "f1",
        "handler",
        "app.ts",
        (1, 5),
        vec![
            call_stmt("teamSanitize", vec![nm("input", 2)], 2),
            call_stmt("render", vec![nm("input", 3)], 3),
        ],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![candidate("v1", "xss", "app.ts", 3, Severity::High)],
    )];
    let result = analyze_files(&files, &cfg).unwrap();
    // The sibling pattern loaded and covered the only path.
    assert!(result.findings.is_empty());
    let rejection = result
        .decisions
        .iter()
        .find(|d| d.message.contains("custom pattern rejected"))
        .expect("rejection logged");
    assert_eq!(rejection.context["code"], "reserved-name");
}

/// Scenario: sanitizer three call frames away with a depth limit of two:
/// conservative fallback emits the finding and flags it degraded.
#[test]
fn depth_limited_sanitizer_still_reports_conservatively() {
    let f0 = func(
        "f0",
        "handler",
        "app.ts",
        (1, 5),
        vec![
            call_stmt("a", vec![nm("input", 2)], 2),
            call_stmt("render", vec![nm("input", 3)], 3),
        ],
    );
    let a = func("fa", "a", "app.ts", (7, 9), vec![call_stmt("b", vec![nm("x", 8)], 8)]);
    let b = func("fb", "b", "app.ts", (11, 13), vec![call_stmt("c", vec![nm("x", 12)], 12)]);
    let c = func(
        "fc",
        "c",
        "app.ts",
        (15, 17),
        vec![let_call("safe", "escapeHtml", vec![nm("x", 16)], 16)],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f0, a, b, c],
        vec![candidate("v1", "xss", "app.ts", 3, Severity::High)],
    )];
    let mut cfg = config();
    cfg.budget = BudgetConfig {
        max_call_depth: 2,
        ..Default::default()
    };
    let result = analyze_files(&files, &cfg).unwrap();
    assert_eq!(result.findings.len(), 1);
    let finding = &result.findings[0];
    assert!(finding.metadata.degraded);
    assert!(finding
        .metadata
        .degraded_reason
        .as_deref()
        .unwrap()
        .contains("depth"));
    assert!(result.degraded);
}

/// Scenario: a visit limit below the function's node count flags the
/// analysis as partial and never suppresses.
#[test]
fn node_visit_limit_yields_flagged_partial_analysis() {
    let body = (0..13)
        .map(|i| call_stmt(&format!("step{i}"), vec![], i + 2))
        .collect();
    let f = func("f1", "big", "app.ts", (1, 16), body);
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![candidate("v1", "xss", "app.ts", 14, Severity::High)],
    )];
    let mut cfg = config();
    cfg.budget = BudgetConfig {
        node_visit_limit: 10,
        ..Default::default()
    };
    let result = analyze_files(&files, &cfg).unwrap();
    assert_eq!(result.findings.len(), 1);
    let finding = &result.findings[0];
    assert!(finding.metadata.degraded);
    assert!(finding
        .metadata
        .degraded_reason
        .as_deref()
        .unwrap()
        .contains("node visit limit"));
}

/// Scenario: size budget exhausted mid-run; low-priority files are
/// deferred first and then skipped, and everything already produced is
/// returned with a degraded flag.
#[test]
fn exhausted_budget_skips_low_priority_files_and_returns_partial_results() {
    let sink_file = |path: &str, id: &str, lines: (usize, usize)| {
        let f = func(
            id,
            "handler",
            path,
            lines,
            vec![call_stmt("render", vec![nm("input", lines.0 + 1)], lines.0 + 1)],
        );
        let v = candidate(&format!("{id}-v"), "xss", path, lines.0 + 1, Severity::High);
        mk_file(path, vec![f], vec![v])
    };
    // 85 lines, then 20, against a 100-line budget: warning after the
    // first file, exceeded after the second.
    let files = vec![
        sink_file("checkout.ts", "f1", (1, 85)),
        sink_file("checkout.test.ts", "f2", (1, 50)),
        sink_file("cart.ts", "f3", (1, 20)),
    ];
    let mut cfg = config();
    cfg.budget = BudgetConfig {
        size_budget_lines: 100,
        ..Default::default()
    };
    let result = analyze_files(&files, &cfg).unwrap();
    assert!(result.budget_status >= BudgetStatus::Exceeded);
    assert!(result.degraded);
    // The two normal files produced findings; the test file was deferred
    // and then dropped.
    assert_eq!(result.findings.len(), 2);
    assert!(result.findings.iter().all(|f| f.file != "checkout.test.ts"));
    assert!(result
        .decisions
        .iter()
        .any(|d| d.message.contains("deferred")));
    assert!(result
        .decisions
        .iter()
        .any(|d| d.message.contains("skipped")));
    assert_eq!(result.files_analyzed, 2);
}

/// Hard ceiling mid-file: already-produced findings survive.
#[test]
fn termination_returns_findings_produced_before_the_ceiling() {
    let small = {
        let f = func(
            "f1",
            "handler",
            "api.ts",
            (1, 20),
            vec![call_stmt("render", vec![nm("input", 2)], 2)],
        );
        mk_file(
            "api.ts",
            vec![f],
            vec![candidate("v1", "xss", "api.ts", 2, Severity::High)],
        )
    };
    let huge = {
        let f = func(
            "f2",
            "bulk",
            "bulk.ts",
            (1, 100),
            vec![call_stmt("render", vec![nm("input", 2)], 2)],
        );
        mk_file(
            "bulk.ts",
            vec![f],
            vec![candidate("v2", "xss", "bulk.ts", 2, Severity::High)],
        )
    };
    let mut cfg = config();
    cfg.budget = BudgetConfig {
        size_budget_lines: 100,
        ..Default::default()
    };
    let result = analyze_files(&[small, huge], &cfg).unwrap();
    assert_eq!(result.budget_status, BudgetStatus::Terminated);
    assert!(!result.findings.is_empty());
    assert!(result.findings.iter().all(|f| f.file == "api.ts"));
}

#[test]
fn negative_budget_configuration_is_fatal() {
    let mut cfg = config();
    cfg.budget.size_budget_lines = -5;
    let err = analyze_files(&[], &cfg).unwrap_err();
    assert!(err.to_string().contains("budget configuration rejected"));
}

#[test]
fn disabled_engine_returns_an_empty_clean_result() {
    let f = func(
        "f1",
        "handler",
        "app.ts",
        (1, 4),
        vec![call_stmt("render", vec![nm("input", 2)], 2)],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![candidate("v1", "xss", "app.ts", 2, Severity::High)],
    )];
    let mut cfg = config();
    cfg.enabled = false;
    let result = analyze_files(&files, &cfg).unwrap();
    assert!(result.findings.is_empty());
    assert_eq!(result.files_analyzed, 0);
}

#[test]
fn unsupported_function_is_skipped_and_the_run_continues() {
    let broken = func(
        "f1",
        "odd",
        "app.ts",
        (1, 5),
        vec![ir::Stmt::Unsupported {
            construct: "with-statement".into(),
            span: sp(2),
        }],
    );
    let fine = func(
        "f2",
        "handler",
        "app.ts",
        (7, 10),
        vec![call_stmt("render", vec![nm("input", 8)], 8)],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![broken, fine],
        vec![candidate("v1", "xss", "app.ts", 8, Severity::High)],
    )];
    let result = analyze_files(&files, &config()).unwrap();
    assert_eq!(result.findings.len(), 1);
    assert!(result
        .decisions
        .iter()
        .any(|d| d.message.contains("skipped") && d.message.contains("odd")));
}

#[test]
fn override_deprecates_and_disable_removes_patterns_for_the_run() {
    let f = func(
        "f1",
        "handler",
        "app.ts",
        (1, 5),
        vec![
            let_call("safe", "escapeHtml", vec![nm("input", 2)], 2),
            call_stmt("render", vec![nm("safe", 3)], 3),
        ],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![candidate("v1", "xss", "app.ts", 3, Severity::High)],
    )];

    // Disabling the only applicable pattern turns suppression into a
    // full-severity finding.
    let mut cfg = config();
    cfg.mitigations = MitigationConfiguration {
        disabled_patterns: vec!["escape-html".into()],
        ..Default::default()
    };
    let result = analyze_files(&files, &cfg).unwrap();
    assert_eq!(result.findings.len(), 1);
    assert_eq!(result.findings[0].severity, Severity::High);

    // An override alone keeps the pattern active.
    let mut cfg = config();
    cfg.mitigations = MitigationConfiguration {
        overrides: vec![PatternOverride {
            pattern_id: "escape-html".into(),
            confidence: Some(0.5),
            deprecated: Some("prefer a templating engine".into()),
        }],
        ..Default::default()
    };
    let result = analyze_files(&files, &cfg).unwrap();
    assert!(result.findings.is_empty());
}

#[test]
fn identical_runs_produce_identical_output() {
    init_tracing();
    let f = func(
        "f1",
        "handler",
        "app.ts",
        (1, 10),
        vec![
            iff(
                nm("flag", 2),
                vec![let_call("input", "escapeHtml", vec![nm("input", 3)], 3)],
                None,
                Span { line: 2, end_line: 4 },
            ),
            call_stmt("render", vec![nm("input", 6)], 6),
            call_stmt("query", vec![nm("input", 7)], 7),
        ],
    );
    let files = vec![mk_file(
        "app.ts",
        vec![f],
        vec![
            candidate("v1", "xss", "app.ts", 6, Severity::High),
            candidate("v2", "sql-injection", "app.ts", 7, Severity::Critical),
        ],
    )];
    let reference = analyze_files(&files, &config()).unwrap();
    let reference_json = serde_json::to_string(&reference.findings).unwrap();
    for _ in 0..20 {
        let run = analyze_files(&files, &config()).unwrap();
        assert_eq!(serde_json::to_string(&run.findings).unwrap(), reference_json);
        assert_eq!(run.budget_status, reference.budget_status);
        assert_eq!(run.degraded, reference.degraded);
    }
}
