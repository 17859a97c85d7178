use super::*;
use std::collections::BTreeMap;

fn tiny_graph() -> ControlFlowGraph {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        NodeId(0),
        CfgNode::new(NodeId(0), CfgNodeKind::Entry, Span::line(1)),
    );
    nodes.insert(
        NodeId(1),
        CfgNode::new(NodeId(1), CfgNodeKind::Basic, Span { line: 2, end_line: 4 }),
    );
    nodes.insert(
        NodeId(2),
        CfgNode::new(NodeId(2), CfgNodeKind::Exit, Span::line(5)),
    );
    ControlFlowGraph {
        id: "f1".into(),
        name: "handler".into(),
        file: "app.ts".into(),
        span: Span { line: 1, end_line: 5 },
        nodes,
        edges: vec![
            CfgEdge {
                from: NodeId(0),
                to: NodeId(1),
                kind: EdgeKind::Sequential,
                label: None,
            },
            CfgEdge {
                from: NodeId(1),
                to: NodeId(2),
                kind: EdgeKind::Sequential,
                label: None,
            },
        ],
        entry: NodeId(0),
        exits: vec![NodeId(2)],
        call_sites: Vec::new(),
    }
}

#[test]
fn vuln_type_normalizes_case_and_separators() {
    assert_eq!(VulnType::new("SQL Injection").as_str(), "sql-injection");
    assert_eq!(VulnType::new("sql_injection").as_str(), "sql-injection");
    assert_eq!(VulnType::new("  XSS ").as_str(), "xss");
    assert_eq!(VulnType::new("xss"), VulnType::new("XSS"));
}

#[test]
fn severity_downgrades_one_step_and_low_is_terminal() {
    assert_eq!(Severity::Critical.downgraded(), Severity::High);
    assert_eq!(Severity::High.downgraded(), Severity::Medium);
    assert_eq!(Severity::Medium.downgraded(), Severity::Low);
    assert_eq!(Severity::Low.downgraded(), Severity::Low);
}

#[test]
fn severity_maps_to_report_levels() {
    assert_eq!(Severity::Critical.report_level(), ReportLevel::Error);
    assert_eq!(Severity::High.report_level(), ReportLevel::Error);
    assert_eq!(Severity::Medium.report_level(), ReportLevel::Warning);
    assert_eq!(Severity::Low.report_level(), ReportLevel::Info);
}

#[test]
fn severity_round_trips_through_str() {
    for s in [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ] {
        assert_eq!(s.to_string().parse::<Severity>().unwrap(), s);
    }
    assert!("urgent".parse::<Severity>().is_err());
}

#[test]
fn graph_validation_accepts_well_formed_graph() {
    assert!(tiny_graph().validate().is_ok());
}

#[test]
fn graph_validation_rejects_dangling_edges() {
    let mut g = tiny_graph();
    g.edges.push(CfgEdge {
        from: NodeId(1),
        to: NodeId(99),
        kind: EdgeKind::Sequential,
        label: None,
    });
    assert_eq!(
        g.validate(),
        Err(cfg::GraphDefect::DanglingEdge {
            from: NodeId(1),
            to: NodeId(99)
        })
    );
}

#[test]
fn graph_validation_rejects_missing_exit() {
    let mut g = tiny_graph();
    g.exits.clear();
    assert_eq!(g.validate(), Err(cfg::GraphDefect::NoExit));
}

#[test]
fn node_at_line_prefers_tightest_span() {
    let g = tiny_graph();
    // Line 3 only falls inside the basic block.
    assert_eq!(g.node_at_line(3), Some(NodeId(1)));
    // Line 5 falls inside the exit node only.
    assert_eq!(g.node_at_line(5), Some(NodeId(2)));
    assert_eq!(g.node_at_line(40), None);
}

#[test]
fn stmt_serialization_round_trips() {
    let stmt = Stmt::If {
        cond: Expr::Call {
            callee: Callee::named("isValid"),
            args: vec![Expr::Name {
                name: "input".into(),
                span: Span::line(2),
            }],
            span: Span::line(2),
        },
        then_branch: vec![Stmt::Return {
            value: None,
            span: Span::line(3),
        }],
        else_branch: None,
        span: Span { line: 2, end_line: 4 },
    };
    let json = serde_json::to_string(&stmt).unwrap();
    let back: Stmt = serde_json::from_str(&json).unwrap();
    assert_eq!(back, stmt);
}

#[test]
fn source_file_line_count_sums_function_spans() {
    let mut file = SourceFile::new("app.ts");
    file.functions.push(SourceFunction {
        id: "f1".into(),
        name: "a".into(),
        file: "app.ts".into(),
        span: Span { line: 1, end_line: 10 },
        params: vec![],
        body: vec![],
        is_module_init: false,
    });
    file.functions.push(SourceFunction {
        id: "f2".into(),
        name: "b".into(),
        file: "app.ts".into(),
        span: Span { line: 12, end_line: 13 },
        params: vec![],
        body: vec![],
        is_module_init: false,
    });
    assert_eq!(file.line_count(), 12);
}
