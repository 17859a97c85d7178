#![allow(dead_code)]

use catalog::build_catalog;
use catalog::PatternCatalog;
use engine::{AnalysisBudget, BudgetConfig};
use ir::{
    Callee, Expr, PotentialVulnerability, Severity, SourceFile, SourceFunction, Span, Stmt,
    VulnType,
};
use std::collections::BTreeSet;

/// Enables log output for a test when RUST_LOG is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn sp(line: usize) -> Span {
    Span::line(line)
}

pub fn nm(name: &str, line: usize) -> Expr {
    Expr::Name {
        name: name.into(),
        span: sp(line),
    }
}

pub fn call(callee: &str, args: Vec<Expr>, line: usize) -> Expr {
    Expr::Call {
        callee: Callee::named(callee),
        args,
        span: sp(line),
    }
}

pub fn dyn_call(line: usize) -> Expr {
    Expr::Call {
        callee: Callee::Dynamic,
        args: Vec::new(),
        span: sp(line),
    }
}

pub fn call_stmt(callee: &str, args: Vec<Expr>, line: usize) -> Stmt {
    Stmt::Expr {
        expr: call(callee, args, line),
        span: sp(line),
    }
}

pub fn await_call_stmt(callee: &str, args: Vec<Expr>, line: usize) -> Stmt {
    Stmt::Expr {
        expr: Expr::Await {
            inner: Box::new(call(callee, args, line)),
            span: sp(line),
        },
        span: sp(line),
    }
}

pub fn let_call(target: &str, callee: &str, args: Vec<Expr>, line: usize) -> Stmt {
    Stmt::Let {
        name: target.into(),
        value: Some(call(callee, args, line)),
        span: sp(line),
    }
}

pub fn let_name(target: &str, from: &str, line: usize) -> Stmt {
    Stmt::Let {
        name: target.into(),
        value: Some(nm(from, line)),
        span: sp(line),
    }
}

pub fn ret(line: usize) -> Stmt {
    Stmt::Return {
        value: None,
        span: sp(line),
    }
}

pub fn iff(cond: Expr, then_branch: Vec<Stmt>, else_branch: Option<Vec<Stmt>>, span: Span) -> Stmt {
    Stmt::If {
        cond,
        then_branch,
        else_branch,
        span,
    }
}

pub fn func(id: &str, name: &str, file: &str, lines: (usize, usize), body: Vec<Stmt>) -> SourceFunction {
    SourceFunction {
        id: id.into(),
        name: name.into(),
        file: file.into(),
        span: Span {
            line: lines.0,
            end_line: lines.1,
        },
        params: Vec::new(),
        body,
        is_module_init: false,
    }
}

pub fn mk_file(
    path: &str,
    functions: Vec<SourceFunction>,
    candidates: Vec<PotentialVulnerability>,
) -> SourceFile {
    SourceFile {
        path: path.into(),
        functions,
        candidates,
    }
}

pub fn candidate(
    id: &str,
    vuln_type: &str,
    file: &str,
    line: usize,
    severity: Severity,
) -> PotentialVulnerability {
    PotentialVulnerability {
        id: id.into(),
        vuln_type: VulnType::new(vuln_type),
        file: file.into(),
        line,
        end_line: None,
        function: None,
        tainted_source: None,
        variable: None,
        required_mitigations: BTreeSet::new(),
        severity,
        description: format!("potential {vuln_type} at a sink"),
    }
}

pub fn default_catalog() -> PatternCatalog {
    build_catalog(&Default::default()).catalog
}

pub fn default_budget() -> AnalysisBudget {
    AnalysisBudget::new(&BudgetConfig::default()).expect("default budget config is valid")
}

pub fn budget_with(config: BudgetConfig) -> AnalysisBudget {
    AnalysisBudget::new(&config).expect("test budget config is valid")
}
