//! Parsed function bodies handed over by the surrounding pipeline.
//!
//! Parsing source text is an external collaborator's job: the engine
//! receives one [`SourceFile`] per changed file, each carrying its parsed
//! [`SourceFunction`] bodies and the candidate risk points located in it.
//! Statements and expressions are tagged variants rather than open,
//! stringly-kinded tree nodes so the CFG lowering can match on them
//! exhaustively.

use crate::PotentialVulnerability;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
/// Line range of a statement or expression within its file.
pub struct Span {
    pub line: usize,
    pub end_line: usize,
}

impl Span {
    pub fn line(line: usize) -> Self {
        Self {
            line,
            end_line: line,
        }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            line: self.line.min(other.line),
            end_line: self.end_line.max(other.end_line),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Callee of a call expression.
pub enum Callee {
    /// Statically named function, optionally qualified with the module it
    /// was imported from.
    Named {
        name: String,
        #[serde(default)]
        module: Option<String>,
    },
    /// Computed callee (member lookup on a dynamic value, function-valued
    /// variable). Never resolvable statically.
    Dynamic,
}

impl Callee {
    pub fn named(name: &str) -> Self {
        Callee::Named {
            name: name.to_string(),
            module: None,
        }
    }

    pub fn qualified(module: &str, name: &str) -> Self {
        Callee::Named {
            name: name.to_string(),
            module: Some(module.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Expression tree. Only the shapes the analysis cares about are modeled;
/// anything else arrives as `Unknown`.
pub enum Expr {
    Call {
        callee: Callee,
        #[serde(default)]
        args: Vec<Expr>,
        span: Span,
    },
    /// `await`-like construct. Only its control-flow shape matters.
    Await { inner: Box<Expr>, span: Span },
    Name { name: String, span: Span },
    Member {
        object: Box<Expr>,
        property: String,
        span: Span,
    },
    Literal { value: JsonValue, span: Span },
    Binary {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        span: Span,
    },
    Unary {
        op: String,
        operand: Box<Expr>,
        span: Span,
    },
    Unknown { span: Span },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Call { span, .. }
            | Expr::Await { span, .. }
            | Expr::Name { span, .. }
            | Expr::Member { span, .. }
            | Expr::Literal { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Unknown { span } => *span,
        }
    }

    /// Root variable name of the expression, when it is a plain name or a
    /// member chain rooted in one.
    pub fn root_name(&self) -> Option<&str> {
        match self {
            Expr::Name { name, .. } => Some(name),
            Expr::Member { object, .. } => object.root_name(),
            Expr::Await { inner, .. } => inner.root_name(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One `case` arm of a switch statement.
pub struct SwitchCase {
    /// Case label rendered as text, used to label the branch edge.
    pub label: String,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// `catch` clause of a try statement.
pub struct CatchClause {
    #[serde(default)]
    pub param: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Statement tree produced by the external parser.
pub enum Stmt {
    Expr { expr: Expr, span: Span },
    Let {
        name: String,
        #[serde(default)]
        value: Option<Expr>,
        span: Span,
    },
    Assign { target: Expr, value: Expr, span: Span },
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        #[serde(default)]
        else_branch: Option<Vec<Stmt>>,
        span: Span,
    },
    Switch {
        scrutinee: Expr,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Option<Vec<Stmt>>,
        span: Span,
    },
    While { cond: Expr, body: Vec<Stmt>, span: Span },
    DoWhile { body: Vec<Stmt>, cond: Expr, span: Span },
    For {
        #[serde(default)]
        init: Option<Box<Stmt>>,
        #[serde(default)]
        cond: Option<Expr>,
        #[serde(default)]
        update: Option<Expr>,
        body: Vec<Stmt>,
        span: Span,
    },
    /// `for-in` / `for-of` style iteration.
    ForEach {
        binding: String,
        iterable: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Try {
        body: Vec<Stmt>,
        #[serde(default)]
        catch: Option<CatchClause>,
        #[serde(default)]
        finally: Option<Vec<Stmt>>,
        span: Span,
    },
    Return {
        #[serde(default)]
        value: Option<Expr>,
        span: Span,
    },
    Throw { value: Expr, span: Span },
    Break { span: Span },
    Continue { span: Span },
    Block { body: Vec<Stmt>, span: Span },
    /// Construct the parser recognized but cannot decompose. Lowering a
    /// function containing one fails with a typed error.
    Unsupported { construct: String, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr { span, .. }
            | Stmt::Let { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::If { span, .. }
            | Stmt::Switch { span, .. }
            | Stmt::While { span, .. }
            | Stmt::DoWhile { span, .. }
            | Stmt::For { span, .. }
            | Stmt::ForEach { span, .. }
            | Stmt::Try { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Throw { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Block { span, .. }
            | Stmt::Unsupported { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One parsed function body with its source location.
pub struct SourceFunction {
    /// Stable identifier, unique across the run (assigned by the pipeline).
    pub id: String,
    pub name: String,
    pub file: String,
    pub span: Span,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    /// True for synthetic functions wrapping top-level module code; matches
    /// inside them get module scope.
    #[serde(default)]
    pub is_module_init: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One changed file: parsed functions plus the candidate risk points the
/// upstream pattern-based scanners located in it.
pub struct SourceFile {
    pub path: String,
    pub functions: Vec<SourceFunction>,
    #[serde(default)]
    pub candidates: Vec<PotentialVulnerability>,
}

impl SourceFile {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            functions: Vec::new(),
            candidates: Vec::new(),
        }
    }

    /// Total line count of the parsed functions, used for budget accounting.
    pub fn line_count(&self) -> u64 {
        self.functions
            .iter()
            .map(|f| (f.span.end_line.saturating_sub(f.span.line) + 1) as u64)
            .sum()
    }
}
