//! Lowers a parsed function body into a [`ControlFlowGraph`].
//!
//! The builder is an explicit recursive-descent visitor over the statement
//! tree. Each construct returns the list of dangling edges that must be
//! connected to whatever executes next; terminal statements (return,
//! throw) return an empty list, which makes lexically-following code
//! unreachable and keeps it out of the graph entirely.
//!
//! Lowering either produces a structurally valid graph or a typed error;
//! partial graphs are never returned.

use ir::{
    CallSite, CfgEdge, CfgNode, CfgNodeKind, CodeEvent, ControlFlowGraph, EdgeKind, Expr,
    NodeId, Resolution, SourceFunction, Span, Stmt,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CfgError {
    #[error("unsupported construct '{construct}' at line {line}")]
    UnsupportedConstruct { construct: String, line: usize },
    #[error("lowering '{function}' produced a malformed graph: {defect}")]
    Malformed { function: String, defect: String },
}

/// Dangling edge waiting for its target node.
#[derive(Debug, Clone)]
struct Pending {
    from: NodeId,
    kind: EdgeKind,
    label: Option<String>,
}

fn pending(from: NodeId, kind: EdgeKind) -> Pending {
    Pending {
        from,
        kind,
        label: None,
    }
}

fn seq(from: NodeId) -> Vec<Pending> {
    vec![pending(from, EdgeKind::Sequential)]
}

/// Call found while scanning an expression, before resolution.
#[derive(Debug)]
struct RawCall {
    callee: String,
    module: Option<String>,
    dynamic: bool,
    line: usize,
}

#[derive(Debug, Default)]
struct ExprScan {
    events: Vec<CodeEvent>,
    calls: Vec<RawCall>,
    has_await: bool,
}

struct LoopCtx {
    header: NodeId,
    breaks: Vec<Pending>,
}

struct Builder<'a> {
    func: &'a SourceFunction,
    nodes: BTreeMap<NodeId, CfgNode>,
    edges: Vec<CfgEdge>,
    call_sites: Vec<CallSite>,
    exits: Vec<NodeId>,
    next_id: usize,
    /// Innermost exceptional target (catch entry, finally entry, or the
    /// function throw node context).
    handlers: Vec<NodeId>,
    loops: Vec<LoopCtx>,
    /// Finally entries active for `return` routing, innermost last. The
    /// bool records whether a return actually routed through it.
    finally_stack: Vec<(NodeId, bool)>,
    throw_node: Option<NodeId>,
    /// Open basic block that plain statements coalesce into.
    open_block: Option<NodeId>,
}

/// Builds the control flow graph for one function.
pub fn build_cfg(func: &SourceFunction) -> Result<ControlFlowGraph, CfgError> {
    let mut b = Builder {
        func,
        nodes: BTreeMap::new(),
        edges: Vec::new(),
        call_sites: Vec::new(),
        exits: Vec::new(),
        next_id: 0,
        handlers: Vec::new(),
        loops: Vec::new(),
        finally_stack: Vec::new(),
        throw_node: None,
        open_block: None,
    };

    let entry = b.new_node(CfgNodeKind::Entry, Span::line(func.span.line));
    let tail = b.lower_stmts(&func.body, seq(entry))?;
    if !tail.is_empty() || b.exits.is_empty() {
        let exit = b.new_node(CfgNodeKind::Exit, Span::line(func.span.end_line));
        b.connect(&tail, exit);
        b.exits.push(exit);
    }

    let graph = ControlFlowGraph {
        id: func.id.clone(),
        name: func.name.clone(),
        file: func.file.clone(),
        span: func.span,
        nodes: b.nodes,
        edges: b.edges,
        entry,
        exits: b.exits,
        call_sites: b.call_sites,
    };
    if let Err(defect) = graph.validate() {
        return Err(CfgError::Malformed {
            function: func.name.clone(),
            defect: defect.to_string(),
        });
    }
    Ok(graph)
}

impl<'a> Builder<'a> {
    fn new_node(&mut self, kind: CfgNodeKind, span: Span) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, CfgNode::new(id, kind, span));
        // Statements inside a try region can raise at any point.
        let statement_like = matches!(
            kind,
            CfgNodeKind::Basic
                | CfgNodeKind::Call
                | CfgNodeKind::Await
                | CfgNodeKind::Branch
                | CfgNodeKind::LoopHeader
        );
        if statement_like {
            if let Some(&handler) = self.handlers.last() {
                self.edges.push(CfgEdge {
                    from: id,
                    to: handler,
                    kind: EdgeKind::Exception,
                    label: None,
                });
            }
        }
        id
    }

    fn connect(&mut self, preds: &[Pending], to: NodeId) {
        for p in preds {
            self.edges.push(CfgEdge {
                from: p.from,
                to,
                kind: p.kind,
                label: p.label.clone(),
            });
        }
    }

    fn throw_target(&mut self) -> NodeId {
        if let Some(t) = self.throw_node {
            return t;
        }
        let t = self.new_node(CfgNodeKind::Throw, Span::line(self.func.span.end_line));
        self.throw_node = Some(t);
        self.exits.push(t);
        t
    }

    fn attach_scan(&mut self, node: NodeId, scan: ExprScan) {
        if let Some(n) = self.nodes.get_mut(&node) {
            n.events.extend(scan.events);
        }
        for raw in scan.calls {
            self.call_sites.push(CallSite {
                node,
                callee: raw.callee,
                module: raw.module,
                resolution: if raw.dynamic {
                    Resolution::Dynamic
                } else {
                    Resolution::External
                },
                line: raw.line,
            });
        }
    }

    fn lower_stmts(
        &mut self,
        stmts: &[Stmt],
        mut preds: Vec<Pending>,
    ) -> Result<Vec<Pending>, CfgError> {
        for (i, stmt) in stmts.iter().enumerate() {
            if preds.is_empty() {
                debug!(
                    function = %self.func.name,
                    line = stmt.span().line,
                    skipped = stmts.len() - i,
                    "statements after a terminal are unreachable; not lowered"
                );
                break;
            }
            preds = self.lower_stmt(stmt, preds)?;
        }
        Ok(preds)
    }

    fn lower_stmt(&mut self, stmt: &Stmt, preds: Vec<Pending>) -> Result<Vec<Pending>, CfgError> {
        match stmt {
            Stmt::Expr { expr, span } => {
                let mut scan = ExprScan::default();
                scan_expr(expr, None, false, &mut scan);
                Ok(self.lower_simple(*span, scan, preds))
            }
            Stmt::Let { name, value, span } => {
                let mut scan = ExprScan::default();
                if let Some(v) = value {
                    scan_expr(v, Some(name), false, &mut scan);
                }
                Ok(self.lower_simple(*span, scan, preds))
            }
            Stmt::Assign {
                target,
                value,
                span,
            } => {
                let mut scan = ExprScan::default();
                scan_expr(value, target.root_name(), false, &mut scan);
                Ok(self.lower_simple(*span, scan, preds))
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                span,
            } => {
                self.open_block = None;
                let mut scan = ExprScan::default();
                scan_expr(cond, None, true, &mut scan);
                let branch = self.new_node(CfgNodeKind::Branch, cond.span());
                self.attach_scan(branch, scan);
                self.connect(&preds, branch);

                let mut out =
                    self.lower_stmts(then_branch, vec![pending(branch, EdgeKind::BranchTrue)])?;
                match else_branch {
                    Some(els) => {
                        let else_out =
                            self.lower_stmts(els, vec![pending(branch, EdgeKind::BranchFalse)])?;
                        out.extend(else_out);
                    }
                    None => out.push(pending(branch, EdgeKind::BranchFalse)),
                }
                self.merge(out, span.end_line)
            }
            Stmt::Switch {
                scrutinee,
                cases,
                default,
                span,
            } => {
                self.open_block = None;
                let mut scan = ExprScan::default();
                scan_expr(scrutinee, None, false, &mut scan);
                let branch = self.new_node(CfgNodeKind::Branch, scrutinee.span());
                self.attach_scan(branch, scan);
                self.connect(&preds, branch);

                let mut out = Vec::new();
                for case in cases {
                    let arm = self.lower_stmts(
                        &case.body,
                        vec![Pending {
                            from: branch,
                            kind: EdgeKind::BranchTrue,
                            label: Some(case.label.clone()),
                        }],
                    )?;
                    out.extend(arm);
                }
                match default {
                    Some(body) => {
                        let arm = self.lower_stmts(
                            body,
                            vec![Pending {
                                from: branch,
                                kind: EdgeKind::BranchFalse,
                                label: Some("default".to_string()),
                            }],
                        )?;
                        out.extend(arm);
                    }
                    None => out.push(pending(branch, EdgeKind::BranchFalse)),
                }
                self.merge(out, span.end_line)
            }
            Stmt::While { cond, body, .. } => {
                self.open_block = None;
                let mut scan = ExprScan::default();
                scan_expr(cond, None, true, &mut scan);
                let header = self.new_node(CfgNodeKind::LoopHeader, cond.span());
                self.attach_scan(header, scan);
                self.connect(&preds, header);
                let breaks = self.lower_loop_body(header, body, None)?;
                let mut out = vec![pending(header, EdgeKind::LoopExit)];
                out.extend(breaks);
                Ok(out)
            }
            Stmt::DoWhile { body, cond, .. } => {
                self.open_block = None;
                let mut scan = ExprScan::default();
                scan_expr(cond, None, true, &mut scan);
                // Header sits after the body but is still the loop's
                // decision point; continue targets it.
                let header = self.new_node(CfgNodeKind::LoopHeader, cond.span());
                self.attach_scan(header, scan);

                let body_span = body.first().map(|s| s.span()).unwrap_or(cond.span());
                let body_entry = self.new_node(CfgNodeKind::LoopBody, body_span);
                self.connect(&preds, body_entry);
                self.edges.push(CfgEdge {
                    from: header,
                    to: body_entry,
                    kind: EdgeKind::LoopBack,
                    label: None,
                });

                self.loops.push(LoopCtx {
                    header,
                    breaks: Vec::new(),
                });
                let body_out = self.lower_stmts(body, seq(body_entry))?;
                self.connect(&body_out, header);
                let ctx = self.loops.pop().expect("loop context pushed above");
                self.open_block = None;

                let mut out = vec![pending(header, EdgeKind::LoopExit)];
                out.extend(ctx.breaks);
                Ok(out)
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
                span,
            } => {
                self.open_block = None;
                let preds = match init {
                    Some(i) => self.lower_stmt(i, preds)?,
                    None => preds,
                };
                let mut scan = ExprScan::default();
                if let Some(c) = cond {
                    scan_expr(c, None, true, &mut scan);
                }
                let header_span = cond.as_ref().map(|c| c.span()).unwrap_or(Span::line(span.line));
                let header = self.new_node(CfgNodeKind::LoopHeader, header_span);
                self.attach_scan(header, scan);
                self.connect(&preds, header);
                let breaks = self.lower_loop_body(header, body, update.as_ref())?;
                // A for-loop without a condition only exits through break.
                let mut out = if cond.is_some() {
                    vec![pending(header, EdgeKind::LoopExit)]
                } else {
                    Vec::new()
                };
                out.extend(breaks);
                Ok(out)
            }
            Stmt::ForEach {
                binding: _,
                iterable,
                body,
                ..
            } => {
                self.open_block = None;
                let mut scan = ExprScan::default();
                scan_expr(iterable, None, false, &mut scan);
                let header = self.new_node(CfgNodeKind::LoopHeader, iterable.span());
                self.attach_scan(header, scan);
                self.connect(&preds, header);
                let breaks = self.lower_loop_body(header, body, None)?;
                let mut out = vec![pending(header, EdgeKind::LoopExit)];
                out.extend(breaks);
                Ok(out)
            }
            Stmt::Try {
                body,
                catch,
                finally,
                span,
            } => self.lower_try(body, catch.as_ref(), finally.as_deref(), *span, preds),
            Stmt::Return { value, span } => {
                let mut preds = preds;
                if let Some(v) = value {
                    let mut scan = ExprScan::default();
                    scan_expr(v, None, false, &mut scan);
                    preds = self.lower_simple(v.span(), scan, preds);
                }
                if let Some((finally_entry, routed)) = self.finally_stack.last_mut() {
                    // All paths go through the finally block before the
                    // function can actually exit.
                    *routed = true;
                    let target = *finally_entry;
                    for p in &preds {
                        self.edges.push(CfgEdge {
                            from: p.from,
                            to: target,
                            kind: EdgeKind::Return,
                            label: None,
                        });
                    }
                } else {
                    let exit = self.new_node(CfgNodeKind::Exit, *span);
                    self.connect(&preds, exit);
                    self.exits.push(exit);
                }
                self.open_block = None;
                Ok(Vec::new())
            }
            Stmt::Throw { value, span } => {
                let mut preds = preds;
                let mut scan = ExprScan::default();
                scan_expr(value, None, false, &mut scan);
                if !scan.calls.is_empty() || scan.has_await {
                    preds = self.lower_simple(value.span(), scan, preds);
                }
                let t = self.new_node(CfgNodeKind::Throw, *span);
                self.connect(&preds, t);
                if let Some(&handler) = self.handlers.last() {
                    self.edges.push(CfgEdge {
                        from: t,
                        to: handler,
                        kind: EdgeKind::Exception,
                        label: None,
                    });
                } else {
                    self.exits.push(t);
                }
                self.open_block = None;
                Ok(Vec::new())
            }
            Stmt::Break { span } => {
                match self.loops.last_mut() {
                    Some(ctx) => ctx.breaks.extend(preds),
                    None => {
                        return Err(CfgError::UnsupportedConstruct {
                            construct: "break outside loop".to_string(),
                            line: span.line,
                        })
                    }
                }
                self.open_block = None;
                Ok(Vec::new())
            }
            Stmt::Continue { span } => {
                let header = match self.loops.last() {
                    Some(ctx) => ctx.header,
                    None => {
                        return Err(CfgError::UnsupportedConstruct {
                            construct: "continue outside loop".to_string(),
                            line: span.line,
                        })
                    }
                };
                for p in &preds {
                    self.edges.push(CfgEdge {
                        from: p.from,
                        to: header,
                        kind: EdgeKind::LoopBack,
                        label: None,
                    });
                }
                self.open_block = None;
                Ok(Vec::new())
            }
            Stmt::Block { body, .. } => self.lower_stmts(body, preds),
            Stmt::Unsupported { construct, span } => Err(CfgError::UnsupportedConstruct {
                construct: construct.clone(),
                line: span.line,
            }),
        }
    }

    /// Plain statement: a call becomes its own `Call` node, an awaited
    /// expression an `Await` node, anything else coalesces into the open
    /// basic block.
    fn lower_simple(&mut self, span: Span, scan: ExprScan, preds: Vec<Pending>) -> Vec<Pending> {
        if scan.has_await {
            let node = self.new_node(CfgNodeKind::Await, span);
            self.attach_scan(node, scan);
            self.connect(&preds, node);
            self.open_block = None;
            return seq(node);
        }
        if !scan.calls.is_empty() {
            let node = self.new_node(CfgNodeKind::Call, span);
            self.attach_scan(node, scan);
            self.connect(&preds, node);
            self.open_block = None;
            return seq(node);
        }
        // Coalesce consecutive simple statements into one basic block.
        if let (Some(open), [p]) = (self.open_block, preds.as_slice()) {
            if p.from == open && p.kind == EdgeKind::Sequential {
                if let Some(n) = self.nodes.get_mut(&open) {
                    n.span = n.span.merge(span);
                }
                return preds;
            }
        }
        let node = self.new_node(CfgNodeKind::Basic, span);
        self.connect(&preds, node);
        self.open_block = Some(node);
        seq(node)
    }

    /// Lowers a loop body from its header: body entry node, back edge to
    /// the header, optional update expression before the back edge.
    /// Returns the break edges collected for the loop's continuation.
    fn lower_loop_body(
        &mut self,
        header: NodeId,
        body: &[Stmt],
        update: Option<&Expr>,
    ) -> Result<Vec<Pending>, CfgError> {
        let body_span = body
            .first()
            .map(|s| s.span())
            .unwrap_or_else(|| self.nodes[&header].span);
        let body_entry = self.new_node(CfgNodeKind::LoopBody, body_span);
        self.edges.push(CfgEdge {
            from: header,
            to: body_entry,
            kind: EdgeKind::Sequential,
            label: None,
        });
        self.loops.push(LoopCtx {
            header,
            breaks: Vec::new(),
        });
        let mut body_out = self.lower_stmts(body, seq(body_entry))?;
        if let Some(update) = update {
            if !body_out.is_empty() {
                let mut scan = ExprScan::default();
                scan_expr(update, None, false, &mut scan);
                let kind = if scan.calls.is_empty() {
                    CfgNodeKind::Basic
                } else {
                    CfgNodeKind::Call
                };
                let node = self.new_node(kind, update.span());
                self.attach_scan(node, scan);
                self.connect(&body_out, node);
                body_out = seq(node);
            }
        }
        for p in &body_out {
            self.edges.push(CfgEdge {
                from: p.from,
                to: header,
                kind: EdgeKind::LoopBack,
                label: None,
            });
        }
        let ctx = self.loops.pop().expect("loop context pushed above");
        self.open_block = None;
        Ok(ctx.breaks)
    }

    fn lower_try(
        &mut self,
        body: &[Stmt],
        catch: Option<&ir::CatchClause>,
        finally: Option<&[Stmt]>,
        span: Span,
        preds: Vec<Pending>,
    ) -> Result<Vec<Pending>, CfgError> {
        self.open_block = None;

        let catch_entry = catch.map(|c| {
            let line = c.body.first().map(|s| s.span().line).unwrap_or(span.line);
            self.new_node(CfgNodeKind::Merge, Span::line(line))
        });
        let finally_entry = finally.map(|f| {
            let line = f
                .first()
                .map(|s| s.span().line)
                .unwrap_or(span.end_line);
            self.new_node(CfgNodeKind::Merge, Span::line(line))
        });

        // Exceptions in the try region land on the catch entry; with no
        // catch they still pass through the finally block.
        let handler = match (catch_entry, finally_entry) {
            (Some(c), _) => Some(c),
            (None, Some(f)) => Some(f),
            (None, None) => None,
        };
        if let Some(h) = handler {
            self.handlers.push(h);
        }
        if let Some(f) = finally_entry {
            self.finally_stack.push((f, false));
        }

        let try_out = self.lower_stmts(body, preds)?;
        if handler.is_some() {
            self.handlers.pop();
        }

        let mut normal = try_out;
        if let (Some(c), Some(entry)) = (catch, catch_entry) {
            // The catch body itself raises to the enclosing handler, not
            // back into this try.
            let catch_out = self.lower_stmts(&c.body, seq(entry))?;
            normal.extend(catch_out);
        }

        if let Some(f) = finally {
            let (entry, saw_return) = self.finally_stack.pop().expect("finally pushed above");
            self.connect(&normal, entry);
            self.open_block = None;
            let finally_out = self.lower_stmts(f, seq(entry))?;
            if catch.is_none() {
                // Exceptional entries leave the finally block still
                // unwinding.
                let t = self.throw_target();
                for p in &finally_out {
                    self.edges.push(CfgEdge {
                        from: p.from,
                        to: t,
                        kind: EdgeKind::Exception,
                        label: None,
                    });
                }
            }
            if saw_return {
                // Returns routed through the finally block exit the
                // function after it runs.
                let exit = self.new_node(CfgNodeKind::Exit, Span::line(span.end_line));
                for p in &finally_out {
                    self.edges.push(CfgEdge {
                        from: p.from,
                        to: exit,
                        kind: EdgeKind::Return,
                        label: None,
                    });
                }
                self.exits.push(exit);
            }
            self.open_block = None;
            Ok(finally_out)
        } else {
            self.open_block = None;
            Ok(normal)
        }
    }

    fn merge(&mut self, out: Vec<Pending>, line: usize) -> Result<Vec<Pending>, CfgError> {
        if out.is_empty() {
            return Ok(Vec::new());
        }
        let merge = self.new_node(CfgNodeKind::Merge, Span::line(line));
        self.connect(&out, merge);
        self.open_block = None;
        Ok(seq(merge))
    }
}

/// Renders a call argument the way the pattern catalog sees it.
fn render_arg(expr: &Expr) -> String {
    match expr {
        Expr::Name { name, .. } => name.clone(),
        Expr::Member { property, .. } => match expr.root_name() {
            Some(root) => format!("{root}.{property}"),
            None => property.clone(),
        },
        Expr::Literal { value, .. } => value.to_string(),
        Expr::Call { .. } => "<call>".to_string(),
        Expr::Await { inner, .. } => render_arg(inner),
        _ => "<expr>".to_string(),
    }
}

/// Walks an expression, collecting call/guard events and raw call sites.
/// `guard` is true inside branch and loop conditions, where calls are
/// guard-shaped. `assigned_to` only applies to the outermost call.
fn scan_expr(expr: &Expr, assigned_to: Option<&str>, guard: bool, scan: &mut ExprScan) {
    match expr {
        Expr::Call { callee, args, span } => {
            let rendered: Vec<String> = args.iter().map(render_arg).collect();
            match callee {
                ir::Callee::Named { name, module } => {
                    let event = if guard {
                        CodeEvent::Guard {
                            name: name.clone(),
                            module: module.clone(),
                            args: rendered,
                            line: span.line,
                        }
                    } else {
                        CodeEvent::Call {
                            name: name.clone(),
                            module: module.clone(),
                            args: rendered,
                            assigned_to: assigned_to.map(str::to_string),
                            line: span.line,
                        }
                    };
                    scan.events.push(event);
                    scan.calls.push(RawCall {
                        callee: name.clone(),
                        module: module.clone(),
                        dynamic: false,
                        line: span.line,
                    });
                }
                ir::Callee::Dynamic => {
                    scan.calls.push(RawCall {
                        callee: "<dynamic>".to_string(),
                        module: None,
                        dynamic: true,
                        line: span.line,
                    });
                }
            }
            for arg in args {
                scan_expr(arg, None, guard, scan);
            }
        }
        Expr::Await { inner, .. } => {
            scan.has_await = true;
            scan_expr(inner, assigned_to, guard, scan);
        }
        Expr::Member { object, .. } => scan_expr(object, None, guard, scan),
        Expr::Binary { lhs, rhs, .. } => {
            scan_expr(lhs, None, guard, scan);
            scan_expr(rhs, None, guard, scan);
        }
        Expr::Unary { operand, .. } => scan_expr(operand, None, guard, scan),
        Expr::Name { .. } | Expr::Literal { .. } | Expr::Unknown { .. } => {}
    }
}
