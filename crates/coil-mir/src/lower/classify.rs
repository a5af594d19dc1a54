// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension classifier.
//!
//! Finds every Produce and Wait marker in a body and decides which kind of
//! state machine, if any, the function needs. Markers inside regions where
//! execution can't be suspended are reported instead of recorded.

use std::collections::HashMap;

use coil_ast::{ExprId, ExprKind, FnBody, Span, StmtId, StmtKind};
use tracing::debug;

use super::descriptor::{FnKind, NodeRef, SuspensionId, SuspensionPoint};
use super::error::{ForbiddenRegion, LowerError, LowerWarning, PointKind};

/// Result of classifying one body.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: FnKind,
    /// Suspension points in lexical order.
    pub points: Vec<SuspensionPoint>,
    pub warnings: Vec<LowerWarning>,
    by_node: HashMap<NodeRef, SuspensionId>,
}

impl Classification {
    pub fn point_at(&self, node: NodeRef) -> Option<&SuspensionPoint> {
        self.by_node.get(&node).map(|id| &self.points[id.0 as usize])
    }
}

pub fn classify(body: &FnBody) -> Result<Classification, Vec<LowerError>> {
    let mut c = Classifier {
        body,
        points: Vec::new(),
        errors: Vec::new(),
        forbidden: Vec::new(),
        protected: Vec::new(),
        value_returns: Vec::new(),
    };
    c.walk_stmt(body.root);

    let has_produce = c.points.iter().any(|p| p.kind == PointKind::Produce);
    let has_wait = c.points.iter().any(|p| p.kind == PointKind::Wait);
    let mut warnings = Vec::new();
    let kind = match (has_produce, has_wait || body.is_async) {
        (false, false) => FnKind::Plain,
        (true, false) => FnKind::Generator,
        (false, true) => FnKind::AsyncFunction,
        (true, true) => FnKind::AsyncGenerator,
    };
    if body.is_async && !has_wait && kind == FnKind::AsyncFunction {
        warnings.push(LowerWarning::AsyncWithoutWait {
            name: body.name.clone(),
            span: body.span,
        });
    }

    let mut errors = c.errors;
    if kind.produces() {
        errors.extend(c.value_returns.iter().map(|s| LowerError::return_value_in_generator(*s)));
    }
    if !errors.is_empty() {
        debug!(function = %body.name, errors = errors.len(), "classification failed");
        return Err(errors);
    }

    let by_node = c.points.iter().map(|p| (p.node, p.id)).collect();
    debug!(function = %body.name, %kind, points = c.points.len(), "classified");
    Ok(Classification {
        kind,
        points: c.points,
        warnings,
        by_node,
    })
}

struct Classifier<'a> {
    body: &'a FnBody,
    points: Vec<SuspensionPoint>,
    errors: Vec<LowerError>,
    forbidden: Vec<ForbiddenRegion>,
    protected: Vec<StmtId>,
    value_returns: Vec<Span>,
}

impl Classifier<'_> {
    fn record(&mut self, kind: PointKind, node: NodeRef, span: Span) {
        if let Some(region) = self.forbidden.last() {
            self.errors.push(LowerError::forbidden(kind, *region, span));
            return;
        }
        let id = SuspensionId(self.points.len() as u32);
        self.points.push(SuspensionPoint {
            id,
            kind,
            node,
            span,
            protected: self.protected.clone(),
        });
    }

    fn forbid(&mut self, region: ForbiddenRegion, f: impl FnOnce(&mut Self)) {
        self.forbidden.push(region);
        f(self);
        self.forbidden.pop();
    }

    fn walk_stmt(&mut self, id: StmtId) {
        let body = self.body;
        let stmt = body.stmt(id);
        match &stmt.kind {
            StmtKind::Block { stmts, .. } => {
                for s in stmts {
                    self.walk_stmt(*s);
                }
            }
            StmtKind::Let { init, .. } => {
                if let Some(e) = init {
                    self.walk_expr(*e);
                }
            }
            StmtKind::Assign { value, .. } => self.walk_expr(*value),
            StmtKind::Expr(e) | StmtKind::Throw(e) => self.walk_expr(*e),
            StmtKind::If { cond, then_branch, else_branch } => {
                self.walk_expr(*cond);
                self.walk_stmt(*then_branch);
                if let Some(e) = else_branch {
                    self.walk_stmt(*e);
                }
            }
            StmtKind::Switch { scrutinee, arms, default } => {
                self.walk_expr(*scrutinee);
                for arm in arms {
                    self.walk_stmt(arm.body);
                }
                if let Some(d) = default {
                    self.walk_stmt(*d);
                }
            }
            StmtKind::While { cond, body } => {
                self.walk_expr(*cond);
                self.walk_stmt(*body);
            }
            StmtKind::For { init, cond, step, body, .. } => {
                for s in init {
                    self.walk_stmt(*s);
                }
                if let Some(c) = cond {
                    self.walk_expr(*c);
                }
                for s in step {
                    self.walk_stmt(*s);
                }
                self.walk_stmt(*body);
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Return(value) => {
                if let Some(v) = value {
                    self.value_returns.push(stmt.span);
                    self.walk_expr(*v);
                }
            }
            StmtKind::Try { body, catches, finally } => {
                self.protected.push(id);
                self.walk_stmt(*body);
                for clause in catches {
                    if let Some(filter) = clause.filter {
                        self.forbid(ForbiddenRegion::Filter, |c| c.walk_expr(filter));
                    }
                    self.walk_stmt(clause.body);
                }
                if let Some(f) = finally {
                    let f = *f;
                    self.forbid(ForbiddenRegion::Finally, |c| c.walk_stmt(f));
                }
                self.protected.pop();
            }
            StmtKind::Lock { target, body } => {
                self.walk_expr(*target);
                let body = *body;
                self.protected.push(id);
                self.forbid(ForbiddenRegion::Lock, |c| c.walk_stmt(body));
                self.protected.pop();
            }
            StmtKind::Unsafe { body } => {
                let body = *body;
                self.forbid(ForbiddenRegion::Unsafe, |c| c.walk_stmt(body));
            }
            StmtKind::ChainCtor { args } => {
                self.forbid(ForbiddenRegion::CtorChain, |c| {
                    for a in args {
                        c.walk_expr(*a);
                    }
                });
            }
            StmtKind::Produce(value) => {
                self.walk_expr(*value);
                self.record(PointKind::Produce, NodeRef::Stmt(id), stmt.span);
            }
        }
    }

    fn walk_expr(&mut self, id: ExprId) {
        let body = self.body;
        let expr = body.expr(id);
        match &expr.kind {
            ExprKind::Wait(operand) => {
                self.walk_expr(*operand);
                self.record(PointKind::Wait, NodeRef::Expr(id), expr.span);
            }
            ExprKind::Closure { body, .. } => {
                let body = *body;
                self.forbid(ForbiddenRegion::Closure, |c| c.walk_expr(body));
            }
            _ => {
                for child in body.expr_children(id) {
                    self.walk_expr(child);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::error::LowerErrorKind;
    use coil_ast::{BodyBuilder, Ty};

    fn delay(b: &mut BodyBuilder) -> ExprId {
        let op = b.call("delay", vec![]);
        b.wait(op)
    }

    #[test]
    fn plain_body() {
        let mut b = BodyBuilder::new("f");
        let one = b.int(1);
        let s = b.ret(Some(one));
        let c = classify(&b.finish(vec![s])).unwrap();
        assert_eq!(c.kind, FnKind::Plain);
        assert!(c.points.is_empty());
    }

    #[test]
    fn produce_points_in_lexical_order() {
        let mut b = BodyBuilder::new("numbers");
        let stmts: Vec<_> = (1..=3)
            .map(|n| {
                let v = b.int(n);
                b.produce(v)
            })
            .collect();
        let c = classify(&b.finish(stmts.clone())).unwrap();
        assert_eq!(c.kind, FnKind::Generator);
        let nodes: Vec<_> = c.points.iter().map(|p| p.node).collect();
        let expected: Vec<_> = stmts.into_iter().map(NodeRef::Stmt).collect();
        assert_eq!(nodes, expected);
    }

    #[test]
    fn wait_and_produce_mix() {
        let mut b = BodyBuilder::new("f");
        let w = delay(&mut b);
        let s1 = b.expr(w);
        let c = classify(&b.finish(vec![s1])).unwrap();
        assert_eq!(c.kind, FnKind::AsyncFunction);

        let mut b = BodyBuilder::new("g");
        let w = delay(&mut b);
        let s1 = b.produce(w);
        let c = classify(&b.finish(vec![s1])).unwrap();
        assert_eq!(c.kind, FnKind::AsyncGenerator);
        // Operand wait comes before the produce that consumes it.
        assert_eq!(c.points[0].kind, PointKind::Wait);
        assert_eq!(c.points[1].kind, PointKind::Produce);
    }

    #[test]
    fn forbidden_regions_report_every_point() {
        let mut b = BodyBuilder::new("f");
        let target = b.receiver();
        let w = delay(&mut b);
        let inner = b.expr(w);
        let locked = b.block(|_| vec![inner]);
        let lock = b.lock(target, locked);
        let v = b.int(1);
        let p = b.produce(v);
        let raw = b.block(|_| vec![p]);
        let uns = b.unsafe_block(raw);
        let errors = classify(&b.finish(vec![lock, uns])).unwrap_err();
        let kinds: Vec<_> = errors.iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                LowerErrorKind::ForbiddenSuspension {
                    point: PointKind::Wait,
                    region: ForbiddenRegion::Lock,
                },
                LowerErrorKind::ForbiddenSuspension {
                    point: PointKind::Produce,
                    region: ForbiddenRegion::Unsafe,
                },
            ]
        );
    }

    #[test]
    fn wait_in_filter_and_finally_rejected() {
        let mut b = BodyBuilder::new("f");
        let body = b.block(|_| Vec::new());
        let w = delay(&mut b);
        let handler = b.block(|_| Vec::new());
        let clause = b.catch(None, None, Some(w), handler);
        let w2 = delay(&mut b);
        let fin_stmt = b.expr(w2);
        let fin = b.block(|_| vec![fin_stmt]);
        let t = b.try_(body, vec![clause], Some(fin));
        let errors = classify(&b.finish(vec![t])).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            errors[0].kind,
            LowerErrorKind::ForbiddenSuspension { region: ForbiddenRegion::Filter, .. }
        ));
        assert!(matches!(
            errors[1].kind,
            LowerErrorKind::ForbiddenSuspension { region: ForbiddenRegion::Finally, .. }
        ));
    }

    #[test]
    fn wait_in_ctor_chain_and_closure_rejected() {
        let mut b = BodyBuilder::new("f");
        let w = delay(&mut b);
        let chain = b.chain_ctor(vec![w]);
        let w2 = delay(&mut b);
        let c = b.closure(vec![], w2);
        let s = b.expr(c);
        let errors = classify(&b.finish(vec![chain, s])).unwrap_err();
        assert!(matches!(
            errors[0].kind,
            LowerErrorKind::ForbiddenSuspension { region: ForbiddenRegion::CtorChain, .. }
        ));
        assert!(matches!(
            errors[1].kind,
            LowerErrorKind::ForbiddenSuspension { region: ForbiddenRegion::Closure, .. }
        ));
    }

    #[test]
    fn declared_async_without_wait_warns() {
        let mut b = BodyBuilder::new("quick");
        b.set_async();
        let one = b.int(1);
        let s = b.ret(Some(one));
        let c = classify(&b.finish(vec![s])).unwrap();
        assert_eq!(c.kind, FnKind::AsyncFunction);
        assert!(matches!(c.warnings[0], LowerWarning::AsyncWithoutWait { .. }));
    }

    #[test]
    fn generator_cannot_return_value() {
        let mut b = BodyBuilder::new("f");
        let one = b.int(1);
        let p = b.produce(one);
        let two = b.int(2);
        let r = b.ret(Some(two));
        let errors = classify(&b.finish(vec![p, r])).unwrap_err();
        assert_eq!(errors[0].kind, LowerErrorKind::ReturnValueInGenerator);
    }

    #[test]
    fn records_protected_stack() {
        let mut b = BodyBuilder::new("f");
        let x = b.var("x", Ty::Int);
        let v = b.read(x);
        let p = b.produce(v);
        let inner_body = b.block(|_| vec![p]);
        let inner = b.try_(inner_body, vec![], None);
        let outer_body = b.block(|_| vec![inner]);
        let fin = b.block(|_| Vec::new());
        let outer = b.try_(outer_body, vec![], Some(fin));
        let c = classify(&b.finish(vec![outer])).unwrap();
        assert_eq!(c.points[0].protected, vec![outer, inner]);
        assert_eq!(c.point_at(NodeRef::Stmt(p)).map(|p| p.id), Some(SuspensionId(0)));
    }
}
