// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! BodyBuilder - programmatic construction of bound bodies.
//!
//! Front ends and tests use this instead of filling the arenas by hand.
//! Scopes are opened by [`BodyBuilder::block`] and [`BodyBuilder::for_loop`];
//! variables are declared in whichever scope is open at the time.

use crate::body::*;
use crate::{Span, Ty};

pub struct BodyBuilder {
    name: String,
    is_async: bool,
    receiver: Option<Ty>,
    params: Vec<VarId>,
    ret_ty: Ty,
    vars: Vec<VarDecl>,
    scopes: Vec<Scope>,
    stmts: Vec<Stmt>,
    exprs: Vec<Expr>,
    scope_stack: Vec<ScopeId>,
    pending_span: Option<Span>,
    offset: usize,
}

/// Parts of a `for` loop, built inside the loop's header scope.
pub struct ForParts {
    pub init: Vec<StmtId>,
    pub cond: Option<ExprId>,
    pub step: Vec<StmtId>,
    pub body: StmtId,
}

impl BodyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let root = Scope {
            id: ScopeId(0),
            parent: None,
            kind: ScopeKind::Function,
        };
        Self {
            name: name.into(),
            is_async: false,
            receiver: None,
            params: Vec::new(),
            ret_ty: Ty::Unit,
            vars: Vec::new(),
            scopes: vec![root],
            stmts: Vec::new(),
            exprs: Vec::new(),
            scope_stack: vec![ScopeId(0)],
            pending_span: None,
            offset: 0,
        }
    }

    pub fn set_async(&mut self) -> &mut Self {
        self.is_async = true;
        self
    }

    pub fn set_receiver(&mut self, ty: Ty) -> &mut Self {
        self.receiver = Some(ty);
        self
    }

    pub fn set_return(&mut self, ty: Ty) -> &mut Self {
        self.ret_ty = ty;
        self
    }

    /// Use `span` for the next node created.
    pub fn at(&mut self, span: Span) -> &mut Self {
        self.pending_span = Some(span);
        self
    }

    fn next_span(&mut self) -> Span {
        if let Some(span) = self.pending_span.take() {
            return span;
        }
        let span = Span::new(self.offset, self.offset + 1);
        self.offset += 1;
        span
    }

    fn current_scope(&self) -> ScopeId {
        self.scope_stack.last().copied().unwrap_or(ScopeId(0))
    }

    fn open_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            id,
            parent: Some(self.current_scope()),
            kind,
        });
        self.scope_stack.push(id);
        id
    }

    fn close_scope(&mut self) {
        self.scope_stack.pop();
    }

    fn declare(&mut self, name: &str, ty: Ty, is_param: bool) -> VarId {
        let id = VarId(self.vars.len() as u32);
        let span = self.next_span();
        self.vars.push(VarDecl {
            id,
            name: name.to_string(),
            ty,
            scope: self.current_scope(),
            is_param,
            span,
        });
        id
    }

    pub fn param(&mut self, name: &str, ty: Ty) -> VarId {
        let id = self.declare(name, ty, true);
        self.params.push(id);
        id
    }

    /// Declare a local in the innermost open scope.
    pub fn var(&mut self, name: &str, ty: Ty) -> VarId {
        self.declare(name, ty, false)
    }

    // -- Expressions --------------------------------------------------------

    fn push_expr(&mut self, kind: ExprKind) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        let span = self.next_span();
        self.exprs.push(Expr { id, kind, span });
        id
    }

    pub fn unit(&mut self) -> ExprId {
        self.push_expr(ExprKind::Literal(Literal::Unit))
    }

    pub fn int(&mut self, value: i64) -> ExprId {
        self.push_expr(ExprKind::Literal(Literal::Int(value)))
    }

    pub fn bool(&mut self, value: bool) -> ExprId {
        self.push_expr(ExprKind::Literal(Literal::Bool(value)))
    }

    pub fn str(&mut self, value: &str) -> ExprId {
        self.push_expr(ExprKind::Literal(Literal::Str(value.to_string())))
    }

    pub fn read(&mut self, var: VarId) -> ExprId {
        self.push_expr(ExprKind::Var(var))
    }

    pub fn receiver(&mut self) -> ExprId {
        self.push_expr(ExprKind::Receiver)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.push_expr(ExprKind::Binary { op, lhs, rhs })
    }

    pub fn unary(&mut self, op: UnaryOp, operand: ExprId) -> ExprId {
        self.push_expr(ExprKind::Unary { op, operand })
    }

    pub fn call(&mut self, func: &str, args: Vec<ExprId>) -> ExprId {
        self.push_expr(ExprKind::Call {
            func: func.to_string(),
            args,
        })
    }

    pub fn error(&mut self, tag: &str, payload: ExprId) -> ExprId {
        self.push_expr(ExprKind::Error {
            tag: tag.to_string(),
            payload,
        })
    }

    pub fn closure(&mut self, captures: Vec<VarId>, body: ExprId) -> ExprId {
        self.push_expr(ExprKind::Closure { captures, body })
    }

    pub fn invoke(&mut self, closure: ExprId) -> ExprId {
        self.push_expr(ExprKind::Invoke { closure })
    }

    pub fn wait(&mut self, operand: ExprId) -> ExprId {
        self.push_expr(ExprKind::Wait(operand))
    }

    // -- Statements ---------------------------------------------------------

    fn push_stmt(&mut self, kind: StmtKind) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        let span = self.next_span();
        self.stmts.push(Stmt { id, kind, span });
        id
    }

    pub fn let_(&mut self, var: VarId, init: Option<ExprId>) -> StmtId {
        self.push_stmt(StmtKind::Let { var, init })
    }

    /// Declare `name` in the current scope and bind it to `init`.
    pub fn let_var(&mut self, name: &str, ty: Ty, init: ExprId) -> (VarId, StmtId) {
        let var = self.var(name, ty);
        let stmt = self.let_(var, Some(init));
        (var, stmt)
    }

    pub fn assign(&mut self, target: VarId, value: ExprId) -> StmtId {
        self.push_stmt(StmtKind::Assign { target, value })
    }

    pub fn expr(&mut self, expr: ExprId) -> StmtId {
        self.push_stmt(StmtKind::Expr(expr))
    }

    pub fn produce(&mut self, value: ExprId) -> StmtId {
        self.push_stmt(StmtKind::Produce(value))
    }

    pub fn ret(&mut self, value: Option<ExprId>) -> StmtId {
        self.push_stmt(StmtKind::Return(value))
    }

    pub fn throw(&mut self, value: ExprId) -> StmtId {
        self.push_stmt(StmtKind::Throw(value))
    }

    pub fn brk(&mut self) -> StmtId {
        self.push_stmt(StmtKind::Break)
    }

    pub fn cont(&mut self) -> StmtId {
        self.push_stmt(StmtKind::Continue)
    }

    /// Open a block scope, build its statements with `f`, close it.
    pub fn block(&mut self, f: impl FnOnce(&mut Self) -> Vec<StmtId>) -> StmtId {
        let scope = self.open_scope(ScopeKind::Block);
        let stmts = f(self);
        self.close_scope();
        self.push_stmt(StmtKind::Block { scope, stmts })
    }

    pub fn if_(&mut self, cond: ExprId, then_branch: StmtId, else_branch: Option<StmtId>) -> StmtId {
        self.push_stmt(StmtKind::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    pub fn while_(&mut self, cond: ExprId, body: StmtId) -> StmtId {
        self.push_stmt(StmtKind::While { cond, body })
    }

    /// Build a `for` loop; variables declared inside `f` belong to the
    /// loop header scope.
    pub fn for_loop(&mut self, f: impl FnOnce(&mut Self) -> ForParts) -> StmtId {
        let scope = self.open_scope(ScopeKind::Loop);
        let parts = f(self);
        self.close_scope();
        self.push_stmt(StmtKind::For {
            scope,
            init: parts.init,
            cond: parts.cond,
            step: parts.step,
            body: parts.body,
        })
    }

    pub fn switch(&mut self, scrutinee: ExprId, arms: Vec<(i64, StmtId)>, default: Option<StmtId>) -> StmtId {
        let arms = arms
            .into_iter()
            .map(|(value, body)| SwitchArm { value, body })
            .collect();
        self.push_stmt(StmtKind::Switch {
            scrutinee,
            arms,
            default,
        })
    }

    pub fn catch(
        &mut self,
        tag: Option<&str>,
        binding: Option<VarId>,
        filter: Option<ExprId>,
        body: StmtId,
    ) -> CatchClause {
        CatchClause {
            tag: tag.map(str::to_string),
            binding,
            filter,
            body,
            span: self.next_span(),
        }
    }

    pub fn try_(&mut self, body: StmtId, catches: Vec<CatchClause>, finally: Option<StmtId>) -> StmtId {
        self.push_stmt(StmtKind::Try {
            body,
            catches,
            finally,
        })
    }

    pub fn lock(&mut self, target: ExprId, body: StmtId) -> StmtId {
        self.push_stmt(StmtKind::Lock { target, body })
    }

    pub fn unsafe_block(&mut self, body: StmtId) -> StmtId {
        self.push_stmt(StmtKind::Unsafe { body })
    }

    pub fn chain_ctor(&mut self, args: Vec<ExprId>) -> StmtId {
        self.push_stmt(StmtKind::ChainCtor { args })
    }

    /// Wrap `stmts` in the function scope and produce the body.
    pub fn finish(mut self, stmts: Vec<StmtId>) -> FnBody {
        let root_span = Span::new(0, self.offset.max(1));
        let root = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt {
            id: root,
            kind: StmtKind::Block {
                scope: ScopeId(0),
                stmts,
            },
            span: root_span,
        });
        FnBody {
            name: self.name,
            span: root_span,
            is_async: self.is_async,
            receiver: self.receiver,
            params: self.params,
            ret_ty: self.ret_ty,
            vars: self.vars,
            scopes: self.scopes,
            stmts: self.stmts,
            exprs: self.exprs,
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_scopes_nest() {
        let mut b = BodyBuilder::new("f");
        let outer = b.var("outer", Ty::Int);
        let mut inner = None;
        let blk = b.block(|b| {
            let one = b.int(1);
            let (v, s) = b.let_var("inner", Ty::Int, one);
            inner = Some(v);
            vec![s]
        });
        let body = b.finish(vec![blk]);
        let inner = inner.unwrap();

        let outer_scope = body.var(outer).scope;
        let inner_scope = body.var(inner).scope;
        assert_eq!(outer_scope, body.root_scope());
        assert!(body.scope_within(inner_scope, outer_scope));
        assert!(!body.scope_within(outer_scope, inner_scope));
    }

    #[test]
    fn for_loop_header_scope() {
        let mut b = BodyBuilder::new("f");
        let mut header = None;
        let lp = b.for_loop(|b| {
            let zero = b.int(0);
            let (i, init) = b.let_var("i", Ty::Int, zero);
            header = Some(i);
            let body = b.block(|_| Vec::new());
            ForParts {
                init: vec![init],
                cond: None,
                step: Vec::new(),
                body,
            }
        });
        let body = b.finish(vec![lp]);
        let scope = body.var(header.unwrap()).scope;
        assert_eq!(body.scope(scope).kind, ScopeKind::Loop);
        match &body.stmt(lp).kind {
            StmtKind::For { scope: s, .. } => assert_eq!(*s, scope),
            other => panic!("expected for loop, got {:?}", other),
        }
    }

    #[test]
    fn contains_wait_skips_closures() {
        let mut b = BodyBuilder::new("f");
        let op = b.call("delay", vec![]);
        let w = b.wait(op);
        let c = b.closure(vec![], w);
        let one = b.int(1);
        let sum = b.binary(BinaryOp::Add, one, w);
        let body = b.finish(vec![]);
        assert!(body.contains_wait(w));
        assert!(body.contains_wait(sum));
        assert!(!body.contains_wait(c));
    }

    #[test]
    fn pinned_span_applies_once() {
        let mut b = BodyBuilder::new("f");
        let a = b.at(Span::new(40, 44)).int(1);
        let c = b.int(2);
        let body = b.finish(vec![]);
        assert_eq!(body.expr(a).span, Span::new(40, 44));
        assert_ne!(body.expr(c).span, Span::new(40, 44));
    }
}
