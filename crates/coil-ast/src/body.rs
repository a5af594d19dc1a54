// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bound function bodies.
//!
//! A body is an arena of statements and expressions addressed by stable
//! ids. Names are already resolved: every variable reference points at a
//! [`VarDecl`] and every declaration knows the [`Scope`] that owns it.

use crate::{Span, Ty};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

/// A function body after binding.
#[derive(Debug, Clone)]
pub struct FnBody {
    pub name: String,
    pub span: Span,
    /// Declared with the async modifier.
    pub is_async: bool,
    /// Type of the implicit receiver for member functions.
    pub receiver: Option<Ty>,
    pub params: Vec<VarId>,
    pub ret_ty: Ty,
    pub vars: Vec<VarDecl>,
    pub scopes: Vec<Scope>,
    pub stmts: Vec<Stmt>,
    pub exprs: Vec<Expr>,
    pub root: StmtId,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub id: VarId,
    pub name: String,
    pub ty: Ty,
    pub scope: ScopeId,
    pub is_param: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Function,
    Block,
    /// Header scope of a `for` loop.
    Loop,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub id: StmtId,
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Block {
        scope: ScopeId,
        stmts: Vec<StmtId>,
    },
    Let {
        var: VarId,
        init: Option<ExprId>,
    },
    Assign {
        target: VarId,
        value: ExprId,
    },
    Expr(ExprId),
    If {
        cond: ExprId,
        then_branch: StmtId,
        else_branch: Option<StmtId>,
    },
    /// Integer switch. Arms do not fall through.
    Switch {
        scrutinee: ExprId,
        arms: Vec<SwitchArm>,
        default: Option<StmtId>,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    For {
        scope: ScopeId,
        init: Vec<StmtId>,
        cond: Option<ExprId>,
        step: Vec<StmtId>,
        body: StmtId,
    },
    Break,
    Continue,
    Return(Option<ExprId>),
    Throw(ExprId),
    Try {
        body: StmtId,
        catches: Vec<CatchClause>,
        finally: Option<StmtId>,
    },
    /// Mutual-exclusion block over `target`.
    Lock {
        target: ExprId,
        body: StmtId,
    },
    Unsafe {
        body: StmtId,
    },
    /// Call to another constructor of the same object before the body runs.
    ChainCtor {
        args: Vec<ExprId>,
    },
    /// Hand one value to the consumer of a sequence.
    Produce(ExprId),
}

#[derive(Debug, Clone)]
pub struct SwitchArm {
    pub value: i64,
    pub body: StmtId,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    /// Exception tag to match; `None` catches everything.
    pub tag: Option<String>,
    pub binding: Option<VarId>,
    pub filter: Option<ExprId>,
    pub body: StmtId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Var(VarId),
    Receiver,
    Binary {
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    /// Call to a host function.
    Call {
        func: String,
        args: Vec<ExprId>,
    },
    /// Construct an exception value.
    Error {
        tag: String,
        payload: ExprId,
    },
    /// Closure over the listed variables. `body` may only read those.
    Closure {
        captures: Vec<VarId>,
        body: ExprId,
    },
    Invoke {
        closure: ExprId,
    },
    /// Suspend until the awaited operation completes, yielding its result.
    Wait(ExprId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit and.
    And,
    /// Short-circuit or.
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl FnBody {
    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn var(&self, id: VarId) -> &VarDecl {
        &self.vars[id.0 as usize]
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    /// Scope of the function itself.
    pub fn root_scope(&self) -> ScopeId {
        ScopeId(0)
    }

    /// True if `inner` is `outer` or nested inside it.
    pub fn scope_within(&self, inner: ScopeId, outer: ScopeId) -> bool {
        let mut cur = Some(inner);
        while let Some(id) = cur {
            if id == outer {
                return true;
            }
            cur = self.scope(id).parent;
        }
        false
    }

    /// Direct subexpressions in evaluation order. Closure bodies are included.
    pub fn expr_children(&self, id: ExprId) -> Vec<ExprId> {
        match &self.expr(id).kind {
            ExprKind::Literal(_) | ExprKind::Var(_) | ExprKind::Receiver => Vec::new(),
            ExprKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            ExprKind::Unary { operand, .. } => vec![*operand],
            ExprKind::Call { args, .. } => args.clone(),
            ExprKind::Error { payload, .. } => vec![*payload],
            ExprKind::Closure { body, .. } => vec![*body],
            ExprKind::Invoke { closure } => vec![*closure],
            ExprKind::Wait(operand) => vec![*operand],
        }
    }

    /// True if `pred` holds for `id` or any expression below it, not
    /// descending into closure bodies.
    pub fn any_expr(&self, id: ExprId, pred: &impl Fn(&ExprKind) -> bool) -> bool {
        let kind = &self.expr(id).kind;
        if pred(kind) {
            return true;
        }
        if matches!(kind, ExprKind::Closure { .. }) {
            return false;
        }
        self.expr_children(id).into_iter().any(|c| self.any_expr(c, pred))
    }

    pub fn contains_wait(&self, id: ExprId) -> bool {
        self.any_expr(id, &|k| matches!(k, ExprKind::Wait(_)))
    }

    /// Calls `f` on every expression and subexpression under `id`,
    /// closure bodies included.
    pub fn visit_expr_tree(&self, id: ExprId, f: &mut dyn FnMut(ExprId)) {
        f(id);
        for child in self.expr_children(id) {
            self.visit_expr_tree(child, f);
        }
    }

    /// Calls `f` on the root of every expression reachable from statement
    /// `id`, including catch filters.
    pub fn visit_stmt_exprs(&self, id: StmtId, f: &mut dyn FnMut(ExprId)) {
        match &self.stmt(id).kind {
            StmtKind::Block { stmts, .. } => {
                for s in stmts {
                    self.visit_stmt_exprs(*s, f);
                }
            }
            StmtKind::Let { init, .. } => init.iter().for_each(|e| f(*e)),
            StmtKind::Assign { value, .. } => f(*value),
            StmtKind::Expr(e) | StmtKind::Throw(e) | StmtKind::Produce(e) => f(*e),
            StmtKind::If { cond, then_branch, else_branch } => {
                f(*cond);
                self.visit_stmt_exprs(*then_branch, f);
                if let Some(e) = else_branch {
                    self.visit_stmt_exprs(*e, f);
                }
            }
            StmtKind::Switch { scrutinee, arms, default } => {
                f(*scrutinee);
                for arm in arms {
                    self.visit_stmt_exprs(arm.body, f);
                }
                if let Some(d) = default {
                    self.visit_stmt_exprs(*d, f);
                }
            }
            StmtKind::While { cond, body } => {
                f(*cond);
                self.visit_stmt_exprs(*body, f);
            }
            StmtKind::For { init, cond, step, body, .. } => {
                for s in init {
                    self.visit_stmt_exprs(*s, f);
                }
                cond.iter().for_each(|c| f(*c));
                for s in step {
                    self.visit_stmt_exprs(*s, f);
                }
                self.visit_stmt_exprs(*body, f);
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Return(value) => value.iter().for_each(|v| f(*v)),
            StmtKind::Try { body, catches, finally } => {
                self.visit_stmt_exprs(*body, f);
                for clause in catches {
                    clause.filter.iter().for_each(|e| f(*e));
                    self.visit_stmt_exprs(clause.body, f);
                }
                if let Some(fin) = finally {
                    self.visit_stmt_exprs(*fin, f);
                }
            }
            StmtKind::Lock { target, body } => {
                f(*target);
                self.visit_stmt_exprs(*body, f);
            }
            StmtKind::Unsafe { body } => self.visit_stmt_exprs(*body, f),
            StmtKind::ChainCtor { args } => args.iter().for_each(|a| f(*a)),
        }
    }

    /// Variables captured by any closure created under statement `id`.
    pub fn closure_captures(&self, id: StmtId) -> Vec<VarId> {
        let mut out = Vec::new();
        self.visit_stmt_exprs(id, &mut |root| {
            self.visit_expr_tree(root, &mut |e| {
                if let ExprKind::Closure { captures, .. } = &self.expr(e).kind {
                    for v in captures {
                        if !out.contains(v) {
                            out.push(*v);
                        }
                    }
                }
            });
        });
        out
    }
}
