// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bound function bodies handed to the lowering pass.
//!
//! Bodies arrive here after name resolution and type checking. The
//! lowering crates read them and never mutate them.

pub mod body;
pub mod builder;
pub mod span;
pub mod ty;

pub use body::{
    BinaryOp, CatchClause, Expr, ExprId, ExprKind, FnBody, Literal, Scope, ScopeId, ScopeKind,
    Stmt, StmtId, StmtKind, SwitchArm, UnaryOp, VarDecl, VarId,
};
pub use builder::{BodyBuilder, ForParts};
pub use span::{LineMap, Position, Span};
pub use ty::Ty;
