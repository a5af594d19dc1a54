// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lowering error types.

use coil_ast::{Span, Ty, VarId};
use std::fmt;
use thiserror::Error;

/// A problem that keeps a function from being lowered.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct LowerError {
    pub kind: LowerErrorKind,
    pub span: Span,
}

impl LowerError {
    pub fn forbidden(point: PointKind, region: ForbiddenRegion, span: Span) -> Self {
        Self {
            kind: LowerErrorKind::ForbiddenSuspension { point, region },
            span,
        }
    }

    pub fn unstorable(name: String, ty: Ty, span: Span) -> Self {
        Self {
            kind: LowerErrorKind::UnstorableCapture { name, ty },
            span,
        }
    }

    pub fn return_value_in_generator(span: Span) -> Self {
        Self {
            kind: LowerErrorKind::ReturnValueInGenerator,
            span,
        }
    }

    pub fn jump_outside_loop(keyword: &'static str, span: Span) -> Self {
        Self {
            kind: LowerErrorKind::JumpOutsideLoop { keyword },
            span,
        }
    }

    pub fn jump_out_of_finally(span: Span) -> Self {
        Self {
            kind: LowerErrorKind::JumpOutOfFinally,
            span,
        }
    }

    pub fn uncaptured(var: VarId, name: String, span: Span) -> Self {
        Self {
            kind: LowerErrorKind::UncapturedVariable { var, name },
            span,
        }
    }

    pub fn too_many_states(name: String, count: usize, limit: usize, span: Span) -> Self {
        Self {
            kind: LowerErrorKind::TooManyStates { name, count, limit },
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LowerErrorKind {
    #[error("cannot {point} inside {region}")]
    ForbiddenSuspension {
        point: PointKind,
        region: ForbiddenRegion,
    },

    #[error("`{name}` of type `{ty}` is live across a suspension point but cannot be stored in a state object")]
    UnstorableCapture { name: String, ty: Ty },

    #[error("cannot return a value from a generator")]
    ReturnValueInGenerator,

    #[error("`{keyword}` outside of a loop")]
    JumpOutsideLoop { keyword: &'static str },

    #[error("control cannot leave a finally body")]
    JumpOutOfFinally,

    #[error("closure reads `{name}` without capturing it")]
    UncapturedVariable { var: VarId, name: String },

    #[error("`{name}` needs {count} states, the limit is {limit}")]
    TooManyStates {
        name: String,
        count: usize,
        limit: usize,
    },
}

/// Non-fatal finding reported alongside a successful lowering.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LowerWarning {
    #[error("async function `{name}` has no wait points and will run synchronously")]
    AsyncWithoutWait { name: String, span: Span },
}

impl LowerWarning {
    pub fn span(&self) -> Span {
        match self {
            LowerWarning::AsyncWithoutWait { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    Produce,
    Wait,
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointKind::Produce => write!(f, "produce a value"),
            PointKind::Wait => write!(f, "wait"),
        }
    }
}

/// Region where execution may not be suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForbiddenRegion {
    Lock,
    Unsafe,
    Filter,
    CtorChain,
    Finally,
    Closure,
}

impl fmt::Display for ForbiddenRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            ForbiddenRegion::Lock => "a lock body",
            ForbiddenRegion::Unsafe => "an unsafe block",
            ForbiddenRegion::Filter => "an exception filter",
            ForbiddenRegion::CtorChain => "constructor chaining arguments",
            ForbiddenRegion::Finally => "a finally body",
            ForbiddenRegion::Closure => "a closure body",
        };
        write!(f, "{}", what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = LowerError::forbidden(PointKind::Wait, ForbiddenRegion::Lock, Span::new(3, 8));
        assert_eq!(err.to_string(), "cannot wait inside a lock body");

        let err = LowerError::unstorable("r".into(), Ty::ByRef(Box::new(Ty::Int)), Span::DUMMY);
        assert!(err.to_string().contains("`r` of type `ref int`"));
    }
}
