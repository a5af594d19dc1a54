// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! ToDiagnostic impls for lowering errors and warnings.

use coil_mir::lower::{ForbiddenRegion, LowerError, LowerErrorKind, LowerWarning, PointKind};

use crate::{Diagnostic, ToDiagnostic};

fn placement_code(region: ForbiddenRegion) -> &'static str {
    match region {
        ForbiddenRegion::Lock => "C0101",
        ForbiddenRegion::Unsafe => "C0102",
        ForbiddenRegion::Filter => "C0103",
        ForbiddenRegion::CtorChain => "C0104",
        ForbiddenRegion::Finally => "C0105",
        ForbiddenRegion::Closure => "C0106",
    }
}

impl ToDiagnostic for LowerError {
    fn to_diagnostic(&self) -> Diagnostic {
        let span = self.span;
        match &self.kind {
            LowerErrorKind::ForbiddenSuspension { point, region } => {
                let label = match point {
                    PointKind::Produce => "value produced here",
                    PointKind::Wait => "wait here",
                };
                let diag = Diagnostic::error(self.kind.to_string())
                    .with_code(placement_code(*region))
                    .with_primary(span, label);
                match region {
                    ForbiddenRegion::Lock => diag
                        .with_note("a lock must be released by the thread that took it")
                        .with_help("release the lock before suspending"),
                    ForbiddenRegion::Finally => {
                        diag.with_help("move the suspension before the try statement")
                    }
                    ForbiddenRegion::Filter => {
                        diag.with_note("filters run while the exception is being dispatched")
                    }
                    ForbiddenRegion::Closure => diag
                        .with_note("a closure body is a separate function and cannot suspend its caller"),
                    _ => diag,
                }
            }

            LowerErrorKind::UnstorableCapture { name, ty } => {
                Diagnostic::error(self.kind.to_string())
                    .with_code("C0201")
                    .with_primary(span, format!("`{}` declared here", name))
                    .with_note(format!("values of type `{}` cannot outlive a stack frame", ty))
                    .with_help(format!("stop using `{}` after the suspension point", name))
            }

            LowerErrorKind::UncapturedVariable { name, .. } => Diagnostic::error(self.kind.to_string())
                .with_code("C0202")
                .with_primary(span, format!("`{}` read here", name)),

            LowerErrorKind::ReturnValueInGenerator => Diagnostic::error(self.kind.to_string())
                .with_code("C0301")
                .with_primary(span, "returns a value")
                .with_help("use a bare `return` to end the sequence"),

            LowerErrorKind::JumpOutsideLoop { keyword } => Diagnostic::error(self.kind.to_string())
                .with_code("C0302")
                .with_primary(span, format!("`{}` has no enclosing loop", keyword)),

            LowerErrorKind::JumpOutOfFinally => Diagnostic::error(self.kind.to_string())
                .with_code("C0303")
                .with_primary(span, "jumps out of the finally body"),

            LowerErrorKind::TooManyStates { limit, .. } => Diagnostic::error(self.kind.to_string())
                .with_code("C0401")
                .with_primary(span, "in this function")
                .with_help(format!(
                    "split the function or raise the state limit above {}",
                    limit
                )),
        }
    }
}

impl ToDiagnostic for LowerWarning {
    fn to_diagnostic(&self) -> Diagnostic {
        match self {
            LowerWarning::AsyncWithoutWait { span, .. } => Diagnostic::warning(self.to_string())
                .with_code("C0901")
                .with_primary(*span, "declared async here")
                .with_help("add a wait point or remove `async`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::ErrorCodeRegistry;
    use crate::Severity;
    use coil_ast::{Span, Ty};

    #[test]
    fn every_code_is_registered() {
        let registry = ErrorCodeRegistry::default();
        let errors = vec![
            LowerError::forbidden(PointKind::Wait, ForbiddenRegion::Lock, Span::new(0, 4)),
            LowerError::forbidden(PointKind::Produce, ForbiddenRegion::Closure, Span::new(0, 4)),
            LowerError::unstorable("r".into(), Ty::ByRef(Box::new(Ty::Int)), Span::new(1, 2)),
            LowerError::return_value_in_generator(Span::new(3, 9)),
            LowerError::jump_outside_loop("break", Span::new(0, 5)),
            LowerError::jump_out_of_finally(Span::new(0, 6)),
            LowerError::too_many_states("f".into(), 9, 4, Span::new(0, 1)),
        ];
        for err in &errors {
            let diag = err.to_diagnostic();
            let code = diag.code.as_ref().map(|c| c.0.clone()).unwrap_or_default();
            assert!(registry.get(&code).is_some(), "{} is not registered", code);
            assert_eq!(diag.severity, Severity::Error);
            assert_eq!(diag.primary_span(), Some(err.span));
        }
    }

    #[test]
    fn unstorable_capture_explains_the_type() {
        let err = LowerError::unstorable("r".into(), Ty::ByRef(Box::new(Ty::Int)), Span::new(1, 2));
        let diag = err.to_diagnostic();
        assert_eq!(diag.code.map(|c| c.0), Some("C0201".to_string()));
        assert!(diag.notes[0].contains("ref int"));
    }

    #[test]
    fn async_warning() {
        let w = LowerWarning::AsyncWithoutWait {
            name: "ready".into(),
            span: Span::new(0, 5),
        };
        let diag = w.to_diagnostic();
        assert_eq!(diag.severity, Severity::Warning);
        assert!(!diag.is_error());
        assert!(diag.message.contains("ready"));
    }
}
