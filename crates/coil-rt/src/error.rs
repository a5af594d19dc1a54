// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// An exception escaped the outermost frame.
    #[error("uncaught exception: {0}")]
    Thrown(Value),

    #[error("undefined function `{0}`")]
    UndefinedFunction(String),

    #[error("undefined machine type `{0}`")]
    UndefinedMachine(String),

    #[error("expected {expected}, found {found}")]
    TypeError { expected: &'static str, found: String },

    #[error("expected {expected} argument{}, got {got}", if *.expected == 1 { "" } else { "s" })]
    ArityMismatch { expected: usize, got: usize },

    /// The object is already being stepped or disposed on another call path.
    #[error("state object is already running")]
    StepInProgress,

    #[error("sequence was disposed")]
    Disposed,

    #[error("operation already completed")]
    AlreadyCompleted,

    #[error("operation has not completed")]
    NotCompleted,

    #[error("resume expected state {expected}, object is in state {found}")]
    StaleResume { expected: i64, found: i64 },

    #[error("step budget of {0} blocks exhausted")]
    BudgetExhausted(u64),

    /// MIR the interpreter cannot execute, such as a leftover suspension.
    #[error("malformed function `{function}`: {reason}")]
    Malformed { function: String, reason: String },
}

impl RuntimeError {
    pub(crate) fn malformed(function: &str, reason: impl Into<String>) -> Self {
        RuntimeError::Malformed {
            function: function.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn type_error(expected: &'static str, found: &Value) -> Self {
        RuntimeError::TypeError {
            expected,
            found: found.type_name().to_string(),
        }
    }

    /// The exception, if this is an escaped throw.
    pub fn thrown(&self) -> Option<&Value> {
        match self {
            RuntimeError::Thrown(v) => Some(v),
            _ => None,
        }
    }
}
