// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Resolved types attached to variables by the binder.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    Unit,
    Bool,
    Int,
    Str,
    /// Exception value.
    Error,
    Closure,
    /// Named reference type owned by the host.
    Object(String),
    /// Awaitable operation producing `T`.
    Awaitable(Box<Ty>),
    /// Lazy sequence of `T`.
    Sequence(Box<Ty>),
    /// Managed reference to a storage location.
    ByRef(Box<Ty>),
    RawPtr(Box<Ty>),
    /// Value type that may only live on the stack.
    StackOnly(String),
}

impl Ty {
    /// Whether a value of this type may be stored in a heap object field.
    pub fn is_storable(&self) -> bool {
        !matches!(self, Ty::ByRef(_) | Ty::RawPtr(_) | Ty::StackOnly(_))
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Unit => write!(f, "()"),
            Ty::Bool => write!(f, "bool"),
            Ty::Int => write!(f, "int"),
            Ty::Str => write!(f, "string"),
            Ty::Error => write!(f, "error"),
            Ty::Closure => write!(f, "closure"),
            Ty::Object(name) => write!(f, "{}", name),
            Ty::Awaitable(inner) => write!(f, "Awaitable<{}>", inner),
            Ty::Sequence(inner) => write!(f, "Sequence<{}>", inner),
            Ty::ByRef(inner) => write!(f, "ref {}", inner),
            Ty::RawPtr(inner) => write!(f, "*{}", inner),
            Ty::StackOnly(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storability() {
        assert!(Ty::Int.is_storable());
        assert!(Ty::Awaitable(Box::new(Ty::Int)).is_storable());
        assert!(!Ty::ByRef(Box::new(Ty::Int)).is_storable());
        assert!(!Ty::RawPtr(Box::new(Ty::Unit)).is_storable());
        assert!(!Ty::StackOnly("Span".into()).is_storable());
    }

    #[test]
    fn display() {
        assert_eq!(Ty::Sequence(Box::new(Ty::Int)).to_string(), "Sequence<int>");
        assert_eq!(Ty::ByRef(Box::new(Ty::Str)).to_string(), "ref string");
    }
}
