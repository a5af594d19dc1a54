// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime values.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::machine::StateObject;
use crate::operation::Operation;

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Thrown or throwable exception.
    Error(Arc<ErrorValue>),
    /// Variable shared with closures.
    Cell(Cell),
    Closure(Arc<Closure>),
    /// State object of a lowered function.
    Machine(Arc<StateObject>),
    Operation(Operation),
    /// Result of pulling an async sequence; `None` once it is exhausted.
    Option(Option<Box<Value>>),
}

#[derive(Debug, PartialEq)]
pub struct ErrorValue {
    pub tag: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct Cell(Arc<Mutex<Value>>);

/// Closure value: a function name plus the cells it captured.
#[derive(Debug)]
pub struct Closure {
    pub func: String,
    pub env: Vec<Value>,
    /// Receiver of the frame that created the closure.
    pub receiver: Option<Value>,
    pub object: Option<Arc<StateObject>>,
}

impl Cell {
    pub fn new(value: Value) -> Self {
        Cell(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn error(tag: impl Into<String>, payload: Value) -> Self {
        Value::Error(Arc::new(ErrorValue {
            tag: tag.into(),
            payload,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Error(_) => "error",
            Value::Cell(_) => "cell",
            Value::Closure(_) => "closure",
            Value::Machine(_) => "state object",
            Value::Operation(_) => "operation",
            Value::Option(_) => "option",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Tag of an exception value.
    pub fn error_tag(&self) -> Option<&str> {
        match self {
            Value::Error(e) => Some(&e.tag),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Option(a), Value::Option(b)) => a == b,
            // Reference types compare by identity.
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Machine(a), Value::Machine(b)) => Arc::ptr_eq(a, b),
            (Value::Operation(a), Value::Operation(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::Error(e) => write!(f, "{}({})", e.tag, e.payload),
            Value::Cell(c) => write!(f, "cell({})", c.get()),
            Value::Closure(c) => write!(f, "<closure {}>", c.func),
            Value::Machine(m) => write!(f, "<{}>", m.machine().name),
            Value::Operation(_) => write!(f, "<operation>"),
            Value::Option(Some(v)) => write!(f, "some({})", v),
            Value::Option(None) => write!(f, "none"),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_compare_by_identity() {
        let a = Cell::new(Value::Int(1));
        let b = Cell::new(Value::Int(1));
        assert_eq!(Value::Cell(a.clone()), Value::Cell(a.clone()));
        assert_ne!(Value::Cell(a.clone()), Value::Cell(b));
        a.set(Value::Int(2));
        assert_eq!(a.get(), Value::Int(2));
    }

    #[test]
    fn errors_compare_by_content() {
        let a = Value::error("Io", Value::str("closed"));
        assert_eq!(a, Value::error("Io", Value::str("closed")));
        assert_eq!(a.error_tag(), Some("Io"));
        assert_eq!(a.to_string(), "Io(closed)");
    }
}
