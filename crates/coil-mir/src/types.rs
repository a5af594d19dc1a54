// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! MIR type system - a coarse view of the bound types.

use coil_ast::Ty;

use crate::operand::MirConst;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MirType {
    Void,
    Bool,
    I64,
    String,
    Error,
    Closure,
    /// Heap cell holding a variable shared with closures.
    Cell(Box<MirType>),
    Object(String),
    /// Awaitable operation or async task.
    Operation,
    /// Handle to a state object of the named machine type.
    Machine(String),
    /// Result of a host call; not statically known.
    Any,
}

impl MirType {
    /// Value a slot of this type holds before its first assignment.
    pub fn default_const(&self) -> MirConst {
        match self {
            MirType::Bool => MirConst::Bool(false),
            MirType::I64 => MirConst::Int(0),
            MirType::String => MirConst::String(String::new()),
            _ => MirConst::Unit,
        }
    }
}

impl From<&Ty> for MirType {
    fn from(ty: &Ty) -> Self {
        match ty {
            Ty::Unit => MirType::Void,
            Ty::Bool => MirType::Bool,
            Ty::Int => MirType::I64,
            Ty::Str => MirType::String,
            Ty::Error => MirType::Error,
            Ty::Closure => MirType::Closure,
            Ty::Object(name) | Ty::StackOnly(name) => MirType::Object(name.clone()),
            Ty::Awaitable(_) => MirType::Operation,
            Ty::Sequence(_) => MirType::Object("Sequence".to_string()),
            Ty::ByRef(inner) | Ty::RawPtr(inner) => MirType::from(inner.as_ref()),
        }
    }
}
