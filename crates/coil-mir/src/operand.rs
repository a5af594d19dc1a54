// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! MIR operands and rvalues.

pub use crate::function::{FieldId, LocalId};

/// Assignable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    Local(LocalId),
    /// Field of the state object the function runs against.
    Field(FieldId),
}

/// MIR operand - value that can be used
#[derive(Debug, Clone, PartialEq)]
pub enum MirOperand {
    Local(LocalId),
    Field(FieldId),
    Constant(MirConst),
}

/// MIR constant value
#[derive(Debug, Clone, PartialEq)]
pub enum MirConst {
    Unit,
    Int(i64),
    Bool(bool),
    String(String),
}

/// MIR rvalue - right-hand side of assignment
#[derive(Debug, Clone, PartialEq)]
pub enum MirRValue {
    Use(MirOperand),
    BinaryOp {
        op: BinOp,
        left: MirOperand,
        right: MirOperand,
    },
    UnaryOp {
        op: UnaryOp,
        operand: MirOperand,
    },
    /// Exception value with a tag and payload.
    MakeError {
        tag: String,
        payload: MirOperand,
    },
    /// Current value held by a cell.
    LoadCell(MirOperand),
    Receiver,
    /// Entry `index` of the running closure's environment.
    LoadCapture(u32),
    /// Result of a completed awaited operation; rethrows its fault.
    AwaitResult(MirOperand),
    /// State index of the running state object.
    LoadState,
    /// Allocate a state object with its parameter slots filled.
    NewMachine {
        machine: String,
        args: Vec<MirOperand>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Function reference for calls
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRef {
    pub name: String,
    /// True for functions generated alongside the caller that run against
    /// the caller's state object.
    pub is_member: bool,
}

impl FunctionRef {
    /// Call into the host environment.
    pub fn host(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_member: false }
    }

    /// Call a sibling function sharing the caller's state object.
    pub fn member(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_member: true }
    }
}

impl Place {
    pub fn to_operand(self) -> MirOperand {
        match self {
            Place::Local(id) => MirOperand::Local(id),
            Place::Field(id) => MirOperand::Field(id),
        }
    }
}

impl MirOperand {
    pub fn unit() -> Self {
        MirOperand::Constant(MirConst::Unit)
    }

    pub fn int(value: i64) -> Self {
        MirOperand::Constant(MirConst::Int(value))
    }

    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            MirOperand::Local(id) => Some(*id),
            _ => None,
        }
    }
}
