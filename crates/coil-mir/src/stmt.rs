// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! MIR statements and terminators.

use crate::{BlockId, FunctionRef, MirOperand, MirRValue, Place};

/// MIR statement
#[derive(Debug, Clone, PartialEq)]
pub enum MirStmt {
    Assign {
        dst: Place,
        rvalue: MirRValue,
    },
    Call {
        dst: Option<Place>,
        func: FunctionRef,
        args: Vec<MirOperand>,
    },
    /// Fresh cell holding `init`.
    NewCell {
        dst: Place,
        init: MirOperand,
    },
    StoreCell {
        cell: MirOperand,
        value: MirOperand,
    },
    ClosureCreate {
        dst: Place,
        func_name: String,
        /// Cells shared with the closure, in environment order.
        captures: Vec<MirOperand>,
    },
    ClosureCall {
        dst: Option<Place>,
        closure: MirOperand,
    },
    /// Store the state index of the running state object.
    SetState(i64),
    /// Expose the value handed to the consumer of a sequence.
    SetCurrent(MirOperand),
    /// Publish the result of an async function.
    SetResult(MirOperand),
    /// Hand the awaited operation to the driver, which arranges for the
    /// object to be stepped again once it completes.
    AwaitOn(MirOperand),
    /// Run an async state object up to its first suspension and store its
    /// completion handle in `dst`.
    StartMachine {
        dst: Place,
        machine: MirOperand,
    },
}

/// Reason a segmented block stops.
#[derive(Debug, Clone, PartialEq)]
pub enum SuspendKind {
    Produce { value: MirOperand },
    Wait { awaiter: MirOperand },
}

/// Block terminator
#[derive(Debug, Clone, PartialEq)]
pub enum MirTerminator {
    Return {
        value: Option<MirOperand>,
    },
    Goto {
        target: BlockId,
    },
    Branch {
        cond: MirOperand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Switch {
        value: MirOperand,
        cases: Vec<(i64, BlockId)>,
        default: BlockId,
    },
    Throw {
        value: MirOperand,
    },
    /// Suspension point in a segmented body. Never reaches an emitted
    /// function.
    Suspend {
        kind: SuspendKind,
        resume: BlockId,
    },
    /// End of an exception filter: `accept` decides whether the handler runs.
    EndFilter {
        accept: MirOperand,
    },
    Unreachable,
}

impl MirTerminator {
    /// Normal-flow successors.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            MirTerminator::Goto { target } => vec![*target],
            MirTerminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            MirTerminator::Switch { cases, default, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            MirTerminator::Suspend { resume, .. } => vec![*resume],
            MirTerminator::Return { .. }
            | MirTerminator::Throw { .. }
            | MirTerminator::EndFilter { .. }
            | MirTerminator::Unreachable => Vec::new(),
        }
    }

    /// Replace every jump to `from` with a jump to `to`.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        let fix = |b: &mut BlockId| {
            if *b == from {
                *b = to;
            }
        };
        match self {
            MirTerminator::Goto { target } => fix(target),
            MirTerminator::Branch { then_block, else_block, .. } => {
                fix(then_block);
                fix(else_block);
            }
            MirTerminator::Switch { cases, default, .. } => {
                for (_, b) in cases.iter_mut() {
                    fix(b);
                }
                fix(default);
            }
            MirTerminator::Suspend { resume, .. } => fix(resume),
            _ => {}
        }
    }
}
