// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! MIR (Mid-level Intermediate Representation) - non-SSA control-flow graph.
//!
//! Bodies with suspension points are lowered to MIR in two shapes: a
//! segmented body whose blocks end in `Suspend` terminators, and the
//! suspension-free functions emitted from it (`step`, `dispose`, cleanups,
//! closures, kickoff). See [`lower`].

mod builder;
mod display;
mod function;
mod operand;
mod stmt;
mod types;

pub mod lower;

pub use builder::BlockBuilder;
pub use function::{BlockId, ExceptionHandler, ExceptionRegion, FieldId, MirBlock, MirFunction, MirLocal};
pub use operand::{BinOp, FunctionRef, LocalId, MirConst, MirOperand, MirRValue, Place, UnaryOp};
pub use stmt::{MirStmt, MirTerminator, SuspendKind};
pub use types::MirType;
