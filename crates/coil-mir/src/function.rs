// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! MIR function representation - control-flow graph of basic blocks.

use crate::{MirStmt, MirTerminator, MirType, Place};

/// MIR function
#[derive(Debug, Clone)]
pub struct MirFunction {
    pub name: String,
    pub params: Vec<MirLocal>,
    pub ret_ty: MirType,
    pub locals: Vec<MirLocal>,
    pub blocks: Vec<MirBlock>,
    pub entry_block: BlockId,
    /// Protected block ranges, innermost first.
    pub exception_table: Vec<ExceptionRegion>,
}

/// Basic block in CFG
#[derive(Debug, Clone)]
pub struct MirBlock {
    pub id: BlockId,
    pub statements: Vec<MirStmt>,
    pub terminator: MirTerminator,
}

/// Local variable or temporary
#[derive(Debug, Clone)]
pub struct MirLocal {
    pub id: LocalId,
    pub name: Option<String>,
    pub ty: MirType,
    pub is_param: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Field of the state object a function runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub u32);

/// Entry in a function's exception table.
///
/// Covers the half-open block range `start..end`. Handlers are tried in
/// order; if none matches, `cleanup` (a member function) runs before the
/// exception moves to the next covering entry.
#[derive(Debug, Clone)]
pub struct ExceptionRegion {
    pub start: BlockId,
    pub end: BlockId,
    pub handlers: Vec<ExceptionHandler>,
    pub cleanup: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// Exception tag to match; `None` matches everything.
    pub tag: Option<String>,
    /// Receives the exception before the filter runs.
    pub binding: Option<Place>,
    /// Filter entry block; ends in `EndFilter`.
    pub filter: Option<BlockId>,
    pub entry: BlockId,
}

impl ExceptionRegion {
    pub fn covers(&self, block: BlockId) -> bool {
        self.start <= block && block < self.end
    }

    pub fn len(&self) -> u32 {
        self.end.0.saturating_sub(self.start.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MirFunction {
    pub fn block(&self, id: BlockId) -> &MirBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn local(&self, id: LocalId) -> Option<&MirLocal> {
        self.locals.iter().find(|l| l.id == id)
    }

    /// One past the highest local id in use.
    pub fn local_capacity(&self) -> usize {
        self.locals.iter().map(|l| l.id.0 as usize + 1).max().unwrap_or(0)
    }

    /// Exception table entries covering `block`, innermost first.
    pub fn covering_regions(&self, block: BlockId) -> impl Iterator<Item = &ExceptionRegion> {
        self.exception_table.iter().filter(move |r| r.covers(block))
    }
}
