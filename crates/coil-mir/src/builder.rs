// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! BlockBuilder - incremental CFG construction for the segmenter and emitter.
//!
//! Blocks are numbered in creation order, which the region ranges rely on.

use crate::{
    BlockId, ExceptionRegion, LocalId, MirBlock, MirFunction, MirLocal, MirStmt, MirTerminator,
    MirType,
};

pub struct BlockBuilder {
    function: MirFunction,
    current_block: BlockId,
    next_local_id: u32,
    next_block_id: u32,
}

impl BlockBuilder {
    pub fn new(name: String, ret_ty: MirType) -> Self {
        let entry_block = BlockId(0);
        let function = MirFunction {
            name,
            params: Vec::new(),
            ret_ty,
            locals: Vec::new(),
            blocks: vec![MirBlock {
                id: entry_block,
                statements: Vec::new(),
                terminator: MirTerminator::Unreachable,
            }],
            entry_block,
            exception_table: Vec::new(),
        };

        Self {
            function,
            current_block: entry_block,
            next_local_id: 0,
            next_block_id: 1,
        }
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.function.blocks.push(MirBlock {
            id,
            statements: Vec::new(),
            terminator: MirTerminator::Unreachable,
        });
        id
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Id the next created block will get.
    pub fn next_block(&self) -> BlockId {
        BlockId(self.next_block_id)
    }

    pub fn alloc_temp(&mut self, ty: MirType) -> LocalId {
        let id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        self.function.locals.push(MirLocal {
            id,
            name: None,
            ty,
            is_param: false,
        });
        id
    }

    pub fn alloc_local(&mut self, name: String, ty: MirType) -> LocalId {
        let id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        self.function.locals.push(MirLocal {
            id,
            name: Some(name),
            ty,
            is_param: false,
        });
        id
    }

    pub fn add_param(&mut self, name: String, ty: MirType) -> LocalId {
        let id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        let local = MirLocal {
            id,
            name: Some(name),
            ty,
            is_param: true,
        };
        self.function.params.push(local.clone());
        self.function.locals.push(local);
        id
    }

    /// Register a local whose id was allocated by another builder.
    pub fn adopt_local(&mut self, local: MirLocal) {
        self.next_local_id = self.next_local_id.max(local.id.0 + 1);
        self.function.locals.push(local);
    }

    pub fn push_stmt(&mut self, stmt: MirStmt) {
        let block = &mut self.function.blocks[self.current_block.0 as usize];
        block.statements.push(stmt);
    }

    pub fn terminate(&mut self, term: MirTerminator) {
        let block = &mut self.function.blocks[self.current_block.0 as usize];
        block.terminator = term;
    }

    /// Terminator of an already built block, for patching jump targets.
    pub fn terminator_mut(&mut self, block: BlockId) -> &mut MirTerminator {
        &mut self.function.blocks[block.0 as usize].terminator
    }

    /// Check if the current block still has the default Unreachable terminator.
    pub fn current_block_unterminated(&self) -> bool {
        matches!(
            self.function.blocks[self.current_block.0 as usize].terminator,
            MirTerminator::Unreachable
        )
    }

    pub fn set_entry(&mut self, block: BlockId) {
        self.function.entry_block = block;
    }

    pub fn add_region(&mut self, region: ExceptionRegion) {
        self.function.exception_table.push(region);
    }

    pub fn finish(self) -> MirFunction {
        self.function
    }
}
