// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Segmenter - structured body to a state graph.
//!
//! Lowers the bound body into a CFG whose basic blocks are the states of
//! the machine. Every suspension point ends its block with a `Suspend`
//! terminator and continues in a fresh resume block. Loops and branches
//! always get their own check/join blocks, so a loop condition never shares
//! a state with the increment before it.
//!
//! Block ids are handed out in walk order, which keeps the blocks of a
//! protected body contiguous: a region covers `start..end` where `start` is
//! the block opened on entry and `end` the next id free on exit. Handler,
//! filter and trampoline blocks are created after the body and therefore
//! fall outside it.

use std::collections::{HashMap, HashSet};
use std::mem;

use coil_ast::{
    BinaryOp, CatchClause, ExprId, ExprKind, FnBody, Literal, ScopeId, Span, StmtId, StmtKind, VarId,
};
use tracing::{debug, trace};

use super::capture::{stmt_defs, stmt_uses, terminator_uses};
use super::classify::Classification;
use super::config::LowerConfig;
use super::descriptor::{
    CleanupId, ClosureBody, HandlerClause, NodeRef, RegionId, SlotOrigin, State, StateKind,
    SuspensionSite,
};
use super::error::LowerError;
use crate::{
    BinOp, BlockBuilder, BlockId, FunctionRef, LocalId, MirConst, MirFunction, MirLocal,
    MirOperand, MirRValue, MirStmt, MirTerminator, MirType, Place, SuspendKind, UnaryOp,
};

/// Host function taking a lock's target on entry.
pub const MONITOR_ENTER: &str = "monitor_enter";
/// Host function releasing a lock's target.
pub const MONITOR_EXIT: &str = "monitor_exit";
/// Host function implementing constructor chaining.
pub const CHAIN_CTOR: &str = "chain_ctor";

/// Protected block range before it is turned into a descriptor.
#[derive(Debug, Clone)]
pub struct RawRegion {
    pub id: RegionId,
    pub parent: Option<RegionId>,
    pub start: BlockId,
    /// Exclusive.
    pub end: BlockId,
    pub handlers: Vec<HandlerClause>,
    pub cleanup: Option<CleanupId>,
    pub span: Span,
}

impl RawRegion {
    pub fn covers(&self, block: BlockId) -> bool {
        self.start <= block && block < self.end
    }

    pub fn len(&self) -> u32 {
        self.end.0 - self.start.0
    }
}

/// Where a local came from and which scope owns it.
#[derive(Debug, Clone, Copy)]
pub struct LocalInfo {
    pub origin: SlotOrigin,
    pub scope: ScopeId,
}

#[derive(Debug, Clone)]
pub struct SegmentedCleanup {
    pub id: CleanupId,
    pub name: String,
    pub func: MirFunction,
    pub regions: Vec<RawRegion>,
}

/// Output of the segmenter.
///
/// All functions produced for one body share a single local id space, so a
/// local referenced by both the body and a cleanup is the same `LocalId`.
#[derive(Debug, Clone)]
pub struct SegmentedBody {
    pub func: MirFunction,
    pub states: Vec<State>,
    pub sites: Vec<SuspensionSite>,
    pub regions: Vec<RawRegion>,
    pub cleanups: Vec<SegmentedCleanup>,
    pub closures: Vec<ClosureBody>,
    /// Indexed by `LocalId`.
    pub locals: Vec<MirLocal>,
    pub local_info: Vec<LocalInfo>,
    pub var_locals: HashMap<VarId, LocalId>,
    /// Variables that need a fresh cell per loop iteration.
    pub per_iteration: HashSet<VarId>,
}

impl SegmentedBody {
    pub fn info(&self, local: LocalId) -> LocalInfo {
        self.local_info[local.0 as usize]
    }
}

pub fn segment(
    body: &FnBody,
    classification: &Classification,
    config: &LowerConfig,
) -> Result<SegmentedBody, Vec<LowerError>> {
    let boxed: HashSet<VarId> = body.closure_captures(body.root).into_iter().collect();
    let mut s = Segmenter {
        body,
        classification,
        ctx: FnCtx::new(body.name.clone(), MirType::from(&body.ret_ty), false),
        locals: Vec::new(),
        local_info: Vec::new(),
        var_locals: HashMap::new(),
        boxed,
        per_iteration: HashSet::new(),
        loop_scopes: Vec::new(),
        env: None,
        scope: body.root_scope(),
        sites: Vec::new(),
        cleanups: Vec::new(),
        next_cleanup: 0,
        closures: Vec::new(),
        errors: Vec::new(),
    };

    let mut param_locals = Vec::new();
    for (i, p) in body.params.iter().enumerate() {
        let decl = body.var(*p);
        let local = s.new_local(
            Some(decl.name.clone()),
            MirType::from(&decl.ty),
            SlotOrigin::Param(i as u32),
        );
        s.locals[local.0 as usize].is_param = true;
        param_locals.push(local);
        if s.boxed.contains(p) {
            let cell = s.declare_var(*p);
            s.emit(MirStmt::NewCell {
                dst: Place::Local(cell),
                init: MirOperand::Local(local),
            });
        } else {
            s.var_locals.insert(*p, local);
        }
    }

    s.lower_stmt(body.root);
    if s.ctx.builder.current_block_unterminated() {
        s.ctx.builder.terminate(MirTerminator::Return { value: None });
    }

    let block_count = s.ctx.builder.next_block().0 as usize;
    if block_count > config.max_states {
        s.errors.push(LowerError::too_many_states(
            body.name.clone(),
            block_count,
            config.max_states,
            body.span,
        ));
    }
    if !s.errors.is_empty() {
        return Err(s.errors);
    }

    let ctx = mem::replace(&mut s.ctx, FnCtx::new(String::new(), MirType::Void, false));
    let kinds = ctx.kinds.clone();
    let (func, regions) = ctx.finish(&s.locals, &param_locals);
    let states = build_states(&func, &kinds, &regions);
    let mut cleanups = s.cleanups;
    cleanups.sort_by_key(|c| c.id);

    debug!(
        function = %body.name,
        states = states.len(),
        sites = s.sites.len(),
        regions = regions.len(),
        cleanups = cleanups.len(),
        closures = s.closures.len(),
        "segmented"
    );

    Ok(SegmentedBody {
        func,
        states,
        sites: s.sites,
        regions,
        cleanups,
        closures: s.closures,
        locals: s.locals,
        local_info: s.local_info,
        var_locals: s.var_locals,
        per_iteration: s.per_iteration,
    })
}

fn build_states(
    func: &MirFunction,
    kinds: &HashMap<BlockId, StateKind>,
    regions: &[RawRegion],
) -> Vec<State> {
    func.blocks
        .iter()
        .map(|b| {
            let kind = if b.id == func.entry_block {
                StateKind::Entry
            } else {
                kinds.get(&b.id).copied().unwrap_or(StateKind::Body)
            };
            let region = regions
                .iter()
                .filter(|r| r.covers(b.id))
                .min_by_key(|r| r.len())
                .map(|r| r.id);
            State {
                id: b.id,
                kind,
                successors: b.terminator.successors(),
                region,
                is_cleanup: kind == StateKind::Cleanup,
            }
        })
        .collect()
}

/// Per-function lowering state. Cleanup and closure bodies get their own.
struct FnCtx {
    builder: BlockBuilder,
    regions: Vec<RawRegion>,
    open: Vec<OpenRegion>,
    loops: Vec<LoopCtx>,
    kinds: HashMap<BlockId, StateKind>,
    in_finally: bool,
}

struct OpenRegion {
    id: RegionId,
    pending: Vec<PendingExit>,
}

struct LoopCtx {
    continue_block: BlockId,
    exit_block: BlockId,
    /// Open regions when the loop was entered.
    depth: usize,
}

/// A jump that leaves one or more open regions. Its source block keeps an
/// `Unreachable` terminator until every region it leaves has been closed.
struct PendingExit {
    from: BlockId,
    dest: ExitDest,
    stop_depth: usize,
}

#[derive(Clone)]
enum ExitDest {
    Jump(BlockId),
    Return(Option<MirOperand>),
}

impl FnCtx {
    fn new(name: String, ret_ty: MirType, in_finally: bool) -> Self {
        Self {
            builder: BlockBuilder::new(name, ret_ty),
            regions: Vec::new(),
            open: Vec::new(),
            loops: Vec::new(),
            kinds: HashMap::new(),
            in_finally,
        }
    }

    fn finish(self, all: &[MirLocal], always: &[LocalId]) -> (MirFunction, Vec<RawRegion>) {
        let mut func = self.builder.finish();
        let mut used: Vec<LocalId> = always.to_vec();
        for block in &func.blocks {
            for stmt in &block.statements {
                used.extend(stmt_defs(stmt));
                used.extend(stmt_uses(stmt));
            }
            used.extend(terminator_uses(&block.terminator));
        }
        for region in &self.regions {
            used.extend(region.handlers.iter().filter_map(|h| h.binding));
        }
        used.sort();
        used.dedup();
        func.locals = used.iter().map(|id| all[id.0 as usize].clone()).collect();
        func.params = func.locals.iter().filter(|l| l.is_param).cloned().collect();
        (func, self.regions)
    }
}

struct Segmenter<'a> {
    body: &'a FnBody,
    classification: &'a Classification,
    ctx: FnCtx,
    locals: Vec<MirLocal>,
    local_info: Vec<LocalInfo>,
    var_locals: HashMap<VarId, LocalId>,
    /// Variables captured by some closure; they live in cells.
    boxed: HashSet<VarId>,
    per_iteration: HashSet<VarId>,
    loop_scopes: Vec<ScopeId>,
    /// Captured variables, in environment order, while lowering a closure.
    env: Option<Vec<VarId>>,
    scope: ScopeId,
    sites: Vec<SuspensionSite>,
    cleanups: Vec<SegmentedCleanup>,
    next_cleanup: u32,
    closures: Vec<ClosureBody>,
    errors: Vec<LowerError>,
}

impl Segmenter<'_> {
    // -- Locals -------------------------------------------------------------

    fn new_local(&mut self, name: Option<String>, ty: MirType, origin: SlotOrigin) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(MirLocal {
            id,
            name,
            ty,
            is_param: false,
        });
        self.local_info.push(LocalInfo {
            origin,
            scope: self.scope,
        });
        id
    }

    fn temp(&mut self, ty: MirType) -> LocalId {
        self.new_local(None, ty, SlotOrigin::Temporary)
    }

    fn assign_temp(&mut self, ty: MirType, rvalue: MirRValue) -> MirOperand {
        let t = self.temp(ty);
        self.emit(MirStmt::Assign {
            dst: Place::Local(t),
            rvalue,
        });
        MirOperand::Local(t)
    }

    /// Copy a local into a fresh temporary so later writes can't change it.
    fn spill(&mut self, op: MirOperand) -> MirOperand {
        match op {
            MirOperand::Constant(_) => op,
            other => self.assign_temp(MirType::Any, MirRValue::Use(other)),
        }
    }

    fn declare_var(&mut self, var: VarId) -> LocalId {
        if let Some(l) = self.var_locals.get(&var) {
            return *l;
        }
        let decl = self.body.var(var);
        let mut ty = MirType::from(&decl.ty);
        if self.boxed.contains(&var) {
            ty = MirType::Cell(Box::new(ty));
        }
        let id = self.new_local(Some(decl.name.clone()), ty, SlotOrigin::Variable(var));
        self.local_info[id.0 as usize].scope = decl.scope;
        self.var_locals.insert(var, id);
        id
    }

    fn bind_var(&mut self, var: VarId, value: MirOperand) {
        let local = self.declare_var(var);
        let stmt = if self.boxed.contains(&var) {
            MirStmt::NewCell {
                dst: Place::Local(local),
                init: value,
            }
        } else {
            MirStmt::Assign {
                dst: Place::Local(local),
                rvalue: MirRValue::Use(value),
            }
        };
        self.emit(stmt);
    }

    fn store_var(&mut self, var: VarId, value: MirOperand) {
        let local = self.declare_var(var);
        let stmt = if self.boxed.contains(&var) {
            MirStmt::StoreCell {
                cell: MirOperand::Local(local),
                value,
            }
        } else {
            MirStmt::Assign {
                dst: Place::Local(local),
                rvalue: MirRValue::Use(value),
            }
        };
        self.emit(stmt);
    }

    fn read_var(&mut self, var: VarId, span: Span) -> MirOperand {
        let ty = MirType::from(&self.body.var(var).ty);
        if self.env.is_some() {
            let cell = self.capture_operand(var, span);
            return self.assign_temp(ty, MirRValue::LoadCell(cell));
        }
        let local = self.declare_var(var);
        if self.boxed.contains(&var) {
            self.assign_temp(ty, MirRValue::LoadCell(MirOperand::Local(local)))
        } else {
            MirOperand::Local(local)
        }
    }

    /// Operand holding the cell of a captured variable.
    fn capture_operand(&mut self, var: VarId, span: Span) -> MirOperand {
        let index = match &self.env {
            None => return MirOperand::Local(self.declare_var(var)),
            Some(env) => env.iter().position(|v| *v == var),
        };
        match index {
            Some(i) => {
                let ty = MirType::Cell(Box::new(MirType::from(&self.body.var(var).ty)));
                self.assign_temp(ty, MirRValue::LoadCapture(i as u32))
            }
            None => {
                let name = self.body.var(var).name.clone();
                self.errors.push(LowerError::uncaptured(var, name, span));
                MirOperand::unit()
            }
        }
    }

    // -- Blocks -------------------------------------------------------------

    fn emit(&mut self, stmt: MirStmt) {
        self.ctx.builder.push_stmt(stmt);
    }

    fn new_block(&mut self, kind: StateKind) -> BlockId {
        let b = self.ctx.builder.create_block();
        if kind != StateKind::Body {
            self.ctx.kinds.insert(b, kind);
        }
        b
    }

    fn goto(&mut self, target: BlockId) {
        if self.ctx.builder.current_block_unterminated() {
            self.ctx.builder.terminate(MirTerminator::Goto { target });
        }
    }

    fn switch_to(&mut self, block: BlockId) {
        self.ctx.builder.switch_to_block(block);
    }

    /// Fall through into a fresh block.
    fn start_block(&mut self, kind: StateKind) -> BlockId {
        let b = self.new_block(kind);
        self.goto(b);
        self.switch_to(b);
        b
    }

    /// Continue in an unreachable block after a jump.
    fn dead_block(&mut self) {
        let b = self.ctx.builder.create_block();
        self.switch_to(b);
    }

    fn suspend(&mut self, node: NodeRef, kind: SuspendKind) {
        let point = self.classification.point_at(node).map(|p| p.id);
        let state = self.ctx.builder.current_block();
        let resume = match point {
            Some(p) => self.new_block(StateKind::Resume(p)),
            None => self.new_block(StateKind::Body),
        };
        self.ctx.builder.terminate(MirTerminator::Suspend { kind, resume });
        self.switch_to(resume);
        if let Some(point) = point {
            trace!(point = point.0, state = state.0, resume = resume.0, "suspension site");
            self.sites.push(SuspensionSite {
                point,
                state,
                resume,
            });
        }
    }

    // -- Regions ------------------------------------------------------------

    fn open_region(&mut self, cleanup: Option<CleanupId>, span: Span) -> RegionId {
        let start = self.start_block(StateKind::Body);
        let id = RegionId(self.ctx.regions.len() as u32);
        let parent = self.ctx.open.last().map(|r| r.id);
        self.ctx.regions.push(RawRegion {
            id,
            parent,
            start,
            end: start,
            handlers: Vec::new(),
            cleanup,
            span,
        });
        self.ctx.open.push(OpenRegion {
            id,
            pending: Vec::new(),
        });
        id
    }

    fn close_region(&mut self) -> Vec<PendingExit> {
        let Some(open) = self.ctx.open.pop() else {
            return Vec::new();
        };
        let end = self.ctx.builder.next_block();
        self.ctx.regions[open.id.0 as usize].end = end;
        open.pending
    }

    /// Route jumps that left a just-closed region through its cleanup and
    /// on to their destination or the next region they leave.
    fn route_exits(&mut self, cleanup: Option<CleanupId>, pending: Vec<PendingExit>) {
        let resume = self.ctx.builder.current_block();
        let depth = self.ctx.open.len();
        for exit in pending {
            let mut from = exit.from;
            if let Some(c) = cleanup {
                let tramp = self.new_block(StateKind::Cleanup);
                *self.ctx.builder.terminator_mut(from) = MirTerminator::Goto { target: tramp };
                self.switch_to(tramp);
                self.emit(MirStmt::Call {
                    dst: None,
                    func: FunctionRef::member(self.cleanup_name(c)),
                    args: Vec::new(),
                });
                from = tramp;
            }
            let parent = if depth > exit.stop_depth { self.ctx.open.last_mut() } else { None };
            match parent {
                Some(parent) => parent.pending.push(PendingExit {
                    from,
                    dest: exit.dest,
                    stop_depth: exit.stop_depth,
                }),
                None => self.finish_exit(from, exit.dest),
            }
        }
        self.switch_to(resume);
    }

    fn finish_exit(&mut self, from: BlockId, dest: ExitDest) {
        *self.ctx.builder.terminator_mut(from) = match dest {
            ExitDest::Jump(target) => MirTerminator::Goto { target },
            ExitDest::Return(value) => MirTerminator::Return { value },
        };
    }

    /// Jump to `dest`, running the cleanups of every region above `stop_depth`.
    fn leave_to(&mut self, dest: ExitDest, stop_depth: usize) {
        let from = self.ctx.builder.current_block();
        let depth = self.ctx.open.len();
        let inner = if depth > stop_depth { self.ctx.open.last_mut() } else { None };
        match inner {
            Some(inner) => inner.pending.push(PendingExit {
                from,
                dest,
                stop_depth,
            }),
            None => self.finish_exit(from, dest),
        }
    }

    fn cleanup_name(&self, id: CleanupId) -> String {
        format!("{}__finally_{}", self.body.name, id.0)
    }

    /// Lower a cleanup into its own function.
    fn lower_cleanup(&mut self, f: impl FnOnce(&mut Self)) -> CleanupId {
        let id = CleanupId(self.next_cleanup);
        self.next_cleanup += 1;
        let name = self.cleanup_name(id);
        let saved_ctx = mem::replace(&mut self.ctx, FnCtx::new(name.clone(), MirType::Void, true));
        let saved_loops = mem::take(&mut self.loop_scopes);
        f(self);
        if self.ctx.builder.current_block_unterminated() {
            self.ctx.builder.terminate(MirTerminator::Return { value: None });
        }
        let ctx = mem::replace(&mut self.ctx, saved_ctx);
        self.loop_scopes = saved_loops;
        let (func, regions) = ctx.finish(&self.locals, &[]);
        self.cleanups.push(SegmentedCleanup {
            id,
            name,
            func,
            regions,
        });
        id
    }

    /// Close a cleanup region and run the cleanup on the fallthrough path.
    fn close_cleanup_region(&mut self, cleanup: CleanupId) {
        let pending = self.close_region();
        let normal = self.new_block(StateKind::Cleanup);
        self.goto(normal);
        self.route_exits(Some(cleanup), pending);
        self.switch_to(normal);
        self.emit(MirStmt::Call {
            dst: None,
            func: FunctionRef::member(self.cleanup_name(cleanup)),
            args: Vec::new(),
        });
        self.start_block(StateKind::Body);
    }

    // -- Statements ---------------------------------------------------------

    fn lower_stmt(&mut self, id: StmtId) {
        let body = self.body;
        let stmt = body.stmt(id);
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Block { scope, stmts } => {
                let saved = mem::replace(&mut self.scope, *scope);
                for s in stmts {
                    self.lower_stmt(*s);
                }
                self.scope = saved;
            }
            StmtKind::Let { var, init } => {
                let value = match init {
                    Some(e) => self.lower_expr(*e),
                    None => MirOperand::Constant(MirType::from(&body.var(*var).ty).default_const()),
                };
                self.bind_var(*var, value);
            }
            StmtKind::Assign { target, value } => {
                let value = self.lower_expr(*value);
                self.store_var(*target, value);
            }
            StmtKind::Expr(e) => {
                self.lower_expr(*e);
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                self.lower_if(*cond, *then_branch, *else_branch)
            }
            StmtKind::Switch { scrutinee, arms, default } => {
                let value = self.lower_expr(*scrutinee);
                let join = self.new_block(StateKind::Body);
                let targets: Vec<(i64, BlockId)> = arms
                    .iter()
                    .map(|arm| (arm.value, self.new_block(StateKind::Body)))
                    .collect();
                let default_block = match default {
                    Some(_) => self.new_block(StateKind::Body),
                    None => join,
                };
                self.ctx.builder.terminate(MirTerminator::Switch {
                    value,
                    cases: targets.clone(),
                    default: default_block,
                });
                for (arm, (_, block)) in arms.iter().zip(targets) {
                    self.switch_to(block);
                    self.lower_stmt(arm.body);
                    self.goto(join);
                }
                if let Some(d) = default {
                    self.switch_to(default_block);
                    self.lower_stmt(*d);
                    self.goto(join);
                }
                self.switch_to(join);
            }
            StmtKind::While { cond, body: loop_body } => self.lower_while(*cond, *loop_body),
            StmtKind::For { scope, init, cond, step, body: loop_body } => {
                self.lower_for(*scope, init, *cond, step, *loop_body)
            }
            StmtKind::Break => self.lower_loop_jump(true, span),
            StmtKind::Continue => self.lower_loop_jump(false, span),
            StmtKind::Return(value) => self.lower_return(*value, span),
            StmtKind::Throw(e) => {
                let value = self.lower_expr(*e);
                self.ctx.builder.terminate(MirTerminator::Throw { value });
                self.dead_block();
            }
            StmtKind::Try { body: try_body, catches, finally } => {
                self.lower_try(*try_body, catches, *finally, span)
            }
            StmtKind::Lock { target, body: lock_body } => {
                let target = self.lower_expr(*target);
                let held = self.assign_temp(MirType::Any, MirRValue::Use(target));
                self.emit(MirStmt::Call {
                    dst: None,
                    func: FunctionRef::host(MONITOR_ENTER),
                    args: vec![held.clone()],
                });
                let cleanup = self.lower_cleanup(|s| {
                    s.emit(MirStmt::Call {
                        dst: None,
                        func: FunctionRef::host(MONITOR_EXIT),
                        args: vec![held],
                    })
                });
                self.open_region(Some(cleanup), span);
                self.lower_stmt(*lock_body);
                self.close_cleanup_region(cleanup);
            }
            StmtKind::Unsafe { body: inner } => self.lower_stmt(*inner),
            StmtKind::ChainCtor { args } => {
                let args = self.lower_args(args);
                self.emit(MirStmt::Call {
                    dst: None,
                    func: FunctionRef::host(CHAIN_CTOR),
                    args,
                });
            }
            StmtKind::Produce(e) => {
                let value = self.lower_expr(*e);
                self.suspend(NodeRef::Stmt(id), SuspendKind::Produce { value });
            }
        }
    }

    fn lower_if(&mut self, cond: ExprId, then_branch: StmtId, else_branch: Option<StmtId>) {
        let cond = self.lower_expr(cond);
        let then_block = self.new_block(StateKind::Body);
        let else_block = else_branch.map(|_| self.new_block(StateKind::Body));
        let join = self.new_block(StateKind::Body);
        self.ctx.builder.terminate(MirTerminator::Branch {
            cond,
            then_block,
            else_block: else_block.unwrap_or(join),
        });

        self.switch_to(then_block);
        self.lower_stmt(then_branch);
        self.goto(join);

        if let (Some(block), Some(stmt)) = (else_block, else_branch) {
            self.switch_to(block);
            self.lower_stmt(stmt);
            self.goto(join);
        }
        self.switch_to(join);
    }

    fn lower_while(&mut self, cond: ExprId, body: StmtId) {
        let check = self.start_block(StateKind::Body);
        let cond = self.lower_expr(cond);
        let body_block = self.new_block(StateKind::Body);
        let exit = self.new_block(StateKind::Body);
        self.ctx.builder.terminate(MirTerminator::Branch {
            cond,
            then_block: body_block,
            else_block: exit,
        });

        let loop_scope = match &self.body.stmt(body).kind {
            StmtKind::Block { scope, .. } => Some(*scope),
            _ => None,
        };
        self.ctx.loops.push(LoopCtx {
            continue_block: check,
            exit_block: exit,
            depth: self.ctx.open.len(),
        });
        self.loop_scopes.extend(loop_scope);

        self.switch_to(body_block);
        self.lower_stmt(body);
        self.goto(check);

        if loop_scope.is_some() {
            self.loop_scopes.pop();
        }
        self.ctx.loops.pop();
        self.switch_to(exit);
    }

    fn lower_for(
        &mut self,
        scope: ScopeId,
        init: &[StmtId],
        cond: Option<ExprId>,
        step: &[StmtId],
        body: StmtId,
    ) {
        let saved_scope = mem::replace(&mut self.scope, scope);
        for s in init {
            self.lower_stmt(*s);
        }

        let check = self.start_block(StateKind::Body);
        let body_block = self.new_block(StateKind::Body);
        let continue_block = self.new_block(StateKind::Body);
        let exit = self.new_block(StateKind::Body);
        match cond {
            Some(c) => {
                let cond = self.lower_expr(c);
                self.ctx.builder.terminate(MirTerminator::Branch {
                    cond,
                    then_block: body_block,
                    else_block: exit,
                });
            }
            None => self.goto(body_block),
        }

        // Header variables a closure in the body holds on to get a new cell
        // before each increment.
        let captured_in_body = self.body.closure_captures(body);
        let refreshed: Vec<VarId> = self
            .body
            .vars
            .iter()
            .filter(|v| v.scope == scope && self.boxed.contains(&v.id))
            .filter(|v| captured_in_body.contains(&v.id))
            .map(|v| v.id)
            .collect();

        self.ctx.loops.push(LoopCtx {
            continue_block,
            exit_block: exit,
            depth: self.ctx.open.len(),
        });
        self.loop_scopes.push(scope);
        self.switch_to(body_block);
        self.lower_stmt(body);
        self.goto(continue_block);
        self.loop_scopes.pop();
        self.ctx.loops.pop();

        self.switch_to(continue_block);
        for var in refreshed {
            let cell = MirOperand::Local(self.declare_var(var));
            let ty = MirType::from(&self.body.var(var).ty);
            let current = self.assign_temp(ty, MirRValue::LoadCell(cell));
            let local = self.declare_var(var);
            self.emit(MirStmt::NewCell {
                dst: Place::Local(local),
                init: current,
            });
        }
        for s in step {
            self.lower_stmt(*s);
        }
        self.goto(check);
        self.switch_to(exit);
        self.scope = saved_scope;
    }

    fn lower_loop_jump(&mut self, is_break: bool, span: Span) {
        let Some(lp) = self.ctx.loops.last() else {
            let err = if self.ctx.in_finally {
                LowerError::jump_out_of_finally(span)
            } else {
                LowerError::jump_outside_loop(if is_break { "break" } else { "continue" }, span)
            };
            self.errors.push(err);
            return;
        };
        let target = if is_break { lp.exit_block } else { lp.continue_block };
        let depth = lp.depth;
        self.leave_to(ExitDest::Jump(target), depth);
        self.dead_block();
    }

    fn lower_return(&mut self, value: Option<ExprId>, span: Span) {
        if self.ctx.in_finally {
            self.errors.push(LowerError::jump_out_of_finally(span));
            return;
        }
        let value = value.map(|v| self.lower_expr(v));
        if self.ctx.open.is_empty() {
            self.ctx.builder.terminate(MirTerminator::Return { value });
        } else {
            // Cleanups run before the return and must not see later writes.
            let value = value.map(|v| self.spill(v));
            self.leave_to(ExitDest::Return(value), 0);
        }
        self.dead_block();
    }

    fn lower_try(
        &mut self,
        try_body: StmtId,
        catches: &[CatchClause],
        finally: Option<StmtId>,
        span: Span,
    ) {
        let cleanup = finally.map(|f| self.lower_cleanup(|s| s.lower_stmt(f)));
        if let Some(c) = cleanup {
            self.open_region(Some(c), span);
        }

        if catches.is_empty() {
            self.lower_stmt(try_body);
        } else {
            let inner = self.open_region(None, span);
            self.lower_stmt(try_body);
            let pending = self.close_region();
            let join = self.new_block(StateKind::Body);
            self.goto(join);
            self.route_exits(None, pending);

            let mut handlers = Vec::with_capacity(catches.len());
            for clause in catches {
                handlers.push(self.lower_catch(clause, join));
            }
            self.ctx.regions[inner.0 as usize].handlers = handlers;
            self.switch_to(join);
        }

        if let Some(c) = cleanup {
            self.close_cleanup_region(c);
        }
    }

    fn lower_catch(&mut self, clause: &CatchClause, join: BlockId) -> HandlerClause {
        // The dispatcher writes the exception to `raw`. Boxed bindings get
        // their cell at the start of the filter and of the handler.
        let binding = clause.binding.map(|var| {
            if self.boxed.contains(&var) {
                let raw = self.temp(MirType::Error);
                (raw, Some(var))
            } else {
                (self.declare_var(var), None)
            }
        });
        let box_binding = |s: &mut Self| {
            if let Some((raw, Some(var))) = binding {
                s.bind_var(var, MirOperand::Local(raw));
            }
        };

        let filter = clause.filter.map(|f| {
            let block = self.new_block(StateKind::Filter);
            self.switch_to(block);
            box_binding(self);
            let accept = self.lower_expr(f);
            self.ctx.builder.terminate(MirTerminator::EndFilter { accept });
            block
        });

        let entry = self.new_block(StateKind::Handler);
        self.switch_to(entry);
        box_binding(self);
        self.lower_stmt(clause.body);
        self.goto(join);

        HandlerClause {
            tag: clause.tag.clone(),
            filter,
            binding: binding.map(|(raw, _)| raw),
            entry,
        }
    }

    // -- Expressions --------------------------------------------------------

    fn lower_args(&mut self, args: &[ExprId]) -> Vec<MirOperand> {
        let mut ops = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let op = self.lower_expr(*arg);
            let later_wait = args[i + 1..].iter().any(|a| self.body.contains_wait(*a));
            ops.push(if later_wait { self.spill(op) } else { op });
        }
        ops
    }

    fn lower_expr(&mut self, id: ExprId) -> MirOperand {
        let body = self.body;
        let expr = body.expr(id);
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(lit) => MirOperand::Constant(match lit {
                Literal::Unit => MirConst::Unit,
                Literal::Bool(b) => MirConst::Bool(*b),
                Literal::Int(n) => MirConst::Int(*n),
                Literal::Str(s) => MirConst::String(s.clone()),
            }),
            ExprKind::Var(var) => self.read_var(*var, span),
            ExprKind::Receiver => self.assign_temp(MirType::Any, MirRValue::Receiver),
            ExprKind::Binary { op: op @ (BinaryOp::And | BinaryOp::Or), lhs, rhs } => {
                self.lower_short_circuit(*op == BinaryOp::And, *lhs, *rhs)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let left = self.lower_expr(*lhs);
                let left = if body.contains_wait(*rhs) { self.spill(left) } else { left };
                let right = self.lower_expr(*rhs);
                let (op, ty) = lower_binop(*op);
                self.assign_temp(ty, MirRValue::BinaryOp { op, left, right })
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.lower_expr(*operand);
                let (op, ty) = match op {
                    coil_ast::UnaryOp::Neg => (UnaryOp::Neg, MirType::I64),
                    coil_ast::UnaryOp::Not => (UnaryOp::Not, MirType::Bool),
                };
                self.assign_temp(ty, MirRValue::UnaryOp { op, operand })
            }
            ExprKind::Call { func, args } => {
                let args = self.lower_args(args);
                let t = self.temp(MirType::Any);
                self.emit(MirStmt::Call {
                    dst: Some(Place::Local(t)),
                    func: FunctionRef::host(func.clone()),
                    args,
                });
                MirOperand::Local(t)
            }
            ExprKind::Error { tag, payload } => {
                let payload = self.lower_expr(*payload);
                self.assign_temp(
                    MirType::Error,
                    MirRValue::MakeError {
                        tag: tag.clone(),
                        payload,
                    },
                )
            }
            ExprKind::Closure { captures, body: closure_body } => {
                self.lower_closure(captures, *closure_body, span)
            }
            ExprKind::Invoke { closure } => {
                let closure = self.lower_expr(*closure);
                let t = self.temp(MirType::Any);
                self.emit(MirStmt::ClosureCall {
                    dst: Some(Place::Local(t)),
                    closure,
                });
                MirOperand::Local(t)
            }
            ExprKind::Wait(operand) => {
                let operand = self.lower_expr(*operand);
                let awaiter = self.assign_temp(MirType::Operation, MirRValue::Use(operand));
                self.suspend(
                    NodeRef::Expr(id),
                    SuspendKind::Wait {
                        awaiter: awaiter.clone(),
                    },
                );
                self.assign_temp(MirType::Any, MirRValue::AwaitResult(awaiter))
            }
        }
    }

    fn lower_short_circuit(&mut self, is_and: bool, lhs: ExprId, rhs: ExprId) -> MirOperand {
        let result = self.temp(MirType::Bool);
        let left = self.lower_expr(lhs);
        let rhs_block = self.new_block(StateKind::Body);
        let short_block = self.new_block(StateKind::Body);
        let join = self.new_block(StateKind::Body);
        let (then_block, else_block) = if is_and {
            (rhs_block, short_block)
        } else {
            (short_block, rhs_block)
        };
        self.ctx.builder.terminate(MirTerminator::Branch {
            cond: left,
            then_block,
            else_block,
        });

        self.switch_to(short_block);
        self.emit(MirStmt::Assign {
            dst: Place::Local(result),
            rvalue: MirRValue::Use(MirOperand::Constant(MirConst::Bool(!is_and))),
        });
        self.goto(join);

        self.switch_to(rhs_block);
        let right = self.lower_expr(rhs);
        self.emit(MirStmt::Assign {
            dst: Place::Local(result),
            rvalue: MirRValue::Use(right),
        });
        self.goto(join);

        self.switch_to(join);
        MirOperand::Local(result)
    }

    fn lower_closure(&mut self, captures: &[VarId], closure_body: ExprId, span: Span) -> MirOperand {
        if self.env.is_none() {
            for var in captures {
                let declared = self.body.var(*var).scope;
                if self.loop_scopes.iter().any(|ls| self.body.scope_within(declared, *ls)) {
                    self.per_iteration.insert(*var);
                }
            }
        }
        let env_ops: Vec<MirOperand> = captures
            .iter()
            .map(|v| self.capture_operand(*v, span))
            .collect();

        let name = format!("{}__closure_{}", self.body.name, self.closures.len());
        let saved_ctx = mem::replace(&mut self.ctx, FnCtx::new(name.clone(), MirType::Any, false));
        let saved_env = mem::replace(&mut self.env, Some(captures.to_vec()));
        let saved_loops = mem::take(&mut self.loop_scopes);
        let result = self.lower_expr(closure_body);
        self.ctx.builder.terminate(MirTerminator::Return { value: Some(result) });
        let ctx = mem::replace(&mut self.ctx, saved_ctx);
        self.env = saved_env;
        self.loop_scopes = saved_loops;
        let (func, _) = ctx.finish(&self.locals, &[]);
        self.closures.push(ClosureBody {
            name: name.clone(),
            func,
        });

        let t = self.temp(MirType::Closure);
        self.emit(MirStmt::ClosureCreate {
            dst: Place::Local(t),
            func_name: name,
            captures: env_ops,
        });
        MirOperand::Local(t)
    }
}

fn lower_binop(op: BinaryOp) -> (BinOp, MirType) {
    match op {
        BinaryOp::Add => (BinOp::Add, MirType::I64),
        BinaryOp::Sub => (BinOp::Sub, MirType::I64),
        BinaryOp::Mul => (BinOp::Mul, MirType::I64),
        BinaryOp::Div => (BinOp::Div, MirType::I64),
        BinaryOp::Rem => (BinOp::Mod, MirType::I64),
        BinaryOp::Eq => (BinOp::Eq, MirType::Bool),
        BinaryOp::Ne => (BinOp::Ne, MirType::Bool),
        BinaryOp::Lt => (BinOp::Lt, MirType::Bool),
        BinaryOp::Le => (BinOp::Le, MirType::Bool),
        BinaryOp::Gt => (BinOp::Gt, MirType::Bool),
        BinaryOp::Ge => (BinOp::Ge, MirType::Bool),
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators lower to branches"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::classify::classify;
    use crate::lower::error::LowerErrorKind;
    use coil_ast::{BodyBuilder, ForParts, Ty};

    fn seg(body: &FnBody) -> SegmentedBody {
        let c = classify(body).unwrap();
        segment(body, &c, &LowerConfig::default()).unwrap()
    }

    fn seg_err(body: &FnBody) -> Vec<LowerErrorKind> {
        let c = classify(body).unwrap();
        segment(body, &c, &LowerConfig::default())
            .unwrap_err()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    fn member_calls(func: &MirFunction, name: &str) -> Vec<BlockId> {
        func.blocks
            .iter()
            .filter(|b| {
                b.statements.iter().any(|s| {
                    matches!(s, MirStmt::Call { func, .. } if func.is_member && func.name == name)
                })
            })
            .map(|b| b.id)
            .collect()
    }

    fn host_calls(func: &MirFunction, name: &str) -> usize {
        func.blocks
            .iter()
            .flat_map(|b| b.statements.iter())
            .filter(|s| matches!(s, MirStmt::Call { func, .. } if !func.is_member && func.name == name))
            .count()
    }

    fn log_stmt(b: &mut BodyBuilder) -> StmtId {
        let call = b.call("log", vec![]);
        b.expr(call)
    }

    #[test]
    fn each_produce_ends_a_state() {
        let mut b = BodyBuilder::new("numbers");
        let stmts: Vec<_> = (1..=3)
            .map(|n| {
                let v = b.int(n);
                b.produce(v)
            })
            .collect();
        let s = seg(&b.finish(stmts));

        assert_eq!(s.states[0].kind, StateKind::Entry);
        assert_eq!(s.sites.len(), 3);
        for site in &s.sites {
            assert!(matches!(
                s.func.block(site.state).terminator,
                MirTerminator::Suspend { resume, .. } if resume == site.resume
            ));
            assert!(matches!(s.states[site.resume.0 as usize].kind, StateKind::Resume(_)));
        }
        assert!(matches!(
            s.func.block(s.sites[2].resume).terminator,
            MirTerminator::Return { value: None }
        ));
    }

    #[test]
    fn loop_check_is_its_own_state() {
        let mut b = BodyBuilder::new("count");
        let for_stmt = b.for_loop(|b| {
            let zero = b.int(0);
            let (i, init) = b.let_var("i", Ty::Int, zero);
            let lhs = b.read(i);
            let three = b.int(3);
            let cond = b.binary(BinaryOp::Lt, lhs, three);
            let cur = b.read(i);
            let one = b.int(1);
            let next = b.binary(BinaryOp::Add, cur, one);
            let step = b.assign(i, next);
            let v = b.read(i);
            let p = b.produce(v);
            let body = b.block(|_| vec![p]);
            ForParts {
                init: vec![init],
                cond: Some(cond),
                step: vec![step],
                body,
            }
        });
        let s = seg(&b.finish(vec![for_stmt]));
        let i = s.var_locals[&VarId(0)];

        let check = s
            .func
            .blocks
            .iter()
            .find(|bl| matches!(bl.terminator, MirTerminator::Branch { .. }))
            .unwrap()
            .id;
        let step = s
            .func
            .blocks
            .iter()
            .filter(|bl| bl.id != s.func.entry_block)
            .find(|bl| {
                bl.statements
                    .iter()
                    .any(|st| matches!(st, MirStmt::Assign { dst: Place::Local(l), .. } if *l == i))
            })
            .unwrap();

        assert_ne!(step.id, check);
        assert!(matches!(step.terminator, MirTerminator::Goto { target } if target == check));
        assert_ne!(s.sites[0].resume, check);
        assert_ne!(s.sites[0].resume, step.id);
    }

    #[test]
    fn finally_becomes_a_cleanup_region() {
        let mut b = BodyBuilder::new("guarded");
        let one = b.int(1);
        let p = b.produce(one);
        let body = b.block(|_| vec![p]);
        let log = log_stmt(&mut b);
        let fin = b.block(|_| vec![log]);
        let t = b.try_(body, vec![], Some(fin));
        let s = seg(&b.finish(vec![t]));

        assert_eq!(s.cleanups.len(), 1);
        assert_eq!(s.cleanups[0].name, "guarded__finally_0");
        assert_eq!(host_calls(&s.cleanups[0].func, "log"), 1);

        assert_eq!(s.regions.len(), 1);
        let region = &s.regions[0];
        assert_eq!(region.cleanup, Some(CleanupId(0)));
        assert!(region.covers(s.sites[0].resume));

        let callers = member_calls(&s.func, "guarded__finally_0");
        assert_eq!(callers.len(), 1);
        assert!(!region.covers(callers[0]));
        assert_eq!(s.states[callers[0].0 as usize].kind, StateKind::Cleanup);
    }

    #[test]
    fn break_through_finally_uses_trampoline() {
        let mut b = BodyBuilder::new("f");
        let brk = b.brk();
        let body = b.block(|_| vec![brk]);
        let log = log_stmt(&mut b);
        let fin = b.block(|_| vec![log]);
        let t = b.try_(body, vec![], Some(fin));
        let v = b.int(1);
        let p = b.produce(v);
        let loop_body = b.block(|_| vec![p, t]);
        let cond = b.bool(true);
        let w = b.while_(cond, loop_body);
        let s = seg(&b.finish(vec![w]));

        let exit = s
            .func
            .blocks
            .iter()
            .find_map(|bl| match bl.terminator {
                MirTerminator::Branch { else_block, .. } => Some(else_block),
                _ => None,
            })
            .unwrap();
        let callers = member_calls(&s.func, "f__finally_0");
        assert_eq!(callers.len(), 2);
        assert!(callers.iter().all(|c| !s.regions[0].covers(*c)));
        assert!(callers.iter().any(|c| matches!(
            s.func.block(*c).terminator,
            MirTerminator::Goto { target } if target == exit
        )));
    }

    #[test]
    fn return_inside_region_keeps_value_in_temp() {
        let mut b = BodyBuilder::new("f");
        b.set_async().set_return(Ty::Int);
        let op = b.call("fetch", vec![]);
        let w = b.wait(op);
        let r = b.ret(Some(w));
        let body = b.block(|_| vec![r]);
        let log = log_stmt(&mut b);
        let fin = b.block(|_| vec![log]);
        let t = b.try_(body, vec![], Some(fin));
        let s = seg(&b.finish(vec![t]));

        let tramp = member_calls(&s.func, "f__finally_0")
            .into_iter()
            .find(|c| matches!(s.func.block(*c).terminator, MirTerminator::Return { .. }))
            .unwrap();
        match &s.func.block(tramp).terminator {
            MirTerminator::Return { value: Some(MirOperand::Local(l)) } => {
                assert_eq!(s.info(*l).origin, SlotOrigin::Temporary);
            }
            other => panic!("unexpected terminator {:?}", other),
        }
    }

    #[test]
    fn catch_handlers_sit_outside_the_body() {
        let mut b = BodyBuilder::new("f");
        let v = b.int(1);
        let p = b.produce(v);
        let body = b.block(|_| vec![p]);
        let e = b.var("e", Ty::Error);
        let log = log_stmt(&mut b);
        let handler = b.block(|_| vec![log]);
        let yes = b.bool(true);
        let clause = b.catch(Some("IoError"), Some(e), Some(yes), handler);
        let log2 = log_stmt(&mut b);
        let fin = b.block(|_| vec![log2]);
        let t = b.try_(body, vec![clause], Some(fin));
        let s = seg(&b.finish(vec![t]));

        assert_eq!(s.regions.len(), 2);
        let outer = &s.regions[0];
        let inner = &s.regions[1];
        assert_eq!(inner.parent, Some(outer.id));
        assert!(outer.cleanup.is_some() && inner.cleanup.is_none());

        let h = &inner.handlers[0];
        assert_eq!(h.tag.as_deref(), Some("IoError"));
        assert_eq!(h.binding, Some(s.var_locals[&e]));
        let filter = h.filter.unwrap();
        assert!(!inner.covers(filter) && !inner.covers(h.entry));
        assert!(outer.covers(filter) && outer.covers(h.entry));
        assert!(matches!(s.func.block(filter).terminator, MirTerminator::EndFilter { .. }));
        assert_eq!(s.states[h.entry.0 as usize].kind, StateKind::Handler);
    }

    #[test]
    fn lock_releases_through_cleanup() {
        let mut b = BodyBuilder::new("f");
        let target = b.receiver();
        let log = log_stmt(&mut b);
        let body = b.block(|_| vec![log]);
        let l = b.lock(target, body);
        let v = b.int(1);
        let p = b.produce(v);
        let s = seg(&b.finish(vec![l, p]));

        assert_eq!(host_calls(&s.func, MONITOR_ENTER), 1);
        assert_eq!(host_calls(&s.cleanups[0].func, MONITOR_EXIT), 1);
        assert_eq!(member_calls(&s.func, "f__finally_0").len(), 1);
    }

    #[test]
    fn jumps_without_a_target() {
        let mut b = BodyBuilder::new("f");
        let brk = b.brk();
        assert_eq!(
            seg_err(&b.finish(vec![brk])),
            vec![LowerErrorKind::JumpOutsideLoop { keyword: "break" }]
        );

        let mut b = BodyBuilder::new("f");
        let v = b.int(1);
        let p = b.produce(v);
        let body = b.block(|_| vec![p]);
        let r = b.ret(None);
        let fin = b.block(|_| vec![r]);
        let t = b.try_(body, vec![], Some(fin));
        assert_eq!(seg_err(&b.finish(vec![t])), vec![LowerErrorKind::JumpOutOfFinally]);
    }

    #[test]
    fn captured_variables_live_in_cells() {
        let mut b = BodyBuilder::new("f");
        let zero = b.int(0);
        let (x, lx) = b.let_var("x", Ty::Int, zero);
        let rx = b.read(x);
        let c = b.closure(vec![x], rx);
        let (_, lc) = b.let_var("c", Ty::Closure, c);
        let v = b.int(1);
        let p = b.produce(v);
        let s = seg(&b.finish(vec![lx, lc, p]));

        let cell = s.var_locals[&x];
        assert!(matches!(s.locals[cell.0 as usize].ty, MirType::Cell(_)));
        assert!(s.func.blocks[0].statements.iter().any(|st| matches!(
            st,
            MirStmt::NewCell { dst: Place::Local(l), .. } if *l == cell
        )));
        assert_eq!(s.closures.len(), 1);
        assert_eq!(s.closures[0].name, "f__closure_0");
        assert!(s.closures[0].func.blocks[0].statements.iter().any(|st| matches!(
            st,
            MirStmt::Assign { rvalue: MirRValue::LoadCapture(0), .. }
        )));
    }

    #[test]
    fn closure_reading_uncaptured_variable() {
        let mut b = BodyBuilder::new("f");
        let zero = b.int(0);
        let (x, lx) = b.let_var("x", Ty::Int, zero);
        let rx = b.read(x);
        let c = b.closure(vec![], rx);
        let s1 = b.expr(c);
        let kinds = seg_err(&b.finish(vec![lx, s1]));
        assert_eq!(
            kinds,
            vec![LowerErrorKind::UncapturedVariable {
                var: x,
                name: "x".to_string()
            }]
        );
    }

    #[test]
    fn loop_header_capture_gets_fresh_cell() {
        let mut b = BodyBuilder::new("f");
        let for_stmt = b.for_loop(|b| {
            let zero = b.int(0);
            let (i, init) = b.let_var("i", Ty::Int, zero);
            let lhs = b.read(i);
            let three = b.int(3);
            let cond = b.binary(BinaryOp::Lt, lhs, three);
            let cur = b.read(i);
            let one = b.int(1);
            let next = b.binary(BinaryOp::Add, cur, one);
            let step = b.assign(i, next);
            let ri = b.read(i);
            let c = b.closure(vec![i], ri);
            let p = b.produce(c);
            let body = b.block(|_| vec![p]);
            ForParts {
                init: vec![init],
                cond: Some(cond),
                step: vec![step],
                body,
            }
        });
        let s = seg(&b.finish(vec![for_stmt]));
        let i = VarId(0);
        assert!(s.per_iteration.contains(&i));

        let cell = s.var_locals[&i];
        let fresh: Vec<_> = s
            .func
            .blocks
            .iter()
            .filter(|bl| {
                bl.statements
                    .iter()
                    .any(|st| matches!(st, MirStmt::NewCell { dst: Place::Local(l), .. } if *l == cell))
            })
            .map(|bl| bl.id)
            .collect();
        // Once in the init, once before each increment.
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn earlier_operand_spilled_before_wait() {
        let mut b = BodyBuilder::new("f");
        b.set_async();
        let one = b.int(1);
        let (x, lx) = b.let_var("x", Ty::Int, one);
        let rx = b.read(x);
        let op = b.call("fetch", vec![]);
        let w = b.wait(op);
        let sum = b.binary(BinaryOp::Add, rx, w);
        let s1 = b.expr(sum);
        let s = seg(&b.finish(vec![lx, s1]));

        let xl = s.var_locals[&x];
        let site = s.sites[0];
        assert!(s.func.block(site.state).statements.iter().any(|st| matches!(
            st,
            MirStmt::Assign { dst: Place::Local(t), rvalue: MirRValue::Use(MirOperand::Local(l)) }
                if *l == xl && *t != xl
        )));
        assert!(s.func.block(site.resume).statements.iter().any(|st| matches!(
            st,
            MirStmt::Assign { rvalue: MirRValue::AwaitResult(_), .. }
        )));
    }

    #[test]
    fn state_limit() {
        let mut b = BodyBuilder::new("numbers");
        let stmts: Vec<_> = (1..=3)
            .map(|n| {
                let v = b.int(n);
                b.produce(v)
            })
            .collect();
        let body = b.finish(stmts);
        let c = classify(&body).unwrap();
        let errors = segment(&body, &c, &LowerConfig::default().with_max_states(2)).unwrap_err();
        assert!(matches!(
            errors[0].kind,
            LowerErrorKind::TooManyStates { count: 4, limit: 2, .. }
        ));
    }
}
