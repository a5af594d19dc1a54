// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! State machine emitter.
//!
//! Produces the functions that replace a suspending body:
//!
//! - `<name>__step` runs the object from its current state to the next
//!   suspension or to the end, and returns a status code.
//! - `<name>__dispose` runs the cleanup chain of the state the object is
//!   paused in and marks it finished.
//! - `<name>__finally_<k>` cleanup bodies and `<name>__closure_<k>` closure
//!   bodies, rewritten to reach captured locals through the object.
//! - `<name>`, the kickoff, which allocates the object and hands it out.

use std::collections::HashMap;

use indexmap::IndexMap;
use tracing::{debug, debug_span};

use super::capture::CaptureResult;
use super::descriptor::{CleanupId, FnKind, SlotInit, StateMachineDescriptor, FINISHED};
use super::error::LowerWarning;
use super::regions::RegionPlan;
use crate::{
    BlockBuilder, BlockId, ExceptionRegion, FieldId, FunctionRef, LocalId, MirBlock, MirConst,
    MirFunction, MirLocal, MirOperand, MirRValue, MirStmt, MirTerminator, MirType, Place,
    SuspendKind,
};

/// `step` ran to the end of the body.
pub const STATUS_DONE: i64 = 0;
/// `step` stopped at a produce; the value is in `current`.
pub const STATUS_YIELDED: i64 = 1;
/// `step` stopped at a wait; the awaited operation is in `awaiting`.
pub const STATUS_PENDING: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct MachineField {
    pub id: FieldId,
    pub name: String,
    pub ty: MirType,
    /// Value the field holds before the first step.
    pub default: MirConst,
    pub per_iteration: bool,
}

/// Layout of the resumable type synthesized for one function.
#[derive(Debug, Clone)]
pub struct MachineType {
    pub name: String,
    pub kind: FnKind,
    pub fields: Vec<MachineField>,
    pub receiver_field: Option<FieldId>,
    /// Filled from the kickoff's arguments, in parameter order.
    pub param_fields: Vec<FieldId>,
    pub step: String,
    pub dispose: String,
}

impl MachineType {
    /// Slots every object of this type carries besides its fields.
    pub fn builtin_slots(&self) -> Vec<&'static str> {
        let mut slots = vec!["state", "disposed"];
        if self.kind.produces() {
            slots.push("current");
        }
        if self.kind.is_async() {
            slots.extend(["awaiting", "result", "fault"]);
        }
        slots
    }

    pub fn field(&self, id: FieldId) -> Option<&MachineField> {
        self.fields.get(id.0 as usize)
    }
}

/// Everything produced for a function that needed a state machine.
#[derive(Debug, Clone)]
pub struct StateMachineLowering {
    pub descriptor: StateMachineDescriptor,
    pub machine: MachineType,
    pub kickoff: MirFunction,
    pub step: MirFunction,
    pub dispose: MirFunction,
    pub cleanups: Vec<MirFunction>,
    pub closures: Vec<MirFunction>,
    pub warnings: Vec<LowerWarning>,
}

impl StateMachineLowering {
    /// Every emitted function, keyed by name.
    pub fn functions(&self) -> IndexMap<&str, &MirFunction> {
        let mut out = IndexMap::new();
        for f in [&self.kickoff, &self.step, &self.dispose]
            .into_iter()
            .chain(&self.cleanups)
            .chain(&self.closures)
        {
            out.insert(f.name.as_str(), f);
        }
        out
    }
}

pub fn emit(
    descriptor: StateMachineDescriptor,
    captures: &CaptureResult,
    plan: &RegionPlan,
    warnings: Vec<LowerWarning>,
) -> StateMachineLowering {
    let _span = debug_span!("emit", function = %descriptor.name).entered();
    let machine = machine_type(&descriptor, captures);
    let fields = &captures.field_of;

    let step = emit_step(&descriptor, &machine, fields, plan);
    let dispose = emit_dispose(&descriptor, &machine, plan);
    let cleanups = descriptor
        .cleanups
        .iter()
        .map(|c| {
            let mut func = rewrite_fields(&c.func, fields);
            func.exception_table = plan.cleanup_tables.get(&c.id).cloned().unwrap_or_default();
            func
        })
        .collect();
    let closures = descriptor.closures.iter().map(|c| c.func.clone()).collect();
    let kickoff = emit_kickoff(&descriptor, &machine);

    debug!(
        machine = %machine.name,
        fields = machine.fields.len(),
        blocks = step.blocks.len(),
        "emitted state machine"
    );
    StateMachineLowering {
        descriptor,
        machine,
        kickoff,
        step,
        dispose,
        cleanups,
        closures,
        warnings,
    }
}

fn machine_type(descriptor: &StateMachineDescriptor, captures: &CaptureResult) -> MachineType {
    let fields = descriptor
        .slots
        .iter()
        .map(|s| MachineField {
            id: s.field,
            name: s.name.clone(),
            ty: s.ty.clone(),
            default: s.ty.default_const(),
            per_iteration: s.per_iteration,
        })
        .collect();
    let mut params: Vec<(u32, FieldId)> = descriptor
        .slots
        .iter()
        .filter_map(|s| match s.init {
            SlotInit::Param(i) => Some((i, s.field)),
            _ => None,
        })
        .collect();
    params.sort();
    MachineType {
        name: format!("{}__machine", descriptor.name),
        kind: descriptor.kind,
        fields,
        receiver_field: captures.receiver_field,
        param_fields: params.into_iter().map(|(_, f)| f).collect(),
        step: format!("{}__step", descriptor.name),
        dispose: format!("{}__dispose", descriptor.name),
    }
}

// -- Field rewriting ----------------------------------------------------------

fn map_operand(op: &mut MirOperand, fields: &HashMap<LocalId, FieldId>) {
    if let MirOperand::Local(l) = op {
        if let Some(f) = fields.get(l) {
            *op = MirOperand::Field(*f);
        }
    }
}

fn map_place(place: &mut Place, fields: &HashMap<LocalId, FieldId>) {
    if let Place::Local(l) = place {
        if let Some(f) = fields.get(l) {
            *place = Place::Field(*f);
        }
    }
}

fn map_rvalue(rvalue: &mut MirRValue, fields: &HashMap<LocalId, FieldId>) {
    match rvalue {
        MirRValue::Use(op)
        | MirRValue::UnaryOp { operand: op, .. }
        | MirRValue::MakeError { payload: op, .. }
        | MirRValue::LoadCell(op)
        | MirRValue::AwaitResult(op) => map_operand(op, fields),
        MirRValue::BinaryOp { left, right, .. } => {
            map_operand(left, fields);
            map_operand(right, fields);
        }
        MirRValue::NewMachine { args, .. } => args.iter_mut().for_each(|a| map_operand(a, fields)),
        MirRValue::Receiver | MirRValue::LoadCapture(_) | MirRValue::LoadState => {}
    }
}

fn map_stmt(stmt: &mut MirStmt, fields: &HashMap<LocalId, FieldId>) {
    match stmt {
        MirStmt::Assign { dst, rvalue } => {
            map_place(dst, fields);
            map_rvalue(rvalue, fields);
        }
        MirStmt::Call { dst, args, .. } => {
            if let Some(d) = dst {
                map_place(d, fields);
            }
            args.iter_mut().for_each(|a| map_operand(a, fields));
        }
        MirStmt::NewCell { dst, init } => {
            map_place(dst, fields);
            map_operand(init, fields);
        }
        MirStmt::StoreCell { cell, value } => {
            map_operand(cell, fields);
            map_operand(value, fields);
        }
        MirStmt::ClosureCreate { dst, captures, .. } => {
            map_place(dst, fields);
            captures.iter_mut().for_each(|c| map_operand(c, fields));
        }
        MirStmt::ClosureCall { dst, closure } => {
            if let Some(d) = dst {
                map_place(d, fields);
            }
            map_operand(closure, fields);
        }
        MirStmt::SetCurrent(op) | MirStmt::SetResult(op) | MirStmt::AwaitOn(op) => {
            map_operand(op, fields)
        }
        MirStmt::StartMachine { dst, machine } => {
            map_place(dst, fields);
            map_operand(machine, fields);
        }
        MirStmt::SetState(_) => {}
    }
}

fn map_terminator(term: &mut MirTerminator, fields: &HashMap<LocalId, FieldId>) {
    match term {
        MirTerminator::Return { value: Some(op) }
        | MirTerminator::Branch { cond: op, .. }
        | MirTerminator::Switch { value: op, .. }
        | MirTerminator::Throw { value: op }
        | MirTerminator::EndFilter { accept: op }
        | MirTerminator::Suspend { kind: SuspendKind::Produce { value: op }, .. }
        | MirTerminator::Suspend { kind: SuspendKind::Wait { awaiter: op }, .. } => {
            map_operand(op, fields)
        }
        MirTerminator::Return { value: None }
        | MirTerminator::Goto { .. }
        | MirTerminator::Unreachable => {}
    }
}

/// Copy of `func` with captured locals turned into field accesses.
fn rewrite_fields(func: &MirFunction, fields: &HashMap<LocalId, FieldId>) -> MirFunction {
    let mut out = func.clone();
    for block in &mut out.blocks {
        block.statements.iter_mut().for_each(|s| map_stmt(s, fields));
        map_terminator(&mut block.terminator, fields);
    }
    out.locals.retain(|l| !fields.contains_key(&l.id));
    out.params.clear();
    out
}

// -- Step ---------------------------------------------------------------------

fn emit_step(
    descriptor: &StateMachineDescriptor,
    machine: &MachineType,
    fields: &HashMap<LocalId, FieldId>,
    plan: &RegionPlan,
) -> MirFunction {
    let mut func = rewrite_fields(&descriptor.body, fields);
    func.name = machine.step.clone();
    func.ret_ty = MirType::I64;

    for block in &mut func.blocks {
        let term = std::mem::replace(&mut block.terminator, MirTerminator::Unreachable);
        block.terminator = match term {
            MirTerminator::Suspend { kind: SuspendKind::Produce { value }, resume } => {
                block.statements.push(MirStmt::SetCurrent(value));
                block.statements.push(MirStmt::SetState(resume.0 as i64));
                status(STATUS_YIELDED)
            }
            MirTerminator::Suspend { kind: SuspendKind::Wait { awaiter }, resume } => {
                block.statements.push(MirStmt::SetState(resume.0 as i64));
                block.statements.push(MirStmt::AwaitOn(awaiter));
                status(STATUS_PENDING)
            }
            MirTerminator::Return { value } => {
                block.statements.push(MirStmt::SetState(FINISHED));
                if descriptor.kind == FnKind::AsyncFunction {
                    block
                        .statements
                        .push(MirStmt::SetResult(value.unwrap_or_else(MirOperand::unit)));
                }
                status(STATUS_DONE)
            }
            other => other,
        };
    }

    // Dispatch on the stored state.
    let state = LocalId(func.local_capacity().max(descriptor.body.local_capacity()) as u32);
    func.locals.push(MirLocal {
        id: state,
        name: Some("state".to_string()),
        ty: MirType::I64,
        is_param: false,
    });
    let dispatch = BlockId(func.blocks.len() as u32);
    let done = BlockId(dispatch.0 + 1);
    let mut cases = vec![(0, descriptor.body.entry_block)];
    cases.extend(descriptor.resume_states().map(|s| (s.0 as i64, s)));
    func.blocks.push(MirBlock {
        id: dispatch,
        statements: vec![MirStmt::Assign {
            dst: Place::Local(state),
            rvalue: MirRValue::LoadState,
        }],
        terminator: MirTerminator::Switch {
            value: MirOperand::Local(state),
            cases,
            default: done,
        },
    });
    func.blocks.push(MirBlock {
        id: done,
        statements: Vec::new(),
        terminator: status(STATUS_DONE),
    });
    func.entry_block = dispatch;
    func.exception_table = plan.step_table.clone();
    func
}

fn status(code: i64) -> MirTerminator {
    MirTerminator::Return {
        value: Some(MirOperand::int(code)),
    }
}

// -- Dispose ------------------------------------------------------------------

fn emit_dispose(
    descriptor: &StateMachineDescriptor,
    machine: &MachineType,
    plan: &RegionPlan,
) -> MirFunction {
    let names: HashMap<CleanupId, &str> = descriptor
        .cleanups
        .iter()
        .map(|c| (c.id, c.name.as_str()))
        .collect();

    let mut b = BlockBuilder::new(machine.dispose.clone(), MirType::Void);
    let state = b.alloc_local("state".to_string(), MirType::I64);
    b.push_stmt(MirStmt::Assign {
        dst: Place::Local(state),
        rvalue: MirRValue::LoadState,
    });
    let done = b.create_block();

    let mut chain_entries: HashMap<Vec<CleanupId>, BlockId> = HashMap::new();
    let mut cases = Vec::new();
    let mut regions = Vec::new();
    for (resume, chain) in &plan.dispose_plan {
        if let Some(entry) = chain_entries.get(chain) {
            cases.push((resume.0 as i64, *entry));
            continue;
        }
        // One block per cleanup. Block i is covered by a region whose
        // cleanup is chain[i + 1], so a throw from cleanup i still runs the
        // ones after it.
        let blocks: Vec<BlockId> = chain.iter().map(|_| b.create_block()).collect();
        for (i, cleanup) in chain.iter().enumerate() {
            b.switch_to_block(blocks[i]);
            if i == 0 {
                b.push_stmt(MirStmt::SetState(FINISHED));
            }
            b.push_stmt(MirStmt::Call {
                dst: None,
                func: FunctionRef::member(names.get(cleanup).copied().unwrap_or_default()),
                args: Vec::new(),
            });
            let next = blocks.get(i + 1).copied().unwrap_or(done);
            b.terminate(MirTerminator::Goto { target: next });
        }
        for (i, next) in chain.iter().enumerate().skip(1) {
            regions.push(ExceptionRegion {
                start: blocks[0],
                end: BlockId(blocks[i - 1].0 + 1),
                handlers: Vec::new(),
                cleanup: names.get(next).map(|n| n.to_string()),
            });
        }
        if let Some(first) = blocks.first() {
            chain_entries.insert(chain.clone(), *first);
            cases.push((resume.0 as i64, *first));
        }
    }

    b.switch_to_block(BlockId(0));
    b.terminate(MirTerminator::Switch {
        value: MirOperand::Local(state),
        cases,
        default: done,
    });
    b.switch_to_block(done);
    b.push_stmt(MirStmt::SetState(FINISHED));
    b.terminate(MirTerminator::Return { value: None });

    for region in regions {
        b.add_region(region);
    }
    b.finish()
}

// -- Kickoff ------------------------------------------------------------------

fn emit_kickoff(descriptor: &StateMachineDescriptor, machine: &MachineType) -> MirFunction {
    let ret_ty = match descriptor.kind {
        FnKind::AsyncFunction => MirType::Operation,
        _ => MirType::Machine(machine.name.clone()),
    };
    let mut b = BlockBuilder::new(descriptor.name.clone(), ret_ty);
    let params: Vec<LocalId> = descriptor
        .body
        .params
        .iter()
        .map(|p| b.add_param(p.name.clone().unwrap_or_default(), p.ty.clone()))
        .collect();

    let mut args = Vec::with_capacity(params.len() + 1);
    if machine.receiver_field.is_some() {
        let this = b.alloc_temp(MirType::Any);
        b.push_stmt(MirStmt::Assign {
            dst: Place::Local(this),
            rvalue: MirRValue::Receiver,
        });
        args.push(MirOperand::Local(this));
    }
    args.extend(params.into_iter().map(MirOperand::Local));

    let object = b.alloc_temp(MirType::Machine(machine.name.clone()));
    b.push_stmt(MirStmt::Assign {
        dst: Place::Local(object),
        rvalue: MirRValue::NewMachine {
            machine: machine.name.clone(),
            args,
        },
    });
    match descriptor.kind {
        FnKind::AsyncFunction => {
            let completion = b.alloc_temp(MirType::Operation);
            b.push_stmt(MirStmt::StartMachine {
                dst: Place::Local(completion),
                machine: MirOperand::Local(object),
            });
            b.terminate(MirTerminator::Return {
                value: Some(MirOperand::Local(completion)),
            });
        }
        _ => b.terminate(MirTerminator::Return {
            value: Some(MirOperand::Local(object)),
        }),
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{lower_function, LowerConfig, Lowered};
    use coil_ast::{BodyBuilder, FnBody, Ty};

    fn lower(body: &FnBody) -> StateMachineLowering {
        match lower_function(body, &LowerConfig::default()).unwrap() {
            Lowered::StateMachine(m) => *m,
            Lowered::Plain => panic!("expected a state machine"),
        }
    }

    fn numbers() -> FnBody {
        let mut b = BodyBuilder::new("numbers");
        let stmts: Vec<_> = (1..=3)
            .map(|n| {
                let v = b.int(n);
                b.produce(v)
            })
            .collect();
        b.finish(stmts)
    }

    #[test]
    fn step_dispatches_on_state() {
        let m = lower(&numbers());
        let entry = m.step.block(m.step.entry_block);
        assert!(matches!(
            entry.statements[0],
            MirStmt::Assign { rvalue: MirRValue::LoadState, .. }
        ));
        match &entry.terminator {
            MirTerminator::Switch { cases, .. } => {
                let states: Vec<i64> = cases.iter().map(|(s, _)| *s).collect();
                assert_eq!(states, vec![0, 1, 2, 3]);
            }
            other => panic!("unexpected terminator {:?}", other),
        }
    }

    #[test]
    fn produce_exposes_value_and_yields() {
        let m = lower(&numbers());
        let block = m.step.block(BlockId(0));
        assert_eq!(
            block.statements,
            vec![
                MirStmt::SetCurrent(MirOperand::int(1)),
                MirStmt::SetState(1),
            ]
        );
        assert_eq!(block.terminator, status(STATUS_YIELDED));
        let last = m.step.block(BlockId(3));
        assert_eq!(last.statements, vec![MirStmt::SetState(FINISHED)]);
        assert_eq!(last.terminator, status(STATUS_DONE));
        assert!(m
            .step
            .blocks
            .iter()
            .all(|b| !matches!(b.terminator, MirTerminator::Suspend { .. })));
    }

    #[test]
    fn async_function_publishes_result() {
        let mut b = BodyBuilder::new("fetch_twice");
        b.set_async().set_return(Ty::Int);
        let op = b.call("fetch", vec![]);
        let w = b.wait(op);
        let r = b.ret(Some(w));
        let m = lower(&b.finish(vec![r]));

        assert_eq!(m.machine.builtin_slots(), vec!["state", "disposed", "awaiting", "result", "fault"]);
        let resume = m.descriptor.sites[0].resume;
        let suspended = m.step.block(m.descriptor.sites[0].state);
        assert_eq!(suspended.terminator, status(STATUS_PENDING));
        assert!(suspended.statements.contains(&MirStmt::SetState(resume.0 as i64)));
        assert!(m.step.block(resume).statements.iter().any(|s| matches!(s, MirStmt::SetResult(_))));

        assert_eq!(m.kickoff.name, "fetch_twice");
        assert!(m.kickoff.blocks[0]
            .statements
            .iter()
            .any(|s| matches!(s, MirStmt::StartMachine { .. })));
        assert_eq!(m.kickoff.ret_ty, MirType::Operation);
    }

    #[test]
    fn captured_locals_become_fields() {
        let mut b = BodyBuilder::new("f");
        let n = b.param("n", Ty::Int);
        let rn = b.read(n);
        let p = b.produce(rn);
        let rn2 = b.read(n);
        let p2 = b.produce(rn2);
        let m = lower(&b.finish(vec![p, p2]));

        assert_eq!(m.machine.param_fields, vec![FieldId(0)]);
        assert_eq!(m.machine.fields[0].name, "n");
        assert!(m.step.params.is_empty());
        let resume = m.descriptor.sites[0].resume;
        assert!(m
            .step
            .block(resume)
            .statements
            .contains(&MirStmt::SetCurrent(MirOperand::Field(FieldId(0)))));
        assert_eq!(m.kickoff.params.len(), 1);
    }

    #[test]
    fn dispose_runs_chain_for_paused_state() {
        let mut b = BodyBuilder::new("g");
        let one = b.int(1);
        let p = b.produce(one);
        let body = b.block(|_| vec![p]);
        let log = b.call("log", vec![]);
        let ls = b.expr(log);
        let fin = b.block(|_| vec![ls]);
        let t = b.try_(body, vec![], Some(fin));
        let m = lower(&b.finish(vec![t]));

        let resume = m.descriptor.sites[0].resume;
        let target = match &m.dispose.block(BlockId(0)).terminator {
            MirTerminator::Switch { cases, .. } => {
                assert_eq!(cases.len(), 1);
                assert_eq!(cases[0].0, resume.0 as i64);
                cases[0].1
            }
            other => panic!("unexpected terminator {:?}", other),
        };
        let chain = m.dispose.block(target);
        assert_eq!(chain.statements[0], MirStmt::SetState(FINISHED));
        assert!(matches!(
            &chain.statements[1],
            MirStmt::Call { func, .. } if func.is_member && func.name == "g__finally_0"
        ));
        assert_eq!(m.cleanups.len(), 1);
        assert_eq!(m.functions().len(), 4);
    }

    #[test]
    fn dispose_guards_later_cleanups() {
        let mut b = BodyBuilder::new("g");
        let one = b.int(1);
        let p = b.produce(one);
        let inner_body = b.block(|_| vec![p]);
        let log = b.call("log", vec![]);
        let ls = b.expr(log);
        let inner_fin = b.block(|_| vec![ls]);
        let inner = b.try_(inner_body, vec![], Some(inner_fin));
        let outer_body = b.block(|_| vec![inner]);
        let log2 = b.call("log", vec![]);
        let ls2 = b.expr(log2);
        let outer_fin = b.block(|_| vec![ls2]);
        let outer = b.try_(outer_body, vec![], Some(outer_fin));
        let m = lower(&b.finish(vec![outer]));

        assert_eq!(m.dispose.exception_table.len(), 1);
        assert_eq!(
            m.dispose.exception_table[0].cleanup.as_deref(),
            Some("g__finally_0")
        );
    }
}
