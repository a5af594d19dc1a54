// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Capture analyzer.
//!
//! Decides which locals of the segmented body must survive a suspension
//! and therefore live in the state object. A local is captured when it is
//! live on entry to some resume state, when it is a parameter, or when a
//! cleanup function shares it with the body.

use std::collections::{HashMap, HashSet};

use coil_ast::FnBody;
use tracing::{debug, trace};

use super::config::LowerConfig;
use super::descriptor::{CapturedSlot, SlotInit, SlotOrigin};
use super::error::LowerError;
use super::segment::{RawRegion, SegmentedBody};
use crate::{
    BlockId, FieldId, LocalId, MirFunction, MirOperand, MirRValue, MirStmt, MirTerminator,
    MirType, Place, SuspendKind,
};

/// Result of capture analysis.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Field layout, receiver first, then parameters, variables and
    /// temporaries.
    pub slots: Vec<CapturedSlot>,
    pub field_of: HashMap<LocalId, FieldId>,
    pub receiver_field: Option<FieldId>,
    /// Locals live on entry to each block of the body.
    pub live_in: HashMap<BlockId, HashSet<LocalId>>,
}

impl CaptureResult {
    pub fn is_captured(&self, local: LocalId) -> bool {
        self.field_of.contains_key(&local)
    }
}

pub fn analyze(
    body: &FnBody,
    seg: &SegmentedBody,
    config: &LowerConfig,
) -> Result<CaptureResult, Vec<LowerError>> {
    let live_in = liveness(&seg.func, &seg.regions);

    let mut captured: HashSet<LocalId> = HashSet::new();
    for site in &seg.sites {
        if let Some(live) = live_in.get(&site.resume) {
            captured.extend(live.iter().copied());
        }
    }
    captured.extend(seg.func.params.iter().map(|p| p.id));

    // Cleanups run in their own frames and reach shared locals through
    // the state object.
    let body_locals = referenced_locals(&seg.func);
    let cleanup_locals: Vec<HashSet<LocalId>> =
        seg.cleanups.iter().map(|c| referenced_locals(&c.func)).collect();
    for (i, locals) in cleanup_locals.iter().enumerate() {
        for local in locals {
            let elsewhere = body_locals.contains(local)
                || cleanup_locals
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && other.contains(local));
            if elsewhere {
                captured.insert(*local);
            }
        }
    }

    if config.hoist_all_locals {
        captured.extend(body_locals.iter().copied().filter(|l| {
            matches!(seg.info(*l).origin, SlotOrigin::Variable(v) if body.var(v).ty.is_storable())
        }));
    }

    let mut errors = Vec::new();
    let mut slots = Vec::new();
    let mut receiver_field = None;

    if let Some(receiver) = &body.receiver {
        if !receiver.is_storable() {
            errors.push(LowerError::unstorable("this".to_string(), receiver.clone(), body.span));
        }
        let field = FieldId(0);
        receiver_field = Some(field);
        slots.push(CapturedSlot {
            field,
            local: None,
            name: "this".to_string(),
            ty: MirType::from(receiver),
            declared: Some(receiver.clone()),
            scope: body.root_scope(),
            origin: SlotOrigin::Receiver,
            init: SlotInit::Receiver,
            per_iteration: false,
        });
    }

    let mut ordered: Vec<LocalId> = captured.into_iter().collect();
    ordered.sort_by_key(|l| (slot_rank(seg.info(*l).origin), *l));

    let mut field_of = HashMap::new();
    for local in ordered {
        let info = seg.info(local);
        let decl = match info.origin {
            SlotOrigin::Param(i) => Some(body.var(body.params[i as usize])),
            SlotOrigin::Variable(v) => Some(body.var(v)),
            SlotOrigin::Receiver | SlotOrigin::Temporary => None,
        };
        if let Some(decl) = decl {
            if !decl.ty.is_storable() {
                errors.push(LowerError::unstorable(decl.name.clone(), decl.ty.clone(), decl.span));
                continue;
            }
        }

        let field = FieldId(slots.len() as u32);
        let mir_local = &seg.locals[local.0 as usize];
        let name = match &mir_local.name {
            Some(n) => n.clone(),
            None => format!("<t{}>", local.0),
        };
        let per_iteration =
            matches!(info.origin, SlotOrigin::Variable(v) if seg.per_iteration.contains(&v));
        trace!(local = local.0, field = field.0, %name, "captured");
        slots.push(CapturedSlot {
            field,
            local: Some(local),
            name,
            ty: mir_local.ty.clone(),
            declared: decl.map(|d| d.ty.clone()),
            scope: info.scope,
            origin: info.origin,
            init: match info.origin {
                SlotOrigin::Param(i) => SlotInit::Param(i),
                _ => SlotInit::Default,
            },
            per_iteration,
        });
        field_of.insert(local, field);
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    debug!(function = %body.name, fields = slots.len(), "captures resolved");
    Ok(CaptureResult {
        slots,
        field_of,
        receiver_field,
        live_in,
    })
}

fn slot_rank(origin: SlotOrigin) -> (u8, u32) {
    match origin {
        SlotOrigin::Receiver => (0, 0),
        SlotOrigin::Param(i) => (1, i),
        SlotOrigin::Variable(v) => (2, v.0),
        SlotOrigin::Temporary => (3, 0),
    }
}

/// Backward liveness over normal and exceptional edges.
///
/// A block covered by a region flows into each handler's filter and entry,
/// minus the handler's binding, which the dispatcher writes.
pub fn liveness(func: &MirFunction, regions: &[RawRegion]) -> HashMap<BlockId, HashSet<LocalId>> {
    let mut live_in: HashMap<BlockId, HashSet<LocalId>> =
        func.blocks.iter().map(|b| (b.id, HashSet::new())).collect();

    let exceptional: HashMap<BlockId, Vec<(BlockId, Option<LocalId>)>> = func
        .blocks
        .iter()
        .map(|b| {
            let edges = regions
                .iter()
                .filter(|r| r.covers(b.id))
                .flat_map(|r| r.handlers.iter())
                .flat_map(|h| {
                    h.filter
                        .into_iter()
                        .chain(std::iter::once(h.entry))
                        .map(move |target| (target, h.binding))
                })
                .collect();
            (b.id, edges)
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for block in func.blocks.iter().rev() {
            let mut live: HashSet<LocalId> = HashSet::new();
            for succ in block.terminator.successors() {
                if let Some(s) = live_in.get(&succ) {
                    live.extend(s.iter().copied());
                }
            }
            for (target, binding) in &exceptional[&block.id] {
                if let Some(s) = live_in.get(target) {
                    live.extend(s.iter().copied().filter(|l| Some(*l) != *binding));
                }
            }

            for l in terminator_uses(&block.terminator) {
                live.insert(l);
            }
            for stmt in block.statements.iter().rev() {
                for d in stmt_defs(stmt) {
                    live.remove(&d);
                }
                live.extend(stmt_uses(stmt));
            }

            let entry = live_in.entry(block.id).or_default();
            if *entry != live {
                *entry = live;
                changed = true;
            }
        }
    }
    live_in
}

/// Every local a function mentions.
pub fn referenced_locals(func: &MirFunction) -> HashSet<LocalId> {
    let mut out = HashSet::new();
    for block in &func.blocks {
        for stmt in &block.statements {
            out.extend(stmt_defs(stmt));
            out.extend(stmt_uses(stmt));
        }
        out.extend(terminator_uses(&block.terminator));
    }
    out
}

fn place_local(place: &Place) -> Option<LocalId> {
    match place {
        Place::Local(id) => Some(*id),
        Place::Field(_) => None,
    }
}

fn operand_local(op: &MirOperand, out: &mut Vec<LocalId>) {
    if let Some(l) = op.as_local() {
        out.push(l);
    }
}

fn rvalue_uses(rvalue: &MirRValue, out: &mut Vec<LocalId>) {
    match rvalue {
        MirRValue::Use(op)
        | MirRValue::UnaryOp { operand: op, .. }
        | MirRValue::MakeError { payload: op, .. }
        | MirRValue::LoadCell(op)
        | MirRValue::AwaitResult(op) => operand_local(op, out),
        MirRValue::BinaryOp { left, right, .. } => {
            operand_local(left, out);
            operand_local(right, out);
        }
        MirRValue::NewMachine { args, .. } => args.iter().for_each(|a| operand_local(a, out)),
        MirRValue::Receiver | MirRValue::LoadCapture(_) | MirRValue::LoadState => {}
    }
}

/// Locals written by a statement.
pub fn stmt_defs(stmt: &MirStmt) -> Vec<LocalId> {
    match stmt {
        MirStmt::Assign { dst, .. }
        | MirStmt::NewCell { dst, .. }
        | MirStmt::ClosureCreate { dst, .. }
        | MirStmt::StartMachine { dst, .. } => place_local(dst).into_iter().collect(),
        MirStmt::Call { dst, .. } | MirStmt::ClosureCall { dst, .. } => {
            dst.as_ref().and_then(place_local).into_iter().collect()
        }
        MirStmt::StoreCell { .. }
        | MirStmt::SetState(_)
        | MirStmt::SetCurrent(_)
        | MirStmt::SetResult(_)
        | MirStmt::AwaitOn(_) => Vec::new(),
    }
}

/// Locals read by a statement. Storing into a cell reads the cell.
pub fn stmt_uses(stmt: &MirStmt) -> Vec<LocalId> {
    let mut out = Vec::new();
    match stmt {
        MirStmt::Assign { rvalue, .. } => rvalue_uses(rvalue, &mut out),
        MirStmt::Call { args, .. } => args.iter().for_each(|a| operand_local(a, &mut out)),
        MirStmt::NewCell { init, .. } => operand_local(init, &mut out),
        MirStmt::StoreCell { cell, value } => {
            operand_local(cell, &mut out);
            operand_local(value, &mut out);
        }
        MirStmt::ClosureCreate { captures, .. } => {
            captures.iter().for_each(|c| operand_local(c, &mut out))
        }
        MirStmt::ClosureCall { closure, .. } => operand_local(closure, &mut out),
        MirStmt::SetCurrent(op) | MirStmt::SetResult(op) | MirStmt::AwaitOn(op) => {
            operand_local(op, &mut out)
        }
        MirStmt::StartMachine { machine, .. } => operand_local(machine, &mut out),
        MirStmt::SetState(_) => {}
    }
    out
}

pub fn terminator_uses(term: &MirTerminator) -> Vec<LocalId> {
    let mut out = Vec::new();
    match term {
        MirTerminator::Return { value: Some(op) }
        | MirTerminator::Branch { cond: op, .. }
        | MirTerminator::Switch { value: op, .. }
        | MirTerminator::Throw { value: op }
        | MirTerminator::EndFilter { accept: op }
        | MirTerminator::Suspend { kind: SuspendKind::Produce { value: op }, .. }
        | MirTerminator::Suspend { kind: SuspendKind::Wait { awaiter: op }, .. } => {
            operand_local(op, &mut out)
        }
        MirTerminator::Return { value: None }
        | MirTerminator::Goto { .. }
        | MirTerminator::Unreachable => {}
    }
    out
}
