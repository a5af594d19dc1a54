// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Resumable lowering - functions with suspension points to state machines.
//!
//! The pipeline runs once per function body:
//!
//! 1. [`classify`] finds the suspension points and the function's kind.
//! 2. [`segment`] cuts the body into states at every suspension point and
//!    control-flow join.
//! 3. [`capture`] decides which locals outlive a state.
//! 4. [`regions`] builds cleanup chains and exception tables.
//! 5. [`emit`] synthesizes the machine type and its step, dispose and
//!    kickoff functions.
//!
//! Plain functions come back unchanged. Diagnostics from any stage stop the
//! pipeline for that function only.

pub mod capture;
pub mod classify;
pub mod config;
pub mod descriptor;
pub mod emit;
pub mod error;
pub mod regions;
pub mod segment;

pub use classify::{classify, Classification};
pub use config::LowerConfig;
pub use descriptor::{
    CapturedSlot, CleanupBody, CleanupId, ClosureBody, FnKind, HandlerClause, NodeRef,
    ProtectedRegionDescriptor, RegionId, SlotInit, SlotOrigin, State, StateId, StateKind,
    StateMachineDescriptor, SuspensionId, SuspensionPoint, SuspensionSite, FINISHED,
};
pub use emit::{
    MachineField, MachineType, StateMachineLowering, STATUS_DONE, STATUS_PENDING, STATUS_YIELDED,
};
pub use error::{ForbiddenRegion, LowerError, LowerErrorKind, LowerWarning, PointKind};

use coil_ast::FnBody;
use tracing::{debug, debug_span};

/// Outcome of lowering one function.
#[derive(Debug, Clone)]
pub enum Lowered {
    /// No suspension points; the body needs no rewriting.
    Plain,
    StateMachine(Box<StateMachineLowering>),
}

impl Lowered {
    pub fn kind(&self) -> FnKind {
        match self {
            Lowered::Plain => FnKind::Plain,
            Lowered::StateMachine(m) => m.descriptor.kind,
        }
    }

    pub fn state_machine(&self) -> Option<&StateMachineLowering> {
        match self {
            Lowered::Plain => None,
            Lowered::StateMachine(m) => Some(m),
        }
    }
}

pub fn lower_function(body: &FnBody, config: &LowerConfig) -> Result<Lowered, Vec<LowerError>> {
    let _span = debug_span!("lower_function", function = %body.name).entered();

    let classification = classify(body)?;
    if classification.kind == FnKind::Plain {
        debug!("no suspension points");
        return Ok(Lowered::Plain);
    }

    let seg = segment::segment(body, &classification, config)?;
    let captures = capture::analyze(body, &seg, config)?;
    let plan = regions::rewrite(&seg, &captures);

    let descriptor = StateMachineDescriptor {
        name: body.name.clone(),
        kind: classification.kind,
        span: body.span,
        body: seg.func,
        states: seg.states,
        points: classification.points,
        sites: seg.sites,
        slots: captures.slots.clone(),
        regions: plan.descriptors.clone(),
        cleanups: seg
            .cleanups
            .into_iter()
            .map(|c| CleanupBody {
                id: c.id,
                name: c.name,
                func: c.func,
            })
            .collect(),
        closures: seg.closures,
        params: body.params.clone(),
        receiver: body.receiver.clone(),
    };

    let lowering = emit::emit(descriptor, &captures, &plan, classification.warnings);
    Ok(Lowered::StateMachine(Box::new(lowering)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coil_ast::{BodyBuilder, Ty};

    #[test]
    fn plain_function_is_left_alone() {
        let mut b = BodyBuilder::new("add");
        let x = b.param("x", Ty::Int);
        let rx = b.read(x);
        let one = b.int(1);
        let sum = b.binary(coil_ast::BinaryOp::Add, rx, one);
        let r = b.ret(Some(sum));
        let lowered = lower_function(&b.finish(vec![r]), &LowerConfig::default()).unwrap();
        assert!(matches!(lowered, Lowered::Plain));
        assert_eq!(lowered.kind(), FnKind::Plain);
    }

    #[test]
    fn async_without_wait_still_lowers_with_warning() {
        let mut b = BodyBuilder::new("ready");
        b.set_async();
        let one = b.int(1);
        let r = b.ret(Some(one));
        let lowered = lower_function(&b.finish(vec![r]), &LowerConfig::default()).unwrap();
        let m = lowered.state_machine().unwrap();
        assert_eq!(m.descriptor.kind, FnKind::AsyncFunction);
        assert!(matches!(m.warnings[..], [LowerWarning::AsyncWithoutWait { .. }]));
    }

    #[test]
    fn diagnostics_stop_the_pipeline() {
        let mut b = BodyBuilder::new("bad");
        let one = b.int(1);
        let p = b.produce(one);
        let two = b.int(2);
        let r = b.ret(Some(two));
        let errors = lower_function(&b.finish(vec![p, r]), &LowerConfig::default()).unwrap_err();
        assert_eq!(errors[0].kind, LowerErrorKind::ReturnValueInGenerator);
    }

    #[test]
    fn descriptor_is_complete() {
        let mut b = BodyBuilder::new("pairs");
        b.set_receiver(Ty::Object("Source".into()));
        let n = b.param("n", Ty::Int);
        let rn = b.read(n);
        let p = b.produce(rn);
        let lowered = lower_function(&b.finish(vec![p]), &LowerConfig::default()).unwrap();
        let m = lowered.state_machine().unwrap();
        let d = &m.descriptor;
        assert_eq!(d.kind, FnKind::Generator);
        assert_eq!(d.points.len(), 1);
        assert_eq!(d.sites.len(), 1);
        assert_eq!(d.states[0].kind, StateKind::Entry);
        assert_eq!(d.slots[0].origin, SlotOrigin::Receiver);
        assert_eq!(m.machine.receiver_field, Some(d.slots[0].field));
        assert_eq!(m.machine.name, "pairs__machine");
        assert_eq!(m.step.name, "pairs__step");
        assert_eq!(m.dispose.name, "pairs__dispose");
    }
}
