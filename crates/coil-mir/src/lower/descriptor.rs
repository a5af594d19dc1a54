// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Data model shared by the lowering stages.
//!
//! A [`StateMachineDescriptor`] is assembled once per qualifying function
//! from the classifier, segmenter, capture analyzer and region rewriter,
//! then handed to the emitter.

use std::fmt;
use std::ops::Range;

use coil_ast::{ExprId, ScopeId, Span, StmtId, Ty, VarId};

use super::error::PointKind;
use crate::{BlockId, FieldId, LocalId, MirFunction, MirType};

/// Classification of a function body by the suspension points it contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnKind {
    Plain,
    Generator,
    AsyncFunction,
    AsyncGenerator,
}

impl FnKind {
    /// Pulled by a consumer one value at a time.
    pub fn produces(self) -> bool {
        matches!(self, FnKind::Generator | FnKind::AsyncGenerator)
    }

    pub fn is_async(self) -> bool {
        matches!(self, FnKind::AsyncFunction | FnKind::AsyncGenerator)
    }
}

impl fmt::Display for FnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FnKind::Plain => "plain",
            FnKind::Generator => "generator",
            FnKind::AsyncFunction => "async function",
            FnKind::AsyncGenerator => "async generator",
        };
        write!(f, "{}", s)
    }
}

/// A state is the basic block implementing it in the segmented body.
pub type StateId = BlockId;

/// State index of a machine that will never run again.
pub const FINISHED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuspensionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupId(pub u32);

/// Syntax node carrying a suspension marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Stmt(StmtId),
    Expr(ExprId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuspensionPoint {
    pub id: SuspensionId,
    pub kind: PointKind,
    pub node: NodeRef,
    pub span: Span,
    /// Enclosing `try`/`lock` statements, outermost first.
    pub protected: Vec<StmtId>,
}

/// Where the segmenter placed a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspensionSite {
    pub point: SuspensionId,
    /// State ending in the suspension.
    pub state: StateId,
    /// State the machine continues in when stepped again.
    pub resume: StateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Entry,
    Body,
    Resume(SuspensionId),
    Handler,
    Filter,
    /// Runs a region's cleanup on a jump leaving the region.
    Cleanup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: StateId,
    pub kind: StateKind,
    pub successors: Vec<StateId>,
    /// Innermost region covering this state.
    pub region: Option<RegionId>,
    pub is_cleanup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    Receiver,
    Param(u32),
    Variable(VarId),
    Temporary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotInit {
    Receiver,
    Param(u32),
    /// Type default, assigned when the object is created.
    Default,
}

/// A local promoted to a field of the state object.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedSlot {
    pub field: FieldId,
    /// Local in the segmented body; `None` for the receiver.
    pub local: Option<LocalId>,
    pub name: String,
    pub ty: MirType,
    /// Declared type, for variables and parameters.
    pub declared: Option<Ty>,
    pub scope: ScopeId,
    pub origin: SlotOrigin,
    pub init: SlotInit,
    /// Gets a fresh cell each loop iteration.
    pub per_iteration: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerClause {
    pub tag: Option<String>,
    pub filter: Option<StateId>,
    pub binding: Option<LocalId>,
    pub entry: StateId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedRegionDescriptor {
    pub id: RegionId,
    pub parent: Option<RegionId>,
    /// Covered states, as block ids.
    pub covered: Range<u32>,
    pub handlers: Vec<HandlerClause>,
    pub cleanup: Option<CleanupId>,
    /// Cleanups to run when leaving this region and every enclosing one,
    /// innermost first.
    pub cleanup_chain: Vec<CleanupId>,
    /// Some covered state is a resume state.
    pub spans_boundary: bool,
    pub span: Span,
}

impl ProtectedRegionDescriptor {
    pub fn covers(&self, state: StateId) -> bool {
        self.covered.contains(&state.0)
    }
}

/// A finally body lowered to its own suspension-free function.
#[derive(Debug, Clone)]
pub struct CleanupBody {
    pub id: CleanupId,
    pub name: String,
    pub func: MirFunction,
}

/// Closure body lowered to a function over its environment.
#[derive(Debug, Clone)]
pub struct ClosureBody {
    pub name: String,
    pub func: MirFunction,
}

/// Everything the emitter needs to synthesize one state machine.
#[derive(Debug, Clone)]
pub struct StateMachineDescriptor {
    pub name: String,
    pub kind: FnKind,
    pub span: Span,
    /// Segmented body; block `i` implements state `i`.
    pub body: MirFunction,
    pub states: Vec<State>,
    pub points: Vec<SuspensionPoint>,
    pub sites: Vec<SuspensionSite>,
    pub slots: Vec<CapturedSlot>,
    pub regions: Vec<ProtectedRegionDescriptor>,
    pub cleanups: Vec<CleanupBody>,
    pub closures: Vec<ClosureBody>,
    pub params: Vec<VarId>,
    pub receiver: Option<Ty>,
}

impl StateMachineDescriptor {
    pub fn slot_for_local(&self, local: LocalId) -> Option<&CapturedSlot> {
        self.slots.iter().find(|s| s.local == Some(local))
    }

    /// States a suspended machine can be resumed in.
    pub fn resume_states(&self) -> impl Iterator<Item = StateId> + '_ {
        self.sites.iter().map(|s| s.resume)
    }

    /// Innermost region with a cleanup covering `state`.
    pub fn cleanup_region_at(&self, state: StateId) -> Option<&ProtectedRegionDescriptor> {
        self.regions
            .iter()
            .filter(|r| r.cleanup.is_some() && r.covers(state))
            .min_by_key(|r| r.covered.len())
    }
}
