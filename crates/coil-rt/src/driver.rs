// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stepping and disposing state objects.
//!
//! `drive` runs one step and routes its status. A wait on a pending
//! operation registers a continuation that resumes the object on whichever
//! thread completes it; a wait on one that has already completed posts a
//! [`ResumeToken`] to the run queue, so the driver returns first either
//! way. Any other status completes the operation the step was run for.

use std::sync::Arc;

use tracing::{debug, trace};

use coil_mir::lower::{FINISHED, STATUS_DONE, STATUS_PENDING, STATUS_YIELDED};

use crate::error::RuntimeError;
use crate::interp::{Interp, Unwind};
use crate::machine::StateObject;
use crate::operation::Operation;
use crate::queue::ResumeToken;
use crate::value::Value;

/// What a step's outcome is delivered to.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    /// Result of an async function.
    Task(Operation),
    /// One pull of an async sequence; completes with `Value::Option`.
    Pull(Operation),
}

impl Completion {
    pub(crate) fn operation(&self) -> &Operation {
        match self {
            Completion::Task(op) | Completion::Pull(op) => op,
        }
    }
}

/// Tag of the fault a cancelled task completes with.
pub const CANCELLED: &str = "Cancelled";

pub(crate) fn drive(
    interp: &mut Interp<'_>,
    object: &Arc<StateObject>,
    completion: &Completion,
) -> Result<(), RuntimeError> {
    let step = object.machine().step.clone();
    let outcome = {
        let _guard = object.begin_run()?;
        interp.run_member(&step, object)
    };

    let status = match outcome {
        Ok(Value::Int(status)) => status,
        Ok(other) => {
            object.set_state(FINISHED);
            return Err(RuntimeError::type_error("step status", &other));
        }
        Err(Unwind::Throw(fault)) => {
            debug!(machine = %object.machine().name, %fault, "step faulted");
            object.set_state(FINISHED);
            return completion.operation().fault(fault);
        }
        Err(Unwind::Error(err)) => {
            object.set_state(FINISHED);
            return Err(err);
        }
    };

    match (status, completion) {
        (STATUS_DONE, Completion::Task(op)) => op.complete(object.result()),
        (STATUS_DONE, Completion::Pull(op)) => op.complete(Value::Option(None)),
        (STATUS_YIELDED, Completion::Pull(op)) => {
            op.complete(Value::Option(Some(Box::new(object.current()))))
        }
        (STATUS_PENDING, _) => {
            let awaited = object
                .take_awaiting()
                .ok_or_else(|| RuntimeError::malformed(&step, "pending without an awaited operation"))?;
            let token = ResumeToken {
                object: object.clone(),
                expected_state: object.state(),
                completion: completion.clone(),
            };
            trace!(machine = %object.machine().name, state = token.expected_state, "suspended");
            let rt = interp.runtime().clone();
            let inline = token.clone();
            if awaited.when_pending(move || rt.resume_now(inline)).is_err() {
                interp.runtime().queue().post(token);
            }
            Ok(())
        }
        (other, _) => Err(RuntimeError::malformed(&step, format!("unexpected status {}", other))),
    }
}

/// Continue a suspended object.
pub(crate) fn resume(interp: &mut Interp<'_>, token: ResumeToken) -> Result<(), RuntimeError> {
    if token.object.is_disposed() {
        trace!(machine = %token.object.machine().name, "dropping resume of disposed object");
        return Ok(());
    }
    let found = token.object.state();
    if found != token.expected_state {
        return Err(RuntimeError::StaleResume {
            expected: token.expected_state,
            found,
        });
    }
    drive(interp, &token.object, &token.completion)
}

/// Run the cleanups the object's current state is protected by and mark
/// it finished. Returns `false` if it was already disposed or finished.
pub(crate) fn dispose(interp: &mut Interp<'_>, object: &Arc<StateObject>) -> Result<bool, RuntimeError> {
    let _guard = object.begin_run()?;
    {
        let mut slots = object.slots();
        if slots.disposed {
            return Ok(false);
        }
        slots.disposed = true;
        if slots.state == FINISHED {
            return Ok(false);
        }
    }
    let name = object.machine().dispose.clone();
    debug!(machine = %object.machine().name, state = object.state(), "disposing");
    let outcome = interp.run_member(&name, object);
    object.set_state(FINISHED);
    outcome.map(|_| true).map_err(Unwind::into_error)
}
