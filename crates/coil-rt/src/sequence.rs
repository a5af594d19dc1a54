// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Consumer-facing handles over state objects.
//!
//! - [`Generator`] pulls values synchronously.
//! - [`AsyncGenerator`] pulls values through operations.
//! - [`AsyncTask`] is a started async function.

use std::sync::{Arc, Mutex};

use coil_mir::lower::{FINISHED, STATUS_DONE, STATUS_YIELDED};

use crate::driver::{self, Completion, CANCELLED};
use crate::error::RuntimeError;
use crate::interp::Interp;
use crate::machine::StateObject;
use crate::operation::Operation;
use crate::runtime::Runtime;
use crate::value::Value;

// ============================================================================
// Generator
// ============================================================================

/// A synchronous sequence.
#[derive(Debug, Clone)]
pub struct Generator {
    rt: Runtime,
    object: Arc<StateObject>,
}

impl Generator {
    pub(crate) fn new(rt: Runtime, object: Arc<StateObject>) -> Self {
        Self { rt, object }
    }

    /// Advance to the next value. `Ok(None)` once the body has finished,
    /// and on every pull after that.
    pub fn pull(&self) -> Result<Option<Value>, RuntimeError> {
        if self.object.is_disposed() {
            return Err(RuntimeError::Disposed);
        }
        if self.object.is_finished() {
            return Ok(None);
        }
        let step = self.object.machine().step.clone();
        let mut interp = Interp::new(&self.rt);
        let outcome = {
            let _guard = self.object.begin_run()?;
            interp.run_member(&step, &self.object)
        };
        match outcome {
            Ok(Value::Int(STATUS_YIELDED)) => Ok(Some(self.object.current())),
            Ok(Value::Int(STATUS_DONE)) => Ok(None),
            Ok(other) => {
                self.object.set_state(FINISHED);
                Err(RuntimeError::type_error("step status", &other))
            }
            Err(unwind) => {
                self.object.set_state(FINISHED);
                Err(unwind.into_error())
            }
        }
    }

    /// Value exposed by the last successful pull.
    pub fn current(&self) -> Value {
        self.object.current()
    }

    /// Stop early, running the cleanups of the state it is paused in.
    /// `Ok(false)` if there was nothing to do.
    pub fn dispose(&self) -> Result<bool, RuntimeError> {
        let mut interp = Interp::new(&self.rt);
        driver::dispose(&mut interp, &self.object)
    }

    pub fn object(&self) -> &Arc<StateObject> {
        &self.object
    }
}

impl Iterator for Generator {
    type Item = Result<Value, RuntimeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pull().transpose()
    }
}

// ============================================================================
// Async generator
// ============================================================================

/// An asynchronous sequence. Each pull is an operation.
#[derive(Debug, Clone)]
pub struct AsyncGenerator {
    rt: Runtime,
    object: Arc<StateObject>,
    pending: Arc<Mutex<Option<Operation>>>,
}

impl AsyncGenerator {
    pub(crate) fn new(rt: Runtime, object: Arc<StateObject>) -> Self {
        Self {
            rt,
            object,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the next pull. The operation completes with `Value::Option`:
    /// `Some` for a produced value, `None` once the sequence has ended.
    pub fn next(&self) -> Result<Operation, RuntimeError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.as_ref().is_some_and(|op| !op.is_completed()) {
            return Err(RuntimeError::StepInProgress);
        }
        if self.object.is_disposed() {
            return Err(RuntimeError::Disposed);
        }
        if self.object.is_finished() {
            return Ok(Operation::ready(Value::Option(None)));
        }
        let op = Operation::new();
        *pending = Some(op.clone());
        drop(pending);

        let mut interp = Interp::new(&self.rt);
        driver::drive(&mut interp, &self.object, &Completion::Pull(op.clone()))?;
        Ok(op)
    }

    /// Stop early. A pull still waiting is faulted with a `Cancelled` error.
    pub fn dispose(&self) -> Result<bool, RuntimeError> {
        let mut interp = Interp::new(&self.rt);
        let disposed = driver::dispose(&mut interp, &self.object)?;
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(op) = pending.filter(|op| !op.is_completed()) {
            op.fault(Value::error(CANCELLED, Value::Unit))?;
        }
        Ok(disposed)
    }

    pub fn object(&self) -> &Arc<StateObject> {
        &self.object
    }
}

// ============================================================================
// Async task
// ============================================================================

/// A started async function.
#[derive(Debug, Clone)]
pub struct AsyncTask {
    rt: Runtime,
    object: Arc<StateObject>,
    completion: Operation,
}

impl AsyncTask {
    pub(crate) fn new(rt: Runtime, object: Arc<StateObject>, completion: Operation) -> Self {
        Self {
            rt,
            object,
            completion,
        }
    }

    /// Completes with the function's result or fault.
    pub fn completion(&self) -> &Operation {
        &self.completion
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    /// Dispose the task and fault its completion with a `Cancelled` error.
    /// `Ok(false)` if it had already completed.
    pub fn cancel(&self) -> Result<bool, RuntimeError> {
        if self.completion.is_completed() {
            return Ok(false);
        }
        let mut interp = Interp::new(&self.rt);
        driver::dispose(&mut interp, &self.object)?;
        match self.completion.fault(Value::error(CANCELLED, Value::Unit)) {
            Ok(()) => Ok(true),
            Err(RuntimeError::AlreadyCompleted) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn object(&self) -> &Arc<StateObject> {
        &self.object
    }
}
