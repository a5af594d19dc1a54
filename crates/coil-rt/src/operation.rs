// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Awaitable operations.
//!
//! An operation completes once, with a value or a fault. Continuations
//! registered before completion run on the completing thread.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::RuntimeError;
use crate::value::Value;

type Continuation = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct Operation(Arc<Mutex<OpState>>);

#[derive(Default)]
struct OpState {
    outcome: Option<Result<Value, Value>>,
    continuations: Vec<Continuation>,
}

impl Operation {
    pub fn new() -> Self {
        Operation(Arc::new(Mutex::new(OpState::default())))
    }

    /// Operation that has already succeeded.
    pub fn ready(value: Value) -> Self {
        let op = Self::new();
        op.state().outcome = Some(Ok(value));
        op
    }

    /// Operation that has already faulted.
    pub fn failed(fault: Value) -> Self {
        let op = Self::new();
        op.state().outcome = Some(Err(fault));
        op
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OpState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn complete(&self, value: Value) -> Result<(), RuntimeError> {
        self.finish(Ok(value))
    }

    pub fn fault(&self, fault: Value) -> Result<(), RuntimeError> {
        self.finish(Err(fault))
    }

    fn finish(&self, outcome: Result<Value, Value>) -> Result<(), RuntimeError> {
        let continuations = {
            let mut state = self.state();
            if state.outcome.is_some() {
                return Err(RuntimeError::AlreadyCompleted);
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.continuations)
        };
        trace!(continuations = continuations.len(), "operation completed");
        // Run outside the lock; a continuation may inspect this operation.
        for k in continuations {
            k();
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.state().outcome.is_some()
    }

    /// `Ok` with the value, `Err` with the fault, `None` while pending.
    pub fn outcome(&self) -> Option<Result<Value, Value>> {
        self.state().outcome.clone()
    }

    /// Value of a completed operation; its fault becomes a thrown exception.
    pub fn result(&self) -> Result<Value, RuntimeError> {
        match self.outcome() {
            Some(Ok(v)) => Ok(v),
            Some(Err(fault)) => Err(RuntimeError::Thrown(fault)),
            None => Err(RuntimeError::NotCompleted),
        }
    }

    pub fn on_complete(&self, k: impl FnOnce() + Send + 'static) {
        let mut state = self.state();
        if state.outcome.is_some() {
            drop(state);
            k();
        } else {
            state.continuations.push(Box::new(k));
        }
    }

    /// Register `k` unless the operation has already completed, in which
    /// case it is handed back unrun.
    pub fn when_pending<K>(&self, k: K) -> Result<(), K>
    where
        K: FnOnce() + Send + 'static,
    {
        let mut state = self.state();
        if state.outcome.is_some() {
            return Err(k);
        }
        state.continuations.push(Box::new(k));
        Ok(())
    }

    pub fn ptr_eq(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Operation")
            .field("outcome", &state.outcome)
            .field("continuations", &state.continuations.len())
            .finish()
    }
}
