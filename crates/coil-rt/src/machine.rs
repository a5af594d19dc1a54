// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! State objects.
//!
//! One object per call of a lowered function. It holds the machine's fields
//! plus the builtin slots its step and dispose functions read and write.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use coil_mir::lower::{MachineType, FINISHED};
use coil_mir::{FieldId, MirConst};

use crate::error::RuntimeError;
use crate::operation::Operation;
use crate::value::Value;

pub struct StateObject {
    machine: Arc<MachineType>,
    slots: Mutex<Slots>,
    running: AtomicBool,
}

#[derive(Debug)]
pub struct Slots {
    pub fields: Vec<Value>,
    pub state: i64,
    pub disposed: bool,
    pub current: Value,
    pub awaiting: Option<Operation>,
    pub result: Value,
}

/// Marks an object as running until dropped.
pub struct RunGuard<'a>(&'a StateObject);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

pub(crate) fn const_value(c: &MirConst) -> Value {
    match c {
        MirConst::Unit => Value::Unit,
        MirConst::Int(n) => Value::Int(*n),
        MirConst::Bool(b) => Value::Bool(*b),
        MirConst::String(s) => Value::Str(s.clone()),
    }
}

impl StateObject {
    /// Allocate an object in its initial state. `args` are the receiver (if
    /// the machine has one) followed by the parameters.
    pub fn new(machine: Arc<MachineType>, args: Vec<Value>) -> Result<Self, RuntimeError> {
        let expected = machine.param_fields.len() + usize::from(machine.receiver_field.is_some());
        if args.len() != expected {
            return Err(RuntimeError::ArityMismatch {
                expected,
                got: args.len(),
            });
        }
        let mut fields: Vec<Value> = machine.fields.iter().map(|f| const_value(&f.default)).collect();
        let targets = machine.receiver_field.iter().chain(&machine.param_fields);
        for (field, arg) in targets.zip(args) {
            if let Some(slot) = fields.get_mut(field.0 as usize) {
                *slot = arg;
            }
        }
        Ok(Self {
            machine,
            slots: Mutex::new(Slots {
                fields,
                state: 0,
                disposed: false,
                current: Value::Unit,
                awaiting: None,
                result: Value::Unit,
            }),
            running: AtomicBool::new(false),
        })
    }

    pub fn machine(&self) -> &MachineType {
        &self.machine
    }

    pub fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the object for one step or dispose.
    pub fn begin_run(&self) -> Result<RunGuard<'_>, RuntimeError> {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| RunGuard(self))
            .map_err(|_| RuntimeError::StepInProgress)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> i64 {
        self.slots().state
    }

    pub fn set_state(&self, state: i64) {
        self.slots().state = state;
    }

    pub fn is_finished(&self) -> bool {
        self.state() == FINISHED
    }

    pub fn is_disposed(&self) -> bool {
        self.slots().disposed
    }

    pub fn field(&self, id: FieldId) -> Result<Value, RuntimeError> {
        self.slots()
            .fields
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| self.bad_field(id))
    }

    pub fn set_field(&self, id: FieldId, value: Value) -> Result<(), RuntimeError> {
        let mut slots = self.slots();
        match slots.fields.get_mut(id.0 as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.bad_field(id)),
        }
    }

    fn bad_field(&self, id: FieldId) -> RuntimeError {
        RuntimeError::malformed(&self.machine.step, format!("no field {} on {}", id.0, self.machine.name))
    }

    /// Receiver captured at creation.
    pub fn receiver(&self) -> Option<Value> {
        let field = self.machine.receiver_field?;
        self.slots().fields.get(field.0 as usize).cloned()
    }

    pub fn current(&self) -> Value {
        self.slots().current.clone()
    }

    pub fn take_awaiting(&self) -> Option<Operation> {
        self.slots().awaiting.take()
    }

    pub fn result(&self) -> Value {
        self.slots().result.clone()
    }
}

impl fmt::Debug for StateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots();
        f.debug_struct("StateObject")
            .field("machine", &self.machine.name)
            .field("state", &slots.state)
            .field("disposed", &slots.disposed)
            .finish()
    }
}
