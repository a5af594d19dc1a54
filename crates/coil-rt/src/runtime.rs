// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime: loaded functions, host functions and the run queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, debug_span, warn};

use coil_mir::lower::{FnKind, Lowered, MachineType, StateMachineLowering};
use coil_mir::MirFunction;

use crate::config::RuntimeConfig;
use crate::driver::{self, Completion};
use crate::error::RuntimeError;
use crate::host::{HostFn, HostRegistry};
use crate::interp::{Interp, Unwind};
use crate::machine::StateObject;
use crate::operation::Operation;
use crate::queue::{ResumeToken, RunQueue};
use crate::sequence::{AsyncGenerator, AsyncTask, Generator};
use crate::value::Value;

/// Shared handle to a loaded program. Cloning is cheap.
#[derive(Clone)]
pub struct Runtime(Arc<RuntimeInner>);

struct RuntimeInner {
    functions: IndexMap<String, Arc<MirFunction>>,
    machines: HashMap<String, Arc<MachineType>>,
    /// Kickoff name to machine type name.
    kickoffs: HashMap<String, String>,
    hosts: HostRegistry,
    queue: RunQueue,
    config: RuntimeConfig,
}

#[derive(Default)]
pub struct RuntimeBuilder {
    functions: IndexMap<String, Arc<MirFunction>>,
    machines: HashMap<String, Arc<MachineType>>,
    kickoffs: HashMap<String, String>,
    hosts: HostRegistry,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host_fn(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    ) -> Self {
        self.hosts.register(name, f);
        self
    }

    /// Load every function emitted for one lowered function.
    pub fn load(mut self, lowering: &StateMachineLowering) -> Self {
        for (name, func) in lowering.functions() {
            self.functions.insert(name.to_string(), Arc::new(func.clone()));
        }
        let machine = &lowering.machine;
        self.kickoffs
            .insert(lowering.kickoff.name.clone(), machine.name.clone());
        self.machines
            .insert(machine.name.clone(), Arc::new(machine.clone()));
        self
    }

    /// Load a lowering result; plain functions have nothing to load.
    pub fn load_lowered(self, lowered: &Lowered) -> Self {
        match lowered.state_machine() {
            Some(m) => self.load(m),
            None => self,
        }
    }

    /// Load a standalone function callable by name.
    pub fn function(mut self, func: MirFunction) -> Self {
        self.functions.insert(func.name.clone(), Arc::new(func));
        self
    }

    pub fn build(self) -> Runtime {
        debug!(
            functions = self.functions.len(),
            machines = self.machines.len(),
            "runtime built"
        );
        Runtime(Arc::new(RuntimeInner {
            functions: self.functions,
            machines: self.machines,
            kickoffs: self.kickoffs,
            hosts: self.hosts,
            queue: RunQueue::default(),
            config: self.config,
        }))
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.0.config
    }

    pub fn queue(&self) -> &RunQueue {
        &self.0.queue
    }

    pub(crate) fn function(&self, name: &str) -> Option<Arc<MirFunction>> {
        self.0.functions.get(name).cloned()
    }

    pub(crate) fn host(&self, name: &str) -> Option<HostFn> {
        self.0.hosts.get(name).cloned()
    }

    pub(crate) fn machine(&self, name: &str) -> Option<Arc<MachineType>> {
        self.0.machines.get(name).cloned()
    }

    /// Call a function by name. Calling a kickoff returns its state object
    /// (or, for an async function, its completion operation).
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let _span = debug_span!("call", function = name).entered();
        Interp::new(self)
            .call_function(name, args, None)
            .map_err(Unwind::into_error)
    }

    /// Call a function with a receiver.
    pub fn call_method(&self, name: &str, receiver: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let _span = debug_span!("call_method", function = name).entered();
        Interp::new(self)
            .call_function(name, args, Some(receiver))
            .map_err(Unwind::into_error)
    }

    /// Run a closure value.
    pub fn invoke(&self, closure: &Value) -> Result<Value, RuntimeError> {
        match closure {
            Value::Closure(c) => Interp::new(self).call_closure(c).map_err(Unwind::into_error),
            other => Err(RuntimeError::type_error("closure", other)),
        }
    }

    fn state_object(&self, value: Value, kind: FnKind) -> Result<Arc<StateObject>, RuntimeError> {
        match value {
            Value::Machine(object) if object.machine().kind == kind => Ok(object),
            other => Err(RuntimeError::TypeError {
                expected: match kind {
                    FnKind::Generator => "generator",
                    FnKind::AsyncGenerator => "async generator",
                    _ => "state object",
                },
                found: match &other {
                    Value::Machine(m) => m.machine().kind.to_string(),
                    v => v.type_name().to_string(),
                },
            }),
        }
    }

    /// Wrap a generator's state object.
    pub fn generator(&self, value: Value) -> Result<Generator, RuntimeError> {
        Ok(Generator::new(self.clone(), self.state_object(value, FnKind::Generator)?))
    }

    pub fn async_generator(&self, value: Value) -> Result<AsyncGenerator, RuntimeError> {
        Ok(AsyncGenerator::new(
            self.clone(),
            self.state_object(value, FnKind::AsyncGenerator)?,
        ))
    }

    /// Start an async function, keeping a handle that can cancel it.
    /// `receiver` is required when the function has one.
    pub fn spawn(&self, name: &str, receiver: Option<Value>, args: Vec<Value>) -> Result<AsyncTask, RuntimeError> {
        let machine = self
            .0
            .kickoffs
            .get(name)
            .and_then(|m| self.machine(m))
            .ok_or_else(|| RuntimeError::UndefinedFunction(name.to_string()))?;
        if machine.kind != FnKind::AsyncFunction {
            return Err(RuntimeError::TypeError {
                expected: "async function",
                found: machine.kind.to_string(),
            });
        }
        let args = receiver.into_iter().chain(args).collect();
        let object = Arc::new(StateObject::new(machine, args)?);
        let completion = Operation::new();
        driver::drive(&mut Interp::new(self), &object, &Completion::Task(completion.clone()))?;
        Ok(AsyncTask::new(self.clone(), object, completion))
    }

    /// Resume queued machines until the queue is empty. Returns how many
    /// resumptions ran.
    pub fn run_until_idle(&self) -> Result<usize, RuntimeError> {
        let mut ran = 0;
        while let Some(token) = self.0.queue.pop() {
            driver::resume(&mut Interp::new(self), token)?;
            ran += 1;
        }
        Ok(ran)
    }

    /// Resume from a completion callback. Nobody is left to receive a
    /// runtime error here, so it faults the object's completion instead.
    pub(crate) fn resume_now(&self, token: ResumeToken) {
        let completion = token.completion.operation().clone();
        if let Err(err) = driver::resume(&mut Interp::new(self), token) {
            warn!(%err, "resume failed");
            let _ = completion.fault(Value::error(RUNTIME_FAULT, Value::str(err.to_string())));
        }
    }
}

/// Tag of the fault delivered when a resumed machine fails outside the
/// language's own exceptions.
pub const RUNTIME_FAULT: &str = "RuntimeFault";

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("functions", &self.0.functions.keys().collect::<Vec<_>>())
            .field("queued", &self.0.queue.len())
            .finish()
    }
}
