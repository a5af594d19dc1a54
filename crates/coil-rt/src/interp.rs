// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! MIR interpreter.
//!
//! Executes emitted functions block by block. Exceptions are dispatched
//! through the function's exception table: covering entries are tried
//! innermost first, a matching handler (whose filter, if any, accepts)
//! receives control, and every entry passed over has its cleanup run
//! before the search moves outward.

use std::sync::Arc;

use tracing::{trace, warn};

use coil_mir::{
    BinOp, BlockId, FunctionRef, MirFunction, MirOperand, MirRValue, MirStmt, MirTerminator,
    Place, UnaryOp,
};

use crate::driver::{self, Completion};
use crate::error::RuntimeError;
use crate::machine::{const_value, StateObject};
use crate::operation::Operation;
use crate::runtime::Runtime;
use crate::value::{Cell, Closure, Value};

/// Non-local exit from a function.
#[derive(Debug)]
pub(crate) enum Unwind {
    /// Exception thrown by lowered code or a host function.
    Throw(Value),
    Error(RuntimeError),
}

impl From<RuntimeError> for Unwind {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Thrown(v) => Unwind::Throw(v),
            other => Unwind::Error(other),
        }
    }
}

impl Unwind {
    pub(crate) fn into_error(self) -> RuntimeError {
        match self {
            Unwind::Throw(v) => RuntimeError::Thrown(v),
            Unwind::Error(e) => e,
        }
    }
}

/// Activation of one function.
#[derive(Default)]
struct Frame {
    locals: Vec<Value>,
    object: Option<Arc<StateObject>>,
    receiver: Option<Value>,
    env: Vec<Value>,
}

enum Flow {
    Jump(BlockId),
    Return(Value),
}

pub(crate) struct Interp<'rt> {
    rt: &'rt Runtime,
    budget: Option<u64>,
    executed: u64,
}

impl<'rt> Interp<'rt> {
    pub(crate) fn new(rt: &'rt Runtime) -> Self {
        Self {
            rt,
            budget: rt.config().step_budget,
            executed: 0,
        }
    }

    pub(crate) fn runtime(&self) -> &'rt Runtime {
        self.rt
    }

    // -- Entry points ---------------------------------------------------------

    /// Call a loaded function or, failing that, a host function.
    pub(crate) fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        receiver: Option<Value>,
    ) -> Result<Value, Unwind> {
        if let Some(func) = self.rt.function(name) {
            if func.params.len() != args.len() {
                return Err(RuntimeError::ArityMismatch {
                    expected: func.params.len(),
                    got: args.len(),
                }
                .into());
            }
            let mut frame = Frame {
                receiver,
                ..Frame::default()
            };
            for (param, arg) in func.params.iter().zip(args) {
                set_local(&mut frame, param.id.0 as usize, arg);
            }
            return self.run(&func, &mut frame);
        }
        match self.rt.host(name) {
            Some(host) => {
                trace!(function = name, "host call");
                host(&args).map_err(Unwind::Throw)
            }
            None => Err(RuntimeError::UndefinedFunction(name.to_string()).into()),
        }
    }

    /// Run a function against a state object.
    pub(crate) fn run_member(&mut self, name: &str, object: &Arc<StateObject>) -> Result<Value, Unwind> {
        let func = self
            .rt
            .function(name)
            .ok_or_else(|| RuntimeError::UndefinedFunction(name.to_string()))?;
        let mut frame = Frame {
            receiver: object.receiver(),
            object: Some(object.clone()),
            ..Frame::default()
        };
        self.run(&func, &mut frame)
    }

    pub(crate) fn call_closure(&mut self, closure: &Closure) -> Result<Value, Unwind> {
        let func = self
            .rt
            .function(&closure.func)
            .ok_or_else(|| RuntimeError::UndefinedFunction(closure.func.clone()))?;
        let mut frame = Frame {
            receiver: closure.receiver.clone(),
            object: closure.object.clone(),
            env: closure.env.clone(),
            ..Frame::default()
        };
        self.run(&func, &mut frame)
    }

    // -- Block loop -----------------------------------------------------------

    fn run(&mut self, func: &MirFunction, frame: &mut Frame) -> Result<Value, Unwind> {
        frame.locals.resize(func.local_capacity().max(frame.locals.len()), Value::Unit);
        let mut block = func.entry_block;
        loop {
            match self.exec_block(func, block, frame) {
                Ok(Flow::Jump(next)) => block = next,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(Unwind::Throw(exc)) => block = self.dispatch(func, block, exc, frame)?,
                Err(err) => return Err(err),
            }
        }
    }

    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.executed += 1;
        match self.budget {
            Some(limit) if self.executed > limit => Err(RuntimeError::BudgetExhausted(limit)),
            _ => Ok(()),
        }
    }

    fn exec_block(&mut self, func: &MirFunction, id: BlockId, frame: &mut Frame) -> Result<Flow, Unwind> {
        self.tick()?;
        let block = func
            .blocks
            .get(id.0 as usize)
            .ok_or_else(|| RuntimeError::malformed(&func.name, format!("no block {}", id.0)))?;
        for stmt in &block.statements {
            self.exec_stmt(func, stmt, frame)?;
        }
        match &block.terminator {
            MirTerminator::Return { value } => {
                let value = match value {
                    Some(op) => self.operand(func, op, frame)?,
                    None => Value::Unit,
                };
                Ok(Flow::Return(value))
            }
            MirTerminator::Goto { target } => Ok(Flow::Jump(*target)),
            MirTerminator::Branch { cond, then_block, else_block } => {
                let cond = self.operand(func, cond, frame)?;
                match cond.as_bool() {
                    Some(true) => Ok(Flow::Jump(*then_block)),
                    Some(false) => Ok(Flow::Jump(*else_block)),
                    None => Err(RuntimeError::type_error("bool", &cond).into()),
                }
            }
            MirTerminator::Switch { value, cases, default } => {
                let value = self.operand(func, value, frame)?;
                let n = value
                    .as_int()
                    .ok_or_else(|| RuntimeError::type_error("int", &value))?;
                let target = cases
                    .iter()
                    .find(|(case, _)| *case == n)
                    .map(|(_, b)| *b)
                    .unwrap_or(*default);
                Ok(Flow::Jump(target))
            }
            MirTerminator::Throw { value } => Err(Unwind::Throw(self.operand(func, value, frame)?)),
            MirTerminator::Suspend { .. } => {
                Err(RuntimeError::malformed(&func.name, "suspension in an emitted function").into())
            }
            MirTerminator::EndFilter { .. } => {
                Err(RuntimeError::malformed(&func.name, "filter end outside a filter").into())
            }
            MirTerminator::Unreachable => {
                Err(RuntimeError::malformed(&func.name, format!("reached unreachable block {}", id.0)).into())
            }
        }
    }

    // -- Exceptions -----------------------------------------------------------

    /// Find where `exc`, thrown in `block`, is handled.
    fn dispatch(
        &mut self,
        func: &MirFunction,
        block: BlockId,
        mut exc: Value,
        frame: &mut Frame,
    ) -> Result<BlockId, Unwind> {
        for region in func.covering_regions(block) {
            for handler in &region.handlers {
                let matches = match &handler.tag {
                    None => true,
                    Some(tag) => exc.error_tag() == Some(tag.as_str()),
                };
                if !matches {
                    continue;
                }
                if let Some(binding) = handler.binding {
                    self.write(func, binding, exc.clone(), frame)?;
                }
                if let Some(filter) = handler.filter {
                    if !self.run_filter(func, filter, frame)? {
                        continue;
                    }
                }
                trace!(function = %func.name, handler = handler.entry.0, "exception caught");
                return Ok(handler.entry);
            }
            if let Some(cleanup) = &region.cleanup {
                // A throwing cleanup replaces the exception in flight.
                match self.run_cleanup(cleanup, frame) {
                    Ok(()) => {}
                    Err(Unwind::Throw(replacement)) => exc = replacement,
                    Err(err) => return Err(err),
                }
            }
        }
        Err(Unwind::Throw(exc))
    }

    /// Run a filter from `start` to its `EndFilter`. A filter that throws
    /// rejects the exception.
    fn run_filter(&mut self, func: &MirFunction, start: BlockId, frame: &mut Frame) -> Result<bool, Unwind> {
        let mut block = start;
        loop {
            self.tick()?;
            let b = func
                .blocks
                .get(block.0 as usize)
                .ok_or_else(|| RuntimeError::malformed(&func.name, format!("no block {}", block.0)))?;
            for stmt in &b.statements {
                match self.exec_stmt(func, stmt, frame) {
                    Ok(()) => {}
                    Err(Unwind::Throw(_)) => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
            match &b.terminator {
                MirTerminator::EndFilter { accept } => {
                    return Ok(self.operand(func, accept, frame)?.as_bool() == Some(true));
                }
                MirTerminator::Goto { target } => block = *target,
                MirTerminator::Branch { cond, then_block, else_block } => {
                    block = match self.operand(func, cond, frame)?.as_bool() {
                        Some(true) => *then_block,
                        _ => *else_block,
                    }
                }
                MirTerminator::Throw { .. } => return Ok(false),
                _ => return Err(RuntimeError::malformed(&func.name, "filter leaves its blocks").into()),
            }
        }
    }

    fn run_cleanup(&mut self, name: &str, frame: &Frame) -> Result<(), Unwind> {
        trace!(cleanup = name, "running cleanup");
        match &frame.object {
            Some(object) => self.run_member(name, object).map(|_| ()),
            None => {
                let func = self
                    .rt
                    .function(name)
                    .ok_or_else(|| RuntimeError::UndefinedFunction(name.to_string()))?;
                let mut inner = Frame {
                    receiver: frame.receiver.clone(),
                    ..Frame::default()
                };
                self.run(&func, &mut inner).map(|_| ())
            }
        }
    }

    // -- Statements -----------------------------------------------------------

    fn exec_stmt(&mut self, func: &MirFunction, stmt: &MirStmt, frame: &mut Frame) -> Result<(), Unwind> {
        match stmt {
            MirStmt::Assign { dst, rvalue } => {
                let value = self.rvalue(func, rvalue, frame)?;
                self.write(func, *dst, value, frame)
            }
            MirStmt::Call { dst, func: callee, args } => {
                let args = self.operands(func, args, frame)?;
                let value = self.call(callee, args, frame)?;
                match dst {
                    Some(dst) => self.write(func, *dst, value, frame),
                    None => Ok(()),
                }
            }
            MirStmt::NewCell { dst, init } => {
                let init = self.operand(func, init, frame)?;
                self.write(func, *dst, Value::Cell(Cell::new(init)), frame)
            }
            MirStmt::StoreCell { cell, value } => {
                let cell = self.operand(func, cell, frame)?;
                let value = self.operand(func, value, frame)?;
                match cell {
                    Value::Cell(c) => {
                        c.set(value);
                        Ok(())
                    }
                    other => Err(RuntimeError::type_error("cell", &other).into()),
                }
            }
            MirStmt::ClosureCreate { dst, func_name, captures } => {
                let env = self.operands(func, captures, frame)?;
                let closure = Closure {
                    func: func_name.clone(),
                    env,
                    receiver: frame.receiver.clone(),
                    object: frame.object.clone(),
                };
                self.write(func, *dst, Value::Closure(Arc::new(closure)), frame)
            }
            MirStmt::ClosureCall { dst, closure } => {
                let value = match self.operand(func, closure, frame)? {
                    Value::Closure(c) => self.call_closure(&c)?,
                    other => return Err(RuntimeError::type_error("closure", &other).into()),
                };
                match dst {
                    Some(dst) => self.write(func, *dst, value, frame),
                    None => Ok(()),
                }
            }
            MirStmt::SetState(state) => {
                self.object(func, frame)?.set_state(*state);
                Ok(())
            }
            MirStmt::SetCurrent(op) => {
                let value = self.operand(func, op, frame)?;
                self.object(func, frame)?.slots().current = value;
                Ok(())
            }
            MirStmt::SetResult(op) => {
                let value = self.operand(func, op, frame)?;
                self.object(func, frame)?.slots().result = value;
                Ok(())
            }
            MirStmt::AwaitOn(op) => {
                let op = match self.operand(func, op, frame)? {
                    Value::Operation(op) => op,
                    other => return Err(RuntimeError::type_error("operation", &other).into()),
                };
                self.object(func, frame)?.slots().awaiting = Some(op);
                Ok(())
            }
            MirStmt::StartMachine { dst, machine } => {
                let object = match self.operand(func, machine, frame)? {
                    Value::Machine(m) => m,
                    other => return Err(RuntimeError::type_error("state object", &other).into()),
                };
                let completion = Operation::new();
                driver::drive(self, &object, &Completion::Task(completion.clone()))?;
                self.write(func, *dst, Value::Operation(completion), frame)
            }
        }
    }

    fn call(&mut self, callee: &FunctionRef, args: Vec<Value>, frame: &Frame) -> Result<Value, Unwind> {
        if !callee.is_member {
            return self.call_function(&callee.name, args, None);
        }
        match &frame.object {
            Some(object) => self.run_member(&callee.name, object),
            None => self.call_function(&callee.name, args, frame.receiver.clone()),
        }
    }

    // -- Values ---------------------------------------------------------------

    fn object<'f>(&self, func: &MirFunction, frame: &'f Frame) -> Result<&'f Arc<StateObject>, Unwind> {
        frame
            .object
            .as_ref()
            .ok_or_else(|| RuntimeError::malformed(&func.name, "no state object").into())
    }

    fn operand(&self, func: &MirFunction, op: &MirOperand, frame: &Frame) -> Result<Value, Unwind> {
        match op {
            MirOperand::Local(id) => frame
                .locals
                .get(id.0 as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::malformed(&func.name, format!("no local _{}", id.0)).into()),
            MirOperand::Field(id) => Ok(self.object(func, frame)?.field(*id)?),
            MirOperand::Constant(c) => Ok(const_value(c)),
        }
    }

    fn operands(&self, func: &MirFunction, ops: &[MirOperand], frame: &Frame) -> Result<Vec<Value>, Unwind> {
        ops.iter().map(|op| self.operand(func, op, frame)).collect()
    }

    fn write(&self, func: &MirFunction, place: Place, value: Value, frame: &mut Frame) -> Result<(), Unwind> {
        match place {
            Place::Local(id) => {
                set_local(frame, id.0 as usize, value);
                Ok(())
            }
            Place::Field(id) => Ok(self.object(func, frame)?.set_field(id, value)?),
        }
    }

    fn rvalue(&mut self, func: &MirFunction, rvalue: &MirRValue, frame: &Frame) -> Result<Value, Unwind> {
        match rvalue {
            MirRValue::Use(op) => self.operand(func, op, frame),
            MirRValue::BinaryOp { op, left, right } => {
                let left = self.operand(func, left, frame)?;
                let right = self.operand(func, right, frame)?;
                binary(*op, left, right)
            }
            MirRValue::UnaryOp { op, operand } => {
                let value = self.operand(func, operand, frame)?;
                match (op, &value) {
                    (UnaryOp::Neg, Value::Int(n)) => Ok(Value::Int(n.wrapping_neg())),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, _) => Err(RuntimeError::type_error("int", &value).into()),
                    (UnaryOp::Not, _) => Err(RuntimeError::type_error("bool", &value).into()),
                }
            }
            MirRValue::MakeError { tag, payload } => {
                Ok(Value::error(tag.clone(), self.operand(func, payload, frame)?))
            }
            MirRValue::LoadCell(op) => match self.operand(func, op, frame)? {
                Value::Cell(c) => Ok(c.get()),
                other => Err(RuntimeError::type_error("cell", &other).into()),
            },
            MirRValue::Receiver => frame
                .receiver
                .clone()
                .ok_or_else(|| RuntimeError::malformed(&func.name, "no receiver").into()),
            MirRValue::LoadCapture(i) => frame
                .env
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::malformed(&func.name, format!("no capture {}", i)).into()),
            MirRValue::AwaitResult(op) => match self.operand(func, op, frame)? {
                Value::Operation(op) => Ok(op.result()?),
                other => Err(RuntimeError::type_error("operation", &other).into()),
            },
            MirRValue::LoadState => Ok(Value::Int(self.object(func, frame)?.state())),
            MirRValue::NewMachine { machine, args } => {
                let ty = self
                    .rt
                    .machine(machine)
                    .ok_or_else(|| RuntimeError::UndefinedMachine(machine.clone()))?;
                let args = self.operands(func, args, frame)?;
                Ok(Value::Machine(Arc::new(StateObject::new(ty, args)?)))
            }
        }
    }
}

fn set_local(frame: &mut Frame, index: usize, value: Value) {
    if index >= frame.locals.len() {
        frame.locals.resize(index + 1, Value::Unit);
    }
    frame.locals[index] = value;
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, Unwind> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(left == right)),
        BinOp::Ne => return Ok(Value::Bool(left != right)),
        _ => {}
    }
    let (a, b) = match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => (*a, *b),
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => {
            return Ok(Value::Str(format!("{}{}", a, b)));
        }
        (Value::Int(_), other) | (other, _) => {
            return Err(RuntimeError::type_error("int", other).into());
        }
    };
    let overflow = || {
        warn!(?op, a, b, "integer overflow");
        Unwind::Throw(Value::error("Overflow", Value::Unit))
    };
    let divide_by_zero = || Unwind::Throw(Value::error("DivideByZero", Value::Unit));
    Ok(match op {
        BinOp::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
        BinOp::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
        BinOp::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
        BinOp::Div if b == 0 => return Err(divide_by_zero()),
        BinOp::Mod if b == 0 => return Err(divide_by_zero()),
        BinOp::Div => Value::Int(a.checked_div(b).ok_or_else(overflow)?),
        BinOp::Mod => Value::Int(a.checked_rem(b).ok_or_else(overflow)?),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::Eq | BinOp::Ne => unreachable!("equality handled above"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_faults_are_exceptions() {
        let thrown = |r: Result<Value, Unwind>| match r {
            Err(Unwind::Throw(v)) => v.error_tag().map(str::to_string),
            _ => None,
        };
        assert_eq!(
            thrown(binary(BinOp::Div, Value::Int(1), Value::Int(0))).as_deref(),
            Some("DivideByZero")
        );
        assert_eq!(
            thrown(binary(BinOp::Add, Value::Int(i64::MAX), Value::Int(1))).as_deref(),
            Some("Overflow")
        );
        assert!(matches!(
            binary(BinOp::Add, Value::Int(1), Value::Bool(true)),
            Err(Unwind::Error(RuntimeError::TypeError { expected: "int", .. }))
        ));
    }

    #[test]
    fn strings_concatenate() {
        let v = binary(BinOp::Add, Value::str("a"), Value::str("b")).ok();
        assert_eq!(v, Some(Value::str("ab")));
        let eq = binary(BinOp::Eq, Value::str("a"), Value::Int(1)).ok();
        assert_eq!(eq, Some(Value::Bool(false)));
    }
}
