// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Display implementations for MIR types.

use crate::operand::{BinOp, MirConst, UnaryOp};
use crate::stmt::SuspendKind;
use crate::*;
use std::fmt;

impl fmt::Display for MirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirType::Void => write!(f, "void"),
            MirType::Bool => write!(f, "bool"),
            MirType::I64 => write!(f, "i64"),
            MirType::String => write!(f, "string"),
            MirType::Error => write!(f, "error"),
            MirType::Closure => write!(f, "closure"),
            MirType::Cell(inner) => write!(f, "cell<{}>", inner),
            MirType::Object(name) => write!(f, "{}", name),
            MirType::Operation => write!(f, "operation"),
            MirType::Machine(name) => write!(f, "machine<{}>", name),
            MirType::Any => write!(f, "any"),
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Local(id) => write!(f, "_{}", id.0),
            Place::Field(id) => write!(f, "self.f{}", id.0),
        }
    }
}

impl fmt::Display for MirOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirOperand::Local(id) => write!(f, "_{}", id.0),
            MirOperand::Field(id) => write!(f, "self.f{}", id.0),
            MirOperand::Constant(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for MirConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirConst::Unit => write!(f, "()"),
            MirConst::Int(v) => write!(f, "{}", v),
            MirConst::Bool(v) => write!(f, "{}", v),
            MirConst::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sym = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
        };
        write!(f, "{}", sym)
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sym = match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        };
        write!(f, "{}", sym)
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[MirOperand]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

impl fmt::Display for MirRValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirRValue::Use(op) => write!(f, "{}", op),
            MirRValue::BinaryOp { op, left, right } => write!(f, "{} {} {}", left, op, right),
            MirRValue::UnaryOp { op, operand } => write!(f, "{}{}", op, operand),
            MirRValue::MakeError { tag, payload } => write!(f, "error {}({})", tag, payload),
            MirRValue::LoadCell(cell) => write!(f, "load_cell({})", cell),
            MirRValue::Receiver => write!(f, "receiver"),
            MirRValue::LoadCapture(index) => write!(f, "env[{}]", index),
            MirRValue::AwaitResult(op) => write!(f, "await_result({})", op),
            MirRValue::LoadState => write!(f, "self.state"),
            MirRValue::NewMachine { machine, args } => {
                write!(f, "new {}(", machine)?;
                write_args(f, args)?;
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for MirStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirStmt::Assign { dst, rvalue } => write!(f, "{} = {}", dst, rvalue),
            MirStmt::Call { dst, func, args } => {
                if let Some(d) = dst {
                    write!(f, "{} = ", d)?;
                }
                if func.is_member {
                    write!(f, "self.")?;
                }
                write!(f, "{}(", func.name)?;
                write_args(f, args)?;
                write!(f, ")")
            }
            MirStmt::NewCell { dst, init } => write!(f, "{} = new_cell({})", dst, init),
            MirStmt::StoreCell { cell, value } => write!(f, "store_cell({}, {})", cell, value),
            MirStmt::ClosureCreate { dst, func_name, captures } => {
                write!(f, "{} = closure {}[", dst, func_name)?;
                write_args(f, captures)?;
                write!(f, "]")
            }
            MirStmt::ClosureCall { dst, closure } => {
                if let Some(d) = dst {
                    write!(f, "{} = ", d)?;
                }
                write!(f, "invoke {}", closure)
            }
            MirStmt::SetState(state) => write!(f, "self.state = {}", state),
            MirStmt::SetCurrent(value) => write!(f, "self.current = {}", value),
            MirStmt::SetResult(value) => write!(f, "self.result = {}", value),
            MirStmt::AwaitOn(op) => write!(f, "await_on({})", op),
            MirStmt::StartMachine { dst, machine } => write!(f, "{} = start({})", dst, machine),
        }
    }
}

impl fmt::Display for MirTerminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirTerminator::Return { value: Some(v) } => write!(f, "return {}", v),
            MirTerminator::Return { value: None } => write!(f, "return"),
            MirTerminator::Goto { target } => write!(f, "goto bb{}", target.0),
            MirTerminator::Branch { cond, then_block, else_block } => {
                write!(f, "if {} then bb{} else bb{}", cond, then_block.0, else_block.0)
            }
            MirTerminator::Switch { value, cases, default } => {
                write!(f, "switch {} [", value)?;
                for (i, (val, block)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => bb{}", val, block.0)?;
                }
                write!(f, ", _ => bb{}]", default.0)
            }
            MirTerminator::Throw { value } => write!(f, "throw {}", value),
            MirTerminator::Suspend { kind, resume } => match kind {
                SuspendKind::Produce { value } => write!(f, "produce {} resume bb{}", value, resume.0),
                SuspendKind::Wait { awaiter } => write!(f, "wait {} resume bb{}", awaiter, resume.0),
            },
            MirTerminator::EndFilter { accept } => write!(f, "end_filter {}", accept),
            MirTerminator::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl fmt::Display for MirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func {}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match &p.name {
                Some(name) => write!(f, "{}: {}", name, p.ty)?,
                None => write!(f, "_{}: {}", p.id.0, p.ty)?,
            }
        }
        writeln!(f, ") -> {} {{", self.ret_ty)?;

        for local in self.locals.iter().filter(|l| !l.is_param) {
            match &local.name {
                Some(name) => writeln!(f, "  let {}: {}  // _{}", name, local.ty, local.id.0)?,
                None => writeln!(f, "  let _{}: {}", local.id.0, local.ty)?,
            }
        }
        if self.locals.iter().any(|l| !l.is_param) {
            writeln!(f)?;
        }

        for region in &self.exception_table {
            write!(f, "  protect bb{}..bb{}", region.start.0, region.end.0)?;
            for h in &region.handlers {
                write!(f, " catch {}", h.tag.as_deref().unwrap_or("_"))?;
                if let Some(filter) = h.filter {
                    write!(f, " when bb{}", filter.0)?;
                }
                write!(f, " => bb{}", h.entry.0)?;
            }
            if let Some(cleanup) = &region.cleanup {
                write!(f, " finally self.{}", cleanup)?;
            }
            writeln!(f)?;
        }

        for block in &self.blocks {
            let marker = if block.id == self.entry_block { " (entry)" } else { "" };
            writeln!(f, "  bb{}:{}", block.id.0, marker)?;
            for stmt in &block.statements {
                writeln!(f, "    {}", stmt)?;
            }
            writeln!(f, "    {}", block.terminator)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_blocks_and_regions() {
        let mut b = BlockBuilder::new("demo".to_string(), MirType::I64);
        let x = b.alloc_local("x".to_string(), MirType::I64);
        let handler = b.create_block();
        b.push_stmt(MirStmt::Assign {
            dst: Place::Local(x),
            rvalue: MirRValue::Use(MirOperand::int(7)),
        });
        b.terminate(MirTerminator::Return { value: Some(MirOperand::Local(x)) });
        b.switch_to_block(handler);
        b.terminate(MirTerminator::Return { value: None });
        b.add_region(ExceptionRegion {
            start: BlockId(0),
            end: BlockId(1),
            handlers: vec![ExceptionHandler { tag: None, binding: None, filter: None, entry: handler }],
            cleanup: None,
        });
        let text = b.finish().to_string();
        assert!(text.contains("func demo() -> i64 {"));
        assert!(text.contains("let x: i64  // _0"));
        assert!(text.contains("protect bb0..bb1 catch _ => bb1"));
        assert!(text.contains("_0 = 7"));
        assert!(text.contains("return _0"));
    }

    #[test]
    fn prints_suspension_terminators() {
        let produce = MirTerminator::Suspend {
            kind: SuspendKind::Produce { value: MirOperand::int(1) },
            resume: BlockId(3),
        };
        assert_eq!(produce.to_string(), "produce 1 resume bb3");
        assert_eq!(MirStmt::SetState(-1).to_string(), "self.state = -1");
        assert_eq!(Place::Field(FieldId(2)).to_string(), "self.f2");
    }
}
