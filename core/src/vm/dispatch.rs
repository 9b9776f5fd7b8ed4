use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Result, anyhow};

use crate::val::{self, BinOp, CmpOp, IterState, Namespace, UnaryOp, Val};

use super::bytecode::Opcode;
use super::decode::{Decoded, Operand};
use super::fault::{FaultKind, OpError, VmFault};
use super::frame::BlockKind;
use super::function::FunctionValue;
use super::vm::{Signal, Vm};

impl Vm {
    /// Run one decoded instruction. Catchable faults are recorded centrally
    /// here and become the exception signal; individual handlers only
    /// produce them.
    pub(crate) fn dispatch(&mut self, d: Decoded) -> Result<Option<Signal>> {
        match self.execute(d) {
            Ok(sig) => Ok(sig),
            Err(OpError::Fault(fault)) => {
                self.record_fault(&fault);
                Ok(Some(Signal::Exception))
            }
            Err(OpError::Fatal(err)) => Err(err),
        }
    }

    fn execute(&mut self, d: Decoded) -> Result<Option<Signal>, OpError> {
        match d.op {
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::LoadConst => self.push(const_operand(&d)?)?,
            Opcode::LoadName => {
                let name = name_operand(&d)?;
                let frame = self.frame()?;
                let v = frame
                    .locals
                    .get(&name)
                    .or_else(|| frame.globals.get(&name))
                    .or_else(|| frame.builtins.get(&name))
                    .ok_or_else(|| {
                        VmFault::new(FaultKind::Name, format!("name '{name}' is not defined"))
                    })?;
                self.push(v)?;
            }
            Opcode::StoreName => {
                let name = name_operand(&d)?;
                let v = self.pop()?;
                self.frame()?.locals.set(name, v);
            }
            Opcode::LoadFast => {
                let name = name_operand(&d)?;
                let v = self.frame()?.locals.get(&name).ok_or_else(|| {
                    VmFault::new(
                        FaultKind::UnboundLocal,
                        format!("local variable '{name}' referenced before assignment"),
                    )
                })?;
                self.push(v)?;
            }
            Opcode::StoreFast => {
                let name = name_operand(&d)?;
                let v = self.pop()?;
                self.frame()?.locals.set(name, v);
            }
            Opcode::LoadGlobal => {
                let name = name_operand(&d)?;
                let frame = self.frame()?;
                let v = frame
                    .globals
                    .get(&name)
                    .or_else(|| frame.builtins.get(&name))
                    .ok_or_else(|| {
                        VmFault::new(
                            FaultKind::Name,
                            format!("global name '{name}' is not defined"),
                        )
                    })?;
                self.push(v)?;
            }
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryInvert => {
                let v = self.pop()?;
                self.push(val::unary(unary_op(d.op), &v)?)?;
            }
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr => {
                let args = self.popn(2)?;
                self.push(val::binary(bin_op(d.op), &args[0], &args[1])?)?;
            }
            Opcode::CompareOp => {
                let raw = raw_operand(&d)?;
                let op = CmpOp::from_raw(raw)
                    .ok_or_else(|| anyhow!("invalid comparison selector {raw}"))?;
                let args = self.popn(2)?;
                self.push(val::compare(op, &args[0], &args[1])?)?;
            }
            Opcode::LoadAttr => {
                let name = name_operand(&d)?;
                let obj = self.pop()?;
                let Val::Map(m) = &obj else {
                    return Err(VmFault::new(
                        FaultKind::Attribute,
                        format!("'{}' object has no attributes", obj.type_name()),
                    )
                    .into());
                };
                let v = m.borrow().get(name.as_ref()).cloned().ok_or_else(|| {
                    VmFault::new(
                        FaultKind::Attribute,
                        format!("'map' object has no attribute '{name}'"),
                    )
                })?;
                self.push(v)?;
            }
            Opcode::StoreAttr => {
                let name = name_operand(&d)?;
                let obj = self.pop()?;
                let v = self.pop()?;
                let Val::Map(m) = &obj else {
                    return Err(VmFault::new(
                        FaultKind::Attribute,
                        format!(
                            "'{}' object does not support attribute assignment",
                            obj.type_name()
                        ),
                    )
                    .into());
                };
                m.borrow_mut().insert(name, v);
            }
            Opcode::BuildList => {
                let n = raw_operand(&d)? as usize;
                let items = self.popn(n)?;
                self.push(Val::from_vec(items))?;
            }
            // The operand is only a size hint; entries arrive via STORE_MAP
            Opcode::BuildMap => self.push(Val::empty_map())?,
            Opcode::StoreMap => {
                let mut args = self.popn(3)?;
                let key = args.pop().ok_or_else(|| anyhow!("STORE_MAP underflow"))?;
                let value = args.pop().ok_or_else(|| anyhow!("STORE_MAP underflow"))?;
                let map = args.pop().ok_or_else(|| anyhow!("STORE_MAP underflow"))?;
                let Val::Str(key) = key else {
                    return Err(VmFault::new(
                        FaultKind::Type,
                        format!("map keys must be strings, got '{}'", key.type_name()),
                    )
                    .into());
                };
                let Val::Map(m) = &map else {
                    return Err(OpError::Fatal(anyhow!("STORE_MAP against a non-map")));
                };
                m.borrow_mut().insert(key, value);
                self.push(map)?;
            }
            Opcode::ListAppend => {
                let depth = raw_operand(&d)? as usize;
                let v = self.pop()?;
                let target = self.frame()?.peek(depth)?;
                let Val::List(l) = target else {
                    return Err(OpError::Fatal(anyhow!("LIST_APPEND against a non-list")));
                };
                l.borrow_mut().push(v);
            }
            Opcode::JumpForward | Opcode::JumpAbsolute => self.jump(target_operand(&d)?)?,
            Opcode::PopJumpIfTrue => {
                let v = self.pop()?;
                if v.is_truthy() {
                    self.jump(target_operand(&d)?)?;
                }
            }
            Opcode::PopJumpIfFalse => {
                let v = self.pop()?;
                if !v.is_truthy() {
                    self.jump(target_operand(&d)?)?;
                }
            }
            Opcode::SetupLoop => {
                let target = target_operand(&d)?;
                self.frame_mut()?.push_block(BlockKind::Loop, Some(target));
            }
            Opcode::GetIter => {
                let v = self.pop()?;
                let iter = match v {
                    // Already an iterator handle; pass it through
                    Val::Iter(_) => v,
                    _ => Val::Iter(Rc::new(RefCell::new(IterState::from_val(&v)?))),
                };
                self.push(iter)?;
            }
            Opcode::ForIter => {
                let target = target_operand(&d)?;
                let Val::Iter(it) = self.frame()?.top()? else {
                    return Err(OpError::Fatal(anyhow!("FOR_ITER against a non-iterator")));
                };
                let next = it.borrow_mut().next();
                match next {
                    Some(v) => self.push(v)?,
                    None => {
                        self.pop()?;
                        self.jump(target)?;
                    }
                }
            }
            Opcode::BreakLoop => return Ok(Some(Signal::Break)),
            Opcode::ContinueLoop => {
                // Target travels through the pending slot so a finally body
                // can observe it; the loop block supplies the actual jump.
                self.pending = Val::Int(target_operand(&d)? as i64);
                return Ok(Some(Signal::Continue));
            }
            Opcode::PopBlock => {
                self.frame_mut()?.pop_block()?;
            }
            Opcode::SetupExcept => {
                let target = target_operand(&d)?;
                self.frame_mut()?
                    .push_block(BlockKind::SetupExcept, Some(target));
            }
            Opcode::SetupFinally => {
                let target = target_operand(&d)?;
                self.frame_mut()?
                    .push_block(BlockKind::Finally, Some(target));
            }
            Opcode::PopExcept => {
                let block = self.frame_mut()?.pop_block()?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(OpError::Fatal(anyhow!(
                        "POP_EXCEPT without an active handler block"
                    )));
                }
                self.unwind_except_handler(block)?;
            }
            Opcode::EndFinally => return self.end_finally(),
            Opcode::RaiseVarargs => return self.raise_varargs(raw_operand(&d)?),
            Opcode::MakeFunction => {
                let argc = raw_operand(&d)? as usize;
                // Stack is [defaults..., code, name] with the name on top;
                // nil defers to the unit's own name
                let name = match self.pop()? {
                    Val::Str(s) => Some(s),
                    Val::Nil => None,
                    v => {
                        return Err(OpError::Fatal(anyhow!(
                            "MAKE_FUNCTION name must be a string or nil, got '{}'",
                            v.type_name()
                        )));
                    }
                };
                let code = self.pop()?;
                let defaults = self.popn(argc)?;
                let Val::Code(code) = code else {
                    return Err(OpError::Fatal(anyhow!(
                        "MAKE_FUNCTION against a non-code value"
                    )));
                };
                let globals = self.frame()?.globals.clone();
                let func = FunctionValue::new(name, code, globals, defaults)?;
                self.push(Val::Function(Rc::new(func)))?;
            }
            Opcode::CallFunction => return self.call_function(raw_operand(&d)?),
            Opcode::ReturnValue => {
                self.pending = self.pop()?;
                return Ok(Some(Signal::Return));
            }
            Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::MakeClosure => {
                return Err(
                    VmFault::new(FaultKind::Unsupported, "closure cells are not supported").into(),
                );
            }
            Opcode::PrintItem => {
                let v = self.pop()?;
                print!("{v}");
            }
            Opcode::PrintNewline => println!(),
            Opcode::ExtendedArg => {
                return Err(OpError::Fatal(anyhow!("EXTENDED_ARG reached dispatch")));
            }
        }
        Ok(None)
    }

    /// Leave a finally body: a signal tag stashed by the unwinder resumes
    /// its propagation, a plain nil means the body ran without one pending.
    fn end_finally(&mut self) -> Result<Option<Signal>, OpError> {
        let tag = self.pop()?;
        match tag {
            Val::Signal(sig) => {
                if matches!(sig, Signal::Return | Signal::Continue) {
                    self.pending = self.pop()?;
                }
                Ok(Some(sig))
            }
            Val::Nil => Ok(None),
            v => Err(OpError::Fatal(anyhow!(
                "END_FINALLY found '{}' instead of a signal tag",
                v.type_name()
            ))),
        }
    }

    fn raise_varargs(&mut self, argc: u32) -> Result<Option<Signal>, OpError> {
        match argc {
            // Bare re-raise of the exception being handled
            0 => {
                if self.last_exception.is_none() {
                    return Err(VmFault::new(
                        FaultKind::Runtime,
                        "no active exception to re-raise",
                    )
                    .into());
                }
                Ok(Some(Signal::Exception))
            }
            1 => {
                let v = self.pop()?;
                let kind = match &v {
                    Val::Str(s) => FaultKind::from_name(s).unwrap_or(FaultKind::Runtime),
                    _ => FaultKind::Runtime,
                };
                self.last_exception = Some((Val::str(kind.name()), v, Val::Nil));
                Ok(Some(Signal::Exception))
            }
            2 | 3 => Err(VmFault::new(
                FaultKind::Unsupported,
                "raise with cause or traceback arguments",
            )
            .into()),
            n => Err(OpError::Fatal(anyhow!("RAISE_VARARGS with argc {n}"))),
        }
    }

    /// Pop callee and positional arguments, invoke, push the result.
    /// Bytecode functions run their frame to completion before control
    /// returns here.
    fn call_function(&mut self, arg: u32) -> Result<Option<Signal>, OpError> {
        let kw = arg >> 8;
        if kw != 0 {
            return Err(VmFault::new(
                FaultKind::Unsupported,
                "keyword-argument calls are not supported",
            )
            .into());
        }
        let args = self.popn((arg & 0xff) as usize)?;
        let callee = self.pop()?;
        match callee {
            Val::Function(f) => {
                let locals = Namespace::from_map(f.bind(&args)?);
                let frame = self.make_frame(Rc::clone(&f.code), locals, f.globals.clone());
                match self.run_frame(frame)? {
                    Some(v) => self.push(v)?,
                    // Exception escaped the callee; resume unwinding here
                    // with the triple already recorded
                    None => return Ok(Some(Signal::Exception)),
                }
            }
            Val::Native(n) => {
                let v = (n.func)(&args)?;
                self.push(v)?;
            }
            v => {
                return Err(VmFault::new(
                    FaultKind::Type,
                    format!("'{}' object is not callable", v.type_name()),
                )
                .into());
            }
        }
        Ok(None)
    }
}

fn unary_op(op: Opcode) -> UnaryOp {
    match op {
        Opcode::UnaryPositive => UnaryOp::Positive,
        Opcode::UnaryNegative => UnaryOp::Negative,
        Opcode::UnaryNot => UnaryOp::Not,
        _ => UnaryOp::Invert,
    }
}

fn bin_op(op: Opcode) -> BinOp {
    match op {
        Opcode::BinaryPower => BinOp::Power,
        Opcode::BinaryMultiply => BinOp::Multiply,
        Opcode::BinaryFloorDivide => BinOp::FloorDivide,
        Opcode::BinaryTrueDivide => BinOp::TrueDivide,
        Opcode::BinaryModulo => BinOp::Modulo,
        Opcode::BinaryAdd => BinOp::Add,
        Opcode::BinarySubtract => BinOp::Subtract,
        Opcode::BinarySubscr => BinOp::Subscr,
        Opcode::BinaryLshift => BinOp::Lshift,
        Opcode::BinaryRshift => BinOp::Rshift,
        Opcode::BinaryAnd => BinOp::And,
        Opcode::BinaryXor => BinOp::Xor,
        _ => BinOp::Or,
    }
}

fn const_operand(d: &Decoded) -> Result<Val, OpError> {
    match &d.operand {
        Some(Operand::Const(v)) => Ok(v.clone()),
        _ => Err(operand_mismatch(d, "constant")),
    }
}

fn name_operand(d: &Decoded) -> Result<Rc<str>, OpError> {
    match &d.operand {
        Some(Operand::Name(n)) => Ok(Rc::clone(n)),
        _ => Err(operand_mismatch(d, "name")),
    }
}

fn target_operand(d: &Decoded) -> Result<usize, OpError> {
    match &d.operand {
        Some(Operand::Target(t)) => Ok(*t),
        _ => Err(operand_mismatch(d, "jump target")),
    }
}

fn raw_operand(d: &Decoded) -> Result<u32, OpError> {
    match &d.operand {
        Some(Operand::Raw(r)) => Ok(*r),
        _ => Err(operand_mismatch(d, "raw")),
    }
}

fn operand_mismatch(d: &Decoded, expected: &str) -> OpError {
    OpError::Fatal(anyhow!(
        "opcode {:?} expects a {} operand, got {:?}",
        d.op,
        expected,
        d.operand
    ))
}
