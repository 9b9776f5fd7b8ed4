use std::rc::Rc;

use anyhow::{Result, bail};

use crate::val::Val;

use super::bytecode::{ArgKind, CodeUnit, Opcode};

/// A resolved operand. Jump operands are already absolute indices into the
/// owning unit's instruction stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Const(Val),
    Name(Rc<str>),
    Target(usize),
    Raw(u32),
}

/// One decoded logical instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub op: Opcode,
    pub operand: Option<Operand>,
    /// Stream position of the following instruction.
    pub next: usize,
}

/// Decode one logical instruction starting at `pos`.
///
/// EXTENDED_ARG prefixes accumulate into the following instruction's raw
/// argument (each prefix contributes the next-higher 8 bits) and emit no
/// instruction of their own. All failures here are fatal: they mean the
/// stream and its tables disagree, not that the program misbehaved.
pub fn decode_at(unit: &CodeUnit, pos: usize) -> Result<Decoded> {
    let mut pos = pos;
    let mut ext: u32 = 0;
    loop {
        let Some(instr) = unit.code.get(pos) else {
            bail!("instruction index {} out of range in unit '{}'", pos, unit.name);
        };
        pos += 1;
        if instr.op == Opcode::ExtendedArg {
            ext = (ext | instr.arg.unwrap_or(0)) << 8;
            continue;
        }
        let operand = if instr.op.has_arg() {
            let Some(raw) = instr.arg else {
                bail!("opcode {:?} at {} requires an argument", instr.op, pos - 1);
            };
            Some(resolve(unit, instr.op.arg_kind(), ext | raw, pos)?)
        } else {
            if ext != 0 {
                bail!("EXTENDED_ARG before argument-less opcode {:?}", instr.op);
            }
            None
        };
        return Ok(Decoded {
            op: instr.op,
            operand,
            next: pos,
        });
    }
}

fn resolve(unit: &CodeUnit, kind: ArgKind, raw: u32, next: usize) -> Result<Operand> {
    Ok(match kind {
        ArgKind::Const => {
            let Some(c) = unit.consts.get(raw as usize) else {
                bail!("constant index {} out of range in unit '{}'", raw, unit.name);
            };
            Operand::Const(c.to_val())
        }
        ArgKind::Name => Operand::Name(table_entry(&unit.names, raw, "name", unit)?),
        ArgKind::Local => Operand::Name(table_entry(&unit.varnames, raw, "local", unit)?),
        // Raw jump operands count two stream slots per instruction, hence
        // the halving.
        ArgKind::RelJump => Operand::Target(next + (raw as usize) / 2),
        ArgKind::AbsJump => Operand::Target((raw as usize) / 2),
        ArgKind::Raw => Operand::Raw(raw),
        ArgKind::None => bail!("argument-less opcode reached operand resolution"),
    })
}

fn table_entry(table: &[String], idx: u32, what: &str, unit: &CodeUnit) -> Result<Rc<str>> {
    let Some(s) = table.get(idx as usize) else {
        bail!("{} index {} out of range in unit '{}'", what, idx, unit.name);
    };
    Ok(Rc::from(s.as_str()))
}
