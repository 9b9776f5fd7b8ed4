use std::rc::Rc;

use anyhow::{Result, bail};

use crate::val::{Namespace, Val};

use super::bytecode::CodeUnit;

/// Structured-control marker kinds on a frame's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Loop,
    SetupExcept,
    Finally,
    /// Pushed by the unwinder itself when an exception enters a handler;
    /// carries no jump target.
    ExceptHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub handler: Option<usize>,
    /// Data-stack depth at block entry; unwinding truncates back to it.
    pub level: usize,
}

/// One activation record: the unit being executed, its three namespaces,
/// a data stack, a block stack and an instruction pointer. Owned by the VM
/// call stack and mutated only while it is the active frame.
#[derive(Debug)]
pub struct Frame {
    pub code: Rc<CodeUnit>,
    pub locals: Namespace,
    pub globals: Namespace,
    pub builtins: Namespace,
    pub stack: Vec<Val>,
    pub blocks: Vec<Block>,
    pub pc: usize,
    back: Option<usize>,
}

impl Frame {
    pub fn new(
        code: Rc<CodeUnit>,
        locals: Namespace,
        globals: Namespace,
        builtins: Namespace,
        back: Option<usize>,
    ) -> Self {
        Self {
            code,
            locals,
            globals,
            builtins,
            stack: Vec::new(),
            blocks: Vec::new(),
            pc: 0,
            back,
        }
    }

    /// Call-stack index of the caller's frame, if any.
    pub fn back(&self) -> Option<usize> {
        self.back
    }

    pub fn push(&mut self, v: Val) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Result<Val> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => bail!("data stack underflow in unit '{}'", self.code.name),
        }
    }

    /// Pop `n` values, preserving their stack order (deepest first).
    pub fn popn(&mut self, n: usize) -> Result<Vec<Val>> {
        if self.stack.len() < n {
            bail!(
                "data stack underflow in unit '{}': need {}, have {}",
                self.code.name,
                n,
                self.stack.len()
            );
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub fn top(&self) -> Result<&Val> {
        self.peek(1)
    }

    /// Value `n` slots below the top (1 = top of stack).
    pub fn peek(&self, n: usize) -> Result<&Val> {
        if n == 0 || n > self.stack.len() {
            bail!("data stack peek {} out of range in unit '{}'", n, self.code.name);
        }
        Ok(&self.stack[self.stack.len() - n])
    }

    pub fn truncate_stack(&mut self, level: usize) {
        self.stack.truncate(level);
    }

    /// Push a block recording the current data-stack depth.
    pub fn push_block(&mut self, kind: BlockKind, handler: Option<usize>) {
        self.blocks.push(Block {
            kind,
            handler,
            level: self.stack.len(),
        });
    }

    pub fn pop_block(&mut self) -> Result<Block> {
        match self.blocks.pop() {
            Some(b) => Ok(b),
            None => bail!("block stack underflow in unit '{}'", self.code.name),
        }
    }
}
