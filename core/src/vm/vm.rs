use std::rc::Rc;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, trace};

use crate::val::{Namespace, Val};

use super::bytecode::CodeUnit;
use super::decode::decode_at;
use super::fault::VmFault;
use super::frame::{Block, BlockKind, Frame};

/// Completion signal produced by one dispatch step. Drives the block-stack
/// unwinder; a signal that survives past all blocks terminates the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Return,
    Break,
    Continue,
    Exception,
}

/// The interpreter: a call stack of frames plus the two cross-frame
/// channels, the pending return/continue payload and the most recent
/// exception triple.
#[derive(Debug, Default)]
pub struct Vm {
    pub(super) frames: Vec<Frame>,
    /// RETURN_VALUE payload or CONTINUE_LOOP target; a single slot is
    /// enough because only one signal is in flight at a time.
    pub(super) pending: Val,
    /// Most recently raised `(type, value, traceback)` triple.
    pub(super) last_exception: Option<(Val, Val, Val)>,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames currently on the call stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn last_exception(&self) -> Option<&(Val, Val, Val)> {
        self.last_exception.as_ref()
    }

    /// Execute a compiled unit to completion and return its result.
    ///
    /// When no namespaces are supplied the unit runs as a program entry
    /// point: fresh globals seeded with the module dunders, and locals
    /// aliasing globals the way top-level code expects.
    pub fn run_code(
        &mut self,
        code: &Rc<CodeUnit>,
        globals: Option<Namespace>,
        locals: Option<Namespace>,
    ) -> Result<Val> {
        let globals = globals.unwrap_or_else(bootstrap_globals);
        let locals = locals.unwrap_or_else(|| globals.clone());
        let frame = self.make_frame(Rc::clone(code), locals, globals);
        match self.run_frame(frame)? {
            Some(v) => Ok(v),
            None => {
                let (kind, value, _) = self
                    .last_exception
                    .take()
                    .unwrap_or((Val::Nil, Val::Nil, Val::Nil));
                Err(anyhow!("unhandled {}: {}", kind, value))
            }
        }
    }

    /// Build a frame for `code`. Builtins are inherited by handle from the
    /// calling frame; the outermost frame reads them from a `__builtins__`
    /// map in its locals, if present.
    pub(crate) fn make_frame(
        &self,
        code: Rc<CodeUnit>,
        locals: Namespace,
        globals: Namespace,
    ) -> Frame {
        let builtins = match self.frames.last() {
            Some(back) => back.builtins.clone(),
            None => match locals.get("__builtins__") {
                Some(Val::Map(m)) => Namespace::from_handle(m),
                _ => Namespace::new(),
            },
        };
        let back = self.frames.len().checked_sub(1);
        Frame::new(code, locals, globals, builtins, back)
    }

    /// Run one frame to completion.
    ///
    /// `Ok(Some(v))` is a normal return, `Ok(None)` means an exception
    /// escaped the frame with `last_exception` holding the triple. A fatal
    /// error aborts the whole run.
    pub(crate) fn run_frame(&mut self, frame: Frame) -> Result<Option<Val>> {
        debug!(
            unit = %frame.code.name,
            depth = self.frames.len(),
            back = ?frame.back(),
            "entering frame"
        );
        self.frames.push(frame);
        let outcome = self.frame_loop();
        let frame = match self.frames.pop() {
            Some(f) => f,
            None => bail!("call stack underflow"),
        };
        debug!(unit = %frame.code.name, outcome = ?outcome, "leaving frame");
        match outcome? {
            Signal::Return => Ok(Some(std::mem::take(&mut self.pending))),
            Signal::Exception => Ok(None),
            sig => bail!("signal {:?} escaped unit '{}'", sig, frame.code.name),
        }
    }

    /// Fetch-decode-execute loop for the active frame. Runs until a signal
    /// survives the block stack.
    fn frame_loop(&mut self) -> Result<Signal> {
        loop {
            let (code, pc) = {
                let f = self.frame()?;
                (Rc::clone(&f.code), f.pc)
            };
            // Falling off the end is an implicit nil return
            if pc >= code.code.len() {
                self.pending = Val::Nil;
                return Ok(Signal::Return);
            }
            let decoded = decode_at(&code, pc)?;
            trace!(unit = %code.name, pc, op = ?decoded.op, "dispatch");
            self.frame_mut()?.pc = decoded.next;
            let mut why = self.dispatch(decoded)?;
            while let Some(sig) = why {
                if self.frame()?.blocks.is_empty() {
                    return Ok(sig);
                }
                why = self.manage_block_stack(sig)?;
            }
        }
    }

    /// Apply the unwind rules for the top block against `sig`. Returns the
    /// signal still pending after this block, or `None` once it is consumed.
    /// With no blocks the signal passes through untouched.
    pub(crate) fn manage_block_stack(&mut self, sig: Signal) -> Result<Option<Signal>> {
        let Some(&block) = self.frame()?.blocks.last() else {
            return Ok(Some(sig));
        };

        // continue re-enters the loop body, so its block stays armed and
        // the stack keeps whatever the body accumulated
        if block.kind == BlockKind::Loop && sig == Signal::Continue {
            self.jump(handler_of(block)?)?;
            return Ok(None);
        }

        self.frame_mut()?.pop_block()?;
        if block.kind == BlockKind::ExceptHandler {
            self.unwind_except_handler(block)?;
            return Ok(Some(sig));
        }
        self.frame_mut()?.truncate_stack(block.level);

        match (block.kind, sig) {
            (BlockKind::Loop, Signal::Break) => {
                self.jump(handler_of(block)?)?;
                Ok(None)
            }
            (BlockKind::SetupExcept | BlockKind::Finally, Signal::Exception) => {
                let triple = self
                    .last_exception
                    .clone()
                    .unwrap_or((Val::Nil, Val::Nil, Val::Nil));
                let frame = self.frame_mut()?;
                frame.push_block(BlockKind::ExceptHandler, None);
                // Two copies: the handler's cleanup eats one, handler code
                // reads the other. Traceback ends up on top.
                for _ in 0..2 {
                    frame.push(triple.0.clone());
                    frame.push(triple.1.clone());
                    frame.push(triple.2.clone());
                }
                self.jump(handler_of(block)?)?;
                Ok(None)
            }
            (BlockKind::Finally, Signal::Return | Signal::Continue) => {
                let payload = self.pending.clone();
                let frame = self.frame_mut()?;
                frame.push(payload);
                frame.push(Val::Signal(sig));
                self.jump(handler_of(block)?)?;
                Ok(None)
            }
            _ => Ok(Some(sig)),
        }
    }

    /// Drop an except-handler scope: discard the handler's leftovers down to
    /// the saved triple, then restore the previously handled exception
    /// from it.
    pub(crate) fn unwind_except_handler(&mut self, block: Block) -> Result<()> {
        let (kind, value, tb) = {
            let frame = self.frame_mut()?;
            frame.truncate_stack(block.level + 3);
            let tb = frame.pop()?;
            let value = frame.pop()?;
            let kind = frame.pop()?;
            (kind, value, tb)
        };
        self.last_exception = Some((kind, value, tb));
        Ok(())
    }

    /// Store a catchable fault as the most recent exception triple.
    pub(crate) fn record_fault(&mut self, fault: &VmFault) {
        debug!(kind = fault.kind.name(), message = %fault.message, "fault raised");
        self.last_exception = Some((
            Val::str(fault.kind.name()),
            Val::str(fault.message.as_str()),
            Val::Nil,
        ));
    }

    pub(crate) fn jump(&mut self, target: usize) -> Result<()> {
        self.frame_mut()?.pc = target;
        Ok(())
    }

    pub(crate) fn frame(&self) -> Result<&Frame> {
        match self.frames.last() {
            Some(f) => Ok(f),
            None => bail!("no active frame"),
        }
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut Frame> {
        match self.frames.last_mut() {
            Some(f) => Ok(f),
            None => bail!("no active frame"),
        }
    }

    pub(crate) fn push(&mut self, v: Val) -> Result<()> {
        self.frame_mut()?.push(v);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Val> {
        self.frame_mut()?.pop()
    }

    pub(crate) fn popn(&mut self, n: usize) -> Result<Vec<Val>> {
        self.frame_mut()?.popn(n)
    }
}

fn handler_of(block: Block) -> Result<usize> {
    match block.handler {
        Some(h) => Ok(h),
        None => bail!("{:?} block carries no handler target", block.kind),
    }
}

fn bootstrap_globals() -> Namespace {
    let ns = Namespace::new();
    ns.extend([
        (Rc::from("__builtins__"), Val::empty_map()),
        (Rc::from("__name__"), Val::str("__main__")),
        (Rc::from("__doc__"), Val::Nil),
        (Rc::from("__package__"), Val::Nil),
    ]);
    ns
}
