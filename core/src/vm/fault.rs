use std::fmt;

/// Classification of catchable runtime faults.
///
/// Every kind carries a stable display name which doubles as the exception
/// "type" value pushed onto the data stack for handler code to match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Name absent from locals, globals and builtins.
    Name,
    /// Fast local read before assignment. Stricter than `Name`: the local
    /// table guarantees the slot exists, it just has no value yet.
    UnboundLocal,
    Type,
    Value,
    Index,
    Key,
    Attribute,
    ZeroDivision,
    /// Positional/default argument binding failed at call time.
    Arity,
    /// The program needs a feature this VM deliberately does not implement
    /// (closure cells, keyword call forms).
    Unsupported,
    /// Explicitly raised by program code.
    Runtime,
}

impl FaultKind {
    pub fn name(self) -> &'static str {
        match self {
            FaultKind::Name => "NameError",
            FaultKind::UnboundLocal => "UnboundLocalError",
            FaultKind::Type => "TypeError",
            FaultKind::Value => "ValueError",
            FaultKind::Index => "IndexError",
            FaultKind::Key => "KeyError",
            FaultKind::Attribute => "AttributeError",
            FaultKind::ZeroDivision => "ZeroDivisionError",
            FaultKind::Arity => "ArityError",
            FaultKind::Unsupported => "UnsupportedError",
            FaultKind::Runtime => "RuntimeError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "NameError" => FaultKind::Name,
            "UnboundLocalError" => FaultKind::UnboundLocal,
            "TypeError" => FaultKind::Type,
            "ValueError" => FaultKind::Value,
            "IndexError" => FaultKind::Index,
            "KeyError" => FaultKind::Key,
            "AttributeError" => FaultKind::Attribute,
            "ZeroDivisionError" => FaultKind::ZeroDivision,
            "ArityError" => FaultKind::Arity,
            "UnsupportedError" => FaultKind::Unsupported,
            "RuntimeError" => FaultKind::Runtime,
            _ => return None,
        })
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime fault that in-program exception blocks can catch.
///
/// Fatal interpreter errors (decoder desynchronization, malformed operands)
/// never use this type; they abort the run through `anyhow::Error`.
#[derive(Debug, Clone, PartialEq)]
pub struct VmFault {
    pub kind: FaultKind,
    pub message: String,
}

impl VmFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for VmFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for VmFault {}

/// Error channel for opcode handlers: either a catchable fault that the
/// dispatcher converts into the exception signal, or a fatal error that
/// terminates the whole run.
#[derive(Debug)]
pub(crate) enum OpError {
    Fault(VmFault),
    Fatal(anyhow::Error),
}

impl From<VmFault> for OpError {
    fn from(fault: VmFault) -> Self {
        OpError::Fault(fault)
    }
}

impl From<anyhow::Error> for OpError {
    fn from(err: anyhow::Error) -> Self {
        OpError::Fatal(err)
    }
}
