use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::val::Val;

/// Operand classification consulted by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    None,
    /// Constant-pool index
    Const,
    /// Name-table index
    Name,
    /// Local-variable-table index
    Local,
    /// Relative jump, in raw stream units (two per instruction)
    RelJump,
    /// Absolute jump, in raw stream units
    AbsJump,
    /// Raw integer passed through unchanged
    Raw,
}

/// The closed instruction set. Dispatch is an exhaustive match, so a unit
/// that deserializes successfully can never hit an unknown opcode at runtime;
/// the only desynchronization left is a stray EXTENDED_ARG reaching dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    PopTop,
    LoadConst,
    LoadName,
    StoreName,
    LoadFast,
    StoreFast,
    LoadGlobal,
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,
    BinaryPower,
    BinaryMultiply,
    BinaryFloorDivide,
    BinaryTrueDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinarySubscr,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    CompareOp,
    LoadAttr,
    StoreAttr,
    BuildList,
    BuildMap,
    StoreMap,
    ListAppend,
    JumpForward,
    JumpAbsolute,
    PopJumpIfTrue,
    PopJumpIfFalse,
    SetupLoop,
    GetIter,
    ForIter,
    BreakLoop,
    ContinueLoop,
    PopBlock,
    SetupExcept,
    SetupFinally,
    PopExcept,
    EndFinally,
    RaiseVarargs,
    MakeFunction,
    CallFunction,
    ReturnValue,
    // Closure opcodes are recognized but unsupported; they fault distinctly.
    LoadClosure,
    LoadDeref,
    StoreDeref,
    MakeClosure,
    PrintItem,
    PrintNewline,
    ExtendedArg,
}

impl Opcode {
    pub fn arg_kind(self) -> ArgKind {
        match self {
            Opcode::LoadConst => ArgKind::Const,
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::LoadGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr => ArgKind::Name,
            Opcode::LoadFast | Opcode::StoreFast => ArgKind::Local,
            Opcode::JumpForward
            | Opcode::SetupLoop
            | Opcode::ForIter
            | Opcode::SetupExcept
            | Opcode::SetupFinally => ArgKind::RelJump,
            Opcode::JumpAbsolute
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfFalse
            | Opcode::ContinueLoop => ArgKind::AbsJump,
            Opcode::CompareOp
            | Opcode::BuildList
            | Opcode::BuildMap
            | Opcode::ListAppend
            | Opcode::RaiseVarargs
            | Opcode::MakeFunction
            | Opcode::CallFunction
            | Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::MakeClosure
            | Opcode::ExtendedArg => ArgKind::Raw,
            _ => ArgKind::None,
        }
    }

    pub fn has_arg(self) -> bool {
        self.arg_kind() != ArgKind::None
    }
}

/// One raw stream entry, prior to operand resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawInstr {
    pub op: Opcode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<u32>,
}

impl RawInstr {
    pub fn new(op: Opcode) -> Self {
        Self { op, arg: None }
    }

    pub fn with_arg(op: Opcode, arg: u32) -> Self {
        Self { op, arg: Some(arg) }
    }
}

/// Serializable constant-pool entry; converted to `Val` at decode time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Code(Box<CodeUnit>),
}

impl Const {
    pub fn to_val(&self) -> Val {
        match self {
            Const::Nil => Val::Nil,
            Const::Bool(b) => Val::Bool(*b),
            Const::Int(i) => Val::Int(*i),
            Const::Float(x) => Val::Float(*x),
            Const::Str(s) => Val::str(s.as_str()),
            Const::Code(unit) => Val::Code(Rc::new((**unit).clone())),
        }
    }
}

/// Immutable compiled unit: the instruction stream plus its lookup tables.
/// Produced by the out-of-scope front-end, typically interchanged as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    /// Formal parameter names, bound positionally at call time.
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub consts: Vec<Const>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub varnames: Vec<String>,
    /// Captured-variable names. Non-empty means the unit needs closure
    /// cells, which this VM rejects with a distinct fault.
    #[serde(default)]
    pub freevars: Vec<String>,
    pub code: Vec<RawInstr>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, code: Vec<RawInstr>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            freevars: Vec::new(),
            code,
        }
    }

    pub fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_consts(mut self, consts: Vec<Const>) -> Self {
        self.consts = consts;
        self
    }

    pub fn with_names(mut self, names: &[&str]) -> Self {
        self.names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_varnames(mut self, varnames: &[&str]) -> Self {
        self.varnames = varnames.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_freevars(mut self, freevars: &[&str]) -> Self {
        self.freevars = freevars.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
