use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::vm::{CodeUnit, FunctionValue, Signal, VmFault};

mod iter;
mod ops;

pub use iter::IterState;
pub use ops::{BinOp, CmpOp, UnaryOp, binary, compare, unary};


/// Host function callable from bytecode without creating a frame.
pub type NativeFn = fn(args: &[Val]) -> Result<Val, VmFault>;

/// A named host function pointer, so embedders can seed builtins or globals
/// with native callables.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Dynamic value model.
///
/// Lists and maps are reference counted with interior mutability because the
/// instruction set mutates them in place (LIST_APPEND, STORE_MAP, STORE_ATTR)
/// and the mutation must be visible through every alias. The VM is
/// single-threaded, so `Rc` rather than `Arc`.
#[derive(Debug, Clone, Default)]
pub enum Val {
    /// String, wrapped in Rc<str> for cheap cloning
    Str(Rc<str>),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Rc<RefCell<Vec<Val>>>),
    Map(Rc<RefCell<FastHashMap<Rc<str>, Val>>>),
    /// A compiled unit as a first-class constant, consumed by MAKE_FUNCTION
    Code(Rc<CodeUnit>),
    /// Bytecode function value
    Function(Rc<FunctionValue>),
    /// Host function pointer
    Native(NativeFunction),
    /// Materialized iterator handle (GET_ITER / FOR_ITER)
    Iter(Rc<RefCell<IterState>>),
    /// Unwind tag pushed by a finally unwind; consumed by END_FINALLY.
    /// Never produced by constants.
    Signal(Signal),
    #[default]
    Nil,
}

impl Val {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Val::Str(s.into())
    }

    pub fn from_vec(items: Vec<Val>) -> Self {
        Val::List(Rc::new(RefCell::new(items)))
    }

    pub fn from_map(map: FastHashMap<Rc<str>, Val>) -> Self {
        Val::Map(Rc::new(RefCell::new(map)))
    }

    pub fn empty_map() -> Self {
        Val::from_map(fast_hash_map_new())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Str(_) => "str",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Bool(_) => "bool",
            Val::List(_) => "list",
            Val::Map(_) => "map",
            Val::Code(_) => "code",
            Val::Function(_) => "function",
            Val::Native(_) => "native",
            Val::Iter(_) => "iterator",
            Val::Signal(_) => "signal",
            Val::Nil => "nil",
        }
    }

    /// Truthiness: nil, false, zero and empty containers are falsey.
    pub fn is_truthy(&self) -> bool {
        match self {
            Val::Nil | Val::Bool(false) => false,
            Val::Int(i) => *i != 0,
            Val::Float(x) => *x != 0.0,
            Val::Str(s) => !s.is_empty(),
            Val::List(l) => !l.borrow().is_empty(),
            Val::Map(m) => !m.borrow().is_empty(),
            _ => true,
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Nil, Val::Nil) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Int(a), Val::Float(b)) | (Val::Float(b), Val::Int(a)) => *a as f64 == *b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::List(a), Val::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Val::Map(a), Val::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Val::Code(a), Val::Code(b)) => Rc::ptr_eq(a, b),
            (Val::Function(a), Val::Function(b)) => Rc::ptr_eq(a, b),
            (Val::Native(a), Val::Native(b)) => a.func == b.func,
            (Val::Iter(a), Val::Iter(b)) => Rc::ptr_eq(a, b),
            (Val::Signal(a), Val::Signal(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Str(s) => f.write_str(s),
            Val::Int(i) => {
                let mut buf = itoa::Buffer::new();
                f.write_str(buf.format(*i))
            }
            Val::Float(x) => {
                let mut buf = ryu::Buffer::new();
                f.write_str(buf.format(*x))
            }
            Val::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Val::List(l) => {
                f.write_str("[")?;
                for (i, v) in l.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Val::Map(m) => {
                // Stable key order so output is deterministic
                let m = m.borrow();
                let mut keys: Vec<&Rc<str>> = m.keys().collect();
                keys.sort();
                f.write_str("{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, m[k.as_ref()])?;
                }
                f.write_str("}")
            }
            Val::Code(c) => write!(f, "<code {}>", c.name),
            Val::Function(func) => write!(f, "<function {}>", func.name),
            Val::Native(n) => write!(f, "<native {}>", n.name),
            Val::Iter(_) => f.write_str("<iterator>"),
            Val::Signal(sig) => write!(f, "<signal {sig:?}>"),
            Val::Nil => f.write_str("nil"),
        }
    }
}

/// Shared-ownership handle to one name→value mapping.
///
/// Cloning shares the underlying map: sibling frames of one defining unit
/// see each other's global writes, and builtins are inherited by handle down
/// the call chain.
#[derive(Debug, Clone, Default)]
pub struct Namespace(Rc<RefCell<FastHashMap<Rc<str>, Val>>>);

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: FastHashMap<Rc<str>, Val>) -> Self {
        Self(Rc::new(RefCell::new(map)))
    }

    /// Wrap an existing map handle (e.g. a `Val::Map` used as `__builtins__`)
    /// without copying it.
    pub fn from_handle(handle: Rc<RefCell<FastHashMap<Rc<str>, Val>>>) -> Self {
        Self(handle)
    }

    pub fn get(&self, name: &str) -> Option<Val> {
        self.0.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<Rc<str>>, value: Val) {
        self.0.borrow_mut().insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().contains_key(name)
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = (Rc<str>, Val)>) {
        self.0.borrow_mut().extend(entries);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// True when both handles refer to the same underlying map.
    pub fn shares_with(&self, other: &Namespace) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
