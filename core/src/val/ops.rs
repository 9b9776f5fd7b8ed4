use std::rc::Rc;

use crate::vm::{FaultKind, VmFault};

use super::Val;

/// Binary operator selectors, one per BINARY_* opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Power,
    Multiply,
    FloorDivide,
    TrueDivide,
    Modulo,
    Add,
    Subtract,
    Subscr,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Power => "**",
            BinOp::Multiply => "*",
            BinOp::FloorDivide => "//",
            BinOp::TrueDivide => "/",
            BinOp::Modulo => "%",
            BinOp::Add => "+",
            BinOp::Subtract => "-",
            BinOp::Subscr => "[]",
            BinOp::Lshift => "<<",
            BinOp::Rshift => ">>",
            BinOp::And => "&",
            BinOp::Xor => "^",
            BinOp::Or => "|",
        }
    }
}

/// Unary operator selectors, one per UNARY_* opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
}

/// Comparison selectors for COMPARE_OP, indexed by the raw operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExcMatch,
}

impl CmpOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => CmpOp::Lt,
            1 => CmpOp::Le,
            2 => CmpOp::Eq,
            3 => CmpOp::Ne,
            4 => CmpOp::Gt,
            5 => CmpOp::Ge,
            6 => CmpOp::In,
            7 => CmpOp::NotIn,
            8 => CmpOp::Is,
            9 => CmpOp::IsNot,
            10 => CmpOp::ExcMatch,
            _ => return None,
        })
    }
}

enum NumPair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn num_pair(x: &Val, y: &Val) -> Option<NumPair> {
    match (x, y) {
        (Val::Int(a), Val::Int(b)) => Some(NumPair::Ints(*a, *b)),
        (Val::Float(a), Val::Float(b)) => Some(NumPair::Floats(*a, *b)),
        (Val::Int(a), Val::Float(b)) => Some(NumPair::Floats(*a as f64, *b)),
        (Val::Float(a), Val::Int(b)) => Some(NumPair::Floats(*a, *b as f64)),
        _ => None,
    }
}

fn err_binary(op: BinOp, x: &Val, y: &Val) -> VmFault {
    VmFault::new(
        FaultKind::Type,
        format!(
            "unsupported operand types for {}: '{}' and '{}'",
            op.symbol(),
            x.type_name(),
            y.type_name()
        ),
    )
}

pub fn binary(op: BinOp, x: &Val, y: &Val) -> Result<Val, VmFault> {
    match op {
        BinOp::Add => add(x, y),
        BinOp::Subtract => match num_pair(x, y) {
            Some(NumPair::Ints(a, b)) => Ok(match a.checked_sub(b) {
                Some(v) => Val::Int(v),
                None => Val::Float(a as f64 - b as f64),
            }),
            Some(NumPair::Floats(a, b)) => Ok(Val::Float(a - b)),
            None => Err(err_binary(op, x, y)),
        },
        BinOp::Multiply => multiply(x, y),
        BinOp::TrueDivide => match num_pair(x, y) {
            Some(NumPair::Ints(_, 0)) => Err(zero_division("division by zero")),
            Some(NumPair::Ints(a, b)) => Ok(Val::Float(a as f64 / b as f64)),
            Some(NumPair::Floats(a, b)) => {
                if b == 0.0 {
                    Err(zero_division("float division by zero"))
                } else {
                    Ok(Val::Float(a / b))
                }
            }
            None => Err(err_binary(op, x, y)),
        },
        BinOp::FloorDivide => match num_pair(x, y) {
            Some(NumPair::Ints(_, 0)) => Err(zero_division("integer division by zero")),
            Some(NumPair::Ints(a, b)) => Ok(match a.checked_div_euclid(b) {
                Some(v) => Val::Int(v),
                None => Val::Float((a as f64 / b as f64).floor()),
            }),
            Some(NumPair::Floats(a, b)) => {
                if b == 0.0 {
                    Err(zero_division("float floor division by zero"))
                } else {
                    Ok(Val::Float((a / b).floor()))
                }
            }
            None => Err(err_binary(op, x, y)),
        },
        BinOp::Modulo => match num_pair(x, y) {
            Some(NumPair::Ints(_, 0)) => Err(zero_division("integer modulo by zero")),
            // i64::MIN % -1 is the only overflowing case; its remainder is 0
            Some(NumPair::Ints(a, b)) => {
                Ok(Val::Int(a.checked_rem_euclid(b).unwrap_or(0)))
            }
            Some(NumPair::Floats(a, b)) => {
                if b == 0.0 {
                    Err(zero_division("float modulo by zero"))
                } else {
                    Ok(Val::Float(a - b * (a / b).floor()))
                }
            }
            None => Err(err_binary(op, x, y)),
        },
        BinOp::Power => match num_pair(x, y) {
            Some(NumPair::Ints(a, b)) if b >= 0 => match u32::try_from(b).ok().and_then(|e| a.checked_pow(e)) {
                Some(v) => Ok(Val::Int(v)),
                // Overflowing integer powers degrade to float
                None => Ok(Val::Float((a as f64).powf(b as f64))),
            },
            Some(NumPair::Ints(a, b)) => Ok(Val::Float((a as f64).powf(b as f64))),
            Some(NumPair::Floats(a, b)) => Ok(Val::Float(a.powf(b))),
            None => Err(err_binary(op, x, y)),
        },
        BinOp::Subscr => subscr(x, y),
        BinOp::Lshift | BinOp::Rshift => shift(op, x, y),
        BinOp::And => match (x, y) {
            (Val::Int(a), Val::Int(b)) => Ok(Val::Int(a & b)),
            (Val::Bool(a), Val::Bool(b)) => Ok(Val::Bool(a & b)),
            _ => Err(err_binary(op, x, y)),
        },
        BinOp::Xor => match (x, y) {
            (Val::Int(a), Val::Int(b)) => Ok(Val::Int(a ^ b)),
            (Val::Bool(a), Val::Bool(b)) => Ok(Val::Bool(a ^ b)),
            _ => Err(err_binary(op, x, y)),
        },
        BinOp::Or => match (x, y) {
            (Val::Int(a), Val::Int(b)) => Ok(Val::Int(a | b)),
            (Val::Bool(a), Val::Bool(b)) => Ok(Val::Bool(a | b)),
            _ => Err(err_binary(op, x, y)),
        },
    }
}

fn zero_division(message: &str) -> VmFault {
    VmFault::new(FaultKind::ZeroDivision, message)
}

fn add(x: &Val, y: &Val) -> Result<Val, VmFault> {
    if let Some(pair) = num_pair(x, y) {
        return Ok(match pair {
            // Overflowing integer sums degrade to float, like Power
            NumPair::Ints(a, b) => match a.checked_add(b) {
                Some(v) => Val::Int(v),
                None => Val::Float(a as f64 + b as f64),
            },
            NumPair::Floats(a, b) => Val::Float(a + b),
        });
    }
    match (x, y) {
        (Val::Str(a), Val::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Ok(Val::str(s))
        }
        (Val::List(a), Val::List(b)) => {
            let mut merged = a.borrow().clone();
            merged.extend(b.borrow().iter().cloned());
            Ok(Val::from_vec(merged))
        }
        (Val::Map(a), Val::Map(b)) => {
            let mut merged = a.borrow().clone();
            for (k, v) in b.borrow().iter() {
                merged.insert(k.clone(), v.clone());
            }
            Ok(Val::from_map(merged))
        }
        _ => Err(err_binary(BinOp::Add, x, y)),
    }
}

fn multiply(x: &Val, y: &Val) -> Result<Val, VmFault> {
    if let Some(pair) = num_pair(x, y) {
        return Ok(match pair {
            NumPair::Ints(a, b) => match a.checked_mul(b) {
                Some(v) => Val::Int(v),
                None => Val::Float(a as f64 * b as f64),
            },
            NumPair::Floats(a, b) => Val::Float(a * b),
        });
    }
    match (x, y) {
        (Val::Str(s), Val::Int(n)) | (Val::Int(n), Val::Str(s)) => {
            let count = (*n).max(0) as usize;
            Ok(Val::str(s.repeat(count)))
        }
        _ => Err(err_binary(BinOp::Multiply, x, y)),
    }
}

fn subscr(x: &Val, y: &Val) -> Result<Val, VmFault> {
    match (x, y) {
        (Val::List(l), Val::Int(i)) => {
            let l = l.borrow();
            let idx = normalize_index(*i, l.len())
                .ok_or_else(|| VmFault::new(FaultKind::Index, "list index out of range"))?;
            Ok(l[idx].clone())
        }
        (Val::Str(s), Val::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())
                .ok_or_else(|| VmFault::new(FaultKind::Index, "string index out of range"))?;
            Ok(Val::str(chars[idx].to_string()))
        }
        (Val::Map(m), Val::Str(k)) => m
            .borrow()
            .get(k.as_ref())
            .cloned()
            .ok_or_else(|| VmFault::new(FaultKind::Key, format!("'{k}'"))),
        _ => Err(err_binary(BinOp::Subscr, x, y)),
    }
}

fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if (0..len).contains(&idx) { Some(idx as usize) } else { None }
}

fn shift(op: BinOp, x: &Val, y: &Val) -> Result<Val, VmFault> {
    let (Val::Int(a), Val::Int(b)) = (x, y) else {
        return Err(err_binary(op, x, y));
    };
    if *b < 0 {
        return Err(VmFault::new(FaultKind::Value, "negative shift count"));
    }
    if *b >= 64 {
        return Err(VmFault::new(FaultKind::Value, "shift count too large"));
    }
    Ok(Val::Int(match op {
        BinOp::Lshift => a << b,
        _ => a >> b,
    }))
}

pub fn unary(op: UnaryOp, v: &Val) -> Result<Val, VmFault> {
    match (op, v) {
        (UnaryOp::Positive, Val::Int(i)) => Ok(Val::Int(*i)),
        (UnaryOp::Positive, Val::Float(x)) => Ok(Val::Float(*x)),
        (UnaryOp::Negative, Val::Int(i)) => Ok(match i.checked_neg() {
            Some(v) => Val::Int(v),
            None => Val::Float(-(*i as f64)),
        }),
        (UnaryOp::Negative, Val::Float(x)) => Ok(Val::Float(-x)),
        (UnaryOp::Not, v) => Ok(Val::Bool(!v.is_truthy())),
        (UnaryOp::Invert, Val::Int(i)) => Ok(Val::Int(!i)),
        _ => Err(VmFault::new(
            FaultKind::Type,
            format!("bad operand type for unary {:?}: '{}'", op, v.type_name()),
        )),
    }
}

pub fn compare(op: CmpOp, x: &Val, y: &Val) -> Result<Val, VmFault> {
    let b = match op {
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => return ordered(op, x, y),
        CmpOp::In => contains(y, x)?,
        CmpOp::NotIn => !contains(y, x)?,
        CmpOp::Is => identical(x, y),
        CmpOp::IsNot => !identical(x, y),
        CmpOp::ExcMatch => return exc_match(x, y),
    };
    Ok(Val::Bool(b))
}

fn ordered(op: CmpOp, x: &Val, y: &Val) -> Result<Val, VmFault> {
    let ord = match (x, y) {
        (Val::Str(a), Val::Str(b)) => a.cmp(b),
        _ => match num_pair(x, y) {
            Some(NumPair::Ints(a, b)) => a.cmp(&b),
            Some(NumPair::Floats(a, b)) => a.partial_cmp(&b).ok_or_else(|| {
                VmFault::new(FaultKind::Value, "comparison with NaN is unordered")
            })?,
            None => {
                return Err(VmFault::new(
                    FaultKind::Type,
                    format!(
                        "'{}' and '{}' are not orderable",
                        x.type_name(),
                        y.type_name()
                    ),
                ));
            }
        },
    };
    Ok(Val::Bool(match op {
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        _ => ord.is_ge(),
    }))
}

fn contains(container: &Val, item: &Val) -> Result<bool, VmFault> {
    match container {
        Val::List(l) => Ok(l.borrow().iter().any(|v| v == item)),
        Val::Map(m) => match item {
            Val::Str(k) => Ok(m.borrow().contains_key(k.as_ref())),
            _ => Err(VmFault::new(
                FaultKind::Type,
                format!("map membership requires a string key, got '{}'", item.type_name()),
            )),
        },
        Val::Str(s) => match item {
            Val::Str(sub) => Ok(s.contains(sub.as_ref())),
            _ => Err(VmFault::new(
                FaultKind::Type,
                format!("'in <str>' requires a string operand, got '{}'", item.type_name()),
            )),
        },
        _ => Err(VmFault::new(
            FaultKind::Type,
            format!("'{}' is not a container", container.type_name()),
        )),
    }
}

fn identical(x: &Val, y: &Val) -> bool {
    match (x, y) {
        (Val::Str(a), Val::Str(b)) => Rc::ptr_eq(a, b),
        (Val::List(a), Val::List(b)) => Rc::ptr_eq(a, b),
        (Val::Map(a), Val::Map(b)) => Rc::ptr_eq(a, b),
        (Val::Code(a), Val::Code(b)) => Rc::ptr_eq(a, b),
        (Val::Function(a), Val::Function(b)) => Rc::ptr_eq(a, b),
        (Val::Iter(a), Val::Iter(b)) => Rc::ptr_eq(a, b),
        (Val::Native(a), Val::Native(b)) => a.func == b.func,
        (Val::Nil, _) | (_, Val::Nil) => matches!((x, y), (Val::Nil, Val::Nil)),
        (Val::Bool(a), Val::Bool(b)) => a == b,
        (Val::Int(a), Val::Int(b)) => a == b,
        (Val::Float(a), Val::Float(b)) => a == b,
        _ => false,
    }
}

/// Exception-match: the raised type name against the catch target; the
/// `"Exception"` target matches every kind.
fn exc_match(raised: &Val, target: &Val) -> Result<Val, VmFault> {
    let (Val::Str(raised), Val::Str(target)) = (raised, target) else {
        return Err(VmFault::new(
            FaultKind::Type,
            "exception match requires exception type names",
        ));
    };
    Ok(Val::Bool(target.as_ref() == "Exception" || raised == target))
}
