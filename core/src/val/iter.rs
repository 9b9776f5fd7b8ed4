use std::rc::Rc;

use crate::vm::{FaultKind, VmFault};

use super::Val;

/// Materialized iteration state produced by GET_ITER and advanced by
/// FOR_ITER. Iteration sources are snapshotted up front: lists yield their
/// elements, strings yield one-character strings, and maps yield a stable,
/// key-sorted sequence of `[key, value]` pairs.
#[derive(Debug)]
pub struct IterState {
    items: Vec<Val>,
    pos: usize,
}

impl IterState {
    pub fn from_val(v: &Val) -> Result<Self, VmFault> {
        let items = match v {
            Val::List(l) => l.borrow().clone(),
            Val::Str(s) => s.chars().map(|c| Val::str(c.to_string())).collect(),
            Val::Map(m) => {
                let m = m.borrow();
                let mut keys: Vec<Rc<str>> = m.keys().cloned().collect();
                keys.sort();
                keys.into_iter()
                    .map(|k| {
                        let v = m[k.as_ref()].clone();
                        Val::from_vec(vec![Val::Str(k), v])
                    })
                    .collect()
            }
            _ => {
                return Err(VmFault::new(
                    FaultKind::Type,
                    format!("'{}' object is not iterable", v.type_name()),
                ));
            }
        };
        Ok(Self { items, pos: 0 })
    }

    /// Next element, or `None` once exhausted.
    pub fn next(&mut self) -> Option<Val> {
        let v = self.items.get(self.pos).cloned()?;
        self.pos += 1;
        Some(v)
    }

    pub fn remaining(&self) -> usize {
        self.items.len() - self.pos
    }
}
