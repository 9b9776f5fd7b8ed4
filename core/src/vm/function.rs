use std::rc::Rc;

use crate::util::fast_map::FastHashMap;
use crate::val::{Namespace, Val};

use super::bytecode::CodeUnit;
use super::fault::{FaultKind, VmFault};

/// A callable produced by MAKE_FUNCTION: a compiled unit closed over the
/// defining frame's globals, plus any default argument values.
#[derive(Debug)]
pub struct FunctionValue {
    pub name: Rc<str>,
    pub code: Rc<CodeUnit>,
    pub globals: Namespace,
    pub defaults: Vec<Val>,
}

impl FunctionValue {
    /// `name` overrides the unit's own name when supplied (MAKE_FUNCTION
    /// passes the popped name value, nil meaning "use the unit's").
    pub fn new(
        name: Option<Rc<str>>,
        code: Rc<CodeUnit>,
        globals: Namespace,
        defaults: Vec<Val>,
    ) -> Result<Self, VmFault> {
        if !code.freevars.is_empty() {
            return Err(VmFault::new(
                FaultKind::Unsupported,
                format!("function '{}' captures enclosing variables", code.name),
            ));
        }
        let name = name.unwrap_or_else(|| Rc::from(code.name.as_str()));
        Ok(Self {
            name,
            code,
            globals,
            defaults,
        })
    }

    /// Bind positional call arguments to this function's parameters.
    pub fn bind(&self, args: &[Val]) -> Result<FastHashMap<Rc<str>, Val>, VmFault> {
        bind_arguments(&self.name, &self.code.params, args, &self.defaults)
    }
}

/// Positional binding with right-aligned defaults: a default for the last
/// `defaults.len()` parameters applies only when no argument covers it.
pub fn bind_arguments(
    name: &str,
    params: &[String],
    args: &[Val],
    defaults: &[Val],
) -> Result<FastHashMap<Rc<str>, Val>, VmFault> {
    if args.len() > params.len() {
        return Err(arity_fault(name, params.len(), defaults.len(), args.len()));
    }
    let required = params.len() - defaults.len().min(params.len());
    if args.len() < required {
        return Err(arity_fault(name, params.len(), defaults.len(), args.len()));
    }
    let mut bound = crate::util::fast_map::fast_hash_map_with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let v = match args.get(i) {
            Some(v) => v.clone(),
            // i >= required here, so the defaults index is in range
            None => defaults[i - required].clone(),
        };
        bound.insert(Rc::from(param.as_str()), v);
    }
    Ok(bound)
}

fn arity_fault(name: &str, params: usize, defaults: usize, got: usize) -> VmFault {
    let required = params - defaults.min(params);
    let expected = if defaults == 0 {
        format!("{}", params)
    } else {
        format!("{} to {}", required, params)
    };
    VmFault::new(
        FaultKind::Arity,
        format!("{}() takes {} arguments ({} given)", name, expected, got),
    )
}
