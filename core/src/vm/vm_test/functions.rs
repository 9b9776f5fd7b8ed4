use super::*;

fn define_and_call(inner: CodeUnit, call: Vec<RawInstr>, consts: Vec<Const>) -> CodeUnit {
    // A nil name on top of the code object defers to the unit's own name
    let name_idx = (1 + consts.len()) as u32;
    let mut code = vec![
        arg(Opcode::LoadConst, 0),
        arg(Opcode::LoadConst, name_idx),
        arg(Opcode::MakeFunction, 0),
        arg(Opcode::StoreName, 0),
        arg(Opcode::LoadName, 0),
    ];
    code.extend(call);
    let mut pool = vec![Const::Code(Box::new(inner))];
    pool.extend(consts);
    pool.push(Const::Nil);
    CodeUnit::new("main", code)
        .with_consts(pool)
        .with_names(&["f"])
}

#[test]
fn test_zero_arg_call_returns_nil_and_leaves_caller_alone() {
    let inner = CodeUnit::new(
        "f",
        vec![arg(Opcode::LoadConst, 0), op(Opcode::ReturnValue)],
    )
    .with_consts(vec![Const::Nil]);
    let unit = define_and_call(
        inner,
        vec![arg(Opcode::CallFunction, 0), op(Opcode::ReturnValue)],
        Vec::new(),
    );

    let globals = Namespace::new();
    globals.set("__builtins__", Val::empty_map());
    assert_eq!(run_with(unit, globals.clone()), Val::Nil);
    // Only the function definition itself landed in the caller's namespace
    assert_eq!(globals.len(), 2);
    assert!(globals.contains("f"));
}

#[test]
fn test_call_with_positional_args() {
    let inner = CodeUnit::new(
        "f",
        vec![
            arg(Opcode::LoadFast, 0),
            arg(Opcode::LoadFast, 1),
            op(Opcode::BinaryAdd),
            op(Opcode::ReturnValue),
        ],
    )
    .with_params(&["a", "b"])
    .with_varnames(&["a", "b"]);
    let unit = define_and_call(
        inner,
        vec![
            arg(Opcode::LoadConst, 1),
            arg(Opcode::LoadConst, 2),
            arg(Opcode::CallFunction, 2),
            op(Opcode::ReturnValue),
        ],
        vec![Const::Int(2), Const::Int(3)],
    );
    assert_eq!(run(unit), Val::Int(5));
}

#[test]
fn test_default_argument_fills_missing_position() {
    let inner = CodeUnit::new(
        "f",
        vec![
            arg(Opcode::LoadFast, 0),
            arg(Opcode::LoadFast, 1),
            op(Opcode::BinaryAdd),
            op(Opcode::ReturnValue),
        ],
    )
    .with_params(&["a", "b"])
    .with_varnames(&["a", "b"]);
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::LoadConst, 1),
            arg(Opcode::LoadConst, 3),
            arg(Opcode::MakeFunction, 1),
            arg(Opcode::StoreName, 0),
            arg(Opcode::LoadName, 0),
            arg(Opcode::LoadConst, 2),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![
        Const::Int(10),
        Const::Code(Box::new(inner)),
        Const::Int(1),
        Const::Nil,
    ])
    .with_names(&["f"]);
    assert_eq!(run(unit), Val::Int(11));
}

#[test]
fn test_make_function_pops_name_then_code() {
    let inner = CodeUnit::new(
        "f",
        vec![arg(Opcode::LoadConst, 0), op(Opcode::ReturnValue)],
    )
    .with_consts(vec![Const::Int(42)]);
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::LoadConst, 1),
            arg(Opcode::MakeFunction, 0),
            arg(Opcode::CallFunction, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![
        Const::Code(Box::new(inner)),
        Const::Str("adder".into()),
    ]);
    assert_eq!(run(unit), Val::Int(42));
}

#[test]
fn test_stack_name_shows_up_in_arity_fault() {
    let inner = CodeUnit::new("f", vec![op(Opcode::ReturnValue)])
        .with_params(&["a"])
        .with_varnames(&["a"]);
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::LoadConst, 1),
            arg(Opcode::MakeFunction, 0),
            arg(Opcode::CallFunction, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![
        Const::Code(Box::new(inner)),
        Const::Str("adder".into()),
    ]);
    let err = run_err(unit);
    assert!(err.contains("adder()"), "{err}");
}

#[test]
fn test_recursive_countdown() {
    let inner = CodeUnit::new(
        "f",
        vec![
            arg(Opcode::LoadFast, 0),
            arg(Opcode::PopJumpIfFalse, 16),
            arg(Opcode::LoadGlobal, 0),
            arg(Opcode::LoadFast, 0),
            arg(Opcode::LoadConst, 0),
            op(Opcode::BinarySubtract),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
            arg(Opcode::LoadConst, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_params(&["n"])
    .with_varnames(&["n"])
    .with_names(&["f"])
    .with_consts(vec![Const::Int(1), Const::Int(0)]);
    let unit = define_and_call(
        inner,
        vec![
            arg(Opcode::LoadConst, 1),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
        ],
        vec![Const::Int(3)],
    );
    assert_eq!(run(unit), Val::Int(0));
}

#[test]
fn test_recursion_restores_call_stack_depth() {
    let inner = CodeUnit::new(
        "f",
        vec![
            arg(Opcode::LoadFast, 0),
            arg(Opcode::PopJumpIfFalse, 16),
            arg(Opcode::LoadGlobal, 0),
            arg(Opcode::LoadFast, 0),
            arg(Opcode::LoadConst, 0),
            op(Opcode::BinarySubtract),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
            arg(Opcode::LoadConst, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_params(&["n"])
    .with_varnames(&["n"])
    .with_names(&["f"])
    .with_consts(vec![Const::Int(1), Const::Int(0)]);
    let unit = define_and_call(
        inner,
        vec![
            arg(Opcode::LoadConst, 1),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
        ],
        vec![Const::Int(10)],
    );

    let mut vm = Vm::new();
    assert_eq!(vm.run_code(&Rc::new(unit), None, None).unwrap(), Val::Int(0));
    assert_eq!(vm.depth(), 0);
}

#[test]
fn test_load_global_skips_locals() {
    let inner = CodeUnit::new(
        "f",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::StoreFast, 0),
            arg(Opcode::LoadGlobal, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_varnames(&["x"])
    .with_names(&["x"])
    .with_consts(vec![Const::Int(99)]);
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadConst, 1),
            arg(Opcode::StoreName, 1),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::LoadConst, 2),
            arg(Opcode::MakeFunction, 0),
            arg(Opcode::StoreName, 0),
            arg(Opcode::LoadName, 0),
            arg(Opcode::CallFunction, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![
        Const::Code(Box::new(inner)),
        Const::Int(7),
        Const::Nil,
    ])
    .with_names(&["f", "x"]);
    // The callee's local x=99 must not shadow the global read
    assert_eq!(run(unit), Val::Int(7));
}

#[test]
fn test_callee_gets_fresh_locals() {
    let inner = CodeUnit::new(
        "f",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::StoreFast, 0),
            arg(Opcode::LoadFast, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_varnames(&["x"])
    .with_consts(vec![Const::Int(5)]);
    let unit = define_and_call(
        inner,
        vec![arg(Opcode::CallFunction, 0), op(Opcode::ReturnValue)],
        Vec::new(),
    );

    let globals = Namespace::new();
    globals.set("__builtins__", Val::empty_map());
    assert_eq!(run_with(unit, globals.clone()), Val::Int(5));
    // The callee's store stayed in its own locals
    assert!(!globals.contains("x"));
}

#[test]
fn test_arity_mismatch_raises() {
    let inner = CodeUnit::new("f", vec![op(Opcode::ReturnValue)])
        .with_params(&["a"])
        .with_varnames(&["a"]);
    let unit = define_and_call(
        inner,
        vec![arg(Opcode::CallFunction, 0), op(Opcode::ReturnValue)],
        Vec::new(),
    );
    let err = run_err(unit);
    assert!(err.contains("ArityError"), "{err}");
}

#[test]
fn test_unbound_local_raises() {
    let inner = CodeUnit::new(
        "f",
        vec![arg(Opcode::LoadFast, 0), op(Opcode::ReturnValue)],
    )
    .with_varnames(&["x"]);
    let unit = define_and_call(
        inner,
        vec![arg(Opcode::CallFunction, 0), op(Opcode::ReturnValue)],
        Vec::new(),
    );
    let err = run_err(unit);
    assert!(err.contains("UnboundLocalError"), "{err}");
}

fn double_native(args: &[Val]) -> Result<Val, VmFault> {
    match args {
        [Val::Int(n)] => Ok(Val::Int(n * 2)),
        _ => Err(VmFault::new(FaultKind::Type, "double expects one int")),
    }
}

#[test]
fn test_native_function_call() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadName, 0),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(21)])
    .with_names(&["double"]);

    let globals = Namespace::new();
    globals.set("__builtins__", Val::empty_map());
    globals.set(
        "double",
        Val::Native(NativeFunction {
            name: "double",
            func: double_native,
        }),
    );
    assert_eq!(run_with(unit, globals), Val::Int(42));
}

#[test]
fn test_native_fault_propagates() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadName, 0),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::CallFunction, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Str("nope".into())])
    .with_names(&["double"]);

    let globals = Namespace::new();
    globals.set("__builtins__", Val::empty_map());
    globals.set(
        "double",
        Val::Native(NativeFunction {
            name: "double",
            func: double_native,
        }),
    );
    let mut vm = Vm::new();
    let err = vm
        .run_code(&Rc::new(unit), Some(globals), None)
        .unwrap_err()
        .to_string();
    assert!(err.contains("TypeError"), "{err}");
}

#[test]
fn test_function_capturing_variables_is_rejected() {
    let inner = CodeUnit::new("clo", vec![op(Opcode::ReturnValue)]).with_freevars(&["c"]);
    let unit = define_and_call(
        inner,
        vec![arg(Opcode::CallFunction, 0), op(Opcode::ReturnValue)],
        Vec::new(),
    );
    let err = run_err(unit);
    assert!(err.contains("UnsupportedError"), "{err}");
}

#[test]
fn test_keyword_call_form_is_rejected() {
    let inner = CodeUnit::new(
        "f",
        vec![arg(Opcode::LoadConst, 0), op(Opcode::ReturnValue)],
    )
    .with_consts(vec![Const::Nil]);
    let unit = define_and_call(
        inner,
        vec![arg(Opcode::CallFunction, 1 << 8), op(Opcode::ReturnValue)],
        Vec::new(),
    );
    let err = run_err(unit);
    assert!(err.contains("UnsupportedError"), "{err}");
}

#[test]
fn test_calling_a_non_callable_raises() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::CallFunction, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(5)]);
    let err = run_err(unit);
    assert!(err.contains("TypeError"), "{err}");
}
