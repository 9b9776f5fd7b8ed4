use super::*;

#[test]
fn test_jump_absolute() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::JumpAbsolute, 4),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::LoadConst, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(1), Const::Int(2)]);
    assert_eq!(run(unit), Val::Int(2));
}

#[test]
fn test_pop_jump_if_false() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::LoadConst, 0),
            arg(Opcode::PopJumpIfFalse, 8),
            arg(Opcode::LoadConst, 1),
            op(Opcode::ReturnValue),
            arg(Opcode::LoadConst, 2),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Bool(false), Const::Int(10), Const::Int(20)]);
    assert_eq!(run(unit), Val::Int(20));
}

#[test]
fn test_loop_break_jumps_to_handler() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupLoop, 8),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::StoreName, 0),
            op(Opcode::BreakLoop),
            arg(Opcode::JumpAbsolute, 2),
            arg(Opcode::LoadName, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(42)])
    .with_names(&["x"]);
    assert_eq!(run(unit), Val::Int(42));
}

#[test]
fn test_loop_continue_keeps_block_and_stack() {
    // continue jumps to the loop handler without popping the block or
    // truncating; the 7 pushed by the body must survive to the return
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupLoop, 6),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::ContinueLoop, 2),
            arg(Opcode::JumpAbsolute, 2),
            op(Opcode::PopBlock),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(7)]);
    assert_eq!(run(unit), Val::Int(7));
}

#[test]
fn test_for_iter_accumulates_in_order() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::BuildList, 0),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::LoadConst, 1),
            arg(Opcode::LoadConst, 2),
            arg(Opcode::BuildList, 3),
            op(Opcode::GetIter),
            arg(Opcode::ForIter, 4),
            arg(Opcode::ListAppend, 2),
            arg(Opcode::JumpAbsolute, 12),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(1), Const::Int(2), Const::Int(3)]);
    assert_eq!(
        run(unit),
        Val::from_vec(vec![Val::Int(1), Val::Int(2), Val::Int(3)])
    );
}

#[test]
fn test_exception_is_caught_by_handler() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupExcept, 4),
            arg(Opcode::LoadName, 0),
            op(Opcode::ReturnValue),
            op(Opcode::PopTop),
            op(Opcode::PopTop),
            op(Opcode::PopTop),
            op(Opcode::PopExcept),
            arg(Opcode::LoadConst, 0),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Int(5)])
    .with_names(&["nope"]);
    assert_eq!(run(unit), Val::Int(5));
}

#[test]
fn test_handler_sees_exception_type() {
    // Handler entry stack is [type, value, tb, type, value, tb]; drop tb
    // and value, then match the type against a catch target
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupExcept, 4),
            arg(Opcode::LoadName, 0),
            op(Opcode::ReturnValue),
            op(Opcode::PopTop),
            op(Opcode::PopTop),
            arg(Opcode::LoadConst, 0),
            arg(Opcode::CompareOp, 10),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Str("NameError".into())])
    .with_names(&["nope"]);
    assert_eq!(run(unit), Val::Bool(true));
}

#[test]
fn test_uncaught_exception_aborts_run() {
    let unit = CodeUnit::new(
        "main",
        vec![arg(Opcode::LoadName, 0), op(Opcode::ReturnValue)],
    )
    .with_names(&["nope"]);
    let err = run_err(unit);
    assert!(err.contains("NameError"), "{err}");
}

#[test]
fn test_finally_runs_on_return_and_resumes_it() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupFinally, 4),
            arg(Opcode::LoadConst, 0),
            op(Opcode::ReturnValue),
            op(Opcode::EndFinally),
        ],
    )
    .with_consts(vec![Const::Int(7)]);
    assert_eq!(run(unit), Val::Int(7));
}

#[test]
fn test_finally_normal_exit_continues_after() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupFinally, 2),
            op(Opcode::PopBlock),
            arg(Opcode::LoadConst, 0),
            op(Opcode::EndFinally),
            arg(Opcode::LoadConst, 1),
            op(Opcode::ReturnValue),
        ],
    )
    .with_consts(vec![Const::Nil, Const::Int(9)]);
    assert_eq!(run(unit), Val::Int(9));
}

#[test]
fn test_finally_reraises_exception() {
    let unit = CodeUnit::new(
        "main",
        vec![
            arg(Opcode::SetupFinally, 2),
            arg(Opcode::LoadName, 0),
            op(Opcode::PopTop),
            op(Opcode::PopTop),
            op(Opcode::PopTop),
            op(Opcode::PopExcept),
            arg(Opcode::RaiseVarargs, 0),
        ],
    )
    .with_names(&["nope"]);
    let err = run_err(unit);
    assert!(err.contains("NameError"), "{err}");
}

#[test]
fn test_unwind_with_empty_block_stack_is_identity() {
    let mut vm = Vm::new();
    push_frame(&mut vm, CodeUnit::new("t", Vec::new()));
    vm.push(Val::Int(1)).unwrap();
    let out = vm.manage_block_stack(Signal::Break).unwrap();
    assert_eq!(out, Some(Signal::Break));
    let frame = vm.frame().unwrap();
    assert_eq!(frame.stack.len(), 1);
    assert!(frame.blocks.is_empty());
}

#[test]
fn test_unwind_loop_break_truncates_and_jumps() {
    let mut vm = Vm::new();
    push_frame(&mut vm, CodeUnit::new("t", Vec::new()));
    vm.frame_mut().unwrap().push_block(BlockKind::Loop, Some(4));
    vm.push(Val::Int(1)).unwrap();
    vm.push(Val::Int(2)).unwrap();
    let out = vm.manage_block_stack(Signal::Break).unwrap();
    assert_eq!(out, None);
    let frame = vm.frame().unwrap();
    assert_eq!(frame.pc, 4);
    assert!(frame.stack.is_empty());
    assert!(frame.blocks.is_empty());
}

#[test]
fn test_unwind_loop_continue_leaves_stack_and_block() {
    let mut vm = Vm::new();
    push_frame(&mut vm, CodeUnit::new("t", Vec::new()));
    vm.frame_mut().unwrap().push_block(BlockKind::Loop, Some(4));
    vm.push(Val::Int(1)).unwrap();
    vm.push(Val::Int(2)).unwrap();
    let out = vm.manage_block_stack(Signal::Continue).unwrap();
    assert_eq!(out, None);
    let frame = vm.frame().unwrap();
    assert_eq!(frame.pc, 4);
    assert_eq!(frame.stack.len(), 2);
    assert_eq!(frame.blocks.len(), 1);
}

#[test]
fn test_unwind_exception_pushes_triple_twice() {
    let mut vm = Vm::new();
    push_frame(&mut vm, CodeUnit::new("t", Vec::new()));
    vm.push(Val::Int(0)).unwrap();
    vm.frame_mut()
        .unwrap()
        .push_block(BlockKind::SetupExcept, Some(9));
    vm.last_exception = Some((Val::str("ValueError"), Val::str("boom"), Val::Nil));

    let out = vm.manage_block_stack(Signal::Exception).unwrap();
    assert_eq!(out, None);
    let frame = vm.frame().unwrap();
    assert_eq!(frame.pc, 9);
    // Base value plus two (type, value, tb) triples, traceback on top
    assert_eq!(frame.stack.len(), 7);
    assert_eq!(frame.stack[6], Val::Nil);
    assert_eq!(frame.stack[5], Val::str("boom"));
    assert_eq!(frame.stack[4], Val::str("ValueError"));
    assert_eq!(frame.blocks.len(), 1);
    assert_eq!(frame.blocks[0].kind, BlockKind::ExceptHandler);
    assert_eq!(frame.blocks[0].level, 1);
}
