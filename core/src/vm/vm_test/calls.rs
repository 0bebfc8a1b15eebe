use super::*;
use crate::vm::VmConfig;

/// Caller keeps a sentinel in r5, calls a callee summing `n` arguments, and
/// returns sentinel + callee result. Exercises CALL_NEW / CALL_SET / CALL /
/// RET and proves pc and frame base come back exactly.
fn call_roundtrip_program(n: u8) -> Program {
    let mut b = ProgramBuilder::new();

    // callee: sum its parameters into r4 (or 99 when it has none).
    let callee = b.begin_func("callee", 16, n).unwrap();
    if n == 0 {
        b.op_ad(Opcode::Movi, 4, 99);
    } else {
        for i in 1..n {
            b.op_abc(Opcode::Add, 4, 4, 4 + i);
        }
    }
    b.op_a(Opcode::Ret, 4);

    // main frame is 16 slots; the callee's return slot is absolute 17,
    // addressable here as r17.
    let main = b.begin_func("main", 16, 0).unwrap();
    let f = b.konst(Const::Func(callee)).unwrap();
    b.op_ad(Opcode::Load, 4, f);
    b.op_ad(Opcode::Movi, 5, 7); // sentinel
    b.op_a(Opcode::CallNew, 4);
    for i in 0..n {
        b.op_ad(Opcode::Movi, 6, (i + 1) as u16);
        b.op_abc(Opcode::CallSet, 4 + i, 6, 0);
    }
    b.op_a(Opcode::Call, 4);
    b.op_abc(Opcode::Mov, 8, 17, 0);
    b.op_abc(Opcode::Add, 8, 8, 5);
    b.op_a(Opcode::Ret, 8);
    b.set_entry(main);
    b.finish().unwrap()
}

#[test]
fn call_and_return_preserve_caller_state() {
    assert_eq!(exec_main(call_roundtrip_program(0)).unwrap(), Val::Int(106));
    assert_eq!(exec_main(call_roundtrip_program(1)).unwrap(), Val::Int(8));
    // 1 + 2 + ... + 8 = 36
    assert_eq!(exec_main(call_roundtrip_program(8)).unwrap(), Val::Int(43));
}

#[test]
fn unbounded_recursion_overflows_the_stack() {
    let mut b = ProgramBuilder::new();
    let f = b.begin_func("forever", 16, 0).unwrap();
    let k = b.konst(Const::Func(f)).unwrap();
    b.op_ad(Opcode::Load, 4, k);
    b.op_a(Opcode::CallNew, 4);
    b.op_a(Opcode::Call, 4);
    b.set_entry(f);
    let program = b.finish().unwrap();

    let mut vm = Vm::with_config(
        Arc::new(program),
        VmConfig {
            max_stack_slots: 256,
            ..VmConfig::default()
        },
    );
    let main = vm.spawn_main(&[]).unwrap();
    let err = vm.run(main).unwrap_err();
    assert!(err.to_string().contains("stack overflow"), "got: {err}");
}

#[test]
fn calling_a_non_function_faults() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 3);
    b.op_a(Opcode::CallNew, 4);
    b.set_entry(main);
    let err = exec_main(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("not callable"), "got: {err}");
}

#[test]
fn native_functions_read_args_and_write_the_return_slot() {
    crate::vm::register_native("vmtest_add2", 2, |args, _ctx| {
        match (args[0], args[1]) {
            (Val::Int(a), Val::Int(b)) => Ok(Val::Int(a + b)),
            _ => anyhow::bail!("vmtest_add2 wants ints"),
        }
    });

    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let k = b.konst(Const::Native("vmtest_add2".into())).unwrap();
    b.op_ad(Opcode::Load, 4, k);
    b.op_a(Opcode::CallNew, 4);
    b.op_ad(Opcode::Movi, 5, 3);
    b.op_abc(Opcode::CallSet, 4, 5, 0);
    b.op_ad(Opcode::Movi, 5, 4);
    b.op_abc(Opcode::CallSet, 5, 5, 0);
    b.op_a(Opcode::Call, 4);
    b.op_abc(Opcode::Mov, 6, 17, 0);
    b.op_a(Opcode::Ret, 6);
    b.set_entry(main);
    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Int(7));
}

#[test]
fn native_errors_become_catchable_faults() {
    crate::vm::register_native("vmtest_fail", 0, |_args, _ctx| anyhow::bail!("deliberate failure"));

    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let k = b.konst(Const::Native("vmtest_fail".into())).unwrap();
    b.op_ad(Opcode::Load, 4, k);
    b.op_a(Opcode::CallNew, 4);
    b.op_a(Opcode::Call, 4);
    b.op_a(Opcode::Ret, 0);
    b.set_entry(main);
    let err = exec_main(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("deliberate failure"), "got: {err}");
}

#[test]
fn tail_call_reuses_the_frame_and_returns_to_the_original_caller() {
    let mut b = ProgramBuilder::new();

    // g(x) = x * 2
    let g = b.begin_func("g", 16, 1).unwrap();
    b.op_ad(Opcode::Muli, 4, 2);
    b.op_a(Opcode::Ret, 4);

    // f() stages 21 into its own param slot and tail-calls g.
    let f = b.begin_func("f", 16, 0).unwrap();
    let kg = b.konst(Const::Func(g)).unwrap();
    b.op_ad(Opcode::Movi, 4, 21);
    b.op_ad(Opcode::Load, 5, kg);
    b.op_a(Opcode::TailCall, 5);

    let main = b.begin_func("main", 16, 0).unwrap();
    let kf = b.konst(Const::Func(f)).unwrap();
    b.op_ad(Opcode::Load, 4, kf);
    b.op_a(Opcode::CallNew, 4);
    b.op_a(Opcode::Call, 4);
    b.op_abc(Opcode::Mov, 6, 17, 0);
    b.op_a(Opcode::Ret, 6);
    b.set_entry(main);

    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Int(42));
}
