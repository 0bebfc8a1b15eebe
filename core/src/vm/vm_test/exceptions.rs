use super::*;

#[test]
fn throw_lands_in_the_enclosing_catch_region() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let k = b.konst(Const::Str("boom".into())).unwrap();
    b.op_ad(Opcode::Load, 4, k); // 0
    b.op_a(Opcode::Throw, 4); // 1
    b.op_ad(Opcode::Movi, 5, 1); // 2 (skipped)
    b.op_a(Opcode::Ret, 5); // 3 (skipped)
    let handler = b.pc();
    b.op_a(Opcode::Ret, 6); // handler returns the bound value
    b.add_catch(
        main,
        CatchRegion {
            start: 0,
            end: 4,
            target: handler,
            reg: 6,
        },
    )
    .unwrap();
    b.set_entry(main);

    let (vm, out) = exec_main_keep(b.finish().unwrap());
    let v = out.unwrap();
    assert!(matches!(v, Val::Str(_)));
    assert_eq!(vm.render(v), "boom");
}

#[test]
fn innermost_region_wins() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let k = b.konst(Const::Str("x".into())).unwrap();
    b.op_ad(Opcode::Load, 4, k); // 0
    b.op_a(Opcode::Throw, 4); // 1
    b.op_a(Opcode::Ret, 0); // 2
    let outer = b.pc();
    b.op_ad(Opcode::Movi, 8, 1); // outer handler -> 1
    b.op_a(Opcode::Ret, 8);
    let inner = b.pc();
    b.op_ad(Opcode::Movi, 8, 2); // inner handler -> 2
    b.op_a(Opcode::Ret, 8);
    // Outer region registered first; the tighter range must still win.
    b.add_catch(
        main,
        CatchRegion {
            start: 0,
            end: 3,
            target: outer,
            reg: 6,
        },
    )
    .unwrap();
    b.add_catch(
        main,
        CatchRegion {
            start: 1,
            end: 2,
            target: inner,
            reg: 7,
        },
    )
    .unwrap();
    b.set_entry(main);

    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Int(2));
}

#[test]
fn unwinding_walks_to_the_caller() {
    let mut b = ProgramBuilder::new();

    let thrower = b.begin_func("thrower", 8, 0).unwrap();
    let k = b.konst(Const::Str("from callee".into())).unwrap();
    b.op_ad(Opcode::Load, 4, k);
    b.op_a(Opcode::Throw, 4);

    let main = b.begin_func("main", 16, 0).unwrap();
    let kf = b.konst(Const::Func(thrower)).unwrap();
    b.op_ad(Opcode::Load, 4, kf);
    b.op_a(Opcode::CallNew, 4);
    let call_pc = b.op_a(Opcode::Call, 4);
    b.op_a(Opcode::Ret, 0);
    let handler = b.pc();
    b.op_a(Opcode::Ret, 6);
    b.add_catch(
        main,
        CatchRegion {
            start: call_pc,
            end: call_pc + 1,
            target: handler,
            reg: 6,
        },
    )
    .unwrap();
    b.set_entry(main);

    let (vm, out) = exec_main_keep(b.finish().unwrap());
    assert_eq!(vm.render(out.unwrap()), "from callee");
}

#[test]
fn division_by_zero_is_catchable() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 1); // 0
    b.op_ad(Opcode::Movi, 5, 0); // 1
    b.op_abc(Opcode::Div, 6, 4, 5); // 2
    b.op_a(Opcode::Ret, 0); // 3
    let handler = b.pc();
    b.op_a(Opcode::Ret, 7);
    b.add_catch(
        main,
        CatchRegion {
            start: 0,
            end: 4,
            target: handler,
            reg: 7,
        },
    )
    .unwrap();
    b.set_entry(main);

    let (vm, out) = exec_main_keep(b.finish().unwrap());
    let rendered = vm.render(out.unwrap());
    assert!(rendered.contains("division by zero"), "got: {rendered}");
}

#[test]
fn uncaught_throw_kills_only_the_throwing_coroutine() {
    let mut b = ProgramBuilder::new();

    let thrower = b.begin_func("thrower", 8, 0).unwrap();
    let k = b.konst(Const::Str("sibling failure".into())).unwrap();
    b.op_ad(Opcode::Load, 4, k);
    b.op_a(Opcode::Throw, 4);

    let main = b.begin_func("main", 16, 0).unwrap();
    let kf = b.konst(Const::Func(thrower)).unwrap();
    b.op_ad(Opcode::Load, 4, kf);
    b.op_a(Opcode::CallNew, 4);
    b.op_a(Opcode::CoCall, 4);
    b.op_ad(Opcode::Movi, 5, 42);
    b.op_a(Opcode::Ret, 5);
    b.set_entry(main);

    let mut vm = Vm::new(Arc::new(b.finish().unwrap()));
    let mut events = vm.event_stream();
    let main_co = vm.spawn_main(&[]).unwrap();
    let out = vm.run(main_co).unwrap();
    assert_eq!(out, Val::Int(42), "the sibling's fault must not touch main");

    let mut died = 0;
    while let Ok(ev) = events.try_recv() {
        if ev.kind == crate::co::CoEventKind::Died {
            died += 1;
        }
    }
    assert_eq!(died, 2, "both coroutines reached their terminal state");
}
