use super::*;
use crate::gc::HeapConfig;
use crate::vm::VmConfig;

fn binop_program(op: Opcode, a: Const, b: Const) -> Program {
    let mut builder = ProgramBuilder::new();
    let main = builder.begin_func("main", 16, 0).unwrap();
    let ka = builder.konst(a).unwrap();
    let kb = builder.konst(b).unwrap();
    builder.op_ad(Opcode::Load, 4, ka);
    builder.op_ad(Opcode::Load, 5, kb);
    builder.op_abc(op, 6, 4, 5);
    builder.op_a(Opcode::Ret, 6);
    builder.set_entry(main);
    builder.finish().unwrap()
}

#[test]
fn arithmetic_promotion_and_truncation() {
    assert_eq!(
        exec_main(binop_program(Opcode::Add, Const::Int(5), Const::Int(2))).unwrap(),
        Val::Int(7)
    );
    assert_eq!(
        exec_main(binop_program(Opcode::Add, Const::Int(5), Const::Float(2.5))).unwrap(),
        Val::Float(7.5)
    );
    assert_eq!(
        exec_main(binop_program(Opcode::Div, Const::Int(7), Const::Int(2))).unwrap(),
        Val::Int(3)
    );
    assert_eq!(
        exec_main(binop_program(Opcode::Div, Const::Int(-7), Const::Int(2))).unwrap(),
        Val::Int(-3),
        "integer division truncates toward zero"
    );
    assert_eq!(
        exec_main(binop_program(Opcode::Add, Const::Int(i64::MAX), Const::Int(1))).unwrap(),
        Val::Int(i64::MIN),
        "integer overflow wraps, no trap"
    );
}

#[test]
fn integer_division_by_zero_faults() {
    let err = exec_main(binop_program(Opcode::Div, Const::Int(1), Const::Int(0))).unwrap_err();
    assert!(err.to_string().contains("division by zero"), "got: {err}");
    // Float division by zero follows IEEE instead.
    assert_eq!(
        exec_main(binop_program(Opcode::Div, Const::Float(1.0), Const::Float(0.0))).unwrap(),
        Val::Float(f64::INFINITY)
    );
}

#[test]
fn adding_incompatible_types_is_a_type_error() {
    let err = exec_main(binop_program(Opcode::Add, Const::Int(1), Const::Str("x".into()))).unwrap_err();
    assert!(err.to_string().contains("type error"), "got: {err}");
}

#[test]
fn movi_sign_extends_its_immediate() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 8, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, (-1i16) as u16);
    b.op_a(Opcode::Ret, 4);
    b.set_entry(main);
    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Int(-1));
}

#[test]
fn bitwise_and_logical_ops() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 0b1100);
    b.op_ad(Opcode::Movi, 5, 0b1010);
    b.op_abc(Opcode::And, 6, 4, 5); // 0b1000
    b.op_abc(Opcode::Xor, 7, 4, 5); // 0b0110
    b.op_abc(Opcode::Or, 8, 6, 7); // 0b1110
    b.op_ad(Opcode::Shli, 8, 1); // 0b11100
    b.op_ad(Opcode::Shri, 8, 2); // 0b111
    b.op_a(Opcode::Ret, 8);
    b.set_entry(main);
    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Int(0b111));
}

#[test]
fn comparison_synthesis_from_swapped_forms() {
    // r4 = 5; r4 >= 5 -> true; then !true -> false... exercised separately:
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 5);
    b.op_ad(Opcode::Gei, 4, 5); // r4 = (5 >= 5) = true
    b.op_ad(Opcode::Movi, 5, 5);
    b.op_ad(Opcode::Gti, 5, 5); // r5 = (5 > 5) = false
    b.op_abc(Opcode::Land, 6, 4, 5); // false
    b.op_abc(Opcode::Lor, 7, 4, 5); // true
    b.op_abc(Opcode::Lnot, 8, 6, 0); // true
    b.op_abc(Opcode::Land, 9, 7, 8); // true
    b.op_a(Opcode::Ret, 9);
    b.set_entry(main);
    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Bool(true));
}

#[test]
fn typeof_yields_the_type_name() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let k = b.konst(Const::Float(1.25)).unwrap();
    b.op_ad(Opcode::Load, 4, k);
    b.op_abc(Opcode::Typeof, 5, 4, 0);
    b.op_a(Opcode::Ret, 5);
    b.set_entry(main);
    let (vm, out) = exec_main_keep(b.finish().unwrap());
    assert_eq!(vm.render(out.unwrap()), "float");
}

#[test]
fn echo_collects_rendered_lines() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 7);
    b.op_a(Opcode::Echo, 4);
    b.op_a(Opcode::Ret, 0);
    b.set_entry(main);
    let (mut vm, out) = exec_main_keep(b.finish().unwrap());
    assert_eq!(out.unwrap(), Val::Nil);
    assert_eq!(vm.take_echo(), vec!["7"]);
}

/// The end-to-end scenario: r0=0; r1=10; while(r1){ r0+=r1; r1-=1 }; HLT
/// (registers live at the first working slots of the frame).
#[test]
fn sum_loop_leaves_55() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 8, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 0); // 0: acc = 0
    b.op_ad(Opcode::Movi, 5, 10); // 1: n = 10
    let loop_head = b.pc();
    b.op_abc(Opcode::Mov, 6, 5, 0); // 2: cond = n
    b.op_ad(Opcode::Gti, 6, 0); // 3: cond = n > 0
    b.op_ad(Opcode::Test, 6, 3); // 4: exit loop when false
    b.op_abc(Opcode::Add, 4, 4, 5); // 5: acc += n
    b.op_ad(Opcode::Subi, 5, 1); // 6: n -= 1
    b.op_e(Opcode::Jmpi, loop_head); // 7
    b.op_a(Opcode::Ret, 4); // 8
    b.set_entry(main);

    let (vm, out) = exec_main_keep(b.finish().unwrap());
    assert_eq!(out.unwrap(), Val::Int(55));
    assert_eq!(vm.last_frame()[4], Val::Int(55), "accumulator register holds the sum");
}

#[test]
fn arrays_support_int_and_string_keys() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let name = b.konst(Const::Str("name".into())).unwrap();
    b.op_a(Opcode::ArrayNew, 4);
    b.op_ad(Opcode::Movi, 5, 10);
    b.op_abc(Opcode::ArrayAdd, 4, 5, 0); // [0] = 10
    b.op_ad(Opcode::Movi, 5, 20);
    b.op_abc(Opcode::ArrayAdd, 4, 5, 0); // [1] = 20
    b.op_ad(Opcode::Movi, 6, 1);
    b.op_abc(Opcode::ArrayGet, 7, 4, 6); // r7 = 20
    b.op_ad(Opcode::Load, 8, name);
    b.op_ad(Opcode::Movi, 9, 77);
    b.op_abc(Opcode::ArraySet, 4, 8, 9); // ["name"] = 77
    b.op_abc(Opcode::ArrayGet, 10, 4, 8); // r10 = 77
    b.op_abc(Opcode::Add, 11, 7, 10);
    b.op_a(Opcode::Ret, 11);
    b.set_entry(main);
    assert_eq!(exec_main(b.finish().unwrap()).unwrap(), Val::Int(97));
}

#[test]
fn non_scalar_array_keys_fault() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 16, 0).unwrap();
    let k = b.konst(Const::Float(1.5)).unwrap();
    b.op_a(Opcode::ArrayNew, 4);
    b.op_ad(Opcode::Load, 5, k);
    b.op_abc(Opcode::ArrayGet, 6, 4, 5);
    b.op_a(Opcode::Ret, 0);
    b.set_entry(main);
    let err = exec_main(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("invalid array key"), "got: {err}");
}

#[test]
fn globals_round_trip() {
    let mut b = ProgramBuilder::new();
    let g = b.global("answer").unwrap();
    let main = b.begin_func("main", 16, 0).unwrap();
    b.op_ad(Opcode::Movi, 4, 42);
    b.op_ad(Opcode::GlobalSet, 4, g);
    b.op_ad(Opcode::GlobalGet, 5, g);
    b.op_a(Opcode::Ret, 5);
    b.set_entry(main);
    let (vm, out) = exec_main_keep(b.finish().unwrap());
    assert_eq!(out.unwrap(), Val::Int(42));
    assert_eq!(vm.global(g), Some(Val::Int(42)));
}

/// Two OS threads run independent VM instances over the same compiled
/// program. They share bytecode and constants only; globals are isolated.
#[test]
fn instances_on_threads_share_code_but_not_globals() {
    let mut b = ProgramBuilder::new();
    let g = b.global("slot").unwrap();
    let main = b.begin_func("main", 16, 1).unwrap();
    b.op_ad(Opcode::GlobalSet, 4, g);
    b.op_ad(Opcode::GlobalGet, 5, g);
    b.op_a(Opcode::Ret, 5);
    b.set_entry(main);
    let program = Arc::new(b.finish().unwrap());

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let program = Arc::clone(&program);
            std::thread::spawn(move || {
                let mut vm = Vm::new(program);
                let main = vm.spawn_main(&[Val::Int(100 + i)]).unwrap();
                vm.run(main).unwrap()
            })
        })
        .collect();
    let results: Vec<Val> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![Val::Int(100), Val::Int(101)]);
}

/// Register overwrites reclaim garbage immediately; chunk rotation keeps the
/// young generation bounded even under allocation churn.
#[test]
fn allocation_churn_stays_bounded() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 8, 0).unwrap();
    b.op_ad(Opcode::Movi, 5, 100); // 0: n = 100
    let loop_head = b.pc();
    b.op_abc(Opcode::Mov, 6, 5, 0); // 1
    b.op_ad(Opcode::Gti, 6, 0); // 2
    b.op_ad(Opcode::Test, 6, 3); // 3
    b.op_a(Opcode::ArrayNew, 4); // 4: overwrite frees the previous array
    b.op_ad(Opcode::Subi, 5, 1); // 5
    b.op_e(Opcode::Jmpi, loop_head); // 6
    b.op_a(Opcode::Ret, 0); // 7
    b.set_entry(main);

    let cfg = VmConfig {
        max_stack_slots: 1024,
        heap: HeapConfig {
            young_chunk_cap: 8,
            young_chunks: 2,
            old_cap: 64,
        },
    };
    let mut vm = Vm::with_config(Arc::new(b.finish().unwrap()), cfg);
    let main_co = vm.spawn_main(&[]).unwrap();
    vm.run(main_co).unwrap();
    let stats = vm.heap_stats();
    assert!(stats.minor_collections >= 1, "chunk ring rotated at least once");
    assert!(
        stats.live_objects < 20,
        "garbage arrays were reclaimed, live = {}",
        stats.live_objects
    );
}
