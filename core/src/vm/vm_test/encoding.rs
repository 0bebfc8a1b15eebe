use super::*;
use crate::vm::word;

#[test]
fn every_opcode_round_trips_through_its_form() {
    for byte in 0..=50u8 {
        let op = Opcode::from_u8(byte).unwrap();
        match op.form() {
            EncForm::I0 => {
                let w = word::enc0(op);
                assert_eq!(word::op_of(w), byte);
                assert_eq!(word::pe(w), 0);
            }
            EncForm::I1 => {
                for e in [0u32, 1, 0x0012_3456, 0x00FF_FFFF] {
                    let w = word::enc_e(op, e);
                    assert_eq!(word::op_of(w), byte);
                    assert_eq!(word::pe(w), e);
                }
            }
            EncForm::I1Reg => {
                for a in [0u8, 1, 127, 255] {
                    let w = word::enc_a(op, a);
                    assert_eq!(word::op_of(w), byte);
                    assert_eq!(word::pa(w), a);
                }
            }
            EncForm::I2 => {
                for (a, d) in [(0u8, 0u16), (255, 0xFFFF), (9, 256), (4, 0x8001)] {
                    let w = word::enc_ad(op, a, d);
                    assert_eq!(word::op_of(w), byte);
                    assert_eq!(word::pa(w), a);
                    assert_eq!(word::pd(w), d);
                }
            }
            EncForm::I3 => {
                for (a, b, c) in [(0u8, 0u8, 0u8), (255, 255, 255), (1, 128, 254)] {
                    let w = word::enc_abc(op, a, b, c);
                    assert_eq!(word::op_of(w), byte);
                    assert_eq!(word::pa(w), a);
                    assert_eq!(word::pb(w), b);
                    assert_eq!(word::pc(w), c);
                }
            }
        }
    }
}

#[test]
fn unknown_opcode_faults_instead_of_crashing() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 8, 0).unwrap();
    b.emit(0x0000_00FF);
    b.set_entry(main);
    let err = exec_main(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("unknown opcode"), "got: {err}");
}

#[test]
fn running_off_the_end_faults() {
    let mut b = ProgramBuilder::new();
    let main = b.begin_func("main", 8, 0).unwrap();
    b.op0(Opcode::Nop);
    b.set_entry(main);
    let err = exec_main(b.finish().unwrap()).unwrap_err();
    assert!(err.to_string().contains("outside code"), "got: {err}");
}
