use super::helpers::*;
use crescent_codegen::codegen::FunctionBuilder;
use crescent_codegen::opcode::{OpCode, MAX_SBX};

#[test]
fn e2e_register_overflow_reports_complexity() {
    let mut f = FunctionBuilder::new(0, false);
    f.set_line(12);
    f.reserve_registers(200).unwrap();
    let err = f.reserve_registers(100).unwrap_err();
    assert!(err.message.contains("function or expression too complex"));
    assert_eq!(err.line, 12);
}

#[test]
fn e2e_many_small_reservations_eventually_overflow() {
    let mut f = FunctionBuilder::new(0, false);
    let mut failed = false;
    for _ in 0..400 {
        if f.reserve_registers(1).is_err() {
            failed = true;
            break;
        }
    }
    assert!(failed);
    assert!(f.free_register_count() < 256);
}

#[test]
fn e2e_branch_overflow_reports_control_structure() {
    let mut f = FunctionBuilder::new(0, false);
    f.set_line(3);
    let j = f.jump().unwrap();
    for _ in 0..(MAX_SBX + 2) {
        f.encode_abc(OpCode::LoadBool, 0, 0, 0).unwrap();
    }
    let err = f.patch_list(j, MAX_SBX + 2).unwrap_err();
    assert!(err.message.contains("control structure too long"));
    assert_eq!(err.line, 3);
}

#[test]
fn e2e_constructor_overflow_reports_length() {
    let mut f = FunctionBuilder::new(0, false);
    f.set_line(8);
    f.reserve_registers(2).unwrap();
    let err = f.set_list(0, u32::MAX, 1).unwrap_err();
    assert!(err.message.contains("constructor too long"));
    assert_eq!(err.line, 8);
}

#[test]
fn e2e_error_display_includes_line() {
    let mut f = FunctionBuilder::new(0, false);
    f.set_line(7);
    let err = f.reserve_registers(300).unwrap_err();
    let shown = format!("{err}");
    assert!(shown.contains('7'));
    assert!(shown.contains("too complex"));
}

#[test]
fn e2e_errors_do_not_poison_earlier_code() {
    // a failed patch leaves already-emitted instructions untouched
    let mut f = FunctionBuilder::new(0, false);
    let j = f.jump().unwrap();
    for _ in 0..(MAX_SBX + 2) {
        f.encode_abc(OpCode::LoadBool, 0, 0, 0).unwrap();
    }
    let before = f.proto().code[j as usize];
    assert!(f.patch_list(j, MAX_SBX + 2).is_err());
    assert_eq!(f.proto().code[j as usize], before);
    assert_eq!(count_opcode(f.proto(), OpCode::Jmp), 1);
}
