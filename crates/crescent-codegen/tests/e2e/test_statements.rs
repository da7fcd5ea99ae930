use super::helpers::*;
use crescent_codegen::codegen::expr::{ExprDesc, ExprKind};
use crescent_codegen::codegen::{FunctionBuilder, MULTIPLE_RETURNS};
use crescent_codegen::opcode::{as_constant, OpCode, MAX_AX, MAX_C};
use crescent_codegen::proto::Constant;

#[test]
fn e2e_store_to_local() {
    // x = 42 with x in register 0
    let mut f = with_locals(1);
    let mut e = number(42.0);
    f.store_variable(&local(0), &mut e).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::LoadK);
    assert_eq!(proto.code[0].a(), 0);
    assert_eq!(f.free_register_count(), 1);
}

#[test]
fn e2e_store_to_upvalue() {
    let mut f = with_locals(1);
    let mut e = number(7.0);
    f.store_variable(&upvalue(3), &mut e).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 2);
    assert_eq!(proto.code[0].opcode(), OpCode::LoadK);
    assert_eq!(proto.code[0].a(), 1); // value staged in a temp
    assert_eq!(proto.code[1].opcode(), OpCode::SetUpval);
    assert_eq!(proto.code[1].a(), 1);
    assert_eq!(proto.code[1].b(), 3);
    // the temp is released with the statement
    assert_eq!(f.free_register_count(), 1);
}

#[test]
fn e2e_store_to_indexed_local_table() {
    // t[1] = 2 with t in register 0
    let mut f = with_locals(1);
    let mut t = local(0);
    let mut key = number(1.0);
    f.indexed(&mut t, &mut key).unwrap();
    let mut value = number(2.0);
    f.store_variable(&t, &mut value).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::SetTable);
    assert_eq!(proto.code[0].a(), 0);
    assert_eq!(proto.code[0].b(), as_constant(0));
    assert_eq!(proto.code[0].c(), as_constant(1));
    assert_eq!(
        proto.constants,
        vec![Constant::Number(1.0), Constant::Number(2.0)]
    );
}

#[test]
fn e2e_store_to_indexed_upvalue_table() {
    // env["x"] = v, with env an upvalue
    let mut f = with_locals(1);
    let mut t = upvalue(0);
    let k = f.string_constant("x");
    let mut key = ExprDesc::new(ExprKind::Constant(k));
    f.indexed(&mut t, &mut key).unwrap();
    let mut value = local(0);
    f.store_variable(&t, &mut value).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code[0].opcode(), OpCode::SetTabUp);
    assert_eq!(proto.code[0].a(), 0);
    assert_eq!(proto.code[0].b(), as_constant(k));
    assert_eq!(proto.code[0].c(), 0); // value register
}

#[test]
fn e2e_read_indexed_with_register_key() {
    // t[k] with both in registers
    let mut f = with_locals(2);
    let mut t = local(0);
    let mut key = local(1);
    f.indexed(&mut t, &mut key).unwrap();
    f.expression_to_next_register(&mut t).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::GetTable);
    assert_eq!(proto.code[0].a(), 2);
    assert_eq!(proto.code[0].b(), 0);
    assert_eq!(proto.code[0].c(), 1);
}

#[test]
fn e2e_read_indexed_upvalue() {
    let mut f = with_locals(0);
    let mut t = upvalue(1);
    let mut key = number(1.0);
    f.indexed(&mut t, &mut key).unwrap();
    f.expression_to_next_register(&mut t).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code[0].opcode(), OpCode::GetTabUp);
    assert_eq!(proto.code[0].a(), 0);
    assert_eq!(proto.code[0].b(), 1);
    assert_eq!(proto.code[0].c(), as_constant(0));
}

#[test]
fn e2e_self_reserves_method_and_receiver_slots() {
    // obj:m — SELF fills base with the method and base+1 with the receiver
    let mut f = with_locals(1);
    let mut obj = local(0);
    let k = f.string_constant("m");
    let mut key = ExprDesc::new(ExprKind::Constant(k));
    f.self_method(&mut obj, &mut key).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::Self_);
    assert_eq!(proto.code[0].a(), 1);
    assert_eq!(proto.code[0].b(), 0);
    assert_eq!(proto.code[0].c(), as_constant(k));
    assert_eq!(obj.kind, ExprKind::NonReloc(1));
    assert_eq!(f.free_register_count(), 3);
    assert!(f.proto().max_stack_size >= 3);
}

#[test]
fn e2e_call_result_count_patching() {
    let mut f = with_locals(0);
    let mut func = number(0.0);
    f.expression_to_next_register(&mut func).unwrap();
    let pc = f.encode_abc(OpCode::Call, 0, 1, 0).unwrap();
    let e = ExprDesc::new(ExprKind::Call(pc));

    f.set_returns(&e, 3).unwrap();
    assert_eq!(f.proto().code[pc as usize].c(), 4);

    f.set_returns(&e, MULTIPLE_RETURNS).unwrap();
    assert_eq!(f.proto().code[pc as usize].c(), 0);

    let mut e = e;
    f.set_single_return(&mut e);
    assert_eq!(e.kind, ExprKind::NonReloc(0)); // the call's base register
}

#[test]
fn e2e_vararg_multiple_returns_repositions_base() {
    let mut f = with_locals(2);
    let pc = f.encode_abc(OpCode::VarArg, 0, 0, 0).unwrap();
    let e = ExprDesc::new(ExprKind::VarArg(pc));
    f.set_returns(&e, MULTIPLE_RETURNS).unwrap();
    let inst = f.proto().code[pc as usize];
    assert_eq!(inst.b(), 0); // all results
    assert_eq!(inst.a(), 2); // repositioned at the stack top
    assert_eq!(f.free_register_count(), 3); // leading result slot reserved
}

#[test]
fn e2e_discharging_open_call_takes_one_result() {
    let mut f = with_locals(0);
    let mut func = number(0.0);
    f.expression_to_next_register(&mut func).unwrap();
    let pc = f.encode_abc(OpCode::Call, 0, 1, 0).unwrap();
    let mut e = ExprDesc::new(ExprKind::Call(pc));
    let r = f.expression_to_any_register(&mut e).unwrap();
    assert_eq!(r, 0);
    assert_eq!(e.kind, ExprKind::NonReloc(0));
}

#[test]
fn e2e_return_counts() {
    let mut f = FunctionBuilder::new(0, false);
    f.ret(0, 0).unwrap();
    f.ret(1, 2).unwrap();
    f.ret(0, MULTIPLE_RETURNS).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code[0].b(), 1); // no results
    assert_eq!((proto.code[1].a(), proto.code[1].b()), (1, 3));
    assert_eq!(proto.code[2].b(), 0); // everything up to the top
    assert_eq!(count_opcode(proto, OpCode::Return), 3);
}

#[test]
fn e2e_set_list_final_batch() {
    // a 60-element constructor: the last 10 values flush as batch 2
    let mut f = with_locals(0);
    f.reserve_registers(11).unwrap(); // table + 10 pending values
    f.set_list(0, 60, 10).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 1);
    assert_eq!(proto.code[0].opcode(), OpCode::SetList);
    assert_eq!(proto.code[0].a(), 0);
    assert_eq!(proto.code[0].b(), 10);
    assert_eq!(proto.code[0].c(), 2); // batch index carried directly
    assert_eq!(f.free_register_count(), 1); // temps above the table released
}

#[test]
fn e2e_set_list_first_batch() {
    let mut f = with_locals(0);
    f.reserve_registers(51).unwrap();
    f.set_list(0, 50, 50).unwrap();
    let inst = f.proto().code[0];
    assert_eq!((inst.b(), inst.c()), (50, 1));
}

#[test]
fn e2e_set_list_empty_flush_is_batch_one() {
    let mut f = with_locals(0);
    f.reserve_registers(2).unwrap();
    f.set_list(0, 0, MULTIPLE_RETURNS).unwrap();
    let inst = f.proto().code[0];
    assert_eq!((inst.b(), inst.c()), (0, 1));
    assert_eq!(f.free_register_count(), 1);
}

#[test]
fn e2e_set_list_multiple_returns_encodes_zero() {
    let mut f = with_locals(0);
    f.reserve_registers(2).unwrap();
    f.set_list(0, 3, MULTIPLE_RETURNS).unwrap();
    assert_eq!(f.proto().code[0].b(), 0);
}

#[test]
fn e2e_set_list_huge_batch_spills_to_extra_arg() {
    let mut f = with_locals(0);
    f.reserve_registers(2).unwrap();
    let elements = (MAX_C + 1) * 50; // batch index no longer fits in C
    f.set_list(0, elements, 1).unwrap();
    let proto = f.proto();
    assert_eq!(proto.code.len(), 2);
    assert_eq!(proto.code[0].opcode(), OpCode::SetList);
    assert_eq!(proto.code[0].c(), 0);
    assert_eq!(proto.code[1].opcode(), OpCode::ExtraArg);
    assert_eq!(proto.code[1].ax_field(), MAX_C + 1);
}

#[test]
fn e2e_set_list_overflow_is_reported() {
    let mut f = with_locals(0);
    f.reserve_registers(2).unwrap();
    let err = f.set_list(0, (MAX_AX + 1) * 50, 1).unwrap_err();
    assert!(err.message.contains("constructor too long"));
}
