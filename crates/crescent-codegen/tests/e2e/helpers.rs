use crescent_codegen::codegen::expr::{ExprDesc, ExprKind};
use crescent_codegen::codegen::FunctionBuilder;
use crescent_codegen::opcode::OpCode;
use crescent_codegen::proto::Proto;

/// A builder with `n` named locals occupying registers `0..n`, the way a
/// parser would have declared them.
pub fn with_locals(n: u32) -> FunctionBuilder {
    let mut f = FunctionBuilder::new(0, false);
    f.reserve_registers(n).unwrap();
    f.set_active_variable_count(n);
    f
}

pub fn local(r: u32) -> ExprDesc {
    ExprDesc::new(ExprKind::Local(r))
}

pub fn number(n: f64) -> ExprDesc {
    ExprDesc::new(ExprKind::Number(n))
}

#[allow(dead_code)]
pub fn upvalue(index: u32) -> ExprDesc {
    ExprDesc::new(ExprKind::Upvalue(index))
}

#[allow(dead_code)]
pub fn nil() -> ExprDesc {
    ExprDesc::new(ExprKind::Nil)
}

#[allow(dead_code)]
pub fn boolean(b: bool) -> ExprDesc {
    ExprDesc::new(if b { ExprKind::True } else { ExprKind::False })
}

/// Check if a Proto contains a specific opcode.
pub fn has_opcode(proto: &Proto, op: OpCode) -> bool {
    proto.code.iter().any(|i| i.opcode() == op)
}

/// Count occurrences of an opcode in a Proto.
pub fn count_opcode(proto: &Proto, op: OpCode) -> usize {
    proto.code.iter().filter(|i| i.opcode() == op).count()
}

/// The opcodes of a Proto, in emission order.
#[allow(dead_code)]
pub fn opcodes(proto: &Proto) -> Vec<OpCode> {
    proto.code.iter().map(|i| i.opcode()).collect()
}
