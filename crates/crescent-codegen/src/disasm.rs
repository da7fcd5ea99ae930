/// Bytecode disassembler (luac -l style output).
use crate::opcode::{constant_index, is_constant, ArgMode, Instruction, InstructionFormat};
use crate::proto::{Constant, Proto};
use std::fmt::Write;

/// Disassemble a prototype into a human-readable string.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();

    let vararg = if proto.is_vararg { "+" } else { "" };
    writeln!(
        out,
        "function ({}{vararg} params, {} slots, {} constants, {} instructions)",
        proto.num_params,
        proto.max_stack_size,
        proto.constants.len(),
        proto.code.len(),
    )
    .unwrap();

    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.line_info.get(pc).copied().unwrap_or(0);
        write!(out, "\t{}\t[{line}]\t", pc + 1).unwrap();
        disasm_instruction(&mut out, inst, pc);
        writeln!(out).unwrap();
    }

    if !proto.constants.is_empty() {
        writeln!(out, "constants ({}):", proto.constants.len()).unwrap();
        for (i, k) in proto.constants.iter().enumerate() {
            write!(out, "\t{i}\t").unwrap();
            match k {
                Constant::Nil => writeln!(out, "nil").unwrap(),
                Constant::Boolean(b) => writeln!(out, "{b}").unwrap(),
                Constant::Number(n) => writeln!(out, "{n}").unwrap(),
                Constant::String(s) => writeln!(out, "\"{s}\"").unwrap(),
            }
        }
    }

    out
}

/// An RK operand: `K(i)` for constants, the register number otherwise.
fn rk(operand: u32) -> String {
    if is_constant(operand) {
        format!("K({})", constant_index(operand))
    } else {
        operand.to_string()
    }
}

fn operand(mode: ArgMode, value: u32) -> Option<String> {
    match mode {
        ArgMode::Unused => None,
        ArgMode::ConstantOrRegister => Some(rk(value)),
        ArgMode::Used | ArgMode::Register => Some(value.to_string()),
    }
}

fn disasm_instruction(out: &mut String, inst: &Instruction, pc: usize) {
    let op = inst.opcode();
    write!(out, "{:<10}", op.name()).unwrap();
    match op.format() {
        InstructionFormat::IABC => {
            write!(out, " {}", inst.a()).unwrap();
            if let Some(b) = operand(op.b_mode(), inst.b()) {
                write!(out, " {b}").unwrap();
            }
            if let Some(c) = operand(op.c_mode(), inst.c()) {
                write!(out, " {c}").unwrap();
            }
        }
        InstructionFormat::IABx => {
            write!(out, " {} {}", inst.a(), inst.bx()).unwrap();
        }
        InstructionFormat::IAsBx => {
            let sbx = inst.sbx();
            // absolute target alongside the relative offset
            write!(out, " {} {} ; to {}", inst.a(), sbx, pc as i32 + 2 + sbx).unwrap();
        }
        InstructionFormat::IAx => {
            write!(out, " {}", inst.ax_field()).unwrap();
        }
    }
}
