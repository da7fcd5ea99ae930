//! Register-based bytecode generation for a Lua-style stack machine.
//!
//! The crate sits between a recursive-descent parser and the bytecode it
//! emits: [`codegen::FunctionBuilder`] performs on-the-fly register
//! allocation, short-circuit jump patching, constant folding, and RK operand
//! selection while appending fixed-width instructions to a [`proto::Proto`].

pub mod codegen;
pub mod disasm;
pub mod opcode;
pub mod proto;
