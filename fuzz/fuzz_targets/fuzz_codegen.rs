#![no_main]

use crescent_codegen::codegen::FunctionBuilder;
use crescent_codegen::opcode::Instruction;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary words and interning arbitrary numbers must never
    // panic, and the constant pool must stay deterministic.
    let mut builder = FunctionBuilder::new(0, false);
    for chunk in data.chunks_exact(8) {
        let bits = u64::from_le_bytes(chunk.try_into().unwrap());

        let inst = Instruction(bits as u32);
        let _ = inst.opcode();
        let _ = (inst.a(), inst.b(), inst.c(), inst.bx(), inst.sbx(), inst.ax_field());
        let _ = format!("{inst:?}");

        let n = f64::from_bits(bits);
        let first = builder.number_constant(n);
        let second = builder.number_constant(n);
        assert_eq!(first, second);
    }
});
