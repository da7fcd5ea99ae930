/// Single-pass code generation: expression lowering, short-circuit jump
/// patching, and stack-discipline register allocation for one function
/// under construction.
///
/// A `FunctionBuilder` is driven by a recursive-descent parser: the parser
/// hands over expression descriptors and operator events (`prefix`, `infix`,
/// `postfix`), and the builder emits instructions into a growing [`Proto`].
/// Forward jumps are kept as patch lists threaded through the jump
/// instructions' own sBx fields until their destination is known.
pub mod expr;

use crate::opcode::{
    as_constant, is_constant, ArgMode, Instruction, InstructionFormat, OpCode, MAX_A, MAX_AX,
    MAX_B, MAX_BX, MAX_C, MAX_INDEX_RK, MAX_SBX,
};
use crate::proto::{constants_equal, Constant, ConstantKey, Proto};
use expr::{BinOp, ExprDesc, ExprKind, TableKind, UnOp, NO_JUMP};
use indexmap::IndexMap;
use std::fmt;

/// Sentinel result count meaning "all results up to the top of the stack".
pub const MULTIPLE_RETURNS: i32 = -1;

/// Register operand meaning "no register wanted" when patching TESTSET.
pub const NO_REG: u32 = MAX_A;

/// Array slots flushed to a table per SETLIST instruction.
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Hard ceiling on the register file.
const MAX_REGISTERS: u32 = 250;

/// Error raised when generated code exceeds a hard limit of the instruction
/// format or the register file. Internal invariant violations are asserted,
/// not reported through this type.
#[derive(Clone, Debug)]
pub struct CodegenError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.message)
    }
}

impl std::error::Error for CodegenError {}

fn flip(cond: u32) -> u32 {
    if cond == 0 {
        1
    } else {
        0
    }
}

/// Code generator for a single function.
pub struct FunctionBuilder {
    proto: Proto,
    /// Reverse lookup for the constant pool; entry order matches pool order.
    constant_map: IndexMap<ConstantKey, usize>,
    /// Jumps that want to land at the next instruction to be emitted.
    jump_pc: i32,
    /// Highest pc that is a jump target; peepholes must not merge across it.
    last_target: i32,
    /// First free register, above actives and live temporaries.
    free_reg: u32,
    /// Registers below this boundary hold named locals and are never freed
    /// by expression code.
    active_vars: u32,
    /// Current source line, stamped on every emitted instruction.
    line: u32,
}

impl FunctionBuilder {
    pub fn new(num_params: u8, is_vararg: bool) -> Self {
        FunctionBuilder {
            proto: Proto::new(num_params, is_vararg),
            constant_map: IndexMap::new(),
            jump_pc: NO_JUMP,
            last_target: 0,
            free_reg: 0,
            active_vars: 0,
            line: 0,
        }
    }

    /// The pc of the next instruction to be emitted.
    pub fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }

    /// The prototype built so far.
    pub fn proto(&self) -> &Proto {
        &self.proto
    }

    /// Hand over the finished prototype.
    pub fn finish(self) -> Proto {
        debug_assert_eq!(self.free_reg, self.active_vars);
        self.proto
    }

    pub fn free_register_count(&self) -> u32 {
        self.free_reg
    }

    pub fn active_variable_count(&self) -> u32 {
        self.active_vars
    }

    /// Move the named-local boundary. Driven by the parser's scope manager
    /// when locals are declared or go out of scope.
    pub fn set_active_variable_count(&mut self, n: u32) {
        self.active_vars = n;
    }

    /// Update the current source line; `encode` stamps it on every emission.
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    fn syntax_error(&self, message: &str) -> CodegenError {
        CodegenError {
            message: message.to_string(),
            line: self.line,
        }
    }

    // ---- Emission ----

    /// Append an instruction: pending jumps to here are resolved first, then
    /// the instruction and its source line are pushed. Returns its pc.
    pub fn encode(&mut self, inst: Instruction) -> Result<i32, CodegenError> {
        self.discharge_jump_pc()?;
        let pc = self.pc();
        self.proto.code.push(inst);
        self.proto.line_info.push(self.line);
        Ok(pc)
    }

    pub fn encode_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, CodegenError> {
        debug_assert_eq!(op.format(), InstructionFormat::IABC);
        debug_assert!(op.b_mode() != ArgMode::Unused || b == 0);
        debug_assert!(op.c_mode() != ArgMode::Unused || c == 0);
        debug_assert!(a <= MAX_A && b <= MAX_B && c <= MAX_C);
        self.encode(Instruction::abc(op, a, b, c))
    }

    pub fn encode_abx(&mut self, op: OpCode, a: u32, bx: u32) -> Result<i32, CodegenError> {
        debug_assert!(matches!(
            op.format(),
            InstructionFormat::IABx | InstructionFormat::IAsBx
        ));
        debug_assert_eq!(op.c_mode(), ArgMode::Unused);
        debug_assert!(a <= MAX_A && bx <= MAX_BX);
        self.encode(Instruction::abx(op, a, bx))
    }

    pub fn encode_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> Result<i32, CodegenError> {
        self.encode_abx(op, a, (sbx + MAX_SBX) as u32)
    }

    fn encode_extra_arg(&mut self, ax: u32) -> Result<i32, CodegenError> {
        debug_assert!(ax <= MAX_AX);
        self.encode(Instruction::ax(OpCode::ExtraArg, ax))
    }

    /// Load constant `k` into register `r`, spilling the index into an
    /// EXTRAARG continuation when it does not fit in Bx.
    pub fn encode_constant(&mut self, r: u32, k: u32) -> Result<i32, CodegenError> {
        if k <= MAX_BX {
            self.encode_abx(OpCode::LoadK, r, k)
        } else {
            let pc = self.encode_abx(OpCode::LoadKx, r, 0)?;
            self.encode_extra_arg(k)?;
            Ok(pc)
        }
    }

    /// Set registers `from .. from + n` to nil. Adjacent LOADNILs whose
    /// ranges overlap or touch are merged in place, unless a jump label
    /// separates them.
    pub fn load_nil(&mut self, from: u32, n: u32) -> Result<(), CodegenError> {
        debug_assert!(n >= 1);
        if self.pc() > self.last_target {
            // no jump targets the current position
            if let Some(previous) = self.proto.code.last_mut() {
                if previous.opcode() == OpCode::LoadNil {
                    let (pf, pl) = (previous.a(), previous.a() + previous.b());
                    let l = from + n - 1;
                    if (pf <= from && from <= pl + 1) || (from <= pf && pf <= l + 1) {
                        let first = pf.min(from);
                        let last = pl.max(l);
                        previous.set_a(first);
                        previous.set_b(last - first);
                        return Ok(());
                    }
                }
            }
        }
        self.encode_abc(OpCode::LoadNil, from, n - 1, 0)?;
        Ok(())
    }

    /// Overwrite the line of the most recently emitted instruction, so an
    /// operator is reported at its own line rather than its last operand's.
    pub fn fix_line(&mut self, line: u32) {
        let last = self.proto.line_info.len() - 1;
        self.proto.line_info[last] = line;
    }

    // ---- Jumps and patch lists ----

    /// Emit an unresolved forward jump and fold the pending jumps-to-here
    /// into its patch list. Returns the list head.
    pub fn jump(&mut self) -> Result<i32, CodegenError> {
        let jump_pc = self.jump_pc;
        self.jump_pc = NO_JUMP;
        let j = self.encode_asbx(OpCode::Jmp, 0, NO_JUMP)?;
        self.concat_lists(j, jump_pc)
    }

    /// Emit a jump to a known target.
    pub fn jump_to(&mut self, target: i32) -> Result<(), CodegenError> {
        let list = self.jump()?;
        self.patch_list(list, target)
    }

    fn conditional_jump(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> Result<i32, CodegenError> {
        self.encode_abc(op, a, b, c)?;
        self.jump()
    }

    fn fix_jump(&mut self, pc: i32, dest: i32) -> Result<(), CodegenError> {
        debug_assert!(dest != NO_JUMP);
        let offset = dest - (pc + 1);
        if offset.abs() > MAX_SBX {
            return Err(self.syntax_error("control structure too long"));
        }
        self.proto.code[pc as usize].set_sbx(offset);
        Ok(())
    }

    /// Mark the current position as a jump target, blocking peephole
    /// coalescing across it.
    pub fn label(&mut self) -> i32 {
        self.last_target = self.pc();
        self.last_target
    }

    /// Follow a patch-list chain one step.
    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.proto.code[pc as usize].sbx();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    /// Index of the instruction controlling the jump at `pc`: the preceding
    /// test instruction if there is one, else the jump itself.
    fn jump_control_at(&self, pc: i32) -> usize {
        let pc = pc as usize;
        if pc >= 1 && self.proto.code[pc - 1].opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// True iff some jump in the list does not come from a TESTSET, i.e. its
    /// landing site needs a materialised boolean.
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            if self.proto.code[self.jump_control_at(list)].opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    /// Redirect the value produced by a TESTSET-controlled jump into
    /// `register`. Returns false when the jump is not TESTSET-controlled.
    fn patch_test_register(&mut self, node: i32, register: u32) -> bool {
        let idx = self.jump_control_at(node);
        let inst = self.proto.code[idx];
        if inst.opcode() != OpCode::TestSet {
            return false;
        }
        if register != NO_REG && register != inst.b() {
            self.proto.code[idx].set_a(register);
        } else {
            // no register wanted, or it already holds the value: rewrite as
            // a plain TEST and drop the assignment
            self.proto.code[idx] = Instruction::abc(OpCode::Test, inst.b(), 0, inst.c());
        }
        true
    }

    /// Strip the value-producing side of every TESTSET in the list.
    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_register(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    fn patch_list_aux(
        &mut self,
        mut list: i32,
        target: i32,
        register: u32,
        default_target: i32,
    ) -> Result<(), CodegenError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_register(list, register) {
                self.fix_jump(list, target)?;
            } else {
                self.fix_jump(list, default_target)?;
            }
            list = next;
        }
        Ok(())
    }

    fn discharge_jump_pc(&mut self) -> Result<(), CodegenError> {
        let list = self.jump_pc;
        self.jump_pc = NO_JUMP;
        let here = self.pc();
        self.patch_list_aux(list, here, NO_REG, here)
    }

    /// Patch every jump in `list` to `target`.
    pub fn patch_list(&mut self, list: i32, target: i32) -> Result<(), CodegenError> {
        if target == self.pc() {
            self.patch_to_here(list)
        } else {
            debug_assert!(target < self.pc());
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    /// Direct every jump in `list` at the next instruction to be emitted.
    pub fn patch_to_here(&mut self, list: i32) -> Result<(), CodegenError> {
        self.label();
        self.jump_pc = self.concat_lists(self.jump_pc, list)?;
        Ok(())
    }

    /// Mark every jump in `list` to close upvalues down to `level` when
    /// taken (used for breaks that leave blocks with captured locals).
    pub fn patch_close(&mut self, mut list: i32, level: u32) {
        let level = level + 1;
        while list != NO_JUMP {
            let next = self.get_jump(list);
            let inst = self.proto.code[list as usize];
            debug_assert!(inst.opcode() == OpCode::Jmp && (inst.a() == 0 || inst.a() >= level));
            self.proto.code[list as usize].set_a(level);
            list = next;
        }
    }

    /// Concatenate two patch lists; either may be `NO_JUMP`.
    pub fn concat_lists(&mut self, l1: i32, l2: i32) -> Result<i32, CodegenError> {
        if l2 == NO_JUMP {
            return Ok(l1);
        }
        if l1 == NO_JUMP {
            return Ok(l2);
        }
        let mut tail = l1;
        let mut next = self.get_jump(tail);
        while next != NO_JUMP {
            tail = next;
            next = self.get_jump(next);
        }
        self.fix_jump(tail, l2)?;
        Ok(l1)
    }

    // ---- Constants ----

    fn add_constant(&mut self, key: ConstantKey, value: Constant) -> u32 {
        if let Some(&index) = self.constant_map.get(&key) {
            // every NaN payload reuses the one canonical slot; any other key
            // hit always stores the identical value
            debug_assert!(
                matches!(key, ConstantKey::NaN)
                    || constants_equal(&self.proto.constants[index], &value)
            );
            return index as u32;
        }
        let index = self.proto.constants.len();
        self.constant_map.insert(key, index);
        self.proto.constants.push(value);
        index as u32
    }

    /// Intern a numeric constant. `-0.0`, `+0.0`, and NaN get dedicated
    /// slots; every other value is keyed by its bit pattern, so two literal
    /// spellings of the same number share an index.
    pub fn number_constant(&mut self, n: f64) -> u32 {
        self.add_constant(ConstantKey::number(n), Constant::Number(n))
    }

    pub fn string_constant(&mut self, s: &str) -> u32 {
        self.add_constant(ConstantKey::String(s.to_string()), Constant::String(s.to_string()))
    }

    fn boolean_constant(&mut self, b: bool) -> u32 {
        self.add_constant(ConstantKey::Boolean(b), Constant::Boolean(b))
    }

    fn nil_constant(&mut self) -> u32 {
        self.add_constant(ConstantKey::Nil, Constant::Nil)
    }

    // ---- Registers ----

    /// Grow the stack high-water mark by `n` registers.
    pub fn check_stack(&mut self, n: u32) -> Result<(), CodegenError> {
        let needed = self.free_reg + n;
        if needed >= MAX_REGISTERS {
            return Err(self.syntax_error("function or expression too complex"));
        }
        if needed > self.proto.max_stack_size as u32 {
            self.proto.max_stack_size = needed as u8;
        }
        Ok(())
    }

    pub fn reserve_registers(&mut self, n: u32) -> Result<(), CodegenError> {
        self.check_stack(n)?;
        self.free_reg += n;
        Ok(())
    }

    /// Release a temporary register. Constants and named locals are left
    /// alone; temporaries must be freed in reverse order of reservation.
    fn free_register(&mut self, r: u32) {
        if !is_constant(r) && r >= self.active_vars {
            self.free_reg -= 1;
            debug_assert_eq!(r, self.free_reg);
        }
    }

    fn free_expression(&mut self, e: &ExprDesc) {
        if let ExprKind::NonReloc(r) = e.kind {
            self.free_register(r);
        }
    }

    // ---- Multiple results ----

    /// Fix the result count of a call or vararg expression;
    /// `MULTIPLE_RETURNS` keeps all results up to the top of the stack.
    pub fn set_returns(&mut self, e: &ExprDesc, result_count: i32) -> Result<(), CodegenError> {
        debug_assert!(result_count >= MULTIPLE_RETURNS);
        match e.kind {
            ExprKind::Call(pc) => {
                self.proto.code[pc as usize].set_c((result_count + 1) as u32);
            }
            ExprKind::VarArg(pc) => {
                let base = self.free_reg;
                let inst = &mut self.proto.code[pc as usize];
                inst.set_b((result_count + 1) as u32);
                inst.set_a(base);
                self.reserve_registers(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Shrink a call or vararg expression to a single result.
    pub fn set_single_return(&mut self, e: &mut ExprDesc) {
        match e.kind {
            ExprKind::Call(pc) => {
                e.kind = ExprKind::NonReloc(self.proto.code[pc as usize].a());
            }
            ExprKind::VarArg(pc) => {
                self.proto.code[pc as usize].set_b(2);
                e.kind = ExprKind::Relocatable(pc);
            }
            _ => {}
        }
    }

    // ---- Expression lowering ----

    /// Turn variables and open calls into something register-addressable
    /// (but not yet pinned to a specific register).
    pub fn discharge_vars(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        match e.kind {
            ExprKind::Local(r) => {
                e.kind = ExprKind::NonReloc(r);
            }
            ExprKind::Upvalue(index) => {
                e.kind = ExprKind::Relocatable(self.encode_abc(OpCode::GetUpval, 0, index, 0)?);
            }
            ExprKind::Indexed { table, key, kind } => {
                self.free_register(key);
                if kind == TableKind::Local {
                    self.free_register(table);
                    e.kind =
                        ExprKind::Relocatable(self.encode_abc(OpCode::GetTable, 0, table, key)?);
                } else {
                    e.kind =
                        ExprKind::Relocatable(self.encode_abc(OpCode::GetTabUp, 0, table, key)?);
                }
            }
            ExprKind::Call(_) | ExprKind::VarArg(_) => self.set_single_return(e),
            _ => {}
        }
        Ok(())
    }

    /// Materialise the expression's value into register `r`.
    fn discharge_to_register(&mut self, e: &mut ExprDesc, r: u32) -> Result<(), CodegenError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExprKind::Nil => {
                self.load_nil(r, 1)?;
            }
            ExprKind::False => {
                self.encode_abc(OpCode::LoadBool, r, 0, 0)?;
            }
            ExprKind::True => {
                self.encode_abc(OpCode::LoadBool, r, 1, 0)?;
            }
            ExprKind::Constant(k) => {
                self.encode_constant(r, k)?;
            }
            ExprKind::Number(n) => {
                let k = self.number_constant(n);
                self.encode_constant(r, k)?;
            }
            ExprKind::Relocatable(pc) => {
                self.proto.code[pc as usize].set_a(r);
            }
            ExprKind::NonReloc(src) => {
                if r != src {
                    self.encode_abc(OpCode::Move, r, src, 0)?;
                }
            }
            // pending branches are resolved by expression_to_register
            ExprKind::Void | ExprKind::Jump(_) => return Ok(()),
            ExprKind::Local(_)
            | ExprKind::Upvalue(_)
            | ExprKind::Indexed { .. }
            | ExprKind::Call(_)
            | ExprKind::VarArg(_) => unreachable!("discharged above"),
        }
        e.kind = ExprKind::NonReloc(r);
        Ok(())
    }

    fn discharge_to_any_register(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        if !matches!(e.kind, ExprKind::NonReloc(_)) {
            self.reserve_registers(1)?;
            let r = self.free_reg - 1;
            self.discharge_to_register(e, r)?;
        }
        Ok(())
    }

    /// Emit a LOADBOOL anchor at a fresh label; `skip` makes it step over
    /// the following instruction.
    fn bool_anchor(&mut self, r: u32, value: u32, skip: u32) -> Result<i32, CodegenError> {
        self.label();
        self.encode_abc(OpCode::LoadBool, r, value, skip)
    }

    /// Put the expression's value in register `r` and resolve its pending
    /// truthy/falsy jumps. When some jump needs a materialised boolean, a
    /// pair of LOADBOOL anchors is emitted: TESTSET paths land past them
    /// with the register already set, plain tests land on the right anchor.
    pub fn expression_to_register(&mut self, e: &mut ExprDesc, r: u32) -> Result<(), CodegenError> {
        self.discharge_to_register(e, r)?;
        if let ExprKind::Jump(pc) = e.kind {
            e.true_list = self.concat_lists(e.true_list, pc)?;
        }
        if e.has_jumps() {
            let mut load_false = NO_JUMP;
            let mut load_true = NO_JUMP;
            if self.need_value(e.true_list) || self.need_value(e.false_list) {
                let fall_through = if matches!(e.kind, ExprKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump()?
                };
                load_false = self.bool_anchor(r, 0, 1)?;
                load_true = self.bool_anchor(r, 1, 0)?;
                self.patch_to_here(fall_through)?;
            }
            let end = self.label();
            self.patch_list_aux(e.false_list, end, r, load_false)?;
            self.patch_list_aux(e.true_list, end, r, load_true)?;
        }
        e.true_list = NO_JUMP;
        e.false_list = NO_JUMP;
        e.kind = ExprKind::NonReloc(r);
        Ok(())
    }

    /// Push the expression's value into a freshly reserved register.
    pub fn expression_to_next_register(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        self.discharge_vars(e)?;
        self.free_expression(e);
        self.reserve_registers(1)?;
        let r = self.free_reg - 1;
        self.expression_to_register(e, r)
    }

    /// Put the expression's value in some register and return it. A value
    /// already sitting in a temporary register is reused in place.
    pub fn expression_to_any_register(&mut self, e: &mut ExprDesc) -> Result<u32, CodegenError> {
        self.discharge_vars(e)?;
        if let ExprKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.active_vars {
                self.expression_to_register(e, r)?;
                return Ok(r);
            }
        }
        self.expression_to_next_register(e)?;
        match e.kind {
            ExprKind::NonReloc(r) => Ok(r),
            _ => unreachable!(),
        }
    }

    /// Ensure the expression has a definite value (registers only when its
    /// branches force one).
    pub fn expression_to_value(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        if e.has_jumps() {
            self.expression_to_any_register(e)?;
            Ok(())
        } else {
            self.discharge_vars(e)
        }
    }

    /// Lower the expression to an RK operand: a constant-pool reference when
    /// the index fits the RK payload, a register otherwise.
    pub fn expression_to_rk(&mut self, e: &mut ExprDesc) -> Result<u32, CodegenError> {
        self.expression_to_value(e)?;
        match e.kind {
            ExprKind::True | ExprKind::False => {
                // intern only while the pool is still RK-addressable
                if self.proto.constants.len() <= MAX_INDEX_RK as usize {
                    let k = self.boolean_constant(matches!(e.kind, ExprKind::True));
                    e.kind = ExprKind::Constant(k);
                    return Ok(as_constant(k));
                }
            }
            ExprKind::Nil => {
                if self.proto.constants.len() <= MAX_INDEX_RK as usize {
                    let k = self.nil_constant();
                    e.kind = ExprKind::Constant(k);
                    return Ok(as_constant(k));
                }
            }
            ExprKind::Number(n) => {
                let k = self.number_constant(n);
                e.kind = ExprKind::Constant(k);
                if k <= MAX_INDEX_RK {
                    return Ok(as_constant(k));
                }
            }
            ExprKind::Constant(k) => {
                if k <= MAX_INDEX_RK {
                    return Ok(as_constant(k));
                }
            }
            _ => {}
        }
        self.expression_to_any_register(e)
    }

    // ---- Stores and indexing ----

    /// Assign `e` to the l-value `var` (a local, upvalue, or indexed slot).
    pub fn store_variable(&mut self, var: &ExprDesc, e: &mut ExprDesc) -> Result<(), CodegenError> {
        match var.kind {
            ExprKind::Local(r) => {
                self.free_expression(e);
                return self.expression_to_register(e, r);
            }
            ExprKind::Upvalue(index) => {
                let r = self.expression_to_any_register(e)?;
                self.encode_abc(OpCode::SetUpval, r, index, 0)?;
            }
            ExprKind::Indexed { table, key, kind } => {
                let rk = self.expression_to_rk(e)?;
                match kind {
                    TableKind::Local => {
                        self.encode_abc(OpCode::SetTable, table, key, rk)?;
                    }
                    TableKind::Upvalue => {
                        self.encode_abc(OpCode::SetTabUp, table, key, rk)?;
                    }
                }
            }
            _ => unreachable!("not an assignable expression"),
        }
        self.free_expression(e);
        Ok(())
    }

    /// Lower `obj:key` into a SELF instruction: `e` becomes the base of two
    /// fresh consecutive registers holding the method and the receiver.
    pub fn self_method(&mut self, e: &mut ExprDesc, key: &mut ExprDesc) -> Result<(), CodegenError> {
        let obj = self.expression_to_any_register(e)?;
        self.free_expression(e);
        let base = self.free_reg;
        *e = ExprDesc::new(ExprKind::NonReloc(base));
        self.reserve_registers(2)?; // function and 'self' produced by SELF
        let k = self.expression_to_rk(key)?;
        self.encode_abc(OpCode::Self_, base, obj, k)?;
        self.free_expression(key);
        Ok(())
    }

    /// Rewrite `t` as an indexed access `t[key]`. No instruction is emitted
    /// yet; emission happens when the access is discharged.
    pub fn indexed(&mut self, t: &mut ExprDesc, key: &mut ExprDesc) -> Result<(), CodegenError> {
        debug_assert!(!t.has_jumps());
        let (table, kind) = match t.kind {
            ExprKind::Upvalue(index) => (index, TableKind::Upvalue),
            ExprKind::Local(r) | ExprKind::NonReloc(r) => (r, TableKind::Local),
            _ => unreachable!("table must live in a register or upvalue"),
        };
        let k = self.expression_to_rk(key)?;
        t.kind = ExprKind::Indexed { table, key: k, kind };
        Ok(())
    }

    // ---- Operators ----

    /// Flip the A condition of the test controlling the jump at `pc`.
    fn invert_jump(&mut self, pc: i32) {
        let idx = self.jump_control_at(pc);
        let inst = &mut self.proto.code[idx];
        debug_assert!(
            inst.opcode().is_test()
                && inst.opcode() != OpCode::TestSet
                && inst.opcode() != OpCode::Test
        );
        let a = inst.a();
        inst.set_a(flip(a));
    }

    /// Emit the conditional jump for a short-circuit operand: jump when the
    /// value's truthiness equals `cond`.
    fn jump_on_condition(&mut self, e: &mut ExprDesc, cond: u32) -> Result<i32, CodegenError> {
        if let ExprKind::Relocatable(pc) = e.kind {
            let inst = self.proto.code[pc as usize];
            if inst.opcode() == OpCode::Not {
                // retract the NOT just emitted; the replacement test takes
                // over its pc, so earlier labels stay valid
                debug_assert_eq!(pc, self.pc() - 1);
                debug_assert!(self.last_target <= pc);
                self.proto.code.pop();
                self.proto.line_info.pop();
                return self.conditional_jump(OpCode::Test, inst.b(), 0, flip(cond));
            }
        }
        self.discharge_to_any_register(e)?;
        self.free_expression(e);
        let r = match e.kind {
            ExprKind::NonReloc(r) => r,
            _ => unreachable!(),
        };
        self.conditional_jump(OpCode::TestSet, NO_REG, r, cond)
    }

    /// Arrange for the expression to fall through when true and jump when
    /// false; the falsy exit is threaded into its false list.
    pub fn go_if_true(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExprKind::Jump(pc) => {
                self.invert_jump(pc);
                pc
            }
            // can never be false: no exit jump needed
            ExprKind::Constant(_) | ExprKind::Number(_) | ExprKind::True => NO_JUMP,
            _ => self.jump_on_condition(e, 0)?,
        };
        e.false_list = self.concat_lists(e.false_list, pc)?;
        self.patch_to_here(e.true_list)?;
        e.true_list = NO_JUMP;
        Ok(())
    }

    /// Dual of `go_if_true`: fall through when false, jump when true.
    pub fn go_if_false(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExprKind::Jump(pc) => pc,
            // can never be true: no exit jump needed
            ExprKind::Nil | ExprKind::False => NO_JUMP,
            _ => self.jump_on_condition(e, 1)?,
        };
        e.true_list = self.concat_lists(e.true_list, pc)?;
        self.patch_to_here(e.false_list)?;
        e.false_list = NO_JUMP;
        Ok(())
    }

    fn encode_not(&mut self, e: &mut ExprDesc) -> Result<(), CodegenError> {
        self.discharge_vars(e)?;
        match e.kind {
            ExprKind::Nil | ExprKind::False => {
                e.kind = ExprKind::True;
            }
            ExprKind::Constant(_) | ExprKind::Number(_) | ExprKind::True => {
                e.kind = ExprKind::False;
            }
            ExprKind::Jump(pc) => {
                self.invert_jump(pc);
            }
            ExprKind::Relocatable(_) | ExprKind::NonReloc(_) => {
                self.discharge_to_any_register(e)?;
                self.free_expression(e);
                let r = match e.kind {
                    ExprKind::NonReloc(r) => r,
                    _ => unreachable!(),
                };
                e.kind = ExprKind::Relocatable(self.encode_abc(OpCode::Not, 0, r, 0)?);
            }
            _ => unreachable!("cannot negate an unfinished expression"),
        }
        // 'not' erases the value-producing side of any pending TESTSET
        std::mem::swap(&mut e.true_list, &mut e.false_list);
        self.remove_values(e.false_list);
        self.remove_values(e.true_list);
        Ok(())
    }

    fn encode_arith(
        &mut self,
        op: OpCode,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        line: u32,
    ) -> Result<(), CodegenError> {
        if let Some(folded) = fold_arith(op, e1, e2) {
            e1.kind = ExprKind::Number(folded);
            return Ok(());
        }
        let o2 = if op != OpCode::Unm && op != OpCode::Len {
            self.expression_to_rk(e2)?
        } else {
            0
        };
        let o1 = self.expression_to_rk(e1)?;
        // free in reverse order of the stack positions
        if o1 > o2 {
            self.free_expression(e1);
            self.free_expression(e2);
        } else {
            self.free_expression(e2);
            self.free_expression(e1);
        }
        e1.kind = ExprKind::Relocatable(self.encode_abc(op, 0, o1, o2)?);
        self.fix_line(line);
        Ok(())
    }

    fn encode_comparison(
        &mut self,
        op: OpCode,
        cond: u32,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
    ) -> Result<(), CodegenError> {
        let mut o1 = self.expression_to_rk(e1)?;
        let mut o2 = self.expression_to_rk(e2)?;
        self.free_expression(e2);
        self.free_expression(e1);
        let mut cond = cond;
        if cond == 0 && op != OpCode::Eq {
            // exchange operands so the machine only needs < and <=
            std::mem::swap(&mut o1, &mut o2);
            cond = 1;
        }
        let pc = self.conditional_jump(op, cond, o1, o2)?;
        *e1 = ExprDesc::new(ExprKind::Jump(pc));
        Ok(())
    }

    /// Apply a unary operator to `e`.
    pub fn prefix(&mut self, op: UnOp, e: &mut ExprDesc, line: u32) -> Result<(), CodegenError> {
        match op {
            UnOp::Neg => {
                if e.is_numeral() {
                    if let ExprKind::Number(n) = e.kind {
                        e.kind = ExprKind::Number(-n);
                    }
                } else {
                    self.expression_to_any_register(e)?;
                    let mut zero = ExprDesc::new(ExprKind::Number(0.0));
                    self.encode_arith(OpCode::Unm, e, &mut zero, line)?;
                }
            }
            UnOp::Not => self.encode_not(e)?,
            UnOp::Len => {
                self.expression_to_any_register(e)?;
                let mut zero = ExprDesc::new(ExprKind::Number(0.0));
                self.encode_arith(OpCode::Len, e, &mut zero, line)?;
            }
        }
        Ok(())
    }

    /// Prepare the left operand before the right one is parsed, so nothing
    /// it produces interferes with evaluating the right side.
    pub fn infix(&mut self, op: BinOp, e: &mut ExprDesc) -> Result<(), CodegenError> {
        match op {
            BinOp::And => self.go_if_true(e)?,
            BinOp::Or => self.go_if_false(e)?,
            BinOp::Concat => self.expression_to_next_register(e)?,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                if !e.is_numeral() {
                    self.expression_to_rk(e)?;
                }
            }
            _ => {
                self.expression_to_rk(e)?;
            }
        }
        Ok(())
    }

    /// Combine both operands once the right one is parsed; the result is
    /// left in `e1`.
    pub fn postfix(
        &mut self,
        op: BinOp,
        e1: &mut ExprDesc,
        e2: &mut ExprDesc,
        line: u32,
    ) -> Result<(), CodegenError> {
        match op {
            BinOp::And => {
                debug_assert_eq!(e1.true_list, NO_JUMP); // closed by infix
                self.discharge_vars(e2)?;
                e2.false_list = self.concat_lists(e2.false_list, e1.false_list)?;
                *e1 = *e2;
            }
            BinOp::Or => {
                debug_assert_eq!(e1.false_list, NO_JUMP); // closed by infix
                self.discharge_vars(e2)?;
                e2.true_list = self.concat_lists(e2.true_list, e1.true_list)?;
                *e1 = *e2;
            }
            BinOp::Concat => {
                self.expression_to_value(e2)?;
                let chained = match e2.kind {
                    ExprKind::Relocatable(pc) => {
                        self.proto.code[pc as usize].opcode() == OpCode::Concat
                    }
                    _ => false,
                };
                if chained {
                    // fold into the pending CONCAT: operands are required to
                    // sit in adjacent registers
                    let pc = match e2.kind {
                        ExprKind::Relocatable(pc) => pc,
                        _ => unreachable!(),
                    };
                    let r = match e1.kind {
                        ExprKind::NonReloc(r) => r,
                        _ => unreachable!("left operand was pushed to the next register"),
                    };
                    debug_assert_eq!(r + 1, self.proto.code[pc as usize].b());
                    self.free_expression(e1);
                    self.proto.code[pc as usize].set_b(r);
                    e1.kind = ExprKind::Relocatable(pc);
                } else {
                    self.expression_to_next_register(e2)?;
                    self.encode_arith(OpCode::Concat, e1, e2, line)?;
                }
            }
            BinOp::Add => self.encode_arith(OpCode::Add, e1, e2, line)?,
            BinOp::Sub => self.encode_arith(OpCode::Sub, e1, e2, line)?,
            BinOp::Mul => self.encode_arith(OpCode::Mul, e1, e2, line)?,
            BinOp::Div => self.encode_arith(OpCode::Div, e1, e2, line)?,
            BinOp::Mod => self.encode_arith(OpCode::Mod, e1, e2, line)?,
            BinOp::Pow => self.encode_arith(OpCode::Pow, e1, e2, line)?,
            BinOp::Eq => self.encode_comparison(OpCode::Eq, 1, e1, e2)?,
            BinOp::Lt => self.encode_comparison(OpCode::Lt, 1, e1, e2)?,
            BinOp::LtEq => self.encode_comparison(OpCode::Le, 1, e1, e2)?,
            BinOp::NotEq => self.encode_comparison(OpCode::Eq, 0, e1, e2)?,
            BinOp::Gt => self.encode_comparison(OpCode::Lt, 0, e1, e2)?,
            BinOp::GtEq => self.encode_comparison(OpCode::Le, 0, e1, e2)?,
        }
        Ok(())
    }

    // ---- Statement-level emissions ----

    /// Emit a RETURN of `count` values starting at `first`;
    /// `MULTIPLE_RETURNS` returns everything up to the top of the stack.
    pub fn ret(&mut self, first: u32, count: i32) -> Result<(), CodegenError> {
        debug_assert!(count >= MULTIPLE_RETURNS);
        self.encode_abc(OpCode::Return, first, (count + 1) as u32, 0)?;
        Ok(())
    }

    /// Finalise a table constructor batch: store `store_count` stacked
    /// values (`MULTIPLE_RETURNS` for "up to top") into the array part of
    /// the table at `base`, for elements ending at `element_count`.
    pub fn set_list(
        &mut self,
        base: u32,
        element_count: u32,
        store_count: i32,
    ) -> Result<(), CodegenError> {
        debug_assert!(store_count != 0);
        let b = if store_count == MULTIPLE_RETURNS {
            0
        } else {
            store_count as u32
        };
        let c = element_count.saturating_sub(1) / FIELDS_PER_FLUSH + 1;
        if c <= MAX_C {
            self.encode_abc(OpCode::SetList, base, b, c)?;
        } else if c <= MAX_AX {
            self.encode_abc(OpCode::SetList, base, b, 0)?;
            self.encode_extra_arg(c)?;
        } else {
            return Err(self.syntax_error("constructor too long"));
        }
        // every temporary above the table is released
        self.free_reg = base + 1;
        Ok(())
    }
}

/// Fold an arithmetic operation over two numeric literals. Division and
/// modulo by zero never fold; the runtime raises those.
fn fold_arith(op: OpCode, e1: &ExprDesc, e2: &ExprDesc) -> Option<f64> {
    if !e1.is_numeral() || !e2.is_numeral() {
        return None;
    }
    let (a, b) = match (e1.kind, e2.kind) {
        (ExprKind::Number(a), ExprKind::Number(b)) => (a, b),
        _ => return None,
    };
    match op {
        OpCode::Add => Some(a + b),
        OpCode::Sub => Some(a - b),
        OpCode::Mul => Some(a * b),
        OpCode::Div if b != 0.0 => Some(a / b),
        OpCode::Mod if b != 0.0 => Some(a - (a / b).floor() * b),
        OpCode::Pow => Some(a.powf(b)),
        _ => None,
    }
}
