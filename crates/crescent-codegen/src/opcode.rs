/// Opcodes and instruction encoding for the register-based stack machine.
///
/// Instruction format (32 bits):
/// - Bits 0-5: OpCode (6 bits)
/// - Bits 6-13: A (8 bits)
/// - For iABC format:
///   - Bits 14-22: B (9 bits)
///   - Bits 23-31: C (9 bits)
///   B and C may independently be RK operands: the top bit of the 9-bit
///   field selects a constant-pool index, otherwise the value is a register.
///   Note: PUC Lua packs C below B in the word; we keep B below C for
///   simplicity. Only the field widths and the RK bit matter to the
///   generator.
/// - For iABx: Bx = bits 14-31 (unsigned 18 bits)
/// - For iAsBx: sBx = Bx - OFFSET_SBX (signed interpretation)
/// - For iAx: Ax = bits 6-31 (26 bits, unsigned)
use std::fmt;

/// Size constants for instruction fields.
const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 9;
const SIZE_C: u32 = 9;
const SIZE_BX: u32 = SIZE_B + SIZE_C; // 18
const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C; // 26

/// Position constants.
const POS_OP: u32 = 0;
const POS_A: u32 = POS_OP + SIZE_OP; // 6
const POS_B: u32 = POS_A + SIZE_A; // 14
const POS_C: u32 = POS_B + SIZE_B; // 23

/// Mask helpers.
const fn mask(n: u32) -> u32 {
    (1 << n) - 1
}

pub const MAX_A: u32 = mask(SIZE_A); // 255
pub const MAX_B: u32 = mask(SIZE_B); // 511
pub const MAX_C: u32 = mask(SIZE_C); // 511
pub const MAX_BX: u32 = mask(SIZE_BX); // 262143
pub const MAX_SBX: i32 = (MAX_BX >> 1) as i32; // 131071
pub const MIN_SBX: i32 = -MAX_SBX;
pub const MAX_AX: u32 = mask(SIZE_AX); // 67108863

const OFFSET_SBX: i32 = MAX_SBX;

/// Top bit of a 9-bit operand: set means "constant-pool index".
pub const BIT_RK: u32 = 1 << (SIZE_B - 1); // 256
/// Largest constant index that still fits in an RK operand.
pub const MAX_INDEX_RK: u32 = BIT_RK - 1; // 255

/// Is this RK operand a constant-pool reference?
pub const fn is_constant(rk: u32) -> bool {
    rk & BIT_RK != 0
}

/// Encode a constant index as an RK operand.
pub const fn as_constant(index: u32) -> u32 {
    index | BIT_RK
}

/// Extract the constant index from an RK operand.
pub const fn constant_index(rk: u32) -> u32 {
    rk & !BIT_RK
}

/// The opcode set understood by the virtual machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadKx,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    Self_,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    VarArg,
    SetList,
    Closure,
    ExtraArg,
}

/// Instruction format types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx, // signed Bx, same bits as ABx
    IAx,
}

/// How an operand position is interpreted by the machine. Emission asserts
/// that `Unused` operands are zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgMode {
    /// Operand is not used.
    Unused,
    /// Operand is used, but is neither a register nor a constant.
    Used,
    /// Operand is a register or a jump offset.
    Register,
    /// Operand is a register or a constant-pool index (RK).
    ConstantOrRegister,
}

impl OpCode {
    /// Number of opcodes.
    pub const COUNT: usize = 36;

    /// Get the opcode from a u8 value.
    pub fn from_u8(val: u8) -> Option<OpCode> {
        if (val as usize) < Self::COUNT {
            // Safety: OpCode is repr(u8) and we've verified the range
            Some(unsafe { std::mem::transmute::<u8, OpCode>(val) })
        } else {
            None
        }
    }

    /// Get the instruction format for this opcode.
    pub fn format(&self) -> InstructionFormat {
        use InstructionFormat::*;
        use OpCode::*;
        match self {
            ExtraArg => IAx,
            Jmp => IAsBx,
            LoadK | LoadKx | Closure => IABx,
            _ => IABC,
        }
    }

    /// Argument mode of the B operand (the Bx operand for iABx/iAsBx).
    pub fn b_mode(&self) -> ArgMode {
        use ArgMode::*;
        use OpCode::*;
        match self {
            Move | GetTable | Self_ | Unm | Not | Len | Concat | Jmp | TestSet => Register,
            LoadK | GetTabUp | SetTabUp | SetTable | Add | Sub | Mul | Div | Mod | Pow | Eq
            | Lt | Le => ConstantOrRegister,
            LoadKx | Test => Unused,
            LoadBool | LoadNil | GetUpval | SetUpval | NewTable | Call | TailCall | Return
            | VarArg | SetList | Closure | ExtraArg => Used,
        }
    }

    /// Argument mode of the C operand.
    pub fn c_mode(&self) -> ArgMode {
        use ArgMode::*;
        use OpCode::*;
        match self {
            GetTabUp | GetTable | SetTabUp | SetTable | Self_ | Add | Sub | Mul | Div | Mod
            | Pow | Eq | Lt | Le => ConstantOrRegister,
            Concat => Register,
            LoadBool | NewTable | Test | TestSet | Call | TailCall | SetList | ExtraArg => Used,
            Move | LoadK | LoadKx | LoadNil | GetUpval | SetUpval | Unm | Not | Len | Jmp
            | Return | VarArg | Closure => Unused,
        }
    }

    /// Returns true for instructions whose following instruction must be a
    /// conditional jump; the pair is patched as one logical branch.
    pub fn is_test(&self) -> bool {
        use OpCode::*;
        matches!(self, Eq | Lt | Le | Test | TestSet)
    }

    /// Get the name of this opcode.
    pub fn name(&self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadK => "LOADK",
            LoadKx => "LOADKX",
            LoadBool => "LOADBOOL",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            SetTabUp => "SETTABUP",
            SetUpval => "SETUPVAL",
            SetTable => "SETTABLE",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Pow => "POW",
            Unm => "UNM",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            Test => "TEST",
            TestSet => "TESTSET",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            VarArg => "VARARG",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            ExtraArg => "EXTRAARG",
        }
    }
}

/// A 32-bit instruction word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    // ---- Constructors ----

    /// Create an iABC instruction.
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        debug_assert!(a <= MAX_A, "A out of range: {a}");
        debug_assert!(b <= MAX_B, "B out of range: {b}");
        debug_assert!(c <= MAX_C, "C out of range: {c}");
        let mut i = (op as u32) << POS_OP;
        i |= a << POS_A;
        i |= b << POS_B;
        i |= c << POS_C;
        Instruction(i)
    }

    /// Create an iABx instruction.
    pub fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        debug_assert!(a <= MAX_A, "A out of range: {a}");
        debug_assert!(bx <= MAX_BX, "Bx out of range: {bx}");
        let mut i = (op as u32) << POS_OP;
        i |= a << POS_A;
        i |= bx << POS_B;
        Instruction(i)
    }

    /// Create an iAsBx instruction (signed Bx).
    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        debug_assert!((MIN_SBX..=MAX_SBX).contains(&sbx), "sBx out of range: {sbx}");
        Self::abx(op, a, (sbx + OFFSET_SBX) as u32)
    }

    /// Create an iAx instruction.
    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAX_AX, "Ax out of range: {ax}");
        let mut i = (op as u32) << POS_OP;
        i |= ax << POS_A;
        Instruction(i)
    }

    // ---- Decoders ----

    /// Get the opcode.
    pub fn opcode(&self) -> OpCode {
        let val = (self.0 >> POS_OP) & mask(SIZE_OP);
        OpCode::from_u8(val as u8).unwrap_or(OpCode::Move)
    }

    /// Get field A.
    pub fn a(&self) -> u32 {
        (self.0 >> POS_A) & mask(SIZE_A)
    }

    /// Get field B.
    pub fn b(&self) -> u32 {
        (self.0 >> POS_B) & mask(SIZE_B)
    }

    /// Get field C.
    pub fn c(&self) -> u32 {
        (self.0 >> POS_C) & mask(SIZE_C)
    }

    /// Get field Bx (unsigned).
    pub fn bx(&self) -> u32 {
        (self.0 >> POS_B) & mask(SIZE_BX)
    }

    /// Get field sBx (signed).
    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    /// Get field Ax (unsigned).
    pub fn ax_field(&self) -> u32 {
        (self.0 >> POS_A) & mask(SIZE_AX)
    }

    // ---- Mutators (for backpatching) ----

    /// Set field A.
    pub fn set_a(&mut self, a: u32) {
        debug_assert!(a <= MAX_A);
        self.0 = (self.0 & !(mask(SIZE_A) << POS_A)) | (a << POS_A);
    }

    /// Set field B.
    pub fn set_b(&mut self, b: u32) {
        debug_assert!(b <= MAX_B);
        self.0 = (self.0 & !(mask(SIZE_B) << POS_B)) | (b << POS_B);
    }

    /// Set field C.
    pub fn set_c(&mut self, c: u32) {
        debug_assert!(c <= MAX_C);
        self.0 = (self.0 & !(mask(SIZE_C) << POS_C)) | (c << POS_C);
    }

    /// Set field sBx.
    pub fn set_sbx(&mut self, sbx: i32) {
        debug_assert!((MIN_SBX..=MAX_SBX).contains(&sbx));
        let bx = (sbx + OFFSET_SBX) as u32;
        self.0 = (self.0 & !(mask(SIZE_BX) << POS_B)) | (bx << POS_B);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}", op.name())?;
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, " A={} B={} C={}", self.a(), self.b(), self.c())
            }
            InstructionFormat::IABx => write!(f, " A={} Bx={}", self.a(), self.bx()),
            InstructionFormat::IAsBx => write!(f, " A={} sBx={}", self.a(), self.sbx()),
            InstructionFormat::IAx => write!(f, " Ax={}", self.ax_field()),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
