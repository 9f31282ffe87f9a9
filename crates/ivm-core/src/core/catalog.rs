//! Opcode catalog.
//!
//! Native opcodes have fixed architectural numbers; every synthesized
//! super-instruction enabled by the pattern configuration is assigned
//! the next free tag after `CHECK`, in a fixed enumeration order, so the
//! numbering is stable for a given configuration. The catalog exposes
//! three parallel views built in lockstep: the tag assignment, the
//! 256-entry dispatch table and the attribute (mnemonic/operand-size)
//! table.

use std::collections::HashMap;

use super::opcodes;

/// Memory access or immediate width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// One byte.
    W1,
    /// Two bytes.
    W2,
    /// Four bytes.
    W4,
    /// Eight bytes.
    W8,
}

impl Width {
    /// Width in bytes.
    pub fn bytes(self) -> u8 {
        match self {
            Width::W1 => 1,
            Width::W2 => 2,
            Width::W4 => 4,
            Width::W8 => 8,
        }
    }
}

/// A synthesized super-instruction.
///
/// Each variant stands for one recurring static byte pattern; the fused
/// handler performs the whole sequence in a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fused {
    /// Seen-before twin of a native opcode, skipping the pattern match.
    NewNative(u8),
    /// Run of 2, 4 or 8 `NOP`s.
    NopRun(u8),
    /// `GET_PC; PUSHk imm; ADD; LOADw`.
    LdPc(Width, Width),
    /// `GET_PC; PUSHk imm; ADD; STOREw`.
    StPc(Width, Width),
    /// `GET_PC; PUSHk imm; ADD; JUMP`.
    PcJump(Width),
    /// `GET_PC; PUSHk imm` with no fused tail: push PC, push imm.
    PcPush(Width),
    /// `GET_PC; PUSH1 imm; ADD; NOP`.
    PcNop,
    /// `GET_PC; PUSH1 imm; ADD` with any other tail: push PC + imm.
    PcOffset,
    /// `GET_SP; PUSHk imm; ADD; LOADw`.
    LdSp(Width, Width),
    /// `GET_SP; PUSHk imm; ADD; STOREw`.
    StSp(Width, Width),
    /// `GET_SP; PUSH1 imm; ADD; SET_SP`: move SP up by imm.
    ChangeSp,
    /// `GET_SP; PUSH1 imm; ADD` with any other tail: push SP + imm.
    SpOffset,
    /// `GET_SP; PUSHk imm` with no `ADD`: push SP, push imm.
    SpPush(Width),
    /// `GET_SP; PUSH1 imm; NOT; ADD; SET_SP`: frame-pointer decrement.
    DecSp1,
    /// `GET_SP; STOREw`: pop and discard one word.
    FastPop,
    /// Two chained fast pops.
    FastPop2,
    /// `PUSH0; JZ_FWD imm`: unconditional short forward jump.
    ShortJumpF,
    /// `PUSH0; JZ_BACK imm`: unconditional short backward jump.
    ShortJumpB,
    /// `PUSH0; XOR`: a no-op pair.
    Xor0,
    /// `PUSH0; NOT; MUL`: negate top of stack.
    Not0Mul,
    /// Run of 2, 3 or 4 `PUSH0`s.
    Push0Run(u8),
    /// `PUSH1 k; LT; JZ_FWD off`.
    Lt1Jzf,
    /// `PUSH1 k; LT; JZ_BACK off`.
    Lt1Jzb,
    /// `PUSH1 k; NOT; ADD`: subtract k + 1.
    Not1Add,
    /// `PUSH1 k; LT; NOT`.
    Lt1Not,
    /// `PUSH1 k; LT; NOT; JZ_FWD off`.
    Lt1Jnzf,
    /// `PUSH1 k; LT; NOT; JZ_BACK off`.
    Lt1Jnzb,
    /// `PUSH1 k; POW2; ADD`.
    Pow21Add,
    /// `PUSH1 k; POW2; MUL`.
    Pow21Mul,
    /// `PUSH1 k; POW2; LT`.
    Pow21Lt,
    /// `PUSH1 k; POW2; DIV`.
    Pow21Div,
    /// `PUSH1 k; POW2` with any other tail.
    Pow21,
    /// Run of 2 `PUSH1`s.
    Push1x2,
    /// Run of 4 `PUSH1`s; keeps consuming further pairs.
    Push1x4,
    /// `PUSH1 v; GET_SP; PUSH1 a; ADD; STOREw`: constant to stack slot.
    C1ToStack(Width),
    /// `PUSH1 k; GET_PC; ADD; JUMP`.
    JumpPc1,
    /// `PUSH2 k; GET_PC; ADD; JUMP`.
    JumpPc2,
    /// `PUSH2 v; GET_SP; PUSH1 a; ADD; STOREw`.
    C2ToStack(Width),
    /// `PUSH4 k; GET_PC; ADD; JUMP`.
    JumpPc4,
    /// `LT; JZ_FWD off`.
    LtJzf,
    /// `LT; NOT; JZ_FWD off`.
    LtNotJzf,
    /// `LT; JZ_BACK off`.
    LtJzb,
    /// `LT; NOT; JZ_BACK off`.
    LtNotJzb,
    /// `XOR; PUSH1 k; LT`.
    Xor1Lt,
}

fn pc_load_name(w: Width, imm: Width) -> &'static str {
    use self::Width::*;
    match (w, imm) {
        (W1, W1) => "LD1_PC_1",
        (W2, W1) => "LD2_PC_1",
        (W4, W1) => "LD4_PC_1",
        (W8, W1) => "LD8_PC_1",
        (W1, W2) => "LD1_PC_2",
        (W2, W2) => "LD2_PC_2",
        (W4, W2) => "LD4_PC_2",
        (W8, W2) => "LD8_PC_2",
        (W1, W4) => "LD1_PC_4",
        (W2, W4) => "LD2_PC_4",
        (W4, W4) => "LD4_PC_4",
        (W8, W4) => "LD8_PC_4",
        (W1, W8) => "LD1_PC_8",
        (W2, W8) => "LD2_PC_8",
        (W4, W8) => "LD4_PC_8",
        (W8, W8) => "LD8_PC_8",
    }
}

fn pc_store_name(w: Width, imm: Width) -> &'static str {
    use self::Width::*;
    match (w, imm) {
        (W1, W1) => "ST1_PC_1",
        (W2, W1) => "ST2_PC_1",
        (W4, W1) => "ST4_PC_1",
        (W8, W1) => "ST8_PC_1",
        (W1, W2) => "ST1_PC_2",
        (W2, W2) => "ST2_PC_2",
        (W4, W2) => "ST4_PC_2",
        (W8, W2) => "ST8_PC_2",
        (W1, W4) => "ST1_PC_4",
        (W2, W4) => "ST2_PC_4",
        (W4, W4) => "ST4_PC_4",
        (W8, W4) => "ST8_PC_4",
        (W1, W8) => "ST1_PC_8",
        (W2, W8) => "ST2_PC_8",
        (W4, W8) => "ST4_PC_8",
        (W8, W8) => "ST8_PC_8",
    }
}

fn sp_load_name(w: Width, imm: Width) -> &'static str {
    use self::Width::*;
    match (w, imm) {
        (W1, W1) => "LD1_SP_1",
        (W2, W1) => "LD2_SP_1",
        (W4, W1) => "LD4_SP_1",
        (W8, W1) => "LD8_SP_1",
        (W1, W2) => "LD1_SP_2",
        (W2, W2) => "LD2_SP_2",
        (W4, W2) => "LD4_SP_2",
        (W8, W2) => "LD8_SP_2",
        (W1, W4) => "LD1_SP_4",
        (W2, W4) => "LD2_SP_4",
        (W4, W4) => "LD4_SP_4",
        (W8, W4) => "LD8_SP_4",
        (W1, W8) => "LD1_SP_8",
        (W2, W8) => "LD2_SP_8",
        (W4, W8) => "LD4_SP_8",
        (W8, W8) => "LD8_SP_8",
    }
}

fn sp_store_name(w: Width, imm: Width) -> &'static str {
    use self::Width::*;
    match (w, imm) {
        (W1, W1) => "ST1_SP_1",
        (W2, W1) => "ST2_SP_1",
        (W4, W1) => "ST4_SP_1",
        (W8, W1) => "ST8_SP_1",
        (W1, W2) => "ST1_SP_2",
        (W2, W2) => "ST2_SP_2",
        (W4, W2) => "ST4_SP_2",
        (W8, W2) => "ST8_SP_2",
        (W1, W4) => "ST1_SP_4",
        (W2, W4) => "ST2_SP_4",
        (W4, W4) => "ST4_SP_4",
        (W8, W4) => "ST8_SP_4",
        (W1, W8) => "ST1_SP_8",
        (W2, W8) => "ST2_SP_8",
        (W4, W8) => "ST4_SP_8",
        (W8, W8) => "ST8_SP_8",
    }
}

impl Fused {
    /// Mnemonic shown by diagnostics and histograms.
    pub fn mnemonic(self) -> &'static str {
        use self::Width::*;
        match self {
            Fused::NewNative(op) => match op {
                opcodes::NOP => "NEW_NOP",
                opcodes::GET_PC => "NEW_GET_PC",
                opcodes::GET_SP => "NEW_GET_SP",
                opcodes::PUSH0 => "NEW_PUSH0",
                opcodes::PUSH1 => "NEW_PUSH1",
                opcodes::PUSH2 => "NEW_PUSH2",
                opcodes::PUSH4 => "NEW_PUSH4",
                opcodes::LT => "NEW_LT",
                _ => "NEW_XOR",
            },
            Fused::NopRun(4) => "NOP4",
            Fused::NopRun(8) => "NOP8",
            Fused::NopRun(_) => "NOP2",
            Fused::LdPc(w, imm) => pc_load_name(w, imm),
            Fused::StPc(w, imm) => pc_store_name(w, imm),
            Fused::PcJump(W1) => "PC_1_JUMP",
            Fused::PcJump(W2) => "PC_2_JUMP",
            Fused::PcJump(W4) => "PC_4_JUMP",
            Fused::PcJump(W8) => "PC_8_JUMP",
            Fused::PcPush(W2) => "PC_2",
            Fused::PcPush(W4) => "PC_4",
            Fused::PcPush(_) => "PC_8",
            Fused::PcNop => "PC_1_NOP",
            Fused::PcOffset => "PC_OFFSET",
            Fused::LdSp(w, imm) => sp_load_name(w, imm),
            Fused::StSp(w, imm) => sp_store_name(w, imm),
            Fused::ChangeSp => "CHANGE_SP",
            Fused::SpOffset => "SP_OFFSET",
            Fused::SpPush(W2) => "SP_2",
            Fused::SpPush(_) => "SP_1",
            Fused::DecSp1 => "DEC_SP_1",
            Fused::FastPop => "FAST_POP",
            Fused::FastPop2 => "FAST_POP2",
            Fused::ShortJumpF => "SHORT_JUMPF",
            Fused::ShortJumpB => "SHORT_JUMPB",
            Fused::Xor0 => "XOR_0",
            Fused::Not0Mul => "NOT_0_MUL",
            Fused::Push0Run(3) => "PUSH0X3",
            Fused::Push0Run(4) => "PUSH0X4",
            Fused::Push0Run(_) => "PUSH0X2",
            Fused::Lt1Jzf => "LT_1_JZF",
            Fused::Lt1Jzb => "LT_1_JZB",
            Fused::Not1Add => "NOT_1_ADD",
            Fused::Lt1Not => "LT_1_NOT",
            Fused::Lt1Jnzf => "LT_1_JNZF",
            Fused::Lt1Jnzb => "LT_1_JNZB",
            Fused::Pow21Add => "POW2_1_ADD",
            Fused::Pow21Mul => "POW2_1_MUL",
            Fused::Pow21Lt => "POW2_1_LT",
            Fused::Pow21Div => "POW2_1_DIV",
            Fused::Pow21 => "POW2_1",
            Fused::Push1x2 => "PUSH1X2",
            Fused::Push1x4 => "PUSH1X4",
            Fused::C1ToStack(W1) => "C1TOSTACK1",
            Fused::C1ToStack(W2) => "C1TOSTACK2",
            Fused::C1ToStack(W4) => "C1TOSTACK4",
            Fused::C1ToStack(W8) => "C1TOSTACK8",
            Fused::JumpPc1 => "JUMP_PC_1",
            Fused::JumpPc2 => "JUMP_PC_2",
            Fused::C2ToStack(W1) => "C2TOSTACK1",
            Fused::C2ToStack(W2) => "C2TOSTACK2",
            Fused::C2ToStack(W4) => "C2TOSTACK4",
            Fused::C2ToStack(W8) => "C2TOSTACK8",
            Fused::JumpPc4 => "JUMP_PC_4",
            Fused::LtJzf => "LT_JZF",
            Fused::LtNotJzf => "LT_NOT_JZF",
            Fused::LtJzb => "LT_JZB",
            Fused::LtNotJzb => "LT_NOT_JZB",
            Fused::Xor1Lt => "XOR_1_LT",
        }
    }

    /// Total length in bytes of the replaced pattern.
    pub fn pattern_bytes(self) -> u8 {
        match self {
            Fused::NewNative(op) => 1 + opcodes::immediate_bytes(op),
            Fused::NopRun(n) | Fused::Push0Run(n) => n,
            Fused::LdPc(_, imm) | Fused::StPc(_, imm) => 4 + imm.bytes(),
            Fused::PcJump(imm) => 4 + imm.bytes(),
            Fused::PcPush(imm) => 2 + imm.bytes(),
            Fused::PcNop => 5,
            Fused::PcOffset => 4,
            Fused::LdSp(_, imm) | Fused::StSp(_, imm) => 4 + imm.bytes(),
            Fused::ChangeSp => 5,
            Fused::SpOffset => 4,
            Fused::SpPush(imm) => 2 + imm.bytes(),
            Fused::DecSp1 => 6,
            Fused::FastPop => 2,
            Fused::FastPop2 => 4,
            Fused::ShortJumpF | Fused::ShortJumpB => 3,
            Fused::Xor0 => 2,
            Fused::Not0Mul => 3,
            Fused::Lt1Jzf | Fused::Lt1Jzb => 5,
            Fused::Not1Add | Fused::Lt1Not => 4,
            Fused::Lt1Jnzf | Fused::Lt1Jnzb => 6,
            Fused::Pow21Add | Fused::Pow21Mul | Fused::Pow21Lt | Fused::Pow21Div => 4,
            Fused::Pow21 => 3,
            Fused::Push1x2 => 4,
            Fused::Push1x4 => 8,
            Fused::C1ToStack(_) => 7,
            Fused::JumpPc1 => 5,
            Fused::JumpPc2 => 6,
            Fused::C2ToStack(_) => 8,
            Fused::JumpPc4 => 8,
            Fused::LtJzf | Fused::LtJzb => 3,
            Fused::LtNotJzf | Fused::LtNotJzb => 4,
            Fused::Xor1Lt => 4,
        }
    }

    /// Immediate operand length recorded in the attribute table: the
    /// pattern length minus the opcode byte itself.
    pub fn opbytes(self) -> u8 {
        self.pattern_bytes() - 1
    }

    /// How many original instructions one dispatch of this tag executes.
    pub fn steps(self) -> u64 {
        match self {
            Fused::NewNative(_) => 1,
            Fused::NopRun(n) | Fused::Push0Run(n) => u64::from(n),
            Fused::LdPc(..) | Fused::StPc(..) | Fused::PcJump(_) | Fused::PcNop => 4,
            Fused::PcPush(_) => 2,
            Fused::PcOffset => 3,
            Fused::LdSp(..) | Fused::StSp(..) | Fused::ChangeSp => 4,
            Fused::SpOffset => 3,
            Fused::SpPush(_) => 2,
            Fused::DecSp1 => 5,
            Fused::FastPop => 2,
            Fused::FastPop2 => 4,
            Fused::ShortJumpF | Fused::ShortJumpB | Fused::Xor0 => 2,
            Fused::Not0Mul => 3,
            Fused::Lt1Jzf | Fused::Lt1Jzb | Fused::Not1Add | Fused::Lt1Not => 3,
            Fused::Lt1Jnzf | Fused::Lt1Jnzb => 4,
            Fused::Pow21Add | Fused::Pow21Mul | Fused::Pow21Lt | Fused::Pow21Div => 3,
            Fused::Pow21 => 2,
            Fused::Push1x2 => 2,
            Fused::Push1x4 => 4,
            Fused::C1ToStack(_) | Fused::C2ToStack(_) => 5,
            Fused::JumpPc1 | Fused::JumpPc2 | Fused::JumpPc4 => 4,
            Fused::LtJzf | Fused::LtJzb => 2,
            Fused::LtNotJzf | Fused::LtNotJzb => 3,
            Fused::Xor1Lt => 3,
        }
    }
}

/// How a pattern family takes part in dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyToggle {
    /// No tag assigned; the native executes plainly.
    Off,
    /// Pattern is matched and fused, but bytes are never rewritten.
    Use,
    /// Pattern is matched, fused and the opcode byte rewritten in place.
    Recode,
}

impl FamilyToggle {
    /// Whether this family's ops receive tags and fused handlers.
    pub fn enabled(self) -> bool {
        self != FamilyToggle::Off
    }

    /// Whether matched patterns rewrite the fetched opcode byte.
    pub fn recodes(self) -> bool {
        self == FamilyToggle::Recode
    }
}

/// The control panel: which pattern families exist in this build of the
/// catalog and whether they rewrite bytecode.
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Seen-before twins for natives that carry a pattern matcher.
    pub recode_native: FamilyToggle,
    /// Runs of `NOP`.
    pub nopn: FamilyToggle,
    /// `GET_PC; PUSH1; ADD` and tails.
    pub getpc_push1_add: FamilyToggle,
    /// `GET_PC; PUSH2; ADD` and tails.
    pub getpc_push2_add: FamilyToggle,
    /// `GET_PC; PUSH4; ADD` and tails.
    pub getpc_push4_add: FamilyToggle,
    /// `GET_PC; PUSH8; ADD` and tails.
    pub getpc_push8_add: FamilyToggle,
    /// `GET_SP; PUSH1; ADD` and tails.
    pub getsp_push1_add: FamilyToggle,
    /// `GET_SP; PUSH2; ADD` and tails.
    pub getsp_push2_add: FamilyToggle,
    /// `GET_SP; PUSH1` without `ADD`, and the frame-pointer decrement.
    pub getsp_push1: FamilyToggle,
    /// `GET_SP; STORE*` fast pops.
    pub getsp_store: FamilyToggle,
    /// `PUSH0` shortcuts and runs.
    pub push0: FamilyToggle,
    /// `PUSH1` compare-and-branch shortcuts.
    pub push1_alu: FamilyToggle,
    /// `PUSH1; POW2` arithmetic.
    pub push1_pow2: FamilyToggle,
    /// Runs of `PUSH1`.
    pub push1n: FamilyToggle,
    /// `PUSH1` constant-to-stack and pc-relative jump.
    pub push1_high4: FamilyToggle,
    /// `PUSH2` constant-to-stack and pc-relative jump.
    pub push2: FamilyToggle,
    /// `PUSH4` pc-relative jump.
    pub push4: FamilyToggle,
    /// `LT` compare-and-branch.
    pub lt: FamilyToggle,
    /// `XOR; PUSH1; LT`.
    pub xor: FamilyToggle,
    /// Raise a fault on zero divisors instead of yielding zero.
    pub fault_on_div_zero: bool,
}

impl PatternConfig {
    fn uniform(toggle: FamilyToggle) -> Self {
        PatternConfig {
            recode_native: toggle,
            nopn: toggle,
            getpc_push1_add: toggle,
            getpc_push2_add: toggle,
            getpc_push4_add: toggle,
            getpc_push8_add: toggle,
            getsp_push1_add: toggle,
            getsp_push2_add: toggle,
            getsp_push1: toggle,
            getsp_store: toggle,
            push0: toggle,
            push1_alu: toggle,
            push1_pow2: toggle,
            push1n: toggle,
            push1_high4: toggle,
            push2: toggle,
            push4: toggle,
            lt: toggle,
            xor: toggle,
            fault_on_div_zero: false,
        }
    }

    /// Every family enabled with in-place recoding. The default panel.
    pub fn full() -> Self {
        Self::uniform(FamilyToggle::Recode)
    }

    /// Every family matched and fused, but no byte ever rewritten.
    pub fn use_only() -> Self {
        Self::uniform(FamilyToggle::Use)
    }

    /// Plain interpreter: no patterns, no recoding.
    pub fn none() -> Self {
        Self::uniform(FamilyToggle::Off)
    }
}

impl PatternConfig {
    /// The toggle governing a synthesized opcode's family.
    pub fn toggle_for(&self, fused: Fused) -> FamilyToggle {
        use self::Fused::*;
        use self::Width::*;
        match fused {
            NewNative(_) => self.recode_native,
            NopRun(_) => self.nopn,
            LdPc(_, W1) | StPc(_, W1) | PcJump(W1) | PcNop | PcOffset => self.getpc_push1_add,
            LdPc(_, W2) | StPc(_, W2) | PcJump(W2) | PcPush(W2) => self.getpc_push2_add,
            LdPc(_, W4) | StPc(_, W4) | PcJump(W4) | PcPush(W4) => self.getpc_push4_add,
            LdPc(_, W8) | StPc(_, W8) | PcJump(W8) | PcPush(_) => self.getpc_push8_add,
            LdSp(_, W1) | StSp(_, W1) | ChangeSp | SpOffset => self.getsp_push1_add,
            LdSp(_, _) | StSp(_, _) | SpPush(W2) => self.getsp_push2_add,
            SpPush(_) | DecSp1 => self.getsp_push1,
            FastPop | FastPop2 => self.getsp_store,
            ShortJumpF | ShortJumpB | Xor0 | Not0Mul | Push0Run(_) => self.push0,
            Lt1Jzf | Lt1Jzb | Not1Add | Lt1Not | Lt1Jnzf | Lt1Jnzb => self.push1_alu,
            Pow21Add | Pow21Mul | Pow21Lt | Pow21Div | Pow21 => self.push1_pow2,
            Push1x2 | Push1x4 => self.push1n,
            C1ToStack(_) | JumpPc1 => self.push1_high4,
            JumpPc2 | C2ToStack(_) => self.push2,
            JumpPc4 => self.push4,
            LtJzf | LtNotJzf | LtJzb | LtNotJzb => self.lt,
            Xor1Lt => self.xor,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self::full()
    }
}

/// One dispatch table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// A native opcode at its architectural number.
    Native(u8),
    /// A synthesized super-instruction.
    Fused(Fused),
    /// No handler; executing this byte is a fatal error.
    Unassigned,
}

/// Attributes of one opcode byte: mnemonic and immediate operand size.
#[derive(Debug, Clone, Copy)]
pub struct InsnAttr {
    /// Mnemonic, or `"???"` for unassigned bytes.
    pub name: &'static str,
    /// Immediate operand length in bytes (opcode byte not counted). For
    /// synthesized opcodes this is the full pattern length minus one.
    pub opbytes: u8,
    /// Whether the byte has a dispatch entry.
    pub present: bool,
}

const UNASSIGNED_ATTR: InsnAttr = InsnAttr {
    name: "???",
    opbytes: 0,
    present: false,
};

/// The built catalog: tag assignment, dispatch table and attributes.
pub struct OpcodeCatalog {
    config: PatternConfig,
    dispatch: [Op; 256],
    attrs: [InsnAttr; 256],
    tags: HashMap<Fused, u8>,
}

/// Natives carrying a pattern matcher, in twin-assignment order.
pub const MATCHED_NATIVES: [u8; 9] = [
    opcodes::NOP,
    opcodes::GET_PC,
    opcodes::GET_SP,
    opcodes::PUSH0,
    opcodes::PUSH1,
    opcodes::PUSH2,
    opcodes::PUSH4,
    opcodes::LT,
    opcodes::XOR,
];

fn family(ops: &mut Vec<Fused>, toggle: FamilyToggle, members: &[Fused]) {
    if toggle.enabled() {
        ops.extend_from_slice(members);
    }
}

fn enabled_ops(config: &PatternConfig) -> Vec<Fused> {
    use self::Fused::*;
    use self::Width::*;

    let mut ops = Vec::new();
    if config.recode_native.enabled() {
        for &op in &MATCHED_NATIVES {
            ops.push(NewNative(op));
        }
    }
    family(&mut ops, config.nopn, &[NopRun(2), NopRun(4), NopRun(8)]);
    for &(imm, toggle) in &[
        (W8, config.getpc_push8_add),
        (W4, config.getpc_push4_add),
        (W2, config.getpc_push2_add),
    ] {
        family(
            &mut ops,
            toggle,
            &[
                LdPc(W1, imm),
                LdPc(W2, imm),
                LdPc(W4, imm),
                LdPc(W8, imm),
                StPc(W1, imm),
                StPc(W2, imm),
                StPc(W4, imm),
                StPc(W8, imm),
                PcJump(imm),
                PcPush(imm),
            ],
        );
    }
    family(
        &mut ops,
        config.getpc_push1_add,
        &[
            LdPc(W1, W1),
            LdPc(W2, W1),
            LdPc(W4, W1),
            LdPc(W8, W1),
            StPc(W1, W1),
            StPc(W2, W1),
            StPc(W4, W1),
            StPc(W8, W1),
            PcJump(W1),
            PcNop,
            PcOffset,
        ],
    );
    family(
        &mut ops,
        config.getsp_push1_add,
        &[
            LdSp(W1, W1),
            LdSp(W2, W1),
            LdSp(W4, W1),
            LdSp(W8, W1),
            StSp(W1, W1),
            StSp(W2, W1),
            StSp(W4, W1),
            StSp(W8, W1),
            ChangeSp,
            SpOffset,
        ],
    );
    family(
        &mut ops,
        config.getsp_push2_add,
        &[
            LdSp(W1, W2),
            LdSp(W2, W2),
            LdSp(W4, W2),
            LdSp(W8, W2),
            StSp(W1, W2),
            StSp(W2, W2),
            StSp(W4, W2),
            StSp(W8, W2),
            SpPush(W2),
        ],
    );
    family(&mut ops, config.getsp_push1, &[SpPush(W1), DecSp1]);
    family(&mut ops, config.getsp_store, &[FastPop, FastPop2]);
    family(
        &mut ops,
        config.push0,
        &[
            ShortJumpF,
            ShortJumpB,
            Xor0,
            Not0Mul,
            Push0Run(2),
            Push0Run(3),
            Push0Run(4),
        ],
    );
    family(
        &mut ops,
        config.push1_alu,
        &[Lt1Jzf, Lt1Jzb, Not1Add, Lt1Not, Lt1Jnzf, Lt1Jnzb],
    );
    family(
        &mut ops,
        config.push1_pow2,
        &[Pow21Add, Pow21Mul, Pow21Lt, Pow21Div, Pow21],
    );
    family(&mut ops, config.push1n, &[Push1x2, Push1x4]);
    family(
        &mut ops,
        config.push1_high4,
        &[
            C1ToStack(W1),
            C1ToStack(W2),
            C1ToStack(W4),
            C1ToStack(W8),
            JumpPc1,
        ],
    );
    family(
        &mut ops,
        config.push2,
        &[
            JumpPc2,
            C2ToStack(W1),
            C2ToStack(W2),
            C2ToStack(W4),
            C2ToStack(W8),
        ],
    );
    family(&mut ops, config.push4, &[JumpPc4]);
    family(&mut ops, config.lt, &[LtJzf, LtNotJzf, LtJzb, LtNotJzb]);
    family(&mut ops, config.xor, &[Xor1Lt]);
    ops
}

impl OpcodeCatalog {
    /// Build the catalog for a pattern configuration.
    pub fn new(config: PatternConfig) -> Self {
        let mut dispatch = [Op::Unassigned; 256];
        let mut attrs = [UNASSIGNED_ATTR; 256];
        let mut tags = HashMap::new();

        for op in opcodes::all() {
            dispatch[op as usize] = Op::Native(op);
            attrs[op as usize] = InsnAttr {
                name: opcodes::mnemonic(op).unwrap_or("???"),
                opbytes: opcodes::immediate_bytes(op),
                present: true,
            };
        }

        let mut next = opcodes::FIRST_SYNTHESIZED;
        for fused in enabled_ops(&config) {
            assert!(next < opcodes::BREAK, "synthesized tags overflow into the debug range");
            dispatch[next as usize] = Op::Fused(fused);
            attrs[next as usize] = InsnAttr {
                name: fused.mnemonic(),
                opbytes: fused.opbytes(),
                present: true,
            };
            tags.insert(fused, next);
            next += 1;
        }

        debug!(
            "opcode catalog: {} synthesized tags assigned up to {:#x}",
            tags.len(),
            next.saturating_sub(1)
        );

        OpcodeCatalog {
            config,
            dispatch,
            attrs,
            tags,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Dispatch entry for an opcode byte.
    #[inline]
    pub fn entry(&self, op: u8) -> Op {
        self.dispatch[op as usize]
    }

    /// Attributes of an opcode byte.
    pub fn attr(&self, op: u8) -> &InsnAttr {
        &self.attrs[op as usize]
    }

    /// The tag assigned to a synthesized opcode, when enabled.
    pub fn tag(&self, fused: Fused) -> Option<u8> {
        self.tags.get(&fused).copied()
    }

    /// Number of synthesized tags in this catalog.
    pub fn synthesized_count(&self) -> usize {
        self.tags.len()
    }
}
