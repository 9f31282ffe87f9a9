//! The dispatch loop.
//!
//! Fetches one opcode byte per iteration, optionally pattern-matches
//! the bytes behind it, and dispatches through the catalog. When
//! recoding is active, a matched pattern rewrites the fetched byte in
//! place with the synthesized tag so later executions of the same
//! address skip the matcher. This
//! makes the interpreter a self-modifying two-tier design: cold code
//! pays for the match once, hot code dispatches straight to the fused
//! handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::drivers::{IoInterface, NullIo};
use crate::errors::{CResult, Fault};

use super::catalog::{Fused, Op, OpcodeCatalog, Width};
use super::memory::MemoryImage;
use super::opcodes as op;
use super::types::{Addr, Word, BINARY_VERSION, BYTES_PER_WORD};

/// Machine life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No program loaded.
    Uninitialized,
    /// Program in memory, ready to run.
    Loaded,
    /// Dispatch loop active.
    Running,
    /// Dispatch loop left, cleanly or not.
    Halted,
}

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// `EXIT` executed; top-of-stack is the program's return value.
    Exit,
    /// A fault unwound to the halt path.
    Fault(Fault),
}

enum Flow {
    Continue,
    Halt,
}

fn io_fault(e: Box<dyn std::error::Error>) -> Fault {
    Fault::Io(e.to_string())
}

fn pow2(u: u64) -> u64 {
    if u <= 63 {
        1u64 << u
    } else {
        0
    }
}

fn is_store(b: u8) -> bool {
    b & 0xfc == op::STORE1
}

fn store_width(b: u8) -> Width {
    match b {
        op::STORE1 => Width::W1,
        op::STORE2 => Width::W2,
        op::STORE4 => Width::W4,
        _ => Width::W8,
    }
}

fn is_matched_native(b: u8) -> bool {
    super::catalog::MATCHED_NATIVES.contains(&b)
}

/// The interpreter: program counter, stack pointer, memory image,
/// opcode catalog and counters. Everything else the guest can observe
/// lives in the memory image itself.
pub struct Cpu {
    /// Guest memory.
    pub memory: MemoryImage,
    /// I/O driver used by the frame opcodes.
    pub io: Box<dyn IoInterface>,

    catalog: OpcodeCatalog,
    interrupt: Arc<AtomicBool>,
    pc: Addr,
    sp: Addr,
    state: State,
    halt: Option<HaltReason>,
    last_fetch: Addr,
    fetches: u64,
    samples: Box<[u64; 256]>,
    histogram: Box<[u64; 256]>,
    recodes: Box<[u64; 256]>,
    probe: u8,
    trace: u8,
}

impl Cpu {
    /// Create a machine over `memory` with the given catalog and driver.
    pub fn new(memory: MemoryImage, catalog: OpcodeCatalog, io: Box<dyn IoInterface>) -> Self {
        let sp = memory.len() - BYTES_PER_WORD;
        Cpu {
            memory,
            io,
            catalog,
            interrupt: Arc::new(AtomicBool::new(false)),
            pc: 0,
            sp,
            state: State::Uninitialized,
            halt: None,
            last_fetch: 0,
            fetches: 0,
            samples: Box::new([0; 256]),
            histogram: Box::new([0; 256]),
            recodes: Box::new([0; 256]),
            probe: 0,
            trace: 0,
        }
    }

    /// Create a headless machine; frame opcodes log instead of writing.
    pub fn headless(memory: MemoryImage, catalog: OpcodeCatalog) -> Self {
        Self::new(memory, catalog, Box::new(NullIo))
    }

    /// Load the program at `offset` and point the program counter at it.
    pub fn load_bytecode(&mut self, bytes: &[u8], offset: Addr) -> CResult {
        self.memory.load_program(bytes, offset)?;
        self.pc = offset;
        self.state = State::Loaded;
        Ok(())
    }

    /// Load the argument file behind the program image.
    pub fn load_argument(&mut self, bytes: &[u8]) -> CResult {
        self.memory.load_argument(bytes)
    }

    /// Load the environment file behind the argument file.
    pub fn load_environment(&mut self, bytes: &[u8]) -> CResult {
        self.memory.load_environment(bytes)
    }

    /// The flag polled once per dispatch iteration. Storing `true`
    /// (e.g. from a SIGINT handler) halts the loop with
    /// [`Fault::Interrupted`]. Safe to set from a signal handler.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Replace the interrupt flag, e.g. with one owned by a signal
    /// handler installed by the frontend.
    pub fn set_interrupt_flag(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = flag;
    }

    /// Current program counter.
    pub fn pc(&self) -> Addr {
        self.pc
    }

    /// Current stack pointer.
    pub fn sp(&self) -> Addr {
        self.sp
    }

    /// Life-cycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Why the last run stopped, once halted.
    pub fn halt_reason(&self) -> Option<&HaltReason> {
        self.halt.as_ref()
    }

    /// Address of the most recently fetched opcode.
    pub fn last_fetch(&self) -> Addr {
        self.last_fetch
    }

    /// Number of opcode fetches so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches
    }

    /// Per-probe instruction counters.
    pub fn samples(&self) -> &[u64; 256] {
        &self.samples
    }

    /// Fetches per opcode byte. Fetches of a native that matched a
    /// pattern are attributed to the synthesized tag.
    pub fn histogram(&self) -> &[u64; 256] {
        &self.histogram
    }

    /// In-place rewrites per synthesized tag.
    pub fn recode_counts(&self) -> &[u64; 256] {
        &self.recodes
    }

    /// Total executed instructions across all probes.
    pub fn instruction_count(&self) -> u64 {
        self.samples.iter().sum()
    }

    /// The catalog this machine dispatches through.
    pub fn catalog(&self) -> &OpcodeCatalog {
        &self.catalog
    }

    /// Word on top of the stack, if the stack pointer is in range.
    pub fn top_of_stack(&self) -> Option<Word> {
        self.memory.read_u64(self.sp).ok()
    }

    /// Run until `EXIT` or a fault.
    pub fn run(&mut self) -> HaltReason {
        self.state = State::Running;
        let reason = loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => break HaltReason::Exit,
                Err(fault) => break HaltReason::Fault(fault),
            }
        };
        self.state = State::Halted;
        self.halt = Some(reason.clone());
        reason
    }

    #[inline]
    fn push(&mut self, v: Word) -> Result<(), Fault> {
        self.sp = self.sp.wrapping_sub(BYTES_PER_WORD);
        self.memory.write_u64(self.sp, v)
    }

    #[inline]
    fn pop(&mut self) -> Result<Word, Fault> {
        let v = self.memory.read_u64(self.sp)?;
        self.sp = self.sp.wrapping_add(BYTES_PER_WORD);
        Ok(v)
    }

    #[inline]
    fn count(&mut self, n: u64) {
        self.samples[self.probe as usize] += n;
    }

    /// Byte at `pc + i`, reading zero past the end of memory. Used by
    /// the pattern matchers only; no tail byte value is zero, so an
    /// out-of-range peek never produces a match.
    #[inline]
    fn peek(&self, i: u64) -> u8 {
        self.memory.peek(self.pc.wrapping_add(i))
    }

    #[inline]
    fn imm(&self, at: Addr, width: Width) -> Result<u64, Fault> {
        self.memory.read_uint(at, width.bytes())
    }

    fn divide(&self, v: u64, u: u64) -> Result<u64, Fault> {
        if u == 0 {
            if self.catalog.config().fault_on_div_zero {
                Err(Fault::DivisionByZero)
            } else {
                Ok(0)
            }
        } else {
            Ok(v / u)
        }
    }

    fn remainder(&self, v: u64, u: u64) -> Result<u64, Fault> {
        if u == 0 {
            if self.catalog.config().fault_on_div_zero {
                Err(Fault::DivisionByZero)
            } else {
                Ok(0)
            }
        } else {
            Ok(v % u)
        }
    }

    fn step(&mut self) -> Result<Flow, Fault> {
        if self.interrupt.swap(false, Ordering::Relaxed) {
            return Err(Fault::Interrupted);
        }
        let at = self.pc;
        let opcode = self.memory.read_u8(at)?;
        self.pc = at.wrapping_add(1);
        self.last_fetch = at;
        self.fetches += 1;
        self.histogram[opcode as usize] += 1;
        if self.trace > 0 {
            trace!(
                "start+{:#x}: {:9} sp={:#x} tos={:#x}",
                at,
                self.catalog.attr(opcode).name,
                self.sp,
                self.top_of_stack().unwrap_or(0)
            );
        }
        match self.catalog.entry(opcode) {
            Op::Native(native) => self.dispatch_native(native, at),
            Op::Fused(fused) => {
                self.count(fused.steps());
                self.exec_fused(fused)
            }
            Op::Unassigned => Err(Fault::UnknownOpcode(opcode)),
        }
    }

    fn dispatch_native(&mut self, native: u8, at: Addr) -> Result<Flow, Fault> {
        if let Some(fused) = self.match_pattern(native) {
            if let Some(tag) = self.catalog.tag(fused) {
                // The fetch belongs to the synthesized tag, not to the
                // native that fronted the pattern.
                self.histogram[native as usize] -= 1;
                self.histogram[tag as usize] += 1;
                if self.catalog.config().toggle_for(fused).recodes() {
                    self.memory.write_u8(at, tag)?;
                    self.recodes[tag as usize] += 1;
                }
            }
            self.count(fused.steps());
            return self.exec_fused(fused);
        }
        // Pattern miss: rewrite to the seen-before twin so later fetches
        // of this address skip the matcher entirely.
        if is_matched_native(native) && self.catalog.config().recode_native.recodes() {
            if let Some(tag) = self.catalog.tag(Fused::NewNative(native)) {
                self.memory.write_u8(at, tag)?;
                self.histogram[native as usize] -= 1;
                self.histogram[tag as usize] += 1;
                self.recodes[tag as usize] += 1;
            }
        }
        self.count(native_weight(native));
        self.exec_native(native)
    }

    fn match_pattern(&self, native: u8) -> Option<Fused> {
        match native {
            op::NOP => self.match_nop(),
            op::GET_PC => self.match_get_pc(),
            op::GET_SP => self.match_get_sp(),
            op::PUSH0 => self.match_push0(),
            op::PUSH1 => self.match_push1(),
            op::PUSH2 => self.match_push2(),
            op::PUSH4 => self.match_push4(),
            op::LT => self.match_lt(),
            op::XOR => self.match_xor(),
            _ => None,
        }
    }

    fn match_nop(&self) -> Option<Fused> {
        if !self.catalog.config().nopn.enabled() {
            return None;
        }
        if self.peek(0) == op::NOP && self.peek(1) == op::NOP && self.peek(2) == op::NOP {
            if (3..7).all(|i| self.peek(i) == op::NOP) {
                return Some(Fused::NopRun(8));
            }
            return Some(Fused::NopRun(4));
        }
        if self.peek(0) == op::NOP {
            return Some(Fused::NopRun(2));
        }
        None
    }

    fn match_get_pc(&self) -> Option<Fused> {
        use self::Width::*;
        let c = self.catalog.config();
        if c.getpc_push1_add.enabled() && self.peek(0) == op::PUSH1 && self.peek(2) == op::ADD {
            return Some(match self.peek(3) {
                op::NOP => Fused::PcNop,
                op::LOAD1 => Fused::LdPc(W1, W1),
                op::LOAD2 => Fused::LdPc(W2, W1),
                op::LOAD4 => Fused::LdPc(W4, W1),
                op::LOAD8 => Fused::LdPc(W8, W1),
                op::STORE1 => Fused::StPc(W1, W1),
                op::STORE2 => Fused::StPc(W2, W1),
                op::STORE4 => Fused::StPc(W4, W1),
                op::STORE8 => Fused::StPc(W8, W1),
                op::JUMP => Fused::PcJump(W1),
                _ => Fused::PcOffset,
            });
        }
        for &(push, imm, tail, toggle) in &[
            (op::PUSH2, W2, 3u64, c.getpc_push2_add),
            (op::PUSH4, W4, 5, c.getpc_push4_add),
            (op::PUSH8, W8, 9, c.getpc_push8_add),
        ] {
            if toggle.enabled() && self.peek(0) == push {
                if self.peek(tail) == op::ADD {
                    return Some(match self.peek(tail + 1) {
                        op::LOAD1 => Fused::LdPc(W1, imm),
                        op::LOAD2 => Fused::LdPc(W2, imm),
                        op::LOAD4 => Fused::LdPc(W4, imm),
                        op::LOAD8 => Fused::LdPc(W8, imm),
                        op::STORE1 => Fused::StPc(W1, imm),
                        op::STORE2 => Fused::StPc(W2, imm),
                        op::STORE4 => Fused::StPc(W4, imm),
                        op::STORE8 => Fused::StPc(W8, imm),
                        op::JUMP => Fused::PcJump(imm),
                        _ => Fused::PcPush(imm),
                    });
                }
                return Some(Fused::PcPush(imm));
            }
        }
        None
    }

    fn match_get_sp(&self) -> Option<Fused> {
        use self::Width::*;
        let c = self.catalog.config();
        if c.getsp_push1_add.enabled() && self.peek(0) == op::PUSH1 && self.peek(2) == op::ADD {
            return Some(match self.peek(3) {
                op::LOAD1 => Fused::LdSp(W1, W1),
                op::LOAD2 => Fused::LdSp(W2, W1),
                op::LOAD4 => Fused::LdSp(W4, W1),
                op::LOAD8 => Fused::LdSp(W8, W1),
                op::STORE1 => Fused::StSp(W1, W1),
                op::STORE2 => Fused::StSp(W2, W1),
                op::STORE4 => Fused::StSp(W4, W1),
                op::STORE8 => Fused::StSp(W8, W1),
                op::SET_SP => Fused::ChangeSp,
                _ => Fused::SpOffset,
            });
        }
        if c.getsp_push1.enabled() && self.peek(0) == op::PUSH1 {
            if self.peek(2) == op::NOT && self.peek(3) == op::ADD && self.peek(4) == op::SET_SP {
                return Some(Fused::DecSp1);
            }
            return Some(Fused::SpPush(W1));
        }
        if c.getsp_push2_add.enabled() && self.peek(0) == op::PUSH2 {
            if self.peek(3) == op::ADD {
                return Some(match self.peek(4) {
                    op::LOAD1 => Fused::LdSp(W1, W2),
                    op::LOAD2 => Fused::LdSp(W2, W2),
                    op::LOAD4 => Fused::LdSp(W4, W2),
                    op::LOAD8 => Fused::LdSp(W8, W2),
                    op::STORE1 => Fused::StSp(W1, W2),
                    op::STORE2 => Fused::StSp(W2, W2),
                    op::STORE4 => Fused::StSp(W4, W2),
                    op::STORE8 => Fused::StSp(W8, W2),
                    _ => Fused::SpPush(W2),
                });
            }
            return Some(Fused::SpPush(W2));
        }
        if c.getsp_store.enabled() && is_store(self.peek(0)) {
            if self.peek(1) == op::GET_SP && is_store(self.peek(2)) {
                return Some(Fused::FastPop2);
            }
            return Some(Fused::FastPop);
        }
        None
    }

    fn match_push0(&self) -> Option<Fused> {
        if !self.catalog.config().push0.enabled() {
            return None;
        }
        match self.peek(0) {
            op::JZ_FWD => Some(Fused::ShortJumpF),
            op::JZ_BACK => Some(Fused::ShortJumpB),
            op::XOR => Some(Fused::Xor0),
            op::NOT if self.peek(1) == op::MUL => Some(Fused::Not0Mul),
            op::PUSH0 => {
                if self.peek(1) == op::PUSH0 {
                    if self.peek(2) == op::PUSH0 {
                        return Some(Fused::Push0Run(4));
                    }
                    return Some(Fused::Push0Run(3));
                }
                Some(Fused::Push0Run(2))
            }
            _ => None,
        }
    }

    fn match_push1(&self) -> Option<Fused> {
        use self::Width::*;
        let c = self.catalog.config();
        if c.push1_pow2.enabled() && self.peek(1) == op::POW2 {
            return Some(match self.peek(2) {
                op::ADD => Fused::Pow21Add,
                op::DIV => Fused::Pow21Div,
                op::MUL => Fused::Pow21Mul,
                op::LT => Fused::Pow21Lt,
                _ => Fused::Pow21,
            });
        }
        if c.push1_alu.enabled() {
            if self.peek(1) == op::LT {
                match self.peek(2) {
                    op::JZ_FWD => return Some(Fused::Lt1Jzf),
                    op::JZ_BACK => return Some(Fused::Lt1Jzb),
                    op::NOT => {
                        return Some(match self.peek(3) {
                            op::JZ_FWD => Fused::Lt1Jnzf,
                            op::JZ_BACK => Fused::Lt1Jnzb,
                            _ => Fused::Lt1Not,
                        });
                    }
                    _ => {}
                }
            }
            if self.peek(1) == op::NOT && self.peek(2) == op::ADD {
                return Some(Fused::Not1Add);
            }
        }
        if c.push1n.enabled() && self.peek(1) == op::PUSH1 {
            if self.peek(3) == op::PUSH1 && self.peek(5) == op::PUSH1 {
                return Some(Fused::Push1x4);
            }
            return Some(Fused::Push1x2);
        }
        if c.push1_high4.enabled() {
            if self.peek(1) == op::GET_SP
                && self.peek(2) == op::PUSH1
                && self.peek(4) == op::ADD
                && is_store(self.peek(5))
            {
                return Some(Fused::C1ToStack(store_width(self.peek(5))));
            }
            if self.peek(1) == op::GET_PC && self.peek(2) == op::ADD && self.peek(3) == op::JUMP {
                return Some(Fused::JumpPc1);
            }
        }
        None
    }

    fn match_push2(&self) -> Option<Fused> {
        let c = self.catalog.config();
        if !c.push2.enabled() {
            return None;
        }
        if self.peek(2) == op::GET_PC && self.peek(3) == op::ADD && self.peek(4) == op::JUMP {
            return Some(Fused::JumpPc2);
        }
        if self.peek(2) == op::GET_SP
            && self.peek(3) == op::PUSH1
            && self.peek(5) == op::ADD
            && is_store(self.peek(6))
        {
            return Some(Fused::C2ToStack(store_width(self.peek(6))));
        }
        None
    }

    fn match_push4(&self) -> Option<Fused> {
        if !self.catalog.config().push4.enabled() {
            return None;
        }
        if self.peek(4) == op::GET_PC && self.peek(5) == op::ADD && self.peek(6) == op::JUMP {
            return Some(Fused::JumpPc4);
        }
        None
    }

    fn match_lt(&self) -> Option<Fused> {
        if !self.catalog.config().lt.enabled() {
            return None;
        }
        match self.peek(0) {
            op::JZ_FWD => Some(Fused::LtJzf),
            op::JZ_BACK => Some(Fused::LtJzb),
            op::NOT if self.peek(1) == op::JZ_FWD => Some(Fused::LtNotJzf),
            op::NOT if self.peek(1) == op::JZ_BACK => Some(Fused::LtNotJzb),
            _ => None,
        }
    }

    fn match_xor(&self) -> Option<Fused> {
        if !self.catalog.config().xor.enabled() {
            return None;
        }
        if self.peek(0) == op::PUSH1 && self.peek(2) == op::LT {
            return Some(Fused::Xor1Lt);
        }
        None
    }

    fn exec_native(&mut self, native: u8) -> Result<Flow, Fault> {
        match native {
            op::EXIT => return Ok(Flow::Halt),
            op::NOP => {}
            op::JUMP => {
                self.pc = self.pop()?;
            }
            op::JZ_FWD => {
                let k = self.memory.read_u8(self.pc)?;
                self.pc = self.pc.wrapping_add(1);
                if self.pop()? == 0 {
                    self.pc = self.pc.wrapping_add(u64::from(k));
                }
            }
            op::JZ_BACK => {
                let k = self.memory.read_u8(self.pc)?;
                self.pc = self.pc.wrapping_add(1);
                if self.pop()? == 0 {
                    self.pc = self.pc.wrapping_sub(u64::from(k) + 1);
                }
            }
            op::SET_SP => {
                self.sp = self.memory.read_u64(self.sp)?;
            }
            op::GET_PC => {
                let pc = self.pc;
                self.push(pc)?;
            }
            op::GET_SP => {
                let sp = self.sp;
                self.push(sp)?;
            }
            op::PUSH0 => self.push(0)?,
            op::PUSH1 => {
                let v = self.memory.read_u8(self.pc)?;
                self.pc = self.pc.wrapping_add(1);
                self.push(u64::from(v))?;
            }
            op::PUSH2 => {
                let v = self.memory.read_u16(self.pc)?;
                self.pc = self.pc.wrapping_add(2);
                self.push(u64::from(v))?;
            }
            op::PUSH4 => {
                let v = self.memory.read_u32(self.pc)?;
                self.pc = self.pc.wrapping_add(4);
                self.push(u64::from(v))?;
            }
            op::PUSH8 => {
                let v = self.memory.read_u64(self.pc)?;
                self.pc = self.pc.wrapping_add(8);
                self.push(v)?;
            }
            op::LOAD1 | op::LOAD2 | op::LOAD4 | op::LOAD8 => {
                let width = 1 << (native - op::LOAD1);
                let a = self.pop()?;
                let v = self.memory.read_uint(a, width)?;
                self.push(v)?;
            }
            op::STORE1 | op::STORE2 | op::STORE4 | op::STORE8 => {
                let width = 1 << (native - op::STORE1);
                let a = self.pop()?;
                let v = self.pop()?;
                self.memory.write_uint(a, width, v)?;
            }
            op::ADD => {
                let x = self.pop()?;
                let y = self.pop()?;
                self.push(x.wrapping_add(y))?;
            }
            op::MUL => {
                let x = self.pop()?;
                let y = self.pop()?;
                self.push(x.wrapping_mul(y))?;
            }
            op::DIV => {
                let u = self.pop()?;
                let v = self.pop()?;
                let q = self.divide(v, u)?;
                self.push(q)?;
            }
            op::REM => {
                let u = self.pop()?;
                let v = self.pop()?;
                let r = self.remainder(v, u)?;
                self.push(r)?;
            }
            op::LT => {
                let u = self.pop()?;
                let v = self.pop()?;
                self.push(if v < u { !0 } else { 0 })?;
            }
            op::AND => {
                let u = self.pop()?;
                let v = self.pop()?;
                self.push(u & v)?;
            }
            op::OR => {
                let u = self.pop()?;
                let v = self.pop()?;
                self.push(u | v)?;
            }
            op::NOT => {
                let u = self.pop()?;
                self.push(!u)?;
            }
            op::XOR => {
                let u = self.pop()?;
                let v = self.pop()?;
                self.push(u ^ v)?;
            }
            op::POW2 => {
                let u = self.pop()?;
                self.push(pow2(u))?;
            }
            op::CHECK => {
                let x = self.pop()? as i64;
                if x > BINARY_VERSION {
                    return Err(Fault::WrongBinaryVersion(x));
                }
            }
            op::BREAK => {}
            op::TRACE => {
                let n = self.memory.read_u8(self.pc)?;
                self.pc = self.pc.wrapping_add(1);
                self.trace = n;
            }
            op::PROBE => {
                let n = self.memory.read_u8(self.pc)?;
                self.pc = self.pc.wrapping_add(1);
                self.probe = n;
            }
            op::PROBE_READ => {
                let index = self.pop()? as u8;
                let dest = self.pop()?;
                let value = self.samples[index as usize];
                self.memory.write_u64(dest, value)?;
            }
            op::READ_CHAR => {
                let c = self.io.read_char().map_err(io_fault)?;
                self.push(u64::from(c))?;
            }
            op::PUT_BYTE => {
                let u = self.pop()?;
                self.io.put_byte(u as u8).map_err(io_fault)?;
            }
            op::PUT_CHAR => {
                let u = self.pop()?;
                self.io.put_char(u as u32).map_err(io_fault)?;
            }
            op::ADD_SAMPLE => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.io
                    .add_sample(left as u16, right as u16)
                    .map_err(io_fault)?;
            }
            op::SET_PIXEL => {
                let b = self.pop()?;
                let g = self.pop()?;
                let r = self.pop()?;
                let y = self.pop()?;
                let x = self.pop()?;
                self.io
                    .set_pixel(x as u16, y as u16, r as u8, g as u8, b as u8)
                    .map_err(io_fault)?;
            }
            op::NEW_FRAME => {
                let rate = self.pop()?;
                let height = self.pop()?;
                let width = self.pop()?;
                self.io
                    .new_frame(width as u16, height as u16, rate as u32)
                    .map_err(io_fault)?;
            }
            op::READ_PIXEL => {
                let y = self.pop()?;
                let x = self.pop()?;
                let v = self.io.read_pixel(x as u16, y as u16).map_err(io_fault)?;
                self.push(u64::from(v))?;
            }
            op::READ_FRAME => {
                let i = self.pop()?;
                let (width, height) = self.io.read_frame(i).map_err(io_fault)?;
                self.push(width)?;
                self.push(height)?;
            }
            _ => return Err(Fault::UnknownOpcode(native)),
        }
        Ok(Flow::Continue)
    }

    fn exec_fused(&mut self, fused: Fused) -> Result<Flow, Fault> {
        use self::Fused::*;
        let pc0 = self.pc;
        match fused {
            NewNative(native) => return self.exec_native(native),
            NopRun(n) => {
                self.pc = pc0.wrapping_add(u64::from(n) - 1);
            }
            LdPc(w, imm) => {
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                let v = self.memory.read_uint(pc0.wrapping_add(k), w.bytes())?;
                self.push(v)?;
                self.pc = pc0.wrapping_add(3 + u64::from(imm.bytes()));
            }
            StPc(w, imm) => {
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                let v = self.pop()?;
                self.memory.write_uint(pc0.wrapping_add(k), w.bytes(), v)?;
                self.pc = pc0.wrapping_add(3 + u64::from(imm.bytes()));
            }
            PcJump(imm) => {
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                self.pc = pc0.wrapping_add(k);
            }
            PcPush(imm) => {
                self.push(pc0)?;
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                self.push(k)?;
                self.pc = pc0.wrapping_add(1 + u64::from(imm.bytes()));
            }
            PcNop => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                self.push(pc0.wrapping_add(k))?;
                self.pc = pc0.wrapping_add(4);
            }
            PcOffset => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                self.push(pc0.wrapping_add(k))?;
                self.pc = pc0.wrapping_add(3);
            }
            LdSp(w, imm) => {
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                let v = self.memory.read_uint(self.sp.wrapping_add(k), w.bytes())?;
                self.push(v)?;
                self.pc = pc0.wrapping_add(3 + u64::from(imm.bytes()));
            }
            StSp(w, imm) => {
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                // The address is relative to SP before the value pops.
                let addr = self.sp.wrapping_add(k);
                let v = self.pop()?;
                self.memory.write_uint(addr, w.bytes(), v)?;
                self.pc = pc0.wrapping_add(3 + u64::from(imm.bytes()));
            }
            ChangeSp => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                self.sp = self.sp.wrapping_add(k);
                self.pc = pc0.wrapping_add(4);
            }
            SpOffset => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                let v = self.sp.wrapping_add(k);
                self.push(v)?;
                self.pc = pc0.wrapping_add(3);
            }
            SpPush(imm) => {
                let sp = self.sp;
                self.push(sp)?;
                let k = self.imm(pc0.wrapping_add(1), imm)?;
                self.push(k)?;
                self.pc = pc0.wrapping_add(1 + u64::from(imm.bytes()));
            }
            DecSp1 => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                self.sp = self.sp.wrapping_add(!k);
                self.pc = pc0.wrapping_add(5);
            }
            FastPop => {
                self.sp = self.sp.wrapping_add(BYTES_PER_WORD);
                self.pc = pc0.wrapping_add(1);
            }
            FastPop2 => {
                self.sp = self.sp.wrapping_add(2 * BYTES_PER_WORD);
                self.pc = pc0.wrapping_add(3);
            }
            ShortJumpF => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                self.pc = pc0.wrapping_add(k + 2);
            }
            ShortJumpB => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                self.pc = pc0.wrapping_add(1).wrapping_sub(k);
            }
            Xor0 => {
                self.pc = pc0.wrapping_add(1);
            }
            Not0Mul => {
                let u = self.pop()?;
                self.push(u.wrapping_neg())?;
                self.pc = pc0.wrapping_add(2);
            }
            Push0Run(n) => {
                for _ in 0..n {
                    self.push(0)?;
                }
                self.pc = pc0.wrapping_add(u64::from(n) - 1);
            }
            Lt1Jzf => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                let v = self.pop()?;
                if v < k {
                    self.pc = pc0.wrapping_add(4);
                } else {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(3))?);
                    self.pc = pc0.wrapping_add(off + 4);
                }
            }
            Lt1Jzb => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                let v = self.pop()?;
                if v < k {
                    self.pc = pc0.wrapping_add(4);
                } else {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(3))?);
                    self.pc = pc0.wrapping_add(3).wrapping_sub(off);
                }
            }
            Not1Add => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                let v = self.pop()?;
                self.push(v.wrapping_add(!k))?;
                self.pc = pc0.wrapping_add(3);
            }
            Lt1Not => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                let v = self.pop()?;
                self.push(if v < k { 0 } else { !0 })?;
                self.pc = pc0.wrapping_add(3);
            }
            Lt1Jnzf => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                let v = self.pop()?;
                if v >= k {
                    self.pc = pc0.wrapping_add(5);
                } else {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(4))?);
                    self.pc = pc0.wrapping_add(off + 5);
                }
            }
            Lt1Jnzb => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                let v = self.pop()?;
                if v >= k {
                    self.pc = pc0.wrapping_add(5);
                } else {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(4))?);
                    self.pc = pc0.wrapping_add(4).wrapping_sub(off);
                }
            }
            Pow21Add => {
                let k = self.memory.read_u8(pc0)?;
                let y = self.pop()?;
                self.push(pow2(u64::from(k)).wrapping_add(y))?;
                self.pc = pc0.wrapping_add(3);
            }
            Pow21Mul => {
                let k = self.memory.read_u8(pc0)?;
                let y = self.pop()?;
                self.push(pow2(u64::from(k)).wrapping_mul(y))?;
                self.pc = pc0.wrapping_add(3);
            }
            Pow21Lt => {
                let k = self.memory.read_u8(pc0)?;
                let u = pow2(u64::from(k));
                let v = self.pop()?;
                self.push(if v < u { !0 } else { 0 })?;
                self.pc = pc0.wrapping_add(3);
            }
            Pow21Div => {
                let k = self.memory.read_u8(pc0)?;
                let u = pow2(u64::from(k));
                let v = self.pop()?;
                let q = self.divide(v, u)?;
                self.push(q)?;
                self.pc = pc0.wrapping_add(3);
            }
            Pow21 => {
                let k = self.memory.read_u8(pc0)?;
                self.push(pow2(u64::from(k)))?;
                self.pc = pc0.wrapping_add(2);
            }
            Push1x2 => {
                let a = u64::from(self.memory.read_u8(pc0)?);
                let b = u64::from(self.memory.read_u8(pc0.wrapping_add(2))?);
                self.push(a)?;
                self.push(b)?;
                self.pc = pc0.wrapping_add(3);
            }
            Push1x4 => {
                for i in &[0u64, 2, 4, 6] {
                    let v = u64::from(self.memory.read_u8(pc0.wrapping_add(*i))?);
                    self.push(v)?;
                }
                self.pc = pc0.wrapping_add(7);
                // Keep consuming immediate pairs while the run goes on.
                while self.memory.peek(self.pc) == op::PUSH1
                    && self.memory.peek(self.pc.wrapping_add(2)) == op::PUSH1
                {
                    let a = u64::from(self.memory.read_u8(self.pc.wrapping_add(1))?);
                    let b = u64::from(self.memory.read_u8(self.pc.wrapping_add(3))?);
                    self.push(a)?;
                    self.push(b)?;
                    self.count(2);
                    self.pc = self.pc.wrapping_add(4);
                }
            }
            C1ToStack(w) => {
                let v = u64::from(self.memory.read_u8(pc0)?);
                let a = u64::from(self.memory.read_u8(pc0.wrapping_add(3))?);
                let addr = self.sp.wrapping_add(a).wrapping_sub(BYTES_PER_WORD);
                self.memory.write_uint(addr, w.bytes(), v)?;
                self.pc = pc0.wrapping_add(6);
            }
            JumpPc1 => {
                let k = u64::from(self.memory.read_u8(pc0)?);
                self.pc = pc0.wrapping_add(k + 2);
            }
            JumpPc2 => {
                let k = u64::from(self.memory.read_u16(pc0)?);
                self.pc = pc0.wrapping_add(k + 3);
            }
            C2ToStack(w) => {
                let v = u64::from(self.memory.read_u16(pc0)?);
                let a = u64::from(self.memory.read_u8(pc0.wrapping_add(4))?);
                let addr = self.sp.wrapping_add(a).wrapping_sub(BYTES_PER_WORD);
                self.memory.write_uint(addr, w.bytes(), v)?;
                self.pc = pc0.wrapping_add(7);
            }
            JumpPc4 => {
                let k = u64::from(self.memory.read_u32(pc0)?);
                self.pc = pc0.wrapping_add(k + 5);
            }
            LtJzf => {
                let u = self.pop()?;
                let v = self.pop()?;
                if v < u {
                    self.pc = pc0.wrapping_add(2);
                } else {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                    self.pc = pc0.wrapping_add(off + 2);
                }
            }
            LtNotJzf => {
                let u = self.pop()?;
                let v = self.pop()?;
                if v < u {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(2))?);
                    self.pc = pc0.wrapping_add(off + 3);
                } else {
                    self.pc = pc0.wrapping_add(3);
                }
            }
            LtJzb => {
                let u = self.pop()?;
                let v = self.pop()?;
                if v < u {
                    self.pc = pc0.wrapping_add(2);
                } else {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                    self.pc = pc0.wrapping_add(1).wrapping_sub(off);
                }
            }
            LtNotJzb => {
                let u = self.pop()?;
                let v = self.pop()?;
                if v < u {
                    let off = u64::from(self.memory.read_u8(pc0.wrapping_add(2))?);
                    self.pc = pc0.wrapping_add(2).wrapping_sub(off);
                } else {
                    self.pc = pc0.wrapping_add(3);
                }
            }
            Xor1Lt => {
                let k = u64::from(self.memory.read_u8(pc0.wrapping_add(1))?);
                let u = self.pop()?;
                let v = self.pop()?;
                self.push(if (u ^ v) < k { !0 } else { 0 })?;
                self.pc = pc0.wrapping_add(3);
            }
        }
        Ok(Flow::Continue)
    }
}

fn native_weight(native: u8) -> u64 {
    match native {
        op::BREAK | op::TRACE | op::PROBE | op::PROBE_READ => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::super::catalog::PatternConfig;
    use super::*;

    const MEM: u64 = 64 * 1024;

    fn machine(program: &[u8], config: PatternConfig) -> Cpu {
        let mut cpu = Cpu::headless(MemoryImage::new(MEM), OpcodeCatalog::new(config));
        cpu.load_bytecode(program, 0).unwrap();
        cpu
    }

    fn run(program: &[u8], config: PatternConfig) -> Cpu {
        let mut cpu = machine(program, config);
        let reason = cpu.run();
        assert_eq!(reason, HaltReason::Exit, "program faulted: {:?}", reason);
        cpu
    }

    fn tos(cpu: &Cpu) -> u64 {
        cpu.top_of_stack().unwrap()
    }

    #[test]
    fn test_pure_arithmetic() {
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(
                &[op::PUSH1, 0x03, op::PUSH1, 0x04, op::ADD, op::EXIT],
                config.clone(),
            );
            assert_eq!(tos(&cpu), 7);
            assert_eq!(cpu.sp() % 8, 0);
        }
    }

    #[test]
    fn test_nop8_fusion_counts() {
        let mut program = vec![op::NOP; 8];
        program.extend_from_slice(&[op::PUSH1, 0x2a, op::EXIT]);
        let cpu = run(&program, PatternConfig::full());
        assert_eq!(tos(&cpu), 0x2a);
        assert_eq!(cpu.instruction_count(), 10);
        assert_eq!(cpu.fetch_count(), 3);
        // The first pattern byte was rewritten; the rest are untouched.
        let tag = cpu.catalog().tag(Fused::NopRun(8)).unwrap();
        assert_eq!(cpu.memory.read_u8(0).unwrap(), tag);
        for i in 1..8 {
            assert_eq!(cpu.memory.read_u8(i).unwrap(), op::NOP);
        }
    }

    #[test]
    fn test_pc_relative_load() {
        // GET_PC at 0 pushes 1; the immediate lands on the data word.
        let mut program = vec![op::GET_PC, op::PUSH1, 15, op::ADD, op::LOAD4, op::EXIT];
        program.resize(16, 0);
        program.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(tos(&cpu), 0xdead_beef);
        }
    }

    #[test]
    fn test_division_by_zero_absorbing() {
        // The divisor is popped first, so it is pushed last.
        let program = [op::PUSH1, 0x05, op::PUSH1, 0, op::DIV, op::EXIT];
        let cpu = run(&program, PatternConfig::full());
        assert_eq!(tos(&cpu), 0);
        let cpu = run(
            &[op::PUSH1, 0x05, op::PUSH1, 0, op::REM, op::EXIT],
            PatternConfig::full(),
        );
        assert_eq!(tos(&cpu), 0);
    }

    #[test]
    fn test_division() {
        let program = [op::PUSH1, 42, op::PUSH1, 5, op::DIV, op::EXIT];
        let cpu = run(&program, PatternConfig::none());
        assert_eq!(tos(&cpu), 8);
        let program = [op::PUSH1, 42, op::PUSH1, 5, op::REM, op::EXIT];
        let cpu = run(&program, PatternConfig::none());
        assert_eq!(tos(&cpu), 2);
    }

    #[test]
    fn test_division_by_zero_raising() {
        let mut config = PatternConfig::full();
        config.fault_on_div_zero = true;
        let mut cpu = machine(&[op::PUSH1, 0x05, op::PUSH1, 0, op::DIV, op::EXIT], config);
        assert_eq!(cpu.run(), HaltReason::Fault(Fault::DivisionByZero));
        assert_eq!(cpu.state(), State::Halted);
    }

    #[test]
    fn test_recoding_is_semantics_preserving() {
        // A loop that executes the same GET_PC/PUSH1/ADD/LOAD8 bytes
        // twice: the first pass recodes them, the second dispatches the
        // synthesized tag directly.
        let mut program = vec![0u8; 32];
        program[0] = op::GET_PC;
        program[1] = op::PUSH1;
        program[2] = 23; // 1 + 23 = 24, the data word
        program[3] = op::ADD;
        program[4] = op::LOAD8;
        program[5] = op::GET_SP; // discard the loaded word
        program[6] = op::STORE8;
        program[7] = op::PUSH1;
        program[8] = 20; // flag byte
        program[9] = op::LOAD1;
        program[10] = op::JZ_FWD;
        program[11] = 7; // second pass: jump to EXIT at 19
        program[12] = op::PUSH0; // value 0
        program[13] = op::PUSH1;
        program[14] = 20; // address of the flag
        program[15] = op::STORE1; // clear the flag
        program[16] = op::PUSH0;
        program[17] = op::JZ_BACK;
        program[18] = 18; // back to 0
        program[19] = op::EXIT;
        program[20] = 1; // flag, set on the first pass
        program[24..32].copy_from_slice(&0x0123_4567_89ab_cdefu64.to_le_bytes());

        let recoded = run(&program, PatternConfig::full());
        let plain = run(&program, PatternConfig::none());

        assert_eq!(recoded.sp(), plain.sp());
        assert_eq!(tos(&recoded), tos(&plain));
        assert_eq!(recoded.instruction_count(), plain.instruction_count());
        assert!(recoded.fetch_count() < plain.fetch_count());

        // The fused tag sits on the first pattern byte, operands intact.
        let tag = recoded
            .catalog()
            .tag(Fused::LdPc(Width::W8, Width::W1))
            .unwrap();
        assert_eq!(recoded.memory.read_u8(0).unwrap(), tag);
        assert_eq!(recoded.memory.read_u8(1).unwrap(), op::PUSH1);
        assert_eq!(recoded.memory.read_u8(2).unwrap(), 23);
        assert_eq!(recoded.memory.read_u8(3).unwrap(), op::ADD);
        assert_eq!(recoded.memory.read_u8(4).unwrap(), op::LOAD8);
    }

    #[test]
    fn test_use_mode_never_rewrites() {
        let mut program = vec![op::NOP; 8];
        program.extend_from_slice(&[op::EXIT]);
        let cpu = run(&program, PatternConfig::use_only());
        // Fused dispatch happened (one fetch for the run) without recoding.
        assert_eq!(cpu.memory.read_u8(0).unwrap(), op::NOP);
        assert_eq!(cpu.fetch_count(), 2);
        assert_eq!(cpu.instruction_count(), 9);
    }

    #[test]
    fn test_seen_native_twin() {
        // GET_PC followed by EXIT matches nothing; the byte is rewritten
        // to the twin tag and the next execution dispatches directly.
        let program = [op::GET_PC, op::EXIT];
        let cpu = run(&program, PatternConfig::full());
        let tag = cpu.catalog().tag(Fused::NewNative(op::GET_PC)).unwrap();
        assert_eq!(cpu.memory.read_u8(0).unwrap(), tag);
        assert_eq!(tos(&cpu), 1);
    }

    #[test]
    fn test_jumps() {
        let program = [
            op::PUSH1,
            6,
            op::JUMP,
            op::PUSH1,
            99,
            op::EXIT,
            op::PUSH1,
            7,
            op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(tos(&cpu), 7);
        }
    }

    #[test]
    fn test_jz_forward_and_back() {
        // JZ_FWD taken over one PUSH1, then JZ_BACK not taken.
        let program = [
            op::PUSH0,
            op::PUSH2,
            0,
            0, // dodge the PUSH0 pattern matcher: value 0 via PUSH2
            op::JZ_FWD,
            2,
            op::PUSH1,
            9,
            op::PUSH1,
            5,
            op::JZ_BACK,
            4,
            op::EXIT,
        ];
        let cpu = run(&program, PatternConfig::none());
        assert_eq!(tos(&cpu), 0);
        assert_eq!(cpu.sp(), MEM - 16);
    }

    #[test]
    fn test_store_load_widths() {
        for &(store, load, value, expect) in &[
            (op::STORE1, op::LOAD1, 0x1122u64, 0x22u64),
            (op::STORE2, op::LOAD2, 0x1122_3344, 0x3344),
            (op::STORE4, op::LOAD4, 0x1_2222_3333, 0x2222_3333),
            (op::STORE8, op::LOAD8, 0xfedc_ba98_7654_3210, 0xfedc_ba98_7654_3210),
        ] {
            let mut program = vec![op::PUSH8];
            program.extend_from_slice(&value.to_le_bytes());
            program.extend_from_slice(&[
                op::PUSH1,
                0x80, // scratch address
                store,
                op::PUSH1,
                0x80,
                load,
                op::EXIT,
            ]);
            for config in &[PatternConfig::full(), PatternConfig::none()] {
                let cpu = run(&program, config.clone());
                assert_eq!(tos(&cpu), expect);
            }
        }
    }

    #[test]
    fn test_bitwise_and_pow2() {
        let cpu = run(
            &[op::PUSH1, 6, op::POW2, op::EXIT],
            PatternConfig::none(),
        );
        assert_eq!(tos(&cpu), 64);
        // Shift amounts above 63 collapse to zero, fused or not.
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&[op::PUSH1, 70, op::POW2, op::EXIT], config.clone());
            assert_eq!(tos(&cpu), 0);
        }
        let cpu = run(
            &[op::PUSH1, 0x0f, op::NOT, op::EXIT],
            PatternConfig::none(),
        );
        assert_eq!(tos(&cpu), !0x0fu64);
    }

    #[test]
    fn test_lt_is_unsigned() {
        // -1 (all ones) is not less than 1.
        let mut program = vec![op::PUSH8];
        program.extend_from_slice(&(!0u64).to_le_bytes());
        program.extend_from_slice(&[op::PUSH1, 1, op::LT, op::EXIT]);
        let cpu = run(&program, PatternConfig::none());
        assert_eq!(tos(&cpu), 0);
    }

    #[test]
    fn test_check_version() {
        let cpu = run(&[op::PUSH1, 2, op::CHECK, op::EXIT], PatternConfig::full());
        assert_eq!(cpu.sp(), MEM - 8);
        let mut cpu = machine(&[op::PUSH1, 3, op::CHECK, op::EXIT], PatternConfig::full());
        assert_eq!(
            cpu.run(),
            HaltReason::Fault(Fault::WrongBinaryVersion(3))
        );
    }

    #[test]
    fn test_unknown_opcode_faults() {
        let mut cpu = machine(&[0x31, op::EXIT], PatternConfig::full());
        assert_eq!(cpu.run(), HaltReason::Fault(Fault::UnknownOpcode(0x31)));
    }

    #[test]
    fn test_guest_segfault() {
        let mut program = vec![op::PUSH8];
        program.extend_from_slice(&(MEM + 8).to_le_bytes());
        program.extend_from_slice(&[op::LOAD1, op::EXIT]);
        let mut cpu = machine(&program, PatternConfig::full());
        assert_eq!(
            cpu.run(),
            HaltReason::Fault(Fault::SegmentationFault(MEM + 8))
        );
    }

    #[test]
    fn test_interrupt_halts_loop() {
        // An infinite loop, fused to SHORT_JUMPB on the first pass.
        let program = [op::PUSH0, op::JZ_BACK, 2];
        let mut cpu = machine(&program, PatternConfig::full());
        cpu.interrupt_flag().store(true, Ordering::Relaxed);
        assert_eq!(cpu.run(), HaltReason::Fault(Fault::Interrupted));
    }

    #[test]
    fn test_short_jump_forward() {
        let program = [op::PUSH0, op::JZ_FWD, 2, op::PUSH1, 9, op::EXIT];
        let cpu = run(&program, PatternConfig::full());
        assert_eq!(cpu.sp(), MEM - 8);
        let tag = cpu.catalog().tag(Fused::ShortJumpF).unwrap();
        assert_eq!(cpu.memory.read_u8(0).unwrap(), tag);
    }

    #[test]
    fn test_push0_negate() {
        let program = [op::PUSH1, 5, op::PUSH0, op::NOT, op::MUL, op::EXIT];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(tos(&cpu), 5u64.wrapping_neg());
        }
    }

    #[test]
    fn test_push0_run() {
        let program = [op::PUSH0, op::PUSH0, op::PUSH0, op::EXIT];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(cpu.sp(), MEM - 8 - 24);
            assert_eq!(tos(&cpu), 0);
        }
    }

    #[test]
    fn test_lt1_branch_fusion() {
        // v >= k takes the forward branch over the PUSH1.
        let taken = [
            op::PUSH2, 10, 0, op::PUSH1, 3, op::LT, op::JZ_FWD, 2, op::PUSH1, 1, op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&taken, config.clone());
            assert_eq!(cpu.sp(), MEM - 8);
        }
        let not_taken = [
            op::PUSH2, 1, 0, op::PUSH1, 3, op::LT, op::JZ_FWD, 2, op::PUSH1, 1, op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&not_taken, config.clone());
            assert_eq!(tos(&cpu), 1);
        }
    }

    #[test]
    fn test_sp_decrement_fusion() {
        let program = [
            op::GET_SP,
            op::PUSH1,
            7,
            op::NOT,
            op::ADD,
            op::SET_SP,
            op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(cpu.sp(), MEM - 8 - 8);
        }
        let cpu = run(&program, PatternConfig::full());
        let tag = cpu.catalog().tag(Fused::DecSp1).unwrap();
        assert_eq!(cpu.memory.read_u8(0).unwrap(), tag);
    }

    #[test]
    fn test_fast_pop() {
        let program = [op::PUSH1, 5, op::GET_SP, op::STORE8, op::EXIT];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(cpu.sp(), MEM - 8);
        }
    }

    #[test]
    fn test_constant_to_stack_slot() {
        let program = [
            op::PUSH2,
            0,
            0,
            op::PUSH1,
            0xab,
            op::GET_SP,
            op::PUSH1,
            8,
            op::ADD,
            op::STORE8,
            op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(tos(&cpu), 0xab);
            assert_eq!(cpu.sp(), MEM - 16);
        }
        let cpu = run(&program, PatternConfig::full());
        let tag = cpu
            .catalog()
            .tag(Fused::C1ToStack(Width::W8))
            .unwrap();
        assert_eq!(cpu.memory.read_u8(3).unwrap(), tag);
    }

    #[test]
    fn test_pc_relative_jump_fusion() {
        let program = [
            op::PUSH1,
            4,
            op::GET_PC,
            op::ADD,
            op::JUMP,
            op::PUSH1,
            9,
            op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            // Lands on EXIT at 7, skipping the push.
            assert_eq!(cpu.sp(), MEM - 8);
        }
        let cpu = run(&program, PatternConfig::full());
        let tag = cpu.catalog().tag(Fused::JumpPc1).unwrap();
        assert_eq!(cpu.memory.read_u8(0).unwrap(), tag);
    }

    #[test]
    fn test_xor_lt_fusion() {
        let program = [
            op::PUSH2,
            5,
            0,
            op::PUSH2,
            6,
            0,
            op::XOR,
            op::PUSH1,
            4,
            op::LT,
            op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(tos(&cpu), !0u64); // 5 ^ 6 == 3 < 4
        }
    }

    #[test]
    fn test_push1_run_extension() {
        // Six PUSH1s: the X4 handler consumes the trailing pair too.
        let program = [
            op::PUSH1, 1, op::PUSH1, 2, op::PUSH1, 3, op::PUSH1, 4, op::PUSH1, 5, op::PUSH1, 6,
            op::EXIT,
        ];
        for config in &[PatternConfig::full(), PatternConfig::none()] {
            let cpu = run(&program, config.clone());
            assert_eq!(tos(&cpu), 6);
            assert_eq!(cpu.sp(), MEM - 8 - 48);
            assert_eq!(cpu.instruction_count(), 7);
        }
        let cpu = run(&program, PatternConfig::full());
        assert_eq!(cpu.fetch_count(), 2);
    }

    #[test]
    fn test_probe_counters() {
        let program = [
            op::PROBE,
            2,
            op::PUSH1,
            0x80,
            op::PUSH1,
            2,
            op::PROBE_READ,
            op::PUSH1,
            0x80,
            op::LOAD8,
            op::EXIT,
        ];
        let cpu = run(&program, PatternConfig::full());
        // The two PUSH1s before PROBE_READ landed in bucket 2; the debug
        // opcodes themselves are not counted.
        assert_eq!(tos(&cpu), 2);
    }

    #[test]
    fn test_histogram_reattributes_fetches() {
        let mut program = vec![op::NOP; 8];
        program.extend_from_slice(&[op::PUSH1, 0x2a, op::EXIT]);
        let cpu = run(&program, PatternConfig::full());
        let nop8 = cpu.catalog().tag(Fused::NopRun(8)).unwrap() as usize;
        let new_push1 = cpu.catalog().tag(Fused::NewNative(op::PUSH1)).unwrap() as usize;

        // One fetch each for the fused run, the push and the exit; the
        // native buckets ended up empty.
        assert_eq!(cpu.histogram()[nop8], 1);
        assert_eq!(cpu.histogram()[new_push1], 1);
        assert_eq!(cpu.histogram()[op::NOP as usize], 0);
        assert_eq!(cpu.histogram()[op::PUSH1 as usize], 0);
        assert_eq!(cpu.histogram()[op::EXIT as usize], 1);
        assert_eq!(cpu.histogram().iter().sum::<u64>(), cpu.fetch_count());

        // Each byte was rewritten exactly once.
        assert_eq!(cpu.recode_counts()[nop8], 1);
        assert_eq!(cpu.recode_counts()[new_push1], 1);

        // The plain build attributes everything to the natives.
        let cpu = run(&program, PatternConfig::none());
        assert_eq!(cpu.histogram()[op::NOP as usize], 8);
        assert_eq!(cpu.histogram()[op::PUSH1 as usize], 1);
        assert_eq!(cpu.recode_counts().iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_state_machine() {
        let mut cpu = machine(&[op::EXIT], PatternConfig::full());
        assert_eq!(cpu.state(), State::Loaded);
        cpu.run();
        assert_eq!(cpu.state(), State::Halted);
        assert_eq!(cpu.halt_reason(), Some(&HaltReason::Exit));
    }
}
