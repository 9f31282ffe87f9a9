//! Core types.

/// Machine word. The stack unit, 64-bit two's-complement.
pub type Word = u64;

/// Guest address: a byte index into the memory image.
pub type Addr = u64;

/// Bytes per machine word.
pub const BYTES_PER_WORD: u64 = 8;

/// Binary version accepted by the `CHECK` opcode.
pub const BINARY_VERSION: i64 = 2;
