//! Error module.

use std::error::Error;
use std::fmt;

/// Common result.
pub type CResult<T = ()> = Result<T, Box<dyn Error>>;

/// A fault raised by the guest program while the dispatch loop runs.
///
/// Every variant aborts the current instruction and unwinds to the halt
/// path, where the frontend flushes outputs and dumps the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// `DIV` or `REM` with a zero divisor, raising variant only.
    DivisionByZero,
    /// Guest access outside the memory image.
    SegmentationFault(u64),
    /// The user pressed ^C.
    Interrupted,
    /// `CHECK` saw a version newer than this emulator supports.
    WrongBinaryVersion(i64),
    /// An opcode byte with no dispatch entry.
    UnknownOpcode(u8),
    /// An I/O opcode could not complete its write or read.
    Io(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::DivisionByZero => write!(f, "division by zero"),
            Fault::SegmentationFault(addr) => {
                write!(f, "segmentation fault at {:#x}", addr)
            }
            Fault::Interrupted => write!(f, "terminated by user request ^C"),
            Fault::WrongBinaryVersion(v) => {
                write!(f, "incompatible binary version: {}", v)
            }
            Fault::UnknownOpcode(op) => write!(f, "undefined opcode {:#04x}", op),
            Fault::Io(msg) => write!(f, "i/o failure: {}", msg),
        }
    }
}

impl Error for Fault {}

/// Setup failure before the dispatch loop starts (unreadable files,
/// images that do not fit in memory, missing directories).
#[derive(Debug)]
pub struct SetupError(pub String);

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SetupError {}
