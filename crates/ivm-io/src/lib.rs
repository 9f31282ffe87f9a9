//! ivm emulator I/O.
//!
//! Frame assembly and fan-out: the buffers the guest fills through the
//! I/O opcodes, the serial and parallel writers that turn finished
//! frames into `.text`/`.bytes`/`.wav`/`.png` files, the PNG input
//! gallery, and the raw-terminal console reader.

#[macro_use]
extern crate log;

pub mod console;
pub mod driver;
pub mod frame;
pub mod gallery;
pub mod output;
pub mod pipeline;

pub use crate::driver::EmulatorIo;
