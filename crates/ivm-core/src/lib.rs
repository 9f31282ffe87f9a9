//! ivm emulator core.
//!
//! The machine itself: flat byte-addressed memory image, the opcode
//! catalog with its synthesized super-instructions, and the dispatch
//! loop with in-place bytecode recoding. Frame output and PNG input
//! live behind the [`drivers::IoInterface`] seam.

#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod core;
pub mod drivers;
pub mod errors;
pub mod symbols;

pub use crate::core::cpu::{Cpu, HaltReason};
pub use crate::errors::{CResult, Fault};
