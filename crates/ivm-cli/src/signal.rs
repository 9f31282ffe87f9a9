//! Signal handling.
//!
//! ^C must not kill the process outright: the dispatch loop owns
//! buffers that still have to be flushed and a terminal that may be in
//! raw mode. The handler only flips an atomic flag; the loop polls it
//! once per iteration and unwinds through the regular halt path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

static INTERRUPT: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

extern "C" fn handle_interrupt(_signal: libc::c_int) {
    INTERRUPT.store(true, Ordering::Relaxed);
}

/// Install the SIGINT handler and return the flag it sets.
pub fn install() -> Arc<AtomicBool> {
    let flag = Arc::clone(&INTERRUPT);
    unsafe {
        libc::signal(libc::SIGINT, handle_interrupt as libc::sighandler_t);
    }
    flag
}
