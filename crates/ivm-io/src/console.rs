//! Console input.
//!
//! `READ_CHAR` wants a single keypress, not a buffered line, so the
//! terminal goes raw for the duration of one read and is restored
//! right after. The halt path calls [`restore`] unconditionally so a
//! fault never leaves the user's terminal in raw mode.

use std::io::{self, Read};

use crossterm::terminal;

/// End-of-input character (^D) pushed when stdin is exhausted.
pub const EOF_CHAR: u32 = 4;

fn read_byte(stdin: &mut impl Read) -> Option<u8> {
    let mut byte = [0u8; 1];
    match stdin.read(&mut byte) {
        Ok(1) => Some(byte[0]),
        _ => None,
    }
}

/// Decode one UTF-32 character from a UTF-8 byte source. Actual EOF is
/// converted into the EOF character.
pub fn read_char_from(stdin: &mut impl Read) -> u32 {
    let c0 = match read_byte(stdin) {
        Some(b) => b,
        None => return EOF_CHAR,
    };
    let mut u = u32::from(c0);
    if c0 < 0x80 {
        return u;
    }
    u &= 0x1f;
    let c1 = match read_byte(stdin) {
        Some(b) => u32::from(b & 0x3f),
        None => return EOF_CHAR,
    };
    if c0 < 0xe0 {
        return (u << 6) + c1;
    }
    u &= 0x0f;
    let c2 = match read_byte(stdin) {
        Some(b) => u32::from(b & 0x3f),
        None => return EOF_CHAR,
    };
    if c0 < 0xf0 {
        return (u << 12) + (c1 << 6) + c2;
    }
    u &= 0x07;
    let c3 = match read_byte(stdin) {
        Some(b) => u32::from(b & 0x3f),
        None => return EOF_CHAR,
    };
    (u << 18) + (c1 << 12) + (c2 << 6) + c3
}

/// Read one character from the real console, raw mode on for the
/// duration of the read.
pub fn read_char() -> io::Result<u32> {
    let raw = terminal::enable_raw_mode().is_ok();
    let mut stdin = io::stdin();
    let c = read_char_from(&mut stdin);
    if raw {
        let _ = terminal::disable_raw_mode();
    }
    Ok(c)
}

/// Leave raw mode no matter what state the terminal is in. Called on
/// every halt path before printing.
pub fn restore() {
    let _ = terminal::disable_raw_mode();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii() {
        let mut input: &[u8] = b"A";
        assert_eq!(read_char_from(&mut input), 'A' as u32);
    }

    #[test]
    fn test_multibyte_sequences() {
        let mut input: &[u8] = "é".as_bytes();
        assert_eq!(read_char_from(&mut input), 0xe9);
        let mut input: &[u8] = "€".as_bytes();
        assert_eq!(read_char_from(&mut input), 0x20ac);
        let mut input: &[u8] = "😀".as_bytes();
        assert_eq!(read_char_from(&mut input), 0x1f600);
    }

    #[test]
    fn test_eof_reads_as_ctrl_d() {
        let mut input: &[u8] = b"";
        assert_eq!(read_char_from(&mut input), EOF_CHAR);
        // Truncated multibyte sequence.
        let mut input: &[u8] = &[0xe2, 0x82];
        assert_eq!(read_char_from(&mut input), EOF_CHAR);
    }
}
