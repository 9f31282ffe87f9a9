//! Drivers.
//!
//! The seam between the machine and the outside world. The I/O opcodes
//! delegate here; the real frame/gallery implementation lives in the
//! `ivm-io` crate, and [`NullIo`] keeps headless builds and tests
//! running without it.

use crate::errors::CResult;

/// Everything the I/O opcode family needs from the host.
pub trait IoInterface {
    /// Read one UTF-32 character from the console. EOF reads as 4 (^D).
    fn read_char(&mut self) -> CResult<u32>;

    /// Append a UTF-32 scalar to the current frame's text buffer and
    /// mirror it to the diagnostic stream.
    fn put_char(&mut self, c: u32) -> CResult;

    /// Append one byte to the current frame's byte buffer.
    fn put_byte(&mut self, b: u8) -> CResult;

    /// Append one stereo sample pair.
    fn add_sample(&mut self, left: u16, right: u16) -> CResult;

    /// Paint one pixel of the current frame.
    fn set_pixel(&mut self, x: u16, y: u16, r: u8, g: u8, b: u8) -> CResult;

    /// Finish the current frame and start a new one with the given
    /// geometry and sample rate.
    fn new_frame(&mut self, width: u16, height: u16, sample_rate: u32) -> CResult;

    /// Decode input image `i`; returns `(width, height)`, or `(0, 0)`
    /// when the index is out of range.
    fn read_frame(&mut self, i: u64) -> CResult<(u64, u64)>;

    /// Read one grayscale sample of the cached input image.
    fn read_pixel(&mut self, x: u16, y: u16) -> CResult<u8>;

    /// End-of-run flush of the pending frame.
    fn flush(&mut self) -> CResult;
}

/// Headless I/O: frame opcodes log their arguments, reads return zero.
#[derive(Default)]
pub struct NullIo;

impl IoInterface for NullIo {
    fn read_char(&mut self) -> CResult<u32> {
        Ok(4)
    }

    fn put_char(&mut self, c: u32) -> CResult {
        use std::io::Write;
        let c = std::char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER);
        let mut buf = [0u8; 4];
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        handle.write_all(c.encode_utf8(&mut buf).as_bytes())?;
        handle.flush()?;
        Ok(())
    }

    fn put_byte(&mut self, b: u8) -> CResult {
        use std::io::Write;
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        handle.write_all(&[b])?;
        handle.flush()?;
        Ok(())
    }

    fn add_sample(&mut self, left: u16, right: u16) -> CResult {
        debug!("add_sample {} {}", left, right);
        Ok(())
    }

    fn set_pixel(&mut self, x: u16, y: u16, r: u8, g: u8, b: u8) -> CResult {
        debug!("set_pixel {} {} {} {} {}", x, y, r, g, b);
        Ok(())
    }

    fn new_frame(&mut self, width: u16, height: u16, sample_rate: u32) -> CResult {
        debug!("new_frame {} {} {}", width, height, sample_rate);
        Ok(())
    }

    fn read_frame(&mut self, i: u64) -> CResult<(u64, u64)> {
        debug!("read_frame {}", i);
        Ok((0, 0))
    }

    fn read_pixel(&mut self, _x: u16, _y: u16) -> CResult<u8> {
        Ok(0)
    }

    fn flush(&mut self) -> CResult {
        Ok(())
    }
}
