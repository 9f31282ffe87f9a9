//! Memory image.
//!
//! One contiguous byte buffer holding the program, the optional argument
//! and environment files, and the guest stack. Guest addresses are byte
//! indices; every access is bounds-checked and an out-of-range index
//! surfaces as a segmentation fault instead of trapping the host.

use std::fmt;

use crate::errors::{CResult, Fault, SetupError};

use super::types::Addr;

/// Default memory size in bytes (512 MiB).
pub const DEFAULT_MEM_BYTES: u64 = 512 * 1024 * 1024;

/// The flat guest memory.
pub struct MemoryImage {
    data: Vec<u8>,
    exec_start: Addr,
    exec_end: Addr,
    arg_end: Option<Addr>,
    env_end: Option<Addr>,
}

impl MemoryImage {
    /// Allocate a zeroed image of `size` bytes.
    pub fn new(size: u64) -> Self {
        MemoryImage {
            data: vec![0; size as usize],
            exec_start: 0,
            exec_end: 0,
            arg_end: None,
            env_end: None,
        }
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the image is empty. Always false for a usable machine.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First byte of the loaded program.
    pub fn exec_start(&self) -> Addr {
        self.exec_start
    }

    /// Last byte of the loaded program.
    pub fn exec_end(&self) -> Addr {
        self.exec_end
    }

    /// Load the program at `offset`, then materialize the 8-byte zero
    /// argument descriptor word right after its last byte.
    pub fn load_program(&mut self, bytes: &[u8], offset: Addr) -> CResult {
        let end = self.copy_blob(bytes, offset, "bytecode")?;
        self.exec_start = offset;
        self.exec_end = end;
        // The image is freshly zeroed, but a reloaded machine must not
        // see a stale descriptor.
        for i in 0..8 {
            self.data[(end + 1 + i) as usize] = 0;
        }
        debug!(
            "program occupies {:#x}..={:#x} ({} bytes)",
            self.exec_start,
            self.exec_end,
            bytes.len()
        );
        Ok(())
    }

    /// Load the argument file 8 bytes past the program's descriptor word
    /// and record its length in that word.
    pub fn load_argument(&mut self, bytes: &[u8]) -> CResult {
        let start = self.exec_end + 9;
        let end = self.copy_blob(bytes, start, "argument file")?;
        self.write_u64(self.exec_end + 1, bytes.len() as u64)
            .map_err(|e| SetupError(e.to_string()))?;
        self.arg_end = Some(end);
        debug!("argument file occupies {:#x}..={:#x}", start, end);
        Ok(())
    }

    /// Load the environment file after the argument file, with the same
    /// descriptor convention.
    pub fn load_environment(&mut self, bytes: &[u8]) -> CResult {
        let arg_end = self
            .arg_end
            .ok_or_else(|| SetupError("environment file requires an argument file".into()))?;
        let start = arg_end + 9;
        let end = self.copy_blob(bytes, start, "environment file")?;
        self.write_u64(arg_end + 1, bytes.len() as u64)
            .map_err(|e| SetupError(e.to_string()))?;
        self.env_end = Some(end);
        debug!("environment file occupies {:#x}..={:#x}", start, end);
        Ok(())
    }

    fn copy_blob(&mut self, bytes: &[u8], offset: Addr, what: &str) -> Result<Addr, SetupError> {
        let offset = offset as usize;
        // One descriptor word must still fit after the blob.
        if bytes.is_empty() || offset + bytes.len() + 8 > self.data.len() {
            return Err(SetupError(format!(
                "not enough memory to load {} ({} bytes at offset {})",
                what,
                bytes.len(),
                offset
            )));
        }
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok((offset + bytes.len() - 1) as Addr)
    }

    #[inline]
    fn check(&self, addr: Addr, n: u64) -> Result<usize, Fault> {
        let i = addr as usize;
        if addr.checked_add(n).map_or(true, |end| end > self.len()) {
            return Err(Fault::SegmentationFault(addr));
        }
        Ok(i)
    }

    /// Read one byte.
    #[inline]
    pub fn read_u8(&self, addr: Addr) -> Result<u8, Fault> {
        let i = self.check(addr, 1)?;
        Ok(self.data[i])
    }

    /// Read a little-endian 16-bit value.
    #[inline]
    pub fn read_u16(&self, addr: Addr) -> Result<u16, Fault> {
        let i = self.check(addr, 2)?;
        let mut b = [0; 2];
        b.copy_from_slice(&self.data[i..i + 2]);
        Ok(u16::from_le_bytes(b))
    }

    /// Read a little-endian 32-bit value.
    #[inline]
    pub fn read_u32(&self, addr: Addr) -> Result<u32, Fault> {
        let i = self.check(addr, 4)?;
        let mut b = [0; 4];
        b.copy_from_slice(&self.data[i..i + 4]);
        Ok(u32::from_le_bytes(b))
    }

    /// Read a little-endian 64-bit value.
    #[inline]
    pub fn read_u64(&self, addr: Addr) -> Result<u64, Fault> {
        let i = self.check(addr, 8)?;
        let mut b = [0; 8];
        b.copy_from_slice(&self.data[i..i + 8]);
        Ok(u64::from_le_bytes(b))
    }

    /// Write one byte.
    #[inline]
    pub fn write_u8(&mut self, addr: Addr, v: u8) -> Result<(), Fault> {
        let i = self.check(addr, 1)?;
        self.data[i] = v;
        Ok(())
    }

    /// Write a little-endian 16-bit value.
    #[inline]
    pub fn write_u16(&mut self, addr: Addr, v: u16) -> Result<(), Fault> {
        let i = self.check(addr, 2)?;
        self.data[i..i + 2].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian 32-bit value.
    #[inline]
    pub fn write_u32(&mut self, addr: Addr, v: u32) -> Result<(), Fault> {
        let i = self.check(addr, 4)?;
        self.data[i..i + 4].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian 64-bit value.
    #[inline]
    pub fn write_u64(&mut self, addr: Addr, v: u64) -> Result<(), Fault> {
        let i = self.check(addr, 8)?;
        self.data[i..i + 8].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Read `width` bytes (1, 2, 4 or 8) zero-extended to a word.
    #[inline]
    pub fn read_uint(&self, addr: Addr, width: u8) -> Result<u64, Fault> {
        match width {
            1 => self.read_u8(addr).map(u64::from),
            2 => self.read_u16(addr).map(u64::from),
            4 => self.read_u32(addr).map(u64::from),
            _ => self.read_u64(addr),
        }
    }

    /// Write the low `width` bytes (1, 2, 4 or 8) of a word.
    #[inline]
    pub fn write_uint(&mut self, addr: Addr, width: u8, v: u64) -> Result<(), Fault> {
        match width {
            1 => self.write_u8(addr, v as u8),
            2 => self.write_u16(addr, v as u16),
            4 => self.write_u32(addr, v as u32),
            _ => self.write_u64(addr, v),
        }
    }

    /// Non-faulting read used by the pattern matchers. Out-of-range
    /// bytes read as zero, which matches no pattern tail.
    #[inline]
    pub fn peek(&self, addr: Addr) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0)
    }
}

impl fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryImage {{ len: {}, exec: {:#x}..={:#x} }}",
            self.len(),
            self.exec_start,
            self.exec_end
        )
    }
}
