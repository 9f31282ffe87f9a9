//! The file-backed I/O driver.
//!
//! Wires the frame assembler, the output pipeline and the input
//! gallery into the machine's [`IoInterface`] seam. Frame sequence
//! numbers are assigned here, in strict producer order, on every
//! flush, including flushes with nothing to write.

use std::path::PathBuf;

use ivm_core::drivers::IoInterface;
use ivm_core::errors::{CResult, SetupError};

use crate::console;
use crate::frame::{FrameAssembler, FrameBuffers, BUFFER_FLUSH_LIMIT};
use crate::gallery::InputGallery;
use crate::output;
use crate::pipeline::QueueHandler;

/// I/O driver configuration.
#[derive(Debug, Default)]
pub struct IoOptions {
    /// Where frame files go; `None` discards output.
    pub out_dir: Option<PathBuf>,
    /// Where `READ_FRAME` looks for PNGs.
    pub inp_dir: Option<PathBuf>,
    /// Worker threads for parallel output; `None` writes inline.
    pub workers: Option<usize>,
}

/// [`IoInterface`] implementation over the filesystem.
pub struct EmulatorIo {
    assembler: FrameAssembler,
    gallery: InputGallery,
    out_dir: Option<PathBuf>,
    pipeline: Option<QueueHandler>,
    seq: u32,
    // Sequence number whose text/bytes were already partially flushed.
    console_seq: Option<u32>,
}

impl EmulatorIo {
    /// Build the driver; fails early when the input directory is
    /// unreadable.
    pub fn new(options: IoOptions) -> CResult<Self> {
        let out_dir = options.out_dir.clone();
        let gallery = InputGallery::new(options.inp_dir)?;
        let pipeline = options
            .workers
            .map(|workers| QueueHandler::start(out_dir, workers));
        Ok(EmulatorIo {
            assembler: FrameAssembler::new(),
            gallery,
            out_dir: options.out_dir,
            pipeline,
            seq: 0,
            console_seq: None,
        })
    }

    /// Sequence number the next finished frame will get.
    pub fn next_seq(&self) -> u32 {
        self.seq
    }

    fn check_pipeline(&self) -> CResult {
        if let Some(pipeline) = &self.pipeline {
            if let Some(failure) = pipeline.failure() {
                return Err(Box::new(SetupError(format!(
                    "output worker failed: {}",
                    failure
                ))));
            }
        }
        Ok(())
    }

    // Finish the current frame and hand it off: to the worker pool in
    // parallel mode, straight to disk otherwise.
    fn flush_frame(&mut self) -> CResult {
        self.check_pipeline()?;
        let seq = self.seq;
        let replacement = match &self.pipeline {
            Some(pipeline) => pipeline.recycle(),
            None => FrameBuffers::new(),
        };
        let mut record = self.assembler.finish(seq, replacement);
        let appended = self.console_seq == Some(seq);
        record.append_text = appended;
        record.append_bytes = appended;
        self.seq += 1;
        match &self.pipeline {
            Some(pipeline) => pipeline.submit(record),
            None => {
                if let Some(dir) = &self.out_dir {
                    output::write_frame(dir, &record)?;
                }
            }
        }
        Ok(())
    }

    // Early flush of the text/byte buffers, without advancing the
    // sequence number. Keeps long-running console programs bounded.
    fn flush_console(&mut self) -> CResult {
        if let Some(dir) = &self.out_dir {
            let append = self.console_seq == Some(self.seq);
            let stem = output::frame_stem(dir, self.seq);
            let text = self.assembler.take_text();
            if !text.is_empty() {
                output::write_file(&stem.with_extension("text"), &text, append)?;
            }
            let bytes = self.assembler.take_bytes();
            if !bytes.is_empty() {
                output::write_file(&stem.with_extension("bytes"), &bytes, append)?;
            }
            self.console_seq = Some(self.seq);
        }
        Ok(())
    }
}

impl IoInterface for EmulatorIo {
    fn read_char(&mut self) -> CResult<u32> {
        Ok(console::read_char()?)
    }

    fn put_char(&mut self, c: u32) -> CResult {
        self.assembler.put_char(c);
        if self.assembler.text_len() >= BUFFER_FLUSH_LIMIT {
            self.flush_console()?;
        }
        Ok(())
    }

    fn put_byte(&mut self, b: u8) -> CResult {
        self.assembler.put_byte(b);
        if self.assembler.bytes_len() >= BUFFER_FLUSH_LIMIT {
            self.flush_console()?;
        }
        Ok(())
    }

    fn add_sample(&mut self, left: u16, right: u16) -> CResult {
        self.assembler.add_sample(left, right);
        Ok(())
    }

    fn set_pixel(&mut self, x: u16, y: u16, r: u8, g: u8, b: u8) -> CResult {
        self.assembler.set_pixel(x, y, r, g, b);
        Ok(())
    }

    fn new_frame(&mut self, width: u16, height: u16, sample_rate: u32) -> CResult {
        self.flush_frame()?;
        self.assembler.begin(width, height, sample_rate);
        Ok(())
    }

    fn read_frame(&mut self, i: u64) -> CResult<(u64, u64)> {
        // Frames the guest itself produced must be durable before the
        // rescan can see them.
        if let Some(pipeline) = &self.pipeline {
            pipeline.wait_until_processed();
        }
        self.check_pipeline()?;
        self.gallery.read_frame(i)
    }

    fn read_pixel(&mut self, x: u16, y: u16) -> CResult<u8> {
        Ok(self.gallery.read_pixel(x, y))
    }

    fn flush(&mut self) -> CResult {
        // Drain the workers, then write the final partial frame inline.
        if let Some(pipeline) = &self.pipeline {
            pipeline.wait_until_processed();
        }
        self.check_pipeline()?;
        let seq = self.seq;
        let mut record = self.assembler.finish(seq, FrameBuffers::new());
        let appended = self.console_seq == Some(seq);
        record.append_text = appended;
        record.append_bytes = appended;
        self.seq += 1;
        if let Some(dir) = &self.out_dir {
            output::write_frame(dir, &record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    fn driver(dir: &TempDir, workers: Option<usize>) -> EmulatorIo {
        EmulatorIo::new(IoOptions {
            out_dir: Some(dir.path().to_path_buf()),
            inp_dir: None,
            workers,
        })
        .unwrap()
    }

    #[test]
    fn test_single_pixel_frame() {
        let dir = TempDir::new("ivm-driver").unwrap();
        let mut io = driver(&dir, None);
        io.new_frame(1, 1, 0).unwrap(); // empty frame 0, nothing written
        io.set_pixel(0, 0, 255, 0, 0).unwrap();
        io.new_frame(0, 0, 0).unwrap(); // frame 1, one red pixel
        io.flush().unwrap();

        assert!(!dir.path().join("00000000.png").exists());
        assert!(dir.path().join("00000001.png").exists());
        assert!(!dir.path().join("00000001.wav").exists());
        assert!(!dir.path().join("00000001.text").exists());
        assert!(!dir.path().join("00000002.png").exists());

        let decoder = png::Decoder::new(std::fs::File::open(dir.path().join("00000001.png")).unwrap());
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (1, 1));
        assert_eq!(&buf[..3], &[255, 0, 0]);
    }

    #[test]
    fn test_parallel_mode_writes_every_frame() {
        let dir = TempDir::new("ivm-driver").unwrap();
        let mut io = driver(&dir, Some(3));
        io.new_frame(1, 1, 0).unwrap();
        for seq in 1..10 {
            io.put_byte(seq as u8).unwrap();
            io.new_frame(1, 1, 0).unwrap();
        }
        io.flush().unwrap();
        for seq in 1..10 {
            let path = dir.path().join(format!("{:08}.bytes", seq));
            assert_eq!(std::fs::read(path).unwrap(), vec![seq as u8]);
        }
    }

    #[test]
    fn test_text_and_round_trip_gallery() {
        let dir = TempDir::new("ivm-driver").unwrap();
        let mut io = EmulatorIo::new(IoOptions {
            out_dir: Some(dir.path().to_path_buf()),
            inp_dir: Some(dir.path().to_path_buf()),
            workers: None,
        })
        .unwrap();

        io.new_frame(2, 1, 0).unwrap();
        for c in "ok\n".chars() {
            io.put_char(c as u32).unwrap();
        }
        io.set_pixel(0, 0, 255, 255, 255).unwrap();
        io.new_frame(0, 0, 0).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("00000001.text")).unwrap(),
            b"ok\n"
        );

        // The frame written a moment ago is visible to READ_FRAME.
        let (width, height) = io.read_frame(0).unwrap();
        assert_eq!((width, height), (2, 1));
        assert_eq!(io.read_pixel(0, 0).unwrap(), 255);
        assert_eq!(io.read_pixel(1, 0).unwrap(), 0);
    }

    #[test]
    fn test_sequence_numbers_without_out_dir() {
        let mut io = EmulatorIo::new(IoOptions::default()).unwrap();
        io.new_frame(0, 0, 0).unwrap();
        io.new_frame(0, 0, 0).unwrap();
        assert_eq!(io.next_seq(), 2);
    }
}
