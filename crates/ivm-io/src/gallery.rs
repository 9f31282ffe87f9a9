//! Input gallery.
//!
//! Enumerates the PNG files of the input directory and decodes one at
//! a time into an 8-bpp grayscale plane for `READ_FRAME`/`READ_PIXEL`.
//! The directory is rescanned on every read so frames the program just
//! wrote (when input and output directories coincide) become visible;
//! a rescan may miss frames whose worker has not finished writing.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use walkdir::WalkDir;

use ivm_core::errors::{CResult, SetupError};

// libpng's default integer rgb-to-gray weights, summing to 1 in Q15.
const GRAY_R: u32 = 6968;
const GRAY_G: u32 = 23434;
const GRAY_B: u32 = 2366;

fn gray(r: u8, g: u8, b: u8) -> u8 {
    ((GRAY_R * u32::from(r) + GRAY_G * u32::from(g) + GRAY_B * u32::from(b) + 16384) >> 15) as u8
}

/// The PNG input directory and the most recently decoded image.
pub struct InputGallery {
    dir: Option<PathBuf>,
    files: Vec<PathBuf>,
    plane: Vec<u8>,
    rowbytes: usize,
}

impl InputGallery {
    /// Open a gallery over `dir`; `None` means no input was configured
    /// and every read returns zeros.
    pub fn new(dir: Option<PathBuf>) -> CResult<Self> {
        let mut gallery = InputGallery {
            dir,
            files: Vec::new(),
            plane: Vec::new(),
            rowbytes: 0,
        };
        gallery.rescan()?;
        Ok(gallery)
    }

    /// Re-list the directory: regular `*.png` files, sorted.
    pub fn rescan(&mut self) -> CResult {
        let dir = match &self.dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| SetupError(format!("input directory: {}", e)))?;
            if entry.file_type().is_file()
                && entry.path().extension().map_or(false, |ext| ext == "png")
            {
                files.push(entry.into_path());
            }
        }
        self.files = files;
        Ok(())
    }

    /// Number of input images found by the last rescan.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the last rescan found no images.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Decode image `i` into the grayscale cache and return its size.
    /// An out-of-range index returns `(0, 0)` and keeps the cache.
    pub fn read_frame(&mut self, i: u64) -> CResult<(u64, u64)> {
        self.rescan()?;
        let path = match self.files.get(i as usize) {
            Some(path) => path,
            None => return Ok((0, 0)),
        };

        let mut decoder = png::Decoder::new(BufReader::new(File::open(path)?));
        decoder.set_transformations(png::Transformations::normalize_to_color8());
        let mut reader = decoder.read_info()?;
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf)?;
        let (width, height) = (info.width as usize, info.height as usize);
        let pixels = width * height;

        self.plane.clear();
        self.plane.reserve(pixels);
        match info.color_type {
            png::ColorType::Grayscale => self.plane.extend_from_slice(&buf[..pixels]),
            png::ColorType::GrayscaleAlpha => {
                self.plane.extend(buf[..pixels * 2].chunks_exact(2).map(|p| p[0]));
            }
            png::ColorType::Rgba => {
                self.plane.extend(
                    buf[..pixels * 4]
                        .chunks_exact(4)
                        .map(|p| gray(p[0], p[1], p[2])),
                );
            }
            _ => {
                self.plane.extend(
                    buf[..pixels * 3]
                        .chunks_exact(3)
                        .map(|p| gray(p[0], p[1], p[2])),
                );
            }
        }
        self.rowbytes = width;
        debug!("decoded '{}' ({}x{})", path.display(), width, height);
        Ok((width as u64, height as u64))
    }

    /// One grayscale sample of the cached image; out-of-plane reads
    /// return zero.
    pub fn read_pixel(&self, x: u16, y: u16) -> u8 {
        let offset = usize::from(y) * self.rowbytes + usize::from(x);
        self.plane.get(offset).copied().unwrap_or(0)
    }
}
