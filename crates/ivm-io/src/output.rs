//! Frame serialization.
//!
//! The serial output protocol: up to four files per frame sharing an
//! 8-digit zero-padded stem. Empty buffers produce no file. WAV is a
//! fixed 44-byte RIFF header ahead of the raw sample bytes; PNG is
//! 8-bit RGB, non-interlaced, default filter and compression.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::FrameRecord;

/// The common stem of one frame's output files.
pub fn frame_stem(out_dir: &Path, seq: u32) -> PathBuf {
    out_dir.join(format!("{:08}", seq))
}

/// Write (or append) one output file.
pub fn write_file(path: &Path, data: &[u8], append: bool) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    file.write_all(data)
}

/// The 44-byte RIFF/WAVE header for 16-bit stereo PCM.
pub struct WavHeader {
    data_len: u32,
    sample_rate: u32,
}

impl WavHeader {
    /// Header for `data_len` bytes of samples at `sample_rate` Hz.
    pub fn new(data_len: u32, sample_rate: u32) -> Self {
        WavHeader {
            data_len,
            sample_rate,
        }
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; 44] {
        let mut h = [0u8; 44];
        h[0..4].copy_from_slice(b"RIFF");
        h[4..8].copy_from_slice(&(36 + self.data_len).to_le_bytes());
        h[8..12].copy_from_slice(b"WAVE");
        h[12..16].copy_from_slice(b"fmt ");
        h[16..20].copy_from_slice(&16u32.to_le_bytes()); // fmt chunk size
        h[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
        h[22..24].copy_from_slice(&2u16.to_le_bytes()); // stereo
        h[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        h[28..32].copy_from_slice(&(4 * self.sample_rate).to_le_bytes());
        h[32..34].copy_from_slice(&4u16.to_le_bytes()); // block align
        h[34..36].copy_from_slice(&16u16.to_le_bytes()); // bits per sample
        h[36..40].copy_from_slice(b"data");
        h[40..44].copy_from_slice(&self.data_len.to_le_bytes());
        h
    }
}

fn write_wav(path: &Path, samples: &[u8], sample_rate: u32) -> io::Result<()> {
    let mut file = File::create(path)?;
    let header = WavHeader::new(samples.len() as u32, sample_rate);
    file.write_all(&header.to_bytes())?;
    file.write_all(samples)
}

fn write_png(path: &Path, rgb: &[u8], width: u16, height: u16) -> io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(file, u32::from(width), u32::from(height));
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder
        .write_header()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    writer
        .write_image_data(rgb)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// Write one frame's files under `out_dir`.
pub fn write_frame(out_dir: &Path, record: &FrameRecord) -> io::Result<()> {
    let stem = frame_stem(out_dir, record.seq);
    if !record.buffers.text.is_empty() {
        write_file(
            &stem.with_extension("text"),
            &record.buffers.text,
            record.append_text,
        )?;
    }
    if !record.buffers.bytes.is_empty() {
        write_file(
            &stem.with_extension("bytes"),
            &record.buffers.bytes,
            record.append_bytes,
        )?;
    }
    if !record.buffers.samples.is_empty() {
        write_wav(
            &stem.with_extension("wav"),
            &record.buffers.samples,
            record.sample_rate,
        )?;
    }
    if !record.buffers.image.is_empty() {
        write_png(
            &stem.with_extension("png"),
            &record.buffers.image,
            record.width,
            record.height,
        )?;
    }
    debug!("frame {:08} written", record.seq);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use crate::frame::FrameBuffers;

    use super::*;

    fn record(seq: u32) -> FrameRecord {
        FrameRecord {
            seq,
            buffers: FrameBuffers::new(),
            width: 0,
            height: 0,
            sample_rate: 0,
            append_text: false,
            append_bytes: false,
        }
    }

    #[test]
    fn test_wav_header_layout() {
        let h = WavHeader::new(8, 44100).to_bytes();
        assert_eq!(&h[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([h[4], h[5], h[6], h[7]]), 44);
        assert_eq!(&h[8..12], b"WAVE");
        assert_eq!(u16::from_le_bytes([h[20], h[21]]), 1);
        assert_eq!(u16::from_le_bytes([h[22], h[23]]), 2);
        assert_eq!(u32::from_le_bytes([h[24], h[25], h[26], h[27]]), 44100);
        assert_eq!(u32::from_le_bytes([h[28], h[29], h[30], h[31]]), 176400);
        assert_eq!(&h[36..40], b"data");
        assert_eq!(u32::from_le_bytes([h[40], h[41], h[42], h[43]]), 8);
    }

    #[test]
    fn test_empty_buffers_produce_no_files() {
        let dir = TempDir::new("ivm-output").unwrap();
        write_frame(dir.path(), &record(1)).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_frame_file_layout() {
        let dir = TempDir::new("ivm-output").unwrap();
        let mut rec = record(3);
        rec.buffers.text.extend_from_slice("hi".as_bytes());
        rec.buffers.samples.extend_from_slice(&[1, 2, 3, 4]);
        rec.buffers.image.extend_from_slice(&[255, 0, 0]);
        rec.width = 1;
        rec.height = 1;
        rec.sample_rate = 8000;
        write_frame(dir.path(), &rec).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("00000003.text")).unwrap(),
            b"hi"
        );
        let wav = std::fs::read(dir.path().join("00000003.wav")).unwrap();
        assert_eq!(wav.len(), 48);
        assert_eq!(&wav[44..], &[1, 2, 3, 4]);
        assert!(dir.path().join("00000003.png").exists());
        assert!(!dir.path().join("00000003.bytes").exists());
    }

    #[test]
    fn test_png_round_trip() {
        let dir = TempDir::new("ivm-output").unwrap();
        let path = dir.path().join("pixel.png");
        write_png(&path, &[255, 0, 0, 0, 255, 0], 2, 1).unwrap();

        let decoder = png::Decoder::new(std::fs::File::open(&path).unwrap());
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (2, 1));
        assert_eq!(info.color_type, png::ColorType::Rgb);
        assert_eq!(&buf[..6], &[255, 0, 0, 0, 255, 0]);
    }

    #[test]
    fn test_append_mode() {
        let dir = TempDir::new("ivm-output").unwrap();
        let path = dir.path().join("00000001.text");
        write_file(&path, b"first ", false).unwrap();
        write_file(&path, b"second", true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first second");
        write_file(&path, b"reset", false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"reset");
    }
}
