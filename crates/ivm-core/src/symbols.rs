//! Symbol index.
//!
//! Reads the optional `.sym` file shipped next to a binary and answers
//! address-to-label queries for the halt report. Everything here is
//! diagnostic; a missing or malformed file simply yields an empty index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Address-to-label lookup built from a `.sym` file.
#[derive(Debug, Default)]
pub struct SymbolIndex {
    labels: BTreeMap<u64, String>,
}

/// The `.sym` sibling of a binary: same name, extension replaced.
pub fn sym_file_for(binary: &Path) -> PathBuf {
    binary.with_extension("sym")
}

impl SymbolIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load labels for `binary` from its `.sym` sibling, if present.
    pub fn for_binary(binary: &Path) -> Self {
        let path = sym_file_for(binary);
        match Self::from_file(&path) {
            Some(index) => {
                debug!("read {} symbols from '{}'", index.len(), path.display());
                index
            }
            None => {
                debug!("no labels from '{}'", path.display());
                Self::new()
            }
        }
    }

    /// Parse a `.sym` file: skip until the `--Labels--` line, then read
    /// `<name> <pc>` pairs until the section ends.
    pub fn from_file(path: &Path) -> Option<Self> {
        let reader = BufReader::new(File::open(path).ok()?);
        let mut lines = reader.lines();
        loop {
            match lines.next() {
                Some(Ok(line)) => {
                    if line.trim_end() == "--Labels--" {
                        break;
                    }
                }
                _ => return None,
            }
        }

        let mut labels = BTreeMap::new();
        for line in lines {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let mut parts = line.split_whitespace();
            let (name, pc) = match (parts.next(), parts.next()) {
                (Some(name), Some(pc)) => (name, pc),
                _ => break,
            };
            let pc: u64 = match pc.parse() {
                Ok(pc) => pc,
                Err(_) => break,
            };
            // Several labels may share a PC; keep the first one.
            labels.entry(pc).or_insert_with(|| name.to_string());
        }
        Some(SymbolIndex { labels })
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the index has no labels.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Label exactly at `pc`.
    pub fn at(&self, pc: u64) -> Option<&str> {
        self.labels.get(&pc).map(String::as_str)
    }

    /// Nearest labels at-or-below and above `pc`.
    pub fn nearest(&self, pc: u64) -> (Option<&str>, Option<&str>) {
        let lower = self
            .labels
            .range(..=pc)
            .next_back()
            .map(|(_, name)| name.as_str());
        let upper = self
            .labels
            .range(pc + 1..)
            .next()
            .map(|(_, name)| name.as_str());
        (lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_sym(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("prog.sym");
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_labels_section() {
        let dir = std::env::temp_dir().join("ivm-symbols-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_sym(
            &dir,
            "--Previous--\n\n--Size--\n3609\n--Labels--\nz/main 686\nz/_start 50\nz/_exit 700\n--Spacers--\n",
        );

        let index = SymbolIndex::from_file(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.at(686), Some("z/main"));
        assert_eq!(index.at(51), None);

        let (lower, upper) = index.nearest(690);
        assert_eq!(lower, Some("z/main"));
        assert_eq!(upper, Some("z/_exit"));

        let (lower, upper) = index.nearest(10);
        assert_eq!(lower, None);
        assert_eq!(upper, Some("z/_start"));
    }

    #[test]
    fn test_missing_labels_section() {
        let dir = std::env::temp_dir().join("ivm-symbols-test2");
        std::fs::create_dir_all(&dir).unwrap();
        let path = write_sym(&dir, "--Size--\n123\n");
        assert!(SymbolIndex::from_file(&path).is_none());
    }

    #[test]
    fn test_sym_file_name() {
        assert_eq!(
            sym_file_for(Path::new("dir/prog.bin")),
            PathBuf::from("dir/prog.sym")
        );
        assert_eq!(
            sym_file_for(Path::new("prog.b")),
            PathBuf::from("prog.sym")
        );
    }
}
