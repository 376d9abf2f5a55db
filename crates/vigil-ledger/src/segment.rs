//! Segment files: the durable form of the tape.
//!
//! A segment is a JSONL file holding a contiguous run of cells, one cell per
//! line. File names carry the first position, zero padded, so a sorted
//! directory listing is positional order:
//!
//! ```text
//! <dir>/segment-00000000000000000000.jsonl   positions 0..N
//! <dir>/segment-00000000000000004096.jsonl   positions N..2N
//! ```
//!
//! Only the last segment is ever open for writing.

use crate::TapeCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use vigil_core::{Error, Result};

const PREFIX: &str = "segment-";
const SUFFIX: &str = ".jsonl";

pub fn segment_path(dir: &Path, first_position: u64) -> PathBuf {
    dir.join(format!("{PREFIX}{first_position:020}{SUFFIX}"))
}

/// All segment files in `dir`, ordered by first position.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(first) = name
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.strip_suffix(SUFFIX))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        segments.push((first, path));
    }
    segments.sort_by_key(|(first, _)| *first);
    Ok(segments)
}

/// Cells of one segment, plus the byte length of the valid prefix.
pub struct LoadedSegment {
    pub cells: Vec<TapeCell>,
    pub valid_len: u64,
    pub torn_tail: bool,
}

/// Read a segment file.
///
/// An unparseable final line is reported as a torn tail (an append that never
/// returned) rather than an error; any earlier bad line is corruption.
pub fn read_segment(path: &Path) -> Result<LoadedSegment> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut cells = Vec::new();
    let mut valid_len = 0u64;
    let mut line = String::new();
    let mut line_no = 0usize;
    let mut pending_error: Option<String> = None;

    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        if let Some(message) = pending_error.take() {
            return Err(Error::Corrupt(message));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            valid_len += read as u64;
            continue;
        }
        match serde_json::from_str::<TapeCell>(trimmed) {
            Ok(cell) if line.ends_with('\n') => {
                cells.push(cell);
                valid_len += read as u64;
            }
            Ok(_) => {
                pending_error = Some(format!("{}: line {line_no}: unterminated", path.display()));
            }
            Err(e) => {
                pending_error = Some(format!("{}: line {line_no}: {e}", path.display()));
            }
        }
    }

    Ok(LoadedSegment {
        cells,
        valid_len,
        torn_tail: pending_error.is_some(),
    })
}

/// The segment currently receiving appends.
pub struct ActiveSegment {
    pub first_position: u64,
    pub cells: u64,
    file: File,
    len: u64,
    fsync: bool,
}

impl ActiveSegment {
    pub fn create(dir: &Path, first_position: u64, fsync: bool) -> Result<Self> {
        let path = segment_path(dir, first_position);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        if fsync {
            sync_dir(dir)?;
        }
        Ok(Self {
            first_position,
            cells: 0,
            file,
            len: 0,
            fsync,
        })
    }

    /// Reopen an existing segment for appending, dropping any torn tail.
    pub fn reopen(path: &Path, first_position: u64, cells: u64, valid_len: u64, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_data()?;
        }
        Ok(Self {
            first_position,
            cells,
            file,
            len: valid_len,
            fsync,
        })
    }

    /// Append one cell. Returns once the bytes are handed to the OS
    /// (and synced, when configured).
    pub fn append(&mut self, cell: &TapeCell) -> Result<()> {
        let mut line = serde_json::to_vec(cell)?;
        line.push(b'\n');
        if let Err(e) = self.write_line(&line) {
            // Leave no partial line behind for the next append to follow.
            let _ = self.file.set_len(self.len);
            return Err(e);
        }
        self.len += line.len() as u64;
        self.cells += 1;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        self.file.write_all(line)?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}
