//! The tape ledger: append-only, position-addressed cell storage.
//!
//! Positions are handed out inside a single critical section that also
//! performs the (durable) write, so position order is causal write order.
//! Readers never take that lock: a cell becomes visible only after it is
//! inserted and the commit counter is advanced past it.

use crate::segment::{self, ActiveSegment};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use vigil_core::{CellContent, Error, LedgerSection, Result, WriterId};

/// Capacity of an in-memory tape when the config names none.
pub const DEFAULT_IN_MEMORY_CELLS: u64 = 1_000_000;

/// One immutable tape entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapeCell {
    pub position: u64,
    pub content: CellContent,
    pub written_by: WriterId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_cells: u64,
    pub next_position: u64,
    pub segments: u64,
    pub resident_cells: u64,
    pub durable: bool,
}

#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub segment_cells: u64,
    pub cache_segments: usize,
    pub fsync: bool,
    pub max_cells: Option<u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::from(&LedgerSection::default())
    }
}

impl From<&LedgerSection> for LedgerConfig {
    fn from(section: &LedgerSection) -> Self {
        Self {
            segment_cells: section.segment_cells.max(1),
            cache_segments: section.cache_segments,
            fsync: section.fsync,
            max_cells: section.max_cells,
        }
    }
}

/// State touched only under the writer lock.
struct TapeWriter {
    next_position: u64,
    active: Option<ActiveSegment>,
    /// First positions of sealed segments still resident, oldest first.
    resident_sealed: VecDeque<u64>,
    segments: u64,
}

pub struct TapeLedger {
    config: LedgerConfig,
    dir: Option<PathBuf>,
    writer: Mutex<TapeWriter>,
    committed: AtomicU64,
    cells: DashMap<u64, Arc<TapeCell>>,
}

impl TapeLedger {
    /// A tape that lives only in memory. Nothing is ever evicted, so the
    /// tape is always capped: `max_cells` if set, else
    /// [`DEFAULT_IN_MEMORY_CELLS`].
    pub fn in_memory(mut config: LedgerConfig) -> Self {
        config.max_cells = Some(config.max_cells.unwrap_or(DEFAULT_IN_MEMORY_CELLS));
        Self {
            config,
            dir: None,
            writer: Mutex::new(TapeWriter {
                next_position: 0,
                active: None,
                resident_sealed: VecDeque::new(),
                segments: 0,
            }),
            committed: AtomicU64::new(0),
            cells: DashMap::new(),
        }
    }

    /// Open (or create) a durable tape in `dir`, recovering existing segments.
    pub fn open(dir: impl AsRef<Path>, config: LedgerConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let cells = DashMap::new();
        let listed = segment::list_segments(&dir)?;
        let mut next_position = 0u64;
        let mut resident_sealed = VecDeque::new();
        let mut active = None;
        let last_index = listed.len().saturating_sub(1);

        for (index, (first, path)) in listed.iter().enumerate() {
            if *first != next_position {
                return Err(Error::Corrupt(format!(
                    "{}: expected segment starting at {}, found {}",
                    dir.display(),
                    next_position,
                    first
                )));
            }
            let loaded = segment::read_segment(path)?;
            let is_last = index == last_index;
            if loaded.torn_tail {
                if !is_last {
                    return Err(Error::Corrupt(format!(
                        "{}: torn record in sealed segment",
                        path.display()
                    )));
                }
                warn!("Dropping torn tail of {}", path.display());
            }
            for cell in &loaded.cells {
                if cell.position != next_position {
                    return Err(Error::Corrupt(format!(
                        "{}: expected position {}, found {}",
                        path.display(),
                        next_position,
                        cell.position
                    )));
                }
                next_position += 1;
            }

            let count = loaded.cells.len() as u64;
            if is_last && count < config.segment_cells {
                active = Some(ActiveSegment::reopen(
                    path,
                    *first,
                    count,
                    loaded.valid_len,
                    config.fsync,
                )?);
            } else {
                resident_sealed.push_back(*first);
            }
            for cell in loaded.cells {
                cells.insert(cell.position, Arc::new(cell));
            }
        }

        let ledger = Self {
            dir: Some(dir),
            writer: Mutex::new(TapeWriter {
                next_position,
                active,
                resident_sealed,
                segments: listed.len() as u64,
            }),
            committed: AtomicU64::new(next_position),
            cells,
            config,
        };
        {
            let mut writer = ledger.lock_writer();
            ledger.evict_sealed(&mut writer);
        }
        info!(
            "Tape opened at {} ({} cells, {} segments)",
            ledger.dir.as_deref().map(|d| d.display().to_string()).unwrap_or_default(),
            next_position,
            listed.len()
        );
        Ok(ledger)
    }

    /// Durable when the section names a directory, in memory otherwise.
    pub fn from_section(section: &LedgerSection) -> Result<Self> {
        let config = LedgerConfig::from(section);
        match &section.dir {
            Some(dir) => Self::open(dir, config),
            None => Ok(Self::in_memory(config)),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn is_durable(&self) -> bool {
        self.dir.is_some()
    }

    /// Append a cell and return its position.
    ///
    /// The write is complete (and synced, when configured) before the
    /// position becomes visible to readers or is returned.
    pub fn write_cell(&self, content: CellContent, writer_id: &WriterId) -> Result<u64> {
        let mut writer = self.lock_writer();
        let position = writer.next_position;

        if let Some(capacity) = self.config.max_cells {
            if position >= capacity {
                return Err(Error::StorageExhausted { capacity });
            }
        }
        if position == u64::MAX {
            return Err(Error::StorageExhausted { capacity: u64::MAX });
        }

        let cell = TapeCell {
            position,
            content,
            written_by: writer_id.clone(),
            timestamp: Utc::now(),
        };

        if let Some(dir) = &self.dir {
            if writer.active.is_none() {
                writer.active = Some(ActiveSegment::create(dir, position, self.config.fsync)?);
                writer.segments += 1;
            }
            if let Some(active) = writer.active.as_mut() {
                active.append(&cell)?;
            }
        }

        let kind = cell.content.kind();
        self.cells.insert(position, Arc::new(cell));
        writer.next_position = position + 1;
        self.committed.store(writer.next_position, Ordering::Release);

        if self.dir.is_none() && position % self.config.segment_cells == 0 {
            writer.segments += 1;
        }
        self.seal_if_full(&mut writer);

        debug!("Tape cell {} written by {} ({})", position, writer_id, kind);
        Ok(position)
    }

    /// Read the cell at `position`. Unwritten and future positions fail.
    pub fn read_cell(&self, position: u64) -> Result<TapeCell> {
        let next_position = self.next_position();
        if position >= next_position {
            return Err(Error::PositionNotFound {
                position,
                next_position,
            });
        }
        if let Some(cell) = self.cells.get(&position) {
            return Ok((**cell).clone());
        }
        let loaded = self.load_evicted(position)?;
        loaded
            .into_iter()
            .find(|cell| cell.position == position)
            .ok_or_else(|| Error::Corrupt(format!("committed position {position} missing from segments")))
    }

    /// Cells in `range`, clipped to what has been written.
    pub fn read_range(&self, range: Range<u64>) -> Result<Vec<TapeCell>> {
        let end = range.end.min(self.next_position());
        let mut out = Vec::with_capacity(end.saturating_sub(range.start) as usize);
        let mut loaded: VecDeque<TapeCell> = VecDeque::new();
        let mut position = range.start;

        while position < end {
            if let Some(cell) = self.cells.get(&position) {
                out.push((**cell).clone());
                position += 1;
                continue;
            }
            while loaded.front().is_some_and(|c| c.position < position) {
                loaded.pop_front();
            }
            if loaded.front().map(|c| c.position) != Some(position) {
                loaded = self.load_evicted(position)?.into();
                while loaded.front().is_some_and(|c| c.position < position) {
                    loaded.pop_front();
                }
            }
            match loaded.pop_front() {
                Some(cell) if cell.position == position => out.push(cell),
                _ => {
                    return Err(Error::Corrupt(format!(
                        "committed position {position} missing from segments"
                    )))
                }
            }
            position += 1;
        }
        Ok(out)
    }

    /// The last `n` cells, oldest first.
    pub fn tail(&self, n: u64) -> Result<Vec<TapeCell>> {
        let end = self.next_position();
        self.read_range(end.saturating_sub(n)..end)
    }

    pub fn next_position(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn get_summary(&self) -> LedgerSummary {
        let writer = self.lock_writer();
        LedgerSummary {
            total_cells: writer.next_position,
            next_position: writer.next_position,
            segments: writer.segments,
            resident_cells: self.cells.len() as u64,
            durable: self.dir.is_some(),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, TapeWriter> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn seal_if_full(&self, writer: &mut TapeWriter) {
        let full = writer
            .active
            .as_ref()
            .is_some_and(|active| active.cells >= self.config.segment_cells);
        if full {
            if let Some(sealed) = writer.active.take() {
                debug!("Sealed segment starting at {}", sealed.first_position);
                writer.resident_sealed.push_back(sealed.first_position);
                self.evict_sealed(writer);
            }
        }
    }

    fn evict_sealed(&self, writer: &mut TapeWriter) {
        if self.dir.is_none() {
            return;
        }
        while writer.resident_sealed.len() > self.config.cache_segments {
            let Some(first) = writer.resident_sealed.pop_front() else {
                break;
            };
            let end = first.saturating_add(self.config.segment_cells).min(writer.next_position);
            for position in first..end {
                self.cells.remove(&position);
            }
            debug!("Evicted segment starting at {} from memory", first);
        }
    }

    /// Load the on-disk segment holding `position`.
    fn load_evicted(&self, position: u64) -> Result<Vec<TapeCell>> {
        let Some(dir) = &self.dir else {
            return Err(Error::Corrupt(format!(
                "in-memory tape lost committed position {position}"
            )));
        };
        let segments = segment::list_segments(dir)?;
        let holder = segments
            .iter()
            .rev()
            .find(|(first, _)| *first <= position)
            .ok_or_else(|| Error::Corrupt(format!("no segment holds position {position}")))?;
        Ok(segment::read_segment(&holder.1)?.cells)
    }
}
