//! Tests for vigil-ledger: positions, reads, durability, recovery, capacity

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use vigil_core::{anchor, CellContent, Error, Payload, WriterId};
use vigil_ledger::*;

fn payload_cell(value: f64) -> CellContent {
    let traits: BTreeMap<String, f64> = [("x".to_string(), value)].into_iter().collect();
    let payload = Payload::new(traits).unwrap();
    CellContent::Payload {
        identity: anchor(&payload),
        traits: payload,
    }
}

fn small_segments(segment_cells: u64, cache_segments: usize) -> LedgerConfig {
    LedgerConfig {
        segment_cells,
        cache_segments,
        fsync: false,
        max_cells: None,
    }
}

// ===========================================================================
// Positions and reads
// ===========================================================================

#[test]
fn first_writes_take_positions_zero_and_one() {
    let tape = TapeLedger::in_memory(LedgerConfig::default());
    let writer = WriterId::new("kernel");
    assert_eq!(tape.write_cell(payload_cell(0.1), &writer).unwrap(), 0);
    assert_eq!(tape.write_cell(payload_cell(0.2), &writer).unwrap(), 1);

    let cell = tape.read_cell(1).unwrap();
    assert_eq!(cell.position, 1);
    assert_eq!(cell.content, payload_cell(0.2));
    assert_eq!(cell.written_by.as_str(), "kernel");
}

#[test]
fn unwritten_position_is_not_found() {
    let tape = TapeLedger::in_memory(LedgerConfig::default());
    tape.write_cell(payload_cell(0.1), &WriterId::new("w")).unwrap();

    let err = tape.read_cell(5).unwrap_err();
    match err {
        Error::PositionNotFound {
            position,
            next_position,
        } => {
            assert_eq!(position, 5);
            assert_eq!(next_position, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn empty_tape_has_nothing_to_read() {
    let tape = TapeLedger::in_memory(LedgerConfig::default());
    assert!(tape.read_cell(0).is_err());
    assert!(tape.tail(10).unwrap().is_empty());
    assert_eq!(tape.get_summary().total_cells, 0);
}

#[test]
fn repeated_reads_return_the_same_cell() {
    let tape = TapeLedger::in_memory(LedgerConfig::default());
    tape.write_cell(payload_cell(0.4), &WriterId::new("w")).unwrap();
    let first = tape.read_cell(0).unwrap();
    for _ in 0..10 {
        assert_eq!(tape.read_cell(0).unwrap(), first);
    }
}

#[test]
fn range_and_tail_clip_to_written() {
    let tape = TapeLedger::in_memory(LedgerConfig::default());
    let writer = WriterId::new("w");
    for i in 0..5 {
        tape.write_cell(payload_cell(i as f64), &writer).unwrap();
    }
    let range = tape.read_range(2..100).unwrap();
    assert_eq!(
        range.iter().map(|c| c.position).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );
    let tail = tape.tail(2).unwrap();
    assert_eq!(tail.iter().map(|c| c.position).collect::<Vec<_>>(), vec![3, 4]);
    assert_eq!(tape.tail(50).unwrap().len(), 5);
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[test]
fn concurrent_writers_get_unique_contiguous_positions() {
    let tape = Arc::new(TapeLedger::in_memory(LedgerConfig::default()));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let tape = tape.clone();
            thread::spawn(move || {
                let writer = WriterId::new(format!("writer-{t}"));
                let mut positions = Vec::new();
                for i in 0..100 {
                    positions.push(tape.write_cell(payload_cell(i as f64), &writer).unwrap());
                }
                positions
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let positions = handle.join().unwrap();
        // each writer sees its own positions strictly increasing
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        all.extend(positions);
    }
    all.sort_unstable();
    assert_eq!(all, (0..800).collect::<Vec<u64>>());
    assert_eq!(tape.next_position(), 800);
}

// ===========================================================================
// Capacity
// ===========================================================================

#[test]
fn full_tape_reports_storage_exhausted() {
    let tape = TapeLedger::in_memory(LedgerConfig {
        max_cells: Some(2),
        ..LedgerConfig::default()
    });
    let writer = WriterId::new("w");
    tape.write_cell(payload_cell(0.0), &writer).unwrap();
    tape.write_cell(payload_cell(1.0), &writer).unwrap();
    let err = tape.write_cell(payload_cell(2.0), &writer).unwrap_err();
    assert!(matches!(err, Error::StorageExhausted { capacity: 2 }));
    // existing cells remain readable and nothing was consumed
    assert_eq!(tape.next_position(), 2);
    assert!(tape.read_cell(1).is_ok());
}

#[test]
fn in_memory_tape_is_always_capped() {
    let unbounded = TapeLedger::in_memory(LedgerConfig {
        max_cells: None,
        ..LedgerConfig::default()
    });
    assert_eq!(unbounded.config().max_cells, Some(DEFAULT_IN_MEMORY_CELLS));

    let explicit = TapeLedger::in_memory(LedgerConfig {
        max_cells: Some(10),
        ..LedgerConfig::default()
    });
    assert_eq!(explicit.config().max_cells, Some(10));
}

#[test]
fn durable_tape_keeps_configured_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let tape = TapeLedger::open(dir.path(), small_segments(4, 1)).unwrap();
    assert_eq!(tape.config().max_cells, None);
}

// ===========================================================================
// Durability
// ===========================================================================

#[test]
fn durable_tape_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WriterId::new("w");
    {
        let tape = TapeLedger::open(dir.path(), small_segments(4, 2)).unwrap();
        for i in 0..10 {
            tape.write_cell(payload_cell(i as f64), &writer).unwrap();
        }
    }
    let tape = TapeLedger::open(dir.path(), small_segments(4, 2)).unwrap();
    assert_eq!(tape.next_position(), 10);
    assert_eq!(tape.read_cell(7).unwrap().content, payload_cell(7.0));
    // appends continue where the previous process stopped
    assert_eq!(tape.write_cell(payload_cell(10.0), &writer).unwrap(), 10);
    assert_eq!(tape.get_summary().segments, 3);
}

#[test]
fn evicted_segments_are_read_back_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let tape = TapeLedger::open(dir.path(), small_segments(2, 1)).unwrap();
    let writer = WriterId::new("w");
    for i in 0..9 {
        tape.write_cell(payload_cell(i as f64), &writer).unwrap();
    }
    let summary = tape.get_summary();
    assert!(summary.resident_cells < 9, "{summary:?}");
    assert_eq!(tape.read_cell(0).unwrap().content, payload_cell(0.0));
    let all = tape.read_range(0..9).unwrap();
    assert_eq!(all.len(), 9);
    assert!(all.iter().enumerate().all(|(i, c)| c.position == i as u64));
}

#[test]
fn torn_tail_is_dropped_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WriterId::new("w");
    {
        let tape = TapeLedger::open(dir.path(), small_segments(16, 2)).unwrap();
        tape.write_cell(payload_cell(0.0), &writer).unwrap();
        tape.write_cell(payload_cell(1.0), &writer).unwrap();
    }
    let path = segment::segment_path(dir.path(), 0);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"position":2,"content":{"ki"#).unwrap();
    drop(file);

    let tape = TapeLedger::open(dir.path(), small_segments(16, 2)).unwrap();
    assert_eq!(tape.next_position(), 2);
    assert_eq!(tape.write_cell(payload_cell(2.0), &writer).unwrap(), 2);
    drop(tape);

    let tape = TapeLedger::open(dir.path(), small_segments(16, 2)).unwrap();
    assert_eq!(tape.read_cell(2).unwrap().content, payload_cell(2.0));
}

#[test]
fn corrupt_middle_line_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let writer = WriterId::new("w");
    {
        let tape = TapeLedger::open(dir.path(), small_segments(16, 2)).unwrap();
        tape.write_cell(payload_cell(0.0), &writer).unwrap();
        tape.write_cell(payload_cell(1.0), &writer).unwrap();
    }
    let path = segment::segment_path(dir.path(), 0);
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, format!("garbage\n{text}")).unwrap();

    let err = TapeLedger::open(dir.path(), small_segments(16, 2)).err().unwrap();
    assert!(matches!(err, Error::Corrupt(_)));
}

#[test]
fn from_section_without_dir_is_in_memory() {
    let tape = TapeLedger::from_section(&vigil_core::LedgerSection::default()).unwrap();
    assert!(!tape.is_durable());
    assert!(!tape.get_summary().durable);
}
