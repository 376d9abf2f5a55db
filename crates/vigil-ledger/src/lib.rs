//! vigil ledger - the append-only tape of cells
//!
//! Every payload, reading, convergence and anchor the kernel produces is
//! written here once and never modified. Positions start at 0 and grow by
//! one per cell with no gaps.

pub mod segment;
pub mod tape;

pub use tape::{DEFAULT_IN_MEMORY_CELLS, LedgerConfig, LedgerSummary, TapeCell, TapeLedger};
