//! vigil - deterministic governance kernel
//!
//! The binary is a thin shell over [`commands`]; the kernel itself lives in
//! the `vigil-*` workspace crates.

pub mod commands;

pub use vigil_core as core;
pub use vigil_kernel as kernel;
pub use vigil_ledger as ledger;
