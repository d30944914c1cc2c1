//! Register allocation for a register-based VM with narrow register encodings.
//!
//! The entry point is [regalloc::LinearScanRegisterAllocator], which maps the SSA values of a
//! [ir::Method] onto VM registers, inserting the moves needed to satisfy per-instruction register
//! limits, wide values, and consecutive-register groups.

#![allow(clippy::type_complexity)]
#![allow(clippy::comparison_chain)]

pub mod config;
pub mod errors;
pub mod ir;
pub(crate) mod log;
pub mod regalloc;

pub use self::config::Config;
pub use self::errors::CompilationError;
pub use self::regalloc::{AllocatedMethod, LinearScanRegisterAllocator, RegisterAllocator};

use log::{stats::Stats, Log};
use std::sync::LazyLock;

pub(crate) static LOG: LazyLock<Log> = LazyLock::new(|| match Log::new() {
    Ok(x) => x,
    Err(e) => panic!("{e}"),
});

pub(crate) static STATS: LazyLock<Stats> = LazyLock::new(Stats::new);

/// Write out allocation statistics, if `DXALLOC_LOG_STATS` is set.
pub fn output_stats() {
    STATS.output();
}
