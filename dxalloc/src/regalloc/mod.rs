//! Register allocation.
//!
//! This module:
//!  - describes the generic interface to register allocators.
//!  - contains the linear scan register allocator and the pieces it is built from.

use crate::{
    errors::CompilationError,
    ir::{Method, ValueIdx},
};
use std::fmt;
use strum::Display;

pub mod debug_info;
mod linear_scan;
pub mod live_intervals;
pub mod liveness;
pub mod move_scheduler;
pub mod register_positions;
pub mod spill_moves;

pub use linear_scan::{ArgumentReuseMode, LinearScanRegisterAllocator};

/// Why an allocation attempt was abandoned in favour of a more general mode.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Restart {
    /// Some interval would have had to be split or spilled, which the mode does not allow.
    #[strum(to_string = "needs spill or split")]
    NeedsSpillOrSplit,
    /// More registers are needed than the mode can address.
    #[strum(to_string = "register ceiling exceeded")]
    RegisterCeiling,
}

/// The API to register allocators.
pub trait RegisterAllocator {
    /// Allocate registers for every value in the method, inserting whatever moves are needed.
    fn allocate_registers(&mut self) -> Result<(), CompilationError>;

    /// The method, including any instructions inserted by [Self::allocate_registers].
    fn method(&self) -> &Method;

    /// How many registers does the allocated method need?
    ///
    /// # Panics
    ///
    /// If registers have not been allocated.
    fn registers_used(&self) -> u32;

    /// The register holding `value` at `position`, or `None` if `value` is not live in a
    /// register there (i.e. it is dead, or a rematerialised constant).
    ///
    /// # Panics
    ///
    /// If registers have not been allocated.
    fn try_register_for_value(&self, value: ValueIdx, position: u32) -> Option<u32>;

    /// The register holding `value` at `position`.
    ///
    /// # Panics
    ///
    /// If registers have not been allocated or `value` is not in a register at `position`.
    fn register_for_value(&self, value: ValueIdx, position: u32) -> u32 {
        match self.try_register_for_value(value, position) {
            Some(r) => r,
            None => panic!("{value} is not in a register at {position}"),
        }
    }
}

/// A method whose registers have been allocated, displayed with every operand's register.
pub struct AllocatedMethod<'a, R: RegisterAllocator + ?Sized> {
    ra: &'a R,
}

impl<'a, R: RegisterAllocator + ?Sized> AllocatedMethod<'a, R> {
    pub fn new(ra: &'a R) -> Self {
        Self { ra }
    }
}

impl<R: RegisterAllocator + ?Sized> fmt::Display for AllocatedMethod<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regs = |v: ValueIdx, pos: u32| self.ra.try_register_for_value(v, pos);
        write!(f, "{}", self.ra.method().display_allocated(&regs))?;
        writeln!(f, "registers: {}", self.ra.registers_used())
    }
}
