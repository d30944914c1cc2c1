//! The errors that register allocation can report to its caller.

use thiserror::Error;

/// The ways in which allocating registers for a method can fail.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Allocation failed for reasons that are likely to be of interest to the producer of the
    /// input (e.g. the textual IR could not be parsed).
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong during allocation that is probably the result of a bug in dxalloc.
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A hard limit of the target was exceeded (e.g. a method needs more than 65536 registers).
    LimitExceeded(String),
    #[error("Incomplete phi: {0}")]
    /// A value is used without being defined on all paths into its use, or a phi's operands do
    /// not match its block's predecessors. This indicates malformed input.
    IncompletePhi(String),
    #[error("Misplaced move-exception: {0}")]
    /// A `move_exception` appeared somewhere other than as the first instruction of a block.
    MisplacedMoveException(String),
    #[error("Invoke argument mismatch: {0}")]
    /// The registers passed to an invoke do not match those required by its signature.
    InvokeArgumentMismatch(String),
}
