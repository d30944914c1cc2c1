//! Allocation options and the VM bug workarounds they imply.

use crate::errors::CompilationError;
use std::env;

/// The first API level without the overlapping long register bug (and the `cmp-long` variant of
/// it).
const API_LOLLIPOP: u32 = 21;
/// The first API level whose verifier doesn't make assumptions about the type of the value in the
/// receiver register.
const API_MARSHMALLOW: u32 = 23;
/// The first API level whose debugger doesn't need the receiver to stay alive.
const API_Q: u32 = 29;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The lowest VM API level the output must run on. VM bug workarounds are enabled based on
    /// this.
    pub min_api_level: u32,
    /// Produce debug info, keeping source-level locals alive across blocks.
    pub debug: bool,
    /// Try the optimistic allocation mode which keeps arguments in their incoming registers
    /// before falling back to the exhaustive mode.
    pub allow_argument_reuse: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_api_level: 1,
            debug: false,
            allow_argument_reuse: true,
        }
    }
}

impl Config {
    pub fn new(min_api_level: u32, debug: bool, allow_argument_reuse: bool) -> Self {
        Self {
            min_api_level,
            debug,
            allow_argument_reuse,
        }
    }

    /// Create a [Config] from the `DXALLOC_MIN_API`, `DXALLOC_DEBUG`, and `DXALLOC_ARG_REUSE`
    /// environment variables. Variables which are not set take their [Default] value.
    pub fn from_env() -> Result<Self, CompilationError> {
        let mut c = Self::default();
        if let Ok(x) = env::var("DXALLOC_MIN_API") {
            c.min_api_level = x.parse::<u32>().map_err(|e| {
                CompilationError::General(format!("Invalid DXALLOC_MIN_API '{x}': {e}"))
            })?;
        }
        if let Ok(x) = env::var("DXALLOC_DEBUG") {
            c.debug = parse_bool("DXALLOC_DEBUG", &x)?;
        }
        if let Ok(x) = env::var("DXALLOC_ARG_REUSE") {
            c.allow_argument_reuse = parse_bool("DXALLOC_ARG_REUSE", &x)?;
        }
        Ok(c)
    }

    /// Does the VM mis-execute long arithmetic whose result partially overlaps one of its
    /// operands?
    pub fn has_overlapping_long_register_bug(&self) -> bool {
        self.min_api_level < API_LOLLIPOP
    }

    /// Does the VM mis-execute `cmp-long` when the result overlaps an operand?
    pub fn has_cmp_long_overlap_bug(&self) -> bool {
        self.min_api_level < API_LOLLIPOP
    }

    /// Does the verifier reject non-object values in the receiver's register?
    pub fn has_receiver_type_verifier_bug(&self) -> bool {
        self.min_api_level < API_MARSHMALLOW
    }

    /// Must the receiver stay in its register for the whole method?
    pub fn keep_receiver_alive(&self) -> bool {
        self.debug && self.min_api_level < API_Q
    }
}

fn parse_bool(var: &str, s: &str) -> Result<bool, CompilationError> {
    match s {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(CompilationError::General(format!(
            "{var} must be one of '0', '1', 'false', or 'true', not '{s}'"
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn workarounds() {
        let c = Config::new(19, true, true);
        assert!(c.has_overlapping_long_register_bug());
        assert!(c.has_receiver_type_verifier_bug());
        assert!(c.keep_receiver_alive());
        let c = Config::new(23, false, true);
        assert!(!c.has_cmp_long_overlap_bug());
        assert!(!c.has_receiver_type_verifier_bug());
        assert!(!c.keep_receiver_alive());
        assert!(!Config::new(29, true, true).keep_receiver_alive());
    }

    #[test]
    fn bools() {
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(parse_bool("X", "yes").is_err());
    }
}
