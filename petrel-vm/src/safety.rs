//! Capability flags negotiated between a thread and each callable.
//!
//! A thread declares the guarantees it requires; every callable advertises
//! the guarantees it honours. A call is admitted only when the advertised
//! set is a superset of the required set. The advertised set of a value is
//! fixed at construction.

use core::fmt;

use crate::error::SafetyError;

bitflags::bitflags! {
    /// The capability set. Bits above the legal mask are rejected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Safety: u8 {
        /// The callable honours allocation budgets.
        const MEM = 1 << 0;
        /// The callable honours step budgets.
        const CPU = 1 << 1;
        /// The callable does not block unboundedly.
        const TIME = 1 << 2;
        /// The callable has no external side effects.
        const IO = 1 << 3;
    }
}

impl Safety {
    /// Every flag set; the guarantee interpreted code provides by
    /// construction.
    pub const SAFE: Self = Self::all();

    /// Parse a raw bit pattern, rejecting bits above the legal mask.
    pub fn try_from_bits(bits: u8) -> Result<Self, SafetyError> {
        Self::from_bits(bits).ok_or(SafetyError::IllegalFlags { bits })
    }

    /// Names of the set flags, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }

    /// Whether this advertised set satisfies `required`.
    pub const fn permits(self, required: Self) -> bool {
        self.contains(required)
    }

    /// Like [`Safety::permits`], but produces the error naming the missing
    /// flags. The error is per-call and does not cancel the thread.
    pub fn check_permits(self, required: Safety) -> Result<(), SafetyError> {
        let missing = required.difference(self);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SafetyError::MissingSafety { missing })
        }
    }
}

impl fmt::Display for Safety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(name)?;
        }
        Ok(())
    }
}
