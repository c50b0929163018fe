//! Pessimistic allocation pricing.
//!
//! The estimator does not try to be accurate; it bounds the real retained
//! cost from above, rounded to the allocator's class sizes, so a program
//! that stays within its budget as measured here stays within the host
//! process's real memory by a constant factor. Budgets are debited with the
//! estimate *before* a value is materialised.

use core::mem;

use crate::checked::SafeInt;
use crate::consts::{
    ALLOC_HEADER, MAP_BASE, MAP_ENTRY_OVERHEAD, MEDIUM_ALLOC_MAX, MIN_ALLOC, PAGE_SIZE,
    SMALL_ALLOC_MAX, SMALL_ALLOC_STEP,
};
use crate::value::Value;

/// Round a byte count up to the modelled allocator class.
///
/// Zero stays zero; any other request is at least [`MIN_ALLOC`]. Small
/// requests round to the next [`SMALL_ALLOC_STEP`] multiple, medium requests
/// to the next power of two, large requests to a page boundary. Invalid or
/// negative input poisons the result.
pub fn round_alloc(size: SafeInt) -> SafeInt {
    let Some(s) = size.non_negative() else {
        return SafeInt::INVALID;
    };
    if s == 0 {
        return SafeInt::ZERO;
    }
    #[allow(clippy::cast_sign_loss)]
    let s = (s as u64).max(MIN_ALLOC);
    let rounded = if s <= SMALL_ALLOC_MAX {
        round_up(s, SMALL_ALLOC_STEP)
    } else if s <= MEDIUM_ALLOC_MAX {
        s.next_power_of_two()
    } else {
        round_up(s, PAGE_SIZE)
    };
    SafeInt::from(rounded)
}

fn round_up(s: u64, to: u64) -> u64 {
    s.div_ceil(to).saturating_mul(to)
}

/// Shape of a container to be constructed, taken from a one-element-or-empty
/// template. See [`estimate_make`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeTemplate {
    /// An ordered sequence of fixed-size elements.
    Sequence {
        /// Inline element size, bytes.
        elem_size: u64,
        /// Per-element indirect cost: heap retained behind each element.
        elem_indirect: u64,
    },
    /// A key→value mapping.
    Mapping {
        /// Inline key size, bytes.
        key_size: u64,
        /// Inline value size, bytes.
        value_size: u64,
    },
    /// A bounded channel of host values.
    Channel {
        /// Inline element size, bytes.
        elem_size: u64,
        /// Channel capacity, elements.
        cap: u64,
    },
}

impl MakeTemplate {
    /// Sequence template with elements of type `T` and no indirect cost.
    pub fn sequence_of<T>() -> Self {
        Self::Sequence {
            elem_size: mem::size_of::<T>() as u64,
            elem_indirect: 0,
        }
    }

    /// Mapping template with keys and values of the interpreter's value
    /// representation.
    pub fn mapping_of_values() -> Self {
        Self::Mapping {
            key_size: mem::size_of::<Value>() as u64,
            value_size: mem::size_of::<Value>() as u64,
        }
    }

    /// Derive a template from a one-element-or-empty container value.
    ///
    /// # Panics
    ///
    /// Any template kind other than a sequence or a mapping is a programming
    /// error and panics. (Channel templates describe host values and are
    /// constructed directly.)
    pub fn from_value(template: &Value) -> Self {
        let elem = mem::size_of::<Value>() as u64;
        match template {
            Value::List(l) => Self::Sequence {
                elem_size: elem,
                elem_indirect: l
                    .sample_element()
                    .map(|v| estimate(&v).non_negative().unwrap_or(0))
                    .map(|n| {
                        #[allow(clippy::cast_sign_loss)]
                        {
                            n as u64
                        }
                    })
                    .unwrap_or(0),
            },
            Value::Tuple(items) => Self::Sequence {
                elem_size: elem,
                elem_indirect: items
                    .first()
                    .map(|v| estimate(v).non_negative().unwrap_or(0))
                    .map(|n| {
                        #[allow(clippy::cast_sign_loss)]
                        {
                            n as u64
                        }
                    })
                    .unwrap_or(0),
            },
            Value::Dict(_) => Self::mapping_of_values(),
            other => panic!(
                "estimate_make: template must be a sequence or mapping, got {}",
                other.type_name()
            ),
        }
    }
}

/// Pessimistic cost to construct a container of `n` elements shaped like
/// `template`.
///
/// Sequences cost `round(n · elem) + n · indirect`; mappings follow the
/// affine `k1·n + k2` model with `k1` derived from the entry size at the
/// modelled load factor; channels cost a header plus their rounded backing
/// ring. The constants are documented in DESIGN.md; the invariant preserved
/// is `model(n) ≥ actual(n)`.
pub fn estimate_make(template: &MakeTemplate, n: SafeInt) -> SafeInt {
    let Some(n) = n.non_negative() else {
        return SafeInt::INVALID;
    };
    let n = SafeInt::from(n);
    match *template {
        MakeTemplate::Sequence {
            elem_size,
            elem_indirect,
        } => {
            round_alloc(n * SafeInt::from(elem_size)) + n * SafeInt::from(elem_indirect)
        }
        MakeTemplate::Mapping {
            key_size,
            value_size,
        } => {
            let entry = SafeInt::from(key_size)
                + SafeInt::from(value_size)
                + SafeInt::from(MAP_ENTRY_OVERHEAD);
            let entry = round_alloc_small(entry);
            // 8/7, rounded up, covers the table's 7/8 maximum load factor.
            let k1 = (entry * SafeInt::from(8u64) + SafeInt::from(6u64)) / SafeInt::from(7u64);
            k1 * n + SafeInt::from(MAP_BASE)
        }
        MakeTemplate::Channel { elem_size, cap } => {
            SafeInt::from(ALLOC_HEADER)
                + round_alloc(SafeInt::from(cap) * SafeInt::from(elem_size))
        }
    }
}

/// Round to the small-class granularity without the medium/large model;
/// used for per-entry coefficients that are summed before rounding.
fn round_alloc_small(size: SafeInt) -> SafeInt {
    match size.non_negative() {
        Some(0) => SafeInt::ZERO,
        #[allow(clippy::cast_sign_loss)]
        Some(s) => SafeInt::from(round_up((s as u64).max(MIN_ALLOC), SMALL_ALLOC_STEP)),
        None => SafeInt::INVALID,
    }
}

/// Pessimistic byte count of the heap retained by the value graph reachable
/// from `v`.
///
/// Shared nodes are visited once: the walk tracks pointer identities, so
/// cyclic graphs terminate and diamonds are not double-counted. Foreign
/// values that know their own footprint override the default traversal.
pub fn estimate(v: &Value) -> SafeInt {
    let mut visited = hashbrown::HashSet::new();
    crate::value::retained_size(v, &mut visited)
}
