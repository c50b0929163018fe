//! Overflow-poisoning integer arithmetic.
//!
//! Every size, index, and step count the interpreter composes flows through
//! [`SafeInt`], a 64-bit signed integer with one reserved bit pattern for
//! "invalid". Overflow, division by zero, and out-of-range conversions all
//! produce invalid, and invalid is contagious through arithmetic, so a
//! poisoned computation can be detected once at the end instead of checked
//! at every step.

use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, Div, Mul, Neg, Sub};

/// The reserved pattern. Doubles as the minimum, which closes the space
/// under negation.
const INVALID_BITS: i64 = i64::MIN;

/// A checked 64-bit signed integer with an explicit invalid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SafeInt(i64);

impl SafeInt {
    /// The invalid value.
    pub const INVALID: Self = Self(INVALID_BITS);
    /// Zero.
    pub const ZERO: Self = Self(0);
    /// The largest representable value.
    pub const MAX: Self = Self(i64::MAX);

    const fn wrap(v: i64) -> Self {
        if v == INVALID_BITS {
            Self::INVALID
        } else {
            Self(v)
        }
    }

    /// Whether this value is not the reserved pattern.
    pub const fn valid(self) -> bool {
        self.0 != INVALID_BITS
    }

    /// The contained value, or `None` when invalid.
    pub const fn get(self) -> Option<i64> {
        if self.valid() {
            Some(self.0)
        } else {
            None
        }
    }

    /// Convert to any fixed-width integer type. Invalid input or an
    /// out-of-range value yields `None`.
    pub fn to<T: TryFrom<i64>>(self) -> Option<T> {
        T::try_from(self.get()?).ok()
    }

    /// Positive part: `self` when valid and non-negative, else `None`.
    pub fn non_negative(self) -> Option<i64> {
        match self.get() {
            Some(v) if v >= 0 => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for SafeInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(v) => write!(f, "{v}"),
            None => f.write_str("invalid"),
        }
    }
}

impl Default for SafeInt {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Invalid values are unordered; everything else orders numerically.
impl PartialOrd for SafeInt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.get()?.cmp(&other.get()?))
    }
}

macro_rules! safe_int_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for SafeInt {
            fn from(v: $t) -> Self {
                Self::wrap(i64::from(v))
            }
        }
    )*};
}

safe_int_from_signed!(i8, i16, i32, u8, u16, u32);

impl From<i64> for SafeInt {
    /// `i64::MIN` is the reserved pattern and converts to invalid.
    fn from(v: i64) -> Self {
        Self::wrap(v)
    }
}

macro_rules! safe_int_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for SafeInt {
            /// Values exceeding the signed maximum convert to invalid.
            fn from(v: $t) -> Self {
                i64::try_from(v).map_or(Self::INVALID, Self::wrap)
            }
        }
    )*};
}

safe_int_from_unsigned!(u64, usize, u128);

impl From<isize> for SafeInt {
    fn from(v: isize) -> Self {
        i64::try_from(v).map_or(Self::INVALID, Self::wrap)
    }
}

impl Add for SafeInt {
    type Output = SafeInt;

    fn add(self, rhs: Self) -> Self {
        match (self.get(), rhs.get()) {
            (Some(a), Some(b)) => a.checked_add(b).map_or(Self::INVALID, Self::wrap),
            _ => Self::INVALID,
        }
    }
}

impl Sub for SafeInt {
    type Output = SafeInt;

    fn sub(self, rhs: Self) -> Self {
        match (self.get(), rhs.get()) {
            (Some(a), Some(b)) => a.checked_sub(b).map_or(Self::INVALID, Self::wrap),
            _ => Self::INVALID,
        }
    }
}

impl Mul for SafeInt {
    type Output = SafeInt;

    fn mul(self, rhs: Self) -> Self {
        match (self.get(), rhs.get()) {
            (Some(a), Some(b)) => a.checked_mul(b).map_or(Self::INVALID, Self::wrap),
            _ => Self::INVALID,
        }
    }
}

impl Div for SafeInt {
    type Output = SafeInt;

    /// Division by zero yields invalid.
    fn div(self, rhs: Self) -> Self {
        match (self.get(), rhs.get()) {
            (Some(a), Some(b)) => a.checked_div(b).map_or(Self::INVALID, Self::wrap),
            _ => Self::INVALID,
        }
    }
}

impl Neg for SafeInt {
    type Output = SafeInt;

    fn neg(self) -> Self {
        match self.get() {
            Some(v) => v.checked_neg().map_or(Self::INVALID, Self::wrap),
            None => Self::INVALID,
        }
    }
}
