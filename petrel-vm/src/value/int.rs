//! Integers: a word-sized fast path promoting to big integers on overflow.

use core::cmp::Ordering;
use core::fmt;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::RuntimeError;

/// Maximum shift count, bits.
pub const MAX_SHIFT: i64 = 512;

/// A Petrel integer.
///
/// Values that fit a word are stored inline; the big representation is only
/// ever used for values that do not, so the two variants never alias one
/// number and structural equality is well defined.
#[derive(Clone)]
pub enum Int {
    /// Fits `i64`.
    Small(i64),
    /// Does not fit `i64`.
    Big(Arc<BigInt>),
}

impl Int {
    /// Normalising constructor.
    pub fn from_bigint(v: BigInt) -> Self {
        match v.to_i64() {
            Some(small) => Self::Small(small),
            None => Self::Big(Arc::new(v)),
        }
    }

    /// Widen to a big integer, cloning the small path.
    pub fn to_bigint(&self) -> BigInt {
        match self {
            Self::Small(v) => BigInt::from(*v),
            Self::Big(v) => v.as_ref().clone(),
        }
    }

    /// The value as `i64`, when it fits.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Small(v) => Some(*v),
            Self::Big(_) => None,
        }
    }

    /// The value as `f64`; fails when the magnitude exceeds the float range.
    pub fn to_f64(&self) -> Result<f64, RuntimeError> {
        let f = match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Small(v) => *v as f64,
            Self::Big(v) => v.to_f64().unwrap_or(f64::INFINITY),
        };
        if f.is_finite() {
            Ok(f)
        } else {
            Err(RuntimeError::FloatOverflow)
        }
    }

    /// Whether the value is zero.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Small(0))
    }

    /// Sign: -1, 0, or 1.
    pub fn signum(&self) -> i32 {
        match self {
            Self::Small(v) => match v.cmp(&0) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            },
            Self::Big(v) => {
                if v.is_negative() {
                    -1
                } else {
                    1
                }
            }
        }
    }

    /// Number of 64-bit limbs in the magnitude; at least 1.
    pub fn limbs(&self) -> u64 {
        match self {
            Self::Small(_) => 1,
            Self::Big(v) => v.bits().div_ceil(64).max(1),
        }
    }

    /// `self + other`.
    pub fn add(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => match a.checked_add(*b) {
                Some(v) => Self::Small(v),
                None => Self::from_bigint(BigInt::from(*a) + BigInt::from(*b)),
            },
            _ => Self::from_bigint(self.to_bigint() + other.to_bigint()),
        }
    }

    /// `self - other`.
    pub fn sub(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => match a.checked_sub(*b) {
                Some(v) => Self::Small(v),
                None => Self::from_bigint(BigInt::from(*a) - BigInt::from(*b)),
            },
            _ => Self::from_bigint(self.to_bigint() - other.to_bigint()),
        }
    }

    /// `self * other`.
    pub fn mul(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => match a.checked_mul(*b) {
                Some(v) => Self::Small(v),
                None => Self::from_bigint(BigInt::from(*a) * BigInt::from(*b)),
            },
            _ => Self::from_bigint(self.to_bigint() * other.to_bigint()),
        }
    }

    /// Floor division, Python sign semantics.
    pub fn floor_div(&self, other: &Self) -> Result<Self, RuntimeError> {
        if other.is_zero() {
            return Err(RuntimeError::DivisionByZero);
        }
        if let (Self::Small(a), Self::Small(b)) = (self, other) {
            // Only i64::MIN // -1 escapes the word range.
            if *a == i64::MIN && *b == -1 {
                return Ok(Self::from_bigint(-BigInt::from(*a)));
            }
            return Ok(Self::Small(floor_div_i64(*a, *b)));
        }
        let (a, b) = (self.to_bigint(), other.to_bigint());
        let q = &a / &b;
        let r = &a % &b;
        let q = if !r.is_zero() && (r.is_negative() != b.is_negative()) {
            q - BigInt::from(1)
        } else {
            q
        };
        Ok(Self::from_bigint(q))
    }

    /// Modulo, Python sign semantics: the result has the divisor's sign.
    pub fn rem(&self, other: &Self) -> Result<Self, RuntimeError> {
        if other.is_zero() {
            return Err(RuntimeError::DivisionByZero);
        }
        if let (Self::Small(a), Self::Small(b)) = (self, other) {
            if *a != i64::MIN || *b != -1 {
                let r = a.wrapping_rem(*b);
                let r = if r != 0 && (r < 0) != (*b < 0) {
                    r.wrapping_add(*b)
                } else {
                    r
                };
                return Ok(Self::Small(r));
            }
            return Ok(Self::Small(0));
        }
        let (a, b) = (self.to_bigint(), other.to_bigint());
        let r = &a % &b;
        let r = if !r.is_zero() && (r.is_negative() != b.is_negative()) {
            r + &b
        } else {
            r
        };
        Ok(Self::from_bigint(r))
    }

    /// Unary negation.
    pub fn neg(&self) -> Self {
        match self {
            Self::Small(v) => match v.checked_neg() {
                Some(n) => Self::Small(n),
                None => Self::from_bigint(-BigInt::from(*v)),
            },
            Self::Big(v) => Self::from_bigint(-v.as_ref().clone()),
        }
    }

    /// Bitwise complement: `~x == -x - 1`.
    pub fn invert(&self) -> Self {
        self.neg().sub(&Self::Small(1))
    }

    /// Bitwise and, two's-complement semantics.
    pub fn bitand(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => Self::Small(a & b),
            _ => Self::from_bigint(self.to_bigint() & other.to_bigint()),
        }
    }

    /// Bitwise or.
    pub fn bitor(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => Self::Small(a | b),
            _ => Self::from_bigint(self.to_bigint() | other.to_bigint()),
        }
    }

    /// Bitwise exclusive or.
    pub fn bitxor(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => Self::Small(a ^ b),
            _ => Self::from_bigint(self.to_bigint() ^ other.to_bigint()),
        }
    }

    /// Left shift; the count is bounded by [`MAX_SHIFT`].
    pub fn shl(&self, count: i64) -> Result<Self, RuntimeError> {
        let count = check_shift(count)?;
        Ok(Self::from_bigint(self.to_bigint() << count))
    }

    /// Arithmetic right shift (rounds toward negative infinity).
    pub fn shr(&self, count: i64) -> Result<Self, RuntimeError> {
        let count = check_shift(count)?;
        Ok(Self::from_bigint(self.to_bigint() >> count))
    }

    /// Order against another integer.
    pub fn cmp_int(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Small(a), Self::Small(b)) => a.cmp(b),
            // A big value never fits a word, so its sign decides.
            (Self::Small(_), Self::Big(b)) => {
                if b.is_negative() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (Self::Big(a), Self::Small(_)) => {
                if a.is_negative() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (Self::Big(a), Self::Big(b)) => a.as_ref().cmp(b.as_ref()),
        }
    }
}

fn check_shift(count: i64) -> Result<usize, RuntimeError> {
    if count < 0 {
        return Err(RuntimeError::NegativeShift);
    }
    if count >= MAX_SHIFT {
        return Err(RuntimeError::LargeShift { count });
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(count as usize)
}

fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) {
        q.wrapping_sub(1)
    } else {
        q
    }
}

impl PartialEq for Int {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_int(other) == Ordering::Equal
    }
}

impl Eq for Int {}

impl fmt::Display for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(v) => v.fmt(f),
            Self::Big(v) => v.fmt(f),
        }
    }
}

impl fmt::Debug for Int {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<i64> for Int {
    fn from(v: i64) -> Self {
        Self::Small(v)
    }
}

impl From<i32> for Int {
    fn from(v: i32) -> Self {
        Self::Small(i64::from(v))
    }
}

impl From<u64> for Int {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(small) => Self::Small(small),
            Err(_) => Self::Big(Arc::new(BigInt::from(v))),
        }
    }
}

impl From<BigInt> for Int {
    fn from(v: BigInt) -> Self {
        Self::from_bigint(v)
    }
}

/// Deterministic step cost of an n-limb by m-limb multiplication:
/// `3^ceil(log2(max(n, m)))`, an integer upper bound of the Karatsuba
/// `n^log2(3)` curve (and of anything faster the backend uses).
pub(crate) fn mul_step_cost(n: u64, m: u64) -> u64 {
    let n = n.max(m).max(1);
    let ceil_log2 = 64 - n.saturating_sub(1).leading_zeros();
    3u64.saturating_pow(ceil_log2)
}

/// Step cost of an n-limb by m-limb division or modulo: schoolbook `n · m`.
pub(crate) fn div_step_cost(n: u64, m: u64) -> u64 {
    n.max(1).saturating_mul(m.max(1))
}
