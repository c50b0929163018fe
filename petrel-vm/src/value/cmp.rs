//! Equality, ordering, and hashing over the value taxonomy.
//!
//! Hashes are deterministic across runs and processes; the language never
//! exposes hash-dependent iteration order, but stable hashes keep replayed
//! executions bit-identical. Numeric values hash and compare by mathematical
//! value, so `1`, and `1.0` are one dict key.

use core::cmp::Ordering;
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::FromPrimitive;

use crate::consts::MAX_COMPARE_DEPTH;
use crate::error::RuntimeError;
use crate::value::{Int, Value};

const HASH_NONE: u64 = 0x23d6_7588_60d9_b1ef;
const HASH_FALSE: u64 = 0x8c9f_5f6b_0d2f_0b1d;
const HASH_TRUE: u64 = 0x4b5c_19f1_9c0b_77a3;
const HASH_NAN: u64 = 0x6e6f_7420_6120_6e75;

/// 64-bit FNV-1a.
fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn splitmix64(v: u64) -> u64 {
    let mut z = v.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[allow(clippy::cast_sign_loss)]
fn hash_i64(v: i64) -> u64 {
    splitmix64(v as u64)
}

fn hash_big(v: &BigInt) -> u64 {
    let (sign, digits) = v.to_u64_digits();
    let mut h = fnv1a(digits.iter().flat_map(|d| d.to_le_bytes()));
    if sign == num_bigint::Sign::Minus {
        h = !h;
    }
    h
}

/// Hash a value, or report it unhashable.
pub fn hash_value(v: &Value) -> Result<u64, RuntimeError> {
    match v {
        Value::None => Ok(HASH_NONE),
        Value::Bool(false) => Ok(HASH_FALSE),
        Value::Bool(true) => Ok(HASH_TRUE),
        Value::Int(Int::Small(v)) => Ok(hash_i64(*v)),
        Value::Int(Int::Big(v)) => Ok(hash_big(v)),
        Value::Float(f) => Ok(hash_float(*f)),
        Value::Str(s) => Ok(fnv1a(s.bytes())),
        Value::Tuple(items) => {
            let mut h: u64 = 0x345f_91d2_7f6e_2c11;
            for item in items.iter() {
                h = splitmix64(h ^ hash_value(item)?);
            }
            Ok(h)
        }
        Value::Function(c) => Ok(splitmix64(Arc::as_ptr(c) as usize as u64)),
        Value::Native(n) => Ok(splitmix64(Arc::as_ptr(n) as *const () as usize as u64)),
        Value::Foreign(f) => f.hash_code().ok_or(RuntimeError::Unhashable {
            type_name: f.type_name(),
        }),
        other => Err(RuntimeError::Unhashable {
            type_name: other.type_name(),
        }),
    }
}

/// Integral floats hash like the equal integer; everything else hashes its
/// normalised bit pattern.
fn hash_float(f: f64) -> u64 {
    if f.is_nan() {
        return HASH_NAN;
    }
    let f = if f == 0.0 { 0.0 } else { f };
    if f == f.trunc() && !f.is_infinite() {
        #[allow(clippy::cast_possible_truncation)]
        if f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
            return hash_i64(f as i64);
        }
        if let Some(b) = BigInt::from_f64(f) {
            return hash_big(&b);
        }
    }
    splitmix64(f.to_bits())
}

/// Structural equality with a recursion budget against cyclic graphs.
pub fn values_equal(a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    eq_at(a, b, MAX_COMPARE_DEPTH)
}

/// Equality restricted to hashable values, which cannot fail or recurse
/// unboundedly. Used for dictionary keys.
pub(crate) fn values_equal_infallible(a: &Value, b: &Value) -> bool {
    eq_at(a, b, MAX_COMPARE_DEPTH).unwrap_or(false)
}

fn eq_at(a: &Value, b: &Value, depth: usize) -> Result<bool, RuntimeError> {
    if depth == 0 {
        return Err(RuntimeError::ComparisonDepth);
    }
    Ok(match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
            int_float_cmp(i, *f).map(Ordering::is_eq).unwrap_or(false)
        }
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b, depth)?,
        (Value::List(a), Value::List(b)) => {
            if Arc::ptr_eq(a, b) {
                true
            } else {
                let xs = a.snapshot();
                let ys = b.snapshot();
                seq_eq(&xs, &ys, depth)?
            }
        }
        (Value::Dict(a), Value::Dict(b)) => {
            if Arc::ptr_eq(a, b) {
                true
            } else if a.len() != b.len() {
                false
            } else {
                let mut same = true;
                for (k, v) in a.snapshot() {
                    match b.get(&k)? {
                        Some(other) if eq_at(&v, &other, depth - 1)? => {}
                        _ => {
                            same = false;
                            break;
                        }
                    }
                }
                same
            }
        }
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
        (Value::Native(a), Value::Native(b)) => {
            std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
        }
        (Value::Foreign(a), Value::Foreign(b)) => {
            std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
        }
        _ => false,
    })
}

fn seq_eq(xs: &[Value], ys: &[Value], depth: usize) -> Result<bool, RuntimeError> {
    if xs.len() != ys.len() {
        return Ok(false);
    }
    for (x, y) in xs.iter().zip(ys) {
        if !eq_at(x, y, depth - 1)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Exact mathematical order between an integer and a float. `None` for NaN.
fn int_float_cmp(i: &Int, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f == f64::INFINITY {
        return Some(Ordering::Less);
    }
    if f == f64::NEG_INFINITY {
        return Some(Ordering::Greater);
    }
    let floor = BigInt::from_f64(f.floor())?;
    let i = i.to_bigint();
    Some(match i.cmp(&floor) {
        Ordering::Less => Ordering::Less,
        Ordering::Greater => Ordering::Greater,
        // i == floor(f): equal unless f carries a fraction.
        Ordering::Equal => {
            if f == f.floor() {
                Ordering::Equal
            } else {
                Ordering::Less
            }
        }
    })
}

/// Three-way ordered comparison. Defined over numbers, strings, and
/// same-kind sequences; everything else is not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Result<Ordering, RuntimeError> {
    cmp_at(a, b, MAX_COMPARE_DEPTH)
}

fn cmp_at(a: &Value, b: &Value, depth: usize) -> Result<Ordering, RuntimeError> {
    if depth == 0 {
        return Err(RuntimeError::ComparisonDepth);
    }
    let unordered = || RuntimeError::NotComparable {
        left: a.type_name(),
        right: b.type_name(),
    };
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp_int(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).ok_or_else(unordered),
        (Value::Int(i), Value::Float(f)) => int_float_cmp(i, *f).ok_or_else(unordered),
        (Value::Float(f), Value::Int(i)) => int_float_cmp(i, *f)
            .map(Ordering::reverse)
            .ok_or_else(unordered),
        (Value::Str(x), Value::Str(y)) => Ok(x.as_ref().cmp(y.as_ref())),
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y, depth),
        (Value::List(x), Value::List(y)) => {
            let xs = x.snapshot();
            let ys = y.snapshot();
            seq_cmp(&xs, &ys, depth)
        }
        _ => Err(unordered()),
    }
}

fn seq_cmp(xs: &[Value], ys: &[Value], depth: usize) -> Result<Ordering, RuntimeError> {
    for (x, y) in xs.iter().zip(ys) {
        match cmp_at(x, y, depth - 1)? {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(xs.len().cmp(&ys.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::List;

    #[test]
    fn numeric_values_unify() {
        assert!(values_equal(&Value::from(1i64), &Value::Float(1.0)).unwrap());
        assert!(!values_equal(&Value::from(1i64), &Value::Float(1.5)).unwrap());
        assert_eq!(
            hash_value(&Value::from(7i64)).unwrap(),
            hash_value(&Value::Float(7.0)).unwrap()
        );
    }

    #[test]
    fn huge_integral_floats_match_big_ints() {
        let big = Value::Int(Int::from(1u64 << 63).mul(&Int::from(2i64)));
        let f = Value::Float(2f64.powi(64));
        assert!(values_equal(&big, &f).unwrap());
        assert_eq!(hash_value(&big).unwrap(), hash_value(&f).unwrap());
    }

    #[test]
    fn string_and_sequence_order() {
        assert_eq!(
            compare_values(&Value::from("abc"), &Value::from("abd")).unwrap(),
            Ordering::Less
        );
        let a = Value::Tuple(Arc::from(vec![Value::from(1i64), Value::from(2i64)]));
        let b = Value::Tuple(Arc::from(vec![Value::from(1i64)]));
        assert_eq!(compare_values(&a, &b).unwrap(), Ordering::Greater);
    }

    #[test]
    fn mixed_kinds_are_not_comparable() {
        assert!(matches!(
            compare_values(&Value::from(1i64), &Value::from("1")),
            Err(RuntimeError::NotComparable { left: "int", right: "string" })
        ));
        assert!(matches!(
            compare_values(&Value::Bool(true), &Value::Bool(false)),
            Err(RuntimeError::NotComparable { .. })
        ));
    }

    #[test]
    fn nan_is_equal_to_nothing_and_unordered() {
        let nan = Value::Float(f64::NAN);
        assert!(!values_equal(&nan, &nan).unwrap());
        assert!(compare_values(&nan, &Value::from(1i64)).is_err());
    }

    #[test]
    fn dict_equality_is_order_insensitive() {
        use crate::value::Dict;
        let a = Dict::new();
        a.insert(Value::from("x"), Value::from(1i64)).unwrap();
        a.insert(Value::from("y"), Value::from(2i64)).unwrap();
        let b = Dict::new();
        b.insert(Value::from("y"), Value::from(2i64)).unwrap();
        b.insert(Value::from("x"), Value::from(1i64)).unwrap();
        assert!(values_equal(
            &Value::Dict(Arc::new(a)),
            &Value::Dict(Arc::new(b))
        )
        .unwrap());
    }

    #[test]
    fn deep_cycles_surface_a_depth_error() {
        let l = Arc::new(List::from_values(vec![]));
        l.append(Value::List(Arc::clone(&l))).unwrap();
        let v = Value::List(l);
        assert!(matches!(
            values_equal(&v, &v.clone()),
            Err(RuntimeError::ComparisonDepth) | Ok(true)
        ));
    }

    #[test]
    fn hashes_are_stable() {
        // Pinned values guard against accidental hasher changes that would
        // break replay determinism.
        assert_eq!(hash_value(&Value::from("")).unwrap(), 0xcbf2_9ce4_8422_2325);
        assert_eq!(
            hash_value(&Value::from("a")).unwrap(),
            fnv1a([b'a'])
        );
    }
}
