//! Binary and unary operation semantics.
//!
//! Numeric operations debit step cost proportional to the larger operand's
//! limb count (superlinear for multiplication and division) and price the
//! widest possible result before computing it. Word-sized results that stay
//! inline retain no heap and debit no allocation.

use std::sync::Arc;

use crate::buffers::SafeStringBuilder;
use crate::checked::SafeInt;
use crate::consts::{ALLOC_HEADER, MAX_REPEAT_BYTES};
use crate::error::RuntimeError;
use crate::estimate::{estimate_make, round_alloc, MakeTemplate};
use crate::thread::Thread;
use crate::value::{
    div_step_cost, fmt_float, mul_step_cost, unsupported_binary, Dict, ForeignValue, Int, List,
    Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub(super) fn token(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
        }
    }
}

fn big_alloc_bound(limbs: u64) -> SafeInt {
    round_alloc(SafeInt::from(ALLOC_HEADER) + SafeInt::from(limbs.saturating_mul(8)))
}

/// Evaluate `x ∘ y`.
pub(super) fn binary(
    thread: &Thread,
    op: BinOp,
    x: &Value,
    y: &Value,
) -> Result<Value, RuntimeError> {
    match (x, y) {
        (Value::Int(a), Value::Int(b)) => int_binary(thread, op, a, b),
        (Value::Float(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::Int(_), Value::Float(_)) => {
            thread.add_steps(1u32)?;
            let a = to_float_operand(x)?;
            let b = to_float_operand(y)?;
            float_binary(op, a, b).ok_or_else(|| unsupported_binary(op.token(), x, y))?
        }
        (Value::Str(a), Value::Str(b)) if op == BinOp::Add => {
            let total = a.len().saturating_add(b.len());
            thread.add_steps(total)?;
            thread.add_allocs(round_alloc(
                SafeInt::from(ALLOC_HEADER) + SafeInt::from(total),
            ))?;
            let mut s = String::with_capacity(total);
            s.push_str(a);
            s.push_str(b);
            Ok(Value::from(s))
        }
        (Value::Str(s), Value::Int(n)) if op == BinOp::Mul => repeat_str(thread, s, n),
        (Value::Int(n), Value::Str(s)) if op == BinOp::Mul => repeat_str(thread, s, n),
        (Value::Str(s), _) if op == BinOp::Mod => format_percent(thread, s, y),
        (Value::Tuple(a), Value::Tuple(b)) if op == BinOp::Add => {
            let total = a.len().saturating_add(b.len());
            thread.add_steps(total)?;
            thread.add_allocs(estimate_make(
                &MakeTemplate::sequence_of::<Value>(),
                SafeInt::from(total),
            ))?;
            let items: Vec<Value> = a.iter().chain(b.iter()).cloned().collect();
            Ok(Value::Tuple(Arc::from(items)))
        }
        (Value::Tuple(items), Value::Int(n)) if op == BinOp::Mul => {
            repeat_seq(thread, items, n, |vs| Value::Tuple(Arc::from(vs)))
        }
        (Value::Int(n), Value::Tuple(items)) if op == BinOp::Mul => {
            repeat_seq(thread, items, n, |vs| Value::Tuple(Arc::from(vs)))
        }
        (Value::List(a), Value::List(b)) if op == BinOp::Add => {
            let (xs, ys) = (a.snapshot(), b.snapshot());
            let total = xs.len().saturating_add(ys.len());
            thread.add_steps(total)?;
            thread.add_allocs(estimate_make(
                &MakeTemplate::sequence_of::<Value>(),
                SafeInt::from(total),
            ) + big_alloc_bound(0))?;
            let mut items = xs;
            items.extend(ys);
            Ok(Value::List(Arc::new(List::from_values(items))))
        }
        (Value::List(l), Value::Int(n)) if op == BinOp::Mul => {
            let items = l.snapshot();
            repeat_seq(thread, &items, n, |vs| {
                Value::List(Arc::new(List::from_values(vs)))
            })
        }
        (Value::Int(n), Value::List(l)) if op == BinOp::Mul => {
            let items = l.snapshot();
            repeat_seq(thread, &items, n, |vs| {
                Value::List(Arc::new(List::from_values(vs)))
            })
        }
        (Value::Dict(a), Value::Dict(b)) if op == BinOp::BitOr => {
            let (xs, ys) = (a.snapshot(), b.snapshot());
            let total = xs.len().saturating_add(ys.len());
            thread.add_steps(total)?;
            thread.add_allocs(estimate_make(
                &MakeTemplate::mapping_of_values(),
                SafeInt::from(total),
            ))?;
            let out = Dict::new();
            for (k, v) in xs.into_iter().chain(ys) {
                out.insert(k, v)?;
            }
            Ok(Value::Dict(Arc::new(out)))
        }
        (Value::Foreign(f), _) => {
            match foreign_binary(thread, f.as_ref(), op.token(), y, true) {
                Some(r) => r,
                None => probe_right(thread, op, x, y),
            }
        }
        (_, Value::Foreign(_)) => probe_right(thread, op, x, y),
        _ => Err(unsupported_binary(op.token(), x, y)),
    }
}

/// Dispatch a binary operation to a foreign operand, preferring its safe
/// variant. The plain variant is admissible only on a thread with no
/// required safety; invoking it is the side effect, so there is no probing
/// fallback.
pub(super) fn foreign_binary(
    thread: &Thread,
    f: &dyn ForeignValue,
    token: &'static str,
    other: &Value,
    this_on_left: bool,
) -> Option<Result<Value, RuntimeError>> {
    if let Some(r) = f.binary_safe(thread, token, other, this_on_left) {
        return Some(r);
    }
    if thread.required_safety().is_empty() {
        f.binary(token, other, this_on_left)
    } else {
        None
    }
}

fn probe_right(thread: &Thread, op: BinOp, x: &Value, y: &Value) -> Result<Value, RuntimeError> {
    if let Value::Foreign(f) = y {
        if let Some(r) = foreign_binary(thread, f.as_ref(), op.token(), x, false) {
            return r;
        }
    }
    Err(unsupported_binary(op.token(), x, y))
}

fn to_float_operand(v: &Value) -> Result<f64, RuntimeError> {
    match v {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => i.to_f64(),
        _ => unreachable!("caller matched numeric operands"),
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Option<Result<Value, RuntimeError>> {
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Some(Err(RuntimeError::DivisionByZero));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Some(Err(RuntimeError::DivisionByZero));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Some(Err(RuntimeError::DivisionByZero));
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        _ => return None,
    };
    Some(Ok(Value::Float(out)))
}

fn int_binary(thread: &Thread, op: BinOp, a: &Int, b: &Int) -> Result<Value, RuntimeError> {
    let (la, lb) = (a.limbs(), b.limbs());
    let wide = la > 1 || lb > 1;
    let steps = match op {
        BinOp::Mul => mul_step_cost(la, lb),
        BinOp::FloorDiv | BinOp::Mod => div_step_cost(la, lb),
        _ => la.max(lb),
    };
    thread.add_steps(SafeInt::from(steps))?;

    // `/` over ints is real division.
    if op == BinOp::Div {
        return float_binary(op, a.to_f64()?, b.to_f64()?).expect("float op defined for Div");
    }

    // Word-sized operands compute inline first; the heap bound is debited
    // only when the result actually promotes.
    if !wide {
        if let (Some(x), Some(y)) = (a.to_i64(), b.to_i64()) {
            match small_int_binary(op, x, y)? {
                SmallOutcome::Value(v) => return Ok(v),
                SmallOutcome::Promotes => {}
            }
        }
    }

    let result_limbs = match op {
        BinOp::Add | BinOp::Sub => la.max(lb).saturating_add(1),
        BinOp::Mul => la.saturating_add(lb),
        BinOp::Shl => {
            let count = b.to_i64().unwrap_or(i64::MAX);
            la.saturating_add(u64::try_from(count.max(0)).unwrap_or(0) / 64 + 1)
        }
        _ => la.max(lb),
    };
    thread.add_allocs(big_alloc_bound(result_limbs))?;

    let out = match op {
        BinOp::Add => a.add(b),
        BinOp::Sub => a.sub(b),
        BinOp::Mul => a.mul(b),
        BinOp::FloorDiv => a.floor_div(b)?,
        BinOp::Mod => a.rem(b)?,
        BinOp::BitAnd => a.bitand(b),
        BinOp::BitOr => a.bitor(b),
        BinOp::BitXor => a.bitxor(b),
        BinOp::Shl => a.shl(shift_count(b)?)?,
        BinOp::Shr => a.shr(shift_count(b)?)?,
        BinOp::Div => unreachable!("handled above"),
    };
    Ok(Value::Int(out))
}

enum SmallOutcome {
    Value(Value),
    Promotes,
}

fn small_int_binary(op: BinOp, x: i64, y: i64) -> Result<SmallOutcome, RuntimeError> {
    let a = Int::from(x);
    let b = Int::from(y);
    let inline = match op {
        BinOp::Add => x.checked_add(y).map(Value::from),
        BinOp::Sub => x.checked_sub(y).map(Value::from),
        BinOp::Mul => x.checked_mul(y).map(Value::from),
        BinOp::FloorDiv => {
            if x == i64::MIN && y == -1 {
                None
            } else {
                return Ok(SmallOutcome::Value(Value::Int(a.floor_div(&b)?)));
            }
        }
        BinOp::Mod => return Ok(SmallOutcome::Value(Value::Int(a.rem(&b)?))),
        BinOp::BitAnd => Some(Value::from(x & y)),
        BinOp::BitOr => Some(Value::from(x | y)),
        BinOp::BitXor => Some(Value::from(x ^ y)),
        BinOp::Shl | BinOp::Shr => {
            // Validate the count before pricing the wide path.
            let _ = shift_count(&b)?;
            None
        }
        BinOp::Div => unreachable!("handled before the inline path"),
    };
    Ok(match inline {
        Some(v) => SmallOutcome::Value(v),
        None => SmallOutcome::Promotes,
    })
}

fn shift_count(b: &Int) -> Result<i64, RuntimeError> {
    match b.to_i64() {
        Some(v) => Ok(v),
        None => Err(if b.signum() < 0 {
            RuntimeError::NegativeShift
        } else {
            RuntimeError::LargeShift { count: i64::MAX }
        }),
    }
}

fn repeat_str(thread: &Thread, s: &Arc<str>, n: &Int) -> Result<Value, RuntimeError> {
    let count = n.to_i64().unwrap_or(i64::MAX).max(0);
    let bytes = SafeInt::from(s.len()) * SafeInt::from(count);
    // The gate runs before any debit or allocation.
    let total = bytes.non_negative().ok_or(RuntimeError::ExcessiveRepeat {
        elems: u64::MAX,
    })?;
    #[allow(clippy::cast_sign_loss)]
    let total = total as u64;
    if total > MAX_REPEAT_BYTES {
        return Err(RuntimeError::ExcessiveRepeat { elems: total });
    }
    if count == 0 || s.is_empty() {
        return Ok(Value::from(""));
    }
    thread.add_steps(SafeInt::from(total))?;
    thread.add_allocs(round_alloc(
        SafeInt::from(ALLOC_HEADER) + SafeInt::from(total),
    ))?;
    #[allow(clippy::cast_sign_loss)]
    Ok(Value::from(s.repeat(count as usize)))
}

fn repeat_seq(
    thread: &Thread,
    items: &[Value],
    n: &Int,
    build: impl FnOnce(Vec<Value>) -> Value,
) -> Result<Value, RuntimeError> {
    let count = n.to_i64().unwrap_or(i64::MAX).max(0);
    let elems = SafeInt::from(items.len()) * SafeInt::from(count);
    let total = elems.non_negative().ok_or(RuntimeError::ExcessiveRepeat {
        elems: u64::MAX,
    })?;
    #[allow(clippy::cast_sign_loss)]
    let total = total as u64;
    let bytes = total.saturating_mul(core::mem::size_of::<Value>() as u64);
    if bytes > MAX_REPEAT_BYTES {
        return Err(RuntimeError::ExcessiveRepeat { elems: total });
    }
    thread.add_steps(SafeInt::from(total))?;
    thread.add_allocs(estimate_make(
        &MakeTemplate::sequence_of::<Value>(),
        SafeInt::from(total),
    ))?;
    #[allow(clippy::cast_sign_loss)]
    let mut out = Vec::with_capacity(total as usize);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    Ok(build(out))
}

/// Evaluate a unary operation; `op` is the operator token.
pub(super) fn unary(thread: &Thread, op: &'static str, x: &Value) -> Result<Value, RuntimeError> {
    match (op, x) {
        ("+", Value::Int(_) | Value::Float(_)) => Ok(x.clone()),
        ("-", Value::Int(i)) => {
            thread.add_steps(SafeInt::from(i.limbs()))?;
            if i.limbs() > 1 {
                thread.add_allocs(big_alloc_bound(i.limbs()))?;
            }
            Ok(Value::Int(i.neg()))
        }
        ("-", Value::Float(f)) => Ok(Value::Float(-f)),
        ("~", Value::Int(i)) => {
            thread.add_steps(SafeInt::from(i.limbs()))?;
            if i.limbs() > 1 {
                thread.add_allocs(big_alloc_bound(i.limbs().saturating_add(1)))?;
            }
            Ok(Value::Int(i.invert()))
        }
        (_, Value::Foreign(f)) => {
            if let Some(r) = f.unary_safe(thread, op) {
                return r;
            }
            if thread.required_safety().is_empty() {
                if let Some(r) = f.unary(op) {
                    return r;
                }
            }
            Err(RuntimeError::UnsupportedUnary {
                op,
                type_name: x.type_name(),
            })
        }
        _ => Err(RuntimeError::UnsupportedUnary {
            op,
            type_name: x.type_name(),
        }),
    }
}

/// `fmt % arg` string interpolation: `%s %r %d %x %o %e %f %g %%`.
fn format_percent(thread: &Thread, fmt: &str, arg: &Value) -> Result<Value, RuntimeError> {
    let args: Vec<Value> = match arg {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut next = 0usize;
    let mut out = SafeStringBuilder::new(thread);
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.write_char(c)?;
            continue;
        }
        let Some(conv) = chars.next() else {
            return Err(RuntimeError::Format {
                msg: "incomplete format".to_owned(),
            });
        };
        if conv == '%' {
            out.write_char('%')?;
            continue;
        }
        let Some(v) = args.get(next) else {
            return Err(RuntimeError::Format {
                msg: "not enough arguments for format string".to_owned(),
            });
        };
        next += 1;
        match conv {
            's' => out.write_str(&v.to_string())?,
            'r' => out.write_str(&v.repr())?,
            'd' | 'i' => match v {
                Value::Int(i) => out.write_str(&i.to_string())?,
                Value::Float(f) if f.is_finite() => {
                    out.write_str(&format!("{}", f.trunc() as i64))?;
                }
                other => {
                    return Err(RuntimeError::Format {
                        msg: format!("%{conv} format requires a number, got {}", other.type_name()),
                    })
                }
            },
            'x' | 'X' | 'o' => match v {
                Value::Int(i) => {
                    let b = i.to_bigint();
                    let s = match conv {
                        'x' => format!("{b:x}"),
                        'X' => format!("{b:X}"),
                        _ => format!("{b:o}"),
                    };
                    out.write_str(&s)?;
                }
                other => {
                    return Err(RuntimeError::Format {
                        msg: format!("%{conv} format requires an int, got {}", other.type_name()),
                    })
                }
            },
            'e' | 'f' | 'g' => {
                let f = match v {
                    Value::Float(f) => *f,
                    Value::Int(i) => i.to_f64()?,
                    other => {
                        return Err(RuntimeError::Format {
                            msg: format!(
                                "%{conv} format requires a number, got {}",
                                other.type_name()
                            ),
                        })
                    }
                };
                let s = match conv {
                    'e' => format!("{f:e}"),
                    'f' => format!("{f:.6}"),
                    _ => fmt_float(f),
                };
                out.write_str(&s)?;
            }
            other => {
                return Err(RuntimeError::Format {
                    msg: format!("unknown conversion %{other}"),
                })
            }
        }
    }
    if next < args.len() {
        return Err(RuntimeError::Format {
            msg: "too many arguments for format string".to_owned(),
        });
    }
    Ok(Value::from(out.finish()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(op: BinOp, x: Value, y: Value) -> Result<Value, RuntimeError> {
        let t = Thread::new("t");
        binary(&t, op, &x, &y)
    }

    #[test]
    fn small_int_arithmetic_costs_no_allocs() {
        let t = Thread::new("t");
        let v = binary(&t, BinOp::Add, &Value::from(1i64), &Value::from(2i64)).unwrap();
        assert_eq!(v.repr(), "3");
        assert_eq!(t.allocs().get(), Some(0));
        assert_eq!(t.steps().get(), Some(1));
    }

    #[test]
    fn promotion_is_priced_before_it_happens() {
        let t = Thread::new("t");
        let v = binary(
            &t,
            BinOp::Mul,
            &Value::from(i64::MAX),
            &Value::from(i64::MAX),
        )
        .unwrap();
        assert!(matches!(v, Value::Int(Int::Big(_))));
        assert!(t.allocs().get().unwrap() >= 32);
    }

    #[test]
    fn real_division_yields_floats() {
        assert_eq!(
            run(BinOp::Div, Value::from(7i64), Value::from(2i64))
                .unwrap()
                .repr(),
            "3.5"
        );
        assert!(matches!(
            run(BinOp::Div, Value::from(1i64), Value::from(0i64)),
            Err(RuntimeError::DivisionByZero)
        ));
    }

    #[test]
    fn float_modulo_follows_the_divisor_sign() {
        let got = run(BinOp::Mod, Value::Float(-7.0), Value::Float(2.0)).unwrap();
        assert_eq!(got.repr(), "1.0");
    }

    #[test]
    fn string_concat_and_repeat() {
        assert_eq!(
            run(BinOp::Add, Value::from("ab"), Value::from("cd"))
                .unwrap()
                .repr(),
            "\"abcd\""
        );
        assert_eq!(
            run(BinOp::Mul, Value::from("ab"), Value::from(3i64))
                .unwrap()
                .repr(),
            "\"ababab\""
        );
        assert_eq!(
            run(BinOp::Mul, Value::from(-2i64), Value::from("ab"))
                .unwrap()
                .repr(),
            "\"\""
        );
    }

    #[test]
    fn excessive_repeat_is_refused_before_any_debit() {
        let t = Thread::new("t");
        let err = binary(
            &t,
            BinOp::Mul,
            &Value::from("a"),
            &Value::from(1i64 << 31),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::ExcessiveRepeat { .. }));
        assert_eq!(t.allocs().get(), Some(0));
        assert_eq!(t.steps().get(), Some(0));
    }

    #[test]
    fn dict_union_prefers_right_hand_entries() {
        let a = Dict::new();
        a.insert(Value::from("k"), Value::from(1i64)).unwrap();
        a.insert(Value::from("only-a"), Value::from(2i64)).unwrap();
        let b = Dict::new();
        b.insert(Value::from("k"), Value::from(9i64)).unwrap();
        let got = run(
            BinOp::BitOr,
            Value::Dict(Arc::new(a)),
            Value::Dict(Arc::new(b)),
        )
        .unwrap();
        assert_eq!(got.repr(), "{\"k\": 9, \"only-a\": 2}");
    }

    #[test]
    fn percent_formatting() {
        let t = Thread::new("t");
        let fmt = Value::from("x=%d s=%s r=%r pct=%%");
        let args = Value::Tuple(Arc::from(vec![
            Value::from(7i64),
            Value::from("hi"),
            Value::from("hi"),
        ]));
        let got = binary(&t, BinOp::Mod, &fmt, &args).unwrap();
        assert_eq!(got.to_string(), "x=7 s=hi r=\"hi\" pct=%");
        assert!(matches!(
            binary(&t, BinOp::Mod, &Value::from("%d"), &Value::from("nope")),
            Err(RuntimeError::Format { .. })
        ));
    }

    #[test]
    fn unsupported_pairs_name_both_types() {
        let err = run(BinOp::Sub, Value::from("a"), Value::from(1i64)).unwrap_err();
        assert_eq!(err.to_string(), "unknown binary op: string - int");
    }

    #[test]
    fn foreign_operators_honour_the_safety_policy() {
        struct PlainOnly;
        impl crate::value::ForeignValue for PlainOnly {
            fn type_name(&self) -> &'static str {
                "plain"
            }
            fn repr(&self) -> String {
                "<plain>".into()
            }
            fn binary(
                &self,
                op: &'static str,
                _other: &Value,
                _this_on_left: bool,
            ) -> Option<Result<Value, RuntimeError>> {
                (op == "+").then(|| Ok(Value::from(1i64)))
            }
            fn unary(&self, op: &'static str) -> Option<Result<Value, RuntimeError>> {
                (op == "-").then(|| Ok(Value::from(1i64)))
            }
        }
        struct WithSafe;
        impl crate::value::ForeignValue for WithSafe {
            fn type_name(&self) -> &'static str {
                "guarded"
            }
            fn repr(&self) -> String {
                "<guarded>".into()
            }
            fn binary(
                &self,
                op: &'static str,
                _other: &Value,
                _this_on_left: bool,
            ) -> Option<Result<Value, RuntimeError>> {
                (op == "+").then(|| Ok(Value::from(1i64)))
            }
            fn binary_safe(
                &self,
                _thread: &Thread,
                op: &'static str,
                _other: &Value,
                _this_on_left: bool,
            ) -> Option<Result<Value, RuntimeError>> {
                (op == "+").then(|| Ok(Value::from(2i64)))
            }
        }

        let plain = Value::Foreign(Arc::new(PlainOnly));
        let guarded = Value::Foreign(Arc::new(WithSafe));

        // On an unconstrained thread the plain variants run.
        let t = Thread::new("open");
        assert_eq!(
            binary(&t, BinOp::Add, &plain, &Value::from(0i64))
                .unwrap()
                .repr(),
            "1"
        );
        assert_eq!(unary(&t, "-", &plain).unwrap().repr(), "1");

        // A requiring thread never invokes a plain-only variant, not even
        // to probe: the capability is absent there.
        let mut t = Thread::new("gated");
        t.require_safety(crate::safety::Safety::IO);
        assert!(matches!(
            binary(&t, BinOp::Add, &plain, &Value::from(0i64)),
            Err(RuntimeError::UnsupportedBinary { op: "+", .. })
        ));
        assert!(matches!(
            unary(&t, "-", &plain),
            Err(RuntimeError::UnsupportedUnary { op: "-", .. })
        ));

        // The safe variant wins on both kinds of thread.
        assert_eq!(
            binary(&t, BinOp::Add, &guarded, &Value::from(0i64))
                .unwrap()
                .repr(),
            "2"
        );
        let t = Thread::new("open");
        assert_eq!(
            binary(&t, BinOp::Add, &guarded, &Value::from(0i64))
                .unwrap()
                .repr(),
            "2"
        );
    }
}
