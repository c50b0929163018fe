//! Indexing, slicing, membership, attributes, and container growth.

use std::sync::Arc;

use crate::buffers::SafeAppender;
use crate::checked::SafeInt;
use crate::error::{RuntimeError, SafetyError};
use crate::estimate::{estimate_make, MakeTemplate};
use crate::interpreter::binary;
use crate::thread::Thread;
use crate::value::{values_equal, Int, List, Value};

fn int_index(x: &Value, i: &Value) -> Result<i64, RuntimeError> {
    match i {
        Value::Int(Int::Small(v)) => Ok(*v),
        Value::Int(Int::Big(_)) => Err(RuntimeError::IndexOutOfRange {
            index: i64::MAX,
            len: 0,
        }),
        other => Err(RuntimeError::NotIndexable {
            type_name: x.type_name(),
            index_type: other.type_name(),
        }),
    }
}

/// Resolve a possibly negative index against `len`.
fn adjust_index(i: i64, len: usize) -> Result<usize, RuntimeError> {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let adjusted = if i < 0 { i.saturating_add(len_i) } else { i };
    if adjusted < 0 || adjusted >= len_i {
        return Err(RuntimeError::IndexOutOfRange { index: adjusted, len });
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(adjusted as usize)
}

/// Subscript load: `x[i]`.
pub(super) fn index(thread: &Thread, x: &Value, i: &Value) -> Result<Value, RuntimeError> {
    match x {
        Value::Str(s) => {
            let chars = s.chars().count();
            let at = adjust_index(int_index(x, i)?, chars)?;
            let c = s.chars().nth(at).expect("index checked");
            Ok(Value::str(c.to_string()))
        }
        Value::Tuple(items) => {
            let at = adjust_index(int_index(x, i)?, items.len())?;
            Ok(items[at].clone())
        }
        Value::List(l) => {
            let at = adjust_index(int_index(x, i)?, l.len())?;
            l.get(at).ok_or(RuntimeError::IndexOutOfRange {
                index: i64::try_from(at).unwrap_or(i64::MAX),
                len: l.len(),
            })
        }
        Value::Dict(d) => d.get(i)?.ok_or_else(|| RuntimeError::KeyNotFound {
            key: i.repr(),
        }),
        Value::Foreign(f) => {
            if let Some(r) = f.index_safe(thread, i) {
                return r;
            }
            if thread.required_safety().is_empty() {
                if let Some(r) = f.index(i) {
                    return r;
                }
            }
            Err(RuntimeError::NotIndexable {
                type_name: x.type_name(),
                index_type: i.type_name(),
            })
        }
        other => Err(RuntimeError::NotIndexable {
            type_name: other.type_name(),
            index_type: i.type_name(),
        }),
    }
}

/// Subscript store: `x[i] = v`, with the safe-variant preference for
/// foreign containers.
pub(super) fn set_index(
    thread: &Thread,
    x: &Value,
    i: &Value,
    v: Value,
) -> Result<(), RuntimeError> {
    match x {
        Value::List(l) => {
            let at = adjust_index(int_index(x, i)?, l.len())?;
            l.set(at, v)
        }
        Value::Dict(d) => d.insert(i.clone(), v).map(|_| ()),
        Value::Foreign(f) => {
            if let Some(r) = f.set_index_safe(thread, i, v.clone()) {
                return r;
            }
            if thread.required_safety().is_empty() {
                if let Some(r) = f.set_index(i, v) {
                    return r;
                }
            }
            Err(RuntimeError::NotSettable {
                type_name: x.type_name(),
            })
        }
        other => Err(RuntimeError::NotSettable {
            type_name: other.type_name(),
        }),
    }
}

fn slice_bound(v: &Value, default: i64) -> Result<i64, RuntimeError> {
    match v {
        Value::None => Ok(default),
        Value::Int(Int::Small(i)) => Ok(*i),
        Value::Int(Int::Big(b)) => Ok(if b.sign() == num_bigint::Sign::Minus {
            i64::MIN + 1
        } else {
            i64::MAX
        }),
        other => Err(RuntimeError::NotSliceable {
            type_name: other.type_name(),
        }),
    }
}

/// Indices selected by `[lo:hi:step]` over a sequence of `len` elements.
fn slice_indices(
    lo: &Value,
    hi: &Value,
    step: &Value,
    len: usize,
) -> Result<Vec<usize>, RuntimeError> {
    let step = match step {
        Value::None => 1,
        Value::Int(Int::Small(0)) => return Err(RuntimeError::ZeroStep),
        Value::Int(Int::Small(s)) => *s,
        other => {
            return Err(RuntimeError::NotSliceable {
                type_name: other.type_name(),
            })
        }
    };
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |i: i64, low: i64, high: i64| i.max(low).min(high);
    let resolve = |i: i64| if i < 0 { i.saturating_add(len_i) } else { i };
    let mut out = Vec::new();
    if step > 0 {
        let lo = clamp(resolve(slice_bound(lo, 0)?), 0, len_i);
        let hi = clamp(resolve(slice_bound(hi, len_i)?), 0, len_i);
        let mut at = lo;
        while at < hi {
            #[allow(clippy::cast_sign_loss)]
            out.push(at as usize);
            at = match at.checked_add(step) {
                Some(v) => v,
                None => break,
            };
        }
    } else {
        let lo = clamp(resolve(slice_bound(lo, len_i - 1)?), -1, len_i - 1);
        let hi = clamp(resolve(slice_bound(hi, -1)?), -1, len_i - 1);
        let mut at = lo;
        while at > hi {
            #[allow(clippy::cast_sign_loss)]
            out.push(at as usize);
            at = match at.checked_add(step) {
                Some(v) => v,
                None => break,
            };
        }
    }
    Ok(out)
}

/// Slice: `x[lo:hi:step]`. The result is priced and debited before it is
/// built.
pub(super) fn slice(
    thread: &Thread,
    x: &Value,
    lo: &Value,
    hi: &Value,
    step: &Value,
) -> Result<Value, RuntimeError> {
    match x {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let picks = slice_indices(lo, hi, step, chars.len())?;
            thread.add_steps(picks.len())?;
            thread.add_allocs(estimate_make(
                &MakeTemplate::sequence_of::<u8>(),
                SafeInt::from(picks.len()) * SafeInt::from(4u64),
            ))?;
            Ok(Value::from(
                picks.into_iter().map(|i| chars[i]).collect::<String>(),
            ))
        }
        Value::Tuple(items) => {
            let picks = slice_indices(lo, hi, step, items.len())?;
            thread.add_steps(picks.len())?;
            thread.add_allocs(estimate_make(
                &MakeTemplate::sequence_of::<Value>(),
                SafeInt::from(picks.len()),
            ))?;
            let out: Vec<Value> = picks.into_iter().map(|i| items[i].clone()).collect();
            Ok(Value::Tuple(Arc::from(out)))
        }
        Value::List(l) => {
            let items = l.snapshot();
            let picks = slice_indices(lo, hi, step, items.len())?;
            thread.add_steps(picks.len())?;
            thread.add_allocs(estimate_make(
                &MakeTemplate::sequence_of::<Value>(),
                SafeInt::from(picks.len()),
            ))?;
            let out: Vec<Value> = picks.into_iter().map(|i| items[i].clone()).collect();
            Ok(Value::List(Arc::new(List::from_values(out))))
        }
        other => Err(RuntimeError::NotSliceable {
            type_name: other.type_name(),
        }),
    }
}

/// Membership: `needle in haystack`.
pub(super) fn membership(
    thread: &Thread,
    needle: &Value,
    haystack: &Value,
) -> Result<bool, RuntimeError> {
    match haystack {
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_ref())),
            other => Err(RuntimeError::UnsupportedBinary {
                op: "in",
                left: other.type_name(),
                right: "string",
            }),
        },
        Value::Tuple(items) => {
            for item in items.iter() {
                thread.add_steps(1u32)?;
                if values_equal(needle, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::List(l) => {
            let items = l.snapshot();
            for item in &items {
                thread.add_steps(1u32)?;
                if values_equal(needle, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Dict(d) => d.contains(needle),
        Value::Foreign(f) => {
            match binary::foreign_binary(thread, f.as_ref(), "in", needle, false) {
                Some(r) => Ok(r?.truth()),
                None => Err(RuntimeError::UnsupportedBinary {
                    op: "in",
                    left: needle.type_name(),
                    right: haystack.type_name(),
                }),
            }
        }
        other => Err(RuntimeError::UnsupportedBinary {
            op: "in",
            left: needle.type_name(),
            right: other.type_name(),
        }),
    }
}

/// Attribute load with the safe-variant preference and a spelling hint on
/// miss.
pub(super) fn attr(thread: &Thread, x: &Value, name: &str) -> Result<Value, RuntimeError> {
    match x {
        Value::Foreign(f) => {
            if let Some(r) = f.attr_safe(thread, name) {
                return r;
            }
            if thread.required_safety().is_empty() {
                if let Some(r) = f.attr(name) {
                    return r;
                }
            } else if f.attr_names().iter().any(|n| n == name) {
                // The attribute exists but only in its non-safe variant.
                return Err(RuntimeError::Safety(SafetyError::MissingSafety {
                    missing: thread.required_safety(),
                }));
            }
            Err(RuntimeError::NoAttr {
                type_name: x.type_name(),
                name: name.to_owned(),
                hint: nearest_name(name, f.attr_names().iter().map(String::as_str)),
            })
        }
        other => Err(RuntimeError::NoAttr {
            type_name: other.type_name(),
            name: name.to_owned(),
            hint: None,
        }),
    }
}

/// Field store with the safe-variant preference.
pub(super) fn set_field(
    thread: &Thread,
    x: &Value,
    name: &str,
    v: Value,
) -> Result<(), RuntimeError> {
    match x {
        Value::Foreign(f) => {
            if let Some(r) = f.set_field_safe(thread, name, v.clone()) {
                return r;
            }
            if thread.required_safety().is_empty() {
                if let Some(r) = f.set_field(name, v) {
                    return r;
                }
            }
            Err(RuntimeError::NoField {
                type_name: x.type_name(),
                name: name.to_owned(),
            })
        }
        other => Err(RuntimeError::NoField {
            type_name: other.type_name(),
            name: name.to_owned(),
        }),
    }
}

/// Append to a list through the thread-bound appender, which debits the
/// backing-array growth and one step.
pub(super) fn append_to_list(thread: &Thread, l: &List, v: Value) -> Result<(), RuntimeError> {
    l.with_backing_mut(|vec| SafeAppender::new(thread, vec).append(v))??;
    Ok(())
}

/// Extend a list in place from an iterable. The source is drained first so
/// a self-extend sees a snapshot, then every element goes through the
/// appender.
pub(super) fn extend_list(thread: &Thread, l: &List, src: &Value) -> Result<(), RuntimeError> {
    let items = crate::interpreter::collect_iterable(thread, src)?;
    l.with_backing_mut(|vec| {
        let mut appender = SafeAppender::new(thread, vec);
        for v in items {
            appender.append(v)?;
        }
        Ok::<_, SafetyError>(())
    })??;
    Ok(())
}

/// The candidate closest to `name` within edit distance 2, if any.
pub(crate) fn nearest_name<'a>(
    name: &str,
    candidates: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for cand in candidates {
        let d = edit_distance(name, cand);
        if d <= 2 && best.map_or(true, |(bd, _)| d < bd) {
            best = Some((d, cand));
        }
    }
    best.map(|(_, c)| c.to_owned())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        core::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
