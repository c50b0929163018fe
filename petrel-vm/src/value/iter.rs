//! Pull-style iteration over values.
//!
//! Containers are pinned against mutation while an iteration is live; the
//! VM finalises every iterator exactly once at frame exit, including on
//! error paths, which unpins the container and lets a host iterator release
//! its resources and surface a late error.

use std::sync::Arc;

use crate::error::RuntimeError;
use crate::thread::Thread;
use crate::value::{Dict, ForeignIter, List, Value};

enum IterKind {
    Tuple { items: Arc<[Value]>, i: usize },
    List { list: Arc<List>, i: usize },
    Str { s: Arc<str>, at: usize },
    Dict { dict: Arc<Dict>, i: usize },
    Foreign(Box<dyn ForeignIter>),
}

/// A live iteration with single-shot finalisation.
pub struct ValueIterator {
    kind: IterKind,
    finished: bool,
}

/// Start iterating `v`, pinning it. Prefers the safe variant of a foreign
/// value's iteration capability; the plain variant is only admissible when
/// the thread requires no safety.
pub(crate) fn iterate_with(thread: &Thread, v: &Value) -> Result<ValueIterator, RuntimeError> {
    match v {
        Value::Foreign(f) => {
            if let Some(it) = f.iterate_safe(thread) {
                return Ok(ValueIterator::foreign(it));
            }
            if thread.required_safety().is_empty() {
                if let Some(it) = f.iterate() {
                    return Ok(ValueIterator::foreign(it));
                }
            } else if let Some(mut probe) = f.iterate() {
                // The capability exists but only in its non-safe variant.
                probe.done();
                return Err(RuntimeError::Safety(
                    crate::error::SafetyError::MissingSafety {
                        missing: thread.required_safety(),
                    },
                ));
            }
            Err(RuntimeError::NotIterable {
                type_name: v.type_name(),
            })
        }
        other => iterate(other),
    }
}

/// Start iterating `v`, pinning it.
pub fn iterate(v: &Value) -> Result<ValueIterator, RuntimeError> {
    let kind = match v {
        Value::Tuple(items) => IterKind::Tuple {
            items: Arc::clone(items),
            i: 0,
        },
        Value::List(list) => {
            list.pin();
            IterKind::List {
                list: Arc::clone(list),
                i: 0,
            }
        }
        Value::Str(s) => IterKind::Str {
            s: Arc::clone(s),
            at: 0,
        },
        Value::Dict(dict) => {
            dict.pin();
            IterKind::Dict {
                dict: Arc::clone(dict),
                i: 0,
            }
        }
        Value::Foreign(f) => match f.iterate() {
            Some(it) => IterKind::Foreign(it),
            None => {
                return Err(RuntimeError::NotIterable {
                    type_name: v.type_name(),
                })
            }
        },
        other => {
            return Err(RuntimeError::NotIterable {
                type_name: other.type_name(),
            })
        }
    };
    Ok(ValueIterator {
        kind,
        finished: false,
    })
}

impl ValueIterator {
    fn foreign(it: Box<dyn ForeignIter>) -> Self {
        Self {
            kind: IterKind::Foreign(it),
            finished: false,
        }
    }

    /// The next element, or `None` when exhausted.
    pub fn next(&mut self) -> Option<Value> {
        if self.finished {
            return None;
        }
        match &mut self.kind {
            IterKind::Tuple { items, i } => {
                let v = items.get(*i).cloned()?;
                *i += 1;
                Some(v)
            }
            IterKind::List { list, i } => {
                let v = list.get(*i)?;
                *i += 1;
                Some(v)
            }
            IterKind::Str { s, at } => {
                let rest = s.get(*at..)?;
                let c = rest.chars().next()?;
                *at += c.len_utf8();
                Some(Value::str(c.to_string()))
            }
            IterKind::Dict { dict, i } => {
                let (k, _) = dict.get_index(*i)?;
                *i += 1;
                Some(k)
            }
            IterKind::Foreign(it) => it.next(),
        }
    }

    /// Finalise: unpin the container, release host resources. The first
    /// call wins; later calls are no-ops.
    pub fn done(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        match &mut self.kind {
            IterKind::List { list, .. } => list.unpin(),
            IterKind::Dict { dict, .. } => dict.unpin(),
            IterKind::Foreign(it) => it.done(),
            IterKind::Tuple { .. } | IterKind::Str { .. } => {}
        }
    }

    /// The error that ended the iteration early, if any.
    pub fn err(&self) -> Option<RuntimeError> {
        match &self.kind {
            IterKind::Foreign(it) => it.err(),
            _ => None,
        }
    }
}

impl Drop for ValueIterator {
    fn drop(&mut self) {
        self.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mut it: ValueIterator) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(v) = it.next() {
            out.push(v.repr());
        }
        it.done();
        out
    }

    #[test]
    fn tuple_and_string_iteration() {
        let t = Value::Tuple(Arc::from(vec![Value::from(1i64), Value::from(2i64)]));
        assert_eq!(drain(iterate(&t).unwrap()), vec!["1", "2"]);
        let s = Value::from("héj");
        assert_eq!(
            drain(iterate(&s).unwrap()),
            vec!["\"h\"", "\"é\"", "\"j\""]
        );
    }

    #[test]
    fn list_iteration_pins_until_done() {
        let list = Arc::new(List::from_values(vec![Value::from(1i64)]));
        let v = Value::List(Arc::clone(&list));
        let mut it = iterate(&v).unwrap();
        assert!(list.append(Value::None).is_err());
        let _ = it.next();
        it.done();
        it.done(); // second finalisation is a no-op
        list.append(Value::None).unwrap();
    }

    #[test]
    fn dict_iteration_yields_keys_in_insertion_order() {
        let d = Dict::new();
        d.insert(Value::from("z"), Value::from(1i64)).unwrap();
        d.insert(Value::from("a"), Value::from(2i64)).unwrap();
        let v = Value::Dict(Arc::new(d));
        assert_eq!(drain(iterate(&v).unwrap()), vec!["\"z\"", "\"a\""]);
    }

    #[test]
    fn non_iterables_are_rejected() {
        assert!(matches!(
            iterate(&Value::from(3i64)),
            Err(RuntimeError::NotIterable { type_name: "int" })
        ));
    }

    #[test]
    fn dropping_an_unfinished_iterator_unpins() {
        let list = Arc::new(List::from_values(vec![Value::from(1i64)]));
        {
            let _it = iterate(&Value::List(Arc::clone(&list))).unwrap();
        }
        list.append(Value::None).unwrap();
    }
}
