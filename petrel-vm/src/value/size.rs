//! Default retained-size traversal behind [`crate::estimate::estimate`].

use core::mem;
use std::sync::Arc;

use hashbrown::HashSet;

use crate::checked::SafeInt;
use crate::consts::ALLOC_HEADER;
use crate::estimate::{estimate_make, round_alloc, MakeTemplate};
use crate::value::{CellSlot, Closure, Dict, Int, List, Value};

/// Modelled footprint of a host object the walk cannot see into.
const OPAQUE_SIZE: u64 = 64;

fn header_plus(payload: u64) -> SafeInt {
    round_alloc(SafeInt::from(ALLOC_HEADER) + SafeInt::from(payload))
}

/// Pessimistic heap bytes retained by the graph under `v`. Shared nodes
/// count once; the `visited` set carries pointer identities across the walk.
pub(crate) fn retained_size(v: &Value, visited: &mut HashSet<usize>) -> SafeInt {
    let value_size = mem::size_of::<Value>() as u64;
    match v {
        Value::None
        | Value::Bool(_)
        | Value::Int(Int::Small(_))
        | Value::Float(_)
        | Value::Mandatory
        | Value::Unbound => SafeInt::ZERO,
        Value::Int(Int::Big(b)) => {
            if !visited.insert(Arc::as_ptr(b) as usize) {
                return SafeInt::ZERO;
            }
            header_plus(b.bits().div_ceil(64).max(1).saturating_mul(8))
        }
        Value::Str(s) => {
            if !visited.insert(Arc::as_ptr(s) as *const u8 as usize) {
                return SafeInt::ZERO;
            }
            header_plus(s.len() as u64)
        }
        Value::Tuple(items) => {
            if !visited.insert(Arc::as_ptr(items) as *const () as usize) {
                return SafeInt::ZERO;
            }
            let mut total = header_plus((items.len() as u64).saturating_mul(value_size));
            for item in items.iter() {
                total = total + retained_size(item, visited);
            }
            total
        }
        Value::List(l) => {
            if !visited.insert(Arc::as_ptr(l) as usize) {
                return SafeInt::ZERO;
            }
            let mut total = header_plus(mem::size_of::<List>() as u64)
                + round_alloc(SafeInt::from(l.capacity()) * SafeInt::from(value_size));
            let items = l.snapshot();
            for item in &items {
                total = total + retained_size(item, visited);
            }
            total
        }
        Value::Dict(d) => {
            if !visited.insert(Arc::as_ptr(d) as usize) {
                return SafeInt::ZERO;
            }
            let mut total = header_plus(mem::size_of::<Dict>() as u64)
                + estimate_make(
                    &MakeTemplate::mapping_of_values(),
                    SafeInt::from(d.capacity()),
                );
            for (k, v) in d.snapshot() {
                total = total + retained_size(&k, visited) + retained_size(&v, visited);
            }
            total
        }
        Value::Function(c) => {
            if !visited.insert(Arc::as_ptr(c) as usize) {
                return SafeInt::ZERO;
            }
            let mut total = header_plus(mem::size_of::<Closure>() as u64)
                + round_alloc(
                    SafeInt::from(c.defaults.len() + c.free.len()) * SafeInt::from(value_size),
                );
            for v in c.defaults.iter().chain(c.free.iter()) {
                total = total + retained_size(v, visited);
            }
            // The body and module are owned by the shared program, which the
            // host accounts for separately.
            total
        }
        Value::Native(n) => {
            if !visited.insert(Arc::as_ptr(n) as *const () as usize) {
                return SafeInt::ZERO;
            }
            header_plus(OPAQUE_SIZE)
        }
        Value::Foreign(f) => {
            if !visited.insert(Arc::as_ptr(f) as *const () as usize) {
                return SafeInt::ZERO;
            }
            match f.estimated_size() {
                Some(own) => round_alloc(SafeInt::from(own)),
                None => header_plus(OPAQUE_SIZE),
            }
        }
        Value::Cell(c) => {
            if !visited.insert(Arc::as_ptr(c) as usize) {
                return SafeInt::ZERO;
            }
            header_plus(mem::size_of::<CellSlot>() as u64) + retained_size(&c.get(), visited)
        }
    }
}
