//! Resource-aware growable buffers.
//!
//! Both buffers bind to a [`Thread`] and debit every capacity change against
//! its allocation budget before growing, plus one step per written unit.
//! The first failed debit poisons the buffer: every subsequent operation
//! fails with the stored error without touching the contents.
//!
//! In the Go original the appender verifies at run time that its target is
//! a slice and that element types match; here both are static guarantees of
//! the type parameter.

use core::mem;

use crate::checked::SafeInt;
use crate::error::SafetyError;
use crate::estimate::{estimate_make, MakeTemplate};
use crate::thread::Thread;

fn capacity_cost(elem_size: u64, from: usize, to: usize) -> SafeInt {
    let t = MakeTemplate::Sequence {
        elem_size,
        elem_indirect: 0,
    };
    estimate_make(&t, SafeInt::from(to)) - estimate_make(&t, SafeInt::from(from))
}

/// A growable string bound to a thread's budgets.
pub struct SafeStringBuilder<'a> {
    thread: &'a Thread,
    buf: String,
    poisoned: Option<SafetyError>,
}

impl<'a> SafeStringBuilder<'a> {
    /// An empty builder; nothing is debited until it grows.
    pub fn new(thread: &'a Thread) -> Self {
        Self {
            thread,
            buf: String::new(),
            poisoned: None,
        }
    }

    fn check(&self) -> Result<(), SafetyError> {
        match &self.poisoned {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn ensure(&mut self, additional: usize) -> Result<(), SafetyError> {
        self.check()?;
        let needed = self.buf.len().saturating_add(additional);
        let cap = self.buf.capacity();
        if needed <= cap {
            return Ok(());
        }
        let new_cap = cap.saturating_mul(2).max(needed).max(16);
        let cost = capacity_cost(1, cap, new_cap);
        if let Err(e) = self.thread.add_allocs(cost) {
            self.poisoned = Some(e.clone());
            return Err(e);
        }
        self.buf.reserve_exact(new_cap.saturating_sub(self.buf.len()));
        Ok(())
    }

    /// Append one byte; it must be ASCII to keep the buffer valid UTF-8.
    ///
    /// # Panics
    ///
    /// Panics on a non-ASCII byte; write multi-byte text through
    /// [`SafeStringBuilder::write_char`].
    pub fn write_byte(&mut self, b: u8) -> Result<(), SafetyError> {
        assert!(b.is_ascii(), "write_byte requires ASCII");
        self.write_char(b as char)
    }

    /// Append one character.
    pub fn write_char(&mut self, c: char) -> Result<(), SafetyError> {
        self.ensure(c.len_utf8())?;
        self.thread.add_steps(SafeInt::from(c.len_utf8()))?;
        self.buf.push(c);
        Ok(())
    }

    /// Append a string.
    pub fn write_str(&mut self, s: &str) -> Result<(), SafetyError> {
        self.ensure(s.len())?;
        self.thread.add_steps(SafeInt::from(s.len()))?;
        self.buf.push_str(s);
        Ok(())
    }

    /// Pre-grow so that `hint` further bytes fit without reallocation.
    pub fn grow(&mut self, hint: usize) -> Result<(), SafetyError> {
        self.ensure(hint)
    }

    /// Bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Debited capacity, bytes.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// The accumulated string so far.
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Finish, surfacing the poisoned error if any debit failed.
    pub fn finish(self) -> Result<String, SafetyError> {
        match self.poisoned {
            Some(e) => Err(e),
            None => Ok(self.buf),
        }
    }
}

/// A typed appender over a target vector, bound to a thread's budgets.
pub struct SafeAppender<'a, T> {
    thread: &'a Thread,
    target: &'a mut Vec<T>,
    poisoned: Option<SafetyError>,
}

impl<'a, T> SafeAppender<'a, T> {
    /// An appender over `target`.
    pub fn new(thread: &'a Thread, target: &'a mut Vec<T>) -> Self {
        Self {
            thread,
            target,
            poisoned: None,
        }
    }

    fn ensure(&mut self, extra: usize) -> Result<(), SafetyError> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        let needed = self.target.len().saturating_add(extra);
        let cap = self.target.capacity();
        if needed <= cap {
            return Ok(());
        }
        let new_cap = cap.saturating_mul(2).max(needed).max(4);
        let cost = capacity_cost(mem::size_of::<T>() as u64, cap, new_cap);
        if let Err(e) = self.thread.add_allocs(cost) {
            self.poisoned = Some(e.clone());
            return Err(e);
        }
        self.target.reserve_exact(new_cap.saturating_sub(self.target.len()));
        Ok(())
    }

    /// Append one element.
    pub fn append(&mut self, item: T) -> Result<(), SafetyError> {
        self.ensure(1)?;
        self.thread.add_steps(1u32)?;
        self.target.push(item);
        Ok(())
    }

    /// The thread's running allocation total, for callers that report
    /// consumption back to their own caller.
    pub fn allocs(&self) -> SafeInt {
        self.thread.allocs()
    }

    /// Elements in the target.
    pub fn len(&self) -> usize {
        self.target.len()
    }

    /// Whether the target is empty.
    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}

impl<T: Clone> SafeAppender<'_, T> {
    /// Append every element of `src`.
    pub fn append_slice(&mut self, src: &[T]) -> Result<(), SafetyError> {
        self.ensure(src.len())?;
        self.thread.add_steps(SafeInt::from(src.len()))?;
        self.target.extend_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_debits_capacity_and_steps() {
        let t = Thread::new("t");
        let mut b = SafeStringBuilder::new(&t);
        b.write_str("hello").unwrap();
        b.write_char('!').unwrap();
        assert_eq!(b.as_str(), "hello!");
        assert_eq!(t.steps().get(), Some(6));
        assert!(t.allocs().get().unwrap() >= 6);
        let s = b.finish().unwrap();
        assert_eq!(s, "hello!");
    }

    #[test]
    fn builder_poisons_after_the_first_failed_debit() {
        let t = Thread::new("t");
        t.set_max_allocs(16);
        let mut b = SafeStringBuilder::new(&t);
        b.write_str("0123456789").unwrap();
        let before = b.as_str().to_owned();
        let err = b.write_str(&"x".repeat(100)).unwrap_err();
        assert!(matches!(err, SafetyError::TooManyAllocs { .. }));
        // Every further operation fails without touching the buffer.
        assert!(b.write_char('y').is_err());
        assert_eq!(b.as_str(), before);
        assert!(b.finish().is_err());
    }

    #[test]
    fn builder_growth_is_debited_incrementally() {
        let t = Thread::new("t");
        let mut b = SafeStringBuilder::new(&t);
        b.grow(100).unwrap();
        let after_grow = t.allocs().get().unwrap();
        assert!(after_grow >= 100);
        // Writing within the debited capacity adds steps, not bytes.
        b.write_str(&"a".repeat(64)).unwrap();
        assert_eq!(t.allocs().get().unwrap(), after_grow);
    }

    #[test]
    #[should_panic(expected = "write_byte requires ASCII")]
    fn non_ascii_byte_is_a_programming_error() {
        let t = Thread::new("t");
        let mut b = SafeStringBuilder::new(&t);
        let _ = b.write_byte(0xC3);
    }

    #[test]
    fn appender_debits_growth_and_reports_allocs() {
        let t = Thread::new("t");
        let mut target: Vec<u64> = Vec::new();
        let mut a = SafeAppender::new(&t, &mut target);
        a.append(1).unwrap();
        a.append_slice(&[2, 3, 4]).unwrap();
        assert_eq!(a.len(), 4);
        assert!(a.allocs().get().unwrap() >= 32);
        assert_eq!(t.steps().get(), Some(4));
        assert_eq!(target, vec![1, 2, 3, 4]);
    }

    #[test]
    fn appender_failure_leaves_the_target_unchanged() {
        let t = Thread::new("t");
        t.set_max_allocs(40);
        let mut target: Vec<u64> = Vec::new();
        let mut a = SafeAppender::new(&t, &mut target);
        a.append(1).unwrap();
        let err = a.append_slice(&[0; 1000]).unwrap_err();
        assert!(matches!(err, SafetyError::TooManyAllocs { .. }));
        assert!(a.append(2).is_err());
        assert_eq!(target, vec![1]);
    }
}
