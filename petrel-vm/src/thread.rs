//! Per-execution thread state: quotas, cancellation, safety requirements,
//! the call stack, and thread-local values.
//!
//! A [`Thread`] is owned by the task running the VM for the duration of a
//! call into the interpreter. The step and allocation counters and the
//! cancellation state live behind dedicated mutexes in a shared core, so a
//! supervisor task holding a [`ThreadHandle`] can observe or cancel a
//! running thread; everything else (call stack, thread-locals, host hooks)
//! belongs to the VM task alone.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hashbrown::HashMap;
use indexmap::IndexMap;

use crate::backtrace::{CallStack, StackFrame};
use crate::checked::SafeInt;
use crate::context::{CancelContext, CancelReason, Detach, Done};
use crate::error::{EvalError, SafetyError};
use crate::pool::FramePool;
use crate::profiler::Profiler;
use crate::safety::Safety;
use crate::value::Value;

/// Module loader callback: `(thread, module name) → names map`.
///
/// Required to be idempotent per name; invoked by the `Load` opcode outside
/// the profiling span.
pub type LoadFn =
    Box<dyn FnMut(&mut Thread, &str) -> Result<IndexMap<String, Value>, EvalError> + Send>;

/// Print callback. Must abide by all the thread's required safety flags.
pub type PrintFn = Box<dyn FnMut(&mut Thread, &str) + Send>;

#[derive(Debug, Default)]
struct Budget {
    count: SafeInt,
    max: SafeInt,
}

impl Budget {
    /// The active limit. Zero, negative, and invalid all mean unlimited.
    fn limit(&self) -> Option<i64> {
        match self.max.get() {
            Some(m) if m > 0 => Some(m),
            _ => None,
        }
    }
}

#[derive(Default)]
struct CancelState {
    reason: Option<Arc<CancelReason>>,
    done: Option<Done>,
    parent: Option<CancelContext>,
    detach: Option<Detach>,
}

/// The mutex-guarded core shared between a thread and its supervisors.
struct ThreadShared {
    steps: Mutex<Budget>,
    allocs: Mutex<Budget>,
    cancelled: AtomicBool,
    cancel: Mutex<CancelState>,
}

impl ThreadShared {
    fn new() -> Self {
        Self {
            steps: Mutex::new(Budget::default()),
            allocs: Mutex::new(Budget::default()),
            cancelled: AtomicBool::new(false),
            cancel: Mutex::new(CancelState::default()),
        }
    }

    fn cancel_reason(&self) -> Option<Arc<CancelReason>> {
        if !self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        self.cancel.lock().expect("poisoned").reason.clone()
    }

    fn check_cancelled(&self) -> Result<(), SafetyError> {
        match self.cancel_reason() {
            Some(reason) => Err(SafetyError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// One-way Active → Cancelled. The first reason sticks.
    fn cancel(&self, reason: Arc<CancelReason>) -> bool {
        let (won, done, detach) = {
            let mut state = self.cancel.lock().expect("poisoned");
            if state.reason.is_some() {
                (false, None, None)
            } else {
                state.reason = Some(Arc::clone(&reason));
                self.cancelled.store(true, Ordering::Release);
                (true, state.done.clone(), state.detach.take())
            }
        };
        if won {
            tracing::debug!(reason = %reason, "thread cancelled");
            if let Some(done) = done {
                done.close();
            }
            if let Some(detach) = detach {
                detach.detach();
            }
        }
        won
    }

    fn done(&self) -> Done {
        let mut state = self.cancel.lock().expect("poisoned");
        if let Some(done) = &state.done {
            return done.clone();
        }
        let done = Done::new();
        if state.reason.is_some() {
            done.close();
        }
        state.done = Some(done.clone());
        done
    }

    fn count(budget: &Mutex<Budget>) -> SafeInt {
        budget.lock().expect("poisoned").count
    }

    fn set_max(budget: &Mutex<Budget>, max: SafeInt) {
        budget.lock().expect("poisoned").max = max;
    }

    /// Simulate a debit without committing it. Idempotent.
    fn check(&self, budget: &Mutex<Budget>, delta: SafeInt, kind: BudgetKind) -> Result<(), SafetyError> {
        let b = budget.lock().expect("poisoned");
        self.check_cancelled()?;
        let new = b.count + delta;
        match new.get() {
            None => Err(SafetyError::InvalidCount),
            Some(v) if v < 0 => Err(SafetyError::InvalidCount),
            Some(v) => match b.limit() {
                Some(m) if v > m => Err(kind.over(new, b.max)),
                _ => Ok(()),
            },
        }
    }

    /// Commit a debit. On a breach the new count is still committed, the
    /// thread is cancelled with the budget error as reason, and the error
    /// is returned; the counter poisons to invalid on over/underflow.
    fn add(&self, budget: &Mutex<Budget>, delta: SafeInt, kind: BudgetKind) -> Result<(), SafetyError> {
        let err = {
            let mut b = budget.lock().expect("poisoned");
            self.check_cancelled()?;
            let new = b.count + delta;
            match new.get() {
                None => {
                    b.count = SafeInt::INVALID;
                    SafetyError::InvalidCount
                }
                Some(v) if v < 0 => {
                    b.count = SafeInt::INVALID;
                    SafetyError::InvalidCount
                }
                Some(v) => {
                    b.count = new;
                    match b.limit() {
                        Some(m) if v > m => kind.over(new, b.max),
                        _ => return Ok(()),
                    }
                }
            }
        };
        tracing::debug!(error = %err, "budget exhausted");
        self.cancel(Arc::new(CancelReason::with_cause(
            kind.reason_message(),
            Arc::new(err.clone()),
        )));
        Err(err)
    }
}

#[derive(Clone, Copy)]
enum BudgetKind {
    Steps,
    Allocs,
}

impl BudgetKind {
    fn over(self, count: SafeInt, max: SafeInt) -> SafetyError {
        match self {
            Self::Steps => SafetyError::TooManySteps { steps: count, max },
            Self::Allocs => SafetyError::TooManyAllocs { allocs: count, max },
        }
    }

    fn reason_message(self) -> &'static str {
        match self {
            Self::Steps => "too many steps",
            Self::Allocs => "too many allocations",
        }
    }
}

/// A `Send + Sync` view of a thread's counters and cancellation state, for
/// supervisor tasks.
#[derive(Clone)]
pub struct ThreadHandle {
    shared: Arc<ThreadShared>,
}

impl ThreadHandle {
    /// Cancel the thread. The first reason sticks.
    pub fn cancel(&self, reason: impl Into<CancelReason>) {
        self.shared.cancel(Arc::new(reason.into()));
    }

    /// The cancellation reason, if the thread is cancelled.
    pub fn err(&self) -> Option<Arc<CancelReason>> {
        self.shared.cancel_reason()
    }

    /// Executed steps so far.
    pub fn steps(&self) -> SafeInt {
        ThreadShared::count(&self.shared.steps)
    }

    /// Debited allocation bytes so far.
    pub fn allocs(&self) -> SafeInt {
        ThreadShared::count(&self.shared.allocs)
    }

    /// Simulate a step debit; see [`Thread::check_steps`].
    pub fn check_steps(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.check(&self.shared.steps, delta.into(), BudgetKind::Steps)
    }

    /// Commit a step debit; see [`Thread::add_steps`].
    pub fn add_steps(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.add(&self.shared.steps, delta.into(), BudgetKind::Steps)
    }

    /// Simulate an allocation debit; see [`Thread::check_allocs`].
    pub fn check_allocs(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.check(&self.shared.allocs, delta.into(), BudgetKind::Allocs)
    }

    /// Commit an allocation debit; see [`Thread::add_allocs`].
    pub fn add_allocs(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.add(&self.shared.allocs, delta.into(), BudgetKind::Allocs)
    }
}

impl core::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("steps", &self.steps())
            .field("allocs", &self.allocs())
            .field("cancelled", &self.err().is_some())
            .finish()
    }
}

/// One entry of the live call stack: the callable plus its current program
/// counter. Register windows live in pooled frames, not here.
pub(crate) struct CallRecord {
    pub(crate) callable: Value,
    pub(crate) pc: u32,
}

/// Per-execution interpreter state.
pub struct Thread {
    /// Diagnostic name, surfaced in traces.
    name: String,
    shared: Arc<ThreadShared>,
    required: Safety,
    locals: HashMap<String, Arc<dyn Any + Send + Sync>>,
    pub(crate) stack: Vec<CallRecord>,
    pub(crate) pool: FramePool,
    pub(crate) profiler: Profiler,
    pub(crate) load: Option<LoadFn>,
    pub(crate) print: Option<PrintFn>,
    pub(crate) started: bool,
}

impl Default for Thread {
    fn default() -> Self {
        Self::new("petrel")
    }
}

impl Thread {
    /// A thread with no quotas, no required safety, and no parent context.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(ThreadShared::new()),
            required: Safety::empty(),
            locals: HashMap::new(),
            stack: Vec::new(),
            pool: FramePool::default(),
            profiler: Profiler::default(),
            load: None,
            print: None,
            started: false,
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A shareable supervisor view of this thread's counters and
    /// cancellation state.
    pub fn handle(&self) -> ThreadHandle {
        ThreadHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Attach a parent context: cancellation of `ctx` cancels this thread
    /// with the cause propagated.
    ///
    /// # Panics
    ///
    /// Panics when called twice, or after execution has begun.
    pub fn set_parent_context(&mut self, ctx: &CancelContext) {
        assert!(!self.started, "set_parent_context called after execution began");
        let mut state = self.shared.cancel.lock().expect("poisoned");
        assert!(state.parent.is_none(), "set_parent_context called twice");
        state.parent = Some(ctx.clone());
        drop(state);

        let shared = Arc::clone(&self.shared);
        let detach = ctx.on_cancel(Box::new(move |cause| {
            shared.cancel(Arc::new(CancelReason::with_cause(
                "parent context cancelled",
                cause,
            )));
        }));
        self.shared.cancel.lock().expect("poisoned").detach = Some(detach);
    }

    /// The thread's context view.
    pub fn context(&self) -> ThreadContext<'_> {
        ThreadContext { thread: self }
    }

    /// Set the step limit. Zero, negative, or invalid means no limit.
    pub fn set_max_steps(&self, max: impl Into<SafeInt>) {
        ThreadShared::set_max(&self.shared.steps, max.into());
    }

    /// Executed steps so far.
    pub fn steps(&self) -> SafeInt {
        ThreadShared::count(&self.shared.steps)
    }

    /// Simulate a step debit: error if it would exceed the limit or the
    /// thread is cancelled. Never mutates.
    pub fn check_steps(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.check(&self.shared.steps, delta.into(), BudgetKind::Steps)
    }

    /// Commit a step debit. A result over the limit cancels the thread with
    /// the "too many steps" error and returns it; the increment itself is
    /// observable.
    pub fn add_steps(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.add(&self.shared.steps, delta.into(), BudgetKind::Steps)
    }

    /// Set the allocation limit in bytes. Zero, negative, or invalid means
    /// no limit.
    pub fn set_max_allocs(&self, max: impl Into<SafeInt>) {
        ThreadShared::set_max(&self.shared.allocs, max.into());
    }

    /// Debited allocation bytes so far.
    pub fn allocs(&self) -> SafeInt {
        ThreadShared::count(&self.shared.allocs)
    }

    /// Simulate an allocation debit. Never mutates.
    pub fn check_allocs(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.check(&self.shared.allocs, delta.into(), BudgetKind::Allocs)
    }

    /// Commit an allocation debit. Deltas may be negative (releases); a
    /// total that underflows zero or overflows poisons the counter and
    /// fails the thread permanently.
    pub fn add_allocs(&self, delta: impl Into<SafeInt>) -> Result<(), SafetyError> {
        self.shared.add(&self.shared.allocs, delta.into(), BudgetKind::Allocs)
    }

    /// Add flags to the set this thread requires of every callable.
    pub fn require_safety(&mut self, flags: Safety) {
        self.required = self.required.union(flags);
    }

    /// The required safety set.
    pub fn required_safety(&self) -> Safety {
        self.required
    }

    /// Whether `v`'s advertised safety satisfies this thread's requirements.
    pub fn permits(&self, v: &Value) -> bool {
        v.safety().permits(self.required)
    }

    /// Like [`Thread::permits`], with a descriptive per-call error. Does not
    /// cancel the thread.
    pub fn check_permits(&self, v: &Value) -> Result<(), SafetyError> {
        v.safety().check_permits(self.required)
    }

    /// Cancel the thread. The first reason sticks; it closes the done
    /// signal and detaches from the parent context.
    pub fn cancel(&self, reason: impl Into<CancelReason>) {
        self.shared.cancel(Arc::new(reason.into()));
    }

    /// Store a thread-local value.
    ///
    /// # Panics
    ///
    /// Panics when called after execution has begun; the map is not
    /// synchronised.
    pub fn set_local(&mut self, key: impl Into<String>, v: Arc<dyn Any + Send + Sync>) {
        assert!(!self.started, "set_local called after execution began");
        self.locals.insert(key.into(), v);
    }

    /// Read a thread-local value.
    pub fn local(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.locals.get(key).map(Arc::clone)
    }

    /// Snapshot of the frame `depth` levels below the innermost call, or
    /// `None` past the bottom.
    pub fn call_frame(&self, depth: usize) -> Option<StackFrame> {
        let i = self.stack.len().checked_sub(depth.checked_add(1)?)?;
        Some(frame_view(&self.stack[i]))
    }

    /// Snapshot of the whole call stack, outermost first.
    pub fn call_stack(&self) -> CallStack {
        CallStack::new(self.stack.iter().map(frame_view).collect())
    }

    /// Current call depth, frames.
    pub fn call_stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Pre-grow the free-list of frames by `n`, amortising future pushes.
    pub fn ensure_stack(&mut self, n: usize) {
        self.pool.reserve(n);
    }

    /// Install the module loader invoked by load statements.
    pub fn set_load(&mut self, load: LoadFn) {
        self.load = Some(load);
    }

    /// Install the print callback.
    pub fn set_print(&mut self, print: PrintFn) {
        self.print = Some(print);
    }

    /// Deliver a message through the print callback, if one is installed.
    pub fn print(&mut self, msg: &str) {
        if let Some(mut print) = self.print.take() {
            print(self, msg);
            self.print = Some(print);
        }
    }

    /// The profiler attached to this thread.
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Mutable access to the profiler, to install a receiver.
    pub fn profiler_mut(&mut self) -> &mut Profiler {
        &mut self.profiler
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), SafetyError> {
        self.shared.check_cancelled()
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("steps", &self.steps())
            .field("allocs", &self.allocs())
            .field("required", &self.required)
            .field("depth", &self.stack.len())
            .finish()
    }
}

pub(crate) fn frame_view(rec: &CallRecord) -> StackFrame {
    match &rec.callable {
        Value::Function(c) => StackFrame::new(
            Arc::from(c.code.name.as_str()),
            Arc::clone(&c.module.filename),
            c.code.position_at(rec.pc),
        ),
        Value::Native(n) => StackFrame::new(
            Arc::from(n.name()),
            Arc::from("<builtin>"),
            Default::default(),
        ),
        other => StackFrame::new(
            Arc::from(other.type_name()),
            Arc::from("<unknown>"),
            Default::default(),
        ),
    }
}

/// Context view of a thread: deadline, done signal, cancellation error, and
/// key→value lookup over thread-locals and the parent context.
pub struct ThreadContext<'a> {
    thread: &'a Thread,
}

impl ThreadContext<'_> {
    /// The parent context's deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let state = self.thread.shared.cancel.lock().expect("poisoned");
        state.parent.as_ref().and_then(CancelContext::deadline)
    }

    /// The thread's done signal, created on first use.
    pub fn done(&self) -> Done {
        self.thread.shared.done()
    }

    /// The cancellation error, if the thread is cancelled.
    pub fn err(&self) -> Option<SafetyError> {
        self.thread
            .shared
            .cancel_reason()
            .map(SafetyError::Cancelled)
    }

    /// Look up `key` in the thread-locals, then in the parent context.
    pub fn value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        if let Some(v) = self.thread.local(key) {
            return Some(v);
        }
        let state = self.thread.shared.cancel.lock().expect("poisoned");
        state.parent.as_ref().and_then(|ctx| ctx.value(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_accumulate_without_a_limit() {
        let t = Thread::new("t");
        t.add_steps(10u32).unwrap();
        t.add_steps(32u32).unwrap();
        assert_eq!(t.steps().get(), Some(42));
    }

    #[test]
    fn step_breach_cancels_and_commits() {
        let t = Thread::new("t");
        t.set_max_steps(100);
        t.add_steps(100u32).unwrap();
        let err = t.add_steps(1u32).unwrap_err();
        assert!(matches!(err, SafetyError::TooManySteps { .. }));
        // The increment is observable and the thread is now cancelled.
        assert_eq!(t.steps().get(), Some(101));
        assert!(t.context().err().is_some());
        assert!(matches!(
            t.add_steps(1u32).unwrap_err(),
            SafetyError::Cancelled(_)
        ));
    }

    #[test]
    fn check_is_idempotent_and_does_not_mutate() {
        let t = Thread::new("t");
        t.set_max_allocs(1000);
        t.check_allocs(900u32).unwrap();
        t.check_allocs(900u32).unwrap();
        assert_eq!(t.allocs().get(), Some(0));
        let e1 = t.check_allocs(1001u32).unwrap_err();
        let e2 = t.check_allocs(1001u32).unwrap_err();
        assert!(matches!(e1, SafetyError::TooManyAllocs { .. }));
        assert!(matches!(e2, SafetyError::TooManyAllocs { .. }));
        assert_eq!(t.allocs().get(), Some(0));
    }

    #[test]
    fn alloc_underflow_poisons_permanently() {
        let t = Thread::new("t");
        t.add_allocs(10u32).unwrap();
        let err = t.add_allocs(-20i64).unwrap_err();
        assert!(matches!(err, SafetyError::InvalidCount));
        assert!(!t.allocs().valid());
        // Poisoning cancels; later debits fail with the same identity.
        assert!(t.add_allocs(1u32).is_err());
    }

    #[test]
    fn negative_alloc_deltas_release_budget() {
        let t = Thread::new("t");
        t.set_max_allocs(100);
        t.add_allocs(80u32).unwrap();
        t.add_allocs(-50i64).unwrap();
        t.add_allocs(60u32).unwrap();
        assert_eq!(t.allocs().get(), Some(90));
    }

    #[test]
    fn cancel_reason_is_single_assignment() {
        let t = Thread::new("t");
        t.cancel("first");
        t.cancel("second");
        match t.add_steps(1u32).unwrap_err() {
            SafetyError::Cancelled(reason) => assert_eq!(reason.message(), "first"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn done_signal_closes_on_cancel() {
        let t = Thread::new("t");
        let done = t.context().done();
        assert!(!done.is_closed());
        t.cancel("stop");
        assert!(done.is_closed());
        assert!(t.context().err().is_some());
    }

    #[test]
    fn supervisor_handle_observes_and_cancels() {
        let t = Thread::new("t");
        let handle = t.handle();
        t.add_steps(5u32).unwrap();
        assert_eq!(handle.steps().get(), Some(5));
        let joined = std::thread::spawn(move || handle.cancel("supervisor"));
        joined.join().unwrap();
        assert!(matches!(
            t.check_steps(1u32).unwrap_err(),
            SafetyError::Cancelled(_)
        ));
    }

    #[test]
    fn parent_cancellation_propagates_the_cause() {
        let ctx = CancelContext::new();
        let mut t = Thread::new("t");
        t.set_parent_context(&ctx);
        ctx.cancel("deadline");
        let cause = ctx.err().unwrap();
        match t.add_steps(1u32).unwrap_err() {
            SafetyError::Cancelled(reason) => {
                assert!(reason.has_cause(&cause));
                assert_eq!(reason.message(), "parent context cancelled");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn context_values_prefer_thread_locals() {
        let ctx = CancelContext::new();
        ctx.set_value("k", Arc::new("parent"));
        ctx.set_value("only-parent", Arc::new(7u8));
        let mut t = Thread::new("t");
        t.set_parent_context(&ctx);
        t.set_local("k", Arc::new("local"));
        let got = t.context().value("k").unwrap();
        assert_eq!(*got.downcast_ref::<&str>().unwrap(), "local");
        assert!(t.context().value("only-parent").is_some());
        assert!(t.context().value("absent").is_none());
    }

    #[test]
    #[should_panic(expected = "set_parent_context called twice")]
    fn second_parent_context_is_a_programming_error() {
        let mut t = Thread::new("t");
        t.set_parent_context(&CancelContext::new());
        t.set_parent_context(&CancelContext::new());
    }

    #[test]
    fn zero_and_negative_limits_mean_unlimited() {
        let t = Thread::new("t");
        t.set_max_steps(0);
        t.add_steps(1_000_000u32).unwrap();
        t.set_max_allocs(-5i64);
        t.add_allocs(1_000_000u32).unwrap();
    }
}
