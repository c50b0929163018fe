//! Host-side cancellation plumbing.
//!
//! A [`CancelContext`] is the parent a host attaches to one or more threads:
//! cancelling it, or reaching its deadline, propagates a [`CancelReason`]
//! with its cause chain intact into every attached thread. A [`Done`] is the
//! closable signal both contexts and threads hand out to waiters.

use core::fmt;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Why a thread or context entered the cancelled state.
///
/// Reasons form a cause chain through [`std::error::Error::source`], so a
/// caller holding the original cause can recognise it by identity after it
/// has been wrapped by propagation.
#[derive(Debug)]
pub struct CancelReason {
    message: String,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl CancelReason {
    /// A reason with no underlying cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// A reason wrapping an underlying cause.
    pub fn with_cause(
        message: impl Into<String>,
        cause: Arc<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause),
        }
    }

    /// The reason message, without the cause chain.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether `target` appears in this reason's cause chain, by identity.
    pub fn has_cause(&self, target: &Arc<CancelReason>) -> bool {
        let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = cur {
            if let Some(reason) = err.downcast_ref::<CancelReason>() {
                if std::ptr::eq(reason, Arc::as_ptr(target)) {
                    return true;
                }
            }
            cur = err.source();
        }
        false
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {cause}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CancelReason {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for CancelReason {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for CancelReason {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A closable signal. Cloning shares the signal; closing is permanent.
#[derive(Debug, Clone)]
pub struct Done {
    inner: Arc<DoneInner>,
}

#[derive(Debug)]
struct DoneInner {
    closed: Mutex<bool>,
    cv: Condvar,
}

impl Done {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(DoneInner {
                closed: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn close(&self) {
        let mut closed = self.inner.closed.lock().expect("poisoned");
        *closed = true;
        self.inner.cv.notify_all();
    }

    /// Whether the signal has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock().expect("poisoned")
    }

    /// Block until the signal closes.
    pub fn wait(&self) {
        let mut closed = self.inner.closed.lock().expect("poisoned");
        while !*closed {
            closed = self.inner.cv.wait(closed).expect("poisoned");
        }
    }

    /// Block until the signal closes or `timeout` elapses. Returns whether
    /// the signal is closed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut closed = self.inner.closed.lock().expect("poisoned");
        while !*closed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cv
                .wait_timeout(closed, deadline - now)
                .expect("poisoned");
            closed = guard;
        }
        true
    }
}

type CancelHook = Box<dyn FnOnce(Arc<CancelReason>) + Send>;

#[derive(Default)]
struct CtxState {
    reason: Option<Arc<CancelReason>>,
    done: Option<Done>,
    hooks: Vec<(u64, CancelHook)>,
    next_hook_id: u64,
}

struct CtxInner {
    deadline: Option<Instant>,
    values: Mutex<Vec<(String, Arc<dyn Any + Send + Sync>)>>,
    cancelled: AtomicBool,
    state: Mutex<CtxState>,
}

/// A cancellable parent context for threads.
#[derive(Clone)]
pub struct CancelContext {
    inner: Arc<CtxInner>,
}

impl fmt::Debug for CancelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelContext")
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.inner.cancelled.load(Ordering::Acquire))
            .finish()
    }
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelContext {
    /// A context with no deadline; cancelled only explicitly.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CtxInner {
                deadline: None,
                values: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
                state: Mutex::new(CtxState::default()),
            }),
        }
    }

    /// A context that self-cancels with a "deadline exceeded" reason when
    /// `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        let ctx = Self {
            inner: Arc::new(CtxInner {
                deadline: Some(deadline),
                values: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
                state: Mutex::new(CtxState::default()),
            }),
        };
        let watcher = ctx.clone();
        let done = ctx.done();
        std::thread::spawn(move || loop {
            if watcher.inner.cancelled.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                watcher.cancel(CancelReason::new("deadline exceeded"));
                return;
            }
            if done.wait_for(deadline - now) {
                return;
            }
        });
        ctx
    }

    /// A context that self-cancels after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// The configured deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Attach a key/value pair visible through [`CancelContext::value`] and
    /// every attached thread's context view.
    pub fn set_value(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.inner
            .values
            .lock()
            .expect("poisoned")
            .push((key.into(), value));
    }

    /// Look up a context value. Later insertions shadow earlier ones.
    pub fn value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        let values = self.inner.values.lock().expect("poisoned");
        values
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| Arc::clone(v))
    }

    /// Cancel the context. The first reason sticks; later calls are no-ops.
    /// Returns whether this call was the one that cancelled.
    pub fn cancel(&self, reason: impl Into<CancelReason>) -> bool {
        let reason = Arc::new(reason.into());
        let (won, done, hooks) = {
            let mut state = self.inner.state.lock().expect("poisoned");
            if state.reason.is_some() {
                (false, None, Vec::new())
            } else {
                state.reason = Some(Arc::clone(&reason));
                self.inner.cancelled.store(true, Ordering::Release);
                let hooks = std::mem::take(&mut state.hooks);
                (true, state.done.clone(), hooks)
            }
        };
        if won {
            tracing::debug!(reason = %reason, "context cancelled");
            if let Some(done) = done {
                done.close();
            }
            for (_, hook) in hooks {
                hook(Arc::clone(&reason));
            }
        }
        won
    }

    /// The cancellation reason, if the context is cancelled.
    pub fn err(&self) -> Option<Arc<CancelReason>> {
        self.inner.state.lock().expect("poisoned").reason.clone()
    }

    /// The done signal, created on first use; closed if already cancelled.
    pub fn done(&self) -> Done {
        let mut state = self.inner.state.lock().expect("poisoned");
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

    /// Register a hook run once on cancellation. If the context is already
    /// cancelled the hook runs immediately on this task.
    pub(crate) fn on_cancel(&self, hook: CancelHook) -> Detach {
        let immediate = {
            let mut state = self.inner.state.lock().expect("poisoned");
            match &state.reason {
                Some(reason) => Some(Arc::clone(reason)),
                None => {
                    let id = state.next_hook_id;
                    state.next_hook_id += 1;
                    state.hooks.push((id, hook));
                    return Detach {
                        ctx: Arc::downgrade(&self.inner),
                        id,
                    };
                }
            }
        };
        if let Some(reason) = immediate {
            hook(reason);
        }
        Detach {
            ctx: Weak::new(),
            id: u64::MAX,
        }
    }
}

/// Handle that removes a registered cancellation hook, detaching its owner
/// from the context. Dropping it detaches too.
pub(crate) struct Detach {
    ctx: Weak<CtxInner>,
    id: u64,
}

impl Detach {
    pub(crate) fn detach(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            let mut state = ctx.state.lock().expect("poisoned");
            state.hooks.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Detach {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Detach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detach").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn first_cancel_sticks() {
        let ctx = CancelContext::new();
        assert!(ctx.err().is_none());
        assert!(ctx.cancel("first"));
        assert!(!ctx.cancel("second"));
        assert_eq!(ctx.err().unwrap().message(), "first");
    }

    #[test]
    fn done_closes_on_cancel() {
        let ctx = CancelContext::new();
        let done = ctx.done();
        assert!(!done.is_closed());
        ctx.cancel("stop");
        assert!(done.is_closed());
        // A signal requested after cancellation is born closed.
        assert!(ctx.done().is_closed());
        done.wait();
    }

    #[test]
    fn hooks_fire_once_with_the_reason() {
        let ctx = CancelContext::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let _keep = ctx.on_cancel(Box::new(move |reason| {
            assert_eq!(reason.message(), "why");
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        ctx.cancel("why");
        ctx.cancel("again");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_on_cancelled_context_fires_immediately() {
        let ctx = CancelContext::new();
        ctx.cancel("done already");
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let _keep = ctx.on_cancel(Box::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_removes_the_hook() {
        let ctx = CancelContext::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        let detach = ctx.on_cancel(Box::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        detach.detach();
        ctx.cancel("nobody home");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deadline_cancels_with_deadline_reason() {
        let ctx = CancelContext::with_timeout(Duration::from_millis(20));
        assert!(ctx.done().wait_for(Duration::from_secs(5)));
        assert_eq!(ctx.err().unwrap().message(), "deadline exceeded");
    }

    #[test]
    fn cause_chain_is_recognisable_by_identity() {
        let root = Arc::new(CancelReason::new("deadline"));
        let wrapped = CancelReason::with_cause("parent context cancelled", root.clone());
        assert!(wrapped.has_cause(&root));
        let unrelated = Arc::new(CancelReason::new("deadline"));
        assert!(!wrapped.has_cause(&unrelated));
        assert_eq!(wrapped.to_string(), "parent context cancelled: deadline");
    }

    #[test]
    fn values_shadow_by_recency() {
        let ctx = CancelContext::new();
        ctx.set_value("user", Arc::new(1u32));
        ctx.set_value("user", Arc::new(2u32));
        let got = ctx.value("user").unwrap();
        assert_eq!(*got.downcast_ref::<u32>().unwrap(), 2);
        assert!(ctx.value("missing").is_none());
    }
}
