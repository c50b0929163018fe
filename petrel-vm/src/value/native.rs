//! Host callables.

use crate::error::EvalError;
use crate::safety::Safety;
use crate::thread::Thread;
use crate::value::Value;

/// A callable the host exposes to programs.
///
/// Every callable carries an advertised safety set, immutable once the
/// value is constructed; the VM verifies it against the thread's required
/// set before the body runs.
pub trait NativeCallable: Send + Sync {
    /// The callable's name, for diagnostics and backtraces.
    fn name(&self) -> &str;

    /// The advertised safety set. Empty by default.
    fn safety(&self) -> Safety {
        Safety::empty()
    }

    /// Invoke with positional and keyword arguments.
    fn call(
        &self,
        thread: &mut Thread,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, EvalError>;
}

type NativeBody =
    dyn Fn(&mut Thread, Vec<Value>, Vec<(String, Value)>) -> Result<Value, EvalError> + Send + Sync;

/// A [`NativeCallable`] backed by a closure.
pub struct NativeFn {
    name: String,
    safety: Safety,
    body: Box<NativeBody>,
}

impl NativeFn {
    /// A named host function with the given advertised safety.
    pub fn new<F>(name: impl Into<String>, safety: Safety, body: F) -> Self
    where
        F: Fn(&mut Thread, Vec<Value>, Vec<(String, Value)>) -> Result<Value, EvalError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            safety,
            body: Box::new(body),
        }
    }

    /// Wrap into a value.
    pub fn into_value(self) -> Value {
        Value::Native(std::sync::Arc::new(self))
    }
}

impl NativeCallable for NativeFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn safety(&self) -> Safety {
        self.safety
    }

    fn call(
        &self,
        thread: &mut Thread,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, EvalError> {
        (self.body)(thread, args, kwargs)
    }
}

impl core::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NativeFn({}, safety={})", self.name, self.safety)
    }
}
