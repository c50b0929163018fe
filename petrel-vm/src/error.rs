//! Runtime interpreter error implementation.
//!
//! Three kinds are kept distinct by construction: safety errors (budgets,
//! capability gating, cancellation) which the host can recover from outside
//! the VM; evaluation errors, wrapped in [`EvalError`] at the outermost VM
//! boundary with a call-stack snapshot; and programmer errors, which panic.

use core::fmt;
use std::sync::Arc;

use petrel_bytecode::ProgramError;

use crate::backtrace::CallStack;
use crate::checked::SafeInt;
use crate::context::CancelReason;
use crate::safety::Safety;

/// Safety-system failure: a budget breach, a capability mismatch, or a
/// cancelled thread.
#[derive(Debug, Clone, derive_more::Display)]
pub enum SafetyError {
    /// The step budget was exceeded.
    #[display(fmt = "too many steps: {steps}, max {max}")]
    TooManySteps {
        /// Counter value the rejected debit would have produced.
        steps: SafeInt,
        /// Configured limit.
        max: SafeInt,
    },
    /// The allocation budget was exceeded.
    #[display(fmt = "too many allocations: {allocs} bytes, max {max}")]
    TooManyAllocs {
        /// Counter value the rejected debit would have produced.
        allocs: SafeInt,
        /// Configured limit.
        max: SafeInt,
    },
    /// The callable does not advertise every required flag.
    #[display(fmt = "missing safety flags: {missing}")]
    MissingSafety {
        /// The required flags the callable lacks.
        missing: Safety,
    },
    /// A raw bit pattern carries bits above the legal mask.
    #[display(fmt = "illegal safety flag bits 0x{bits:02x}")]
    IllegalFlags {
        /// The offending pattern.
        bits: u8,
    },
    /// The thread was cancelled.
    #[display(fmt = "cancelled: {_0}")]
    Cancelled(Arc<CancelReason>),
    /// A counter was poisoned by overflow or underflow.
    #[display(fmt = "invalid resource counter")]
    InvalidCount,
}

impl std::error::Error for SafetyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled(reason) => Some(reason.as_ref()),
            _ => None,
        }
    }
}

impl SafetyError {
    /// The cancellation cause, if this error is a cancellation.
    pub fn cancel_reason(&self) -> Option<&Arc<CancelReason>> {
        match self {
            Self::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Evaluation failure raised by an instruction or a built-in.
///
/// Variants cover everything a well-formed program can provoke at run time;
/// malformed programs and misused core APIs panic instead.
#[derive(Debug, Clone, derive_more::Display)]
#[non_exhaustive]
pub enum RuntimeError {
    /// A safety error surfaced through an instruction.
    #[display(fmt = "{_0}")]
    Safety(SafetyError),
    /// The program failed structural validation.
    #[display(fmt = "{_0}")]
    Program(ProgramError),
    /// The operand types admit no such binary operation.
    #[display(fmt = "unknown binary op: {left} {op} {right}")]
    UnsupportedBinary {
        /// Operator token.
        op: &'static str,
        /// Left operand type.
        left: &'static str,
        /// Right operand type.
        right: &'static str,
    },
    /// The operand type admits no such unary operation.
    #[display(fmt = "unknown unary op: {op} {type_name}")]
    UnsupportedUnary {
        /// Operator token.
        op: &'static str,
        /// Operand type.
        type_name: &'static str,
    },
    /// Integer or float division or modulo by zero.
    #[display(fmt = "division by zero")]
    DivisionByZero,
    /// An integer too large for conversion to float.
    #[display(fmt = "int too large to convert to float")]
    FloatOverflow,
    /// The shift count is negative.
    #[display(fmt = "negative shift count")]
    NegativeShift,
    /// The shift count exceeds the supported maximum.
    #[display(fmt = "shift count too large: {count}")]
    LargeShift {
        /// The offending count.
        count: i64,
    },
    /// Iteration was requested of a non-iterable value.
    #[display(fmt = "{type_name} value is not iterable")]
    NotIterable {
        /// Operand type.
        type_name: &'static str,
    },
    /// A call was made to a non-callable value.
    #[display(fmt = "invalid call of non-function ({type_name})")]
    NotCallable {
        /// Operand type.
        type_name: &'static str,
    },
    /// Subscripting was requested of a non-indexable value.
    #[display(fmt = "unhandled index operation {type_name}[{index_type}]")]
    NotIndexable {
        /// Container type.
        type_name: &'static str,
        /// Index type.
        index_type: &'static str,
    },
    /// Item assignment was requested of a value that does not support it.
    #[display(fmt = "{type_name} value does not support item assignment")]
    NotSettable {
        /// Container type.
        type_name: &'static str,
    },
    /// Slicing was requested of a non-sliceable value.
    #[display(fmt = "invalid slice operand {type_name}")]
    NotSliceable {
        /// Operand type.
        type_name: &'static str,
    },
    /// A sequence index is out of range.
    #[display(fmt = "index {index} out of range: [0:{len}]")]
    IndexOutOfRange {
        /// The probed index, after negative-index adjustment.
        index: i64,
        /// Sequence length.
        len: usize,
    },
    /// A mapping has no such key.
    #[display(fmt = "key {key} not found")]
    KeyNotFound {
        /// Display form of the probed key.
        key: String,
    },
    /// A value that does not hash was used as a mapping key.
    #[display(fmt = "unhashable type: {type_name}")]
    Unhashable {
        /// Offending type.
        type_name: &'static str,
    },
    /// The value has no such attribute.
    #[display(
        fmt = "{type_name} has no .{name} attribute{}",
        "hint.as_deref().map(|h| format!(\" (did you mean .{h}?)\")).unwrap_or_default()"
    )]
    NoAttr {
        /// Value type.
        type_name: &'static str,
        /// Probed attribute name.
        name: String,
        /// Near-miss spelling suggestion.
        hint: Option<String>,
    },
    /// The value admits no field assignment with this name.
    #[display(fmt = "can't assign to .{name} field of {type_name}")]
    NoField {
        /// Value type.
        type_name: &'static str,
        /// Probed field name.
        name: String,
    },
    /// Mutation of a frozen value.
    #[display(fmt = "cannot modify frozen {type_name}")]
    Immutable {
        /// Value type.
        type_name: &'static str,
    },
    /// Mutation of a value pinned by an active iteration.
    #[display(fmt = "{type_name} changed during iteration")]
    MutatedDuringIteration {
        /// Value type.
        type_name: &'static str,
    },
    /// Unpacking produced fewer values than requested.
    #[display(fmt = "too few values to unpack (got {got}, want {want})")]
    UnpackTooFew {
        /// Requested arity.
        want: u32,
        /// Produced arity.
        got: u32,
    },
    /// Unpacking produced more values than requested.
    #[display(fmt = "too many values to unpack (want {want})")]
    UnpackTooMany {
        /// Requested arity.
        want: u32,
    },
    /// A repeat would produce an excessive number of elements; refused
    /// before any allocation.
    #[display(fmt = "excessive repeat ({elems} elements)")]
    ExcessiveRepeat {
        /// Element count of the refused result.
        elems: u64,
    },
    /// Slice step of zero.
    #[display(fmt = "zero is not a valid slice step")]
    ZeroStep,
    /// The call-stack depth limit was reached.
    #[display(fmt = "call stack overflow")]
    StackOverflow,
    /// Recursive self-invocation without the program's recursion flag.
    #[display(fmt = "function {name} called recursively")]
    RecursionDisallowed {
        /// The re-entered function.
        name: String,
    },
    /// A local was read before assignment.
    #[display(fmt = "local variable {name} referenced before assignment")]
    UnboundLocal {
        /// Variable name.
        name: String,
    },
    /// A global was read before assignment.
    #[display(fmt = "global variable {name} referenced before assignment")]
    UnboundGlobal {
        /// Variable name.
        name: String,
    },
    /// A predeclared or universe name is missing at run time.
    #[display(
        fmt = "undefined name {name}{}",
        "hint.as_deref().map(|h| format!(\" (did you mean {h}?)\")).unwrap_or_default()"
    )]
    UndefinedName {
        /// Probed name.
        name: String,
        /// Near-miss spelling suggestion.
        hint: Option<String>,
    },
    /// A load statement on a thread with no module loader.
    #[display(fmt = "load not implemented by this host")]
    LoadUnsupported,
    /// The loaded module does not define a requested name.
    #[display(
        fmt = "load: name {name} not found in module {module}{}",
        "hint.as_deref().map(|h| format!(\" (did you mean {h}?)\")).unwrap_or_default()"
    )]
    LoadNameMissing {
        /// The loaded module.
        module: String,
        /// The missing name.
        name: String,
        /// Near-miss spelling suggestion.
        hint: Option<String>,
    },
    /// `**kwargs` carried a non-string key.
    #[display(fmt = "keywords must be strings, got {type_name}")]
    KwargsNonStringKey {
        /// Offending key type.
        type_name: &'static str,
    },
    /// The same keyword argument was given twice.
    #[display(fmt = "duplicate keyword argument: {name}")]
    DuplicateKeyword {
        /// The repeated keyword.
        name: String,
    },
    /// A dict literal repeats a key.
    #[display(fmt = "duplicate key: {key}")]
    DuplicateDictKey {
        /// Display form of the repeated key.
        key: String,
    },
    /// A mandatory parameter was not supplied.
    #[display(fmt = "{func}: missing argument for {name}")]
    MissingArgument {
        /// Callee name.
        func: String,
        /// Parameter name.
        name: String,
    },
    /// A keyword argument matches no parameter.
    #[display(fmt = "{func}: unexpected keyword argument {name}")]
    UnexpectedKeyword {
        /// Callee name.
        func: String,
        /// The unmatched keyword.
        name: String,
    },
    /// More positional arguments than positional parameters.
    #[display(fmt = "{func}: got {got} arguments, want at most {want}")]
    TooManyPositional {
        /// Callee name.
        func: String,
        /// Positional parameter count.
        want: usize,
        /// Positional argument count.
        got: usize,
    },
    /// A parameter was bound both positionally and by keyword.
    #[display(fmt = "{func}: got multiple values for parameter {name}")]
    MultipleValues {
        /// Callee name.
        func: String,
        /// The twice-bound parameter.
        name: String,
    },
    /// A string interpolation failed.
    #[display(fmt = "{msg}")]
    Format {
        /// Human-readable description.
        msg: String,
    },
    /// Comparison of a cyclic or too deeply nested value graph.
    #[display(fmt = "comparison exceeded maximum recursion depth")]
    ComparisonDepth,
    /// Ordered comparison of types with no defined order.
    #[display(fmt = "{left} < {right} not implemented")]
    NotComparable {
        /// Left operand type.
        left: &'static str,
        /// Right operand type.
        right: &'static str,
    },
}

impl RuntimeError {
    /// Whether this error originates in the safety system.
    pub const fn is_safety_error(&self) -> bool {
        matches!(self, Self::Safety(_))
    }

    /// The underlying safety error, if any.
    pub const fn safety(&self) -> Option<&SafetyError> {
        match self {
            Self::Safety(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Safety(e) => Some(e),
            Self::Program(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SafetyError> for RuntimeError {
    fn from(e: SafetyError) -> Self {
        Self::Safety(e)
    }
}

impl From<ProgramError> for RuntimeError {
    fn from(e: ProgramError) -> Self {
        Self::Program(e)
    }
}

/// An evaluation failure together with the call stack at the failure site.
///
/// Every error that crosses the outermost VM boundary is one of these; the
/// cause propagates unchanged through every intermediate frame.
#[derive(Debug)]
pub struct EvalError {
    cause: EvalCause,
    stack: CallStack,
}

#[derive(Debug)]
enum EvalCause {
    Runtime(RuntimeError),
    Host(Box<dyn std::error::Error + Send + Sync>),
}

impl EvalError {
    /// A host-originated error with no call-stack context yet; the VM
    /// leaves the stack of errors raised inside built-ins untouched.
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            cause: EvalCause::Host(msg.into().into()),
            stack: CallStack::default(),
        }
    }

    /// Wrap an arbitrary host error.
    pub fn from_host(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            cause: EvalCause::Host(err),
            stack: CallStack::default(),
        }
    }

    pub(crate) fn from_runtime(cause: RuntimeError, stack: CallStack) -> Self {
        Self {
            cause: EvalCause::Runtime(cause),
            stack,
        }
    }

    /// The evaluation failure, when the cause was raised by the VM.
    pub fn runtime(&self) -> Option<&RuntimeError> {
        match &self.cause {
            EvalCause::Runtime(e) => Some(e),
            EvalCause::Host(_) => None,
        }
    }

    /// Whether the cause originates in the safety system.
    pub fn is_safety_error(&self) -> bool {
        matches!(&self.cause, EvalCause::Runtime(e) if e.is_safety_error())
    }

    /// The underlying safety error, if any.
    pub fn safety(&self) -> Option<&SafetyError> {
        self.runtime().and_then(RuntimeError::safety)
    }

    /// The call stack as of the failure site.
    pub fn call_stack(&self) -> &CallStack {
        &self.stack
    }

    /// Multi-line rendering: the call stack, then the error message.
    pub fn backtrace(&self) -> String {
        format!("{}Error: {}", self.stack, self)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            EvalCause::Runtime(e) => e.fmt(f),
            EvalCause::Host(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for EvalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            EvalCause::Runtime(e) => Some(e),
            EvalCause::Host(e) => Some(e.as_ref()),
        }
    }
}
