//! Call-stack snapshots attached to evaluation errors.

use core::fmt;
use std::sync::Arc;

use petrel_bytecode::Position;

/// One frame of a [`CallStack`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    name: Arc<str>,
    filename: Arc<str>,
    pos: Position,
}

impl StackFrame {
    pub(crate) fn new(name: Arc<str>, filename: Arc<str>, pos: Position) -> Self {
        Self {
            name,
            filename,
            pos,
        }
    }

    /// Function name; `"<toplevel>"` for the module body.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source filename of the function's module.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Position of the frame's current instruction.
    pub const fn position(&self) -> Position {
        self.pos
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: in {}", self.filename, self.pos, self.name)
    }
}

/// An ordered copy of a thread's call stack, outermost frame first.
///
/// Taken at the failure site when an evaluation error surfaces, and on
/// demand through the thread's debugging views. This isn't copy-free and
/// isn't produced on the happy path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStack {
    frames: Vec<StackFrame>,
}

impl CallStack {
    pub(crate) fn new(frames: Vec<StackFrame>) -> Self {
        Self { frames }
    }

    /// The frames, outermost first.
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The innermost frame, where the failure was raised.
    pub fn innermost(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Expose the frames.
    pub fn into_inner(self) -> Vec<StackFrame> {
        self.frames
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return Ok(());
        }
        writeln!(f, "Traceback (most recent call last):")?;
        for frame in &self.frames {
            writeln!(f, "  {frame}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_outermost_first() {
        let stack = CallStack::new(vec![
            StackFrame::new(
                "<toplevel>".into(),
                "conf.petrel".into(),
                Position { line: 3, col: 1 },
            ),
            StackFrame::new(
                "helper".into(),
                "conf.petrel".into(),
                Position { line: 9, col: 5 },
            ),
        ]);
        let rendered = stack.to_string();
        assert_eq!(
            rendered,
            "Traceback (most recent call last):\n  conf.petrel:3:1: in <toplevel>\n  conf.petrel:9:5: in helper\n"
        );
        assert_eq!(stack.innermost().unwrap().name(), "helper");
    }

    #[test]
    fn empty_stack_renders_nothing() {
        assert_eq!(CallStack::default().to_string(), "");
    }
}
