//! Profiler, can be used to export per-function timing from VM runs.
//!
//! The thread accumulates elapsed wall time within the current span; spans
//! open at frame entry and close at frame exit. Module loading runs outside
//! the span and is excluded through [`Profiler::pause`]/[`Profiler::resume`].

use core::fmt;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use itertools::Itertools;

/// Timing recorded for one function name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FnProfile {
    /// Number of completed spans.
    pub calls: u64,
    /// Inclusive time: the function and everything it called.
    pub total: Duration,
    /// Exclusive time: the function without its callees.
    pub self_time: Duration,
}

/// Collected profiling data.
#[derive(Debug, Clone, Default)]
pub struct ProfileData {
    per_fn: HashMap<String, FnProfile>,
    total: Duration,
}

impl ProfileData {
    /// Timing for one function name.
    pub fn get(&self, name: &str) -> FnProfile {
        self.per_fn.get(name).copied().unwrap_or_default()
    }

    /// Iterate over `(name, timing)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FnProfile)> {
        self.per_fn.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total time spent inside outermost spans.
    pub const fn total(&self) -> Duration {
        self.total
    }
}

impl fmt::Display for ProfileData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items = self
            .per_fn
            .iter()
            .sorted_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(b.0)));
        for (name, p) in items {
            writeln!(
                f,
                "{name}: {} calls, {:?} total, {:?} self",
                p.calls, p.total, p.self_time
            )?;
        }
        Ok(())
    }
}

/// Used to receive profile information from the interpreter.
pub trait ProfileReceiver {
    /// Called when the outermost span closes.
    fn on_exit(&mut self, data: &ProfileData);
}

/// Prints profiling info to stderr.
#[derive(Clone)]
pub struct StderrReceiver;

impl ProfileReceiver for StderrReceiver {
    fn on_exit(&mut self, data: &ProfileData) {
        eprintln!("PROFILER: {data}");
    }
}

struct Span {
    name: String,
    started: Instant,
    child: Duration,
    excluded: Duration,
}

/// Per-thread profiler.
#[derive(Default)]
pub struct Profiler {
    enabled: bool,
    receiver: Option<Box<dyn ProfileReceiver + Send>>,
    data: ProfileData,
    spans: Vec<Span>,
    paused_at: Option<Instant>,
}

impl Profiler {
    /// Start recording spans.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Whether spans are being recorded.
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Sets profiling data receiver.
    pub fn set_receiver(&mut self, receiver: Box<dyn ProfileReceiver + Send>) {
        self.enabled = true;
        self.receiver = Some(receiver);
    }

    /// Read-only access to the data.
    pub fn data(&self) -> &ProfileData {
        &self.data
    }

    /// Open a span for `name`.
    pub(crate) fn begin_span(&mut self, name: &str) {
        if !self.enabled {
            return;
        }
        self.spans.push(Span {
            name: name.to_owned(),
            started: Instant::now(),
            child: Duration::ZERO,
            excluded: Duration::ZERO,
        });
    }

    /// Close the innermost span, folding its time into the accumulators.
    pub(crate) fn end_span(&mut self) {
        if !self.enabled {
            return;
        }
        let Some(span) = self.spans.pop() else {
            return;
        };
        let elapsed = span
            .started
            .elapsed()
            .saturating_sub(span.excluded);
        let entry = self.data.per_fn.entry(span.name).or_default();
        entry.calls += 1;
        entry.total += elapsed;
        entry.self_time += elapsed.saturating_sub(span.child);
        match self.spans.last_mut() {
            Some(parent) => parent.child += elapsed,
            None => {
                self.data.total += elapsed;
                if let Some(receiver) = &mut self.receiver {
                    receiver.on_exit(&self.data);
                }
            }
        }
    }

    /// Stop the clock; time until [`Profiler::resume`] is excluded from
    /// every open span.
    pub(crate) fn pause(&mut self) {
        if self.enabled && self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    /// Restart the clock after [`Profiler::pause`].
    pub(crate) fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            let skipped = at.elapsed();
            for span in &mut self.spans {
                span.excluded += skipped;
            }
        }
    }
}

impl fmt::Debug for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Profiler(receiver={}, enabled={}, open_spans={})",
            if self.receiver.is_some() {
                "enabled"
            } else {
                "disabled"
            },
            self.enabled,
            self.spans.len()
        )
    }
}
