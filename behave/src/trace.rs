//! Diagnostic events emitted by the interpreter.
//!
//! Tracing never influences control flow; a run with a sink produces the
//! same side effects as a run without one.

use std::fmt;

use crate::{LaneId, NodeId, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEventKind {
    /// A lane begins its turn this tick. Reported on the lane's root node.
    Start,
    /// A node hands control down to a child. Reported on the caller.
    Call,
    /// A node finished and hands control back. Reported on the finished node.
    Return,
    /// A lane root was reached again and the lane ends its turn.
    Yield,
    /// A lane suspends on an unsatisfied wait or a pending query.
    Wait,
    /// A failure was raised.
    Fail,
    /// A catch absorbed a failure and exits normally.
    Catch,
    /// A parallel node started a lane. `lane` is the new lane.
    Spawn,
    /// A parallel node removed a lane. `lane` is the removed lane.
    Abort,
}

impl TraceEventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Call => "Call",
            Self::Return => "Return",
            Self::Yield => "Yield",
            Self::Wait => "Wait",
            Self::Fail => "Fail",
            Self::Catch => "Catch",
            Self::Spawn => "Spawn",
            Self::Abort => "Abort",
        }
    }
}

impl fmt::Display for TraceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceEvent {
    pub node: NodeId,
    pub kind: NodeKind,
    pub event: TraceEventKind,
    pub lane: LaneId,
    /// Frame count of the reporting lane when the event fired.
    pub depth: usize,
    pub cycle: u32,
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>5}] {:<4} {}{} {}.{}",
            self.cycle,
            self.lane,
            "  ".repeat(self.depth),
            self.node,
            self.kind,
            self.event
        )
    }
}

/// Append-only receiver of trace events.
pub trait TraceSink {
    fn event(&mut self, event: TraceEvent);
}

impl TraceSink for Vec<TraceEvent> {
    fn event(&mut self, event: TraceEvent) {
        self.push(event);
    }
}

/// Forwards every event to `log::trace!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTrace;

impl TraceSink for LogTrace {
    fn event(&mut self, event: TraceEvent) {
        log::trace!("{event}");
    }
}
