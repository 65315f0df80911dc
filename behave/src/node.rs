use std::fmt;

use crate::{ExprRef, VarSlot};

/// Dense index into a program's node array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Universal terminal, every program has it at index 0.
    pub const NOP: Self = Self(0);
    /// Program entry, always at index 1.
    pub const ROOT: Self = Self(1);

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:04}", self.0)
    }
}

/// The tag of a [`Node`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    Nop = 0,
    Root,
    Sequence,
    Selector,
    WriteField,
    Wait,
    Fail,
    Optional,
    Catch,
    WriteVar,
    Query,
    Parallel,
    ThreadRoot,
}

impl NodeKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        let kind = match tag {
            0 => Self::Nop,
            1 => Self::Root,
            2 => Self::Sequence,
            3 => Self::Selector,
            4 => Self::WriteField,
            5 => Self::Wait,
            6 => Self::Fail,
            7 => Self::Optional,
            8 => Self::Catch,
            9 => Self::WriteVar,
            10 => Self::Query,
            11 => Self::Parallel,
            12 => Self::ThreadRoot,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "Nop",
            Self::Root => "Root",
            Self::Sequence => "Sequence",
            Self::Selector => "Selector",
            Self::WriteField => "WriteField",
            Self::Wait => "Wait",
            Self::Fail => "Fail",
            Self::Optional => "Optional",
            Self::Catch => "Catch",
            Self::WriteVar => "WriteVar",
            Self::Query => "Query",
            Self::Parallel => "Parallel",
            Self::ThreadRoot => "ThreadRoot",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// One guarded alternative of a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub guard: ExprRef,
    pub child: NodeId,
}

/// Copies the value of `value` into `length` bytes at `offset` of a
/// component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldWrite {
    pub offset: u16,
    pub length: u16,
    pub value: ExprRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// Seconds (float expression) measured from the moment the wait began.
    Duration(ExprRef),
    /// Boolean expression.
    Condition(ExprRef),
}

/// A single instruction of a compiled behavior program.
///
/// Every variant only carries what is needed to resume execution; progress
/// is tracked by the `child_index` of the frame executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Nop,
    Root { child: NodeId },
    Sequence { children: Box<[NodeId]> },
    Selector { branches: Box<[Branch]> },
    WriteField { component: u16, fields: Box<[FieldWrite]> },
    Wait { until: WaitUntil },
    Fail,
    Optional { guard: ExprRef, child: NodeId },
    Catch { child: NodeId },
    WriteVar { slot: VarSlot, value: ExprRef },
    Query { query: u16, result: VarSlot },
    Parallel { main: NodeId, thread: NodeId },
    ThreadRoot { child: NodeId, looping: bool },
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Nop => NodeKind::Nop,
            Self::Root { .. } => NodeKind::Root,
            Self::Sequence { .. } => NodeKind::Sequence,
            Self::Selector { .. } => NodeKind::Selector,
            Self::WriteField { .. } => NodeKind::WriteField,
            Self::Wait { .. } => NodeKind::Wait,
            Self::Fail => NodeKind::Fail,
            Self::Optional { .. } => NodeKind::Optional,
            Self::Catch { .. } => NodeKind::Catch,
            Self::WriteVar { .. } => NodeKind::WriteVar,
            Self::Query { .. } => NodeKind::Query,
            Self::Parallel { .. } => NodeKind::Parallel,
            Self::ThreadRoot { .. } => NodeKind::ThreadRoot,
        }
    }

    /// Every node id this node refers to, in declaration order.
    #[must_use]
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Self::Nop
            | Self::WriteField { .. }
            | Self::Wait { .. }
            | Self::Fail
            | Self::WriteVar { .. }
            | Self::Query { .. } => Vec::new(),
            Self::Root { child }
            | Self::Optional { child, .. }
            | Self::Catch { child }
            | Self::ThreadRoot { child, .. } => vec![*child],
            Self::Sequence { children } => children.to_vec(),
            Self::Selector { branches } => {
                branches.iter().map(|b| b.child).collect()
            }
            Self::Parallel { main, thread } => vec![*main, *thread],
        }
    }

    /// Every expression this node evaluates.
    #[must_use]
    pub fn expressions(&self) -> Vec<ExprRef> {
        match self {
            Self::Selector { branches } => {
                branches.iter().map(|b| b.guard).collect()
            }
            Self::WriteField { fields, .. } => {
                fields.iter().map(|f| f.value).collect()
            }
            Self::Wait {
                until: WaitUntil::Duration(e) | WaitUntil::Condition(e),
            } => vec![*e],
            Self::Optional { guard, .. } => vec![*guard],
            Self::WriteVar { value, .. } => vec![*value],
            _ => Vec::new(),
        }
    }
}
