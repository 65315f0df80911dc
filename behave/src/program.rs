use crate::{
    ExprNode, ExprProgram, ExprRef, Node, NodeId, NodeKind, ValueType, VarSlot,
    WaitUntil,
};

/// 128-bit content hash identifying where a node came from.
pub type DebugId = u128;

/// Identifies one sub-graph invocation site.
pub type InstanceId = u64;

/// A component type the program touches, at the index its payloads use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentType {
    pub name: String,
    pub id: u64,
    pub size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    #[error("program needs at least a nop and a root node")]
    TooFewNodes,
    #[error("node 0 must be Nop, found {0}")]
    BadNop(NodeKind),
    #[error("node 1 must be Root, found {0}")]
    BadRoot(NodeKind),
    #[error("node {node} refers to missing node {target}")]
    NodeOutOfRange { node: NodeId, target: NodeId },
    #[error("node {node} refers to missing expression {index}")]
    ExprOutOfRange { node: usize, index: u16 },
    #[error("constant range {offset}+{length} exceeds pool of {pool} bytes")]
    ConstantOutOfRange { offset: u32, length: u16, pool: usize },
    #[error("node {node} refers to missing component type {component}")]
    ComponentOutOfRange { node: NodeId, component: u16 },
    #[error("expression {expr} refers to missing component type {component}")]
    ExprComponentOutOfRange { expr: usize, component: u16 },
    #[error("expression {expr} reads undeclared lookup {lookup}")]
    LookupOutOfRange { expr: usize, lookup: u16 },
    #[error(
        "field {offset}+{length} exceeds component {component} of {size} \
         bytes"
    )]
    FieldOutOfRange {
        component: u16,
        offset: u16,
        length: usize,
        size: u16,
    },
    #[error("variable {offset}+{length} exceeds blackboard of {size} bytes")]
    VarOutOfRange {
        offset: u32,
        length: usize,
        size: u32,
    },
    #[error("node {node} expects a {expected} byte value, found {found}")]
    ValueSize {
        node: NodeId,
        expected: usize,
        found: usize,
    },
    #[error(
        "expression {expr} expects {expected} byte operands, found {found}"
    )]
    OperandSize {
        expr: usize,
        expected: usize,
        found: usize,
    },
    #[error("expression {expr} uses operand {operand} defined after it")]
    ForwardOperand { expr: usize, operand: u16 },
    #[error("expression reference to output slot {slot}")]
    BadSlot { slot: u8 },
    #[error("expression {expr} does arithmetic on bool")]
    BoolArithmetic { expr: usize },
    #[error("node {node} has {count} children")]
    TooManyChildren { node: NodeId, count: usize },
    #[error("parallel node {node} must branch into a thread root")]
    BadThread { node: NodeId },
    #[error(
        "debug ids ({debug}) and sub-graph paths ({paths}) must match {nodes} \
         nodes"
    )]
    MetadataMismatch {
        nodes: usize,
        debug: usize,
        paths: usize,
    },
}

/// A compiled behavior program.
///
/// Immutable once built. Every cross reference is a plain index so the
/// program can be shared by any number of agents and serialized as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub(crate) expressions: ExprProgram,
    pub(crate) nodes: Vec<Node>,
    pub(crate) debug_ids: Vec<DebugId>,
    pub(crate) subgraph_paths: Vec<Box<[InstanceId]>>,
    pub(crate) types: Vec<ComponentType>,
    pub(crate) lookups: Vec<Option<ComponentType>>,
    pub(crate) blackboard_size: u32,
}

impl Program {
    /// Builds a program without provenance metadata or lookups. The
    /// blackboard size is the smallest one covering every variable used.
    #[must_use]
    pub fn new(
        nodes: Vec<Node>,
        expressions: ExprProgram,
        types: Vec<ComponentType>,
    ) -> Self {
        let count = nodes.len();
        let blackboard_size = nodes
            .iter()
            .filter_map(|node| match node {
                Node::WriteVar { slot, .. } => Some(*slot),
                Node::Query { result, .. } => Some(*result),
                _ => None,
            })
            .chain(expressions.nodes.iter().filter_map(|expr| match expr {
                ExprNode::ReadVar { slot } => Some(*slot),
                _ => None,
            }))
            .map(|slot| slot.offset + slot.length() as u32)
            .max()
            .unwrap_or(0);
        Self {
            expressions,
            nodes,
            debug_ids: vec![0; count],
            subgraph_paths: vec![Box::default(); count],
            types,
            lookups: Vec::new(),
            blackboard_size,
        }
    }

    /// Declares the component type expected behind each lookup handle.
    #[must_use]
    pub fn with_lookups(mut self, lookups: Vec<Option<ComponentType>>) -> Self {
        self.lookups = lookups;
        self
    }

    #[must_use]
    pub fn with_blackboard_size(mut self, size: u32) -> Self {
        self.blackboard_size = size;
        self
    }

    #[inline]
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn expressions(&self) -> &ExprProgram {
        &self.expressions
    }

    #[must_use]
    pub fn debug_id(&self, id: NodeId) -> DebugId {
        self.debug_ids[id.index()]
    }

    #[must_use]
    pub fn debug_ids(&self) -> &[DebugId] {
        &self.debug_ids
    }

    /// Chain of sub-graph invocations that produced `id`, outermost first.
    #[must_use]
    pub fn subgraph_path(&self, id: NodeId) -> &[InstanceId] {
        &self.subgraph_paths[id.index()]
    }

    /// Component types in payload index order (sorted by name).
    #[must_use]
    pub fn types(&self) -> &[ComponentType] {
        &self.types
    }

    /// Component type expected behind each lookup handle. `None` marks an
    /// index the program never reads.
    #[must_use]
    pub fn lookups(&self) -> &[Option<ComponentType>] {
        &self.lookups
    }

    /// Minimum byte length of the blackboard the program runs against.
    #[must_use]
    pub fn blackboard_size(&self) -> u32 {
        self.blackboard_size
    }

    /// Finds the node whose debug id is `debug`.
    #[must_use]
    pub fn find_debug_id(&self, debug: DebugId) -> Option<NodeId> {
        self.debug_ids
            .iter()
            .position(|&d| d == debug)
            .map(|i| NodeId(i as u16))
    }

    /// Checks every cross reference, every field and variable range, and
    /// the byte size of every value a node or operator consumes. Programs
    /// that pass can be executed without tripping an out-of-range index,
    /// given handles and a blackboard matching [`Program::types`],
    /// [`Program::lookups`] and [`Program::blackboard_size`].
    pub fn validate(&self) -> Result<(), ProgramError> {
        if self.nodes.len() < 2 {
            return Err(ProgramError::TooFewNodes);
        }
        if self.debug_ids.len() != self.nodes.len()
            || self.subgraph_paths.len() != self.nodes.len()
        {
            return Err(ProgramError::MetadataMismatch {
                nodes: self.nodes.len(),
                debug: self.debug_ids.len(),
                paths: self.subgraph_paths.len(),
            });
        }
        if self.nodes[0] != Node::Nop {
            return Err(ProgramError::BadNop(self.nodes[0].kind()));
        }
        if self.nodes[1].kind() != NodeKind::Root {
            return Err(ProgramError::BadRoot(self.nodes[1].kind()));
        }

        for (index, node) in self.nodes.iter().enumerate() {
            self.validate_node(NodeId(index as u16), node)?;
        }
        for (index, expr) in self.expressions.nodes.iter().enumerate() {
            self.validate_expr_node(index, expr)?;
        }
        Ok(())
    }

    fn validate_node(
        &self,
        id: NodeId,
        node: &Node,
    ) -> Result<(), ProgramError> {
        for target in node.children() {
            if target.index() >= self.nodes.len() {
                return Err(ProgramError::NodeOutOfRange { node: id, target });
            }
        }
        for expr in node.expressions() {
            self.validate_ref(id.index(), self.expressions.nodes.len(), expr)?;
        }

        let value = |expr: ExprRef, expected: usize| {
            let found = self.expressions.result_size(expr);
            if found == expected {
                Ok(())
            } else {
                Err(ProgramError::ValueSize {
                    node: id,
                    expected,
                    found,
                })
            }
        };
        let bool_size = ValueType::Bool.size();
        match node {
            Node::Sequence { children } if children.len() > MAX_CHILDREN => {
                Err(ProgramError::TooManyChildren {
                    node: id,
                    count: children.len(),
                })
            }
            Node::Selector { branches } => {
                if branches.len() > MAX_CHILDREN {
                    return Err(ProgramError::TooManyChildren {
                        node: id,
                        count: branches.len(),
                    });
                }
                branches.iter().try_for_each(|b| value(b.guard, bool_size))
            }
            Node::WriteField { component, fields } => {
                let Some(ty) = self.types.get(*component as usize) else {
                    return Err(ProgramError::ComponentOutOfRange {
                        node: id,
                        component: *component,
                    });
                };
                for field in fields.iter() {
                    let length = field.length as usize;
                    check_field(*component, ty, field.offset, length)?;
                    value(field.value, length)?;
                }
                Ok(())
            }
            Node::Wait {
                until: WaitUntil::Duration(expr),
            } => value(*expr, ValueType::Float.size()),
            Node::Wait {
                until: WaitUntil::Condition(expr),
            }
            | Node::Optional { guard: expr, .. } => value(*expr, bool_size),
            Node::WriteVar { slot, value: expr } => {
                self.check_var(*slot)?;
                value(*expr, slot.length())
            }
            Node::Query { result, .. } => self.check_var(*result),
            Node::Parallel { thread, .. } => {
                if self.nodes[thread.index()].kind() == NodeKind::ThreadRoot {
                    Ok(())
                } else {
                    Err(ProgramError::BadThread { node: id })
                }
            }
            _ => Ok(()),
        }
    }

    /// Operands must precede their users, which keeps evaluation finite.
    fn validate_expr_node(
        &self,
        index: usize,
        expr: &ExprNode,
    ) -> Result<(), ProgramError> {
        for operand in expr.operands() {
            self.validate_ref(index, index, operand)?;
        }

        let operands = |expected: usize| {
            for operand in expr.operands() {
                let found = self.expressions.result_size(operand);
                if found != expected {
                    return Err(ProgramError::OperandSize {
                        expr: index,
                        expected,
                        found,
                    });
                }
            }
            Ok(())
        };
        match *expr {
            ExprNode::ReadField {
                component,
                offset,
                ty,
            } => {
                let Some(layout) = self.types.get(component as usize) else {
                    return Err(ProgramError::ExprComponentOutOfRange {
                        expr: index,
                        component,
                    });
                };
                check_field(component, layout, offset, ty.size())
            }
            ExprNode::LookupField { lookup, offset, ty } => {
                let Some(Some(layout)) = self.lookups.get(lookup as usize)
                else {
                    return Err(ProgramError::LookupOutOfRange {
                        expr: index,
                        lookup,
                    });
                };
                check_field(lookup, layout, offset, ty.size())
            }
            ExprNode::ReadVar { slot } => self.check_var(slot),
            ExprNode::Not(_) | ExprNode::And(..) | ExprNode::Or(..) => {
                operands(ValueType::Bool.size())
            }
            ExprNode::Compare { ty, .. } => operands(ty.size()),
            ExprNode::Arith { ty, .. } => {
                if ty == ValueType::Bool {
                    return Err(ProgramError::BoolArithmetic { expr: index });
                }
                operands(ty.size())
            }
        }
    }

    /// Checks one reference made by `user`. Expression references must point
    /// below `limit`.
    fn validate_ref(
        &self,
        user: usize,
        limit: usize,
        expr: ExprRef,
    ) -> Result<(), ProgramError> {
        match expr {
            ExprRef::Constant { offset, length } => {
                let end = offset as usize + length as usize;
                if end > self.expressions.constants.len() {
                    return Err(ProgramError::ConstantOutOfRange {
                        offset,
                        length,
                        pool: self.expressions.constants.len(),
                    });
                }
            }
            ExprRef::Node { slot, .. } if slot != 0 => {
                return Err(ProgramError::BadSlot { slot });
            }
            ExprRef::Node { index, .. } => {
                if index as usize >= self.expressions.nodes.len() {
                    return Err(ProgramError::ExprOutOfRange {
                        node: user,
                        index,
                    });
                }
                if index as usize >= limit {
                    return Err(ProgramError::ForwardOperand {
                        expr: user,
                        operand: index,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_var(&self, slot: VarSlot) -> Result<(), ProgramError> {
        let end = slot.offset as u64 + slot.length() as u64;
        if end > u64::from(self.blackboard_size) {
            return Err(ProgramError::VarOutOfRange {
                offset: slot.offset,
                length: slot.length(),
                size: self.blackboard_size,
            });
        }
        Ok(())
    }
}

/// Sequences and selectors count their progress in a `u16`.
const MAX_CHILDREN: usize = u16::MAX as usize;

fn check_field(
    component: u16,
    ty: &ComponentType,
    offset: u16,
    length: usize,
) -> Result<(), ProgramError> {
    if offset as usize + length > ty.size as usize {
        return Err(ProgramError::FieldOutOfRange {
            component,
            offset,
            length,
            size: ty.size,
        });
    }
    Ok(())
}
