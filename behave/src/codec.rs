//! Binary encoding of [`Program`].
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! header            magic "BHVP", major u16, minor u16
//! expressions       constant pool, expression records
//! nodes             node records (tag u8 + payload, padded to 8 bytes)
//! debug ids         u128 per node
//! sub-graph paths   u32 length + u64 instance ids per node
//! types             component type list
//! lookups           present flag + component type per lookup index
//! blackboard        required blackboard size u32, padding
//! ```

use crate::{
    ArithOp, Branch, CompareOp, ComponentType, ExprNode, ExprProgram, ExprRef,
    FieldWrite, Node, NodeId, NodeKind, Program, ProgramError, ValueType,
    VarSlot, WaitUntil,
};

const MAGIC: &[u8; 4] = b"BHVP";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;
const RECORD_ALIGN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("bad magic header")]
    BadMagic,
    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("unknown {section} tag {tag}")]
    UnknownTag { section: &'static str, tag: u8 },
    #[error("invalid UTF-8 in type name")]
    InvalidUtf8,
    #[error("{0} trailing bytes after program")]
    TrailingBytes(usize),
    #[error("invalid program: {0}")]
    Invalid(#[from] ProgramError),
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u128(&mut self, v: u128) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn align(&mut self) {
        while self.buf.len() % RECORD_ALIGN != 0 {
            self.buf.push(0);
        }
    }

    fn count(&mut self, len: usize) {
        self.u32(u32::try_from(len).expect("section too large to encode"));
    }

    fn node_id(&mut self, id: NodeId) {
        self.u16(id.0);
    }

    /// Fixed 8 bytes: kind, slot, length/index, offset.
    fn expr_ref(&mut self, expr: ExprRef) {
        match expr {
            ExprRef::Constant { offset, length } => {
                self.u8(0);
                self.u8(0);
                self.u16(length);
                self.u32(offset);
            }
            ExprRef::Node { index, slot } => {
                self.u8(1);
                self.u8(slot);
                self.u16(index);
                self.u32(0);
            }
        }
    }

    fn var_slot(&mut self, slot: VarSlot) {
        self.u32(slot.offset);
        self.u8(slot.ty as u8);
    }

    fn component_type(&mut self, ty: &ComponentType) {
        self.u64(ty.id);
        self.u16(ty.size);
        self.u16(u16::try_from(ty.name.len()).expect("type name too long"));
        self.bytes(ty.name.as_bytes());
        self.align();
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn u128(&mut self) -> Result<u128, DecodeError> {
        Ok(u128::from_le_bytes(self.array()?))
    }

    fn align(&mut self) -> Result<(), DecodeError> {
        let pad = (RECORD_ALIGN - self.offset % RECORD_ALIGN) % RECORD_ALIGN;
        self.take(pad)?;
        Ok(())
    }

    fn count(&mut self) -> Result<usize, DecodeError> {
        Ok(self.u32()? as usize)
    }

    fn node_id(&mut self) -> Result<NodeId, DecodeError> {
        Ok(NodeId(self.u16()?))
    }

    fn expr_ref(&mut self) -> Result<ExprRef, DecodeError> {
        let kind = self.u8()?;
        let slot = self.u8()?;
        let short = self.u16()?;
        let offset = self.u32()?;
        match kind {
            0 => Ok(ExprRef::Constant {
                offset,
                length: short,
            }),
            1 => Ok(ExprRef::Node { index: short, slot }),
            tag => Err(DecodeError::UnknownTag {
                section: "expression reference",
                tag,
            }),
        }
    }

    fn value_type(&mut self) -> Result<ValueType, DecodeError> {
        let tag = self.u8()?;
        ValueType::from_u8(tag).ok_or(DecodeError::UnknownTag {
            section: "value type",
            tag,
        })
    }

    fn var_slot(&mut self) -> Result<VarSlot, DecodeError> {
        let offset = self.u32()?;
        let ty = self.value_type()?;
        Ok(VarSlot { offset, ty })
    }

    fn component_type(&mut self) -> Result<ComponentType, DecodeError> {
        let id = self.u64()?;
        let size = self.u16()?;
        let len = self.u16()? as usize;
        let name = std::str::from_utf8(self.take(len)?)
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_owned();
        self.align()?;
        Ok(ComponentType { name, id, size })
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

impl Program {
    /// Serializes the program. `decode` of the result yields an equal
    /// program.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.bytes(MAGIC);
        w.u16(VERSION_MAJOR);
        w.u16(VERSION_MINOR);

        encode_expressions(&mut w, &self.expressions);

        w.count(self.nodes.len());
        w.u32(0);
        for node in &self.nodes {
            encode_node(&mut w, node);
            w.align();
        }

        for &debug in &self.debug_ids {
            w.u128(debug);
        }

        for path in &self.subgraph_paths {
            w.count(path.len());
            w.u32(0);
            for &instance in path.iter() {
                w.u64(instance);
            }
        }

        w.count(self.types.len());
        w.u32(0);
        for ty in &self.types {
            w.component_type(ty);
        }

        w.count(self.lookups.len());
        w.u32(0);
        for lookup in &self.lookups {
            w.u8(u8::from(lookup.is_some()));
            w.align();
            if let Some(ty) = lookup {
                w.component_type(ty);
            }
        }

        w.u32(self.blackboard_size);
        w.align();

        w.into_inner()
    }

    /// Deserializes and validates a program.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let major = r.u16()?;
        let minor = r.u16()?;
        if major != VERSION_MAJOR {
            return Err(DecodeError::UnsupportedVersion { major, minor });
        }

        let expressions = decode_expressions(&mut r)?;

        let node_count = r.count()?;
        r.u32()?;
        let mut nodes = Vec::with_capacity(node_count.min(r.remaining()));
        for _ in 0..node_count {
            nodes.push(decode_node(&mut r)?);
            r.align()?;
        }

        let mut debug_ids = Vec::with_capacity(nodes.len());
        for _ in 0..node_count {
            debug_ids.push(r.u128()?);
        }

        let mut subgraph_paths = Vec::with_capacity(nodes.len());
        for _ in 0..node_count {
            let len = r.count()?;
            r.u32()?;
            let mut path = Vec::with_capacity(len.min(r.remaining()));
            for _ in 0..len {
                path.push(r.u64()?);
            }
            subgraph_paths.push(path.into_boxed_slice());
        }

        let type_count = r.count()?;
        r.u32()?;
        let mut types = Vec::new();
        for _ in 0..type_count {
            types.push(r.component_type()?);
        }

        let lookup_count = r.count()?;
        r.u32()?;
        let mut lookups = Vec::new();
        for _ in 0..lookup_count {
            let present = r.u8()?;
            r.align()?;
            let lookup = match present {
                0 => None,
                1 => Some(r.component_type()?),
                tag => {
                    return Err(DecodeError::UnknownTag {
                        section: "lookup",
                        tag,
                    });
                }
            };
            lookups.push(lookup);
        }

        let blackboard_size = r.u32()?;
        r.align()?;

        if r.remaining() != 0 {
            return Err(DecodeError::TrailingBytes(r.remaining()));
        }

        let program = Program {
            expressions,
            nodes,
            debug_ids,
            subgraph_paths,
            types,
            lookups,
            blackboard_size,
        };
        program.validate()?;
        Ok(program)
    }
}

fn encode_expressions(w: &mut Writer, program: &ExprProgram) {
    w.count(program.constants.len());
    w.count(program.nodes.len());
    w.bytes(&program.constants);
    w.align();

    for node in &program.nodes {
        match *node {
            ExprNode::ReadField { component, offset, ty } => {
                w.u8(0);
                w.u8(ty as u8);
                w.u16(component);
                w.u16(offset);
            }
            ExprNode::LookupField { lookup, offset, ty } => {
                w.u8(1);
                w.u8(ty as u8);
                w.u16(lookup);
                w.u16(offset);
            }
            ExprNode::ReadVar { slot } => {
                w.u8(2);
                w.u8(0);
                w.var_slot(slot);
            }
            ExprNode::Not(a) => {
                w.u8(3);
                w.align();
                w.expr_ref(a);
            }
            ExprNode::And(a, b) | ExprNode::Or(a, b) => {
                w.u8(if matches!(node, ExprNode::And(..)) { 4 } else { 5 });
                w.align();
                w.expr_ref(a);
                w.expr_ref(b);
            }
            ExprNode::Compare { op, ty, lhs, rhs } => {
                w.u8(6);
                w.u8(op as u8);
                w.u8(ty as u8);
                w.align();
                w.expr_ref(lhs);
                w.expr_ref(rhs);
            }
            ExprNode::Arith { op, ty, lhs, rhs } => {
                w.u8(7);
                w.u8(op as u8);
                w.u8(ty as u8);
                w.align();
                w.expr_ref(lhs);
                w.expr_ref(rhs);
            }
        }
        w.align();
    }
}

fn decode_expressions(r: &mut Reader<'_>) -> Result<ExprProgram, DecodeError> {
    let constant_len = r.count()?;
    let node_count = r.count()?;
    let constants = r.take(constant_len)?.to_vec();
    r.align()?;

    let mut nodes = Vec::with_capacity(node_count.min(r.remaining()));
    for _ in 0..node_count {
        let tag = r.u8()?;
        let node = match tag {
            0 | 1 => {
                let ty = r.value_type()?;
                let index = r.u16()?;
                let offset = r.u16()?;
                if tag == 0 {
                    ExprNode::ReadField {
                        component: index,
                        offset,
                        ty,
                    }
                } else {
                    ExprNode::LookupField {
                        lookup: index,
                        offset,
                        ty,
                    }
                }
            }
            2 => {
                r.u8()?;
                ExprNode::ReadVar { slot: r.var_slot()? }
            }
            3 => {
                r.align()?;
                ExprNode::Not(r.expr_ref()?)
            }
            4 | 5 => {
                r.align()?;
                let a = r.expr_ref()?;
                let b = r.expr_ref()?;
                if tag == 4 {
                    ExprNode::And(a, b)
                } else {
                    ExprNode::Or(a, b)
                }
            }
            6 => {
                let raw = r.u8()?;
                let op = CompareOp::from_u8(raw).ok_or(
                    DecodeError::UnknownTag {
                        section: "compare op",
                        tag: raw,
                    },
                )?;
                let ty = r.value_type()?;
                r.align()?;
                ExprNode::Compare {
                    op,
                    ty,
                    lhs: r.expr_ref()?,
                    rhs: r.expr_ref()?,
                }
            }
            7 => {
                let raw = r.u8()?;
                let op =
                    ArithOp::from_u8(raw).ok_or(DecodeError::UnknownTag {
                        section: "arith op",
                        tag: raw,
                    })?;
                let ty = r.value_type()?;
                r.align()?;
                ExprNode::Arith {
                    op,
                    ty,
                    lhs: r.expr_ref()?,
                    rhs: r.expr_ref()?,
                }
            }
            tag => {
                return Err(DecodeError::UnknownTag {
                    section: "expression",
                    tag,
                });
            }
        };
        r.align()?;
        nodes.push(node);
    }

    Ok(ExprProgram { constants, nodes })
}

fn encode_node(w: &mut Writer, node: &Node) {
    w.u8(node.kind() as u8);
    match node {
        Node::Nop | Node::Fail => {}
        Node::Root { child } | Node::Catch { child } => {
            w.u8(0);
            w.node_id(*child);
        }
        Node::ThreadRoot { child, looping } => {
            w.u8(u8::from(*looping));
            w.node_id(*child);
        }
        Node::Sequence { children } => {
            w.u8(0);
            w.u16(children.len() as u16);
            for &child in children.iter() {
                w.node_id(child);
            }
        }
        Node::Selector { branches } => {
            w.u8(0);
            w.u16(branches.len() as u16);
            w.align();
            for branch in branches.iter() {
                w.expr_ref(branch.guard);
                w.node_id(branch.child);
                w.align();
            }
        }
        Node::WriteField { component, fields } => {
            w.u8(0);
            w.u16(*component);
            w.u16(fields.len() as u16);
            w.align();
            for field in fields.iter() {
                w.u16(field.offset);
                w.u16(field.length);
                w.u32(0);
                w.expr_ref(field.value);
            }
        }
        Node::Wait { until } => {
            let (mode, expr) = match until {
                WaitUntil::Duration(e) => (0, *e),
                WaitUntil::Condition(e) => (1, *e),
            };
            w.u8(mode);
            w.align();
            w.expr_ref(expr);
        }
        Node::Optional { guard, child } => {
            w.u8(0);
            w.node_id(*child);
            w.align();
            w.expr_ref(*guard);
        }
        Node::WriteVar { slot, value } => {
            w.u8(0);
            w.u16(0);
            w.var_slot(*slot);
            w.align();
            w.expr_ref(*value);
        }
        Node::Query { query, result } => {
            w.u8(0);
            w.u16(*query);
            w.var_slot(*result);
        }
        Node::Parallel { main, thread } => {
            w.u8(0);
            w.node_id(*main);
            w.node_id(*thread);
        }
    }
}

fn decode_node(r: &mut Reader<'_>) -> Result<Node, DecodeError> {
    let tag = r.u8()?;
    let kind = NodeKind::from_u8(tag).ok_or(DecodeError::UnknownTag {
        section: "node",
        tag,
    })?;

    let node = match kind {
        NodeKind::Nop => Node::Nop,
        NodeKind::Fail => Node::Fail,
        NodeKind::Root => {
            r.u8()?;
            Node::Root {
                child: r.node_id()?,
            }
        }
        NodeKind::Catch => {
            r.u8()?;
            Node::Catch {
                child: r.node_id()?,
            }
        }
        NodeKind::ThreadRoot => {
            let looping = r.u8()? != 0;
            Node::ThreadRoot {
                child: r.node_id()?,
                looping,
            }
        }
        NodeKind::Sequence => {
            r.u8()?;
            let len = r.u16()? as usize;
            let mut children = Vec::with_capacity(len);
            for _ in 0..len {
                children.push(r.node_id()?);
            }
            Node::Sequence {
                children: children.into(),
            }
        }
        NodeKind::Selector => {
            r.u8()?;
            let len = r.u16()? as usize;
            r.align()?;
            let mut branches = Vec::with_capacity(len);
            for _ in 0..len {
                let guard = r.expr_ref()?;
                let child = r.node_id()?;
                r.align()?;
                branches.push(Branch { guard, child });
            }
            Node::Selector {
                branches: branches.into(),
            }
        }
        NodeKind::WriteField => {
            r.u8()?;
            let component = r.u16()?;
            let len = r.u16()? as usize;
            r.align()?;
            let mut fields = Vec::with_capacity(len);
            for _ in 0..len {
                let offset = r.u16()?;
                let length = r.u16()?;
                r.u32()?;
                let value = r.expr_ref()?;
                fields.push(FieldWrite {
                    offset,
                    length,
                    value,
                });
            }
            Node::WriteField {
                component,
                fields: fields.into(),
            }
        }
        NodeKind::Wait => {
            let mode = r.u8()?;
            r.align()?;
            let expr = r.expr_ref()?;
            let until = match mode {
                0 => WaitUntil::Duration(expr),
                1 => WaitUntil::Condition(expr),
                tag => {
                    return Err(DecodeError::UnknownTag {
                        section: "wait mode",
                        tag,
                    });
                }
            };
            Node::Wait { until }
        }
        NodeKind::Optional => {
            r.u8()?;
            let child = r.node_id()?;
            r.align()?;
            let guard = r.expr_ref()?;
            Node::Optional { guard, child }
        }
        NodeKind::WriteVar => {
            r.u8()?;
            r.u16()?;
            let slot = r.var_slot()?;
            r.align()?;
            let value = r.expr_ref()?;
            Node::WriteVar { slot, value }
        }
        NodeKind::Query => {
            r.u8()?;
            let query = r.u16()?;
            let result = r.var_slot()?;
            Node::Query { query, result }
        }
        NodeKind::Parallel => {
            r.u8()?;
            let main = r.node_id()?;
            let thread = r.node_id()?;
            Node::Parallel { main, thread }
        }
    };
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        let constants = {
            let mut pool = vec![1u8, 0, 0, 0];
            pool.extend_from_slice(&1.5f32.to_le_bytes());
            pool
        };
        let guard = ExprRef::Constant {
            offset: 0,
            length: 1,
        };
        let slot = VarSlot {
            offset: 4,
            ty: ValueType::Int,
        };
        let expressions = ExprProgram {
            constants,
            nodes: vec![
                ExprNode::ReadVar { slot },
                ExprNode::Compare {
                    op: CompareOp::Gt,
                    ty: ValueType::Int,
                    lhs: ExprRef::Node { index: 0, slot: 0 },
                    rhs: ExprRef::Constant {
                        offset: 0,
                        length: 4,
                    },
                },
                ExprNode::ReadField {
                    component: 0,
                    offset: 4,
                    ty: ValueType::Float,
                },
                ExprNode::LookupField {
                    lookup: 1,
                    offset: 0,
                    ty: ValueType::Bool,
                },
            ],
        };
        let nodes = vec![
            Node::Nop,
            Node::Root { child: NodeId(2) },
            Node::Sequence {
                children: vec![NodeId(3), NodeId(4), NodeId(5), NodeId(6)]
                    .into(),
            },
            Node::Selector {
                branches: vec![
                    Branch {
                        guard: ExprRef::Node { index: 1, slot: 0 },
                        child: NodeId(7),
                    },
                    Branch {
                        guard,
                        child: NodeId::NOP,
                    },
                ]
                .into(),
            },
            Node::Wait {
                until: WaitUntil::Duration(ExprRef::Constant {
                    offset: 4,
                    length: 4,
                }),
            },
            Node::Parallel {
                main: NodeId(8),
                thread: NodeId(9),
            },
            Node::WriteField {
                component: 0,
                fields: vec![FieldWrite {
                    offset: 4,
                    length: 4,
                    value: ExprRef::Node { index: 2, slot: 0 },
                }]
                .into(),
            },
            Node::Query { query: 3, result: slot },
            Node::Catch { child: NodeId(10) },
            Node::ThreadRoot {
                child: NodeId(11),
                looping: true,
            },
            Node::Fail,
            Node::WriteVar {
                slot,
                value: ExprRef::Node { index: 0, slot: 0 },
            },
        ];
        let mover = ComponentType {
            name: "Mover".to_owned(),
            id: crate::component_type_id("Mover"),
            size: 8,
        };
        let mut program =
            Program::new(nodes, expressions, vec![mover.clone()])
                .with_lookups(vec![None, Some(mover)])
                .with_blackboard_size(12);
        for (i, debug) in program.debug_ids.iter_mut().enumerate() {
            *debug = (i as u128) << 64 | 0xabcd;
        }
        program.subgraph_paths[9] = vec![7, 11].into_boxed_slice();
        program
    }

    #[test]
    fn test_encode_decode_preserves_program() {
        let program = sample();
        assert_eq!(program.validate(), Ok(()));
        let bytes = program.encode();
        assert_eq!(&bytes[..4], MAGIC);
        let decoded = Program::decode(&bytes).expect("decodes");
        assert_eq!(decoded, program);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_node_records_are_aligned() {
        let bytes = sample().encode();
        assert_eq!(bytes.len() % RECORD_ALIGN, 0);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert_eq!(Program::decode(&bytes), Err(DecodeError::BadMagic));
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let mut bytes = sample().encode();
        bytes[4..6].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(
            Program::decode(&bytes),
            Err(DecodeError::UnsupportedVersion { major: 9, minor: 0 })
        );
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = sample().encode();
        for cut in [7, 40, bytes.len() - 1] {
            assert!(Program::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = sample().encode();
        bytes.extend_from_slice(&[0; 8]);
        assert_eq!(Program::decode(&bytes), Err(DecodeError::TrailingBytes(8)));
    }

    #[test]
    fn test_decode_validates_references() {
        let mut program = sample();
        program.nodes[1] = Node::Root { child: NodeId(200) };
        let bytes = program.encode();
        assert!(matches!(
            Program::decode(&bytes),
            Err(DecodeError::Invalid(ProgramError::NodeOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_lookups_and_blackboard_size_survive() {
        let program = sample();
        let decoded = Program::decode(&program.encode()).expect("decodes");
        assert_eq!(decoded.lookups()[0], None);
        assert_eq!(
            decoded.lookups()[1].as_ref().map(|t| t.name.as_str()),
            Some("Mover")
        );
        assert_eq!(decoded.blackboard_size(), 12);
    }

    #[test]
    fn test_decode_rejects_out_of_range_field_write() {
        let mut program = sample();
        program.nodes[6] = Node::WriteField {
            component: 0,
            fields: vec![FieldWrite {
                offset: 6000,
                length: 4,
                value: ExprRef::Node { index: 2, slot: 0 },
            }]
            .into(),
        };
        assert_eq!(
            Program::decode(&program.encode()),
            Err(DecodeError::Invalid(ProgramError::FieldOutOfRange {
                component: 0,
                offset: 6000,
                length: 4,
                size: 8,
            }))
        );
    }
}
