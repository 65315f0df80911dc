use std::fmt;

use crate::{ComponentHandle, LookupHandle, VarSlot};

/// Scalar types that flow through value ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    Bool = 0,
    Int = 1,
    Float = 2,
}

impl ValueType {
    #[inline]
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int | Self::Float => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Bool),
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::Bool),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A literal stored in the constant pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Bool(bool),
    Int(i32),
    Float(f32),
}

impl Constant {
    #[must_use]
    pub fn ty(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Float(_) => ValueType::Float,
        }
    }

    /// All-zero value of `ty`.
    #[must_use]
    pub fn zero(ty: ValueType) -> Self {
        match ty {
            ValueType::Bool => Self::Bool(false),
            ValueType::Int => Self::Int(0),
            ValueType::Float => Self::Float(0.0),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bool(v) => vec![u8::from(*v)],
            Self::Int(v) => v.to_le_bytes().to_vec(),
            Self::Float(v) => v.to_le_bytes().to_vec(),
        }
    }

    /// Parses `true`/`false`, integers, and numbers containing a `.` as
    /// floats.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "true" => return Some(Self::Bool(true)),
            "false" => return Some(Self::Bool(false)),
            _ => {}
        }
        if text.contains('.') {
            text.parse::<f32>().ok().map(Self::Float)
        } else {
            text.parse::<i32>().ok().map(Self::Int)
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// Opaque handle to an expression result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprRef {
    /// `length` bytes at `offset` of the constant pool.
    Constant { offset: u32, length: u16 },
    /// Output `slot` of expression node `index`.
    Node { index: u16, slot: u8 },
}

impl fmt::Display for ExprRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { offset, length } => {
                write!(f, "c[{offset}..{}]", *offset + u32::from(*length))
            }
            Self::Node { index, slot } => write!(f, "e{index}.{slot}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOp {
    Lt = 0,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn from_u8(tag: u8) -> Option<Self> {
        let op = match tag {
            0 => Self::Lt,
            1 => Self::Le,
            2 => Self::Gt,
            3 => Self::Ge,
            4 => Self::Eq,
            5 => Self::Ne,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Eq => "eq",
            Self::Ne => "ne",
        }
    }

    fn apply<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Sub,
    Mul,
}

impl ArithOp {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Add),
            1 => Some(Self::Sub),
            2 => Some(Self::Mul),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
        }
    }
}

/// A pure operation of the expression sub-program. Each node has a single
/// output in slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprNode {
    ReadField { component: u16, offset: u16, ty: ValueType },
    LookupField { lookup: u16, offset: u16, ty: ValueType },
    ReadVar { slot: VarSlot },
    Not(ExprRef),
    And(ExprRef, ExprRef),
    Or(ExprRef, ExprRef),
    Compare {
        op: CompareOp,
        ty: ValueType,
        lhs: ExprRef,
        rhs: ExprRef,
    },
    Arith {
        op: ArithOp,
        ty: ValueType,
        lhs: ExprRef,
        rhs: ExprRef,
    },
}

impl ExprNode {
    #[must_use]
    pub fn output_type(&self) -> ValueType {
        match self {
            Self::ReadField { ty, .. } | Self::LookupField { ty, .. } => *ty,
            Self::ReadVar { slot } => slot.ty,
            Self::Not(_)
            | Self::And(..)
            | Self::Or(..)
            | Self::Compare { .. } => ValueType::Bool,
            Self::Arith { ty, .. } => *ty,
        }
    }

    #[must_use]
    pub fn operands(&self) -> Vec<ExprRef> {
        match self {
            Self::ReadField { .. }
            | Self::LookupField { .. }
            | Self::ReadVar { .. } => Vec::new(),
            Self::Not(a) => vec![*a],
            Self::And(a, b) | Self::Or(a, b) => vec![*a, *b],
            Self::Compare { lhs, rhs, .. } | Self::Arith { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
        }
    }
}

/// The expression half of a program: a constant pool plus pure nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExprProgram {
    pub constants: Vec<u8>,
    pub nodes: Vec<ExprNode>,
}

impl ExprProgram {
    /// Byte size of the value `expr` produces.
    #[must_use]
    pub fn result_size(&self, expr: ExprRef) -> usize {
        match expr {
            ExprRef::Constant { length, .. } => length as usize,
            ExprRef::Node { index, .. } => {
                self.nodes[index as usize].output_type().size()
            }
        }
    }
}

/// Everything an expression may read.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub expressions: &'a ExprProgram,
    pub components: &'a [ComponentHandle<'a>],
    pub lookups: &'a [LookupHandle<'a>],
    pub blackboard: &'a [u8],
    pub now: f64,
}

/// Evaluates expression references on behalf of the interpreter.
///
/// Evaluation must be pure and deterministic. `dest` must be exactly as long
/// as the value the expression produces; anything else is a programming
/// error and panics.
pub trait Evaluator {
    fn evaluate(&self, expr: ExprRef, ctx: &EvalContext<'_>, dest: &mut [u8]);

    fn evaluate_bool(&self, expr: ExprRef, ctx: &EvalContext<'_>) -> bool {
        let mut out = [0u8; 1];
        self.evaluate(expr, ctx, &mut out);
        out[0] != 0
    }

    fn evaluate_f32(&self, expr: ExprRef, ctx: &EvalContext<'_>) -> f32 {
        let mut out = [0u8; 4];
        self.evaluate(expr, ctx, &mut out);
        f32::from_le_bytes(out)
    }
}

/// Evaluator for the built-in operator set of [`ExprNode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvaluator;

#[derive(Debug, Clone, Copy)]
struct Scalar {
    bytes: [u8; 4],
    len: usize,
}

impl Scalar {
    fn from_slice(src: &[u8]) -> Self {
        assert!(src.len() <= 4, "scalar of {} bytes", src.len());
        let mut bytes = [0u8; 4];
        bytes[..src.len()].copy_from_slice(src);
        Self {
            bytes,
            len: src.len(),
        }
    }

    fn bool(v: bool) -> Self {
        Self::from_slice(&[u8::from(v)])
    }

    fn int(v: i32) -> Self {
        Self::from_slice(&v.to_le_bytes())
    }

    fn float(v: f32) -> Self {
        Self::from_slice(&v.to_le_bytes())
    }

    fn as_bool(&self) -> bool {
        self.bytes[0] != 0
    }

    fn as_i32(&self) -> i32 {
        i32::from_le_bytes(self.bytes)
    }

    fn as_f32(&self) -> f32 {
        f32::from_le_bytes(self.bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl ExprEvaluator {
    fn eval(&self, expr: ExprRef, ctx: &EvalContext<'_>) -> Scalar {
        match expr {
            ExprRef::Constant { offset, length } => {
                let start = offset as usize;
                let end = start + length as usize;
                Scalar::from_slice(&ctx.expressions.constants[start..end])
            }
            ExprRef::Node { index, slot } => {
                assert_eq!(slot, 0, "expression nodes have a single output");
                let node = ctx.expressions.nodes[index as usize];
                self.eval_node(&node, ctx)
            }
        }
    }

    fn eval_node(&self, node: &ExprNode, ctx: &EvalContext<'_>) -> Scalar {
        match *node {
            ExprNode::ReadField { component, offset, ty } => {
                let data = &*ctx.components[component as usize].data;
                let start = offset as usize;
                Scalar::from_slice(&data[start..start + ty.size()])
            }
            ExprNode::LookupField { lookup, offset, ty } => {
                let data = ctx.lookups[lookup as usize].data;
                let start = offset as usize;
                Scalar::from_slice(&data[start..start + ty.size()])
            }
            ExprNode::ReadVar { slot } => {
                let start = slot.offset as usize;
                let end = start + slot.length();
                Scalar::from_slice(&ctx.blackboard[start..end])
            }
            ExprNode::Not(a) => Scalar::bool(!self.eval(a, ctx).as_bool()),
            ExprNode::And(a, b) => {
                let v = self.eval(a, ctx).as_bool()
                    && self.eval(b, ctx).as_bool();
                Scalar::bool(v)
            }
            ExprNode::Or(a, b) => {
                let v = self.eval(a, ctx).as_bool()
                    || self.eval(b, ctx).as_bool();
                Scalar::bool(v)
            }
            ExprNode::Compare { op, ty, lhs, rhs } => {
                let l = self.eval(lhs, ctx);
                let r = self.eval(rhs, ctx);
                let v = match ty {
                    ValueType::Bool => op.apply(l.as_bool(), r.as_bool()),
                    ValueType::Int => op.apply(l.as_i32(), r.as_i32()),
                    ValueType::Float => op.apply(l.as_f32(), r.as_f32()),
                };
                Scalar::bool(v)
            }
            ExprNode::Arith { op, ty, lhs, rhs } => {
                let l = self.eval(lhs, ctx);
                let r = self.eval(rhs, ctx);
                match ty {
                    ValueType::Int => {
                        let (a, b) = (l.as_i32(), r.as_i32());
                        Scalar::int(match op {
                            ArithOp::Add => a.wrapping_add(b),
                            ArithOp::Sub => a.wrapping_sub(b),
                            ArithOp::Mul => a.wrapping_mul(b),
                        })
                    }
                    ValueType::Float => {
                        let (a, b) = (l.as_f32(), r.as_f32());
                        Scalar::float(match op {
                            ArithOp::Add => a + b,
                            ArithOp::Sub => a - b,
                            ArithOp::Mul => a * b,
                        })
                    }
                    ValueType::Bool => {
                        panic!("arithmetic on bool operands")
                    }
                }
            }
        }
    }
}

impl Evaluator for ExprEvaluator {
    fn evaluate(&self, expr: ExprRef, ctx: &EvalContext<'_>, dest: &mut [u8]) {
        let value = self.eval(expr, ctx);
        assert_eq!(
            dest.len(),
            value.len,
            "destination size does not match expression result size"
        );
        dest.copy_from_slice(value.as_bytes());
    }
}
