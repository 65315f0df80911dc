//! In-memory node graphs, the compiler's input.
//!
//! Execution flows from a node's `Out` flow port to the `In` flow port of
//! the node it runs next. Values flow from an `Out` value port to every
//! `In` value port reading it. A graph can be invoked from other graphs
//! through a [`GraphNodeKind::Subgraph`] node whose ports mirror the
//! invoked graph's input and output pass-through nodes.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{ArithOp, CompareOp, Constant, ValueType};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique graph identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub u64);

impl GraphId {
    fn next() -> Self {
        Self(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Flow,
    Value(ValueType),
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow => f.write_str("flow"),
            Self::Value(ty) => write!(f, "{ty}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub name: String,
    pub direction: Direction,
    pub kind: PortKind,
    /// Value used when an input value port has no link.
    pub inline: Option<Constant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: usize,
    pub port: usize,
}

/// Always leads from an `Out` port to an `In` port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub from: PortRef,
    pub to: PortRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    ReadField { component: String, field: String },
    LookupField {
        lookup: u16,
        component: String,
        field: String,
    },
    ReadVar { var: String },
    Not,
    And,
    Or,
    Compare(CompareOp, ValueType),
    Arith(ArithOp, ValueType),
}

#[derive(Debug, Clone)]
pub enum GraphNodeKind {
    Root,
    Sequence,
    Selector,
    WriteField { component: String },
    WaitFor,
    WaitUntil,
    Fail,
    Optional,
    Catch,
    WriteVar { var: String },
    Query { query: u16, var: String },
    Parallel,
    ThreadRoot { looping: bool },
    Subgraph(Arc<Graph>),
    SubgraphInput,
    SubgraphOutput,
    Expr(ExprKind),
}

impl GraphNodeKind {
    /// Whether the node becomes an instruction of the compiled program.
    #[must_use]
    pub fn is_exec(&self) -> bool {
        !matches!(
            self,
            Self::Subgraph(_)
                | Self::SubgraphInput
                | Self::SubgraphOutput
                | Self::Expr(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Sequence => "sequence",
            Self::Selector => "selector",
            Self::WriteField { .. } => "write-field",
            Self::WaitFor => "wait-for",
            Self::WaitUntil => "wait-until",
            Self::Fail => "fail",
            Self::Optional => "optional",
            Self::Catch => "catch",
            Self::WriteVar { .. } => "write-var",
            Self::Query { .. } => "query",
            Self::Parallel => "parallel",
            Self::ThreadRoot { .. } => "thread-root",
            Self::Subgraph(_) => "call",
            Self::SubgraphInput => "input",
            Self::SubgraphOutput => "output",
            Self::Expr(expr) => match expr {
                ExprKind::ReadField { .. } => "read-field",
                ExprKind::LookupField { .. } => "lookup-field",
                ExprKind::ReadVar { .. } => "read-var",
                ExprKind::Not => "not",
                ExprKind::And => "and",
                ExprKind::Or => "or",
                ExprKind::Compare(..) => "compare",
                ExprKind::Arith(..) => "arith",
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub label: String,
    pub kind: GraphNodeKind,
    pub ports: Vec<Port>,
}

impl GraphNode {
    #[must_use]
    pub fn port(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    /// Indices of the flow (`flow == true`) or value ports facing
    /// `direction`.
    pub fn ports_where(
        &self,
        direction: Direction,
        flow: bool,
    ) -> impl Iterator<Item = usize> + '_ {
        self.ports.iter().enumerate().filter_map(move |(i, p)| {
            (p.direction == direction && (p.kind == PortKind::Flow) == flow)
                .then_some(i)
        })
    }
}

#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    name: String,
    nodes: Vec<GraphNode>,
    links: Vec<Link>,
}

impl Graph {
    #[inline]
    #[must_use]
    pub fn id(&self) -> GraphId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    #[inline]
    #[must_use]
    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    #[must_use]
    pub fn find(&self, label: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.label == label)
    }

    /// Links leaving `from`.
    pub fn outgoing(&self, from: PortRef) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.from == from)
    }

    /// Links arriving at `to`.
    pub fn incoming(&self, to: PortRef) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.to == to)
    }

    /// The pass-through node carrying the graph's parameters.
    #[must_use]
    pub fn input_node(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| matches!(n.kind, GraphNodeKind::SubgraphInput))
    }

    /// The pass-through node carrying the graph's results.
    #[must_use]
    pub fn output_node(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| matches!(n.kind, GraphNodeKind::SubgraphOutput))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node {node} has no port `{port}`")]
    UnknownPort { node: String, port: String },
    #[error("`{node}.{port}` cannot be linked in this direction")]
    WrongDirection { node: String, port: String },
    #[error("cannot link a {from} port to a {to} port")]
    KindMismatch { from: PortKind, to: PortKind },
    #[error("`{node}.{port}` expects a {expected} value")]
    InlineMismatch {
        node: String,
        port: String,
        expected: PortKind,
    },
}

fn flow_in() -> Port {
    port("in", Direction::In, PortKind::Flow)
}

fn flow_out(name: &str) -> Port {
    port(name, Direction::Out, PortKind::Flow)
}

fn value_in(name: &str, ty: ValueType) -> Port {
    port(name, Direction::In, PortKind::Value(ty))
}

fn value_out(ty: ValueType) -> Port {
    port("out", Direction::Out, PortKind::Value(ty))
}

fn port(name: &str, direction: Direction, kind: PortKind) -> Port {
    Port {
        name: name.to_owned(),
        direction,
        kind,
        inline: None,
    }
}

/// Builds a [`Graph`] node by node. Every constructor returns the index of
/// the new node.
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<GraphNode>,
    links: Vec<Link>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            nodes: Vec::new(),
            links: Vec::new(),
        }
    }

    fn add(&mut self, kind: GraphNodeKind, ports: Vec<Port>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(GraphNode {
            label: format!("{}{index}", kind.name()),
            kind,
            ports,
        });
        index
    }

    pub fn set_label(&mut self, node: usize, label: &str) {
        self.nodes[node].label = label.to_owned();
    }

    #[must_use]
    pub fn node(&self, node: usize) -> &GraphNode {
        &self.nodes[node]
    }

    pub fn root(&mut self) -> usize {
        self.add(GraphNodeKind::Root, vec![flow_out("child")])
    }

    pub fn sequence(&mut self, children: usize) -> usize {
        let mut ports = vec![flow_in()];
        ports.extend((0..children).map(|i| flow_out(&i.to_string())));
        self.add(GraphNodeKind::Sequence, ports)
    }

    /// Branch `i` runs child port `i` when input `guard{i}` holds.
    pub fn selector(&mut self, branches: usize) -> usize {
        let mut ports = vec![flow_in()];
        for i in 0..branches {
            ports.push(flow_out(&i.to_string()));
            ports.push(value_in(&format!("guard{i}"), ValueType::Bool));
        }
        self.add(GraphNodeKind::Selector, ports)
    }

    /// One value input per field, named after the field.
    pub fn write_field(
        &mut self,
        component: &str,
        fields: &[(&str, ValueType)],
    ) -> usize {
        let mut ports = vec![flow_in()];
        ports.extend(fields.iter().map(|(name, ty)| value_in(name, *ty)));
        self.add(
            GraphNodeKind::WriteField {
                component: component.to_owned(),
            },
            ports,
        )
    }

    pub fn wait_for(&mut self) -> usize {
        let ports = vec![flow_in(), value_in("duration", ValueType::Float)];
        self.add(GraphNodeKind::WaitFor, ports)
    }

    pub fn wait_until(&mut self) -> usize {
        let ports = vec![flow_in(), value_in("condition", ValueType::Bool)];
        self.add(GraphNodeKind::WaitUntil, ports)
    }

    pub fn fail(&mut self) -> usize {
        self.add(GraphNodeKind::Fail, vec![flow_in()])
    }

    pub fn optional(&mut self) -> usize {
        let ports = vec![
            flow_in(),
            flow_out("child"),
            value_in("guard", ValueType::Bool),
        ];
        self.add(GraphNodeKind::Optional, ports)
    }

    pub fn catch(&mut self) -> usize {
        self.add(GraphNodeKind::Catch, vec![flow_in(), flow_out("child")])
    }

    pub fn write_var(&mut self, var: &str, ty: ValueType) -> usize {
        self.add(
            GraphNodeKind::WriteVar {
                var: var.to_owned(),
            },
            vec![flow_in(), value_in("value", ty)],
        )
    }

    /// Runs query `query` and stores its result count in `var`.
    pub fn query(&mut self, query: u16, var: &str) -> usize {
        self.add(
            GraphNodeKind::Query {
                query,
                var: var.to_owned(),
            },
            vec![flow_in()],
        )
    }

    pub fn parallel(&mut self) -> usize {
        let ports = vec![flow_in(), flow_out("main"), flow_out("parallel")];
        self.add(GraphNodeKind::Parallel, ports)
    }

    pub fn thread_root(&mut self, looping: bool) -> usize {
        self.add(
            GraphNodeKind::ThreadRoot { looping },
            vec![flow_in(), flow_out("child")],
        )
    }

    /// Declares the graph's parameters: each port becomes an input of
    /// every node invoking this graph.
    pub fn subgraph_input(&mut self, ports: &[(&str, PortKind)]) -> usize {
        let ports = ports
            .iter()
            .map(|(name, kind)| port(name, Direction::Out, *kind))
            .collect();
        self.add(GraphNodeKind::SubgraphInput, ports)
    }

    /// Declares the graph's results: each port becomes an output of every
    /// node invoking this graph.
    pub fn subgraph_output(&mut self, ports: &[(&str, PortKind)]) -> usize {
        let ports = ports
            .iter()
            .map(|(name, kind)| port(name, Direction::In, *kind))
            .collect();
        self.add(GraphNodeKind::SubgraphOutput, ports)
    }

    /// Invokes `graph`, mirroring its pass-through ports.
    pub fn subgraph(&mut self, graph: &Arc<Graph>) -> usize {
        let mut ports = Vec::new();
        if let Some(input) = graph.input_node() {
            ports.extend(
                graph.nodes[input]
                    .ports
                    .iter()
                    .map(|p| port(&p.name, Direction::In, p.kind)),
            );
        }
        if let Some(output) = graph.output_node() {
            ports.extend(
                graph.nodes[output]
                    .ports
                    .iter()
                    .map(|p| port(&p.name, Direction::Out, p.kind)),
            );
        }
        self.add(GraphNodeKind::Subgraph(Arc::clone(graph)), ports)
    }

    pub fn read_field(
        &mut self,
        component: &str,
        field: &str,
        ty: ValueType,
    ) -> usize {
        self.add(
            GraphNodeKind::Expr(ExprKind::ReadField {
                component: component.to_owned(),
                field: field.to_owned(),
            }),
            vec![value_out(ty)],
        )
    }

    pub fn lookup_field(
        &mut self,
        lookup: u16,
        component: &str,
        field: &str,
        ty: ValueType,
    ) -> usize {
        self.add(
            GraphNodeKind::Expr(ExprKind::LookupField {
                lookup,
                component: component.to_owned(),
                field: field.to_owned(),
            }),
            vec![value_out(ty)],
        )
    }

    pub fn read_var(&mut self, var: &str, ty: ValueType) -> usize {
        self.add(
            GraphNodeKind::Expr(ExprKind::ReadVar {
                var: var.to_owned(),
            }),
            vec![value_out(ty)],
        )
    }

    pub fn not(&mut self) -> usize {
        let ports = vec![
            value_in("a", ValueType::Bool),
            value_out(ValueType::Bool),
        ];
        self.add(GraphNodeKind::Expr(ExprKind::Not), ports)
    }

    pub fn and(&mut self) -> usize {
        self.logic(ExprKind::And)
    }

    pub fn or(&mut self) -> usize {
        self.logic(ExprKind::Or)
    }

    fn logic(&mut self, kind: ExprKind) -> usize {
        let ports = vec![
            value_in("a", ValueType::Bool),
            value_in("b", ValueType::Bool),
            value_out(ValueType::Bool),
        ];
        self.add(GraphNodeKind::Expr(kind), ports)
    }

    pub fn compare(&mut self, op: CompareOp, ty: ValueType) -> usize {
        let ports = vec![
            value_in("a", ty),
            value_in("b", ty),
            value_out(ValueType::Bool),
        ];
        self.add(GraphNodeKind::Expr(ExprKind::Compare(op, ty)), ports)
    }

    pub fn arith(&mut self, op: ArithOp, ty: ValueType) -> usize {
        let ports = vec![value_in("a", ty), value_in("b", ty), value_out(ty)];
        self.add(GraphNodeKind::Expr(ExprKind::Arith(op, ty)), ports)
    }

    fn port_ref(
        &self,
        node: usize,
        port: &str,
        direction: Direction,
    ) -> Result<(PortRef, PortKind), GraphError> {
        let n = &self.nodes[node];
        let index = n.port(port).ok_or_else(|| GraphError::UnknownPort {
            node: n.label.clone(),
            port: port.to_owned(),
        })?;
        let p = &n.ports[index];
        if p.direction != direction {
            return Err(GraphError::WrongDirection {
                node: n.label.clone(),
                port: port.to_owned(),
            });
        }
        Ok((PortRef { node, port: index }, p.kind))
    }

    /// Links output `from` to input `to`. Multiple links on one port are
    /// accepted here and reported by the compiler.
    pub fn connect(
        &mut self,
        from: (usize, &str),
        to: (usize, &str),
    ) -> Result<(), GraphError> {
        let (from, from_kind) = self.port_ref(from.0, from.1, Direction::Out)?;
        let (to, to_kind) = self.port_ref(to.0, to.1, Direction::In)?;
        if from_kind != to_kind {
            return Err(GraphError::KindMismatch {
                from: from_kind,
                to: to_kind,
            });
        }
        self.links.push(Link { from, to });
        Ok(())
    }

    /// Sets the value an unlinked value input falls back to.
    pub fn set_inline(
        &mut self,
        node: usize,
        port: &str,
        value: Constant,
    ) -> Result<(), GraphError> {
        let (r, kind) = self.port_ref(node, port, Direction::In)?;
        if kind != PortKind::Value(value.ty()) {
            return Err(GraphError::InlineMismatch {
                node: self.nodes[node].label.clone(),
                port: port.to_owned(),
                expected: kind,
            });
        }
        self.nodes[node].ports[r.port].inline = Some(value);
        Ok(())
    }

    #[must_use]
    pub fn build(self) -> Arc<Graph> {
        Arc::new(Graph {
            id: GraphId::next(),
            name: self.name,
            nodes: self.nodes,
            links: self.links,
        })
    }
}
