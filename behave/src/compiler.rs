//! Lowers a [`Graph`] into a [`Program`].
//!
//! A node reached through different chains of sub-graph invocations is a
//! different instance, so every node is keyed by the hash of the chain that
//! led to it plus its own identity. Compilation runs in two passes over the
//! same walk: registration hands out indices and collects the component
//! types, emission writes each instance's payload.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use twox_hash::{XxHash3_128, XxHash64};

use crate::{
    BlackboardLayout, Branch, ComponentCatalog, ComponentType, Constant,
    DebugId, Direction, ExprKind, ExprNode, ExprProgram, ExprRef, FieldWrite,
    Graph, GraphId, GraphNodeKind, InstanceId, Link, Node, NodeId, PortKind,
    PortRef, Program, ValueType, VarSlot, WaitUntil, align_up,
    component_type_id,
};

const MAX_INDEX: usize = u16::MAX as usize;

/// Where in which graph a diagnostic points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub graph: String,
    pub node: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.graph, self.node)
    }
}

fn location(graph: &Graph, node: usize) -> Location {
    Location {
        graph: graph.name().to_owned(),
        node: graph.node(node).label.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("graph `{graph}` has no root node")]
    MissingRoot { graph: String },
    #[error("{at}: second root node")]
    DuplicateRoot { at: Location },
    #[error("{at}: a root cannot be the child of another node")]
    RootAsChild { at: Location },
    #[error("{at}: port `{port}` has more than one connection")]
    AmbiguousConnection { at: Location, port: String },
    #[error("{at}: input `{port}` is not connected and has no value")]
    MissingInput { at: Location, port: String },
    #[error("{at}: sub-graph has no port `{port}`")]
    UnresolvedSubgraphPort { at: Location, port: String },
    #[error("{at}: invoked graph has no {kind} node")]
    MissingSubgraphNode { at: Location, kind: &'static str },
    #[error("{at}: unknown component `{component}`")]
    UnknownComponent { at: Location, component: String },
    #[error("{at}: component `{component}` has no field `{field}`")]
    UnknownField {
        at: Location,
        component: String,
        field: String,
    },
    #[error("{at}: unknown variable `{name}`")]
    UnknownVariable { at: Location, name: String },
    #[error("{at}: expected {expected}, found {found}")]
    TypeMismatch {
        at: Location,
        expected: ValueType,
        found: ValueType,
    },
    #[error("{at}: parallel branch must start with a thread root")]
    InvalidParallelBranch { at: Location },
    #[error("{at}: thread roots may only start a parallel branch")]
    MisplacedThreadRoot { at: Location },
    #[error("{at}: `{port}` connects nodes of the wrong category")]
    WrongCategory { at: Location, port: String },
    #[error("{at}: expression depends on itself")]
    ExpressionCycle { at: Location },
    #[error(
        "{at}: lookup {lookup} is read as `{found}`, elsewhere as \
         `{expected}`"
    )]
    LookupConflict {
        at: Location,
        lookup: u16,
        expected: String,
        found: String,
    },
    #[error("{at}: {count} children, at most {max} are supported")]
    TooManyChildren {
        at: Location,
        count: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileWarning {
    #[error("{at}: entry `{port}` is not wired inside the sub-graph")]
    UnwiredSubgraphEntry { at: Location, port: String },
    #[error("{at}: output `{port}` is not wired inside the sub-graph")]
    UnwiredSubgraphOutput { at: Location, port: String },
    #[error("{at}: node is never reached")]
    Unreachable { at: Location },
}

/// Result of a compilation. `program` is always produced so it can be
/// inspected, but must not be executed while `errors` is non-empty.
#[derive(Debug)]
pub struct Compilation {
    pub program: Program,
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CompileWarning>,
}

impl Compilation {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_program(self) -> Result<Program, Vec<CompileError>> {
        if self.errors.is_empty() {
            Ok(self.program)
        } else {
            Err(self.errors)
        }
    }
}

pub struct Compiler<'c> {
    catalog: &'c ComponentCatalog,
    blackboard: &'c BlackboardLayout,
}

impl<'c> Compiler<'c> {
    #[must_use]
    pub fn new(
        catalog: &'c ComponentCatalog,
        blackboard: &'c BlackboardLayout,
    ) -> Self {
        Self {
            catalog,
            blackboard,
        }
    }

    pub fn compile(&self, graph: &Graph) -> Compilation {
        let mut lowering = Lowering::new(self.catalog, self.blackboard, graph);
        lowering.register_roots();
        lowering.warn_unreachable();
        let program = lowering.emit();

        let Lowering {
            mut errors,
            mut warnings,
            ..
        } = lowering;
        dedup(&mut errors);
        dedup(&mut warnings);

        log::debug!(
            "compiled `{}`: {} nodes, {} expressions, {} errors, {} warnings",
            graph.name(),
            program.len(),
            program.expressions().nodes.len(),
            errors.len(),
            warnings.len()
        );

        Compilation {
            program,
            errors,
            warnings,
        }
    }
}

fn dedup<T: PartialEq>(items: &mut Vec<T>) {
    let mut unique = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    *items = unique;
}

/// Identity of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InstanceKey {
    path: u64,
    graph: GraphId,
    node: usize,
}

#[derive(Debug, Clone)]
struct Level<'g> {
    graph: &'g Graph,
    /// Invocation node in the enclosing level's graph.
    via: Option<usize>,
    hash: u64,
}

/// The chain of sub-graph invocations leading to the current graph.
/// Entering or leaving returns a new path.
#[derive(Debug, Clone)]
struct Path<'g> {
    levels: Vec<Level<'g>>,
}

impl<'g> Path<'g> {
    fn new(entry: &'g Graph) -> Self {
        Self {
            levels: vec![Level {
                graph: entry,
                via: None,
                hash: 0,
            }],
        }
    }

    fn last(&self) -> &Level<'g> {
        &self.levels[self.levels.len() - 1]
    }

    fn graph(&self) -> &'g Graph {
        self.last().graph
    }

    fn key(&self, node: usize) -> InstanceKey {
        InstanceKey {
            path: self.last().hash,
            graph: self.graph().id(),
            node,
        }
    }

    fn enter(&self, via: usize, graph: &'g Graph) -> Self {
        let parent = self.last();
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&parent.graph.id().0.to_le_bytes());
        bytes[8..].copy_from_slice(&(via as u64).to_le_bytes());
        let hash = XxHash64::oneshot(parent.hash, &bytes);

        let mut path = self.clone();
        path.levels.push(Level {
            graph,
            via: Some(via),
            hash,
        });
        path
    }

    /// The enclosing path and the invocation node that led here.
    fn leave(&self) -> Option<(Self, usize)> {
        let via = self.last().via?;
        let mut path = self.clone();
        path.levels.pop();
        Some((path, via))
    }

    fn instance_ids(&self) -> Vec<InstanceId> {
        self.levels
            .windows(2)
            .filter_map(|pair| {
                let via = pair[1].via?;
                Some(instance_id(pair[0].graph.name(), via))
            })
            .collect()
    }

    fn debug_id(&self, node: usize) -> DebugId {
        let mut bytes = Vec::new();
        for id in self.instance_ids() {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        bytes.extend_from_slice(self.graph().name().as_bytes());
        bytes.extend_from_slice(&(node as u32).to_le_bytes());
        XxHash3_128::oneshot(&bytes)
    }
}

fn instance_id(graph: &str, node: usize) -> InstanceId {
    let mut bytes = graph.as_bytes().to_vec();
    bytes.extend_from_slice(&(node as u32).to_le_bytes());
    XxHash64::oneshot(0, &bytes)
}

/// Deduplicated constant bytes, each value aligned to its own size.
#[derive(Debug, Default)]
struct ConstantPool {
    bytes: Vec<u8>,
    offsets: HashMap<Vec<u8>, u32>,
}

impl ConstantPool {
    fn intern(&mut self, value: Constant) -> ExprRef {
        let encoded = value.to_bytes();
        let length = encoded.len() as u16;
        if let Some(&offset) = self.offsets.get(&encoded) {
            return ExprRef::Constant { offset, length };
        }
        let offset = align_up(self.bytes.len(), encoded.len());
        self.bytes.resize(offset, 0);
        self.bytes.extend_from_slice(&encoded);
        let offset = offset as u32;
        self.offsets.insert(encoded, offset);
        ExprRef::Constant { offset, length }
    }
}

enum Target<'g> {
    Nop,
    Node(Path<'g>, usize),
}

enum Source<'g> {
    Expr(Path<'g>, usize),
    Constant(Constant),
}

struct Lowering<'c, 'g> {
    catalog: &'c ComponentCatalog,
    blackboard: &'c BlackboardLayout,
    entry: &'g Graph,

    exec: HashMap<InstanceKey, NodeId>,
    exec_order: Vec<(Path<'g>, usize)>,
    exprs: HashMap<InstanceKey, u16>,
    expr_order: Vec<(Path<'g>, usize)>,
    in_progress: HashSet<InstanceKey>,
    types: BTreeSet<String>,
    lookups: BTreeMap<u16, String>,
    visited: HashSet<(GraphId, usize)>,
    graphs: Vec<&'g Graph>,
    pool: ConstantPool,

    errors: Vec<CompileError>,
    warnings: Vec<CompileWarning>,
}

impl<'c, 'g> Lowering<'c, 'g> {
    fn new(
        catalog: &'c ComponentCatalog,
        blackboard: &'c BlackboardLayout,
        entry: &'g Graph,
    ) -> Self {
        Self {
            catalog,
            blackboard,
            entry,
            exec: HashMap::new(),
            exec_order: Vec::new(),
            exprs: HashMap::new(),
            expr_order: Vec::new(),
            in_progress: HashSet::new(),
            types: BTreeSet::new(),
            lookups: BTreeMap::new(),
            visited: HashSet::new(),
            graphs: vec![entry],
            pool: ConstantPool::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn visit(&mut self, graph: &'g Graph, node: usize) {
        self.visited.insert((graph.id(), node));
        if !self.graphs.iter().any(|g| g.id() == graph.id()) {
            self.graphs.push(graph);
        }
    }

    fn register_roots(&mut self) {
        let entry = self.entry;
        let roots: Vec<usize> = entry
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, GraphNodeKind::Root))
            .map(|(i, _)| i)
            .collect();

        match roots.as_slice() {
            [] => self.errors.push(CompileError::MissingRoot {
                graph: entry.name().to_owned(),
            }),
            [root, rest @ ..] => {
                for &extra in rest {
                    self.errors.push(CompileError::DuplicateRoot {
                        at: location(entry, extra),
                    });
                }
                let id = self.register_exec(&Path::new(entry), *root);
                debug_assert_eq!(id, NodeId::ROOT);
            }
        }
    }

    fn register_exec(&mut self, path: &Path<'g>, node: usize) -> NodeId {
        let key = path.key(node);
        if let Some(&id) = self.exec.get(&key) {
            return id;
        }

        let index = self.exec_order.len() + 1;
        if index > MAX_INDEX {
            panic!("program exceeds {MAX_INDEX} execution nodes");
        }
        let id = NodeId(index as u16);
        let previous = self.exec.insert(key, id);
        assert!(previous.is_none(), "node instance registered twice");
        self.exec_order.push((path.clone(), node));

        let graph = path.graph();
        self.visit(graph, node);
        let n = graph.node(node);
        if let GraphNodeKind::WriteField { component } = &n.kind {
            self.note_type(component);
        }

        for port in n.ports_where(Direction::Out, true) {
            if let Target::Node(child_path, child) =
                self.flow_target(path, node, port)
            {
                self.register_exec(&child_path, child);
            }
        }
        for port in n.ports_where(Direction::In, false) {
            if let Some(Source::Expr(source_path, source)) =
                self.value_source(path, node, port)
            {
                self.register_expr(&source_path, source);
            }
        }
        id
    }

    fn register_expr(&mut self, path: &Path<'g>, node: usize) {
        let key = path.key(node);
        if self.exprs.contains_key(&key) {
            return;
        }
        let graph = path.graph();
        if !self.in_progress.insert(key) {
            self.errors.push(CompileError::ExpressionCycle {
                at: location(graph, node),
            });
            return;
        }

        self.visit(graph, node);
        let n = graph.node(node);
        match &n.kind {
            GraphNodeKind::Expr(ExprKind::ReadField { component, .. }) => {
                self.note_type(component);
            }
            GraphNodeKind::Expr(ExprKind::LookupField {
                lookup, component, ..
            }) => self.note_lookup(graph, node, *lookup, component),
            _ => {}
        }
        for port in n.ports_where(Direction::In, false) {
            if let Some(Source::Expr(source_path, source)) =
                self.value_source(path, node, port)
            {
                self.register_expr(&source_path, source);
            }
        }

        // operands are numbered before their users
        let index = self.expr_order.len();
        if index >= MAX_INDEX {
            panic!("program exceeds {MAX_INDEX} expression nodes");
        }
        self.in_progress.remove(&key);
        let previous = self.exprs.insert(key, index as u16);
        assert!(previous.is_none(), "expression instance registered twice");
        self.expr_order.push((path.clone(), node));
    }

    fn note_type(&mut self, component: &str) {
        if self.catalog.get(component).is_some() {
            self.types.insert(component.to_owned());
        }
    }

    fn note_lookup(
        &mut self,
        graph: &Graph,
        node: usize,
        lookup: u16,
        component: &str,
    ) {
        if self.catalog.get(component).is_none() {
            return;
        }
        match self.lookups.get(&lookup) {
            Some(expected) if expected != component => {
                self.errors.push(CompileError::LookupConflict {
                    at: location(graph, node),
                    lookup,
                    expected: expected.clone(),
                    found: component.to_owned(),
                });
            }
            Some(_) => {}
            None => {
                self.lookups.insert(lookup, component.to_owned());
            }
        }
    }

    /// Follows the flow output `port` of `node` to the execution node it
    /// runs, crossing sub-graph boundaries as needed.
    fn flow_target(
        &mut self,
        path: &Path<'g>,
        node: usize,
        port: usize,
    ) -> Target<'g> {
        let graph = path.graph();
        let from = PortRef { node, port };
        let links: Vec<Link> = graph.outgoing(from).copied().collect();
        let link = match links.as_slice() {
            [] => return Target::Nop,
            [link] => *link,
            [first, ..] => {
                self.errors.push(CompileError::AmbiguousConnection {
                    at: location(graph, node),
                    port: graph.node(node).ports[port].name.clone(),
                });
                *first
            }
        };

        let target = graph.node(link.to.node);
        let name = &target.ports[link.to.port].name;
        match &target.kind {
            GraphNodeKind::Subgraph(sub) => {
                self.visit(graph, link.to.node);
                let at = location(graph, link.to.node);
                let Some(input) = sub.input_node() else {
                    self.errors.push(CompileError::MissingSubgraphNode {
                        at,
                        kind: "input",
                    });
                    return Target::Nop;
                };
                let Some(entry) = sub.node(input).port(name) else {
                    self.errors.push(CompileError::UnresolvedSubgraphPort {
                        at,
                        port: name.clone(),
                    });
                    return Target::Nop;
                };
                let inner = path.enter(link.to.node, sub);
                self.visit(sub, input);
                let wired = sub
                    .outgoing(PortRef {
                        node: input,
                        port: entry,
                    })
                    .next()
                    .is_some();
                if !wired {
                    self.warnings.push(CompileWarning::UnwiredSubgraphEntry {
                        at,
                        port: name.clone(),
                    });
                    return Target::Nop;
                }
                self.flow_target(&inner, input, entry)
            }
            GraphNodeKind::SubgraphOutput => {
                self.visit(graph, link.to.node);
                let resolved = path.leave().and_then(|(outer, via)| {
                    let port = outer.graph().node(via).port(name)?;
                    Some((outer, via, port))
                });
                match resolved {
                    Some((outer, via, port)) => {
                        self.flow_target(&outer, via, port)
                    }
                    None => {
                        self.errors.push(CompileError::UnresolvedSubgraphPort {
                            at: location(graph, link.to.node),
                            port: name.clone(),
                        });
                        Target::Nop
                    }
                }
            }
            kind if kind.is_exec() => Target::Node(path.clone(), link.to.node),
            _ => {
                self.errors.push(CompileError::WrongCategory {
                    at: location(graph, link.to.node),
                    port: name.clone(),
                });
                Target::Nop
            }
        }
    }

    /// Follows the value input `port` of `node` back to the expression or
    /// constant feeding it.
    fn value_source(
        &mut self,
        path: &Path<'g>,
        node: usize,
        port: usize,
    ) -> Option<Source<'g>> {
        let graph = path.graph();
        let consumer = &graph.node(node).ports[port];
        let PortKind::Value(ty) = consumer.kind else {
            panic!("flow port `{}` used as a value", consumer.name);
        };

        let to = PortRef { node, port };
        let links: Vec<Link> = graph.incoming(to).copied().collect();
        let link = match links.as_slice() {
            [] => {
                if consumer.inline.is_none() {
                    self.errors.push(CompileError::MissingInput {
                        at: location(graph, node),
                        port: consumer.name.clone(),
                    });
                }
                return consumer.inline.map(Source::Constant);
            }
            [link] => *link,
            [first, ..] => {
                self.errors.push(CompileError::AmbiguousConnection {
                    at: location(graph, node),
                    port: consumer.name.clone(),
                });
                *first
            }
        };

        let source = graph.node(link.from.node);
        let name = &source.ports[link.from.port].name;
        match &source.kind {
            GraphNodeKind::Expr(_) => {
                Some(Source::Expr(path.clone(), link.from.node))
            }
            GraphNodeKind::Subgraph(sub) => {
                self.visit(graph, link.from.node);
                let at = location(graph, link.from.node);
                let Some(output) = sub.output_node() else {
                    self.errors.push(CompileError::MissingSubgraphNode {
                        at,
                        kind: "output",
                    });
                    return None;
                };
                let Some(result) = sub.node(output).port(name) else {
                    self.errors.push(CompileError::UnresolvedSubgraphPort {
                        at,
                        port: name.clone(),
                    });
                    return None;
                };
                self.visit(sub, output);
                let wired = sub.node(output).ports[result].inline.is_some()
                    || sub
                        .incoming(PortRef {
                            node: output,
                            port: result,
                        })
                        .next()
                        .is_some();
                if !wired {
                    self.warnings.push(CompileWarning::UnwiredSubgraphOutput {
                        at,
                        port: name.clone(),
                    });
                    return Some(Source::Constant(Constant::zero(ty)));
                }
                let inner = path.enter(link.from.node, sub);
                self.value_source(&inner, output, result)
            }
            GraphNodeKind::SubgraphInput => {
                self.visit(graph, link.from.node);
                let resolved = path.leave().and_then(|(outer, via)| {
                    let port = outer.graph().node(via).port(name)?;
                    Some((outer, via, port))
                });
                match resolved {
                    Some((outer, via, port)) => {
                        self.value_source(&outer, via, port)
                    }
                    None => {
                        self.errors.push(CompileError::UnresolvedSubgraphPort {
                            at: location(graph, link.from.node),
                            port: name.clone(),
                        });
                        None
                    }
                }
            }
            _ => {
                self.errors.push(CompileError::WrongCategory {
                    at: location(graph, node),
                    port: consumer.name.clone(),
                });
                None
            }
        }
    }

    fn warn_unreachable(&mut self) {
        for graph in self.graphs.clone() {
            for (index, node) in graph.nodes().iter().enumerate() {
                let pass_through = matches!(
                    node.kind,
                    GraphNodeKind::SubgraphInput | GraphNodeKind::SubgraphOutput
                );
                let seen = self.visited.contains(&(graph.id(), index));
                if !pass_through && !seen {
                    self.warnings.push(CompileWarning::Unreachable {
                        at: location(graph, index),
                    });
                }
            }
        }
    }

    fn component_type(&self, name: &str) -> Option<ComponentType> {
        let layout = self.catalog.get(name)?;
        Some(ComponentType {
            name: name.to_owned(),
            id: component_type_id(name),
            size: layout.size,
        })
    }

    fn emit(&mut self) -> Program {
        let types: Vec<ComponentType> = self
            .types
            .iter()
            .filter_map(|name| self.component_type(name))
            .collect();
        let lookup_count =
            self.lookups.keys().next_back().map_or(0, |&i| i as usize + 1);
        let mut lookups = vec![None; lookup_count];
        for (&index, name) in &self.lookups {
            lookups[index as usize] = self.component_type(name);
        }

        let mut nodes = vec![Node::Nop];
        let mut debug_ids = vec![0];
        let mut subgraph_paths = vec![Box::default()];
        if self.exec_order.is_empty() {
            nodes.push(Node::Root {
                child: NodeId::NOP,
            });
            debug_ids.push(0);
            subgraph_paths.push(Box::default());
        }
        for i in 0..self.exec_order.len() {
            let (path, node) = self.exec_order[i].clone();
            nodes.push(self.emit_exec(&path, node));
            debug_ids.push(path.debug_id(node));
            subgraph_paths.push(path.instance_ids().into_boxed_slice());
        }

        let mut expr_nodes = Vec::with_capacity(self.expr_order.len());
        for i in 0..self.expr_order.len() {
            let (path, node) = self.expr_order[i].clone();
            expr_nodes.push(self.emit_expr(&path, node));
        }

        Program {
            expressions: ExprProgram {
                constants: std::mem::take(&mut self.pool.bytes),
                nodes: expr_nodes,
            },
            nodes,
            debug_ids,
            subgraph_paths,
            types,
            lookups,
            blackboard_size: self.blackboard.size() as u32,
        }
    }

    fn component_index(&self, name: &str) -> Option<u16> {
        self.types.iter().position(|t| t == name).map(|i| i as u16)
    }

    fn emit_exec(&mut self, path: &Path<'g>, node: usize) -> Node {
        let graph = path.graph();
        let n = graph.node(node);
        let at = location(graph, node);

        match &n.kind {
            GraphNodeKind::Root => Node::Root {
                child: self.child(path, node, "child"),
            },
            GraphNodeKind::Sequence | GraphNodeKind::Selector
                if n.ports_where(Direction::Out, true).count() > MAX_INDEX =>
            {
                self.errors.push(CompileError::TooManyChildren {
                    at,
                    count: n.ports_where(Direction::Out, true).count(),
                    max: MAX_INDEX,
                });
                Node::Nop
            }
            GraphNodeKind::Sequence => {
                let children = n
                    .ports_where(Direction::Out, true)
                    .map(|port| self.child_at(path, node, port))
                    .collect();
                Node::Sequence { children }
            }
            GraphNodeKind::Selector => {
                let count = n.ports_where(Direction::Out, true).count();
                let branches = (0..count)
                    .map(|i| Branch {
                        guard: self.value(
                            path,
                            node,
                            &format!("guard{i}"),
                            ValueType::Bool,
                        ),
                        child: self.child(path, node, &i.to_string()),
                    })
                    .collect();
                Node::Selector { branches }
            }
            GraphNodeKind::WriteField { component } => {
                let (Some(layout), Some(index)) = (
                    self.catalog.get(component),
                    self.component_index(component),
                ) else {
                    self.errors.push(CompileError::UnknownComponent {
                        at,
                        component: component.clone(),
                    });
                    return Node::Nop;
                };
                let mut fields = Vec::new();
                for port in n.ports_where(Direction::In, false) {
                    let p = &n.ports[port];
                    let PortKind::Value(ty) = p.kind else { continue };
                    let Some(field) = layout.field(&p.name) else {
                        self.errors.push(CompileError::UnknownField {
                            at: at.clone(),
                            component: component.clone(),
                            field: p.name.clone(),
                        });
                        continue;
                    };
                    if field.ty != ty {
                        self.errors.push(CompileError::TypeMismatch {
                            at: at.clone(),
                            expected: field.ty,
                            found: ty,
                        });
                    }
                    fields.push(FieldWrite {
                        offset: field.offset,
                        length: field.ty.size() as u16,
                        value: self.value(path, node, &p.name, field.ty),
                    });
                }
                Node::WriteField {
                    component: index,
                    fields: fields.into(),
                }
            }
            GraphNodeKind::WaitFor => Node::Wait {
                until: WaitUntil::Duration(self.value(
                    path,
                    node,
                    "duration",
                    ValueType::Float,
                )),
            },
            GraphNodeKind::WaitUntil => Node::Wait {
                until: WaitUntil::Condition(self.value(
                    path,
                    node,
                    "condition",
                    ValueType::Bool,
                )),
            },
            GraphNodeKind::Fail => Node::Fail,
            GraphNodeKind::Optional => Node::Optional {
                guard: self.value(path, node, "guard", ValueType::Bool),
                child: self.child(path, node, "child"),
            },
            GraphNodeKind::Catch => Node::Catch {
                child: self.child(path, node, "child"),
            },
            GraphNodeKind::WriteVar { var } => {
                let Some(slot) = self.variable(&at, var) else {
                    return Node::Nop;
                };
                let port_ty = n
                    .port("value")
                    .and_then(|p| match n.ports[p].kind {
                        PortKind::Value(ty) => Some(ty),
                        PortKind::Flow => None,
                    })
                    .unwrap_or(slot.ty);
                if port_ty != slot.ty {
                    self.errors.push(CompileError::TypeMismatch {
                        at,
                        expected: slot.ty,
                        found: port_ty,
                    });
                }
                Node::WriteVar {
                    slot,
                    value: self.value(path, node, "value", slot.ty),
                }
            }
            GraphNodeKind::Query { query, var } => {
                match self.variable(&at, var) {
                    Some(result) => Node::Query {
                        query: *query,
                        result,
                    },
                    None => Node::Nop,
                }
            }
            GraphNodeKind::Parallel => {
                let main = self.child(path, node, "main");
                let thread = self.thread(path, node);
                Node::Parallel { main, thread }
            }
            GraphNodeKind::ThreadRoot { looping } => Node::ThreadRoot {
                child: self.child(path, node, "child"),
                looping: *looping,
            },
            GraphNodeKind::Subgraph(_)
            | GraphNodeKind::SubgraphInput
            | GraphNodeKind::SubgraphOutput
            | GraphNodeKind::Expr(_) => {
                unreachable!("only execution nodes are registered")
            }
        }
    }

    fn variable(&mut self, at: &Location, name: &str) -> Option<VarSlot> {
        let slot = self.blackboard.get(name);
        if slot.is_none() {
            self.errors.push(CompileError::UnknownVariable {
                at: at.clone(),
                name: name.to_owned(),
            });
        }
        slot
    }

    fn child(&mut self, path: &Path<'g>, node: usize, port: &str) -> NodeId {
        match path.graph().node(node).port(port) {
            Some(port) => self.child_at(path, node, port),
            None => NodeId::NOP,
        }
    }

    fn child_at(
        &mut self,
        path: &Path<'g>,
        node: usize,
        port: usize,
    ) -> NodeId {
        let target = self.flow_target(path, node, port);
        let Target::Node(child_path, child) = target else {
            return NodeId::NOP;
        };
        let graph = child_path.graph();
        match graph.node(child).kind {
            GraphNodeKind::Root => {
                self.errors.push(CompileError::RootAsChild {
                    at: location(graph, child),
                });
                NodeId::NOP
            }
            GraphNodeKind::ThreadRoot { .. } => {
                self.errors.push(CompileError::MisplacedThreadRoot {
                    at: location(graph, child),
                });
                NodeId::NOP
            }
            _ => self.instance(&child_path, child),
        }
    }

    fn thread(&mut self, path: &Path<'g>, node: usize) -> NodeId {
        let at = location(path.graph(), node);
        let target = path
            .graph()
            .node(node)
            .port("parallel")
            .map(|port| self.flow_target(path, node, port));
        if let Some(Target::Node(thread_path, thread)) = target {
            let kind = &thread_path.graph().node(thread).kind;
            if matches!(kind, GraphNodeKind::ThreadRoot { .. }) {
                return self.instance(&thread_path, thread);
            }
        }
        self.errors.push(CompileError::InvalidParallelBranch { at });
        NodeId::NOP
    }

    fn instance(&self, path: &Path<'g>, node: usize) -> NodeId {
        self.exec
            .get(&path.key(node))
            .copied()
            .unwrap_or(NodeId::NOP)
    }

    /// Reference to the value feeding input `port`. Falls back to a zero
    /// constant when the input cannot be resolved; the error is recorded.
    fn value(
        &mut self,
        path: &Path<'g>,
        node: usize,
        port: &str,
        ty: ValueType,
    ) -> ExprRef {
        let source = path
            .graph()
            .node(node)
            .port(port)
            .and_then(|p| self.value_source(path, node, p));
        match source {
            Some(Source::Expr(source_path, source)) => {
                match self.exprs.get(&source_path.key(source)) {
                    Some(&index) => ExprRef::Node { index, slot: 0 },
                    None => self.pool.intern(Constant::zero(ty)),
                }
            }
            Some(Source::Constant(value)) => self.pool.intern(value),
            None => self.pool.intern(Constant::zero(ty)),
        }
    }

    fn emit_expr(&mut self, path: &Path<'g>, node: usize) -> ExprNode {
        let graph = path.graph();
        let n = graph.node(node);
        let at = location(graph, node);
        let out = n
            .port("out")
            .and_then(|p| match n.ports[p].kind {
                PortKind::Value(ty) => Some(ty),
                PortKind::Flow => None,
            })
            .unwrap_or(ValueType::Bool);
        let GraphNodeKind::Expr(kind) = &n.kind else {
            unreachable!("only expression nodes are registered as such")
        };

        match kind {
            ExprKind::ReadField { component, field } => {
                let offset = self.field_offset(&at, component, field, out);
                let component = self.component_index(component).unwrap_or(0);
                ExprNode::ReadField {
                    component,
                    offset,
                    ty: out,
                }
            }
            ExprKind::LookupField {
                lookup,
                component,
                field,
            } => ExprNode::LookupField {
                lookup: *lookup,
                offset: self.field_offset(&at, component, field, out),
                ty: out,
            },
            ExprKind::ReadVar { var } => {
                let slot = match self.variable(&at, var) {
                    Some(slot) => {
                        if slot.ty != out {
                            self.errors.push(CompileError::TypeMismatch {
                                at,
                                expected: slot.ty,
                                found: out,
                            });
                        }
                        slot
                    }
                    None => VarSlot { offset: 0, ty: out },
                };
                ExprNode::ReadVar { slot }
            }
            ExprKind::Not => {
                ExprNode::Not(self.value(path, node, "a", ValueType::Bool))
            }
            ExprKind::And | ExprKind::Or => {
                let a = self.value(path, node, "a", ValueType::Bool);
                let b = self.value(path, node, "b", ValueType::Bool);
                if *kind == ExprKind::And {
                    ExprNode::And(a, b)
                } else {
                    ExprNode::Or(a, b)
                }
            }
            ExprKind::Compare(op, ty) => ExprNode::Compare {
                op: *op,
                ty: *ty,
                lhs: self.value(path, node, "a", *ty),
                rhs: self.value(path, node, "b", *ty),
            },
            ExprKind::Arith(op, ty) => {
                if *ty == ValueType::Bool {
                    self.errors.push(CompileError::TypeMismatch {
                        at,
                        expected: ValueType::Int,
                        found: ValueType::Bool,
                    });
                }
                ExprNode::Arith {
                    op: *op,
                    ty: *ty,
                    lhs: self.value(path, node, "a", *ty),
                    rhs: self.value(path, node, "b", *ty),
                }
            }
        }
    }

    fn field_offset(
        &mut self,
        at: &Location,
        component: &str,
        field: &str,
        ty: ValueType,
    ) -> u16 {
        let Some(layout) = self.catalog.get(component) else {
            self.errors.push(CompileError::UnknownComponent {
                at: at.clone(),
                component: component.to_owned(),
            });
            return 0;
        };
        let Some(f) = layout.field(field) else {
            self.errors.push(CompileError::UnknownField {
                at: at.clone(),
                component: component.to_owned(),
                field: field.to_owned(),
            });
            return 0;
        };
        if f.ty != ty {
            self.errors.push(CompileError::TypeMismatch {
                at: at.clone(),
                expected: f.ty,
                found: ty,
            });
        }
        f.offset
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{CompareOp, GraphBuilder};

    fn setup() -> (ComponentCatalog, BlackboardLayout) {
        let mut catalog = ComponentCatalog::new();
        catalog.define("Mover", &[
            ("active", ValueType::Bool),
            ("speed", ValueType::Float),
        ]);
        catalog.define("Health", &[("hp", ValueType::Int)]);
        let mut blackboard = BlackboardLayout::new();
        blackboard.declare("alert", ValueType::Bool);
        blackboard.declare("count", ValueType::Int);
        (catalog, blackboard)
    }

    fn compile(graph: &Graph) -> Compilation {
        let (catalog, blackboard) = setup();
        Compiler::new(&catalog, &blackboard).compile(graph)
    }

    #[test]
    fn test_nodes_numbered_in_discovery_order() {
        let mut b = GraphBuilder::new("main");
        let fail = b.fail();
        let root = b.root();
        let seq = b.sequence(2);
        let write = b.write_var("count", ValueType::Int);
        b.connect((root, "child"), (seq, "in")).expect("link");
        b.connect((seq, "0"), (write, "in")).expect("link");
        b.connect((seq, "1"), (fail, "in")).expect("link");
        b.set_inline(write, "value", Constant::Int(3)).expect("inline");

        let compilation = compile(&b.build());
        assert!(compilation.is_ok(), "{:?}", compilation.errors);
        assert!(compilation.warnings.is_empty());
        let program = compilation.into_program().expect("program");

        assert_eq!(program.node(NodeId::ROOT), &Node::Root {
            child: NodeId(2)
        });
        assert_eq!(program.node(NodeId(2)), &Node::Sequence {
            children: vec![NodeId(3), NodeId(4)].into()
        });
        assert_eq!(program.node(NodeId(4)), &Node::Fail);
        assert_eq!(program.expressions().constants, 3i32.to_le_bytes());
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn test_shared_node_registered_once_per_path() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let seq = b.sequence(2);
        let fail = b.fail();
        b.connect((root, "child"), (seq, "in")).expect("link");
        b.connect((seq, "0"), (fail, "in")).expect("link");
        b.connect((seq, "1"), (fail, "in")).expect("link");

        let program = compile(&b.build()).into_program().expect("program");
        assert_eq!(program.len(), 4);
        assert_eq!(program.node(NodeId(2)), &Node::Sequence {
            children: vec![NodeId(3), NodeId(3)].into()
        });
    }

    fn counter_graph() -> Arc<Graph> {
        let mut b = GraphBuilder::new("bump");
        let input = b.subgraph_input(&[
            ("go", PortKind::Flow),
            ("amount", PortKind::Value(ValueType::Int)),
        ]);
        let output = b.subgraph_output(&[
            ("done", PortKind::Flow),
            ("big", PortKind::Value(ValueType::Bool)),
        ]);
        let seq = b.sequence(2);
        let write = b.write_var("count", ValueType::Int);
        let cmp = b.compare(CompareOp::Gt, ValueType::Int);
        b.connect((input, "go"), (seq, "in")).expect("link");
        b.connect((seq, "0"), (write, "in")).expect("link");
        b.connect((seq, "1"), (output, "done")).expect("link");
        b.connect((input, "amount"), (write, "value")).expect("link");
        b.connect((input, "amount"), (cmp, "a")).expect("link");
        b.set_inline(cmp, "b", Constant::Int(10)).expect("inline");
        b.connect((cmp, "out"), (output, "big")).expect("link");
        b.build()
    }

    #[test]
    fn test_subgraph_instances_are_distinct() {
        let bump = counter_graph();
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let seq = b.sequence(2);
        let first = b.subgraph(&bump);
        let second = b.subgraph(&bump);
        let alert = b.write_var("alert", ValueType::Bool);
        b.connect((root, "child"), (seq, "in")).expect("link");
        b.connect((seq, "0"), (first, "go")).expect("link");
        b.connect((seq, "1"), (second, "go")).expect("link");
        b.connect((second, "done"), (alert, "in")).expect("link");
        b.connect((second, "big"), (alert, "value")).expect("link");
        b.set_inline(first, "amount", Constant::Int(1)).expect("inline");
        b.set_inline(second, "amount", Constant::Int(20)).expect("inline");

        let compilation = compile(&b.build());
        assert!(compilation.is_ok(), "{:?}", compilation.errors);
        let program = compilation.program;

        // root, seq, then per instance: inner seq, write, and the alert
        // after the second one
        let kinds: Vec<_> = program.nodes().iter().map(Node::kind).collect();
        assert_eq!(kinds.len(), 8);
        let writes: Vec<NodeId> = (0..program.len())
            .map(|i| NodeId(i as u16))
            .filter(|&id| {
                matches!(program.node(id), Node::WriteVar { slot, .. }
                    if slot.ty == ValueType::Int)
            })
            .collect();
        assert_eq!(writes.len(), 2);
        assert_ne!(
            program.debug_id(writes[0]),
            program.debug_id(writes[1])
        );
        assert_eq!(program.subgraph_path(writes[0]).len(), 1);
        assert_ne!(
            program.subgraph_path(writes[0]),
            program.subgraph_path(writes[1])
        );
        assert_eq!(program.subgraph_path(NodeId(2)), &[] as &[u64]);

        let Node::Sequence { children } = program.node(NodeId(2)) else {
            panic!("expected sequence");
        };
        let Node::Sequence { children: inner } = program.node(children[1])
        else {
            panic!("expected inner sequence");
        };
        assert!(matches!(
            program.node(inner[1]),
            Node::WriteVar { slot, .. } if slot.ty == ValueType::Bool
        ));
    }

    #[test]
    fn test_constants_deduplicated_and_aligned() {
        let mut pool = ConstantPool::default();
        let a = pool.intern(Constant::Bool(true));
        let b = pool.intern(Constant::Int(7));
        let c = pool.intern(Constant::Bool(true));
        let d = pool.intern(Constant::Float(0.5));
        assert_eq!(a, c);
        assert_eq!(b, ExprRef::Constant {
            offset: 4,
            length: 4
        });
        assert_eq!(d, ExprRef::Constant {
            offset: 8,
            length: 4
        });
        assert_eq!(pool.bytes.len(), 12);
    }

    #[test]
    fn test_errors_collected() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        b.root();
        let seq = b.sequence(3);
        let wait = b.wait_until();
        let par = b.parallel();
        let var = b.write_var("missing", ValueType::Int);
        let a = b.fail();
        let c = b.fail();
        b.connect((root, "child"), (seq, "in")).expect("link");
        b.connect((seq, "0"), (wait, "in")).expect("link");
        b.connect((seq, "1"), (par, "in")).expect("link");
        b.connect((seq, "2"), (var, "in")).expect("link");
        b.connect((par, "main"), (a, "in")).expect("link");
        b.connect((par, "main"), (c, "in")).expect("link");
        b.set_inline(var, "value", Constant::Int(0)).expect("inline");

        let compilation = compile(&b.build());
        let errors = compilation.errors;
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, CompileError::DuplicateRoot { .. }))
        );
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::MissingInput { port, .. } if port == "condition"
        )));
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, CompileError::AmbiguousConnection { .. }))
        );
        assert!(errors.iter().any(
            |e| matches!(e, CompileError::InvalidParallelBranch { .. })
        ));
        assert!(errors.iter().any(|e| matches!(
            e,
            CompileError::UnknownVariable { name, .. } if name == "missing"
        )));
        let ambiguous = errors
            .iter()
            .filter(|e| matches!(e, CompileError::AmbiguousConnection { .. }))
            .count();
        assert_eq!(ambiguous, 1);
    }

    #[test]
    fn test_missing_root_still_yields_program() {
        let mut b = GraphBuilder::new("empty");
        b.fail();
        let compilation = compile(&b.build());
        assert_eq!(compilation.errors, vec![CompileError::MissingRoot {
            graph: "empty".to_owned()
        }]);
        assert_eq!(compilation.program.len(), 2);
        assert!(matches!(
            compilation.warnings.as_slice(),
            [CompileWarning::Unreachable { .. }]
        ));
    }

    #[test]
    fn test_unwired_subgraph_output_warns() {
        let mut inner = GraphBuilder::new("inner");
        let input = inner.subgraph_input(&[("go", PortKind::Flow)]);
        inner.subgraph_output(&[("flag", PortKind::Value(ValueType::Bool))]);
        let fail = inner.fail();
        inner.connect((input, "go"), (fail, "in")).expect("link");
        let inner = inner.build();

        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let wait = b.wait_until();
        let call = b.subgraph(&inner);
        b.connect((root, "child"), (wait, "in")).expect("link");
        b.connect((call, "flag"), (wait, "condition")).expect("link");

        let compilation = compile(&b.build());
        assert!(compilation.is_ok(), "{:?}", compilation.errors);
        assert!(compilation.warnings.iter().any(|w| matches!(
            w,
            CompileWarning::UnwiredSubgraphOutput { port, .. } if port == "flag"
        )));
        assert!(
            compilation
                .warnings
                .iter()
                .any(|w| matches!(w, CompileWarning::Unreachable { at }
                    if at.graph == "inner"))
        );
        assert_eq!(compilation.program.node(NodeId(2)), &Node::Wait {
            until: WaitUntil::Condition(ExprRef::Constant {
                offset: 0,
                length: 1
            })
        });
    }

    #[test]
    fn test_field_access_collects_sorted_types() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let write = b.write_field("Mover", &[("speed", ValueType::Float)]);
        let hp = b.read_field("Health", "hp", ValueType::Int);
        let cmp = b.compare(CompareOp::Lt, ValueType::Int);
        let opt = b.optional();
        b.connect((root, "child"), (opt, "in")).expect("link");
        b.connect((opt, "child"), (write, "in")).expect("link");
        b.connect((hp, "out"), (cmp, "a")).expect("link");
        b.set_inline(cmp, "b", Constant::Int(5)).expect("inline");
        b.connect((cmp, "out"), (opt, "guard")).expect("link");
        b.set_inline(write, "speed", Constant::Float(2.5)).expect("inline");

        let program = compile(&b.build()).into_program().expect("program");
        let names: Vec<&str> =
            program.types().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Health", "Mover"]);
        assert!(matches!(program.node(NodeId(3)), Node::WriteField {
            component: 1,
            ..
        }));
        assert_eq!(program.expressions().nodes[0], ExprNode::ReadField {
            component: 0,
            offset: 0,
            ty: ValueType::Int,
        });
    }

    #[test]
    fn test_expression_cycle_reported() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let wait = b.wait_until();
        let x = b.and();
        let y = b.not();
        b.connect((root, "child"), (wait, "in")).expect("link");
        b.connect((x, "out"), (wait, "condition")).expect("link");
        b.connect((y, "out"), (x, "a")).expect("link");
        b.connect((x, "out"), (y, "a")).expect("link");
        b.set_inline(x, "b", Constant::Bool(true)).expect("inline");

        let compilation = compile(&b.build());
        assert!(
            compilation
                .errors
                .iter()
                .any(|e| matches!(e, CompileError::ExpressionCycle { .. }))
        );
    }

    #[test]
    fn test_lookup_types_recorded_per_index() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let wait = b.wait_until();
        let hp = b.lookup_field(2, "Health", "hp", ValueType::Int);
        let cmp = b.compare(CompareOp::Gt, ValueType::Int);
        b.connect((root, "child"), (wait, "in")).expect("link");
        b.connect((hp, "out"), (cmp, "a")).expect("link");
        b.set_inline(cmp, "b", Constant::Int(0)).expect("inline");
        b.connect((cmp, "out"), (wait, "condition")).expect("link");

        let program = compile(&b.build()).into_program().expect("program");
        assert!(program.types().is_empty());
        let lookups: Vec<Option<&str>> = program
            .lookups()
            .iter()
            .map(|l| l.as_ref().map(|t| t.name.as_str()))
            .collect();
        assert_eq!(lookups, vec![None, None, Some("Health")]);
        assert_eq!(program.blackboard_size(), 8);
    }

    #[test]
    fn test_lookup_read_as_two_types_reported() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let wait = b.wait_until();
        let hp = b.lookup_field(0, "Health", "hp", ValueType::Int);
        let active = b.lookup_field(0, "Mover", "active", ValueType::Bool);
        let cmp = b.compare(CompareOp::Gt, ValueType::Int);
        let and = b.and();
        b.connect((root, "child"), (wait, "in")).expect("link");
        b.connect((hp, "out"), (cmp, "a")).expect("link");
        b.set_inline(cmp, "b", Constant::Int(0)).expect("inline");
        b.connect((cmp, "out"), (and, "a")).expect("link");
        b.connect((active, "out"), (and, "b")).expect("link");
        b.connect((and, "out"), (wait, "condition")).expect("link");

        let compilation = compile(&b.build());
        assert!(compilation.errors.iter().any(|e| matches!(
            e,
            CompileError::LookupConflict { lookup: 0, .. }
        )));
    }

    #[test]
    fn test_oversized_sequence_rejected() {
        let mut b = GraphBuilder::new("main");
        let root = b.root();
        let seq = b.sequence(MAX_INDEX + 1);
        b.connect((root, "child"), (seq, "in")).expect("link");
        let graph = b.build();

        let compilation = compile(&graph);
        assert_eq!(compilation.errors, vec![CompileError::TooManyChildren {
            at: location(&graph, seq),
            count: MAX_INDEX + 1,
            max: MAX_INDEX,
        }]);
    }
}
