//! A line-oriented text format for behavior graphs.
//!
//! ```text
//! component Mover active:bool speed:float
//! var alert bool
//!
//! graph main
//!   node r    root
//!   node wait wait-for
//!   link r.child wait
//!   set  wait.duration 1.5
//! end
//! ```
//!
//! Directives are `component`, `var`, `graph` ... `end`, and inside a graph
//! `node <label> <kind> [args]`, `link <node>.<port> <node>[.<port>]` and
//! `set <node>.<port> <literal>`. A link target without a port runs the
//! node's `in` port. `#` starts a comment. A graph may only call graphs
//! defined above it.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    ArithOp, BlackboardLayout, CompareOp, Compilation, Compiler,
    ComponentCatalog, Constant, Graph, GraphBuilder, PortKind, ValueType,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    pub line: usize,
    pub message: String,
}

/// Everything a script declares.
#[derive(Debug)]
pub struct Script {
    pub catalog: ComponentCatalog,
    pub blackboard: BlackboardLayout,
    graphs: Vec<Arc<Graph>>,
}

impl Script {
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let mut parser = ScriptParser::default();
        for (index, line) in source.lines().enumerate() {
            parser.line = index + 1;
            parser.parse_line(line)?;
        }
        parser.finish()
    }

    #[must_use]
    pub fn graphs(&self) -> &[Arc<Graph>] {
        &self.graphs
    }

    #[must_use]
    pub fn graph(&self, name: &str) -> Option<&Arc<Graph>> {
        self.graphs.iter().find(|g| g.name() == name)
    }

    /// The graph named `main`, or the last graph defined.
    #[must_use]
    pub fn entry(&self) -> &Arc<Graph> {
        self.graph("main")
            .unwrap_or_else(|| &self.graphs[self.graphs.len() - 1])
    }

    pub fn compile(&self) -> Compilation {
        Compiler::new(&self.catalog, &self.blackboard).compile(self.entry())
    }
}

/// Whitespace separated tokens of one line.
struct Cursor<'s> {
    code: &'s str,
    offset: usize,
}

impl<'s> Cursor<'s> {
    fn new(code: &'s str) -> Self {
        Self { code, offset: 0 }
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.offset == self.code.len()
    }

    #[inline]
    fn is_at_whitespace(&self) -> bool {
        self.code.as_bytes()[self.offset].is_ascii_whitespace()
    }

    fn skip_whitespace(&mut self) {
        while !self.is_done() && self.is_at_whitespace() {
            self.offset += 1;
        }
    }

    fn next_token(&mut self) -> Option<&'s str> {
        self.skip_whitespace();
        if self.is_done() {
            return None;
        }
        let start = self.offset;
        while !self.is_done() && !self.is_at_whitespace() {
            self.offset += 1;
        }
        Some(&self.code[start..self.offset])
    }
}

#[derive(Debug)]
struct OpenGraph {
    builder: GraphBuilder,
    name: String,
    labels: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct ScriptParser {
    line: usize,
    catalog: ComponentCatalog,
    blackboard: BlackboardLayout,
    graphs: Vec<Arc<Graph>>,
    open: Option<OpenGraph>,
}

impl ScriptParser {
    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError {
            line: self.line,
            message: message.into(),
        }
    }

    fn expect<'s>(
        &self,
        cursor: &mut Cursor<'s>,
        what: &str,
    ) -> Result<&'s str, ScriptError> {
        cursor
            .next_token()
            .ok_or_else(|| self.error(format!("expected {what}")))
    }

    fn number<T: FromStr>(
        &self,
        cursor: &mut Cursor<'_>,
        what: &str,
    ) -> Result<T, ScriptError> {
        let token = self.expect(cursor, what)?;
        token
            .parse()
            .map_err(|_| self.error(format!("`{token}` is not a valid {what}")))
    }

    fn value_type(&self, token: &str) -> Result<ValueType, ScriptError> {
        ValueType::parse(token)
            .ok_or_else(|| self.error(format!("unknown type `{token}`")))
    }

    fn port_kind(&self, token: &str) -> Result<PortKind, ScriptError> {
        if token == "flow" {
            return Ok(PortKind::Flow);
        }
        self.value_type(token).map(PortKind::Value)
    }

    /// Splits `name:type`.
    fn typed<'s>(
        &self,
        token: &'s str,
    ) -> Result<(&'s str, &'s str), ScriptError> {
        token.split_once(':').ok_or_else(|| {
            self.error(format!("expected name:type, got `{token}`"))
        })
    }

    fn parse_line(&mut self, line: &str) -> Result<(), ScriptError> {
        let code = line.split('#').next().unwrap_or_default();
        let mut cursor = Cursor::new(code);
        let Some(directive) = cursor.next_token() else {
            return Ok(());
        };

        match directive {
            "component" => self.component(&mut cursor)?,
            "var" => {
                let name = self.expect(&mut cursor, "variable name")?;
                let ty = self.expect(&mut cursor, "variable type")?;
                let ty = self.value_type(ty)?;
                if self.blackboard.get(name).is_some() {
                    let message = format!("variable `{name}` redeclared");
                    return Err(self.error(message));
                }
                self.blackboard.declare(name, ty);
            }
            "graph" => {
                let name = self.expect(&mut cursor, "graph name")?;
                if let Some(open) = &self.open {
                    return Err(self.error(format!(
                        "graph `{}` is still open",
                        open.name
                    )));
                }
                if self.graphs.iter().any(|g| g.name() == name) {
                    return Err(self.error(format!("graph `{name}` redefined")));
                }
                self.open = Some(OpenGraph {
                    builder: GraphBuilder::new(name),
                    name: name.to_owned(),
                    labels: HashMap::new(),
                });
            }
            "end" => {
                let open = self
                    .open
                    .take()
                    .ok_or_else(|| self.error("`end` without `graph`"))?;
                self.graphs.push(open.builder.build());
            }
            "node" => self.node(&mut cursor)?,
            "link" => self.link(&mut cursor)?,
            "set" => self.set(&mut cursor)?,
            other => {
                return Err(self.error(format!("unknown directive `{other}`")));
            }
        }

        match cursor.next_token() {
            Some(extra) => Err(self.error(format!("unexpected `{extra}`"))),
            None => Ok(()),
        }
    }

    fn component(
        &mut self,
        cursor: &mut Cursor<'_>,
    ) -> Result<(), ScriptError> {
        let name = self.expect(cursor, "component name")?;
        let mut fields = Vec::new();
        while let Some(token) = cursor.next_token() {
            let (field, ty) = self.typed(token)?;
            fields.push((field, self.value_type(ty)?));
        }
        if self.catalog.get(name).is_some() {
            return Err(self.error(format!("component `{name}` redefined")));
        }
        self.catalog.define(name, &fields);
        Ok(())
    }

    fn field_type(
        &self,
        component: &str,
        field: &str,
    ) -> Result<ValueType, ScriptError> {
        let layout = self.catalog.get(component).ok_or_else(|| {
            self.error(format!("unknown component `{component}`"))
        })?;
        layout.field(field).map(|f| f.ty).ok_or_else(|| {
            self.error(format!("`{component}` has no field `{field}`"))
        })
    }

    fn var_type(&self, name: &str) -> Result<ValueType, ScriptError> {
        self.blackboard
            .get(name)
            .map(|slot| slot.ty)
            .ok_or_else(|| self.error(format!("unknown variable `{name}`")))
    }

    fn node(&mut self, cursor: &mut Cursor<'_>) -> Result<(), ScriptError> {
        let label = self.expect(cursor, "node label")?;
        let kind = self.expect(cursor, "node kind")?;
        let Some(open) = &self.open else {
            return Err(self.error("`node` outside of a graph"));
        };
        if open.labels.contains_key(label) {
            return Err(self.error(format!("node `{label}` redefined")));
        }

        let index = match kind {
            "root" => self.builder().root(),
            "sequence" => {
                let n = self.number(cursor, "child count")?;
                self.builder().sequence(n)
            }
            "selector" => {
                let n = self.number(cursor, "branch count")?;
                self.builder().selector(n)
            }
            "write-field" => {
                let component = self.expect(cursor, "component")?;
                let mut fields = Vec::new();
                while let Some(field) = cursor.next_token() {
                    fields.push((field, self.field_type(component, field)?));
                }
                self.builder().write_field(component, &fields)
            }
            "wait-for" => self.builder().wait_for(),
            "wait-until" => self.builder().wait_until(),
            "fail" => self.builder().fail(),
            "optional" => self.builder().optional(),
            "catch" => self.builder().catch(),
            "write-var" => {
                let var = self.expect(cursor, "variable")?;
                let ty = self.var_type(var)?;
                self.builder().write_var(var, ty)
            }
            "query" => {
                let query = self.number(cursor, "query id")?;
                let var = self.expect(cursor, "variable")?;
                self.var_type(var)?;
                self.builder().query(query, var)
            }
            "parallel" => self.builder().parallel(),
            "thread-root" => {
                let looping = match cursor.next_token() {
                    None => false,
                    Some("loop") => true,
                    Some(other) => {
                        return Err(self.error(format!("unexpected `{other}`")));
                    }
                };
                self.builder().thread_root(looping)
            }
            "call" => {
                let name = self.expect(cursor, "graph name")?;
                let graph = self
                    .graphs
                    .iter()
                    .find(|g| g.name() == name)
                    .cloned()
                    .ok_or_else(|| {
                        self.error(format!("graph `{name}` is not defined yet"))
                    })?;
                self.builder().subgraph(&graph)
            }
            "input" | "output" => {
                let mut ports = Vec::new();
                while let Some(token) = cursor.next_token() {
                    let (name, kind) = self.typed(token)?;
                    ports.push((name, self.port_kind(kind)?));
                }
                if kind == "input" {
                    self.builder().subgraph_input(&ports)
                } else {
                    self.builder().subgraph_output(&ports)
                }
            }
            "read-field" => {
                let component = self.expect(cursor, "component")?;
                let field = self.expect(cursor, "field")?;
                let ty = self.field_type(component, field)?;
                self.builder().read_field(component, field, ty)
            }
            "lookup-field" => {
                let lookup = self.number(cursor, "lookup index")?;
                let component = self.expect(cursor, "component")?;
                let field = self.expect(cursor, "field")?;
                let ty = self.field_type(component, field)?;
                self.builder().lookup_field(lookup, component, field, ty)
            }
            "read-var" => {
                let var = self.expect(cursor, "variable")?;
                let ty = self.var_type(var)?;
                self.builder().read_var(var, ty)
            }
            "not" => self.builder().not(),
            "and" => self.builder().and(),
            "or" => self.builder().or(),
            "lt" | "le" | "gt" | "ge" | "eq" | "ne" => {
                let op = match kind {
                    "lt" => CompareOp::Lt,
                    "le" => CompareOp::Le,
                    "gt" => CompareOp::Gt,
                    "ge" => CompareOp::Ge,
                    "eq" => CompareOp::Eq,
                    _ => CompareOp::Ne,
                };
                let ty = self.expect(cursor, "operand type")?;
                let ty = self.value_type(ty)?;
                self.builder().compare(op, ty)
            }
            "add" | "sub" | "mul" => {
                let op = match kind {
                    "add" => ArithOp::Add,
                    "sub" => ArithOp::Sub,
                    _ => ArithOp::Mul,
                };
                let ty = self.expect(cursor, "operand type")?;
                let ty = self.value_type(ty)?;
                self.builder().arith(op, ty)
            }
            other => {
                return Err(self.error(format!("unknown node kind `{other}`")));
            }
        };

        let open = self.open_mut();
        open.builder.set_label(index, label);
        open.labels.insert(label.to_owned(), index);
        Ok(())
    }

    /// Only called after checking that a graph is open.
    fn open_mut(&mut self) -> &mut OpenGraph {
        self.open.as_mut().expect("no open graph")
    }

    fn builder(&mut self) -> &mut GraphBuilder {
        &mut self.open_mut().builder
    }

    fn endpoint<'s>(
        &self,
        token: &'s str,
        default: Option<&'s str>,
    ) -> Result<(usize, &'s str), ScriptError> {
        let open = self
            .open
            .as_ref()
            .ok_or_else(|| self.error("link outside of a graph"))?;
        let (label, port) = match (token.split_once('.'), default) {
            (Some((label, port)), _) => (label, port),
            (None, Some(port)) => (token, port),
            (None, None) => {
                let message = format!("expected node.port, got `{token}`");
                return Err(self.error(message));
            }
        };
        let node = open
            .labels
            .get(label)
            .copied()
            .ok_or_else(|| self.error(format!("unknown node `{label}`")))?;
        Ok((node, port))
    }

    fn link(&mut self, cursor: &mut Cursor<'_>) -> Result<(), ScriptError> {
        let from = self.expect(cursor, "source port")?;
        let to = self.expect(cursor, "target")?;
        let from = self.endpoint(from, None)?;
        let to = self.endpoint(to, Some("in"))?;
        let result = self.builder().connect(from, to);
        result.map_err(|e| self.error(e.to_string()))
    }

    fn set(&mut self, cursor: &mut Cursor<'_>) -> Result<(), ScriptError> {
        let target = self.expect(cursor, "node.port")?;
        let literal = self.expect(cursor, "value")?;
        let (node, port) = self.endpoint(target, None)?;

        let expected = {
            let n = self.builder().node(node);
            n.port(port).map(|p| n.ports[p].kind)
        };
        let float = Some(PortKind::Value(ValueType::Float));
        let value = match (Constant::parse(literal), expected) {
            (Some(Constant::Int(v)), kind) if kind == float => {
                Constant::Float(v as f32)
            }
            (Some(value), _) => value,
            (None, _) => {
                return Err(self.error(format!("`{literal}` is not a literal")));
            }
        };
        let result = self.builder().set_inline(node, port, value);
        result.map_err(|e| self.error(e.to_string()))
    }

    fn finish(self) -> Result<Script, ScriptError> {
        if let Some(open) = &self.open {
            let message = format!("graph `{}` is missing `end`", open.name);
            return Err(self.error(message));
        }
        if self.graphs.is_empty() {
            return Err(self.error("script defines no graph"));
        }
        Ok(Script {
            catalog: self.catalog,
            blackboard: self.blackboard,
            graphs: self.graphs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Node, NodeId, WaitUntil};

    const PATROL: &str = "
        # movement state
        component Mover active:bool speed:float
        var alert bool
        var seen int

        graph look
          node in  input go:flow
          node out output done:flow
          node q   query 4 seen
          link in.go q
        end

        graph main
          node r    root
          node s    sequence 3
          node go   write-field Mover active speed
          node w    wait-for
          node scan call look
          link r.child s
          link s.0 go
          link s.1 w
          link s.2 scan.go
          set go.active true
          set go.speed 2
          set w.duration 0.5
        end
    ";

    #[test]
    fn test_parse_and_compile() {
        let script = Script::parse(PATROL).expect("parse");
        assert_eq!(script.graphs().len(), 2);
        assert_eq!(script.entry().name(), "main");
        assert!(script.catalog.get("Mover").is_some());

        let compilation = script.compile();
        assert!(compilation.is_ok(), "{:?}", compilation.errors);
        let program = compilation.program;
        assert_eq!(program.types().len(), 1);
        let Node::Sequence { children } = program.node(NodeId(2)) else {
            panic!("expected sequence");
        };
        assert_eq!(children.len(), 3);
        assert!(matches!(program.node(children[1]), Node::Wait {
            until: WaitUntil::Duration(_)
        }));
        assert!(matches!(program.node(children[2]), Node::Query {
            query: 4,
            ..
        }));
        assert_eq!(program.subgraph_path(children[2]).len(), 1);
    }

    #[test]
    fn test_int_literal_widens_to_float() {
        let script = Script::parse(PATROL).expect("parse");
        let main = script.entry();
        let go = main.find("go").expect("node");
        let speed = main.node(go).port("speed").expect("port");
        assert_eq!(
            main.node(go).ports[speed].inline,
            Some(Constant::Float(2.0))
        );
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = Script::parse("var x int\nfrobnicate\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("frobnicate"));

        let err = Script::parse("graph a\nnode c call b\nend\n").unwrap_err();
        assert_eq!(err.line, 2);

        let err = Script::parse("graph a\nnode r root\n").unwrap_err();
        assert!(err.message.contains("missing `end`"));

        let source = "graph a\nnode r root\nnode r fail\nend";
        let err = Script::parse(source).unwrap_err();
        assert_eq!(err.line, 3);

        let source = "graph a\nnode w wait-until\nset w.condition 3\nend";
        let err = Script::parse(source).unwrap_err();
        assert_eq!(err.line, 3);

        let err = Script::parse("").unwrap_err();
        assert!(err.message.contains("no graph"));
    }

    #[test]
    fn test_link_defaults_to_in_port() {
        let script = Script::parse(
            "graph g\nnode r root\nnode f fail\nlink r.child f\nend",
        )
        .expect("parse");
        let graph = script.entry();
        assert_eq!(graph.links().len(), 1);
        let link = graph.links()[0];
        assert_eq!(graph.node(link.to.node).ports[link.to.port].name, "in");
    }
}
