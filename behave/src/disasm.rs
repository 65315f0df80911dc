//! Human readable listing of a [`Program`].

use std::fmt;

use crate::{ExprNode, Node, NodeId, Program, WaitUntil};

/// Display adapter listing component types, the constant pool, expression
/// nodes and execution nodes with their provenance.
#[derive(Debug, Clone, Copy)]
pub struct Disassembly<'p>(pub &'p Program);

#[must_use]
pub fn dump(program: &Program) -> String {
    Disassembly(program).to_string()
}

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.0;
        let expressions = program.expressions();
        writeln!(
            f,
            "program: {} nodes, {} expressions, {} constant bytes, {} \
             blackboard bytes",
            program.len(),
            expressions.nodes.len(),
            expressions.constants.len(),
            program.blackboard_size()
        )?;

        if !program.types().is_empty() {
            writeln!(f, "types:")?;
            for (i, ty) in program.types().iter().enumerate() {
                writeln!(
                    f,
                    "  t{i} {} size={} id={:#018x}",
                    ty.name, ty.size, ty.id
                )?;
            }
        }

        if !program.lookups().is_empty() {
            writeln!(f, "lookups:")?;
            for (i, ty) in program.lookups().iter().enumerate() {
                match ty {
                    Some(ty) => {
                        writeln!(f, "  l{i} {} size={}", ty.name, ty.size)?;
                    }
                    None => writeln!(f, "  l{i} unused")?,
                }
            }
        }

        if !expressions.constants.is_empty() {
            writeln!(f, "constants:")?;
            for (row, chunk) in expressions.constants.chunks(8).enumerate() {
                write!(f, "  {:04x}:", row * 8)?;
                for byte in chunk {
                    write!(f, " {byte:02x}")?;
                }
                writeln!(f)?;
            }
        }

        if !expressions.nodes.is_empty() {
            writeln!(f, "expressions:")?;
            for (i, node) in expressions.nodes.iter().enumerate() {
                write!(f, "  e{i} = ")?;
                expr(f, node)?;
                writeln!(f)?;
            }
        }

        writeln!(f, "nodes:")?;
        for (i, node) in program.nodes().iter().enumerate() {
            let id = NodeId(i as u16);
            write!(f, "  {id} {:<11}", node.kind())?;
            payload(f, node)?;
            let path = program.subgraph_path(id);
            if program.debug_id(id) != 0 || !path.is_empty() {
                write!(f, "  ; {:032x}", program.debug_id(id))?;
                for instance in path {
                    write!(f, " <{instance:016x}>")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn expr(f: &mut fmt::Formatter<'_>, node: &ExprNode) -> fmt::Result {
    match node {
        ExprNode::ReadField {
            component,
            offset,
            ty,
        } => write!(f, "read-field t{component}+{offset} {ty}"),
        ExprNode::LookupField { lookup, offset, ty } => {
            write!(f, "lookup-field l{lookup}+{offset} {ty}")
        }
        ExprNode::ReadVar { slot } => {
            write!(f, "read-var @{} {}", slot.offset, slot.ty)
        }
        ExprNode::Not(a) => write!(f, "not {a}"),
        ExprNode::And(a, b) => write!(f, "and {a} {b}"),
        ExprNode::Or(a, b) => write!(f, "or {a} {b}"),
        ExprNode::Compare { op, ty, lhs, rhs } => {
            write!(f, "{} {ty} {lhs} {rhs}", op.name())
        }
        ExprNode::Arith { op, ty, lhs, rhs } => {
            write!(f, "{} {ty} {lhs} {rhs}", op.name())
        }
    }
}

fn payload(f: &mut fmt::Formatter<'_>, node: &Node) -> fmt::Result {
    match node {
        Node::Nop | Node::Fail => Ok(()),
        Node::Root { child } | Node::Catch { child } => write!(f, " {child}"),
        Node::Sequence { children } => {
            for child in children.iter() {
                write!(f, " {child}")?;
            }
            Ok(())
        }
        Node::Selector { branches } => {
            for branch in branches.iter() {
                write!(f, " [{} -> {}]", branch.guard, branch.child)?;
            }
            Ok(())
        }
        Node::WriteField { component, fields } => {
            write!(f, " t{component}")?;
            for field in fields.iter() {
                write!(
                    f,
                    " +{}:{} = {}",
                    field.offset, field.length, field.value
                )?;
            }
            Ok(())
        }
        Node::Wait {
            until: WaitUntil::Duration(value),
        } => write!(f, " for {value}"),
        Node::Wait {
            until: WaitUntil::Condition(value),
        } => write!(f, " until {value}"),
        Node::Optional { guard, child } => write!(f, " {guard} -> {child}"),
        Node::WriteVar { slot, value } => {
            write!(f, " @{} {} = {value}", slot.offset, slot.ty)
        }
        Node::Query { query, result } => {
            write!(f, " q{query} -> @{} {}", result.offset, result.ty)
        }
        Node::Parallel { main, thread } => {
            write!(f, " main={main} thread={thread}")
        }
        Node::ThreadRoot { child, looping } => {
            write!(f, " {child}")?;
            if *looping {
                write!(f, " loop")?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Script;

    #[test]
    fn test_dump_lists_every_section() {
        let script = Script::parse(
            "
            component Health hp:int
            var low bool
            graph main
              node r   root
              node opt optional
              node hp  read-field Health hp
              node lt  lt int
              node w   write-var low
              link r.child opt
              link opt.child w
              link hp.out lt.a
              link lt.out opt.guard
              set lt.b 25
              set w.value true
            end
            ",
        )
        .expect("parse");
        let program = script.compile().into_program().expect("compile");
        let text = dump(&program);

        assert!(text.starts_with("program: 4 nodes, 2 expressions"));
        assert!(text.contains("t0 Health size=4"));
        assert!(text.contains("e0 = read-field t0+0 int"));
        assert!(text.contains("e1 = lt int e0.0 c[4..8]"));
        assert!(text.contains("#0001 Root"));
        assert!(text.contains("#0002 Optional    e1.0 -> #0003"));
        assert!(text.contains("@0 bool = c[0..1]"));
        assert!(text.contains("constant bytes, 1 blackboard bytes"));
        assert_eq!(text.lines().filter(|l| l.contains(" ; ")).count(), 3);
    }
}
