//! Pretty-printing for the graph, used by the dump log.

use std::fmt;

use super::{Block, Graph, NodeKind, Terminator, ValueRef};

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Slot(s) => write!(f, "{}", s),
            ValueRef::Node(n) => write!(f, "n{}", n.0),
            ValueRef::Phi(p) => write!(f, "p{}", p.0),
            ValueRef::Undef => write!(f, "undef"),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph @{} (slots: {}, params: {}) {{",
            self.symbol, self.num_slots, self.num_params
        )?;
        for block in &self.blocks {
            self.fmt_block(f, block)?;
        }
        writeln!(f, "}}")
    }
}

impl Graph {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: &Block) -> fmt::Result {
        writeln!(f, "  bb{}:", block.id.0)?;
        if !block.predecessors.is_empty() {
            write!(f, "    ; preds:")?;
            for pred in &block.predecessors {
                write!(f, " bb{}", pred.0)?;
            }
            writeln!(f)?;
        }
        if let Some(idom) = block.idom {
            writeln!(f, "    ; idom: bb{}, loop depth: {}", idom.0, block.loop_depth)?;
        }

        for &phi_id in &block.phis {
            let phi = self.phi(phi_id);
            write!(f, "    p{} = phi {} [", phi.id.0, phi.slot)?;
            for (i, input) in phi.inputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", input)?;
            }
            writeln!(f, "]")?;
        }

        for &node_id in &block.nodes {
            let node = self.node(node_id);
            write!(f, "    n{} = ", node.id.0)?;
            match node.kind {
                NodeKind::Param(i) => write!(f, "param {}", i)?,
                NodeKind::ConstI32(v) => write!(f, "const.i32 {}", v)?,
                NodeKind::Unary(op) => write!(f, "unary.{:?}", op)?,
                NodeKind::Binary(op) => write!(f, "binary.{:?}", op)?,
                NodeKind::Move => write!(f, "move")?,
                NodeKind::NewRef(t) => write!(f, "new.ref @{}", t)?,
            }
            for input in &node.inputs {
                write!(f, " {}", input)?;
            }
            if let Some(dest) = node.dest {
                write!(f, "  ; {}", dest)?;
            }
            writeln!(f)?;
        }

        match &block.terminator {
            Terminator::Goto(b) => writeln!(f, "    goto bb{}", b.0),
            Terminator::If { cond, lhs, rhs, then_block, else_block } => writeln!(
                f,
                "    if.{:?} {}, {} -> bb{}, bb{}",
                cond, lhs, rhs, then_block.0, else_block.0
            ),
            Terminator::Return(Some(v)) => writeln!(f, "    return {}", v),
            Terminator::Return(None) => writeln!(f, "    return"),
            Terminator::Throw(v) => writeln!(f, "    throw {}", v),
            Terminator::None => writeln!(f, "    <no terminator>"),
        }
    }
}
