//! Phi cleanup passes run after SSA construction.

use rustc_hash::FxHashSet;

use crate::graph::{Graph, PhiId, Terminator, ValueRef};

/// A rewriting pass over the graph.
pub trait GraphPass {
    fn name(&self) -> &'static str;
    /// Runs one iteration. Returns whether the graph changed.
    fn run(&mut self, graph: &mut Graph) -> bool;
}

/// Replaces phis whose inputs all name the same value (ignoring the
/// phi itself and undefined-path inputs) with that value.
pub struct RedundantPhiElimination;

/// Removes phis with no remaining uses. Runs after redundant phi
/// elimination so substituted phis drop out as well.
pub struct DeadPhiElimination;

fn retire_phi(graph: &mut Graph, phi: PhiId) {
    let block = graph.phi(phi).block;
    graph.block_mut(block).phis.retain(|&p| p != phi);
    graph.phi_mut(phi).dead = true;
}

fn replace_uses(graph: &mut Graph, from: ValueRef, to: ValueRef) {
    for node in &mut graph.nodes {
        for input in &mut node.inputs {
            if *input == from {
                *input = to;
            }
        }
    }
    for phi in &mut graph.phis {
        for input in &mut phi.inputs {
            if *input == from {
                *input = to;
            }
        }
    }
    for block in &mut graph.blocks {
        match &mut block.terminator {
            Terminator::If { lhs, rhs, .. } => {
                if *lhs == from {
                    *lhs = to;
                }
                if *rhs == from {
                    *rhs = to;
                }
            }
            Terminator::Return(Some(v)) | Terminator::Throw(v) => {
                if *v == from {
                    *v = to;
                }
            }
            Terminator::Return(None) | Terminator::Goto(_) | Terminator::None => {}
        }
    }
}

impl GraphPass for RedundantPhiElimination {
    fn name(&self) -> &'static str {
        "redundant-phi-elimination"
    }

    fn run(&mut self, graph: &mut Graph) -> bool {
        let mut changed = false;
        for index in 0..graph.phis.len() {
            let phi = PhiId(index as u32);
            if graph.phi(phi).dead {
                continue;
            }
            let this = ValueRef::Phi(phi);
            let mut unique: Option<ValueRef> = None;
            let mut redundant = true;
            for &input in &graph.phi(phi).inputs {
                if input == this || input == ValueRef::Undef {
                    continue;
                }
                match unique {
                    None => unique = Some(input),
                    Some(u) if u == input => {}
                    Some(_) => {
                        redundant = false;
                        break;
                    }
                }
            }
            if redundant {
                let replacement = unique.unwrap_or(ValueRef::Undef);
                retire_phi(graph, phi);
                replace_uses(graph, this, replacement);
                changed = true;
            }
        }
        changed
    }
}

impl GraphPass for DeadPhiElimination {
    fn name(&self) -> &'static str {
        "dead-phi-elimination"
    }

    fn run(&mut self, graph: &mut Graph) -> bool {
        let mut used: FxHashSet<PhiId> = FxHashSet::default();
        for node in &graph.nodes {
            for input in &node.inputs {
                if let ValueRef::Phi(p) = input {
                    used.insert(*p);
                }
            }
        }
        for phi in &graph.phis {
            if phi.dead {
                continue;
            }
            for input in &phi.inputs {
                if let ValueRef::Phi(p) = input {
                    if *p != phi.id {
                        used.insert(*p);
                    }
                }
            }
        }
        for block in &graph.blocks {
            for input in block.terminator.inputs() {
                if let ValueRef::Phi(p) = input {
                    used.insert(p);
                }
            }
        }

        let mut changed = false;
        for index in 0..graph.phis.len() {
            let phi = PhiId(index as u32);
            if graph.phi(phi).dead || used.contains(&phi) {
                continue;
            }
            retire_phi(graph, phi);
            changed = true;
        }
        changed
    }
}
