//! Minimal SSA construction.
//!
//! Phis are placed with iterated dominance frontiers, one per slot per
//! merge block that needs one. Renaming walks the dominator tree with a
//! per-slot stack of current definitions. Slot copies carry no value of
//! their own, so renaming records the copied value under the
//! destination slot and drops the copy node from its block.

use rustc_hash::FxHashSet;

use kova_bytecode::Slot;

use crate::analysis::dominance::DominatorTree;
use crate::graph::{BlockId, Graph, NodeId, NodeKind, Terminator, ValueRef};

pub fn convert(graph: &mut Graph, dom: &DominatorTree) {
    place_phis(graph, dom);

    let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); graph.block_count()];
    for &block in &dom.rpo {
        if block == graph.entry {
            continue;
        }
        if let Some(idom) = dom.idom(block) {
            children[idom.0 as usize].push(block);
        }
    }

    let mut stacks: Vec<Vec<ValueRef>> = vec![Vec::new(); graph.num_slots as usize];
    rename_block(graph, &children, &mut stacks, graph.entry);
    graph.in_ssa = true;
}

fn place_phis(graph: &mut Graph, dom: &DominatorTree) {
    let frontiers = dom.frontiers(graph);

    let mut defs: Vec<FxHashSet<BlockId>> =
        vec![FxHashSet::default(); graph.num_slots as usize];
    for &block in &dom.rpo {
        let nodes = graph.block(block).nodes.clone();
        for node in nodes {
            if let Some(slot) = graph.node(node).dest {
                defs[slot.0 as usize].insert(block);
            }
        }
    }

    for slot_index in 0..graph.num_slots as usize {
        let mut worklist: Vec<BlockId> = defs[slot_index].iter().copied().collect();
        worklist.sort_by_key(|b| b.0);
        let mut placed: FxHashSet<BlockId> = FxHashSet::default();
        while let Some(block) = worklist.pop() {
            for &merge in &frontiers[block.0 as usize] {
                if placed.insert(merge) {
                    let num_preds = graph.block(merge).predecessors.len();
                    let phi = graph.add_phi(merge, Slot(slot_index as u16));
                    graph.phi_mut(phi).inputs = vec![ValueRef::Undef; num_preds];
                    if !defs[slot_index].contains(&merge) {
                        worklist.push(merge);
                    }
                }
            }
        }
    }
}

fn current(stacks: &[Vec<ValueRef>], slot: Slot) -> ValueRef {
    stacks[slot.0 as usize].last().copied().unwrap_or(ValueRef::Undef)
}

fn resolve(stacks: &[Vec<ValueRef>], value: ValueRef) -> ValueRef {
    match value {
        ValueRef::Slot(slot) => current(stacks, slot),
        other => other,
    }
}

fn rename_block(
    graph: &mut Graph,
    children: &[Vec<BlockId>],
    stacks: &mut [Vec<ValueRef>],
    block: BlockId,
) {
    // Slots pushed in this block, popped on the way back up.
    let mut pushed: Vec<Slot> = Vec::new();

    for &phi in &graph.block(block).phis.clone() {
        let slot = graph.phi(phi).slot;
        stacks[slot.0 as usize].push(ValueRef::Phi(phi));
        pushed.push(slot);
    }

    let node_ids = graph.block(block).nodes.clone();
    let mut kept: Vec<NodeId> = Vec::with_capacity(node_ids.len());
    for node in node_ids {
        let inputs: Vec<ValueRef> = graph
            .node(node)
            .inputs
            .iter()
            .map(|&i| resolve(stacks, i))
            .collect();
        graph.node_mut(node).inputs = inputs;
        let is_copy = matches!(graph.node(node).kind, NodeKind::Move);
        if is_copy {
            if let Some(dest) = graph.node(node).dest {
                let value = graph.node(node).inputs[0];
                stacks[dest.0 as usize].push(value);
                pushed.push(dest);
            }
        } else {
            if let Some(dest) = graph.node(node).dest {
                stacks[dest.0 as usize].push(ValueRef::Node(node));
                pushed.push(dest);
            }
            kept.push(node);
        }
    }
    graph.block_mut(block).nodes = kept;

    let terminator = match graph.block(block).terminator.clone() {
        Terminator::If { cond, lhs, rhs, then_block, else_block } => Terminator::If {
            cond,
            lhs: resolve(stacks, lhs),
            rhs: resolve(stacks, rhs),
            then_block,
            else_block,
        },
        Terminator::Return(Some(v)) => Terminator::Return(Some(resolve(stacks, v))),
        Terminator::Throw(v) => Terminator::Throw(resolve(stacks, v)),
        other => other,
    };
    graph.block_mut(block).terminator = terminator;

    // Supply this block's current definitions to successor phis, once
    // per matching predecessor edge.
    for succ in graph.successors(block) {
        let indices: Vec<usize> = graph
            .block(succ)
            .predecessors
            .iter()
            .enumerate()
            .filter(|&(_, &p)| p == block)
            .map(|(i, _)| i)
            .collect();
        for &phi in &graph.block(succ).phis.clone() {
            let slot = graph.phi(phi).slot;
            let value = current(stacks, slot);
            for &index in &indices {
                graph.phi_mut(phi).inputs[index] = value;
            }
        }
    }

    for &child in &children[block.0 as usize] {
        rename_block(graph, children, stacks, child);
    }

    for slot in pushed.into_iter().rev() {
        stacks[slot.0 as usize].pop();
    }
}
