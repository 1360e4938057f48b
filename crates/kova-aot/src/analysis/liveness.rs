//! Liveness analysis over the SSA graph.
//!
//! Blocks are linearized in reverse postorder and every phi, node and
//! terminator gets a position in that order. A backward dataflow
//! fixpoint computes live-in sets, with phi inputs treated as uses on
//! the incoming edge rather than inside the phi's own block. Values
//! live across a loop header are extended to the end of the loop.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::dominance::reverse_postorder;
use crate::analysis::loops::NaturalLoop;
use crate::graph::{BlockId, Graph, ValueRef};
use kova_bytecode::Slot;

/// The live range of one SSA value in linear-position space.
#[derive(Debug, Clone)]
pub struct LiveInterval {
    pub value: ValueRef,
    /// Original bytecode slot, when the value still names one.
    pub slot: Option<Slot>,
    /// Whether the value holds a heap reference.
    pub is_ref: bool,
    pub start: usize,
    pub end: usize,
    /// Use positions in ascending order.
    pub uses: Vec<usize>,
}

impl LiveInterval {
    /// First use at or after `pos`.
    pub fn next_use_after(&self, pos: usize) -> Option<usize> {
        self.uses.iter().copied().find(|&u| u >= pos)
    }

    pub fn covers(&self, pos: usize) -> bool {
        self.start <= pos && pos <= self.end
    }
}

/// Result of liveness analysis.
pub struct Liveness {
    /// Blocks in linearization order.
    pub linear_order: Vec<BlockId>,
    /// Intervals sorted by ascending start position.
    pub intervals: Vec<LiveInterval>,
    /// (first position, terminator position) per block.
    pub block_range: FxHashMap<BlockId, (usize, usize)>,
    /// Values live on entry to each block.
    pub live_in: FxHashMap<BlockId, FxHashSet<ValueRef>>,
}

impl Liveness {
    pub fn analyze(graph: &Graph, loops: &[NaturalLoop]) -> Liveness {
        let linear_order = reverse_postorder(graph);

        // Assign positions: phis, then nodes, then the terminator.
        let mut def_pos: FxHashMap<ValueRef, usize> = FxHashMap::default();
        let mut block_range: FxHashMap<BlockId, (usize, usize)> = FxHashMap::default();
        let mut pos = 0usize;
        for &id in &linear_order {
            let from = pos;
            let block = graph.block(id);
            for &phi in &block.phis {
                def_pos.insert(ValueRef::Phi(phi), pos);
                pos += 1;
            }
            for &node in &block.nodes {
                def_pos.insert(ValueRef::Node(node), pos);
                pos += 1;
            }
            block_range.insert(id, (from, pos));
            pos += 1;
        }

        // Collect use positions. A phi input is used at the terminator
        // position of the predecessor that supplies it.
        let mut uses: FxHashMap<ValueRef, Vec<usize>> = FxHashMap::default();
        for &id in &linear_order {
            let block = graph.block(id);
            let term_pos = block_range[&id].1;
            for &node in &block.nodes {
                let node_pos = def_pos[&ValueRef::Node(node)];
                for input in &graph.node(node).inputs {
                    if input.is_value() {
                        uses.entry(*input).or_default().push(node_pos);
                    }
                }
            }
            for input in block.terminator.inputs() {
                if input.is_value() {
                    uses.entry(input).or_default().push(term_pos);
                }
            }
            for succ in graph.successors(id) {
                let Some(pred_index) = graph.pred_index(succ, id) else {
                    continue;
                };
                for &phi in &graph.block(succ).phis {
                    let input = graph.phi(phi).inputs[pred_index];
                    if input.is_value() {
                        uses.entry(input).or_default().push(term_pos);
                    }
                }
            }
        }

        // Backward fixpoint for live-in sets.
        let mut live_in: FxHashMap<BlockId, FxHashSet<ValueRef>> = linear_order
            .iter()
            .map(|&b| (b, FxHashSet::default()))
            .collect();
        let mut changed = true;
        while changed {
            changed = false;
            for &id in linear_order.iter().rev() {
                let block = graph.block(id);
                let mut live: FxHashSet<ValueRef> = FxHashSet::default();
                for succ in graph.successors(id) {
                    let Some(pred_index) = graph.pred_index(succ, id) else {
                        continue;
                    };
                    for value in &live_in[&succ] {
                        live.insert(*value);
                    }
                    for &phi in &graph.block(succ).phis {
                        live.remove(&ValueRef::Phi(phi));
                        let input = graph.phi(phi).inputs[pred_index];
                        if input.is_value() {
                            live.insert(input);
                        }
                    }
                }
                for input in block.terminator.inputs() {
                    if input.is_value() {
                        live.insert(input);
                    }
                }
                for &node in block.nodes.iter().rev() {
                    live.remove(&ValueRef::Node(node));
                    for input in &graph.node(node).inputs {
                        if input.is_value() {
                            live.insert(*input);
                        }
                    }
                }
                for &phi in &block.phis {
                    live.remove(&ValueRef::Phi(phi));
                }
                if live != live_in[&id] {
                    live_in.insert(id, live);
                    changed = true;
                }
            }
        }

        // Reference-ness propagates from allocation nodes through phis.
        let mut refs: FxHashSet<ValueRef> = FxHashSet::default();
        for &id in &linear_order {
            for &node in &graph.block(id).nodes {
                if graph.node(node).kind.produces_ref() {
                    refs.insert(ValueRef::Node(node));
                }
            }
        }
        let mut ref_changed = true;
        while ref_changed {
            ref_changed = false;
            for &id in &linear_order {
                for &phi in &graph.block(id).phis {
                    let value = ValueRef::Phi(phi);
                    if refs.contains(&value) {
                        continue;
                    }
                    if graph.phi(phi).inputs.iter().any(|i| refs.contains(i)) {
                        refs.insert(value);
                        ref_changed = true;
                    }
                }
            }
        }

        // Build intervals from def and last use.
        let mut intervals: Vec<LiveInterval> = def_pos
            .iter()
            .map(|(&value, &start)| {
                let mut positions = uses.remove(&value).unwrap_or_default();
                positions.sort_unstable();
                positions.dedup();
                let end = positions.last().copied().unwrap_or(start).max(start);
                let slot = match value {
                    ValueRef::Node(n) => graph.node(n).dest,
                    ValueRef::Phi(p) => Some(graph.phi(p).slot),
                    _ => None,
                };
                LiveInterval {
                    value,
                    slot,
                    is_ref: refs.contains(&value),
                    start,
                    end,
                    uses: positions,
                }
            })
            .collect();

        // Anything live into a loop header stays live through the
        // whole loop body.
        for l in loops {
            let loop_end = l
                .blocks
                .iter()
                .filter_map(|b| block_range.get(b))
                .map(|&(_, term)| term)
                .max();
            let loop_end = match loop_end {
                Some(end) => end,
                None => continue,
            };
            let header_live = match live_in.get(&l.header) {
                Some(set) => set,
                None => continue,
            };
            for interval in &mut intervals {
                if header_live.contains(&interval.value) {
                    interval.end = interval.end.max(loop_end);
                }
            }
        }

        intervals.sort_by_key(|i| (i.start, i.end));

        Liveness { linear_order, intervals, block_range, live_in }
    }

    pub fn interval_for(&self, value: ValueRef) -> Option<&LiveInterval> {
        self.intervals.iter().find(|i| i.value == value)
    }
}
