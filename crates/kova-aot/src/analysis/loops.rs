//! Natural loop detection from dominator-identified back edges.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::dominance::DominatorTree;
use crate::graph::{BlockId, Graph};

/// A natural loop. One loop per header; multiple back edges into the
/// same header are merged into a single body.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: BlockId,
    pub back_edge_sources: Vec<BlockId>,
    /// All member blocks including the header, sorted by id.
    pub blocks: Vec<BlockId>,
}

impl NaturalLoop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.binary_search_by_key(&block.0, |b| b.0).is_ok()
    }
}

/// Find every natural loop in the graph and annotate the blocks with
/// header flags and nesting depth. A back edge is an edge whose target
/// dominates its source; the body is everything that reaches the back
/// edge source without passing through the header.
pub fn find_natural_loops(graph: &mut Graph, dom: &DominatorTree) -> Vec<NaturalLoop> {
    let mut bodies: FxHashMap<BlockId, FxHashSet<BlockId>> = FxHashMap::default();
    let mut sources: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();

    for &source in &dom.rpo {
        for target in graph.successors(source) {
            if !dom.is_reachable(target) || !dom.dominates(target, source) {
                continue;
            }
            let body = bodies.entry(target).or_default();
            body.insert(target);
            sources.entry(target).or_default().push(source);
            let mut stack = vec![source];
            while let Some(block) = stack.pop() {
                if body.insert(block) || block == source {
                    if block == target {
                        continue;
                    }
                    for &pred in &graph.block(block).predecessors {
                        if dom.is_reachable(pred) && !body.contains(&pred) {
                            stack.push(pred);
                        }
                    }
                }
            }
        }
    }

    let mut loops: Vec<NaturalLoop> = bodies
        .into_iter()
        .map(|(header, body)| {
            let mut blocks: Vec<BlockId> = body.into_iter().collect();
            blocks.sort_by_key(|b| b.0);
            let mut back_edge_sources = sources.remove(&header).unwrap_or_default();
            back_edge_sources.sort_by_key(|b| b.0);
            back_edge_sources.dedup();
            NaturalLoop { header, back_edge_sources, blocks }
        })
        .collect();
    loops.sort_by_key(|l| l.header.0);

    for block in 0..graph.block_count() {
        let id = BlockId(block as u32);
        let depth = loops.iter().filter(|l| l.contains(id)).count() as u32;
        let is_header = loops.iter().any(|l| l.header == id);
        let b = graph.block_mut(id);
        b.loop_depth = depth;
        b.is_loop_header = is_header;
    }

    loops
}
