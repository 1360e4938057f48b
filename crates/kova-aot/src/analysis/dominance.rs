//! Dominator tree construction and dominance frontiers.
//!
//! Dominator sets are computed with an iterative bitset fixpoint over
//! reverse postorder, then collapsed into immediate dominators. The
//! entry block is its own immediate dominator, which doubles as the
//! chain-walk terminator in [`DominatorTree::dominates`].

use crate::graph::{BlockId, Graph};

/// Blocks of `graph` in reverse postorder, starting at the entry.
/// Unreachable blocks are not included.
pub fn reverse_postorder(graph: &Graph) -> Vec<BlockId> {
    let n = graph.block_count();
    let mut visited = vec![false; n];
    let mut post = Vec::with_capacity(n);
    let mut stack: Vec<(BlockId, usize)> = vec![(graph.entry, 0)];
    visited[graph.entry.0 as usize] = true;
    while let Some(frame) = stack.last_mut() {
        let (block, next) = *frame;
        let succs = graph.successors(block);
        if next < succs.len() {
            frame.1 += 1;
            let succ = succs[next];
            if !visited[succ.0 as usize] {
                visited[succ.0 as usize] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
            stack.pop();
        }
    }
    post.reverse();
    post
}

/// Fixed-width bitset over reverse-postorder numbers.
#[derive(Clone, PartialEq, Eq)]
struct BitSet {
    words: Vec<u64>,
    bits: usize,
}

impl BitSet {
    fn empty(bits: usize) -> Self {
        BitSet {
            words: vec![0; bits.div_ceil(64)],
            bits,
        }
    }

    fn full(bits: usize) -> Self {
        let mut set = BitSet {
            words: vec![!0u64; bits.div_ceil(64)],
            bits,
        };
        let tail = bits % 64;
        if tail != 0 {
            if let Some(last) = set.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        set
    }

    fn insert(&mut self, bit: usize) {
        self.words[bit / 64] |= 1u64 << (bit % 64);
    }

    fn contains(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    fn remove(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1u64 << (bit % 64));
    }

    fn intersect_with(&mut self, other: &BitSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= o;
        }
    }

    fn len(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(|&b| self.contains(b))
    }
}

/// Immediate-dominator tree over the reachable blocks of a graph.
pub struct DominatorTree {
    /// Reachable blocks in reverse postorder.
    pub rpo: Vec<BlockId>,
    /// Immediate dominator per block id. `None` for unreachable blocks.
    /// The entry is its own immediate dominator.
    idom: Vec<Option<BlockId>>,
}

impl DominatorTree {
    pub fn build(graph: &Graph) -> DominatorTree {
        let rpo = reverse_postorder(graph);
        let n = rpo.len();
        let mut rpo_num: Vec<Option<usize>> = vec![None; graph.block_count()];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_num[b.0 as usize] = Some(i);
        }

        // doms[i] is the full dominator set of rpo[i], as rpo numbers.
        let mut doms: Vec<BitSet> = (0..n).map(|_| BitSet::full(n)).collect();
        let mut entry_set = BitSet::empty(n);
        entry_set.insert(0);
        doms[0] = entry_set;

        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..n {
                let block = rpo[i];
                let mut new = BitSet::full(n);
                let mut saw_pred = false;
                for &pred in &graph.block(block).predecessors {
                    if let Some(p) = rpo_num[pred.0 as usize] {
                        new.intersect_with(&doms[p]);
                        saw_pred = true;
                    }
                }
                if !saw_pred {
                    new = BitSet::empty(n);
                }
                new.insert(i);
                if new != doms[i] {
                    doms[i] = new;
                    changed = true;
                }
            }
        }

        // The immediate dominator is the strict dominator with the
        // largest dominator set of its own.
        let mut idom: Vec<Option<BlockId>> = vec![None; graph.block_count()];
        idom[graph.entry.0 as usize] = Some(graph.entry);
        for i in 1..n {
            let mut strict = doms[i].clone();
            strict.remove(i);
            let mut best: Option<usize> = None;
            for cand in strict.iter_set() {
                let better = match best {
                    Some(b) => doms[cand].len() > doms[b].len(),
                    None => true,
                };
                if better {
                    best = Some(cand);
                }
            }
            if let Some(b) = best {
                idom[rpo[i].0 as usize] = Some(rpo[b]);
            }
        }

        DominatorTree { rpo, idom }
    }

    /// The immediate dominator of `block`, or `None` if unreachable.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block.0 as usize]
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.idom[block.0 as usize].is_some()
    }

    /// Whether `a` dominates `b`. Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom[cur.0 as usize] {
                Some(parent) if parent != cur => cur = parent,
                _ => return false,
            }
        }
    }

    /// Record immediate dominators on the graph's blocks.
    pub fn apply(&self, graph: &mut Graph) {
        for (i, idom) in self.idom.iter().enumerate() {
            graph.block_mut(BlockId(i as u32)).idom = *idom;
        }
    }

    /// Dominance frontier per block, indexed by block id. A block `b`
    /// is in the frontier of `d` when `d` dominates a predecessor of
    /// `b` but does not strictly dominate `b` itself.
    pub fn frontiers(&self, graph: &Graph) -> Vec<Vec<BlockId>> {
        let mut df: Vec<Vec<BlockId>> = vec![Vec::new(); graph.block_count()];
        for &block in &self.rpo {
            let preds = &graph.block(block).predecessors;
            if preds.len() < 2 {
                continue;
            }
            let idom = match self.idom(block) {
                Some(d) => d,
                None => continue,
            };
            for &pred in preds {
                if !self.is_reachable(pred) {
                    continue;
                }
                let mut runner = pred;
                while runner != idom {
                    let entry = &mut df[runner.0 as usize];
                    if !entry.contains(&block) {
                        entry.push(block);
                    }
                    match self.idom(runner) {
                        Some(parent) if parent != runner => runner = parent,
                        _ => break,
                    }
                }
            }
        }
        for set in &mut df {
            set.sort_by_key(|b| b.0);
        }
        df
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::tests::method;
    use crate::graph::GraphBuilder;
    use kova_bytecode::{CondKind, Op, Slot};

    fn diamond() -> Graph {
        // bb0: if v0 -> bb2 else bb1; bb1 -> bb3; bb2 -> bb3; bb3: ret
        let m = method(
            vec![
                Op::If { cond: CondKind::Eq, lhs: Slot(0), rhs: Slot(1), target: 2 },
                Op::Goto { target: 3 },
                Op::Goto { target: 3 },
                Op::Return,
            ],
            2,
            0,
        );
        GraphBuilder::build(&m).unwrap()
    }

    #[test]
    fn test_rpo_starts_at_entry() {
        let graph = diamond();
        let rpo = reverse_postorder(&graph);
        assert_eq!(rpo[0], graph.entry);
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn test_diamond_idoms() {
        let graph = diamond();
        let dom = DominatorTree::build(&graph);
        let entry = graph.entry;
        assert_eq!(dom.idom(entry), Some(entry));
        // Both arms are dominated by the entry, as is the merge.
        for b in 1..4 {
            assert_eq!(dom.idom(BlockId(b)), Some(entry));
        }
        assert!(dom.dominates(entry, BlockId(3)));
        assert!(!dom.dominates(BlockId(1), BlockId(3)));
    }

    #[test]
    fn test_merge_is_in_both_arm_frontiers() {
        let graph = diamond();
        let dom = DominatorTree::build(&graph);
        let df = dom.frontiers(&graph);
        let merge = BlockId(3);
        assert_eq!(df[1], vec![merge]);
        assert_eq!(df[2], vec![merge]);
        assert!(df[merge.0 as usize].is_empty());
    }

    #[test]
    fn test_loop_header_in_own_frontier() {
        // bb0 -> bb1; bb1: if -> bb2 (exit) else bb1
        let m = method(
            vec![
                Op::Goto { target: 1 },
                Op::If { cond: CondKind::Lt, lhs: Slot(0), rhs: Slot(1), target: 1 },
                Op::Return,
            ],
            2,
            0,
        );
        let graph = GraphBuilder::build(&m).unwrap();
        let dom = DominatorTree::build(&graph);
        let df = dom.frontiers(&graph);
        let header = BlockId(1);
        assert!(df[header.0 as usize].contains(&header));
        assert!(dom.dominates(header, header));
    }

    #[test]
    fn test_unreachable_block_has_no_idom() {
        // bb0: ret; bb1 (after an unconditional return) unreachable
        let m = method(vec![Op::Return, Op::Goto { target: 1 }], 1, 0);
        let graph = GraphBuilder::build(&m).unwrap();
        let dom = DominatorTree::build(&graph);
        assert!(dom.is_reachable(graph.entry));
        assert!(!dom.is_reachable(BlockId(1)));
        assert!(!dom.dominates(BlockId(1), graph.entry));
    }
}
