//! Control-flow graph of basic blocks and instruction nodes.
//!
//! The graph is an arena: blocks, nodes, and phis live in flat vectors and
//! reference each other by index, never by pointer. One graph is built per
//! compile attempt and dropped in one step at the end of it, whatever the
//! outcome.

pub mod builder;
pub mod display;

use kova_bytecode::{BinOp, CondKind, Slot, UnOp};

pub use builder::{BuildError, GraphBuilder};

/// Identifier of a basic block in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Identifier of an instruction node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Identifier of a phi in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhiId(pub u32);

/// A value operand.
///
/// Before SSA conversion operands name local-variable slots. Conversion
/// renames every operand to the single node or phi that defines it; `Undef`
/// marks a phi input on a path where the slot was never written (such phis
/// are removed by cleanup unless the bytecode was malformed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRef {
    Slot(Slot),
    Node(NodeId),
    Phi(PhiId),
    Undef,
}

impl ValueRef {
    /// Whether this operand is an SSA value (post-conversion form).
    pub fn is_value(self) -> bool {
        matches!(self, ValueRef::Node(_) | ValueRef::Phi(_))
    }
}

/// Operation performed by a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKind {
    /// Incoming parameter, defined at the head of the entry block.
    Param(u16),
    ConstI32(i32),
    Unary(UnOp),
    Binary(BinOp),
    /// Slot copy; removed during SSA renaming.
    Move,
    /// Heap allocation of a resolved type. A safepoint.
    NewRef(u32),
}

impl NodeKind {
    /// Whether the produced value is a heap reference.
    pub fn produces_ref(self) -> bool {
        matches!(self, NodeKind::NewRef(_))
    }

    /// Whether the runtime may inspect the frame at this node.
    pub fn is_safepoint(self) -> bool {
        matches!(self, NodeKind::NewRef(_))
    }
}

/// An instruction node: one operation, zero or more inputs, at most one
/// output value.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub block: BlockId,
    pub kind: NodeKind,
    pub inputs: Vec<ValueRef>,
    /// Slot written by this node. Kept after SSA conversion as the logical
    /// variable the value belongs to, for the register-to-variable table.
    pub dest: Option<Slot>,
    /// Bytecode offset this node was translated from.
    pub offset: u32,
    /// Source line this node was translated from.
    pub line: u32,
}

/// A phi: pseudo-instruction at a merge point with one input per
/// predecessor edge, in predecessor order.
#[derive(Debug, Clone)]
pub struct Phi {
    pub id: PhiId,
    pub block: BlockId,
    /// The slot this phi merges.
    pub slot: Slot,
    pub inputs: Vec<ValueRef>,
    /// Set by cleanup when the phi has been eliminated. Dead phis stay in
    /// the arena so ids remain stable; they are absent from block phi lists.
    pub dead: bool,
}

/// How a block transfers control.
#[derive(Debug, Clone)]
pub enum Terminator {
    Goto(BlockId),
    If {
        cond: CondKind,
        lhs: ValueRef,
        rhs: ValueRef,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return(Option<ValueRef>),
    Throw(ValueRef),
    /// Not yet assigned (unreachable tail or empty method).
    None,
}

impl Terminator {
    /// Successor blocks named by this terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Goto(b) => vec![*b],
            Terminator::If { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Return(_) | Terminator::Throw(_) | Terminator::None => vec![],
        }
    }

    /// Value operands read by this terminator.
    pub fn inputs(&self) -> Vec<ValueRef> {
        match self {
            Terminator::If { lhs, rhs, .. } => vec![*lhs, *rhs],
            Terminator::Return(Some(v)) | Terminator::Throw(v) => vec![*v],
            Terminator::Return(None) | Terminator::Goto(_) | Terminator::None => vec![],
        }
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// Bytecode offset of the first instruction assigned to this block.
    pub start_offset: u32,
    pub phis: Vec<PhiId>,
    pub nodes: Vec<NodeId>,
    pub terminator: Terminator,
    pub predecessors: Vec<BlockId>,
    /// Exception edges out of this block, one per covering handler.
    pub handler_succs: Vec<BlockId>,
    /// Whether this block is a catch handler entry.
    pub is_handler: bool,
    /// Immediate dominator, filled by dominance analysis. The entry block
    /// dominates itself.
    pub idom: Option<BlockId>,
    /// Number of natural loops containing this block.
    pub loop_depth: u32,
    pub is_loop_header: bool,
}

/// The per-compile graph arena.
#[derive(Debug)]
pub struct Graph {
    pub blocks: Vec<Block>,
    pub nodes: Vec<Node>,
    pub phis: Vec<Phi>,
    pub entry: BlockId,
    /// Total frame slots of the source method.
    pub num_slots: u16,
    /// Parameter count; parameters live in the last `num_params` slots.
    pub num_params: u16,
    /// Symbol of the source method, for dump output.
    pub symbol: String,
    /// Whether any exception edge exists. The register allocator declines
    /// graphs with handler edges.
    pub has_handler_edges: bool,
    /// Whether SSA conversion has run.
    pub in_ssa: bool,
}

impl Graph {
    pub fn new(symbol: String, num_slots: u16, num_params: u16) -> Self {
        Graph {
            blocks: vec![],
            nodes: vec![],
            phis: vec![],
            entry: BlockId(0),
            num_slots,
            num_params,
            symbol,
            has_handler_edges: false,
            in_ssa: false,
        }
    }

    pub fn add_block(&mut self, start_offset: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            start_offset,
            phis: vec![],
            nodes: vec![],
            terminator: Terminator::None,
            predecessors: vec![],
            handler_succs: vec![],
            is_handler: false,
            idom: None,
            loop_depth: 0,
            is_loop_header: false,
        });
        id
    }

    /// Append a node to a block and return its id.
    pub fn add_node(
        &mut self,
        block: BlockId,
        kind: NodeKind,
        inputs: Vec<ValueRef>,
        dest: Option<Slot>,
        offset: u32,
        line: u32,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { id, block, kind, inputs, dest, offset, line });
        self.blocks[block.0 as usize].nodes.push(id);
        id
    }

    /// Insert a phi for `slot` at the head of `block`.
    pub fn add_phi(&mut self, block: BlockId, slot: Slot) -> PhiId {
        let id = PhiId(self.phis.len() as u32);
        self.phis.push(Phi { id, block, slot, inputs: vec![], dead: false });
        self.blocks[block.0 as usize].phis.push(id);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn phi(&self, id: PhiId) -> &Phi {
        &self.phis[id.0 as usize]
    }

    pub fn phi_mut(&mut self, id: PhiId) -> &mut Phi {
        &mut self.phis[id.0 as usize]
    }

    /// All successors of a block: terminator targets then exception edges.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        let block = self.block(id);
        let mut succs = block.terminator.successors();
        succs.extend(block.handler_succs.iter().copied());
        succs
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Position of `pred` in `block`'s predecessor list. Phi inputs are
    /// stored in this order.
    pub fn pred_index(&self, block: BlockId, pred: BlockId) -> Option<usize> {
        self.block(block).predecessors.iter().position(|&p| p == pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_indices() {
        let mut graph = Graph::new("t".to_string(), 2, 0);
        let b0 = graph.add_block(0);
        let b1 = graph.add_block(4);
        assert_eq!(b0, BlockId(0));
        assert_eq!(b1, BlockId(1));

        let n = graph.add_node(b0, NodeKind::ConstI32(7), vec![], Some(Slot(0)), 0, 1);
        assert_eq!(graph.block(b0).nodes, vec![n]);
        assert_eq!(graph.node(n).block, b0);
    }

    #[test]
    fn test_successors_include_handler_edges() {
        let mut graph = Graph::new("t".to_string(), 1, 0);
        let b0 = graph.add_block(0);
        let b1 = graph.add_block(4);
        let b2 = graph.add_block(8);
        graph.block_mut(b0).terminator = Terminator::Goto(b1);
        graph.block_mut(b0).handler_succs.push(b2);
        assert_eq!(graph.successors(b0), vec![b1, b2]);
    }

    #[test]
    fn test_pred_index_matches_phi_order() {
        let mut graph = Graph::new("t".to_string(), 1, 0);
        let b0 = graph.add_block(0);
        let b1 = graph.add_block(4);
        let b2 = graph.add_block(8);
        graph.block_mut(b2).predecessors = vec![b0, b1];
        assert_eq!(graph.pred_index(b2, b0), Some(0));
        assert_eq!(graph.pred_index(b2, b1), Some(1));
        assert_eq!(graph.pred_index(b2, b2), None);
    }

    #[test]
    fn test_terminator_inputs() {
        let t = Terminator::If {
            cond: CondKind::Lt,
            lhs: ValueRef::Slot(Slot(0)),
            rhs: ValueRef::Slot(Slot(1)),
            then_block: BlockId(1),
            else_block: BlockId(2),
        };
        assert_eq!(t.inputs().len(), 2);
        assert_eq!(t.successors(), vec![BlockId(1), BlockId(2)]);
        assert!(Terminator::Return(None).inputs().is_empty());
    }
}
