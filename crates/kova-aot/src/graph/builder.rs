//! Graph construction from a verified method.
//!
//! Scans the instruction stream for branch and handler targets to find
//! block boundaries, creates one block per boundary, links fall-through,
//! branch, and exception edges, and translates each bytecode operation
//! into graph nodes. Declining a method here is not an error in the input:
//! it signals that this pipeline does not model the construct and the
//! baseline compiler should take the method instead.

use rustc_hash::{FxHashMap, FxHashSet};

use kova_bytecode::{MethodDescriptor, Op, Slot};

use super::{BlockId, Graph, NodeKind, Terminator, ValueRef};

/// Why a method could not be turned into a graph.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("unsupported operation {mnemonic} at offset {offset}")]
    UnsupportedOp { mnemonic: &'static str, offset: u32 },
    #[error("branch at offset {offset} targets unknown offset {target}")]
    MalformedBranch { offset: u32, target: u32 },
}

/// Builds a [`Graph`] from a [`MethodDescriptor`].
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn build(method: &MethodDescriptor) -> Result<Graph, BuildError> {
        // Decline constructs this pipeline does not model before doing any
        // graph work.
        for instr in &method.instrs {
            if matches!(
                instr.op,
                Op::PackedSwitch { .. } | Op::MonitorEnter { .. } | Op::MonitorExit { .. }
            ) {
                return Err(BuildError::UnsupportedOp {
                    mnemonic: instr.op.mnemonic(),
                    offset: instr.offset,
                });
            }
        }

        let mut graph = Graph::new(method.symbol.clone(), method.num_slots, method.num_params);

        if method.instrs.is_empty() {
            let entry = graph.add_block(0);
            graph.entry = entry;
            graph.block_mut(entry).terminator = Terminator::Return(None);
            Self::add_params(&mut graph, method, 0);
            return Ok(graph);
        }

        // Step 1: collect block boundary offsets.
        let starts = Self::collect_block_starts(method);
        let mut sorted_starts: Vec<u32> = starts.into_iter().collect();
        sorted_starts.sort_unstable();

        let mut offset_to_block: FxHashMap<u32, BlockId> = FxHashMap::default();
        for &start in &sorted_starts {
            let id = graph.add_block(start);
            offset_to_block.insert(start, id);
        }
        graph.entry = offset_to_block[&method.instrs[0].offset];

        // Step 2: assign instructions to blocks and translate them.
        let block_count = sorted_starts.len();
        let mut current = 0usize;
        for (idx, instr) in method.instrs.iter().enumerate() {
            while current + 1 < block_count && instr.offset >= sorted_starts[current + 1] {
                current += 1;
            }
            let block = BlockId(current as u32);
            let next_offset = method.instrs.get(idx + 1).map(|i| i.offset);

            match &instr.op {
                Op::ConstI32 { dest, value } => {
                    graph.add_node(
                        block,
                        NodeKind::ConstI32(*value),
                        vec![],
                        Some(*dest),
                        instr.offset,
                        instr.line,
                    );
                }
                Op::Move { dest, src } => {
                    graph.add_node(
                        block,
                        NodeKind::Move,
                        vec![ValueRef::Slot(*src)],
                        Some(*dest),
                        instr.offset,
                        instr.line,
                    );
                }
                Op::Unary { op, dest, src } => {
                    graph.add_node(
                        block,
                        NodeKind::Unary(*op),
                        vec![ValueRef::Slot(*src)],
                        Some(*dest),
                        instr.offset,
                        instr.line,
                    );
                }
                Op::Binary { op, dest, lhs, rhs } => {
                    graph.add_node(
                        block,
                        NodeKind::Binary(*op),
                        vec![ValueRef::Slot(*lhs), ValueRef::Slot(*rhs)],
                        Some(*dest),
                        instr.offset,
                        instr.line,
                    );
                }
                Op::NewRef { dest, type_index } => {
                    graph.add_node(
                        block,
                        NodeKind::NewRef(*type_index),
                        vec![],
                        Some(*dest),
                        instr.offset,
                        instr.line,
                    );
                }
                Op::If { cond, lhs, rhs, target } => {
                    let then_block = Self::target_block(&offset_to_block, instr.offset, *target)?;
                    let else_offset = next_offset.ok_or(BuildError::MalformedBranch {
                        offset: instr.offset,
                        target: instr.offset + 1,
                    })?;
                    let else_block =
                        Self::target_block(&offset_to_block, instr.offset, else_offset)?;
                    graph.block_mut(block).terminator = Terminator::If {
                        cond: *cond,
                        lhs: ValueRef::Slot(*lhs),
                        rhs: ValueRef::Slot(*rhs),
                        then_block,
                        else_block,
                    };
                }
                Op::Goto { target } => {
                    let target_block =
                        Self::target_block(&offset_to_block, instr.offset, *target)?;
                    graph.block_mut(block).terminator = Terminator::Goto(target_block);
                }
                Op::Return => {
                    graph.block_mut(block).terminator = Terminator::Return(None);
                }
                Op::ReturnValue { src } => {
                    graph.block_mut(block).terminator =
                        Terminator::Return(Some(ValueRef::Slot(*src)));
                }
                Op::Throw { src } => {
                    graph.block_mut(block).terminator = Terminator::Throw(ValueRef::Slot(*src));
                }
                Op::PackedSwitch { .. } | Op::MonitorEnter { .. } | Op::MonitorExit { .. } => {
                    unreachable!("declined above");
                }
            }

            // Fall through into the next block when a non-branching
            // instruction ends this one.
            if !instr.op.ends_block() {
                if let Some(next) = next_offset {
                    if let Some(&next_block) = offset_to_block.get(&next) {
                        if next_block != block {
                            graph.block_mut(block).terminator = Terminator::Goto(next_block);
                        }
                    }
                }
            }
        }

        Self::add_params(&mut graph, method, method.instrs[0].offset);
        Self::link_handler_edges(&mut graph, method, &offset_to_block)?;
        Self::link_predecessors(&mut graph);

        Ok(graph)
    }

    /// Bytecode offsets that start a basic block.
    fn collect_block_starts(method: &MethodDescriptor) -> FxHashSet<u32> {
        let mut starts = FxHashSet::default();
        starts.insert(method.instrs[0].offset);

        for (idx, instr) in method.instrs.iter().enumerate() {
            for target in instr.op.branch_targets() {
                starts.insert(target);
            }
            if instr.op.ends_block() {
                if let Some(next) = method.instrs.get(idx + 1) {
                    starts.insert(next.offset);
                }
            }
        }

        // Try region boundaries also split blocks, so every block is
        // either entirely inside or entirely outside a region.
        if !method.handlers.is_empty() {
            let offsets: FxHashSet<u32> = method.instrs.iter().map(|i| i.offset).collect();
            for handler in &method.handlers {
                starts.insert(handler.handler);
                if offsets.contains(&handler.try_start) {
                    starts.insert(handler.try_start);
                }
                if offsets.contains(&handler.try_end) {
                    starts.insert(handler.try_end);
                }
            }
        }

        starts
    }

    fn target_block(
        offset_to_block: &FxHashMap<u32, BlockId>,
        offset: u32,
        target: u32,
    ) -> Result<BlockId, BuildError> {
        offset_to_block
            .get(&target)
            .copied()
            .ok_or(BuildError::MalformedBranch { offset, target })
    }

    /// Parameters live in the last `num_params` slots; define them at the
    /// head of the entry block so every value has a definition site.
    fn add_params(graph: &mut Graph, method: &MethodDescriptor, offset: u32) {
        let entry = graph.entry;
        let first = method.num_slots - method.num_params;
        for i in 0..method.num_params {
            graph.add_node(
                entry,
                NodeKind::Param(i),
                vec![],
                Some(Slot(first + i)),
                offset,
                0,
            );
        }
        // Param nodes were appended after any translated nodes; move them
        // to the front of the entry block.
        let block = graph.block_mut(entry);
        let n = block.nodes.len();
        let params = method.num_params as usize;
        block.nodes.rotate_right(params.min(n));
    }

    fn link_handler_edges(
        graph: &mut Graph,
        method: &MethodDescriptor,
        offset_to_block: &FxHashMap<u32, BlockId>,
    ) -> Result<(), BuildError> {
        for handler in &method.handlers {
            let handler_block = offset_to_block.get(&handler.handler).copied().ok_or(
                BuildError::MalformedBranch {
                    offset: handler.try_start,
                    target: handler.handler,
                },
            )?;
            graph.block_mut(handler_block).is_handler = true;

            for id in 0..graph.block_count() {
                let block_id = BlockId(id as u32);
                let start = graph.block(block_id).start_offset;
                if block_id != handler_block && handler.covers(start) {
                    graph.block_mut(block_id).handler_succs.push(handler_block);
                    graph.has_handler_edges = true;
                }
            }
        }
        Ok(())
    }

    fn link_predecessors(graph: &mut Graph) {
        for id in 0..graph.block_count() {
            let block_id = BlockId(id as u32);
            for succ in graph.successors(block_id) {
                graph.block_mut(succ).predecessors.push(block_id);
            }
        }
    }
}
