//! Trap-emitting backend.
//!
//! Emits one trap unit per node so offsets, mapping tables and frame
//! layout are exercised end to end without a real encoder. Running the
//! produced code traps immediately.

use rustc_hash::FxHashSet;

use crate::analysis::dominance::reverse_postorder;
use crate::analysis::liveness::Liveness;
use crate::artifact::{InstructionSet, MappingEntry, SafepointEntry, VmapEntry};
use crate::codegen::{trap_unit, CodeBackend, CodeOutput, CodegenError};
use crate::graph::{Graph, NodeId, ValueRef};
use crate::regalloc::{Allocation, Location};

pub struct StubBackend {
    isa: InstructionSet,
}

impl StubBackend {
    /// A stub for `isa`, which is normalized first. `None` when no
    /// trap encoding exists for the set.
    pub fn new(isa: InstructionSet) -> Option<StubBackend> {
        let isa = isa.normalize();
        trap_unit(isa).map(|_| StubBackend { isa })
    }

    fn unit(&self) -> &'static [u8] {
        // Construction guarantees the encoding exists.
        trap_unit(self.isa).unwrap_or(&[0x00])
    }
}

fn round_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Slots of reference values live at position `pos`, excluding the
/// value the safepoint itself defines. Both compile entries report
/// references in slot space; the register-to-slot table connects it
/// to register homes.
fn live_ref_slots<'a>(
    liveness: &'a Liveness,
    at: NodeId,
    pos: usize,
) -> impl Iterator<Item = u32> + 'a {
    liveness.intervals.iter().filter_map(move |interval| {
        if !interval.is_ref || !interval.covers(pos) || interval.value == ValueRef::Node(at) {
            return None;
        }
        interval.slot.map(|slot| slot.0 as u32)
    })
}

/// Bitmap with one bit per tracked location, low bit first.
fn ref_bitmap(bits: impl Iterator<Item = u32>) -> Vec<u8> {
    let mut bytes: Vec<u8> = Vec::new();
    for bit in bits {
        let byte = (bit / 8) as usize;
        if bytes.len() <= byte {
            bytes.resize(byte + 1, 0);
        }
        bytes[byte] |= 1 << (bit % 8);
    }
    bytes
}

impl CodeBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn isa(&self) -> InstructionSet {
        self.isa
    }

    fn compile_optimized(
        &self,
        graph: &Graph,
        liveness: &Liveness,
        allocation: &Allocation,
    ) -> Result<CodeOutput, CodegenError> {
        let unit = self.unit();
        let mut out = CodeOutput {
            frame_size: allocation.frame_size,
            core_spill_mask: allocation.core_spill_mask,
            fp_spill_mask: allocation.fp_spill_mask,
            ..CodeOutput::default()
        };

        for &block in &liveness.linear_order {
            // Node positions continue the block's phi positions, the
            // same numbering liveness assigned.
            let mut pos = liveness.block_range[&block].0 + graph.block(block).phis.len();
            for &node in &graph.block(block).nodes {
                let native_offset = out.code.len() as u32;
                let node = graph.node(node);
                if let Some(location) = node.dest.and_then(|_| {
                    allocation.locations.get(&ValueRef::Node(node.id))
                }) {
                    if let Location::Register(register) = location {
                        if let Some(slot) = node.dest {
                            out.vmap_table.push(VmapEntry {
                                register: *register,
                                slot: slot.0,
                            });
                        }
                    }
                }
                out.code.extend_from_slice(unit);
                out.mapping_table.push(MappingEntry {
                    native_offset,
                    bytecode_offset: node.offset,
                });
                out.src_map.push(native_offset, node.line as i32);
                if node.kind.is_safepoint() {
                    out.gc_map.push(SafepointEntry {
                        native_offset,
                        live_refs: ref_bitmap(live_ref_slots(liveness, node.id, pos)),
                    });
                }
                pos += 1;
            }
            // One unit for the block's control transfer.
            out.code.extend_from_slice(unit);
        }

        out.vmap_table.sort_by_key(|e| (e.slot, e.register));
        out.vmap_table.dedup();
        Ok(out)
    }

    fn compile_baseline(&self, graph: &Graph) -> Result<CodeOutput, CodegenError> {
        let unit = self.unit();
        let word = self.isa.pointer_size();
        let mut out = CodeOutput {
            // Every slot lives in the frame below the saved return
            // address and frame pointer.
            frame_size: round_up(2 * word + graph.num_slots as u32 * word, 16),
            ..CodeOutput::default()
        };

        // Slots that ever hold a reference, reported at safepoints.
        let mut ref_slots: FxHashSet<u16> = FxHashSet::default();
        for block in &graph.blocks {
            for &node in &block.nodes {
                let node = graph.node(node);
                if node.kind.produces_ref() {
                    if let Some(slot) = node.dest {
                        ref_slots.insert(slot.0);
                    }
                }
            }
        }
        let mut ref_bits: Vec<u32> = ref_slots.iter().map(|&s| s as u32).collect();
        ref_bits.sort_unstable();

        for block in reverse_postorder(graph) {
            for &node in &graph.block(block).nodes {
                let native_offset = out.code.len() as u32;
                let node = graph.node(node);
                out.code.extend_from_slice(unit);
                out.mapping_table.push(MappingEntry {
                    native_offset,
                    bytecode_offset: node.offset,
                });
                out.src_map.push(native_offset, node.line as i32);
                if node.kind.is_safepoint() {
                    out.gc_map.push(SafepointEntry {
                        native_offset,
                        live_refs: ref_bitmap(ref_bits.iter().copied()),
                    });
                }
            }
            out.code.extend_from_slice(unit);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dominance::DominatorTree;
    use crate::analysis::liveness::Liveness;
    use crate::analysis::loops::find_natural_loops;
    use crate::graph::builder::tests::method;
    use crate::graph::GraphBuilder;
    use crate::regalloc::{RegisterAllocator, RegisterFile};
    use crate::ssa;
    use kova_bytecode::{BinOp, CondKind, Op, Slot};

    fn compiled_with(
        instrs: Vec<Op>,
        num_slots: u16,
        allocator: RegisterAllocator,
    ) -> CodeOutput {
        let m = method(instrs, num_slots, 0);
        let mut graph = GraphBuilder::build(&m).unwrap();
        let dom = DominatorTree::build(&graph);
        dom.apply(&mut graph);
        let loops = find_natural_loops(&mut graph, &dom);
        ssa::convert(&mut graph, &dom);
        ssa::run_cleanup(&mut graph);
        let liveness = Liveness::analyze(&graph, &loops);
        let allocation = allocator.allocate(&liveness);
        let backend = StubBackend::new(InstructionSet::X86_64).unwrap();
        backend.compile_optimized(&graph, &liveness, &allocation).unwrap()
    }

    fn compiled(instrs: Vec<Op>, num_slots: u16) -> CodeOutput {
        let allocator = RegisterAllocator::new(InstructionSet::X86_64).unwrap();
        compiled_with(instrs, num_slots, allocator)
    }

    #[test]
    fn test_no_stub_for_riscv() {
        assert!(StubBackend::new(InstructionSet::Riscv64).is_none());
    }

    #[test]
    fn test_arm32_stub_emits_thumb2_units() {
        let backend = StubBackend::new(InstructionSet::Arm32).unwrap();
        assert_eq!(backend.isa(), InstructionSet::Thumb2);
        assert_eq!(backend.unit(), &[0x00, 0xBE]);
    }

    #[test]
    fn test_mapping_rows_point_back_at_bytecode() {
        let out = compiled(
            vec![
                Op::ConstI32 { dest: Slot(0), value: 1 },
                Op::ConstI32 { dest: Slot(1), value: 2 },
                Op::Binary { op: BinOp::Add, dest: Slot(0), lhs: Slot(0), rhs: Slot(1) },
                Op::ReturnValue { src: Slot(0) },
            ],
            2,
        );
        assert!(!out.code.is_empty());
        assert_eq!(out.mapping_table.len(), 3);
        let offsets: Vec<u32> = out.mapping_table.iter().map(|e| e.bytecode_offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        // Native offsets strictly increase.
        for pair in out.mapping_table.windows(2) {
            assert!(pair[0].native_offset < pair[1].native_offset);
        }
        assert_eq!(out.src_map.len(), 3);
    }

    #[test]
    fn test_safepoint_reports_live_reference_slots() {
        let out = compiled(
            vec![
                Op::NewRef { dest: Slot(0), type_index: 9 },
                Op::NewRef { dest: Slot(1), type_index: 9 },
                Op::ReturnValue { src: Slot(0) },
            ],
            2,
        );
        assert_eq!(out.gc_map.len(), 2);
        // Nothing is live yet at the first allocation; the second sees
        // the slot 0 reference.
        assert!(out.gc_map[0].live_refs.is_empty());
        assert_eq!(out.gc_map[1].live_refs, vec![0b0000_0001]);
    }

    #[test]
    fn test_safepoint_includes_spilled_references() {
        // One allocatable register, three live references: at the
        // third allocation the first two are live and at least one of
        // them sits in a spill slot, yet both slots are reported.
        let file = RegisterFile {
            isa: InstructionSet::X86_64,
            allocatable: vec![0],
            callee_saved: 0,
            word_size: 8,
        };
        let out = compiled_with(
            vec![
                Op::NewRef { dest: Slot(0), type_index: 1 },
                Op::NewRef { dest: Slot(1), type_index: 1 },
                Op::NewRef { dest: Slot(2), type_index: 1 },
                Op::Binary { op: BinOp::Add, dest: Slot(3), lhs: Slot(0), rhs: Slot(1) },
                Op::ReturnValue { src: Slot(3) },
            ],
            4,
            RegisterAllocator::with_file(file),
        );
        assert_eq!(out.gc_map.len(), 3);
        assert_eq!(out.gc_map[2].live_refs, vec![0b0000_0011]);
    }

    #[test]
    fn test_safepoint_reports_reference_phis() {
        // A reference merged through a phi is still live at the
        // allocation in the join block.
        let out = compiled(
            vec![
                Op::ConstI32 { dest: Slot(1), value: 0 },
                Op::If { cond: CondKind::Eq, lhs: Slot(1), rhs: Slot(1), target: 4 },
                Op::NewRef { dest: Slot(0), type_index: 1 },
                Op::Goto { target: 5 },
                Op::NewRef { dest: Slot(0), type_index: 2 },
                Op::NewRef { dest: Slot(2), type_index: 3 },
                Op::ReturnValue { src: Slot(0) },
            ],
            3,
        );
        assert_eq!(out.gc_map.len(), 3);
        let join = out.gc_map.last().unwrap();
        assert_eq!(join.live_refs, vec![0b0000_0001]);
    }

    #[test]
    fn test_vmap_rows_connect_registers_to_slots() {
        let out = compiled(
            vec![
                Op::ConstI32 { dest: Slot(0), value: 1 },
                Op::ConstI32 { dest: Slot(1), value: 2 },
                Op::Binary { op: BinOp::Add, dest: Slot(0), lhs: Slot(0), rhs: Slot(1) },
                Op::ReturnValue { src: Slot(0) },
            ],
            2,
        );
        assert!(!out.vmap_table.is_empty());
        assert!(out.vmap_table.iter().any(|e| e.slot == 0));
        assert!(out.vmap_table.iter().any(|e| e.slot == 1));
    }

    #[test]
    fn test_baseline_frame_holds_every_slot() {
        let m = method(
            vec![
                Op::ConstI32 { dest: Slot(0), value: 1 },
                Op::ReturnValue { src: Slot(0) },
            ],
            4,
            0,
        );
        let graph = GraphBuilder::build(&m).unwrap();
        let backend = StubBackend::new(InstructionSet::X86_64).unwrap();
        let out = backend.compile_baseline(&graph).unwrap();
        // Two saved words plus four slot words, 16-byte aligned.
        assert_eq!(out.frame_size, 48);
        assert_eq!(out.core_spill_mask, 0);
        assert!(!out.code.is_empty());
    }
}
