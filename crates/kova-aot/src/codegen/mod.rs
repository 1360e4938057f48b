//! Code generation contract.
//!
//! A backend lowers a graph to native bytes plus the side tables the
//! runtime consumes. The optimized entry takes a register allocation;
//! the baseline entry keeps every slot in the frame.

pub mod stub;

pub use stub::StubBackend;

use thiserror::Error;

use crate::analysis::liveness::Liveness;
use crate::artifact::{InstructionSet, MappingEntry, SafepointEntry, SrcMap, VmapEntry};
use crate::graph::Graph;
use crate::regalloc::Allocation;

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("no backend for instruction set {0}")]
    UnsupportedSet(InstructionSet),
    #[error("value {value} reached emission without a location")]
    UnplacedValue { value: String },
}

/// Everything a backend produces for one method. The pipeline wraps
/// this into the immutable artifact.
#[derive(Debug, Default)]
pub struct CodeOutput {
    pub code: Vec<u8>,
    pub mapping_table: Vec<MappingEntry>,
    pub vmap_table: Vec<VmapEntry>,
    pub gc_map: Vec<SafepointEntry>,
    pub cfi_info: Option<Vec<u8>>,
    pub src_map: SrcMap,
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
}

/// A native code generator for one instruction set.
pub trait CodeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn isa(&self) -> InstructionSet;

    /// Emit code using the register assignment in `allocation`. The
    /// liveness result drives the safepoint reference maps.
    fn compile_optimized(
        &self,
        graph: &Graph,
        liveness: &Liveness,
        allocation: &Allocation,
    ) -> Result<CodeOutput, CodegenError>;

    /// Emit code with every slot kept in its frame home.
    fn compile_baseline(&self, graph: &Graph) -> Result<CodeOutput, CodegenError>;
}

/// One trap instruction for `isa`, used where a real encoding has not
/// been brought up yet.
pub(crate) fn trap_unit(isa: InstructionSet) -> Option<&'static [u8]> {
    match isa.normalize() {
        // int3
        InstructionSet::X86_64 => Some(&[0xCC]),
        // bkpt #0
        InstructionSet::Thumb2 => Some(&[0x00, 0xBE]),
        // brk #0
        InstructionSet::Arm64 => Some(&[0x00, 0x00, 0x20, 0xD4]),
        _ => None,
    }
}
