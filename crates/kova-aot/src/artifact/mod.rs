//! Compiled method artifacts: instruction set properties, the
//! immutable per-method output, and a pool that recycles artifact
//! allocations across compilations.

pub mod srcmap;

pub use srcmap::{SrcMap, SrcMapEntry};

use parking_lot::Mutex;

/// Target instruction sets the pipeline knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionSet {
    X86_64,
    /// Classic 32-bit ARM encoding. Normalized to [`Thumb2`] before
    /// compilation; no code is ever emitted for it directly.
    Arm32,
    Thumb2,
    Arm64,
    Riscv64,
}

impl InstructionSet {
    /// The set actually compiled for. ARM code is always emitted in
    /// the Thumb2 encoding.
    pub fn normalize(self) -> InstructionSet {
        match self {
            InstructionSet::Arm32 => InstructionSet::Thumb2,
            other => other,
        }
    }

    /// Whether any backend path exists for this set.
    pub fn is_supported(self) -> bool {
        !matches!(self, InstructionSet::Riscv64)
    }

    /// Required starting alignment of a method's code, in bytes.
    pub fn code_alignment(self) -> u32 {
        match self {
            InstructionSet::X86_64 => 1,
            InstructionSet::Arm32 | InstructionSet::Thumb2 => 2,
            InstructionSet::Arm64 => 4,
            InstructionSet::Riscv64 => 2,
        }
    }

    /// Low-bit adjustment folded into code pointers. Thumb2 entry
    /// points carry bit zero set to select the encoding.
    pub fn code_delta(self) -> usize {
        match self.normalize() {
            InstructionSet::Thumb2 => 1,
            _ => 0,
        }
    }

    pub fn pointer_size(self) -> u32 {
        match self {
            InstructionSet::X86_64 | InstructionSet::Arm64 | InstructionSet::Riscv64 => 8,
            InstructionSet::Arm32 | InstructionSet::Thumb2 => 4,
        }
    }
}

impl std::fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Arm32 => "arm32",
            InstructionSet::Thumb2 => "thumb2",
            InstructionSet::Arm64 => "arm64",
            InstructionSet::Riscv64 => "riscv64",
        };
        f.write_str(name)
    }
}

/// Round `address` up to the code alignment of `isa`.
pub fn align_code(isa: InstructionSet, address: usize) -> usize {
    let alignment = isa.code_alignment() as usize;
    (address + alignment - 1) & !(alignment - 1)
}

/// The callable pointer for code placed at `address`, with the
/// instruction-set delta applied.
pub fn code_pointer(isa: InstructionSet, address: usize) -> usize {
    address | isa.code_delta()
}

/// One row of the native-pc to bytecode-offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub native_offset: u32,
    pub bytecode_offset: u32,
}

/// One row of the register-to-variable table: where a bytecode slot
/// lives in the compiled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmapEntry {
    pub register: u8,
    pub slot: u16,
}

/// Reference locations at one safepoint, as a register bitmap plus
/// spill-slot bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointEntry {
    pub native_offset: u32,
    /// One byte per group of eight tracked locations.
    pub live_refs: Vec<u8>,
}

/// The immutable output of compiling one method.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMethod {
    isa: InstructionSet,
    code: Vec<u8>,
    frame_size_in_bytes: u32,
    core_spill_mask: u32,
    fp_spill_mask: u32,
    src_map: SrcMap,
    mapping_table: Vec<MappingEntry>,
    vmap_table: Vec<VmapEntry>,
    gc_map: Vec<SafepointEntry>,
    cfi_info: Option<Vec<u8>>,
}

impl CompiledMethod {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        isa: InstructionSet,
        code: Vec<u8>,
        frame_size_in_bytes: u32,
        core_spill_mask: u32,
        fp_spill_mask: u32,
        src_map: SrcMap,
        mapping_table: Vec<MappingEntry>,
        vmap_table: Vec<VmapEntry>,
        gc_map: Vec<SafepointEntry>,
        cfi_info: Option<Vec<u8>>,
    ) -> CompiledMethod {
        CompiledMethod {
            isa,
            code,
            frame_size_in_bytes,
            core_spill_mask,
            fp_spill_mask,
            src_map,
            mapping_table,
            vmap_table,
            gc_map,
            cfi_info,
        }
    }

    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn frame_size_in_bytes(&self) -> u32 {
        self.frame_size_in_bytes
    }

    pub fn core_spill_mask(&self) -> u32 {
        self.core_spill_mask
    }

    pub fn fp_spill_mask(&self) -> u32 {
        self.fp_spill_mask
    }

    pub fn src_map(&self) -> &SrcMap {
        &self.src_map
    }

    pub fn mapping_table(&self) -> &[MappingEntry] {
        &self.mapping_table
    }

    pub fn vmap_table(&self) -> &[VmapEntry] {
        &self.vmap_table
    }

    pub fn gc_map(&self) -> &[SafepointEntry] {
        &self.gc_map
    }

    pub fn cfi_info(&self) -> Option<&[u8]> {
        self.cfi_info.as_deref()
    }

    /// Where this method's code would begin if placed at `address`.
    pub fn aligned_code_start(&self, address: usize) -> usize {
        align_code(self.isa, address)
    }

    /// The callable entry point for code placed at `address`.
    pub fn entry_pointer(&self, address: usize) -> usize {
        code_pointer(self.isa, self.aligned_code_start(address))
    }
}

/// Recycles artifact boxes between compilations. Callers take an
/// artifact with [`MethodPool::alloc`] and hand it back with
/// [`MethodPool::release`] once its contents have been consumed.
#[derive(Default)]
pub struct MethodPool {
    free: Mutex<Vec<Box<CompiledMethod>>>,
}

impl MethodPool {
    pub fn new() -> MethodPool {
        MethodPool::default()
    }

    pub fn alloc(&self, method: CompiledMethod) -> Box<CompiledMethod> {
        match self.free.lock().pop() {
            Some(mut boxed) => {
                *boxed = method;
                boxed
            }
            None => Box::new(method),
        }
    }

    pub fn release(&self, method: Box<CompiledMethod>) {
        self.free.lock().push(method);
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}
