//! Baseline compiler.
//!
//! Emits straight from the instruction stream with every slot kept in
//! the frame. It accepts every well-formed method, including the
//! constructs the graph builder declines, which makes it the fallback
//! target for the optimizing path.

use crate::artifact::{
    CompiledMethod, InstructionSet, MappingEntry, MethodPool, SafepointEntry, SrcMap,
};
use crate::codegen::trap_unit;
use crate::pipeline::{CompileError, CompileOutcome, MethodCompiler};
use kova_bytecode::{MethodDescriptor, Op};

pub struct BaselineCompiler {
    isa: InstructionSet,
}

fn round_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

impl BaselineCompiler {
    pub fn new(isa: InstructionSet) -> BaselineCompiler {
        BaselineCompiler { isa: isa.normalize() }
    }

    pub fn isa(&self) -> InstructionSet {
        self.isa
    }

    fn frame_size(&self, num_slots: u16) -> u32 {
        let word = self.isa.pointer_size();
        round_up(2 * word + num_slots as u32 * word, 16)
    }

    pub fn compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError> {
        let unit = trap_unit(self.isa).ok_or(CompileError::Unsupported(self.isa))?;

        let mut code: Vec<u8> = Vec::new();
        let mut mapping: Vec<MappingEntry> = Vec::new();
        let mut gc_map: Vec<SafepointEntry> = Vec::new();
        let mut src_map = SrcMap::new();
        // Slots that have held a reference so far, as a running bitmap.
        let mut ref_slots: Vec<u8> = Vec::new();

        for instr in &method.instrs {
            let native_offset = code.len() as u32;
            code.extend_from_slice(unit);
            mapping.push(MappingEntry { native_offset, bytecode_offset: instr.offset });
            src_map.push(native_offset, instr.line as i32);
            if let Op::NewRef { dest, .. } = instr.op {
                let byte = (dest.0 / 8) as usize;
                if ref_slots.len() <= byte {
                    ref_slots.resize(byte + 1, 0);
                }
                ref_slots[byte] |= 1 << (dest.0 % 8);
                gc_map.push(SafepointEntry { native_offset, live_refs: ref_slots.clone() });
            }
        }
        if code.is_empty() {
            code.extend_from_slice(unit);
        }
        src_map.arrange();

        Ok(pool.alloc(CompiledMethod::new(
            self.isa,
            code,
            self.frame_size(method.num_slots),
            0,
            0,
            src_map,
            mapping,
            Vec::new(),
            gc_map,
            None,
        )))
    }

    /// Trampoline artifact for native methods: a single trap and a
    /// bare frame.
    pub fn compile_native_stub(
        &self,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError> {
        let unit = trap_unit(self.isa).ok_or(CompileError::Unsupported(self.isa))?;
        Ok(pool.alloc(CompiledMethod::new(
            self.isa,
            unit.to_vec(),
            self.frame_size(0),
            0,
            0,
            SrcMap::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            None,
        )))
    }
}

impl MethodCompiler for BaselineCompiler {
    fn name(&self) -> &'static str {
        "baseline"
    }

    /// The baseline path never declines a method; the attempt is the
    /// compile.
    fn try_compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<CompileOutcome, CompileError> {
        Ok(CompileOutcome::Artifact(BaselineCompiler::compile(
            self, method, pool,
        )?))
    }

    fn compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError> {
        BaselineCompiler::compile(self, method, pool)
    }

    fn compile_native_stub(
        &self,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError> {
        BaselineCompiler::compile_native_stub(self, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::tests::method;
    use kova_bytecode::Slot;

    #[test]
    fn test_compiles_constructs_the_graph_builder_declines() {
        let m = method(
            vec![
                Op::MonitorEnter { src: Slot(0) },
                Op::PackedSwitch { src: Slot(0), targets: vec![2, 3] },
                Op::MonitorExit { src: Slot(0) },
                Op::Return,
            ],
            1,
            0,
        );
        let pool = MethodPool::new();
        let compiler = BaselineCompiler::new(InstructionSet::X86_64);
        let compiled = compiler.compile(&m, &pool).unwrap();
        assert_eq!(compiled.mapping_table().len(), 4);
        assert_eq!(compiled.code().len(), 4);
    }

    #[test]
    fn test_reference_slots_accumulate_in_the_gc_map() {
        let m = method(
            vec![
                Op::NewRef { dest: Slot(0), type_index: 1 },
                Op::NewRef { dest: Slot(2), type_index: 1 },
                Op::Return,
            ],
            3,
            0,
        );
        let pool = MethodPool::new();
        let compiler = BaselineCompiler::new(InstructionSet::X86_64);
        let compiled = compiler.compile(&m, &pool).unwrap();
        let gc_map = compiled.gc_map();
        assert_eq!(gc_map.len(), 2);
        assert_eq!(gc_map[0].live_refs, vec![0b0000_0001]);
        assert_eq!(gc_map[1].live_refs, vec![0b0000_0101]);
    }

    #[test]
    fn test_unsupported_set_is_an_error() {
        let m = method(vec![Op::Return], 0, 0);
        let pool = MethodPool::new();
        let compiler = BaselineCompiler::new(InstructionSet::Riscv64);
        assert!(matches!(
            compiler.compile(&m, &pool),
            Err(CompileError::Unsupported(InstructionSet::Riscv64))
        ));
    }

    #[test]
    fn test_empty_method_still_gets_a_body() {
        let m = method(vec![], 0, 0);
        let pool = MethodPool::new();
        let compiler = BaselineCompiler::new(InstructionSet::Arm64);
        let compiled = compiler.compile(&m, &pool).unwrap();
        assert_eq!(compiled.code().len(), 4);
    }

    #[test]
    fn test_native_stub_is_one_trap() {
        let pool = MethodPool::new();
        let compiler = BaselineCompiler::new(InstructionSet::X86_64);
        let stub = compiler.compile_native_stub(&pool).unwrap();
        assert_eq!(stub.code(), &[0xCC]);
        assert_eq!(stub.frame_size_in_bytes(), 16);
        assert!(stub.mapping_table().is_empty());
    }
}
