//! The method compilation pipeline.
//!
//! [`OptimizingCompiler`] drives a method through graph construction,
//! dominance, SSA conversion, phi cleanup, liveness and register
//! allocation, then hands the graph to its backend. Methods the
//! optimized path declines are compiled by the [`BaselineCompiler`]
//! delegate instead, so every supported method always gets code.

pub mod baseline;

pub use baseline::BaselineCompiler;

use parking_lot::Mutex;
use thiserror::Error;

use crate::analysis::dominance::DominatorTree;
use crate::analysis::liveness::Liveness;
use crate::analysis::loops::find_natural_loops;
use crate::artifact::{CompiledMethod, InstructionSet, MethodPool};
use crate::codegen::{CodeBackend, CodeOutput, CodegenError};
use crate::graph::{BuildError, Graph, GraphBuilder};
use crate::regalloc::RegisterAllocator;
use crate::ssa;
use crate::verify::{self, InvariantError};
use kova_bytecode::MethodDescriptor;

/// How far a method got through the optimized path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileStage {
    #[default]
    NotAttempted,
    Build,
    Dominance,
    Ssa,
    Liveness,
    Allocation,
    Codegen,
    Artifact,
    Unsupported,
}

impl std::fmt::Display for CompileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompileStage::NotAttempted => "not-attempted",
            CompileStage::Build => "build",
            CompileStage::Dominance => "dominance",
            CompileStage::Ssa => "ssa",
            CompileStage::Liveness => "liveness",
            CompileStage::Allocation => "allocation",
            CompileStage::Codegen => "codegen",
            CompileStage::Artifact => "artifact",
            CompileStage::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// Why the optimized path handed a method to the delegate.
#[derive(Debug, Error)]
pub enum FallbackCause {
    #[error("instruction set {0} is not supported")]
    UnsupportedIsa(InstructionSet),
    #[error("method name does not match the compile filter")]
    Filtered,
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
}

/// A declined optimized compilation: where it stopped and why.
#[derive(Debug)]
pub struct FallbackSignal {
    pub stage: CompileStage,
    pub cause: FallbackCause,
}

/// Result of one optimized attempt.
#[derive(Debug)]
pub enum CompileOutcome {
    Artifact(Box<CompiledMethod>),
    Fallback(FallbackSignal),
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no compiler support for instruction set {0}")]
    Unsupported(InstructionSet),
    #[error("method {symbol} required the optimized path but stopped at {stage}")]
    OptimizedPathRequired { symbol: String, stage: CompileStage },
    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

/// A compiler that turns method descriptors into artifacts.
pub trait MethodCompiler {
    fn name(&self) -> &'static str;

    /// One optimized attempt. A `Fallback` outcome is not an error;
    /// the caller decides where the method goes next.
    fn try_compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<CompileOutcome, CompileError>;

    /// Compile unconditionally, delegating declined methods.
    fn compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError>;

    /// Trampoline artifact for native methods.
    fn compile_native_stub(&self, pool: &MethodPool)
        -> Result<Box<CompiledMethod>, CompileError>;

    /// The callable pointer for `method` placed at `address`.
    fn entry_point(&self, method: &CompiledMethod, address: usize) -> usize {
        method.entry_pointer(address)
    }
}

/// Pipeline knobs.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Record a pretty-printed graph after each phase.
    pub enable_graph_dump: bool,
    /// When non-empty, only methods whose symbol contains this string
    /// take the optimized path.
    pub name_filter: String,
    /// Turn fallbacks of matching methods into hard errors.
    pub require_optimized_path: bool,
    /// Check SSA and allocation invariants between phases.
    pub verify: bool,
}

impl Default for CompilerOptions {
    fn default() -> CompilerOptions {
        CompilerOptions {
            enable_graph_dump: false,
            name_filter: String::new(),
            require_optimized_path: false,
            verify: true,
        }
    }
}

/// One recorded graph snapshot.
#[derive(Debug, Clone)]
pub struct GraphDump {
    pub symbol: String,
    pub stage: CompileStage,
    pub text: String,
}

/// Running counters for one compiler instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileStats {
    pub attempted: u64,
    pub optimized: u64,
    pub baseline: u64,
    /// Where the most recent attempt ended up.
    pub last_stage: CompileStage,
}

pub struct OptimizingCompiler<B: CodeBackend> {
    backend: B,
    delegate: BaselineCompiler,
    options: CompilerOptions,
    dump_log: Mutex<Vec<GraphDump>>,
    stats: Mutex<CompileStats>,
}

impl<B: CodeBackend> OptimizingCompiler<B> {
    pub fn new(backend: B, options: CompilerOptions) -> OptimizingCompiler<B> {
        let delegate = BaselineCompiler::new(backend.isa());
        OptimizingCompiler {
            backend,
            delegate,
            options,
            dump_log: Mutex::new(Vec::new()),
            stats: Mutex::new(CompileStats::default()),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn stats(&self) -> CompileStats {
        *self.stats.lock()
    }

    /// Drain the recorded graph dumps.
    pub fn take_dumps(&self) -> Vec<GraphDump> {
        std::mem::take(&mut self.dump_log.lock())
    }

    fn matches_filter(&self, symbol: &str) -> bool {
        self.options.name_filter.is_empty() || symbol.contains(&self.options.name_filter)
    }

    fn dump(&self, stage: CompileStage, graph: &Graph) {
        if self.options.enable_graph_dump && self.matches_filter(&graph.symbol) {
            self.dump_log.lock().push(GraphDump {
                symbol: graph.symbol.clone(),
                stage,
                text: graph.to_string(),
            });
        }
    }

    fn finish(&self, isa: InstructionSet, out: CodeOutput, pool: &MethodPool) -> Box<CompiledMethod> {
        let mut src_map = out.src_map;
        src_map.arrange();
        pool.alloc(CompiledMethod::new(
            isa,
            out.code,
            out.frame_size,
            out.core_spill_mask,
            out.fp_spill_mask,
            src_map,
            out.mapping_table,
            out.vmap_table,
            out.gc_map,
            out.cfi_info,
        ))
    }

    /// A fallback, or an error when the method was required to take
    /// the optimized path to the end.
    fn decline(
        &self,
        method: &MethodDescriptor,
        stage: CompileStage,
        cause: FallbackCause,
    ) -> Result<CompileOutcome, CompileError> {
        self.stats.lock().last_stage = stage;
        let escalate = self.options.require_optimized_path
            && self.matches_filter(&method.symbol)
            && !matches!(
                cause,
                FallbackCause::UnsupportedIsa(_) | FallbackCause::Filtered
            );
        if escalate {
            return Err(CompileError::OptimizedPathRequired {
                symbol: method.symbol.clone(),
                stage,
            });
        }
        Ok(CompileOutcome::Fallback(FallbackSignal { stage, cause }))
    }
}

impl<B: CodeBackend> MethodCompiler for OptimizingCompiler<B> {
    fn name(&self) -> &'static str {
        "optimizing"
    }

    fn try_compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<CompileOutcome, CompileError> {
        self.stats.lock().attempted += 1;

        let isa = self.backend.isa().normalize();
        if !isa.is_supported() {
            return self.decline(
                method,
                CompileStage::Unsupported,
                FallbackCause::UnsupportedIsa(isa),
            );
        }
        if !self.matches_filter(&method.symbol) {
            return self.decline(method, CompileStage::NotAttempted, FallbackCause::Filtered);
        }

        let mut graph = match GraphBuilder::build(method) {
            Ok(graph) => graph,
            Err(err) => {
                return self.decline(method, CompileStage::Build, FallbackCause::Build(err))
            }
        };
        self.dump(CompileStage::Build, &graph);

        // The analyses run on both paths; the allocator-less path still
        // exercises them before emitting baseline code.
        let dom = DominatorTree::build(&graph);
        dom.apply(&mut graph);
        let loops = find_natural_loops(&mut graph, &dom);
        self.dump(CompileStage::Dominance, &graph);
        ssa::convert(&mut graph, &dom);
        ssa::run_cleanup(&mut graph);
        self.dump(CompileStage::Ssa, &graph);
        if self.options.verify {
            verify::verify_ssa(&graph, &dom)?;
        }
        let liveness = Liveness::analyze(&graph, &loops);
        self.dump(CompileStage::Liveness, &graph);

        let out = if RegisterAllocator::can_allocate_for(&graph, isa) {
            let allocator = match RegisterAllocator::new(isa) {
                Some(allocator) => allocator,
                None => {
                    return self.decline(
                        method,
                        CompileStage::Allocation,
                        FallbackCause::Codegen(CodegenError::UnsupportedSet(isa)),
                    )
                }
            };
            let allocation = allocator.allocate(&liveness);
            if self.options.verify {
                verify::verify_allocation(&allocation, &liveness)?;
            }
            self.dump(CompileStage::Allocation, &graph);
            match self.backend.compile_optimized(&graph, &liveness, &allocation) {
                Ok(out) => out,
                Err(err) => {
                    return self.decline(method, CompileStage::Codegen, FallbackCause::Codegen(err))
                }
            }
        } else {
            // Allocation infeasibility: the backend's baseline entry
            // emits without a register assignment. When the caller
            // demanded the optimized path and the set does have an
            // allocator, the refusal came from the graph shape and is
            // escalated instead.
            if self.options.require_optimized_path
                && self.matches_filter(&method.symbol)
                && RegisterAllocator::supports(isa)
            {
                self.stats.lock().last_stage = CompileStage::Allocation;
                return Err(CompileError::OptimizedPathRequired {
                    symbol: method.symbol.clone(),
                    stage: CompileStage::Allocation,
                });
            }
            match self.backend.compile_baseline(&graph) {
                Ok(out) => out,
                Err(err) => {
                    return self.decline(method, CompileStage::Codegen, FallbackCause::Codegen(err))
                }
            }
        };

        let compiled = self.finish(isa, out, pool);
        self.stats.lock().last_stage = CompileStage::Artifact;
        Ok(CompileOutcome::Artifact(compiled))
    }

    fn compile(
        &self,
        method: &MethodDescriptor,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError> {
        match self.try_compile(method, pool)? {
            CompileOutcome::Artifact(compiled) => {
                self.stats.lock().optimized += 1;
                Ok(compiled)
            }
            CompileOutcome::Fallback(_) => {
                self.stats.lock().baseline += 1;
                self.delegate.compile(method, pool)
            }
        }
    }

    fn compile_native_stub(
        &self,
        pool: &MethodPool,
    ) -> Result<Box<CompiledMethod>, CompileError> {
        self.delegate.compile_native_stub(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::StubBackend;
    use crate::graph::builder::tests::method;
    use kova_bytecode::{BinOp, CondKind, Op, Slot};

    fn compiler(isa: InstructionSet, options: CompilerOptions) -> OptimizingCompiler<StubBackend> {
        OptimizingCompiler::new(StubBackend::new(isa).unwrap(), options)
    }

    fn loop_method() -> kova_bytecode::MethodDescriptor {
        method(
            vec![
                Op::ConstI32 { dest: Slot(0), value: 0 },
                Op::Binary { op: BinOp::Add, dest: Slot(0), lhs: Slot(0), rhs: Slot(0) },
                Op::If { cond: CondKind::Lt, lhs: Slot(0), rhs: Slot(0), target: 1 },
                Op::ReturnValue { src: Slot(0) },
            ],
            1,
            0,
        )
    }

    #[test]
    fn test_simple_method_takes_the_optimized_path() {
        let compiler = compiler(InstructionSet::X86_64, CompilerOptions::default());
        let pool = MethodPool::new();
        let outcome = compiler.try_compile(&loop_method(), &pool).unwrap();
        let compiled = match outcome {
            CompileOutcome::Artifact(compiled) => compiled,
            CompileOutcome::Fallback(signal) => panic!("unexpected fallback: {signal:?}"),
        };
        assert_eq!(compiled.instruction_set(), InstructionSet::X86_64);
        assert!(!compiled.code().is_empty());
        assert_eq!(compiled.frame_size_in_bytes() % 16, 0);
    }

    #[test]
    fn test_declined_construct_falls_back_to_the_delegate() {
        let m = method(
            vec![Op::MonitorEnter { src: Slot(0) }, Op::Return],
            1,
            0,
        );
        let compiler = compiler(InstructionSet::X86_64, CompilerOptions::default());
        let pool = MethodPool::new();
        match compiler.try_compile(&m, &pool).unwrap() {
            CompileOutcome::Fallback(signal) => {
                assert_eq!(signal.stage, CompileStage::Build);
                assert!(matches!(signal.cause, FallbackCause::Build(_)));
            }
            CompileOutcome::Artifact(_) => panic!("monitor ops must decline"),
        }
        // The unconditional entry still produces code.
        let compiled = compiler.compile(&m, &pool).unwrap();
        assert!(!compiled.code().is_empty());
        let stats = compiler.stats();
        assert_eq!(stats.baseline, 1);
        assert_eq!(stats.optimized, 0);
    }

    #[test]
    fn test_allocator_less_set_still_produces_an_artifact() {
        // Thumb2 has no register file, so the backend's baseline
        // entry emits the code, still through the full set of
        // analyses.
        let compiler = compiler(InstructionSet::Arm32, CompilerOptions::default());
        let pool = MethodPool::new();
        match compiler.try_compile(&loop_method(), &pool).unwrap() {
            CompileOutcome::Artifact(compiled) => {
                assert_eq!(compiled.instruction_set(), InstructionSet::Thumb2);
                assert_eq!(compiled.core_spill_mask(), 0);
                // Thumb2 entry points carry the encoding bit.
                assert_eq!(compiled.entry_pointer(0x1000) & 1, 1);
            }
            CompileOutcome::Fallback(signal) => panic!("unexpected fallback: {signal:?}"),
        }
    }

    #[test]
    fn test_required_optimized_path_turns_fallback_into_an_error() {
        let m = method(
            vec![Op::MonitorEnter { src: Slot(0) }, Op::Return],
            1,
            0,
        );
        let options = CompilerOptions {
            require_optimized_path: true,
            ..CompilerOptions::default()
        };
        let compiler = compiler(InstructionSet::X86_64, options);
        let pool = MethodPool::new();
        let err = compiler.compile(&m, &pool).unwrap_err();
        assert!(matches!(
            err,
            CompileError::OptimizedPathRequired { stage: CompileStage::Build, .. }
        ));
    }

    #[test]
    fn test_required_optimized_path_rejects_handler_refusals() {
        let mut m = method(
            vec![
                Op::ConstI32 { dest: Slot(0), value: 1 },
                Op::ReturnValue { src: Slot(0) },
            ],
            1,
            0,
        );
        m.handlers.push(kova_bytecode::ExceptionHandler {
            try_start: 0,
            try_end: 2,
            handler: 1,
        });
        let options = CompilerOptions {
            require_optimized_path: true,
            ..CompilerOptions::default()
        };
        let strict = compiler(InstructionSet::X86_64, options);
        let pool = MethodPool::new();
        let err = strict.try_compile(&m, &pool).unwrap_err();
        assert!(matches!(
            err,
            CompileError::OptimizedPathRequired { stage: CompileStage::Allocation, .. }
        ));
        // Without the requirement the same method produces an artifact
        // through the baseline emission path.
        let relaxed = compiler(InstructionSet::X86_64, CompilerOptions::default());
        assert!(matches!(
            relaxed.try_compile(&m, &pool).unwrap(),
            CompileOutcome::Artifact(_)
        ));
    }

    #[test]
    fn test_name_filter_routes_other_methods_to_baseline() {
        let options = CompilerOptions {
            name_filter: "hot_".to_string(),
            ..CompilerOptions::default()
        };
        let compiler = compiler(InstructionSet::X86_64, options);
        let pool = MethodPool::new();
        match compiler.try_compile(&loop_method(), &pool).unwrap() {
            CompileOutcome::Fallback(signal) => {
                assert_eq!(signal.stage, CompileStage::NotAttempted);
                assert!(matches!(signal.cause, FallbackCause::Filtered));
            }
            CompileOutcome::Artifact(_) => panic!("filtered method must not compile"),
        }
    }

    #[test]
    fn test_graph_dumps_cover_each_stage() {
        let options = CompilerOptions {
            enable_graph_dump: true,
            ..CompilerOptions::default()
        };
        let compiler = compiler(InstructionSet::X86_64, options);
        let pool = MethodPool::new();
        compiler.compile(&loop_method(), &pool).unwrap();
        let dumps = compiler.take_dumps();
        let stages: Vec<CompileStage> = dumps.iter().map(|d| d.stage).collect();
        assert_eq!(
            stages,
            vec![
                CompileStage::Build,
                CompileStage::Dominance,
                CompileStage::Ssa,
                CompileStage::Liveness,
                CompileStage::Allocation,
            ]
        );
        assert!(dumps.iter().all(|d| d.text.contains("bb0")));
        assert!(compiler.take_dumps().is_empty());
    }

    #[test]
    fn test_stats_record_the_reached_stage() {
        let compiler = compiler(InstructionSet::X86_64, CompilerOptions::default());
        let pool = MethodPool::new();
        assert_eq!(compiler.stats().last_stage, CompileStage::NotAttempted);
        compiler.compile(&loop_method(), &pool).unwrap();
        assert_eq!(compiler.stats().last_stage, CompileStage::Artifact);
        let declined = method(
            vec![Op::MonitorEnter { src: Slot(0) }, Op::Return],
            1,
            0,
        );
        compiler.compile(&declined, &pool).unwrap();
        assert_eq!(compiler.stats().last_stage, CompileStage::Build);
    }

    struct NoBackend;

    impl CodeBackend for NoBackend {
        fn name(&self) -> &'static str {
            "none"
        }

        fn isa(&self) -> InstructionSet {
            InstructionSet::Riscv64
        }

        fn compile_optimized(
            &self,
            _graph: &Graph,
            _liveness: &Liveness,
            _allocation: &crate::regalloc::Allocation,
        ) -> Result<CodeOutput, CodegenError> {
            Err(CodegenError::UnsupportedSet(InstructionSet::Riscv64))
        }

        fn compile_baseline(&self, _graph: &Graph) -> Result<CodeOutput, CodegenError> {
            Err(CodegenError::UnsupportedSet(InstructionSet::Riscv64))
        }
    }

    #[test]
    fn test_unsupported_set_never_reaches_graph_construction() {
        let compiler = OptimizingCompiler::new(NoBackend, CompilerOptions::default());
        let pool = MethodPool::new();
        match compiler.try_compile(&loop_method(), &pool).unwrap() {
            CompileOutcome::Fallback(signal) => {
                assert_eq!(signal.stage, CompileStage::Unsupported);
                assert!(matches!(
                    signal.cause,
                    FallbackCause::UnsupportedIsa(InstructionSet::Riscv64)
                ));
            }
            CompileOutcome::Artifact(_) => panic!("riscv64 has no backend"),
        }
        // The delegate cannot emit for it either, so the unconditional
        // entry reports the set as unsupported.
        assert!(matches!(
            compiler.compile(&loop_method(), &pool),
            Err(CompileError::Unsupported(InstructionSet::Riscv64))
        ));
    }
}
