//! Ahead-of-time optimizing compiler for Kova bytecode methods.
//!
//! The pipeline builds a control-flow graph from a validated method,
//! converts it to SSA form, runs liveness and linear scan register
//! allocation, and hands the result to a code backend. Methods the
//! optimized path cannot take are compiled by a baseline fallback, so
//! compilation succeeds for every method on a supported instruction
//! set.
//!
//! ```
//! use kova_aot::artifact::{InstructionSet, MethodPool};
//! use kova_aot::codegen::StubBackend;
//! use kova_aot::pipeline::{CompilerOptions, MethodCompiler, OptimizingCompiler};
//! # use kova_bytecode::{AccessFlags, InvokeType, MethodDescriptor};
//! # let method = MethodDescriptor {
//! #     method_index: 0,
//! #     unit_index: 0,
//! #     symbol: "demo".to_string(),
//! #     access_flags: AccessFlags(AccessFlags::PUBLIC),
//! #     invoke_type: InvokeType::Static,
//! #     num_slots: 0,
//! #     num_params: 0,
//! #     instrs: vec![],
//! #     handlers: vec![],
//! # };
//!
//! let backend = StubBackend::new(InstructionSet::X86_64).unwrap();
//! let compiler = OptimizingCompiler::new(backend, CompilerOptions::default());
//! let pool = MethodPool::new();
//! let compiled = compiler.compile(&method, &pool).unwrap();
//! assert!(!compiled.code().is_empty());
//! ```

pub mod analysis;
pub mod artifact;
pub mod codegen;
pub mod graph;
pub mod pipeline;
pub mod regalloc;
pub mod ssa;
pub mod verify;

pub use artifact::{CompiledMethod, InstructionSet, MethodPool};
pub use pipeline::{
    BaselineCompiler, CompileError, CompileOutcome, CompileStage, CompilerOptions,
    FallbackCause, FallbackSignal, MethodCompiler, OptimizingCompiler,
};
