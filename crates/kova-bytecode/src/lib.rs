//! Validated bytecode method definitions for the Kova VM.
//!
//! The decoder/verifier service produces methods in this form: every operand
//! is resolved, every branch target points at a real instruction, and the
//! exception-handler table is consistent with the instruction stream. The
//! ahead-of-time compiler consumes these types read-only, one method at a
//! time.

pub mod method;
pub mod op;

pub use method::{AccessFlags, ExceptionHandler, Instr, InvokeType, MethodDescriptor};
pub use op::{BinOp, CondKind, Op, Slot, UnOp};
