//! Method descriptors as produced by the decoder/verifier.

use serde::{Deserialize, Serialize};

use crate::op::Op;

/// Access flags on a method, as a raw bit set from the unit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const PUBLIC: u32 = 0x0001;
    pub const STATIC: u32 = 0x0008;
    pub const SYNCHRONIZED: u32 = 0x0020;
    pub const NATIVE: u32 = 0x0100;

    pub fn is_static(self) -> bool {
        self.0 & Self::STATIC != 0
    }

    pub fn is_native(self) -> bool {
        self.0 & Self::NATIVE != 0
    }
}

/// How a method is invoked at its call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeType {
    Static,
    Direct,
    Virtual,
}

/// One resolved bytecode instruction with its source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instr {
    /// Byte offset of this instruction inside the method body.
    pub offset: u32,
    /// Source line this instruction was compiled from.
    pub line: u32,
    pub op: Op,
}

/// A catch handler covering a half-open range of bytecode offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub try_start: u32,
    pub try_end: u32,
    /// Bytecode offset of the handler entry.
    pub handler: u32,
}

impl ExceptionHandler {
    /// Whether an instruction at `offset` is covered by this handler.
    pub fn covers(&self, offset: u32) -> bool {
        self.try_start <= offset && offset < self.try_end
    }
}

/// A verified method, keyed by (method index, defining unit).
///
/// The compiler borrows a descriptor read-only for the duration of one
/// compile; nothing in it is mutated or retained afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    /// Index in the defining unit's method table.
    pub method_index: u32,
    /// Index of the defining unit file.
    pub unit_index: u32,
    /// Mangled symbol name, for diagnostics and dump filtering.
    pub symbol: String,
    pub access_flags: AccessFlags,
    pub invoke_type: InvokeType,
    /// Total frame slots, parameters included.
    pub num_slots: u16,
    /// Parameter count; parameters live in the last `num_params` slots.
    pub num_params: u16,
    pub instrs: Vec<Instr>,
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodDescriptor {
    /// Instruction at an exact bytecode offset, if one starts there.
    pub fn instr_at(&self, offset: u32) -> Option<&Instr> {
        self.instrs.iter().find(|i| i.offset == offset)
    }

    /// Offset one past the last instruction.
    pub fn code_end(&self) -> u32 {
        self.instrs.last().map(|i| i.offset + 1).unwrap_or(0)
    }

    /// Handlers covering the given offset.
    pub fn handlers_for(&self, offset: u32) -> impl Iterator<Item = &ExceptionHandler> {
        self.handlers.iter().filter(move |h| h.covers(offset))
    }
}
