//! Resolved bytecode operations.
//!
//! Kova bytecode is register based: instructions read and write local
//! variable slots. By the time a method reaches the compiler all operands
//! have been resolved by the verifier, so operations carry typed fields
//! instead of raw immediates.

use serde::{Deserialize, Serialize};

/// A local variable slot in a method frame.
///
/// Parameters occupy the highest-numbered slots, like the interpreter frame
/// lays them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot(pub u16);

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Comparison condition for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CondKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Binary arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

/// Unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// A single resolved bytecode operation.
///
/// `PackedSwitch` and the monitor operations are valid bytecode that the
/// optimizing pipeline does not model; its graph builder declines them and
/// the method is handed to the baseline compiler instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Load a 32-bit integer constant into a slot.
    ConstI32 { dest: Slot, value: i32 },
    /// Copy one slot into another.
    Move { dest: Slot, src: Slot },
    /// Unary operation on a slot.
    Unary { op: UnOp, dest: Slot, src: Slot },
    /// Binary operation on two slots.
    Binary { op: BinOp, dest: Slot, lhs: Slot, rhs: Slot },
    /// Allocate a new heap reference of a resolved type.
    NewRef { dest: Slot, type_index: u32 },
    /// Compare two slots and branch to `target` when the condition holds.
    If { cond: CondKind, lhs: Slot, rhs: Slot, target: u32 },
    /// Unconditional branch.
    Goto { target: u32 },
    /// Return void.
    Return,
    /// Return the value in `src`.
    ReturnValue { src: Slot },
    /// Throw the reference in `src`.
    Throw { src: Slot },
    /// Multi-way branch on the value in `src`.
    PackedSwitch { src: Slot, targets: Vec<u32> },
    /// Enter the monitor of the reference in `src`.
    MonitorEnter { src: Slot },
    /// Exit the monitor of the reference in `src`.
    MonitorExit { src: Slot },
}

impl Op {
    /// The slot this operation writes, if any.
    pub fn defines(&self) -> Option<Slot> {
        match self {
            Op::ConstI32 { dest, .. }
            | Op::Move { dest, .. }
            | Op::Unary { dest, .. }
            | Op::Binary { dest, .. }
            | Op::NewRef { dest, .. } => Some(*dest),
            _ => None,
        }
    }

    /// The slots this operation reads, in operand order.
    pub fn uses(&self) -> Vec<Slot> {
        match self {
            Op::Move { src, .. }
            | Op::Unary { src, .. }
            | Op::ReturnValue { src }
            | Op::Throw { src }
            | Op::PackedSwitch { src, .. }
            | Op::MonitorEnter { src }
            | Op::MonitorExit { src } => vec![*src],
            Op::Binary { lhs, rhs, .. } | Op::If { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::ConstI32 { .. } | Op::NewRef { .. } | Op::Goto { .. } | Op::Return => vec![],
        }
    }

    /// Branch targets of this operation, empty for straight-line code.
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            Op::If { target, .. } | Op::Goto { target } => vec![*target],
            Op::PackedSwitch { targets, .. } => targets.clone(),
            _ => vec![],
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Goto { .. } | Op::Return | Op::ReturnValue { .. } | Op::Throw { .. }
        )
    }

    /// Whether this operation ends the current basic block.
    pub fn ends_block(&self) -> bool {
        self.is_terminator() || matches!(self, Op::If { .. } | Op::PackedSwitch { .. })
    }

    /// Whether the written value is a heap reference.
    pub fn defines_ref(&self) -> bool {
        matches!(self, Op::NewRef { .. })
    }

    /// Mnemonic for diagnostics.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::ConstI32 { .. } => "const.i32",
            Op::Move { .. } => "move",
            Op::Unary { .. } => "unary",
            Op::Binary { .. } => "binary",
            Op::NewRef { .. } => "new.ref",
            Op::If { .. } => "if",
            Op::Goto { .. } => "goto",
            Op::Return => "return",
            Op::ReturnValue { .. } => "return.value",
            Op::Throw { .. } => "throw",
            Op::PackedSwitch { .. } => "packed.switch",
            Op::MonitorEnter { .. } => "monitor.enter",
            Op::MonitorExit { .. } => "monitor.exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defines_and_uses() {
        let op = Op::Binary {
            op: BinOp::Add,
            dest: Slot(0),
            lhs: Slot(1),
            rhs: Slot(2),
        };
        assert_eq!(op.defines(), Some(Slot(0)));
        assert_eq!(op.uses(), vec![Slot(1), Slot(2)]);
        assert!(!op.ends_block());
    }

    #[test]
    fn test_branch_targets() {
        let op = Op::If {
            cond: CondKind::Lt,
            lhs: Slot(0),
            rhs: Slot(1),
            target: 24,
        };
        assert_eq!(op.branch_targets(), vec![24]);
        assert!(op.ends_block());
        assert!(!op.is_terminator());

        let sw = Op::PackedSwitch {
            src: Slot(0),
            targets: vec![8, 16, 24],
        };
        assert_eq!(sw.branch_targets(), vec![8, 16, 24]);
    }

    #[test]
    fn test_terminators() {
        assert!(Op::Return.is_terminator());
        assert!(Op::ReturnValue { src: Slot(0) }.is_terminator());
        assert!(Op::Goto { target: 0 }.is_terminator());
        assert!(Op::Throw { src: Slot(0) }.is_terminator());
        assert!(!Op::MonitorEnter { src: Slot(0) }.is_terminator());
    }

    #[test]
    fn test_defines_ref() {
        assert!(Op::NewRef { dest: Slot(3), type_index: 7 }.defines_ref());
        assert!(!Op::ConstI32 { dest: Slot(3), value: 7 }.defines_ref());
    }
}
