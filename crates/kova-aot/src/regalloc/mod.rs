//! Linear scan register allocation over liveness intervals.
//!
//! Allocation is per instruction set: sets without a register file
//! here cannot take the optimized path at all, and graphs with
//! exception handler edges are declined because ranges that must
//! survive a throw are pinned to the frame.

use rustc_hash::FxHashMap;

use crate::analysis::liveness::{LiveInterval, Liveness};
use crate::artifact::InstructionSet;
use crate::graph::{Graph, ValueRef};

/// The allocatable registers of one instruction set.
pub struct RegisterFile {
    pub isa: InstructionSet,
    /// Register numbers handed out by the allocator, in preference order.
    pub allocatable: Vec<u8>,
    /// Bit per register number that the callee must preserve.
    pub callee_saved: u32,
    /// Native word size in bytes.
    pub word_size: u32,
}

impl RegisterFile {
    /// The register file for `isa`, or `None` when the set has no
    /// allocator support.
    pub fn for_isa(isa: InstructionSet) -> Option<RegisterFile> {
        match isa {
            InstructionSet::X86_64 => Some(RegisterFile {
                isa,
                // rax, rcx, rdx, rbx, rsi, rdi, r8-r11. rsp and rbp
                // are frame registers, r12-r15 are reserved for the
                // runtime.
                allocatable: vec![0, 1, 2, 3, 6, 7, 8, 9, 10, 11],
                callee_saved: 1 << 3,
                word_size: 8,
            }),
            InstructionSet::Arm64 => Some(RegisterFile {
                isa,
                // x0-x7 scratch plus x19-x22 callee-saved.
                allocatable: vec![0, 1, 2, 3, 4, 5, 6, 7, 19, 20, 21, 22],
                callee_saved: (1 << 19) | (1 << 20) | (1 << 21) | (1 << 22),
                word_size: 8,
            }),
            InstructionSet::Arm32
            | InstructionSet::Thumb2
            | InstructionSet::Riscv64 => None,
        }
    }

    fn is_callee_saved(&self, register: u8) -> bool {
        self.callee_saved & (1u32 << register) != 0
    }
}

/// Where a value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(u8),
    /// Word-sized frame slot, numbered from the start of the spill area.
    StackSlot(u32),
}

/// Result of register allocation for one method.
pub struct Allocation {
    pub locations: FxHashMap<ValueRef, Location>,
    pub num_spill_slots: u32,
    /// Callee-saved core registers the method uses.
    pub core_spill_mask: u32,
    /// Always zero: values are integer or reference words.
    pub fp_spill_mask: u32,
    /// Frame size in bytes, 16-byte aligned, covering the return
    /// address, saved frame pointer and the spill area.
    pub frame_size: u32,
}

fn round_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

pub struct RegisterAllocator {
    file: RegisterFile,
}

impl RegisterAllocator {
    pub fn new(isa: InstructionSet) -> Option<RegisterAllocator> {
        RegisterFile::for_isa(isa).map(|file| RegisterAllocator { file })
    }

    pub fn with_file(file: RegisterFile) -> RegisterAllocator {
        RegisterAllocator { file }
    }

    /// Whether the allocator has a register file for `isa`.
    pub fn supports(isa: InstructionSet) -> bool {
        RegisterFile::for_isa(isa).is_some()
    }

    /// Whether this graph can go through register allocation on `isa`.
    pub fn can_allocate_for(graph: &Graph, isa: InstructionSet) -> bool {
        Self::supports(isa) && !graph.has_handler_edges
    }

    /// Linear scan over the intervals, which arrive sorted by start.
    /// When no register is free, the candidate with the furthest next
    /// use is spilled to a fresh stack slot.
    pub fn allocate(&self, liveness: &Liveness) -> Allocation {
        let intervals = &liveness.intervals;
        let mut locations: FxHashMap<ValueRef, Location> = FxHashMap::default();
        let mut free: Vec<u8> = self.file.allocatable.clone();
        // Indices into `intervals` currently holding a register.
        let mut active: Vec<usize> = Vec::new();
        let mut num_spill_slots = 0u32;
        let mut used_registers = 0u32;

        for (index, interval) in intervals.iter().enumerate() {
            // Expire intervals that ended before this one starts.
            let mut still_active = Vec::with_capacity(active.len());
            for a in active {
                if intervals[a].end < interval.start {
                    if let Some(Location::Register(r)) = locations.get(&intervals[a].value) {
                        free.push(*r);
                    }
                } else {
                    still_active.push(a);
                }
            }
            active = still_active;
            free.sort_unstable();

            if !free.is_empty() {
                let register = free.remove(0);
                used_registers |= 1u32 << register;
                locations.insert(interval.value, Location::Register(register));
                active.push(index);
                continue;
            }

            // All registers taken. Spill whichever candidate is used
            // again furthest from here.
            let next_use = |i: &LiveInterval| {
                i.next_use_after(interval.start).unwrap_or(usize::MAX)
            };
            let mut victim: Option<usize> = None;
            for &a in &active {
                let better = match victim {
                    Some(v) => next_use(&intervals[a]) > next_use(&intervals[v]),
                    None => true,
                };
                if better {
                    victim = Some(a);
                }
            }
            match victim {
                Some(v) if next_use(&intervals[v]) > next_use(interval) => {
                    let register = match locations.get(&intervals[v].value) {
                        Some(Location::Register(r)) => *r,
                        _ => continue,
                    };
                    locations.insert(intervals[v].value, Location::StackSlot(num_spill_slots));
                    num_spill_slots += 1;
                    locations.insert(interval.value, Location::Register(register));
                    active.retain(|&a| a != v);
                    active.push(index);
                }
                _ => {
                    locations.insert(interval.value, Location::StackSlot(num_spill_slots));
                    num_spill_slots += 1;
                }
            }
        }

        let core_spill_mask = used_registers & self.file.callee_saved;
        let word = self.file.word_size;
        // Return address and saved frame pointer, then callee saves,
        // then the spill area.
        let saved = core_spill_mask.count_ones();
        let frame_size = round_up(2 * word + saved * word + num_spill_slots * word, 16);

        Allocation {
            locations,
            num_spill_slots,
            core_spill_mask,
            fp_spill_mask: 0,
            frame_size,
        }
    }

    pub fn register_file(&self) -> &RegisterFile {
        &self.file
    }

    pub fn is_callee_saved(&self, register: u8) -> bool {
        self.file.is_callee_saved(register)
    }
}
