//! Native-pc to source-line map carried with a compiled method.

/// One mapping from a native pc offset to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrcMapEntry {
    pub from: u32,
    pub to: i32,
}

impl SrcMapEntry {
    /// Total order used by [`SrcMap::arrange`]: line first, pc second.
    fn sort_key(self) -> i64 {
        ((self.to as i64) << 32) | self.from as i64
    }
}

/// A pc-to-line table. Built in emission order, then either arranged
/// for lookup by line or rewritten into delta form for storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SrcMap {
    entries: Vec<SrcMapEntry>,
}

impl SrcMap {
    pub fn new() -> SrcMap {
        SrcMap::default()
    }

    pub fn push(&mut self, from: u32, to: i32) {
        self.entries.push(SrcMapEntry { from, to });
    }

    pub fn entries(&self) -> &[SrcMapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sort by (line, pc) and drop exact duplicates.
    pub fn arrange(&mut self) -> &mut SrcMap {
        if !self.entries.is_empty() {
            self.entries.sort_by_key(|e| e.sort_key());
            self.entries.dedup();
        }
        self
    }

    /// First entry for `to`, after [`SrcMap::arrange`].
    pub fn find_by_to(&self, to: i32) -> Option<&SrcMapEntry> {
        let probe = SrcMapEntry { from: 0, to };
        let index = self
            .entries
            .partition_point(|e| e.sort_key() < probe.sort_key());
        self.entries.get(index).filter(|e| e.to == to)
    }

    /// Rewrite the table in place as deltas for compact storage.
    ///
    /// Entries are ordered by pc first. Entries at or past `highest_pc`
    /// describe code that was trimmed away and are dropped. Each
    /// remaining entry then holds the difference from its predecessor,
    /// with the first entry relative to `start`.
    pub fn delta_format(&mut self, start: SrcMapEntry, highest_pc: u32) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.sort_by_key(|e| e.from);
        self.entries.retain(|e| e.from < highest_pc);
        if self.entries.is_empty() {
            return;
        }
        for i in (1..self.entries.len()).rev() {
            self.entries[i].from -= self.entries[i - 1].from;
            self.entries[i].to -= self.entries[i - 1].to;
        }
        debug_assert!(self.entries[0].from >= start.from);
        self.entries[0].from -= start.from;
        self.entries[0].to -= start.to;
    }
}
