//! The relocatable code package produced by one compile batch.

use crate::records::{
    CallFarJump, CallSite, CallSiteTarget, CodeLabel, CodeRange, MemoryAccess, SymbolicAccess,
    TrapFarJump,
};

/// Raw machine bytes plus the relocation records the link editor needs to
/// place them in the aggregate buffer.
///
/// All offsets are relative to `bytes[0]`. `call_sites` and
/// `call_site_targets` are parallel arrays; targets are *not* offsets and
/// are never shifted.
#[derive(Debug, Default)]
pub struct CompiledCode {
    pub bytes: Vec<u8>,
    pub code_ranges: Vec<CodeRange>,
    pub call_sites: Vec<CallSite>,
    pub call_site_targets: Vec<CallSiteTarget>,
    pub memory_accesses: Vec<MemoryAccess>,
    pub symbolic_accesses: Vec<SymbolicAccess>,
    pub code_labels: Vec<CodeLabel>,
    pub call_far_jumps: Vec<CallFarJump>,
    pub trap_far_jumps: Vec<TrapFarJump>,
}

impl CompiledCode {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
            && self.code_ranges.is_empty()
            && self.call_sites.is_empty()
            && self.call_site_targets.is_empty()
            && self.memory_accesses.is_empty()
            && self.symbolic_accesses.is_empty()
            && self.code_labels.is_empty()
            && self.call_far_jumps.is_empty()
            && self.trap_far_jumps.is_empty()
    }

    /// Empty the package, retaining capacity for the next batch.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.code_ranges.clear();
        self.call_sites.clear();
        self.call_site_targets.clear();
        self.memory_accesses.clear();
        self.symbolic_accesses.clear();
        self.code_labels.clear();
        self.call_far_jumps.clear();
        self.trap_far_jumps.clear();
    }
}
