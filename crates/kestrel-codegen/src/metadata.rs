//! Per-tier and module-wide metadata assembled during generation.

use kestrel_env::{
    CustomSection, GlobalDesc, MemoryUsage, Sig, SigWithId, TableDesc, Tier, ValType,
};
use kestrel_masm::{CallSite, CodeRange, MemoryAccess, SymbolicAddress};

use crate::error::{CodegenError, Result};
use crate::PAGE_SIZE;

/// A slot written at most once per generation. Double writes are
/// programming errors and abort in debug builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOnce<T>(Option<T>);

impl<T: Copy> SetOnce<T> {
    pub fn set(&mut self, value: T) {
        debug_assert!(self.0.is_none(), "set-once slot written twice");
        self.0 = Some(value);
    }

    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.0
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Monotonic allocator laying out the module's global-data area.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalDataLayout {
    length: u32,
}

impl GlobalDataLayout {
    /// Allocate `bytes` at a multiple of `align`, returning the offset.
    /// Overflow surfaces as OOM; the area cannot exceed `u32` range.
    pub fn allocate(&mut self, bytes: u32, align: u32) -> Result<u32> {
        debug_assert!(align.is_power_of_two());
        let misalign = self.length % align;
        let padding = if misalign == 0 { 0 } else { align - misalign };
        let offset = self
            .length
            .checked_add(padding)
            .ok_or(CodegenError::OutOfMemory)?;
        self.length = offset
            .checked_add(bytes)
            .ok_or(CodegenError::OutOfMemory)?;
        Ok(offset)
    }

    /// Round the total length up to the system page size, as required by
    /// the instance allocator.
    pub fn page_align(&mut self) {
        self.length = self.length.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }
}

/// An imported function's metadata: its TLS-area slot and the offsets of
/// its two exit stubs, filled in as the stub package is merged.
#[derive(Debug)]
pub struct FuncImport {
    pub sig: Sig,
    pub tls_data_offset: u32,
    pub interp_exit_offset: SetOnce<u32>,
    pub jit_exit_offset: SetOnce<u32>,
}

impl FuncImport {
    #[must_use]
    pub fn new(sig: Sig, tls_data_offset: u32) -> Self {
        Self {
            sig,
            tls_data_offset,
            interp_exit_offset: SetOnce::default(),
            jit_exit_offset: SetOnce::default(),
        }
    }
}

/// An exported function's metadata. The vector is sorted by function index
/// at finalization so runtime lookup is O(log n); the entry offset is
/// filled in when the stub package's Entry range is merged.
#[derive(Debug)]
pub struct FuncExport {
    pub sig: Sig,
    pub func_index: u32,
    pub entry_offset: SetOnce<u32>,
    pub code_range_index: Option<u32>,
}

impl FuncExport {
    #[must_use]
    pub fn new(sig: Sig, func_index: u32) -> Self {
        Self {
            sig,
            func_index,
            entry_offset: SetOnce::default(),
            code_range_index: None,
        }
    }
}

/// Metadata for one compiled tier.
#[derive(Debug)]
pub struct MetadataTier {
    pub tier: Tier,
    /// Sorted ascending by `begin`; merges always append ahead.
    pub code_ranges: Vec<CodeRange>,
    /// Sorted ascending by return-address offset.
    pub call_sites: Vec<CallSite>,
    pub memory_accesses: Vec<MemoryAccess>,
    pub func_imports: Vec<FuncImport>,
    /// Sorted ascending by function index once built.
    pub func_exports: Vec<FuncExport>,
    /// Sorted ascending; one entry per emitted debug far-jump island.
    pub debug_trap_far_jump_offsets: Vec<u32>,
    /// Function index → code-range index, preserved only for debugging.
    pub debug_func_to_code_range: Vec<u32>,
}

impl MetadataTier {
    #[must_use]
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            code_ranges: Vec::new(),
            call_sites: Vec::new(),
            memory_accesses: Vec::new(),
            func_imports: Vec::new(),
            func_exports: Vec::new(),
            debug_trap_far_jump_offsets: Vec::new(),
            debug_func_to_code_range: Vec::new(),
        }
    }

    /// The export record for `func_index`. The exports vector is sorted by
    /// function index, so this is a binary search.
    pub fn lookup_func_export_mut(&mut self, func_index: u32) -> &mut FuncExport {
        let at = self
            .func_exports
            .binary_search_by_key(&func_index, |fe| fe.func_index)
            .expect("function is not exported");
        &mut self.func_exports[at]
    }

    /// Drop the excess capacity left by the conservative reservations.
    pub fn shrink_to_fit(&mut self) {
        self.code_ranges.shrink_to_fit();
        self.call_sites.shrink_to_fit();
        self.memory_accesses.shrink_to_fit();
        self.debug_trap_far_jump_offsets.shrink_to_fit();
        self.debug_func_to_code_range.shrink_to_fit();
    }
}

/// A package-internal label resolved to absolute offsets, applied to the
/// code bytes at publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalLink {
    pub patch_at_offset: u32,
    pub target_offset: u32,
}

/// Patch locations referencing each symbolic (builtin) address, bound at
/// publication.
#[derive(Debug, Default)]
pub struct SymbolicLinks {
    links: [Vec<u32>; SymbolicAddress::COUNT],
}

impl SymbolicLinks {
    pub fn push(&mut self, target: SymbolicAddress, patch_at: u32) {
        self.links[target.index()].push(patch_at);
    }

    #[must_use]
    pub fn get(&self, target: SymbolicAddress) -> &[u32] {
        &self.links[target.index()]
    }
}

/// Link-time data for one tier, consumed by the code-segment publisher.
#[derive(Debug, Default)]
pub struct LinkDataTier {
    pub internal_links: Vec<InternalLink>,
    pub symbolic_links: SymbolicLinks,
    pub out_of_bounds_offset: SetOnce<u32>,
    pub unaligned_access_offset: SetOnce<u32>,
    pub interrupt_offset: SetOnce<u32>,
}

/// Debug-only extras carried when the module is generated with debugging
/// enabled.
#[derive(Debug, Default)]
pub struct DebugMetadata {
    /// Per function (imports included): argument types and return type.
    pub func_arg_types: Vec<Vec<ValType>>,
    pub func_return_types: Vec<Option<ValType>>,
    /// SHA-1 of the module bytecode, identifying the source.
    pub module_hash: [u8; 20],
}

/// Module-wide metadata, shared by all tiers.
#[derive(Debug)]
pub struct Metadata {
    /// Global-form signatures and their interned ids.
    pub sig_ids: Vec<SigWithId>,
    pub global_data: GlobalDataLayout,
    pub memory_usage: MemoryUsage,
    pub min_memory_length: u32,
    pub max_memory_length: Option<u32>,
    pub tables: Vec<TableDesc>,
    pub globals: Vec<GlobalDesc>,
    pub start_func_index: Option<u32>,
    pub filename: Option<String>,
    pub source_map_url: Option<String>,
    pub custom_sections: Vec<CustomSection>,
    pub debug: Option<DebugMetadata>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            sig_ids: Vec::new(),
            global_data: GlobalDataLayout::default(),
            memory_usage: MemoryUsage::None,
            min_memory_length: 0,
            max_memory_length: None,
            tables: Vec::new(),
            globals: Vec::new(),
            start_func_index: None,
            filename: None,
            source_map_url: None,
            custom_sections: Vec::new(),
            debug: None,
        }
    }
}
