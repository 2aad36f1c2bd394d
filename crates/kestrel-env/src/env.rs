//! The parsed-module environment handed to the code generator.

use crate::sig::{Sig, SigWithId, ValType};
use crate::{CompileMode, Tier};

/// Memory usage declared by the module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryUsage {
    #[default]
    None,
    Unshared,
    Shared,
}

/// Initial/maximum size limits for a table or memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// A table declaration.
///
/// `external` tables are imported or exported, so every function reachable
/// from one of their element segments is callable from outside the module
/// and must be treated as exported. The TLS-area slot offset is assigned by
/// the generator during initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDesc {
    pub external: bool,
    pub limits: Limits,
    pub global_data_offset: Option<u32>,
}

/// A global-variable declaration. Constant globals are folded into their use
/// sites and get no global-data slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalDesc {
    pub ty: ValType,
    pub mutable: bool,
    pub is_constant: bool,
    pub offset: Option<u32>,
}

impl GlobalDesc {
    #[must_use]
    pub fn variable(ty: ValType, mutable: bool) -> Self {
        Self {
            ty,
            mutable,
            is_constant: false,
            offset: None,
        }
    }

    #[must_use]
    pub fn constant(ty: ValType) -> Self {
        Self {
            ty,
            mutable: false,
            is_constant: true,
            offset: None,
        }
    }
}

/// What kind of definition an import or export refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Function,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub kind: DefinitionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub field: String,
    pub kind: DefinitionKind,
    pub index: u32,
}

impl Export {
    /// Index of the exported function. Only valid for function exports.
    #[must_use]
    pub fn func_index(&self) -> u32 {
        debug_assert_eq!(self.kind, DefinitionKind::Function);
        self.index
    }
}

/// An element segment: function indices written into a table at
/// instantiation. The per-tier code-range index array is populated by the
/// generator once every function has a code range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElemSegment {
    pub table_index: u32,
    pub offset: u32,
    pub elem_func_indices: Vec<u32>,
    elem_code_range_indices: [Vec<u32>; 2],
}

impl ElemSegment {
    #[must_use]
    pub fn new(table_index: u32, offset: u32, elem_func_indices: Vec<u32>) -> Self {
        Self {
            table_index,
            offset,
            elem_func_indices,
            elem_code_range_indices: [Vec::new(), Vec::new()],
        }
    }

    #[must_use]
    pub fn code_range_indices(&self, tier: Tier) -> &[u32] {
        &self.elem_code_range_indices[tier_slot(tier)]
    }

    pub fn code_range_indices_mut(&mut self, tier: Tier) -> &mut Vec<u32> {
        &mut self.elem_code_range_indices[tier_slot(tier)]
    }
}

fn tier_slot(tier: Tier) -> usize {
    match tier {
        Tier::Baseline => 0,
        Tier::Optimized => 1,
    }
}

/// A data segment copied into linear memory at instantiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// A custom (name, bytes) section preserved in the module metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Everything the parser knows about a module, in the shape the generator
/// consumes it.
///
/// Function indices cover imports first, then definitions:
/// `0..num_func_imports` are imports, the rest are defined in this module.
/// The generator snapshots the environment once signature ids and
/// global-data offsets are assigned, so worker threads read a stable copy.
#[derive(Debug, Clone)]
pub struct ModuleEnvironment {
    pub mode: CompileMode,
    pub tier: Tier,
    pub debug_enabled: bool,

    pub sigs: Vec<SigWithId>,
    /// Function index → index into `sigs`.
    pub func_sigs: Vec<u32>,
    pub num_func_imports: u32,
    /// Per-import TLS-area offset, assigned by the generator.
    pub func_import_global_data_offsets: Vec<Option<u32>>,

    pub tables: Vec<TableDesc>,
    pub globals: Vec<GlobalDesc>,
    pub imports: Vec<Import>,
    pub exports: Vec<Export>,
    pub elem_segments: Vec<ElemSegment>,
    pub data_segments: Vec<DataSegment>,
    pub custom_sections: Vec<CustomSection>,

    pub memory_usage: MemoryUsage,
    pub min_memory_length: u32,
    pub max_memory_length: Option<u32>,
    pub start_func_index: Option<u32>,
}

impl ModuleEnvironment {
    #[must_use]
    pub fn new(mode: CompileMode, tier: Tier, debug_enabled: bool) -> Self {
        Self {
            mode,
            tier,
            debug_enabled,
            sigs: Vec::new(),
            func_sigs: Vec::new(),
            num_func_imports: 0,
            func_import_global_data_offsets: Vec::new(),
            tables: Vec::new(),
            globals: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            elem_segments: Vec::new(),
            data_segments: Vec::new(),
            custom_sections: Vec::new(),
            memory_usage: MemoryUsage::None,
            min_memory_length: 0,
            max_memory_length: None,
            start_func_index: None,
        }
    }

    /// Total function count, imports included.
    #[must_use]
    pub fn num_funcs(&self) -> u32 {
        self.func_sigs.len() as u32
    }

    /// Number of functions defined (not imported) by this module.
    #[must_use]
    pub fn num_func_defs(&self) -> u32 {
        self.num_funcs() - self.num_func_imports
    }

    #[must_use]
    pub fn func_is_import(&self, func_index: u32) -> bool {
        func_index < self.num_func_imports
    }

    #[must_use]
    pub fn func_sig(&self, func_index: u32) -> &SigWithId {
        &self.sigs[self.func_sigs[func_index as usize] as usize]
    }

    /// Declares a function with signature `sig_index`, returning its index.
    pub fn push_func(&mut self, sig_index: u32) -> u32 {
        debug_assert!((sig_index as usize) < self.sigs.len());
        let func_index = self.num_funcs();
        self.func_sigs.push(sig_index);
        func_index
    }

    /// Declares an imported function. Must precede all `push_func` calls so
    /// imports occupy the low function indices.
    pub fn push_func_import(&mut self, sig_index: u32, module: &str, field: &str) -> u32 {
        debug_assert_eq!(
            self.num_func_imports,
            self.num_funcs(),
            "function imports must be declared before defined functions"
        );
        let func_index = self.push_func(sig_index);
        self.num_func_imports += 1;
        self.func_import_global_data_offsets.push(None);
        self.imports.push(Import {
            module: module.to_string(),
            field: field.to_string(),
            kind: DefinitionKind::Function,
        });
        func_index
    }

    pub fn push_sig(&mut self, sig: Sig) -> u32 {
        let sig_index = self.sigs.len() as u32;
        self.sigs.push(SigWithId::from(sig));
        sig_index
    }
}
