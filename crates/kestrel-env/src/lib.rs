//! Module-level value types and the [`ModuleEnvironment`] consumed by the
//! kestrel module code generator.
//!
//! The environment is produced by the binary parser (not part of this
//! workspace): an ordered signature list, the function-index → signature
//! mapping, imports/exports, tables, globals, element and data segments,
//! memory limits, and the compilation mode/tier. The generator mutates it
//! in a single early phase (signature-id assignment, global-data layout)
//! and moves its vectors into the module metadata at finalization.

mod env;
mod sig;

pub use env::{
    CustomSection, DataSegment, DefinitionKind, ElemSegment, Export, GlobalDesc, Import, Limits,
    MemoryUsage, ModuleEnvironment, TableDesc,
};
pub use sig::{Sig, SigIdDesc, SigWithId, ValType};

/// Compiler variant that produces a tier of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast compile, slower code.
    Baseline,
    /// Slow compile, faster code.
    Optimized,
}

/// How a whole module generation run relates to tiering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Single-tier compilation; no tier-2 follows.
    Once,
    /// First tier of a tiered compilation; a jump table is produced so
    /// tier-2 code can be swapped in underneath live callers.
    Tier1,
    /// Re-compilation of an already-published module at the optimized tier.
    Tier2,
}
