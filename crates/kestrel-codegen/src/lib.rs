//! Module code generation for the kestrel wasm engine.
//!
//! [`ModuleGenerator`] turns a parsed module's function bodies plus
//! synthesized stubs into one linked, contiguous code segment and the
//! metadata the runtime needs for dispatch, trap handling, and debugging.
//!
//! Function bodies stream in, are batched onto [`CompileTask`]s, and are
//! compiled either inline or on a [`CompileHub`] worker thread. Finished
//! batches are merged back in arrival order into a single aggregate buffer;
//! the link editor patches direct calls as it goes and inserts far-jump
//! islands whenever accumulated code threatens to exceed the ISA's branch
//! displacement reach. Finalization links the stub package, patches the
//! residual far jumps, freezes the metadata, and produces the immutable
//! [`Module`].
//!
//! The function-body compilers and the stub generator are opaque
//! collaborators behind [`FuncCompiler`] and [`StubCompiler`]; they consume
//! batches and produce relocatable [`CompiledCode`] packages.

mod error;
mod generator;
mod hub;
mod metadata;
mod module;
mod task;
pub mod testutil;

pub use error::{CodegenError, Result};
pub use generator::{GeneratorStats, ModuleGenerator};
pub use hub::CompileHub;
pub use metadata::{
    DebugMetadata, FuncExport, FuncImport, GlobalDataLayout, InternalLink, LinkDataTier, Metadata,
    MetadataTier, SetOnce, SymbolicLinks,
};
pub use module::{CodeSegment, JumpTable, Module, TierArtifact};
pub use task::{CompileTask, FuncCompileInput};

use std::sync::Arc;

use bumpalo::Bump;
use kestrel_env::{ModuleEnvironment, Tier};
use kestrel_masm::CompiledCode;

/// The module's original bytecode, shared between the artifact and any
/// debugger that wants to re-derive source offsets.
pub type ShareableBytes = Arc<[u8]>;

/// System page size used to round up the global-data area.
pub const PAGE_SIZE: u32 = 4096;

/// Pacing knobs for the generator. None of these affect correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    /// Accumulated bytecode bytes that trigger a baseline batch launch.
    pub batch_baseline_threshold: u32,
    /// Accumulated bytecode bytes that trigger an optimizing batch launch.
    pub batch_optimized_threshold: u32,
    /// Direct-call reach used by the link editor. The effective reach is
    /// the minimum of this and [`kestrel_masm::JUMP_IMMEDIATE_RANGE`]; the
    /// default is the ISA range, i.e. no extra restriction.
    pub jump_range_threshold: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            batch_baseline_threshold: 10_000,
            batch_optimized_threshold: 1_100,
            jump_range_threshold: kestrel_masm::JUMP_IMMEDIATE_RANGE,
        }
    }
}

/// Snapshot of the compilation target baked into the module artifact.
/// A cached module is only reusable when its assumptions still hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assumptions {
    pub isa: String,
    pub features: Vec<String>,
    pub debug_enabled: bool,
}

/// A tier compiler: consumes a batch of function-body inputs and produces
/// one relocatable code package with exactly one Function code range per
/// input, in input order. Temporaries go in `arena`; implementations must
/// not retain arena allocations past the call.
pub trait FuncCompiler: Send + Sync {
    fn compile_functions(
        &self,
        env: &ModuleEnvironment,
        tier: Tier,
        arena: &Bump,
        inputs: &[FuncCompileInput],
        output: &mut CompiledCode,
    ) -> std::result::Result<(), String>;
}

/// The stub generator: produces entries for the exported functions, exits
/// for the imports, and the shared trap/debug/throw stubs, as one further
/// relocatable code package merged after all function code.
pub trait StubCompiler: Send + Sync {
    fn generate_stubs(
        &self,
        env: &ModuleEnvironment,
        func_imports: &[FuncImport],
        func_exports: &[FuncExport],
        output: &mut CompiledCode,
    ) -> std::result::Result<(), String>;
}

/// Everything a generation run needs besides the module environment.
pub struct CompileArgs {
    pub tuning: Tuning,
    pub assumptions: Assumptions,
    pub filename: Option<String>,
    pub source_map_url: Option<String>,
    pub func_compiler: Arc<dyn FuncCompiler>,
    pub stub_compiler: Arc<dyn StubCompiler>,
    /// Worker pool for parallel compilation; `None` compiles inline.
    pub hub: Option<Arc<CompileHub>>,
}
