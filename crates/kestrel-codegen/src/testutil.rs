//! Test support: synthetic tier and stub compilers.
//!
//! The real baseline/optimizing compilers and the stub generator live
//! outside this crate. These fixtures produce structurally honest
//! [`CompiledCode`] packages (real bytes, real relocation records) from
//! small per-function scripts, which is all the generator ever observes.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bumpalo::Bump;
use kestrel_env::{CompileMode, ModuleEnvironment, Sig, Tier};
use kestrel_masm::{
    CallFarJump, CallSite, CallSiteKind, CallSiteTarget, CodeLabel, CodeRange, CodeRangeKind,
    CompiledCode, FuncOffsets, MemoryAccess, MemoryAccessKind, Offsets, PatchHandle,
    SymbolicAccess, SymbolicAddress, Trap, CODE_ALIGNMENT, FAR_JUMP_MARKER, HALT_FILL,
};

use crate::metadata::{FuncExport, FuncImport};
use crate::{Assumptions, CompileArgs, CompileHub, FuncCompileInput, Tuning};
use crate::{FuncCompiler, StubCompiler};

/// One synthetic "instruction" in a fixture function body.
#[derive(Debug, Clone)]
pub enum FixtureOp {
    /// Direct call to another function.
    Call(u32),
    /// Out-of-line call into a trap exit.
    TrapCall(Trap),
    /// Debug breakpoint site.
    Breakpoint,
    /// Call through a symbolic (builtin) address.
    SymbolicCall(SymbolicAddress),
    /// A linear-memory load, recorded for signal-handler metadata.
    MemoryLoad,
    /// A patchable reference to this function's own first byte.
    SelfLabel,
    /// A compiler-emitted far jump to another function's normal entry,
    /// resolved at finalization.
    FarJumpTo(u32),
    /// Filler bytes.
    Pad(u32),
}

/// Per-function compile script.
#[derive(Debug, Clone, Default)]
pub struct FuncPlan {
    pub ops: Vec<FixtureOp>,
    /// Sleep before emitting, to shuffle completion order in parallel
    /// tests.
    pub delay: Option<Duration>,
    /// Fail the whole batch with this message.
    pub fail: Option<String>,
}

impl FuncPlan {
    #[must_use]
    pub fn with_ops(ops: Vec<FixtureOp>) -> Self {
        Self {
            ops,
            ..Self::default()
        }
    }
}

/// Synthetic tier compiler driven by [`FuncPlan`]s. Functions without a
/// plan get a plain body sized to their bytecode.
#[derive(Debug, Default)]
pub struct FixtureCompiler {
    plans: HashMap<u32, FuncPlan>,
}

impl FixtureCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&mut self, func_index: u32, plan: FuncPlan) -> &mut Self {
        self.plans.insert(func_index, plan);
        self
    }
}

fn align_package(bytes: &mut Vec<u8>) {
    while bytes.len() % CODE_ALIGNMENT as usize != 0 {
        bytes.push(HALT_FILL);
    }
}

/// Emit a call-shaped instruction (opcode byte + 4-byte displacement) and
/// return the return-address offset.
fn emit_call_shape(bytes: &mut Vec<u8>) -> u32 {
    bytes.push(0xE8);
    bytes.extend_from_slice(&[0; 4]);
    bytes.len() as u32
}

impl FuncCompiler for FixtureCompiler {
    fn compile_functions(
        &self,
        _env: &ModuleEnvironment,
        _tier: Tier,
        _arena: &Bump,
        inputs: &[FuncCompileInput],
        output: &mut CompiledCode,
    ) -> Result<(), String> {
        for input in inputs {
            let plan = self.plans.get(&input.func_index).cloned().unwrap_or_default();
            if let Some(message) = plan.fail {
                return Err(message);
            }
            if let Some(delay) = plan.delay {
                thread::sleep(delay);
            }

            align_package(&mut output.bytes);
            let begin = output.bytes.len() as u32;

            // Tier entry at the top, normal entry after the four-byte
            // tier-check prologue.
            output.bytes.extend_from_slice(&[0x90; 4]);

            for op in &plan.ops {
                match op {
                    FixtureOp::Call(callee) => {
                        let ret = emit_call_shape(&mut output.bytes);
                        output.call_sites.push(CallSite {
                            kind: CallSiteKind::Func,
                            return_address_offset: ret,
                        });
                        output.call_site_targets.push(CallSiteTarget::Func(*callee));
                    }
                    FixtureOp::TrapCall(trap) => {
                        let ret = emit_call_shape(&mut output.bytes);
                        output.call_sites.push(CallSite {
                            kind: CallSiteKind::TrapExit,
                            return_address_offset: ret,
                        });
                        output.call_site_targets.push(CallSiteTarget::Trap(*trap));
                    }
                    FixtureOp::Breakpoint => {
                        let ret = emit_call_shape(&mut output.bytes);
                        output.call_sites.push(CallSite {
                            kind: CallSiteKind::Breakpoint,
                            return_address_offset: ret,
                        });
                        output.call_site_targets.push(CallSiteTarget::None);
                    }
                    FixtureOp::SymbolicCall(target) => {
                        output.bytes.extend_from_slice(&[0xFF, 0x15]);
                        let patch_at = output.bytes.len() as u32;
                        output.bytes.extend_from_slice(&[0; 4]);
                        output.symbolic_accesses.push(SymbolicAccess {
                            patch_at,
                            target: *target,
                        });
                        output.call_sites.push(CallSite {
                            kind: CallSiteKind::Symbolic,
                            return_address_offset: output.bytes.len() as u32,
                        });
                        output.call_site_targets.push(CallSiteTarget::None);
                    }
                    FixtureOp::MemoryLoad => {
                        let insn_offset = output.bytes.len() as u32;
                        output.bytes.extend_from_slice(&[0x8B, 0x00]);
                        output.memory_accesses.push(MemoryAccess {
                            insn_offset,
                            kind: MemoryAccessKind::Load,
                        });
                    }
                    FixtureOp::SelfLabel => {
                        let patch_at = output.bytes.len() as u32;
                        output.bytes.extend_from_slice(&[0; 4]);
                        output.code_labels.push(CodeLabel {
                            patch_at,
                            target: begin,
                        });
                    }
                    FixtureOp::FarJumpTo(callee) => {
                        output.bytes.extend_from_slice(&FAR_JUMP_MARKER);
                        let slot = output.bytes.len() as u32;
                        output.bytes.extend_from_slice(&[0; 4]);
                        output.call_far_jumps.push(CallFarJump {
                            func_index: *callee,
                            jump: PatchHandle::at_slot(slot),
                        });
                    }
                    FixtureOp::Pad(n) => {
                        output
                            .bytes
                            .extend(std::iter::repeat(0x90).take(*n as usize));
                    }
                }
            }

            // Body grows with its bytecode, like real compilation output.
            output
                .bytes
                .extend(std::iter::repeat(0x90).take(input.bytes.len()));
            output.bytes.push(0xC3);
            let end = output.bytes.len() as u32;

            output.code_ranges.push(CodeRange::new(
                Offsets { begin, end },
                CodeRangeKind::Function {
                    func_index: input.func_index,
                    line_or_bytecode: input.line_or_bytecode,
                    entries: FuncOffsets {
                        normal_entry: 4,
                        tier_entry: 0,
                    },
                },
            ));
        }
        Ok(())
    }
}

/// Synthetic stub generator: an entry per export, both exits per import,
/// every trap exit, the shared throw/out-of-bounds/unaligned/interrupt
/// stubs, and the debug-trap stub when debugging is enabled.
#[derive(Debug, Default)]
pub struct FixtureStubs;

impl FixtureStubs {
    fn emit_stub(output: &mut CompiledCode, kind: CodeRangeKind) {
        align_package(&mut output.bytes);
        let begin = output.bytes.len() as u32;
        output.bytes.extend_from_slice(&[0x90; 7]);
        output.bytes.push(0xC3);
        let end = output.bytes.len() as u32;
        output
            .code_ranges
            .push(CodeRange::new(Offsets { begin, end }, kind));
    }
}

impl StubCompiler for FixtureStubs {
    fn generate_stubs(
        &self,
        env: &ModuleEnvironment,
        func_imports: &[FuncImport],
        func_exports: &[FuncExport],
        output: &mut CompiledCode,
    ) -> Result<(), String> {
        for fe in func_exports {
            Self::emit_stub(
                output,
                CodeRangeKind::Entry {
                    func_index: fe.func_index,
                },
            );
        }

        for (import_index, _) in func_imports.iter().enumerate() {
            let func_index = import_index as u32;
            Self::emit_stub(output, CodeRangeKind::ImportInterpExit { func_index });
            Self::emit_stub(output, CodeRangeKind::ImportJitExit { func_index });
        }

        for trap in Trap::ALL {
            Self::emit_stub(output, CodeRangeKind::TrapExit(trap));
        }

        if env.debug_enabled {
            Self::emit_stub(output, CodeRangeKind::DebugTrap);
        }

        Self::emit_stub(output, CodeRangeKind::OutOfBoundsExit);
        Self::emit_stub(output, CodeRangeKind::UnalignedExit);
        Self::emit_stub(output, CodeRangeKind::Interrupt);
        Self::emit_stub(output, CodeRangeKind::Throw);

        Ok(())
    }
}

/// A module environment with `num_imports + num_defs` functions, all
/// sharing one `() -> ()` signature.
#[must_use]
pub fn fixture_env(
    mode: CompileMode,
    tier: Tier,
    debug_enabled: bool,
    num_imports: u32,
    num_defs: u32,
) -> ModuleEnvironment {
    let mut env = ModuleEnvironment::new(mode, tier, debug_enabled);
    let sig = env.push_sig(Sig::default());
    for i in 0..num_imports {
        env.push_func_import(sig, "fixture", &format!("import{i}"));
    }
    for _ in 0..num_defs {
        env.push_func(sig);
    }
    env
}

/// Compile args wired to the fixture compilers, with default tuning.
#[must_use]
pub fn fixture_args(compiler: FixtureCompiler, hub: Option<Arc<CompileHub>>) -> Arc<CompileArgs> {
    fixture_args_with_tuning(compiler, hub, Tuning::default())
}

#[must_use]
pub fn fixture_args_with_tuning(
    compiler: FixtureCompiler,
    hub: Option<Arc<CompileHub>>,
    tuning: Tuning,
) -> Arc<CompileArgs> {
    Arc::new(CompileArgs {
        tuning,
        assumptions: Assumptions {
            isa: "fixture".to_string(),
            features: Vec::new(),
            debug_enabled: false,
        },
        filename: None,
        source_map_url: None,
        func_compiler: Arc::new(compiler),
        stub_compiler: Arc::new(FixtureStubs),
        hub,
    })
}
