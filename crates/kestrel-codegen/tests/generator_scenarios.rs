//! End-to-end generation scenarios through the public streaming API,
//! driven by the fixture compilers.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use kestrel_codegen::testutil::{
    fixture_args, fixture_args_with_tuning, fixture_env, FixtureCompiler, FixtureOp, FuncPlan,
};
use kestrel_codegen::{Module, ModuleGenerator, ShareableBytes, Tuning};
use kestrel_env::{CompileMode, DefinitionKind, ElemSegment, Export, Sig, TableDesc, Tier, ValType};
use kestrel_masm::{
    CodeRange, CodeRangeKind, SymbolicAddress, Trap, CODE_ALIGNMENT, FAR_JUMP_MARKER,
    TLS_RELOAD_SEQ,
};

fn bytecode(len: usize) -> Vec<u8> {
    vec![0u8; len]
}

fn module_bytecode() -> ShareableBytes {
    Arc::from(vec![1u8, 2, 3, 4].into_boxed_slice())
}

fn generate(
    args: Arc<kestrel_codegen::CompileArgs>,
    env: kestrel_env::ModuleEnvironment,
    bodies: &[(u32, Vec<u8>)],
) -> Module {
    let mut generator = ModuleGenerator::new(args, env, None, 4096).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    for (func_index, bytes) in bodies {
        generator
            .compile_func_def(*func_index, 0, bytes.clone())
            .expect("compile func def");
    }
    generator.finish_func_defs().expect("finish func defs");
    generator.finish_module(module_bytecode()).expect("finish module")
}

fn function_ranges(module: &Module) -> Vec<&CodeRange> {
    module
        .primary_tier()
        .metadata
        .code_ranges
        .iter()
        .filter(|r| r.is_function())
        .collect()
}

fn islands(module: &Module) -> Vec<&CodeRange> {
    module
        .primary_tier()
        .metadata
        .code_ranges
        .iter()
        .filter(|r| matches!(r.kind(), CodeRangeKind::FarJumpIsland))
        .collect()
}

fn read_u32(bytes: &[u8], at: u32) -> u32 {
    let at = at as usize;
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn read_call_displacement(bytes: &[u8], return_address_offset: u32) -> i32 {
    let at = return_address_offset as usize - 4;
    i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// Return-address offsets of every call site of `kind`.
fn call_sites_of_kind(module: &Module, kind: kestrel_masm::CallSiteKind) -> Vec<u32> {
    module
        .primary_tier()
        .metadata
        .call_sites
        .iter()
        .filter(|cs| cs.kind == kind)
        .map(|cs| cs.return_address_offset)
        .collect()
}

#[test]
fn single_small_function_inline() {
    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 1);
    let module = generate(
        fixture_args(FixtureCompiler::new(), None),
        env,
        &[(0, bytecode(40))],
    );

    let funcs = function_ranges(&module);
    assert_eq!(funcs.len(), 1);
    assert_eq!(funcs[0].begin() % CODE_ALIGNMENT, 0);
    assert!(funcs[0].end() > funcs[0].begin());
    assert_eq!(funcs[0].func_index(), 0);
    assert!(islands(&module).is_empty());

    // The first merged range is the function itself.
    assert!(module.primary_tier().metadata.code_ranges[0].is_function());
}

#[test]
fn direct_call_within_range_patches_directly() {
    let mut compiler = FixtureCompiler::new();
    compiler.plan(0, FuncPlan::with_ops(vec![FixtureOp::Call(1)]));

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 2);
    let module = generate(
        fixture_args(compiler, None),
        env,
        &[(0, bytecode(40)), (1, bytecode(40))],
    );

    assert!(islands(&module).is_empty());
    let funcs = function_ranges(&module);
    assert_eq!(funcs.len(), 2);

    let callee_entry = funcs[1].func_normal_entry();
    let rets = call_sites_of_kind(&module, kestrel_masm::CallSiteKind::Func);
    assert_eq!(rets.len(), 1);
    let disp = read_call_displacement(module.primary_tier().segment.bytes(), rets[0]);
    assert_eq!(i64::from(disp), i64::from(callee_entry) - i64::from(rets[0]));
}

#[test]
fn out_of_range_call_goes_through_a_far_jump_island() {
    let mut compiler = FixtureCompiler::new();
    compiler.plan(0, FuncPlan::with_ops(vec![FixtureOp::Call(1)]));

    // Clamp the reach so the two bodies cannot see each other directly.
    let tuning = Tuning {
        jump_range_threshold: 16,
        ..Tuning::default()
    };
    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 2);
    let module = generate(
        fixture_args_with_tuning(compiler, None, tuning),
        env,
        &[(0, bytecode(40)), (1, bytecode(40))],
    );

    let isles = islands(&module);
    assert_eq!(isles.len(), 1);
    let island = isles[0];

    // The call site lands on the island...
    let rets = call_sites_of_kind(&module, kestrel_masm::CallSiteKind::Func);
    assert_eq!(rets.len(), 1);
    let bytes = module.primary_tier().segment.bytes();
    let disp = read_call_displacement(bytes, rets[0]);
    assert_eq!(
        i64::from(disp),
        i64::from(island.begin()) - i64::from(rets[0])
    );

    // ...and the island's patched slot lands on the callee's normal entry.
    let funcs = function_ranges(&module);
    let callee_entry = funcs
        .iter()
        .find(|r| r.func_index() == 1)
        .unwrap()
        .func_normal_entry();
    let slot = island.begin() + FAR_JUMP_MARKER.len() as u32;
    assert_eq!(read_u32(bytes, slot), callee_entry);
}

#[test]
fn trap_exit_island_is_shared_across_call_sites() {
    let mut compiler = FixtureCompiler::new();
    compiler.plan(
        0,
        FuncPlan::with_ops(vec![FixtureOp::TrapCall(Trap::OutOfBounds)]),
    );
    compiler.plan(
        1,
        FuncPlan::with_ops(vec![FixtureOp::TrapCall(Trap::OutOfBounds)]),
    );

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 2);
    let module = generate(
        fixture_args(compiler, None),
        env,
        &[(0, bytecode(40)), (1, bytecode(40))],
    );

    // One island serves both sites for the same trap.
    let isles = islands(&module);
    assert_eq!(isles.len(), 1);
    let island = isles[0];

    let bytes = module.primary_tier().segment.bytes();
    let rets = call_sites_of_kind(&module, kestrel_masm::CallSiteKind::TrapExit);
    assert_eq!(rets.len(), 2);
    for ret in rets {
        let disp = read_call_displacement(bytes, ret);
        assert_eq!(i64::from(disp), i64::from(island.begin()) - i64::from(ret));
    }

    // The island reloads TLS, then far-jumps to the trap's exit stub.
    let tls_len = TLS_RELOAD_SEQ.len() as u32;
    assert_eq!(
        &bytes[island.begin() as usize..(island.begin() + tls_len) as usize],
        &TLS_RELOAD_SEQ
    );
    let trap_stub = module
        .primary_tier()
        .metadata
        .code_ranges
        .iter()
        .find(|r| matches!(r.kind(), CodeRangeKind::TrapExit(Trap::OutOfBounds)))
        .unwrap()
        .begin();
    let slot = island.begin() + tls_len + FAR_JUMP_MARKER.len() as u32;
    assert_eq!(read_u32(bytes, slot), trap_stub);
}

#[test]
fn debug_breakpoints_coalesce_per_jump_window() {
    let mut compiler = FixtureCompiler::new();
    // First cluster: three breakpoints close together.
    compiler.plan(
        0,
        FuncPlan::with_ops(vec![
            FixtureOp::Breakpoint,
            FixtureOp::Breakpoint,
            FixtureOp::Breakpoint,
        ]),
    );
    // Second cluster: pushed past the jump window by padding.
    compiler.plan(
        1,
        FuncPlan::with_ops(vec![
            FixtureOp::Pad(5000),
            FixtureOp::Breakpoint,
            FixtureOp::Breakpoint,
        ]),
    );

    let tuning = Tuning {
        jump_range_threshold: 4096,
        batch_baseline_threshold: 1,
        ..Tuning::default()
    };
    let env = fixture_env(CompileMode::Once, Tier::Baseline, true, 0, 2);
    let module = generate(
        fixture_args_with_tuning(compiler, None, tuning),
        env,
        &[(0, bytecode(2)), (1, bytecode(2))],
    );

    let isles = islands(&module);
    assert_eq!(isles.len(), 2);

    let offsets = &module.primary_tier().metadata.debug_trap_far_jump_offsets;
    assert_eq!(offsets.len(), 2);
    assert!(offsets[0] < offsets[1]);

    // Both islands are patched to the shared debug-trap stub.
    let bytes = module.primary_tier().segment.bytes();
    let debug_stub = module
        .primary_tier()
        .metadata
        .code_ranges
        .iter()
        .find(|r| matches!(r.kind(), CodeRangeKind::DebugTrap))
        .unwrap()
        .begin();
    for island in isles {
        let slot = island.begin() + TLS_RELOAD_SEQ.len() as u32 + FAR_JUMP_MARKER.len() as u32;
        assert_eq!(read_u32(bytes, slot), debug_stub);
    }
}

#[test]
fn exported_function_set_unions_exports_elems_and_start() {
    let mut env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 4);
    env.exports.push(Export {
        field: "two".to_string(),
        kind: DefinitionKind::Function,
        index: 2,
    });
    env.tables.push(TableDesc {
        external: true,
        ..TableDesc::default()
    });
    // Elements listed out of order, with a duplicate of the explicit
    // export; the resulting set must not care.
    env.elem_segments
        .push(ElemSegment::new(0, 0, vec![3, 1, 2]));
    env.start_func_index = Some(0);

    let module = generate(
        fixture_args(FixtureCompiler::new(), None),
        env,
        &[(0, bytecode(8)), (1, bytecode(8)), (2, bytecode(8)), (3, bytecode(8))],
    );

    let exports = &module.primary_tier().metadata.func_exports;
    let indices: Vec<u32> = exports.iter().map(|fe| fe.func_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    // Every export's entry offset falls inside its Entry stub range.
    for fe in exports {
        let entry = fe.entry_offset.get().expect("entry offset assigned");
        let range = module
            .primary_tier()
            .metadata
            .code_ranges
            .iter()
            .find(|r| {
                matches!(r.kind(), CodeRangeKind::Entry { func_index } if func_index == fe.func_index)
            })
            .expect("entry stub range");
        assert!(entry >= range.begin() && entry < range.end());
        assert!(fe.code_range_index.is_some());
    }

    // Element segments got their per-tier code-range indices.
    let seg = &module.elem_segments()[0];
    assert_eq!(
        seg.code_range_indices(Tier::Baseline).len(),
        seg.elem_func_indices.len()
    );
}

#[test]
fn structurally_equal_global_signatures_share_one_id() {
    let big_sig = || Sig::new(vec![ValType::I64; 12], Some(ValType::I32));

    let mut env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 1);
    let a = env.push_sig(big_sig());
    let b = env.push_sig(big_sig());
    let c = env.push_sig(Sig::new(vec![ValType::F64; 12], None));
    let _ = (a, b, c);

    let module = generate(
        fixture_args(FixtureCompiler::new(), None),
        env,
        &[(0, bytecode(8))],
    );

    // Two distinct global-form shapes, interned once each.
    let sig_ids = &module.metadata().sig_ids;
    assert_eq!(sig_ids.len(), 2);

    let offsets: Vec<u32> = sig_ids
        .iter()
        .map(|s| match s.id {
            kestrel_env::SigIdDesc::Global { global_data_offset } => global_data_offset,
            _ => panic!("interned signature is not global-form"),
        })
        .collect();
    assert_ne!(offsets[0], offsets[1]);
    for offset in offsets {
        assert_eq!(offset % 8, 0);
    }
}

#[test]
fn global_data_is_laid_out_and_page_aligned() {
    let mut env = fixture_env(CompileMode::Once, Tier::Baseline, false, 2, 1);
    env.globals
        .push(kestrel_env::GlobalDesc::variable(ValType::F64, true));
    env.globals
        .push(kestrel_env::GlobalDesc::constant(ValType::I32));

    let module = generate(
        fixture_args(FixtureCompiler::new(), None),
        env,
        &[(2, bytecode(8))],
    );

    let metadata = module.metadata();
    assert_eq!(metadata.global_data.length() % kestrel_codegen::PAGE_SIZE, 0);
    assert!(metadata.global_data.length() > 0);

    // Variable global got an aligned slot; the constant got none.
    assert_eq!(metadata.globals[0].offset.map(|o| o % 8), Some(0));
    assert_eq!(metadata.globals[1].offset, None);

    // Both imports got TLS slots and both exit stubs.
    let imports = &module.primary_tier().metadata.func_imports;
    assert_eq!(imports.len(), 2);
    for fi in imports {
        assert!(fi.interp_exit_offset.is_set());
        assert!(fi.jit_exit_offset.is_set());
    }
}

#[test]
fn symbolic_accesses_and_code_labels_are_shifted_and_linked() {
    let mut compiler = FixtureCompiler::new();
    compiler.plan(
        0,
        FuncPlan::with_ops(vec![
            FixtureOp::SymbolicCall(SymbolicAddress::MemoryGrow),
            FixtureOp::SelfLabel,
            FixtureOp::MemoryLoad,
        ]),
    );

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 1);
    let module = generate(
        fixture_args(compiler, None),
        env,
        &[(0, bytecode(16))],
    );

    let tier = module.primary_tier();
    let func = function_ranges(&module)[0];

    // The symbolic link was recorded at its module-absolute offset and is
    // left unpatched for the embedder.
    let links = tier.link_data.symbolic_links.get(SymbolicAddress::MemoryGrow);
    assert_eq!(links.len(), 1);
    assert!(links[0] > func.begin() && links[0] < func.end());

    // The internal label was resolved at publication: the patched slot
    // holds the function's own begin offset.
    let link = tier.link_data.internal_links[0];
    assert_eq!(link.target_offset, func.begin());
    assert_eq!(read_u32(tier.segment.bytes(), link.patch_at_offset), func.begin());

    // The memory access was shifted into the function's range.
    let access = &tier.metadata.memory_accesses[0];
    assert!(access.insn_offset > func.begin() && access.insn_offset < func.end());
}

#[test]
fn compiler_emitted_far_jumps_are_patched_at_finalization() {
    let mut compiler = FixtureCompiler::new();
    compiler.plan(0, FuncPlan::with_ops(vec![FixtureOp::FarJumpTo(1)]));

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 2);
    let module = generate(
        fixture_args(compiler, None),
        env,
        &[(0, bytecode(8)), (1, bytecode(8))],
    );

    let funcs = function_ranges(&module);
    let caller = funcs.iter().find(|r| r.func_index() == 0).unwrap();
    let callee_entry = funcs
        .iter()
        .find(|r| r.func_index() == 1)
        .unwrap()
        .func_normal_entry();

    // Fixture layout: prologue, then the far-jump marker, then the slot.
    let slot = caller.begin() + 4 + FAR_JUMP_MARKER.len() as u32;
    assert_eq!(
        read_u32(module.primary_tier().segment.bytes(), slot),
        callee_entry
    );
}

#[test]
fn code_ranges_and_call_sites_are_sorted_after_generation() {
    let mut compiler = FixtureCompiler::new();
    for i in 0..4 {
        compiler.plan(
            i,
            FuncPlan::with_ops(vec![FixtureOp::Call((i + 1) % 4), FixtureOp::MemoryLoad]),
        );
    }

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 4);
    let module = generate(
        fixture_args(compiler, None),
        env,
        &[(0, bytecode(20)), (1, bytecode(20)), (2, bytecode(20)), (3, bytecode(20))],
    );

    let tier = module.primary_tier();
    let mut last_end = 0;
    for range in &tier.metadata.code_ranges {
        assert!(range.begin() >= last_end);
        last_end = range.end();
    }

    let mut last_ret = 0;
    for site in &tier.metadata.call_sites {
        assert!(site.return_address_offset >= last_ret);
        last_ret = site.return_address_offset;
    }
}
