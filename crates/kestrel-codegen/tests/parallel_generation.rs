//! Worker-pool generation: merge ordering, failure propagation,
//! cancellation, and the tier-2 swap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use kestrel_codegen::testutil::{
    fixture_args, fixture_args_with_tuning, fixture_env, FixtureCompiler, FixtureOp, FuncPlan,
};
use kestrel_codegen::{CodegenError, CompileHub, ModuleGenerator, ShareableBytes, Tuning};
use kestrel_env::{CompileMode, Tier};

fn module_bytecode() -> ShareableBytes {
    Arc::from(vec![9u8; 16].into_boxed_slice())
}

/// One batch per function, so completion order is up to the workers.
fn batch_per_function_tuning() -> Tuning {
    Tuning {
        batch_baseline_threshold: 1,
        batch_optimized_threshold: 1,
        ..Tuning::default()
    }
}

#[test]
fn parallel_merge_order_keeps_function_mapping_intact() {
    let hub = CompileHub::new(2);

    let mut compiler = FixtureCompiler::new();
    // Slow down the early functions so later batches finish first.
    for (func_index, delay_ms) in [(0u32, 60u64), (1, 30), (2, 0), (3, 0)] {
        compiler.plan(
            func_index,
            FuncPlan {
                delay: Some(Duration::from_millis(delay_ms)),
                ..FuncPlan::default()
            },
        );
    }

    // Debug mode preserves the function → code-range map for inspection.
    let env = fixture_env(CompileMode::Once, Tier::Baseline, true, 0, 4);
    let args = fixture_args_with_tuning(compiler, Some(hub), batch_per_function_tuning());

    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    for func_index in 0..4 {
        generator
            .compile_func_def(func_index, 0, vec![0u8; 8])
            .expect("compile func def");
    }
    generator.finish_func_defs().expect("finish func defs");
    let module = generator.finish_module(module_bytecode()).expect("finish module");

    let tier = module.primary_tier();

    // Whatever order the workers finished in, every function index maps to
    // a Function range carrying that same index.
    let map = &tier.metadata.debug_func_to_code_range;
    assert_eq!(map.len(), 4);
    for (func_index, code_range_index) in map.iter().enumerate() {
        let range = &tier.metadata.code_ranges[*code_range_index as usize];
        assert!(range.is_function());
        assert_eq!(range.func_index(), func_index as u32);
    }

    // Merge order never breaks the sortedness of the range list.
    let mut last_end = 0;
    for range in &tier.metadata.code_ranges {
        assert!(range.begin() >= last_end);
        last_end = range.end();
    }
}

#[test]
fn worker_compile_failure_surfaces_first_error() {
    let hub = CompileHub::new(2);

    let mut compiler = FixtureCompiler::new();
    compiler.plan(
        1,
        FuncPlan {
            fail: Some("bad function body".to_string()),
            ..FuncPlan::default()
        },
    );

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 3);
    let args = fixture_args_with_tuning(compiler, Some(hub), batch_per_function_tuning());

    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");

    let mut result = Ok(());
    for func_index in 0..3 {
        result = result.and_then(|()| generator.compile_func_def(func_index, 0, vec![0u8; 8]));
    }
    let result = result.and_then(|()| generator.finish_func_defs());

    assert_eq!(
        result,
        Err(CodegenError::Compile("bad function body".to_string()))
    );
    // Dropping the generator waits out any still-running workers.
    drop(generator);
}

#[test]
fn inline_compile_failure_surfaces_immediately() {
    let mut compiler = FixtureCompiler::new();
    compiler.plan(
        0,
        FuncPlan {
            fail: Some("no good".to_string()),
            ..FuncPlan::default()
        },
    );

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 1);
    let args = fixture_args_with_tuning(compiler, None, batch_per_function_tuning());

    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    let result = generator.compile_func_def(0, 0, vec![0u8; 8]);
    assert_eq!(result, Err(CodegenError::Compile("no good".to_string())));
}

#[test]
fn cancellation_fails_fast_before_dispatch() {
    let cancelled = Arc::new(AtomicBool::new(false));

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 2);
    let args = fixture_args_with_tuning(
        FixtureCompiler::new(),
        None,
        batch_per_function_tuning(),
    );

    let mut generator =
        ModuleGenerator::new(args, env, Some(cancelled.clone()), 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    generator
        .compile_func_def(0, 0, vec![0u8; 8])
        .expect("first function compiles");

    cancelled.store(true, Ordering::Relaxed);
    let result = generator.compile_func_def(1, 0, vec![0u8; 8]);
    assert_eq!(result, Err(CodegenError::Cancelled));
}

#[test]
fn dropping_a_generator_with_outstanding_work_quiesces_workers() {
    let hub = CompileHub::new(2);

    let mut compiler = FixtureCompiler::new();
    for func_index in 0..4 {
        compiler.plan(
            func_index,
            FuncPlan {
                delay: Some(Duration::from_millis(40)),
                ..FuncPlan::default()
            },
        );
    }

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 4);
    let args = fixture_args_with_tuning(compiler, Some(hub.clone()), batch_per_function_tuning());

    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    for func_index in 0..4 {
        generator
            .compile_func_def(func_index, 0, vec![0u8; 8])
            .expect("compile func def");
    }

    // Abandon the generation mid-flight. The drop must drain the worklist
    // and wait for in-flight batches, leaving the hub reusable.
    drop(generator);

    let env = fixture_env(CompileMode::Once, Tier::Baseline, false, 0, 1);
    let args = fixture_args_with_tuning(
        FixtureCompiler::new(),
        Some(hub),
        batch_per_function_tuning(),
    );
    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    generator
        .compile_func_def(0, 0, vec![0u8; 8])
        .expect("compile func def");
    generator.finish_func_defs().expect("finish func defs");
    let module = generator.finish_module(module_bytecode()).expect("finish module");
    assert_eq!(module.primary_tier().tier, Tier::Baseline);
}

#[test]
fn tier1_module_gets_a_jump_table_and_tier2_swaps_in() {
    // Tier 1: baseline code plus the dispatch jump table.
    let mut compiler = FixtureCompiler::new();
    compiler.plan(1, FuncPlan::with_ops(vec![FixtureOp::Call(2)]));

    let env = fixture_env(CompileMode::Tier1, Tier::Baseline, false, 1, 2);
    let args = fixture_args(compiler, None);

    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    for func_index in 1..3 {
        generator
            .compile_func_def(func_index, 0, vec![0u8; 8])
            .expect("compile func def");
    }
    generator.finish_func_defs().expect("finish func defs");
    let module = generator.finish_module(module_bytecode()).expect("finish module");

    let jump_table = module.jump_table().expect("tier-1 module has a jump table");
    assert_eq!(jump_table.len(), 3);
    // The import slot keeps the unassigned sentinel.
    assert_eq!(jump_table.entry_offset(0), 0);
    for func_index in 1..3u32 {
        let range = module
            .primary_tier()
            .metadata
            .code_ranges
            .iter()
            .find(|r| r.is_function() && r.func_index() == func_index)
            .expect("function range");
        assert_eq!(jump_table.entry_offset(func_index), range.func_tier_entry());
    }

    assert!(module.tier2().is_none());

    // Tier 2: recompile at the optimized tier and publish into the module.
    let env = fixture_env(CompileMode::Tier2, Tier::Optimized, false, 1, 2);
    let args = fixture_args(FixtureCompiler::new(), None);
    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    for func_index in 1..3 {
        generator
            .compile_func_def(func_index, 0, vec![0u8; 8])
            .expect("compile func def");
    }
    generator.finish_func_defs().expect("finish func defs");
    generator.finish_tier2(&module).expect("finish tier2");

    let tier2 = module.tier2().expect("tier-2 published");
    assert_eq!(tier2.tier, Tier::Optimized);
    assert_eq!(module.best_tier().tier, Tier::Optimized);
    assert!(!tier2.segment.is_empty());
}

#[test]
fn tier2_generation_honors_cancellation_at_close() {
    let env = fixture_env(CompileMode::Tier1, Tier::Baseline, false, 0, 1);
    let args = fixture_args(FixtureCompiler::new(), None);
    let mut generator = ModuleGenerator::new(args, env, None, 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    generator
        .compile_func_def(0, 0, vec![0u8; 8])
        .expect("compile func def");
    generator.finish_func_defs().expect("finish func defs");
    let module = generator.finish_module(module_bytecode()).expect("finish module");

    let cancelled = Arc::new(AtomicBool::new(false));
    let env = fixture_env(CompileMode::Tier2, Tier::Optimized, false, 0, 1);
    let args = fixture_args(FixtureCompiler::new(), None);
    let mut generator =
        ModuleGenerator::new(args, env, Some(cancelled.clone()), 1024).expect("generator init");
    generator.start_func_defs().expect("start func defs");
    generator
        .compile_func_def(0, 0, vec![0u8; 8])
        .expect("compile func def");
    generator.finish_func_defs().expect("finish func defs");

    cancelled.store(true, Ordering::Relaxed);
    assert_eq!(generator.finish_tier2(&module), Err(CodegenError::Cancelled));
    assert!(module.tier2().is_none());
}
