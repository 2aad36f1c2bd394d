//! The module generator: streaming batch compilation, merge, and link
//! editing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use kestrel_env::{CompileMode, ModuleEnvironment, SigIdDesc, SigWithId, Tier};
use kestrel_masm::{
    CallFarJump, CallSiteKind, CodeRange, CodeRangeKind, CompiledCode, MasmBuffer, Offsets,
    PatchHandle, Trap, TrapFarJump, CODE_ALIGNMENT, JUMP_IMMEDIATE_RANGE,
};

use crate::error::{CodegenError, Result};
use crate::hub::CompileHub;
use crate::metadata::{FuncExport, FuncImport, LinkDataTier, Metadata, MetadataTier, SetOnce};
use crate::module::{CodeSegment, JumpTable, Module, TierArtifact};
use crate::task::{execute_compile_task, CompileTask, FuncCompileInput, TaskState};
use crate::{CompileArgs, ShareableBytes};

/// Sentinel in the function → code-range index until the function's code
/// is merged.
const BAD_CODE_RANGE: u32 = u32::MAX;

/// TLS-area bytes per function import: entry code pointer, instance TLS
/// pointer, callee object pointer.
const FUNC_IMPORT_TLS_BYTES: u32 = 24;
/// TLS-area bytes per table: base pointer plus current length.
const TABLE_TLS_BYTES: u32 = 16;
/// A global-form signature id occupies one pointer-sized slot.
const SIG_ID_SLOT_BYTES: u32 = 8;
const POINTER_ALIGN: u32 = 8;

/// Conservative machine-code bytes expected per bytecode byte. The price
/// of over-reserving is low and the cost of a mid-stream regrow is high.
fn estimate_compiled_code_size(tier: Tier, bytecode_size: usize) -> usize {
    match tier {
        Tier::Baseline => bytecode_size * 5,
        Tier::Optimized => bytecode_size * 4,
    }
}

fn in_range(range: u32, a: u64, b: u64) -> bool {
    a.abs_diff(b) < u64::from(range)
}

/// Counters for observability; none of these feed back into codegen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorStats {
    pub batches_launched_total: u64,
    pub tasks_merged_total: u64,
    pub far_jump_islands_total: u64,
    pub call_sites_linked_total: u64,
}

/// Tracks tasks handed to the worker pool. Dropping the tracker removes
/// this generator's queued tasks from the shared worklist and then waits
/// for the in-flight remainder, so workers never outlive the state they
/// deliver into.
struct OutstandingWork {
    parallel: bool,
    outstanding: usize,
    state: Arc<TaskState>,
    hub: Option<Arc<CompileHub>>,
}

impl Drop for OutstandingWork {
    fn drop(&mut self) {
        if !self.parallel || self.outstanding == 0 {
            return;
        }

        if let Some(hub) = &self.hub {
            let removed = hub.remove_queued_for(&self.state);
            debug_assert!(removed <= self.outstanding);
            self.outstanding -= removed;
        }

        let mut inner = self.state.inner.lock().expect("task state poisoned");
        loop {
            debug_assert!(self.outstanding >= inner.finished.len() + inner.num_failed);
            self.outstanding -= inner.finished.len();
            inner.finished.clear();
            self.outstanding -= inner.num_failed;
            inner.num_failed = 0;

            if self.outstanding == 0 {
                break;
            }
            inner = self
                .state
                .failed_or_finished
                .wait(inner)
                .expect("task state poisoned");
        }
    }
}

/// Drives one module generation run: initialization, the streaming
/// function-definition phase, and finalization into a [`Module`].
pub struct ModuleGenerator {
    args: Arc<CompileArgs>,
    cancelled: Option<Arc<AtomicBool>>,
    env: ModuleEnvironment,

    metadata: Metadata,
    metadata_tier: MetadataTier,
    link_data: LinkDataTier,

    masm: MasmBuffer,
    func_to_code_range: Vec<u32>,
    exported_funcs: HashSet<u32>,
    call_site_targets: Vec<kestrel_masm::CallSiteTarget>,
    trap_code_offsets: [SetOnce<u32>; Trap::COUNT],
    debug_trap_code_offset: SetOnce<u32>,
    call_far_jumps: Vec<CallFarJump>,
    trap_far_jumps: Vec<TrapFarJump>,
    debug_trap_far_jumps: Vec<PatchHandle>,

    last_patched_call_site: usize,
    start_of_unpatched_callsites: u32,

    work: OutstandingWork,
    free_tasks: Vec<Box<CompileTask>>,
    current_task: Option<Box<CompileTask>>,
    batched_bytecode: u64,

    num_func_defs: u32,
    started_func_defs: bool,
    finished_func_defs: bool,

    stats: GeneratorStats,
}

impl ModuleGenerator {
    /// Prepare a generator: reserve the aggregate buffer and metadata
    /// vectors from `code_section_size`, lay out the global-data area,
    /// assign signature ids, and seed the exported-function set.
    pub fn new(
        args: Arc<CompileArgs>,
        mut env: ModuleEnvironment,
        cancelled: Option<Arc<AtomicBool>>,
        code_section_size: usize,
    ) -> Result<Self> {
        let task_state = Arc::new(TaskState::default());
        let mut metadata = Metadata::default();
        let mut metadata_tier = MetadataTier::new(env.tier);

        let mut masm = MasmBuffer::new();
        let code_estimate = estimate_compiled_code_size(env.tier, code_section_size);
        masm.reserve(code_estimate + code_estimate / 5)?;

        // Only the number of far-jump islands is unknown; twice the number
        // of functions is a conservative bound, trimmed at finalization.
        let num_func_defs = env.num_func_defs() as usize;
        try_reserve(&mut metadata_tier.code_ranges, 2 * num_func_defs)?;

        // Roughly one call/load/store per 10 bytes of bytecode.
        const CALL_SITES_PER_BYTECODE_BYTE: usize = 10;
        const MEMORY_ACCESSES_PER_BYTECODE_BYTE: usize = 10;
        try_reserve(
            &mut metadata_tier.call_sites,
            code_section_size / CALL_SITES_PER_BYTECODE_BYTE,
        )?;
        try_reserve(
            &mut metadata_tier.memory_accesses,
            code_section_size / MEMORY_ACCESSES_PER_BYTECODE_BYTE,
        )?;

        // Lay out TLS-area slots for declarations that need them.

        for i in 0..env.num_func_imports as usize {
            let offset = metadata
                .global_data
                .allocate(FUNC_IMPORT_TLS_BYTES, POINTER_ALIGN)?;
            env.func_import_global_data_offsets[i] = Some(offset);
            let sig = env.func_sig(i as u32).sig.clone();
            metadata_tier.func_imports.push(FuncImport::new(sig, offset));
        }

        for table in &mut env.tables {
            table.global_data_offset =
                Some(metadata.global_data.allocate(TABLE_TLS_BYTES, POINTER_ALIGN)?);
        }

        // Assign signature ids: structurally equal global-form signatures
        // share one slot; everything else encodes its shape inline.
        let mut interned: HashMap<kestrel_env::Sig, SigIdDesc> = HashMap::new();
        for sig_with_id in &mut env.sigs {
            if SigIdDesc::is_global(&sig_with_id.sig) {
                let id = match interned.get(&sig_with_id.sig) {
                    Some(id) => *id,
                    None => {
                        let offset = metadata
                            .global_data
                            .allocate(SIG_ID_SLOT_BYTES, POINTER_ALIGN)?;
                        let id = SigIdDesc::Global {
                            global_data_offset: offset,
                        };
                        interned.insert(sig_with_id.sig.clone(), id);
                        metadata.sig_ids.push(SigWithId {
                            sig: sig_with_id.sig.clone(),
                            id,
                        });
                        id
                    }
                };
                sig_with_id.id = id;
            } else {
                sig_with_id.id = SigIdDesc::immediate(&sig_with_id.sig);
            }
        }

        for global in &mut env.globals {
            if global.is_constant {
                continue;
            }
            let width = global.ty.byte_width();
            global.offset = Some(metadata.global_data.allocate(width, width)?);
        }

        // Seed the exported-function set; element segments of external
        // tables join at finalization.
        let mut exported_funcs = HashSet::new();
        for exp in &env.exports {
            if exp.kind == kestrel_env::DefinitionKind::Function {
                exported_funcs.insert(exp.func_index());
            }
        }
        if let Some(start) = env.start_func_index {
            metadata.start_func_index = Some(start);
            exported_funcs.insert(start);
        }

        metadata.filename = args.filename.clone();
        metadata.source_map_url = args.source_map_url.clone();

        let func_to_code_range = vec![BAD_CODE_RANGE; env.num_funcs() as usize];

        Ok(Self {
            work: OutstandingWork {
                parallel: false,
                outstanding: 0,
                state: task_state,
                hub: args.hub.clone(),
            },
            args,
            cancelled,
            env,
            metadata,
            metadata_tier,
            link_data: LinkDataTier::default(),
            masm,
            func_to_code_range,
            exported_funcs,
            call_site_targets: Vec::new(),
            trap_code_offsets: Default::default(),
            debug_trap_code_offset: SetOnce::default(),
            call_far_jumps: Vec::new(),
            trap_far_jumps: Vec::new(),
            debug_trap_far_jumps: Vec::new(),
            last_patched_call_site: 0,
            start_of_unpatched_callsites: 0,
            free_tasks: Vec::new(),
            current_task: None,
            batched_bytecode: 0,
            num_func_defs: 0,
            started_func_defs: false,
            finished_func_defs: false,
            stats: GeneratorStats::default(),
        })
    }

    #[must_use]
    pub fn stats(&self) -> GeneratorStats {
        self.stats
    }

    fn mode(&self) -> CompileMode {
        self.env.mode
    }

    fn tier(&self) -> Tier {
        self.env.tier
    }

    /// Effective direct-call reach: the tuning knob clamped to the ISA
    /// immediate range.
    fn jump_range(&self) -> u32 {
        self.args
            .tuning
            .jump_range_threshold
            .min(JUMP_IMMEDIATE_RANGE)
    }

    fn func_is_compiled(&self, func_index: u32) -> bool {
        self.func_to_code_range[func_index as usize] != BAD_CODE_RANGE
    }

    fn func_code_range(&self, func_index: u32) -> &CodeRange {
        debug_assert!(self.func_is_compiled(func_index));
        let range = &self.metadata_tier.code_ranges[self.func_to_code_range[func_index as usize] as usize];
        debug_assert!(range.is_function());
        range
    }

    /// Open the streaming phase: size the task pool to the worker pool
    /// (twice the thread count) or to one task for inline compilation.
    pub fn start_func_defs(&mut self) -> Result<()> {
        debug_assert!(!self.started_func_defs);
        debug_assert!(!self.finished_func_defs);

        let num_tasks = match &self.args.hub {
            Some(hub) if hub.max_compile_threads() > 1 => {
                self.work.parallel = true;
                2 * hub.max_compile_threads()
            }
            _ => 1,
        };

        // Signature ids and TLS offsets are final now; workers read a
        // stable snapshot of the environment. Each task keeps its own
        // reference, so the snapshot lives as long as any task does.
        let shared_env = Arc::new(self.env.clone());

        self.free_tasks = (0..num_tasks)
            .map(|_| {
                CompileTask::new(
                    shared_env.clone(),
                    self.work.state.clone(),
                    self.args.func_compiler.clone(),
                )
            })
            .collect();

        debug!(
            parallel = self.work.parallel,
            num_tasks, "starting function definitions"
        );
        self.started_func_defs = true;
        Ok(())
    }

    /// Queue one function body. Bodies may arrive in any order across the
    /// defined functions; a full batch launches a compile task.
    pub fn compile_func_def(
        &mut self,
        func_index: u32,
        line_or_bytecode: u32,
        bytes: Vec<u8>,
    ) -> Result<()> {
        debug_assert!(self.started_func_defs);
        debug_assert!(!self.finished_func_defs);
        debug_assert!(func_index < self.env.num_funcs());

        self.num_func_defs += 1;

        if self.current_task.is_none() {
            if self.free_tasks.is_empty() {
                self.finish_outstanding_task()?;
            }
            self.current_task = Some(self.free_tasks.pop().expect("a free task"));
        }

        let bytecode_length = bytes.len() as u64;
        self.current_task
            .as_mut()
            .expect("current task")
            .inputs
            .push(FuncCompileInput {
                func_index,
                line_or_bytecode,
                bytes,
            });

        let threshold = match self.tier() {
            Tier::Baseline => self.args.tuning.batch_baseline_threshold,
            Tier::Optimized => self.args.tuning.batch_optimized_threshold,
        };

        self.batched_bytecode += bytecode_length;
        if self.batched_bytecode > u64::from(threshold) {
            self.launch_batch_compile()?;
        }
        Ok(())
    }

    /// Close the streaming phase: flush the partial batch and drain every
    /// in-flight task.
    pub fn finish_func_defs(&mut self) -> Result<()> {
        debug_assert!(self.started_func_defs);
        debug_assert!(!self.finished_func_defs);

        if self.current_task.is_some() {
            self.launch_batch_compile()?;
        }

        while self.work.outstanding > 0 {
            self.finish_outstanding_task()?;
        }

        debug_assert_eq!(self.num_func_defs, self.env.num_func_defs());
        self.finished_func_defs = true;
        Ok(())
    }

    fn launch_batch_compile(&mut self) -> Result<()> {
        let mut task = self.current_task.take().expect("a batch to launch");

        if let Some(cancelled) = &self.cancelled {
            if cancelled.load(Ordering::Relaxed) {
                return Err(CodegenError::Cancelled);
            }
        }

        self.stats.batches_launched_total += 1;
        trace!(
            inputs = task.inputs.len(),
            batched_bytecode = self.batched_bytecode,
            "launching compile batch"
        );

        if self.work.parallel {
            let hub = self.args.hub.as_ref().expect("parallel mode has a hub");
            hub.enqueue(task);
            self.work.outstanding += 1;
        } else {
            execute_compile_task(&mut task).map_err(CodegenError::Compile)?;
            self.finish_task(task)?;
        }

        self.batched_bytecode = 0;
        Ok(())
    }

    /// Block until a worker finishes or fails, then merge the finished
    /// task. A stored failure surfaces here, first error wins.
    fn finish_outstanding_task(&mut self) -> Result<()> {
        debug_assert!(self.work.parallel);

        let task = {
            let mut inner = self.work.state.inner.lock().expect("task state poisoned");
            loop {
                debug_assert!(self.work.outstanding > 0);

                if inner.num_failed > 0 {
                    let message = inner
                        .error_message
                        .take()
                        .unwrap_or_else(|| "wasm compile failed".to_string());
                    return Err(CodegenError::Compile(message));
                }

                if let Some(task) = inner.finished.pop() {
                    self.work.outstanding -= 1;
                    break task;
                }

                inner = self
                    .work
                    .state
                    .failed_or_finished
                    .wait(inner)
                    .expect("task state poisoned");
            }
        };

        // Merge outside the completion lock.
        self.finish_task(task)
    }

    /// Merge one finished task into the aggregate buffer, inserting
    /// far-jump islands first if the merge could push pending call sites
    /// out of displacement range.
    fn finish_task(&mut self, mut task: Box<CompileTask>) -> Result<()> {
        self.masm.halting_align(CODE_ALIGNMENT)?;

        let merged_size = u64::from(self.masm.size()) + task.output.bytes.len() as u64;
        if !in_range(
            self.jump_range(),
            u64::from(self.start_of_unpatched_callsites),
            merged_size,
        ) {
            self.start_of_unpatched_callsites = self.masm.size();
            self.link_call_sites()?;
        }

        self.link_compiled_code(&task.output)?;
        self.stats.tasks_merged_total += 1;

        task.output.clear();
        debug_assert!(task.inputs.is_empty());
        debug_assert_eq!(task.arena.allocated_bytes(), 0);
        self.free_tasks.push(task);
        Ok(())
    }

    /// Append a relocatable package at the next aligned offset and shift
    /// every record it carries by the placement offset.
    fn link_compiled_code(&mut self, code: &CompiledCode) -> Result<()> {
        self.masm.halting_align(CODE_ALIGNMENT)?;
        let offset_in_module = self.masm.size();
        self.masm.append_raw_code(&code.bytes)?;

        for range in &code.code_ranges {
            let mut range = *range;
            range.offset_by(offset_in_module);
            let index = self.metadata_tier.code_ranges.len() as u32;
            self.metadata_tier.code_ranges.push(range);
            self.note_code_range(index, range);
        }

        for site in &code.call_sites {
            let mut site = *site;
            site.offset_by(offset_in_module);
            self.metadata_tier.call_sites.push(site);
        }
        self.call_site_targets.extend_from_slice(&code.call_site_targets);
        debug_assert_eq!(
            self.metadata_tier.call_sites.len(),
            self.call_site_targets.len()
        );

        for access in &code.memory_accesses {
            let mut access = *access;
            access.offset_by(offset_in_module);
            self.metadata_tier.memory_accesses.push(access);
        }

        for far in &code.trap_far_jumps {
            let mut far = *far;
            far.offset_by(offset_in_module);
            self.trap_far_jumps.push(far);
        }

        for far in &code.call_far_jumps {
            let mut far = *far;
            far.offset_by(offset_in_module);
            self.call_far_jumps.push(far);
        }

        for access in &code.symbolic_accesses {
            self.link_data
                .symbolic_links
                .push(access.target, offset_in_module + access.patch_at);
        }

        for label in &code.code_labels {
            self.link_data.internal_links.push(crate::metadata::InternalLink {
                patch_at_offset: offset_in_module + label.patch_at,
                target_offset: offset_in_module + label.target,
            });
        }

        Ok(())
    }

    /// Record the side index for a newly merged code range.
    fn note_code_range(&mut self, index: u32, range: CodeRange) {
        match range.kind() {
            CodeRangeKind::Function { func_index, .. } => {
                debug_assert_eq!(
                    self.func_to_code_range[func_index as usize], BAD_CODE_RANGE,
                    "duplicate code range for one function"
                );
                self.func_to_code_range[func_index as usize] = index;
            }
            CodeRangeKind::Entry { func_index } => {
                self.metadata_tier
                    .lookup_func_export_mut(func_index)
                    .entry_offset
                    .set(range.begin());
            }
            CodeRangeKind::ImportJitExit { func_index } => {
                self.metadata_tier.func_imports[func_index as usize]
                    .jit_exit_offset
                    .set(range.begin());
            }
            CodeRangeKind::ImportInterpExit { func_index } => {
                self.metadata_tier.func_imports[func_index as usize]
                    .interp_exit_offset
                    .set(range.begin());
            }
            CodeRangeKind::TrapExit(trap) => {
                self.trap_code_offsets[trap.index()].set(range.begin());
            }
            CodeRangeKind::DebugTrap => {
                self.debug_trap_code_offset.set(range.begin());
            }
            CodeRangeKind::OutOfBoundsExit => {
                self.link_data.out_of_bounds_offset.set(range.begin());
            }
            CodeRangeKind::UnalignedExit => {
                self.link_data.unaligned_access_offset.set(range.begin());
            }
            CodeRangeKind::Interrupt => {
                self.link_data.interrupt_offset.set(range.begin());
            }
            CodeRangeKind::Throw => {
                // Jumped to by other stubs; no side index.
            }
            CodeRangeKind::FarJumpIsland | CodeRangeKind::BuiltinThunk => {
                unreachable!("compiled packages cannot carry link-editor ranges")
            }
        }
    }

    /// Patch every call site recorded since the last pass, inserting
    /// far-jump islands for targets that are out of range (or not yet
    /// compiled). Islands are deduplicated per target within one pass;
    /// each pass starts fresh because the previous pass already flushed
    /// all in-range sites.
    fn link_call_sites(&mut self) -> Result<()> {
        self.masm.halting_align(CODE_ALIGNMENT)?;

        let range = self.jump_range();
        let mut existing_call_far_jumps: HashMap<u32, u32> = HashMap::new();
        let mut existing_trap_far_jumps: [Option<u32>; Trap::COUNT] = [None; Trap::COUNT];

        while self.last_patched_call_site < self.metadata_tier.call_sites.len() {
            let call_site = self.metadata_tier.call_sites[self.last_patched_call_site];
            let target = self.call_site_targets[self.last_patched_call_site];
            self.last_patched_call_site += 1;
            self.stats.call_sites_linked_total += 1;

            let caller_offset = call_site.return_address_offset;
            match call_site.kind {
                CallSiteKind::Dynamic | CallSiteKind::Symbolic => {}
                CallSiteKind::Func => {
                    let func_index = target.func_index();
                    if self.func_is_compiled(func_index) {
                        let callee_offset = self.func_code_range(func_index).func_normal_entry();
                        if in_range(range, u64::from(caller_offset), u64::from(callee_offset)) {
                            self.masm.patch_call(caller_offset, callee_offset);
                            continue;
                        }
                    }

                    let island_offset = match existing_call_far_jumps.get(&func_index) {
                        Some(offset) => *offset,
                        None => {
                            let begin = self.masm.size();
                            let jump = self.masm.far_jump_with_patch()?;
                            let end = self.masm.size();
                            self.call_far_jumps.push(CallFarJump { func_index, jump });
                            self.metadata_tier.code_ranges.push(CodeRange::new(
                                Offsets { begin, end },
                                CodeRangeKind::FarJumpIsland,
                            ));
                            existing_call_far_jumps.insert(func_index, begin);
                            self.stats.far_jump_islands_total += 1;
                            trace!(func_index, begin, "emitted call far-jump island");
                            begin
                        }
                    };
                    self.masm.patch_call(caller_offset, island_offset);
                }
                CallSiteKind::TrapExit => {
                    let trap = target.trap();
                    let island_offset = match existing_trap_far_jumps[trap.index()] {
                        Some(offset) => offset,
                        None => {
                            // The trap-exit contract requires the TLS base
                            // to be reloaded from the frame before leaving
                            // function code.
                            let begin = self.masm.size();
                            self.masm.emit_tls_reload()?;
                            let jump = self.masm.far_jump_with_patch()?;
                            let end = self.masm.size();
                            self.trap_far_jumps.push(TrapFarJump { trap, jump });
                            self.metadata_tier.code_ranges.push(CodeRange::new(
                                Offsets { begin, end },
                                CodeRangeKind::FarJumpIsland,
                            ));
                            existing_trap_far_jumps[trap.index()] = Some(begin);
                            self.stats.far_jump_islands_total += 1;
                            trace!(?trap, begin, "emitted trap far-jump island");
                            begin
                        }
                    };
                    self.masm.patch_call(caller_offset, island_offset);
                }
                CallSiteKind::Breakpoint | CallSiteKind::EnterFrame | CallSiteKind::LeaveFrame => {
                    // One debug island serves every debug site within a
                    // jump-range window; the offsets stay sorted because
                    // call sites are processed in buffer order.
                    let jumps = &self.metadata_tier.debug_trap_far_jump_offsets;
                    let needs_island = match jumps.last() {
                        Some(last) => !in_range(range, u64::from(*last), u64::from(caller_offset)),
                        None => true,
                    };
                    if needs_island {
                        let begin = self.masm.size();
                        self.masm.emit_tls_reload()?;
                        let jump = self.masm.far_jump_with_patch()?;
                        let end = self.masm.size();
                        self.metadata_tier.code_ranges.push(CodeRange::new(
                            Offsets { begin, end },
                            CodeRangeKind::FarJumpIsland,
                        ));
                        self.debug_trap_far_jumps.push(jump);
                        self.metadata_tier.debug_trap_far_jump_offsets.push(begin);
                        self.stats.far_jump_islands_total += 1;
                        trace!(begin, "emitted debug far-jump island");
                    }
                }
            }
        }

        Ok(())
    }

    /// Close the exported-function set: explicit exports were seeded at
    /// init, elements of external tables and the start function join here.
    /// The set becomes the sorted export vector runtime lookup needs.
    fn finish_func_exports(&mut self) -> Result<()> {
        for segment in &self.env.elem_segments {
            if self.env.tables[segment.table_index as usize].external {
                for func_index in &segment.elem_func_indices {
                    self.exported_funcs.insert(*func_index);
                }
            }
        }

        let mut sorted: Vec<u32> = self.exported_funcs.iter().copied().collect();
        sorted.sort_unstable();

        debug_assert!(self.metadata_tier.func_exports.is_empty());
        try_reserve(&mut self.metadata_tier.func_exports, sorted.len())?;
        for func_index in sorted {
            let sig = self.env.func_sig(func_index).sig.clone();
            self.metadata_tier
                .func_exports
                .push(FuncExport::new(sig, func_index));
        }
        Ok(())
    }

    /// Patch all remaining call sites and every recorded far jump. Linking
    /// can itself emit islands, so the pass order matters: call sites
    /// first, then the far-jump targets they created.
    fn finish_linking(&mut self) -> Result<()> {
        #[cfg(debug_assertions)]
        for index in &self.func_to_code_range {
            debug_assert_ne!(*index, BAD_CODE_RANGE, "function never compiled");
        }

        self.link_call_sites()?;

        for far in std::mem::take(&mut self.call_far_jumps) {
            let entry = self.func_code_range(far.func_index).func_normal_entry();
            self.masm.patch_far_jump(far.jump, entry);
        }

        for far in std::mem::take(&mut self.trap_far_jumps) {
            let offset = self.trap_code_offsets[far.trap.index()]
                .get()
                .expect("trap exit stub was never linked");
            self.masm.patch_far_jump(far.jump, offset);
        }

        for jump in std::mem::take(&mut self.debug_trap_far_jumps) {
            let offset = self
                .debug_trap_code_offset
                .get()
                .expect("debug trap stub was never linked");
            self.masm.patch_far_jump(jump, offset);
        }

        Ok(())
    }

    /// Freeze module-wide metadata: move the environment's vectors over,
    /// page-align the global-data area, resolve code-range indices, and
    /// record the debug extras.
    fn finish_metadata(&mut self, bytecode: &[u8]) -> Result<()> {
        #[cfg(debug_assertions)]
        {
            let mut last_end = 0;
            for range in &self.metadata_tier.code_ranges {
                debug_assert!(range.begin() >= last_end, "code ranges out of order");
                last_end = range.end();
            }
            let mut last_offset = 0;
            for offset in &self.metadata_tier.debug_trap_far_jump_offsets {
                debug_assert!(*offset >= last_offset);
                last_offset = *offset;
            }
        }

        self.metadata.memory_usage = self.env.memory_usage;
        self.metadata.min_memory_length = self.env.min_memory_length;
        self.metadata.max_memory_length = self.env.max_memory_length;
        self.metadata.tables = std::mem::take(&mut self.env.tables);
        self.metadata.globals = std::mem::take(&mut self.env.globals);
        self.metadata.custom_sections = std::mem::take(&mut self.env.custom_sections);

        // The instance allocator works in whole pages.
        self.metadata.global_data.page_align();

        self.metadata_tier.shrink_to_fit();

        // Every function has a code range now; complete the exports and
        // element segments with their code-range indices.
        for fe in &mut self.metadata_tier.func_exports {
            fe.code_range_index = Some(self.func_to_code_range[fe.func_index as usize]);
        }

        let tier = self.tier();
        for segment in &mut self.env.elem_segments {
            debug_assert!(segment.code_range_indices(tier).is_empty());
            let mut indices = Vec::new();
            try_reserve(&mut indices, segment.elem_func_indices.len())?;
            for func_index in &segment.elem_func_indices {
                indices.push(self.func_to_code_range[*func_index as usize]);
            }
            *segment.code_range_indices_mut(tier) = indices;
        }

        if self.env.debug_enabled {
            let num_funcs = self.env.num_funcs();
            let mut func_arg_types = Vec::new();
            let mut func_return_types = Vec::new();
            try_reserve(&mut func_arg_types, num_funcs as usize)?;
            try_reserve(&mut func_return_types, num_funcs as usize)?;
            for func_index in 0..num_funcs {
                let sig = &self.env.func_sig(func_index).sig;
                func_arg_types.push(sig.args.clone());
                func_return_types.push(sig.ret);
            }

            self.metadata_tier.debug_func_to_code_range = self.func_to_code_range.clone();

            let mut hasher = Sha1::new();
            hasher.update(bytecode);
            let module_hash = hasher.finalize().into();

            self.metadata.debug = Some(crate::metadata::DebugMetadata {
                func_arg_types,
                func_return_types,
                module_hash,
            });
        }

        Ok(())
    }

    /// Run the closing sequence: exports, stubs, final linking, metadata,
    /// and publication of the frozen buffer as a code segment.
    fn finish_code_segment(&mut self, bytecode: &[u8]) -> Result<CodeSegment> {
        debug_assert!(self.finished_func_defs);

        self.finish_func_exports()?;

        // All imports and exports are known; generate and merge the stub
        // package. Stub code is always the last merge.
        let mut stub_code = CompiledCode::default();
        self.args
            .stub_compiler
            .generate_stubs(
                &self.env,
                &self.metadata_tier.func_imports,
                &self.metadata_tier.func_exports,
                &mut stub_code,
            )
            .map_err(CodegenError::Compile)?;
        self.link_compiled_code(&stub_code)?;

        // Stubs introduce new call sites, and linking them can emit a last
        // few islands; only then are all far jumps patchable.
        self.finish_linking()?;
        self.finish_metadata(bytecode)?;

        debug!(
            code_bytes = self.masm.size(),
            code_ranges = self.metadata_tier.code_ranges.len(),
            islands = self.stats.far_jump_islands_total,
            "module code generation finished"
        );

        let masm = std::mem::take(&mut self.masm);
        Ok(CodeSegment::publish(masm.finish(), &self.link_data))
    }

    /// Entry for tier-1 dispatch: function index → published tier-entry
    /// offset, sized to the full function index space. Import indices keep
    /// the unassigned sentinel offset of zero.
    fn create_jump_table(&self) -> JumpTable {
        debug_assert_eq!(self.mode(), CompileMode::Tier1);
        let mut entries = vec![0u32; self.env.num_funcs() as usize];
        for range in &self.metadata_tier.code_ranges {
            if range.is_function() {
                entries[range.func_index() as usize] = range.func_tier_entry();
            }
        }
        JumpTable::new(entries)
    }

    /// Finish a once/tier-1 generation into the immutable module artifact.
    pub fn finish_module(mut self, bytecode: ShareableBytes) -> Result<Module> {
        debug_assert!(matches!(
            self.mode(),
            CompileMode::Once | CompileMode::Tier1
        ));

        let segment = self.finish_code_segment(&bytecode)?;

        let jump_table = (self.mode() == CompileMode::Tier1).then(|| self.create_jump_table());

        // Debuggers may patch published code in place; keep a pristine
        // copy to read original bytes from.
        let debug_bytes = self
            .env
            .debug_enabled
            .then(|| segment.bytes().to_vec());

        let artifact = TierArtifact {
            tier: self.tier(),
            metadata: self.metadata_tier,
            link_data: self.link_data,
            segment,
        };

        Ok(Module::new(
            self.args.assumptions.clone(),
            bytecode,
            std::mem::take(&mut self.env.imports),
            std::mem::take(&mut self.env.exports),
            std::mem::take(&mut self.env.data_segments),
            std::mem::take(&mut self.env.elem_segments),
            self.metadata,
            artifact,
            debug_bytes,
            jump_table,
        ))
    }

    /// Finish a tier-2 generation by atomically publishing the new code
    /// into an already-running module.
    pub fn finish_tier2(mut self, module: &Module) -> Result<()> {
        debug_assert_eq!(self.mode(), CompileMode::Tier2);
        debug_assert_eq!(self.tier(), Tier::Optimized);
        debug_assert!(!self.env.debug_enabled);

        if let Some(cancelled) = &self.cancelled {
            if cancelled.load(Ordering::Relaxed) {
                return Err(CodegenError::Cancelled);
            }
        }

        let segment = self.finish_code_segment(module.bytecode())?;

        module.publish_tier2(TierArtifact {
            tier: self.tier(),
            metadata: self.metadata_tier,
            link_data: self.link_data,
            segment,
        });
        Ok(())
    }
}

fn try_reserve<T>(vec: &mut Vec<T>, additional: usize) -> Result<()> {
    vec.try_reserve(additional)
        .map_err(|_| CodegenError::OutOfMemory)
}
