//! Compile tasks and the shared completion state between the generator
//! and its workers.

use std::sync::{Arc, Condvar, Mutex};

use bumpalo::Bump;
use kestrel_env::ModuleEnvironment;
use kestrel_masm::{CodeRange, CompiledCode};

use crate::FuncCompiler;

/// One function body queued for compilation.
#[derive(Debug, Clone)]
pub struct FuncCompileInput {
    pub func_index: u32,
    /// Source line (asm-js-style frontends) or bytecode offset of the body,
    /// recorded into the function's code range for debugging.
    pub line_or_bytecode: u32,
    pub bytes: Vec<u8>,
}

/// A worker-bound unit of compilation: a scratch arena, the current input
/// batch, and the output package. Once launched, the task is owned by the
/// worker until completion re-enqueues it on the generator's finished list.
pub struct CompileTask {
    pub(crate) env: Arc<ModuleEnvironment>,
    pub(crate) state: Arc<TaskState>,
    pub(crate) compiler: Arc<dyn FuncCompiler>,
    pub(crate) arena: Bump,
    pub(crate) inputs: Vec<FuncCompileInput>,
    pub(crate) output: CompiledCode,
}

impl CompileTask {
    pub(crate) fn new(
        env: Arc<ModuleEnvironment>,
        state: Arc<TaskState>,
        compiler: Arc<dyn FuncCompiler>,
    ) -> Box<Self> {
        Box::new(Self {
            env,
            state,
            compiler,
            arena: Bump::new(),
            inputs: Vec::new(),
            output: CompiledCode::default(),
        })
    }
}

/// Run a task's batch through its tier compiler.
///
/// On success the arena is reset, the inputs are cleared, and the output
/// holds exactly one Function code range per input, in input order. On
/// failure the task is left ready for reset and the message is returned.
pub(crate) fn execute_compile_task(task: &mut CompileTask) -> std::result::Result<(), String> {
    debug_assert!(task.output.is_empty());

    let env = task.env.clone();
    let compiler = task.compiler.clone();
    compiler.compile_functions(&env, env.tier, &task.arena, &task.inputs, &mut task.output)?;

    task.arena.reset();

    debug_assert_eq!(
        task.inputs.len(),
        task.output.code_ranges.len(),
        "one code range per compiled function"
    );
    debug_assert!(task
        .inputs
        .iter()
        .zip(&task.output.code_ranges)
        .all(|(input, range): (&FuncCompileInput, &CodeRange)| {
            range.is_function() && range.func_index() == input.func_index
        }));

    task.inputs.clear();
    Ok(())
}

/// Completion channel shared by the generator and every worker running one
/// of its tasks. A single mutex guards the finished list and the failure
/// state; `failed_or_finished` wakes the generator for either.
#[derive(Default)]
pub(crate) struct TaskState {
    pub(crate) inner: Mutex<TaskStateInner>,
    pub(crate) failed_or_finished: Condvar,
}

#[derive(Default)]
pub(crate) struct TaskStateInner {
    pub(crate) finished: Vec<Box<CompileTask>>,
    pub(crate) num_failed: usize,
    /// First compile error wins; later failures keep the original message.
    pub(crate) error_message: Option<String>,
}

impl TaskState {
    pub(crate) fn deliver(&self, task: Box<CompileTask>, result: std::result::Result<(), String>) {
        let mut inner = self.inner.lock().expect("task state poisoned");
        match result {
            Ok(()) => inner.finished.push(task),
            Err(message) => {
                inner.num_failed += 1;
                inner.error_message.get_or_insert(message);
            }
        }
        self.failed_or_finished.notify_one();
    }
}
