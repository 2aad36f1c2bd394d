//! The shared compile worker pool.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::task::{execute_compile_task, CompileTask, TaskState};

/// A fixed set of worker threads draining a shared worklist of compile
/// tasks. Several generators may share one hub; completion is delivered
/// through each task's own [`TaskState`], so the hub itself carries no
/// per-generator state beyond the queued tasks.
pub struct CompileHub {
    shared: Arc<HubShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct HubShared {
    queue: Mutex<Worklist>,
    work_available: Condvar,
}

struct Worklist {
    tasks: VecDeque<Box<CompileTask>>,
    shutting_down: bool,
}

impl CompileHub {
    /// Spawn a hub with `num_threads` workers (at least one).
    #[must_use]
    pub fn new(num_threads: usize) -> Arc<Self> {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(HubShared {
            queue: Mutex::new(Worklist {
                tasks: VecDeque::new(),
                shutting_down: false,
            }),
            work_available: Condvar::new(),
        });

        let workers = (0..num_threads)
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("kestrel-compile-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn compile worker")
            })
            .collect();

        Arc::new(Self { shared, workers })
    }

    /// Number of worker threads; the generator sizes its task pool to
    /// twice this so workers never idle while batches accumulate.
    #[must_use]
    pub fn max_compile_threads(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn enqueue(&self, task: Box<CompileTask>) {
        let mut queue = self.shared.queue.lock().expect("worklist poisoned");
        debug_assert!(!queue.shutting_down);
        queue.tasks.push_back(task);
        self.shared.work_available.notify_one();
    }

    /// Remove still-queued tasks belonging to `state` (a shutting-down
    /// generator), returning how many were discarded. In-flight tasks are
    /// unaffected; the caller must still wait for them.
    pub(crate) fn remove_queued_for(&self, state: &Arc<TaskState>) -> usize {
        let mut queue = self.shared.queue.lock().expect("worklist poisoned");
        let before = queue.tasks.len();
        queue.tasks.retain(|task| !Arc::ptr_eq(&task.state, state));
        before - queue.tasks.len()
    }
}

impl Drop for CompileHub {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().expect("worklist poisoned");
            queue.shutting_down = true;
            // Queued tasks left by misbehaving callers are dropped; their
            // generators have already detached.
            queue.tasks.clear();
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &HubShared) {
    loop {
        let mut task = {
            let mut queue = shared.queue.lock().expect("worklist poisoned");
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                if queue.shutting_down {
                    return;
                }
                queue = shared
                    .work_available
                    .wait(queue)
                    .expect("worklist poisoned");
            }
        };

        let result = execute_compile_task(&mut task);
        let state = task.state.clone();
        state.deliver(task, result);
    }
}
