//! `forktask`: a work-stealing runtime for fork/join and futures-style
//! fine-grained task parallelism over a fixed pool of OS threads.
//!
//! A [`Runtime`] owns one thread per [`RuntimeConfig::num_workers`]; the
//! thread that calls [`Runtime::init`] becomes the master and is handed
//! back as that runtime's first [`Worker`], the rest run the scheduler loop
//! in the background. Work is submitted with [`spawn`] (fire-and-forget,
//! joined with [`join::sync`]) or [`spawn_future`] (result collected with
//! [`future::await_future`]); [`loop_split::spawn_loop_reduce`] spawns a
//! splittable, reducible loop. Every one of these calls takes an explicit
//! `&mut Worker` rather than reaching for thread-local state, so the
//! borrow checker enforces the single-owner-per-deque invariant the
//! protocol depends on.
//!
//! Several axes of the stealing/splitting/backoff protocol are selected at
//! compile time via Cargo features (`steal-one`/`steal-half`/
//! `steal-adaptive`, `split-half`/`split-guided`/`split-adaptive`,
//! `victim-random`/`victim-last-victim`/`victim-last-thief`,
//! `backoff-sleep`/`backoff-condvar`/`backoff-none`,
//! `future-eager`/`future-lazy`); see each module's docs for what a given
//! choice changes. Axes that are plain numbers live in [`RuntimeConfig`]
//! instead.
//!
//! Fatal protocol violations (not user errors — see [`error::RuntimeError`]
//! for those) go through [`error::fatal`], which logs via `tracing` and
//! aborts; there is no recovery path for a broken deque or double-consumed
//! future.

pub mod channel;
pub mod config;
pub mod deque;
pub mod error;
pub mod future;
pub mod join;
pub mod loop_split;
mod scheduler;
pub mod steal;
pub mod task;
pub mod worker_tree;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use future::{await_future, AwaitAll};
pub use join::{sync, JoinCounter};
pub use loop_split::{spawn_loop_reduce, LoopFuture};
pub use scheduler::{check_for_steal_requests, with_current_worker, Worker};

use scheduler::Shared;
use std::sync::Arc;
use task::{Task, TaskRef};

/// Owns the worker pool for one run. Created on the thread that will act as
/// the master; every other worker runs [`Worker::schedule_forever`]-style
/// scheduling in its own background thread until [`Runtime::exit`] (or
/// dropping the `Runtime`) broadcasts shutdown.
pub struct Runtime {
    shared: Arc<Shared>,
    master: Option<Worker>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Runtime {
    /// Builds the pool and spawns every background worker's thread; the
    /// calling thread is not spawned and instead becomes [`Runtime::master`]
    /// (`spec.md` §4.8 `init()`).
    pub fn init(config: RuntimeConfig) -> Self {
        let shared = Shared::new(config);
        let num_workers = shared.num_workers();
        let mut workers: Vec<Worker> = (0..num_workers).map(|id| Worker::new(id, shared.clone())).collect();
        let master = workers.remove(0);
        let threads = workers
            .into_iter()
            .map(|mut w| {
                std::thread::Builder::new()
                    .name(format!("forktask-{}", w.id()))
                    .spawn(move || w.schedule_forever())
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { shared, master: Some(master), threads }
    }

    /// Reads [`RuntimeConfig::from_env`] and builds the pool from it
    /// (`spec.md` §6, `NUM_THREADS`).
    pub fn from_env() -> Result<Self, RuntimeError> {
        Ok(Self::init(RuntimeConfig::from_env()?))
    }

    /// The calling thread's own worker handle. Every `spawn*` call and
    /// `await`/`sync`/`reduce` needs one.
    pub fn master(&mut self) -> &mut Worker {
        self.master.as_mut().expect("master worker taken by a prior Runtime::exit call")
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers()
    }

    /// Runs the master's own scheduling loop until every worker is
    /// quiescent: no worker has a non-empty deque, a splittable loop task
    /// in flight, or an outstanding steal request anywhere in the tree
    /// (`spec.md` §4.8 `barrier()`).
    pub fn barrier(&mut self) {
        self.master().barrier();
    }

    /// Runs a final [`Runtime::barrier`], then lets `Drop` broadcast the
    /// shutdown pseudo-task down the worker tree and join every background
    /// thread (`spec.md` §4.8 `exit()`).
    pub fn exit(mut self) {
        self.barrier();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(master) = self.master.take() {
            master.broadcast_shutdown();
        } else {
            self.shared.signal_exit();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------
// spawn / spawn_future / spawn_async
// ---------------------------------------------------------------------

/// Packs an owning closure behind a single pointer-sized task argument so it
/// fits the task's fixed-size inline payload regardless of the closure's own
/// size (`spec.md` §9's note on argument packing); every `spawn*` flavour
/// below differs only in what else rides along in the box.
struct PlainPayload<F> {
    f: F,
}

struct JoinedPayload<F> {
    counter: *const JoinCounter,
    f: F,
}

struct FuturePayload<T, F> {
    producer: future::Producer<T>,
    f: F,
}

/// Spawns a fire-and-forget child task (`spec.md` §5's plain fork, no
/// future attached). `parent` should be the spawning task's own
/// [`TaskRef`] (via [`Worker::current_task`]) so [`Worker::pop_child`] can
/// find it; pass `None` only when spawning directly from the master outside
/// any task.
pub fn spawn<F>(worker: &mut Worker, parent: Option<TaskRef>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    unsafe fn trampoline<F: FnOnce() + Send + 'static>(task: *mut Task) {
        // SAFETY: this task's payload was packed by `spawn` below with this
        // exact `F`, and a task's trampoline runs at most once.
        let raw: *mut PlainPayload<F> = unsafe { (*task).unpack() };
        let payload = unsafe { *Box::from_raw(raw) };
        (payload.f)();
    }

    let mut task = worker.task_alloc();
    task.parent = parent;
    task.func = Some(trampoline::<F>);
    let raw = Box::into_raw(Box::new(PlainPayload { f }));
    task.pack(raw);
    worker.push(task);
}

/// Spawns a child task joined against `counter`: `counter` is incremented
/// here and decremented when the task finishes running, so
/// [`join::sync`] can block (without blocking the OS thread) until every
/// child registered this way has completed — the `ASYNC`/`SYNC` pattern
/// from `original_source/include/async.h`.
///
/// # Safety
/// `counter` must stay valid until every task spawned against it has run to
/// completion. Calling [`join::sync`] on `counter` before it is dropped
/// (and before returning from the scope that owns it) guarantees this.
pub unsafe fn spawn_async<F>(worker: &mut Worker, parent: Option<TaskRef>, counter: &JoinCounter, f: F)
where
    F: FnOnce() + Send + 'static,
{
    unsafe fn trampoline<F: FnOnce() + Send + 'static>(task: *mut Task) {
        // SAFETY: see `spawn_async`'s contract; the packed pointer is valid
        // for the lifetime of this call by that contract.
        let raw: *mut JoinedPayload<F> = unsafe { (*task).unpack() };
        let payload = unsafe { *Box::from_raw(raw) };
        (payload.f)();
        unsafe { (*payload.counter).dec() };
    }

    counter.inc();
    let mut task = worker.task_alloc();
    task.parent = parent;
    task.func = Some(trampoline::<F>);
    let raw = Box::into_raw(Box::new(JoinedPayload { counter: counter as *const JoinCounter, f }));
    task.pack(raw);
    worker.push(task);
}

cfg_if::cfg_if! {
    if #[cfg(feature = "future-lazy")] {
        fn future_upgrade_hook<T, F>() -> Option<unsafe fn(*mut Task, usize)>
        where
            T: Send + 'static,
            F: Send + 'static,
        {
            unsafe fn hook<T: Send + 'static, F: Send + 'static>(task: *mut Task, channel_cache_limit: usize) {
                // SAFETY: called at most once, before the task runs, on a
                // payload packed by `spawn_future::<T, F>` below.
                let raw: *mut FuturePayload<T, F> = unsafe { (*task).unpack() };
                let payload = unsafe { &*raw };
                payload.producer.cell().upgrade(channel_cache_limit);
            }
            Some(hook::<T, F>)
        }
    } else {
        fn future_upgrade_hook<T, F>() -> Option<unsafe fn(*mut Task, usize)> {
            None
        }
    }
}

/// Spawns a child task that produces a value, returning a [`future::Future`]
/// the caller later resolves with [`future::await_future`] (`spec.md` §3.5).
pub fn spawn_future<T, F>(worker: &mut Worker, parent: Option<TaskRef>, f: F) -> future::Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    unsafe fn trampoline<T: Send + 'static, F: FnOnce() -> T + Send + 'static>(task: *mut Task) {
        // SAFETY: payload packed by `spawn_future::<T, F>` below, run once.
        let raw: *mut FuturePayload<T, F> = unsafe { (*task).unpack() };
        let payload = unsafe { *Box::from_raw(raw) };
        let value = (payload.f)();
        payload.producer.set(value);
    }

    let channel_cache_limit = worker.shared.config.channel_cache;
    let (producer, fut) = future::future_pair::<T>(channel_cache_limit);
    let mut task = worker.task_alloc();
    task.parent = parent;
    task.func = Some(trampoline::<T, F>);
    task.has_future = true;
    task.future_upgrade_hook = future_upgrade_hook::<T, F>();
    let raw = Box::into_raw(Box::new(FuturePayload { producer, f }));
    task.pack(raw);
    worker.push(task);
    fut
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn spawn_and_barrier_runs_the_task() {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(1).build().unwrap());
        let ran = StdArc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        spawn(rt.master(), None, move || {
            ran2.fetch_add(1, Ordering::Relaxed);
        });
        rt.barrier();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        rt.exit();
    }

    #[test]
    fn spawn_future_delivers_result_single_worker() {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(1).build().unwrap());
        let fut = spawn_future(rt.master(), None, || 2 + 2);
        let result = await_future(rt.master(), &fut);
        assert_eq!(result, 4);
        rt.exit();
    }

    #[test]
    fn spawn_async_join_counter_reaches_zero() {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(1).build().unwrap());
        let counter = JoinCounter::new();
        let seen = StdArc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let seen = seen.clone();
            // SAFETY: `sync` is called below before `counter` goes out of
            // scope, so every spawned child runs to completion first.
            unsafe {
                spawn_async(rt.master(), None, &counter, move || {
                    seen.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        sync(rt.master(), &counter);
        assert_eq!(seen.load(Ordering::Relaxed), 5);
        rt.exit();
    }

    #[test]
    fn multi_worker_loop_reduce_sums_a_range() {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(4).build().unwrap());
        let fut = spawn_loop_reduce(rt.master(), None, 0..1000, 16, 16, 0i64, |i| i, |a, b| a + b);
        let result = fut.reduce(rt.master());
        assert_eq!(result, (0..1000i64).sum::<i64>());
        rt.exit();
    }
}
