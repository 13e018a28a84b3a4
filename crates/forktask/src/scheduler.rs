//! The per-worker scheduler loop and steal-request protocol (`spec.md`
//! §4.4/§4.5/§4.8). Every other module in this crate (deque, channel,
//! steal request, worker tree, loop split, future) is passive data; this
//! is where they are wired together and driven.
//!
//! Grounded on `original_source/src/runtime.c`'s `schedule`/`RT_barrier`/
//! `try_send_steal_request`/`decline_steal_request`/`handle_steal_request`/
//! `next_victim`/`RECV_REQ` family, translated from file-scope `PRIVATE`
//! globals (one set per OS thread, per `spec.md` §9's note on thread-local
//! state) into an explicitly-passed `&mut Worker`.

use crate::channel::MpscChannel;
use crate::config::{RuntimeConfig, STEAL_ADAPTIVE_INTERVAL};
use crate::deque::{Batch, Deque};
use crate::loop_split;
use crate::steal::{self, StealRequest, StealState};
use crate::task::{Task, TaskRef};
use crate::worker_tree::{self, TreeFlags};
use parking_lot::{Condvar, Mutex};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Generous relative to `max_steal`: worst case is every other worker's
/// request in flight simultaneously, plus one lifeline each.
fn inbox_capacity(num_workers: usize, max_steal: usize) -> usize {
    (num_workers * max_steal * 2).max(4)
}

/// Process-wide state every worker holds an `Arc` to. Per `spec.md` §9,
/// this is deliberately small: the `tasking_finished` flag, the per-worker
/// inboxes, the worker count, and the (always-allocated, conditionally
/// used) condvars for the `backoff-condvar` build.
pub struct Shared {
    pub(crate) config: RuntimeConfig,
    inboxes: Vec<MpscChannel<StealRequest>>,
    tasking_finished: AtomicBool,
    quiescent: AtomicBool,
    /// Best-effort, racy hint consulted only when `config.victim_check` is
    /// set; never relied on for correctness.
    has_tasks: Vec<AtomicBool>,
    wake: Vec<(Mutex<bool>, Condvar)>,
}

// SAFETY: every field is `Send`/`Sync` on its own account except that
// `Shared` is only ever reached through an `Arc`, which already requires
// that; stated for documentation.
unsafe impl Sync for Shared {}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig) -> Arc<Self> {
        let n = config.num_workers;
        let cap = inbox_capacity(n, config.max_steal);
        Arc::new(Self {
            inboxes: (0..n).map(|_| MpscChannel::new(cap)).collect(),
            tasking_finished: AtomicBool::new(false),
            quiescent: AtomicBool::new(false),
            has_tasks: (0..n).map(|_| AtomicBool::new(false)).collect(),
            wake: (0..n).map(|_| (Mutex::new(false), Condvar::new())).collect(),
            config,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn is_quiescent(&self) -> bool {
        self.quiescent.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.tasking_finished.load(Ordering::Acquire)
    }

    /// `spec.md` §4.8 `exit_signal()`: "racy set is acceptable; the
    /// broadcast in shutdown establishes causality."
    pub fn signal_exit(&self) {
        self.tasking_finished.store(true, Ordering::Relaxed);
    }
}

/// One worker's private scheduling state: deque, tree position, the
/// steal-request machinery, and bookkeeping for the adaptive/last-victim
/// policies. Touched only by the OS thread that owns it.
pub struct Worker {
    id: usize,
    pub(crate) shared: Arc<Shared>,
    deque: Deque,
    tree: TreeFlags,
    reply_channels: Vec<Arc<crate::channel::SpscChannel<Batch>>>,
    free_idx: Vec<usize>,
    lifeline_queue: VecDeque<StealRequest>,
    last_victim: Option<usize>,
    last_thief: Option<usize>,
    current_task: Vec<TaskRef>,
    rng: StdRng,
    steal_half_mode: bool,
    tasks_exec_recently: usize,
    steals_exec_recently: usize,
    backoff_exp_us: u64,
}

// SAFETY: a `Worker` is created for, and moved into, exactly one OS thread
// (the thread that runs it for the rest of its life); it is never shared.
// The only fields that are not `Send` on their own account are the raw
// `TaskRef`s in `current_task`, which point at tasks this same thread
// exclusively owns while they are executing.
unsafe impl Send for Worker {}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        let max_id = shared.num_workers() - 1;
        let max_steal = shared.config.max_steal.max(1);
        Self {
            id,
            tree: TreeFlags::new(id, max_id),
            reply_channels: (0..max_steal).map(|_| Arc::new(crate::channel::SpscChannel::new(1))).collect(),
            free_idx: (0..max_steal).collect(),
            deque: Deque::new(),
            lifeline_queue: VecDeque::with_capacity(2),
            last_victim: None,
            last_thief: None,
            current_task: Vec::new(),
            rng: StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15 ^ id as u64),
            steal_half_mode: initial_steal_half_mode(),
            tasks_exec_recently: 0,
            steals_exec_recently: 0,
            backoff_exp_us: 1,
            shared,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn num_workers(&self) -> usize {
        self.shared.num_workers()
    }

    pub fn current_task(&self) -> Option<TaskRef> {
        self.current_task.last().copied()
    }

    pub fn task_alloc(&mut self) -> Box<Task> {
        self.deque.task_alloc()
    }

    /// Pushes a task onto this worker's deque (`spec.md` §4.5 "On each
    /// push"): insert, clear a set `quiescent` at the root, walk the
    /// lifeline queue, then drain the inbox.
    pub fn push(&mut self, task: Box<Task>) {
        self.deque.push(task);
        self.mark_has_tasks();
        if self.id == 0 {
            self.shared.quiescent.store(false, Ordering::Release);
        }
        self.serve_lifelines();
        self.drain_inbox();
    }

    pub(crate) fn pop(&mut self) -> Option<Box<Task>> {
        self.deque.pop()
    }

    pub fn pop_child(&mut self, parent: TaskRef) -> Option<Box<Task>> {
        self.deque.pop_child(parent)
    }

    /// Runs `task` to completion, tracking it as the current task so
    /// `pop_child`/loop-splitting/steal-handling can see it, and publishing
    /// itself to [`CURRENT_WORKER`] so a long-running loop body can poll
    /// for steal requests without a `Worker` handle threaded through its
    /// function pointer (`spec.md` §4.7).
    pub(crate) fn execute(&mut self, task: Box<Task>) {
        let raw: *mut Task = Box::into_raw(task);
        // SAFETY: `raw` was just produced by `Box::into_raw`, so it is
        // non-null.
        let ptr = unsafe { TaskRef::new_unchecked(raw) };
        self.current_task.push(ptr);
        let prev_worker = CURRENT_WORKER.with(|cell| cell.replace(self as *mut Worker));
        // SAFETY: this task is exclusively owned by this worker until it is
        // reconstituted into a `Box` below; nothing else touches it.
        let f = unsafe { (*raw).func }.expect("executing a task with no function pointer");
        unsafe { f(raw) };
        CURRENT_WORKER.with(|cell| cell.set(prev_worker));
        self.current_task.pop();
        self.tasks_exec_recently += 1;
        // SAFETY: `raw` is the same allocation handed to `Box::into_raw`
        // above, not freed or aliased since.
        let task = unsafe { Box::from_raw(raw) };
        self.deque.task_cache(task);
        self.clear_has_tasks();
    }

    fn mark_has_tasks(&self) {
        self.shared.has_tasks[self.id].store(true, Ordering::Relaxed);
    }

    fn clear_has_tasks(&self) {
        let splittable = self.current_task().map(|t| unsafe { loop_split::splittable(t.as_ref()) }).unwrap_or(false);
        if self.deque.is_empty() && !splittable {
            self.shared.has_tasks[self.id].store(false, Ordering::Relaxed);
        }
    }

    // -------------------------------------------------------------
    // Steal-request protocol (`spec.md` §4.4)
    // -------------------------------------------------------------

    #[cfg(feature = "steal-adaptive")]
    fn maybe_adapt_steal_discipline(&mut self) {
        if self.steals_exec_recently >= STEAL_ADAPTIVE_INTERVAL {
            let ratio = self.tasks_exec_recently as f64 / STEAL_ADAPTIVE_INTERVAL as f64;
            if self.steal_half_mode && ratio < 2.0 {
                self.steal_half_mode = false;
            } else if !self.steal_half_mode && ratio == 1.0 {
                self.steal_half_mode = true;
            }
            self.tasks_exec_recently = 0;
            self.steals_exec_recently = 0;
        }
    }

    #[cfg(not(feature = "steal-adaptive"))]
    fn maybe_adapt_steal_discipline(&mut self) {}

    /// If `STEAL_EARLY` is configured, issues a `WORKING`-state steal
    /// request as soon as this worker's own deque drops to (or below) the
    /// threshold, rather than waiting to run completely dry (`spec.md`
    /// §4.4 "early when its deque drops below a threshold", §6
    /// `STEAL_EARLY`). A no-op with every reply slot already outstanding.
    fn maybe_send_early_steal_request(&mut self) {
        if let Some(threshold) = self.shared.config.steal_early {
            if self.deque.len() <= threshold {
                self.send_steal_request(false);
            }
        }
    }

    /// Sends a fresh steal request if we have a free reply-channel slot
    /// (`outstanding < MAXSTEAL`, tracked implicitly by `free_idx`).
    pub(crate) fn send_steal_request(&mut self, idle: bool) {
        if self.shared.num_workers() == 1 {
            return;
        }
        let Some(idx) = self.free_idx.pop() else { return };
        self.maybe_adapt_steal_discipline();
        let reply = self.reply_channels[idx].clone();
        let state = if idle { StealState::Idle } else { StealState::Working };
        let mut req = StealRequest::new(self.id, self.shared.num_workers(), reply, state, self.steal_half_mode);
        let Some(victim) = self.pick_initial_victim(&mut req) else {
            // No eligible victim at all (shouldn't happen for N > 1, but
            // the victim-check fast path can filter everything out).
            self.free_idx.push(idx);
            return;
        };
        self.route(victim, req);
    }

    fn pick_initial_victim(&mut self, req: &mut StealRequest) -> Option<usize> {
        req.remove_victim(self.id);
        let candidates = self.maybe_filter_by_has_tasks(req.victims);
        cfg_if::cfg_if! {
            if #[cfg(feature = "victim-last-victim")] {
                if let Some(v) = self.last_victim {
                    if candidates & (1u64 << v) != 0 {
                        return Some(v);
                    }
                }
            } else if #[cfg(feature = "victim-last-thief")] {
                if let Some(v) = self.last_thief {
                    if candidates & (1u64 << v) != 0 {
                        return Some(v);
                    }
                }
            }
        }
        steal::select_victim(candidates, None, None, &mut self.rng)
    }

    fn maybe_filter_by_has_tasks(&self, candidates: u64) -> u64 {
        if !self.shared.config.victim_check {
            return candidates;
        }
        let mut filtered = 0u64;
        let mut bits = candidates;
        while bits != 0 {
            let i = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            if self.shared.has_tasks[i].load(Ordering::Relaxed) {
                filtered |= 1u64 << i;
            }
        }
        if filtered == 0 { candidates } else { filtered }
    }

    /// Picks where to forward a circulating request next: self is always
    /// excluded; at `MAX_STEAL_ATTEMPTS` (or if no candidate remains) it
    /// goes back to the requester; known-idle subtrees are pruned from the
    /// candidate set first. Unlike [`Worker::pick_initial_victim`], this
    /// never consults `last_victim`/`last_thief` — those hints only apply
    /// to a worker's own first send, exactly as in the original.
    fn next_hop(&mut self, req: &mut StealRequest) -> usize {
        debug_assert!(req.try_count <= self.shared.config.max_steal_attempts, "steal request circulated past MAX_ATTEMPTS without being returned");
        req.remove_victim(self.id);
        if req.try_count >= self.shared.config.max_steal_attempts {
            return req.requester;
        }
        if self.tree.both_subtrees_idle() {
            worker_tree::mark_subtree_idle(&mut req.victims, self.id, self.shared.num_workers());
        } else if self.tree.left_subtree_is_idle {
            if let Some(l) = self.tree.left {
                worker_tree::mark_subtree_idle(&mut req.victims, l, self.shared.num_workers());
            }
        } else if self.tree.right_subtree_is_idle {
            if let Some(r) = self.tree.right {
                worker_tree::mark_subtree_idle(&mut req.victims, r, self.shared.num_workers());
            }
        }
        steal::select_victim(req.victims, None, None, &mut self.rng).unwrap_or(req.requester)
    }

    /// Sends `req` to worker `target`'s inbox, retrying on a (very rare,
    /// given the inbox's generous capacity) transient full channel.
    fn route(&self, target: usize, mut req: StealRequest) {
        loop {
            match self.shared.inboxes[target].try_send(req) {
                Ok(()) => return,
                Err(back) => {
                    if self.shared.is_finished() {
                        return;
                    }
                    req = back;
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Drains this worker's own inbox, then — for any subtree flagged
    /// idle — polls that subtree's inboxes recursively on its behalf, so
    /// a request never sits stuck at a backed-off worker (`spec.md` §4.4
    /// "Routing requests on behalf of sleeping subtrees").
    pub(crate) fn drain_inbox(&mut self) {
        while let Some(req) = self.shared.inboxes[self.id].try_receive() {
            self.handle_incoming(req);
        }
        if self.tree.left_subtree_is_idle {
            if let Some(l) = self.tree.left {
                self.poll_on_behalf_of(l);
            }
        }
        if self.tree.right_subtree_is_idle {
            if let Some(r) = self.tree.right {
                self.poll_on_behalf_of(r);
            }
        }
    }

    fn poll_on_behalf_of(&mut self, worker: usize) {
        while let Some(req) = self.shared.inboxes[worker].try_receive() {
            self.handle_incoming(req);
        }
        let max_id = self.shared.num_workers() - 1;
        if let Some(l) = worker_tree::left_child(worker, max_id) {
            self.poll_on_behalf_of(l);
        }
        if let Some(r) = worker_tree::right_child(worker, max_id) {
            self.poll_on_behalf_of(r);
        }
    }

    fn handle_incoming(&mut self, req: StealRequest) {
        if req.requester == self.id {
            self.decline_own_request(req);
        } else {
            self.handle_as_victim(req);
        }
    }

    /// Services (or forwards) a request sent by a different worker.
    fn handle_as_victim(&mut self, mut req: StealRequest) {
        if req.state == StealState::Failed {
            debug_assert!(Some(req.requester) == self.tree.left || Some(req.requester) == self.tree.right);
            if Some(req.requester) == self.tree.left {
                self.tree.left_subtree_is_idle = true;
            } else {
                self.tree.right_subtree_is_idle = true;
            }
            self.lifeline_queue.push_back(req);
            return;
        }

        if let Some(batch) = self.try_satisfy_with_tasks(req.steal_half) {
            self.deliver(&req, batch);
            return;
        }
        if let Some(dup) = self.try_satisfy_with_split() {
            self.deliver(&req, Batch::single(dup));
            return;
        }

        req.try_count += 1;
        let next = self.next_hop(&mut req);
        self.route(next, req);
    }

    fn try_satisfy_with_tasks(&mut self, requester_wants_half: bool) -> Option<Batch> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "steal-half")] {
                let _ = requester_wants_half;
                self.deque.steal_half()
            } else if #[cfg(feature = "steal-adaptive")] {
                if requester_wants_half {
                    self.deque.steal_half()
                } else {
                    self.deque.steal().map(Batch::single)
                }
            } else {
                let _ = requester_wants_half;
                self.deque.steal().map(Batch::single)
            }
        }
    }

    /// Splits the currently executing loop task if our deque is empty and
    /// it is still splittable (`spec.md` §4.7).
    fn try_satisfy_with_split(&mut self) -> Option<Box<Task>> {
        if !self.deque.is_empty() {
            return None;
        }
        let cur = self.current_task()?;
        // SAFETY: `cur` is this worker's own currently-executing task;
        // only this thread ever touches it.
        let t = unsafe { &mut *cur.as_ptr() };
        if !loop_split::splittable(t) {
            return None;
        }
        let idle_hint = self.shared.inboxes[self.id].peek();
        let split_at = loop_split::split_point(t, idle_hint);

        let mut dup = self.deque.task_alloc();
        // SAFETY: `dup` is a freshly allocated, exclusively-owned record;
        // `t` is read-only for the duration of the copy.
        unsafe { std::ptr::copy_nonoverlapping(t as *const Task, dup.as_mut() as *mut Task, 1) };
        dup.prev = None;
        dup.next = None;
        dup.start = split_at;
        dup.cur = split_at;
        dup.end = t.end;
        dup.batch = 1;
        dup.victim = -1;
        t.end = split_at;

        if let Some(hook) = dup.split_hook {
            let dup_ptr: *mut Task = dup.as_mut();
            // SAFETY: `dup`/`cur` were both produced by the same spawn
            // call (`dup` is a byte-for-byte copy of `cur`), so the hook
            // registered for `cur`'s payload type applies to `dup` too.
            unsafe { hook(dup_ptr, cur.as_ptr()) };
        }
        Some(dup)
    }

    /// Ships a satisfied batch back over the requester's reply channel,
    /// upgrading any lazy futures it carries first (`spec.md` §3.5/§4.4).
    fn deliver(&mut self, req: &StealRequest, mut batch: Batch) {
        // SAFETY: `batch` is a freshly detached, uniquely-owned chain.
        unsafe {
            (*batch.head.as_ptr()).batch = batch.len as u32;
            (*batch.head.as_ptr()).victim = self.id as i32;
        }
        let mut cursor = Some(batch.head);
        while let Some(node) = cursor {
            // SAFETY: every node in the chain is part of the same
            // uniquely-owned, not-yet-delivered batch.
            let (has_future, hook, next) = unsafe { ((*node.as_ptr()).has_future, (*node.as_ptr()).future_upgrade_hook, (*node.as_ptr()).next) };
            if has_future {
                if let Some(upgrade) = hook {
                    unsafe { upgrade(node.as_ptr(), self.shared.config.channel_cache) };
                }
            }
            cursor = next;
        }

        loop {
            match req.reply.try_send(batch) {
                Ok(()) => break,
                Err(back) => {
                    if self.shared.is_finished() {
                        return;
                    }
                    batch = back;
                    std::thread::yield_now();
                }
            }
        }
        self.last_thief_hint(req.requester);
    }

    #[cfg(feature = "victim-last-thief")]
    fn last_thief_hint(&mut self, requester: usize) {
        self.last_thief = Some(requester);
    }

    #[cfg(not(feature = "victim-last-thief"))]
    fn last_thief_hint(&mut self, _requester: usize) {}

    /// Handles a request that has circulated all the way back to its own
    /// originator (`spec.md` §4.4 "Decline at the requester").
    fn decline_own_request(&mut self, mut req: StealRequest) {
        let current_iters_left = self.current_task().map(|t| unsafe { t.as_ref().iters_left().unsigned_abs() as usize }).unwrap_or(0);
        if !self.deque.is_empty() || current_iters_left > 0 {
            self.retire(&req);
            return;
        }

        if !self.tree.both_subtrees_idle() {
            req.try_count = 0;
            req.victims = steal::all_but_self(self.id, self.shared.num_workers());
            let victim = self.next_hop(&mut req);
            self.route(victim, req);
            return;
        }

        let is_last_outstanding = self.free_idx.len() + 1 == self.reply_channels.len();
        if !is_last_outstanding {
            // Drop: recycle the channel but keep looking the same to
            // onlookers — we simply won't issue a replacement request
            // until real work arrives, since every peer looks saturated.
            self.retire(&req);
            return;
        }

        if self.id == 0 {
            self.declare_quiescence();
            self.retire(&req);
        } else {
            req.state = StealState::Failed;
            self.tree.waiting_for_tasks = true;
            if let Some(parent) = worker_tree::parent(self.id) {
                self.route(parent, req);
            }
        }
    }

    fn retire(&mut self, req: &StealRequest) {
        match self.reply_channels.iter().position(|c| Arc::ptr_eq(c, &req.reply)) {
            Some(idx) => self.free_idx.push(idx),
            // Every outstanding request's reply channel is one of this
            // worker's own `reply_channels` slots (`spec.md` §8 property 1:
            // `outstanding + |reply_stack| = MAXSTEAL`); failing to find it
            // here means a slot was retired twice or handed to the wrong
            // worker — an unrecoverable protocol violation, not a user error.
            None => crate::error::fatal(self.id as i64, "retired a steal request whose reply channel is not one of this worker's own slots"),
        }
    }

    fn declare_quiescence(&self) {
        debug_assert_eq!(self.id, 0, "only the root detects global quiescence");
        self.shared.quiescent.store(true, Ordering::Release);
    }

    /// Walks the lifeline queue in FIFO order, satisfying every request it
    /// can and stopping at the first it can't (`spec.md` §4.4 "Serving
    /// lifelines").
    pub(crate) fn serve_lifelines(&mut self) {
        while let Some(req) = self.lifeline_queue.pop_front() {
            let from_left = Some(req.requester) == self.tree.left;
            let satisfied = if let Some(batch) = self.try_satisfy_with_tasks(req.steal_half) {
                self.deliver(&req, batch);
                true
            } else if let Some(dup) = self.try_satisfy_with_split() {
                self.deliver(&req, Batch::single(dup));
                true
            } else {
                false
            };
            if satisfied {
                if from_left {
                    self.tree.left_subtree_is_idle = false;
                } else {
                    self.tree.right_subtree_is_idle = false;
                }
                self.wake(req.requester);
            } else {
                self.lifeline_queue.push_front(req);
                break;
            }
        }
    }

    #[cfg(feature = "backoff-condvar")]
    fn wake(&self, target: usize) {
        let (lock, cv) = &self.shared.wake[target];
        let mut guard = lock.lock();
        *guard = true;
        cv.notify_one();
    }

    #[cfg(not(feature = "backoff-condvar"))]
    fn wake(&self, _target: usize) {}

    fn try_receive_batch(&mut self) -> Option<Batch> {
        for idx in 0..self.reply_channels.len() {
            if let Some(batch) = self.reply_channels[idx].try_receive() {
                self.free_idx.push(idx);
                return Some(batch);
            }
        }
        None
    }

    fn on_batch_received(&mut self, batch: Batch) {
        // SAFETY: just-received, uniquely-owned chain.
        let victim = unsafe { (*batch.head.as_ptr()).victim };
        if victim >= 0 {
            self.last_victim_hint(victim as usize);
        }
        self.steals_exec_recently += 1;
        self.backoff_exp_us = 1;
        self.tree.waiting_for_tasks = false;
        self.deque.prepend(batch);
        self.mark_has_tasks();
        self.serve_lifelines();
    }

    #[cfg(feature = "victim-last-victim")]
    fn last_victim_hint(&mut self, victim: usize) {
        self.last_victim = Some(victim);
    }

    #[cfg(not(feature = "victim-last-victim"))]
    fn last_victim_hint(&mut self, _victim: usize) {}

    fn backoff_step(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "backoff-condvar")] {
                if self.tree.waiting_for_tasks {
                    let (lock, cv) = &self.shared.wake[self.id];
                    let mut guard = lock.lock();
                    if !*guard {
                        let _ = cv.wait_for(&mut guard, Duration::from_millis(50));
                    }
                    *guard = false;
                } else {
                    std::thread::yield_now();
                }
            } else if #[cfg(feature = "backoff-sleep")] {
                if self.tree.waiting_for_tasks {
                    std::thread::sleep(Duration::from_micros(self.backoff_exp_us));
                    self.backoff_exp_us = (self.backoff_exp_us * 2).min(1_000_000);
                } else {
                    std::thread::yield_now();
                }
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// One "round" of the idle wait (`spec.md` §4.5 step 3): either a
    /// batch arrives (installed and returned `true`) or we service/forward
    /// inbox traffic and back off a step (returns `false`).
    fn idle_round(&mut self) -> bool {
        if let Some(batch) = self.try_receive_batch() {
            self.on_batch_received(batch);
            return true;
        }
        self.serve_lifelines();
        self.drain_inbox();
        if let Some(batch) = self.try_receive_batch() {
            self.on_batch_received(batch);
            return true;
        }
        self.backoff_step();
        false
    }

    /// The worker-thread scheduling loop (`spec.md` §4.5): run local work,
    /// request more when idle, wait for a reply, repeat — until
    /// `tasking_finished` is observed.
    pub(crate) fn schedule_forever(&mut self) {
        loop {
            while let Some(task) = self.pop() {
                self.maybe_send_early_steal_request();
                self.execute(task);
            }
            if self.shared.is_finished() {
                return;
            }
            self.send_steal_request(true);
            while !self.idle_round() {
                if self.shared.is_finished() {
                    return;
                }
            }
        }
    }

    /// The master-only scheduling loop, run until global quiescence
    /// (`spec.md` §4.8 `barrier()`). Leaves `quiescent = true` on return;
    /// a subsequent `push` clears it.
    pub fn barrier(&mut self) {
        if self.shared.num_workers() == 1 {
            while let Some(task) = self.pop() {
                self.execute(task);
            }
            self.shared.quiescent.store(true, Ordering::Release);
            return;
        }
        loop {
            while let Some(task) = self.pop() {
                self.maybe_send_early_steal_request();
                self.execute(task);
            }
            if self.shared.is_quiescent() {
                return;
            }
            self.send_steal_request(true);
            loop {
                if self.idle_round() {
                    break;
                }
                if self.shared.is_quiescent() {
                    return;
                }
            }
        }
    }

    pub(crate) fn broadcast_shutdown(&self) {
        self.shared.signal_exit();
        cfg_if::cfg_if! {
            if #[cfg(feature = "backoff-condvar")] {
                for (lock, cv) in &self.shared.wake {
                    let mut guard = lock.lock();
                    *guard = true;
                    cv.notify_all();
                }
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "steal-half")] {
        fn initial_steal_half_mode() -> bool { true }
    } else {
        fn initial_steal_half_mode() -> bool { false }
    }
}

/// Blocks (without blocking the OS thread) until `ready` returns `Some`,
/// running other ready work in the meantime: first this worker's own
/// children (most likely direct dependencies), then whatever a steal
/// request turns up (`spec.md` §4.6 `await`). Shared by
/// [`crate::future::await_future`], [`crate::join::sync`], and
/// [`crate::loop_split::LoopFuture::reduce`].
pub(crate) fn participate_until<T>(worker: &mut Worker, mut ready: impl FnMut(&mut Worker) -> Option<T>) -> T {
    loop {
        if let Some(parent) = worker.current_task() {
            while let Some(task) = worker.pop_child(parent) {
                worker.execute(task);
                if let Some(v) = ready(worker) {
                    return v;
                }
            }
        }
        // Children of the current task are exhausted (or there is no
        // current task at all, e.g. a top-level await on the master) —
        // fall back to any other task on our own deque before asking for a
        // steal. A single-worker run has nowhere else to get work from, so
        // this is the only thing standing between it and spinning forever
        // in `idle_round` (`send_steal_request` is a no-op for `N == 1`).
        while let Some(task) = worker.pop() {
            worker.execute(task);
            if let Some(v) = ready(worker) {
                return v;
            }
        }
        if let Some(v) = ready(worker) {
            return v;
        }
        worker.send_steal_request(false);
        loop {
            if worker.idle_round() {
                break;
            }
            if let Some(v) = ready(worker) {
                return v;
            }
        }
        if let Some(v) = ready(worker) {
            return v;
        }
    }
}

/// Services incoming steal requests without otherwise touching local work.
/// Callable from user task bodies that run long enough to want to yield
/// fairness to waiting thieves (`spec.md` §6, `check_for_steal_requests`).
pub fn check_for_steal_requests(worker: &mut Worker) {
    worker.serve_lifelines();
    worker.drain_inbox();
}

thread_local! {
    /// The worker currently executing a task on this OS thread, published
    /// for the duration of [`Worker::execute`]. Lets a task body that has
    /// no `&mut Worker` of its own — a splittable loop's iteration body,
    /// notably — still yield to the scheduler periodically. Every real
    /// entry point ([`participate_until`], [`check_for_steal_requests`])
    /// takes an explicit `&mut Worker` instead; this exists only for the
    /// one call site (`spec.md` §4.7's loop task) that cannot.
    static CURRENT_WORKER: std::cell::Cell<*mut Worker> = const { std::cell::Cell::new(std::ptr::null_mut()) };
}

/// Services incoming steal requests on behalf of whichever worker is
/// currently executing a task on this thread, if any. A no-op off a worker
/// thread (e.g. called from a test).
///
/// # Safety
/// Must only be called from within a task function's body while it is
/// running on a worker thread (i.e. reached, directly or indirectly,
/// through [`Worker::execute`]).
pub unsafe fn poll_current_worker() {
    CURRENT_WORKER.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return;
        }
        // SAFETY: non-null only while the owning `execute` call is still on
        // the stack of this same thread; `ptr` is never read from another
        // thread.
        let worker = unsafe { &mut *ptr };
        worker.serve_lifelines();
        worker.drain_inbox();
    });
}

/// Hands `f` the worker currently executing a task on this thread, if any —
/// `None` off a worker thread. Lets a spawned task's own closure recurse
/// (spawn further children, await a nested future) without a caller having
/// to thread a `&mut Worker` through every closure boundary by hand, the
/// same affordance a thread-pool-backed fork/join library typically gives
/// recursive work via a thread-local "current worker" lookup.
pub fn with_current_worker<R>(f: impl FnOnce(&mut Worker) -> R) -> Option<R> {
    CURRENT_WORKER.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: non-null only while the owning `execute` call is still on
        // the stack of this same thread, so `ptr` stays valid for the
        // duration of `f`; no other thread ever reads this cell's value.
        let worker = unsafe { &mut *ptr };
        Some(f(worker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn worker(id: usize, n: usize) -> Worker {
        let cfg = RuntimeConfig::builder().workers(n).build().unwrap();
        Worker::new(id, Shared::new(cfg))
    }

    #[test]
    fn fresh_worker_has_all_reply_slots_free() {
        let w = worker(0, 4);
        assert_eq!(w.free_idx.len(), w.reply_channels.len());
    }

    #[test]
    fn steal_early_threshold_issues_a_request_before_the_deque_empties() {
        let cfg = RuntimeConfig::builder().workers(4).steal_early(1).build().unwrap();
        let mut w = Worker::new(0, Shared::new(cfg));
        w.push(w.deque.task_alloc());
        w.push(w.deque.task_alloc());
        assert_eq!(w.free_idx.len(), w.reply_channels.len());
        w.maybe_send_early_steal_request();
        assert_eq!(w.free_idx.len(), w.reply_channels.len(), "deque above threshold must not send early");
        w.pop();
        w.maybe_send_early_steal_request();
        assert_eq!(w.free_idx.len(), w.reply_channels.len() - 1, "deque at/below threshold must send one early request");
    }

    #[test]
    fn no_steal_early_threshold_never_sends_one() {
        let mut w = worker(0, 4);
        w.push(w.deque.task_alloc());
        w.maybe_send_early_steal_request();
        assert_eq!(w.free_idx.len(), w.reply_channels.len());
    }

    #[test]
    fn single_worker_barrier_runs_local_tasks_then_quiesces() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        static RAN: AtomicUsize = AtomicUsize::new(0);
        unsafe fn bump(_task: *mut Task) {
            RAN.fetch_add(1, O::Relaxed);
        }
        let mut w = worker(0, 1);
        let mut t = w.task_alloc();
        t.func = Some(bump);
        w.push(t);
        w.barrier();
        assert_eq!(RAN.load(O::Relaxed), 1);
        assert!(w.shared.is_quiescent());
    }

    #[test]
    fn push_on_root_clears_quiescent() {
        let mut w = worker(0, 1);
        w.shared.quiescent.store(true, Ordering::Release);
        let t = w.task_alloc();
        w.push(t);
        assert!(!w.shared.is_quiescent());
    }
}
