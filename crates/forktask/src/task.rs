//! The task record (`spec.md` §3.1).
//!
//! A `Task` is a fixed-size descriptor: a function pointer, a fixed-capacity
//! inline payload, parent/sibling links for the owning deque, loop-range
//! fields for splittable tasks, and a batch/victim annotation filled in when
//! the task arrives via a steal. Layout mirrors `original_source/src/task.h`
//! (`struct task`) field for field, widened from C's `long`/`int` to
//! explicit `i64`/`i32`.

use std::ptr::NonNull;

/// Payload capacity in bytes. The original computes `128 - 3*sizeof(long)`;
/// on a 64-bit host with three 8-byte pointer-sized link fields that is 96.
pub const TASK_PAYLOAD_BYTES: usize = 128 - 3 * size_of::<usize>();

/// A task's entry point. Receives a pointer to its own `Task` so it can read
/// the payload and, for loop tasks, the current iteration state.
pub type TaskFn = unsafe fn(*mut Task);

/// A non-null pointer to a task owned by exactly one worker's deque, exactly
/// one in-flight channel send, or the currently executing slot (`spec.md`
/// §3.1 invariants). Cloning a `TaskRef` does not duplicate ownership; it is
/// a bookkeeping handle used while the unique owner (a `Box<Task>`) is
/// threaded through deque/channel operations.
pub type TaskRef = NonNull<Task>;

#[repr(C)]
pub struct Task {
    pub(crate) parent: Option<TaskRef>,
    pub(crate) prev: Option<TaskRef>,
    pub(crate) next: Option<TaskRef>,
    pub(crate) func: Option<TaskFn>,

    /// Number of tasks delivered together on the steal that produced this
    /// task; `1` for a task that was pushed locally and never stolen.
    pub batch: u32,
    /// Worker id this task's batch was received from, or `-1`.
    pub victim: i32,

    // Loop fields; zero/false for a non-loop task.
    pub start: i64,
    pub cur: i64,
    pub end: i64,
    pub chunks: i64,
    pub sst: i64,
    pub is_loop: bool,

    pub has_future: bool,

    /// Called on a freshly split-off duplicate (`dup`) right after its
    /// fields are byte-copied from the task being split (`original`), so a
    /// type-erased payload reached through a raw pointer (e.g. a loop task's
    /// shared reduction state) can register the duplicate as an additional
    /// owner — a raw struct copy does not run any `Clone` impls. `None` for
    /// payloads that need no such bookkeeping (plain argument tuples, boxed
    /// closures, non-loop tasks).
    pub(crate) split_hook: Option<unsafe fn(dup: *mut Task, original: *mut Task)>,

    /// Set on a task carrying a lazy future (`future-lazy` builds only).
    /// Invoked once, by the worker that steals this task, before the task
    /// runs, so the future is upgraded from its inline slot to a real
    /// channel exactly when ownership crosses a thread (`spec.md` §3.5).
    /// `None` under `future-eager` builds, where the channel already
    /// exists at spawn time, and for tasks with no future at all.
    pub(crate) future_upgrade_hook: Option<unsafe fn(*mut Task, usize)>,

    pub payload: [u8; TASK_PAYLOAD_BYTES],
}

impl Task {
    /// A freshly zeroed, non-loop task with no function assigned yet.
    pub(crate) fn zeroed() -> Self {
        Self {
            parent: None,
            prev: None,
            next: None,
            func: None,
            batch: 1,
            victim: -1,
            start: 0,
            cur: 0,
            end: 0,
            chunks: 0,
            sst: 0,
            is_loop: false,
            has_future: false,
            split_hook: None,
            future_upgrade_hook: None,
            payload: [0u8; TASK_PAYLOAD_BYTES],
        }
    }

    /// Copies `value` into the inline payload buffer. Panics if `T` does not
    /// fit; callers with larger argument sets must box them first (per
    /// `spec.md` §9's note on argument packing).
    pub fn pack<T: Copy>(&mut self, value: T) {
        const { assert!(size_of::<T>() <= TASK_PAYLOAD_BYTES, "task argument tuple exceeds inline payload capacity") };
        // SAFETY: size checked above; `T: Copy` so no destructor is skipped.
        unsafe {
            std::ptr::write_unaligned(self.payload.as_mut_ptr().cast::<T>(), value);
        }
    }

    /// Reads the payload back as `T`. Callers must use the same `T` that was
    /// packed; this is the caller's responsibility, as in the original's
    /// `typeof`-based unpack macro.
    ///
    /// # Safety
    /// `T` must match the type most recently packed into this task.
    pub unsafe fn unpack<T: Copy>(&self) -> T {
        unsafe { std::ptr::read_unaligned(self.payload.as_ptr().cast::<T>()) }
    }

    /// Remaining iterations for a loop task, `0` for a non-loop task.
    #[inline]
    pub fn iters_left(&self) -> i64 {
        if self.is_loop { self.end - self.cur } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let mut t = Task::zeroed();
        t.pack((3u32, 4.5f64));
        let (a, b): (u32, f64) = unsafe { t.unpack() };
        assert_eq!(a, 3);
        assert!((b - 4.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zeroed_is_non_loop() {
        let t = Task::zeroed();
        assert!(!t.is_loop);
        assert_eq!(t.start, 0);
        assert_eq!(t.cur, 0);
        assert_eq!(t.end, 0);
        assert_eq!(t.iters_left(), 0);
    }
}
