//! The per-worker task deque (`spec.md` §3.2/§4.1).
//!
//! A doubly-linked list of `Box<Task>` nodes with a head (LIFO push/pop end)
//! and a tail (steal end), plus an attached freelist for task-record
//! recycling. Grounded on `original_source/src/deque.c`'s list-based deque.
//!
//! Unlike `crossbeam_deque::Worker`/`Stealer` (which the teacher crate used
//! for a *concurrently stolen* deque), this structure is touched only by its
//! owning worker thread: per `spec.md` §4.1, a thief never reaches into
//! another worker's deque — it sends a steal request and the *owner's own
//! handler* performs the steal and ships the result back over a channel.
//! That cooperative protocol means this type needs no atomics or locks at
//! all, so it is `!Sync` by construction (it is simply never shared).

use crate::task::{Task, TaskRef};
use std::ptr::NonNull;

/// A task removed from a deque, paired with the node count it represents
/// (always 1 outside of batch operations).
pub struct Batch {
    pub head: TaskRef,
    pub tail: TaskRef,
    pub len: usize,
}

// SAFETY: a `Batch` is a detached, uniquely-owned chain of task nodes handed
// off between exactly one worker at a time (never shared); it is `Send` so
// it can ride across a steal reply channel to the worker that now owns it.
unsafe impl Send for Batch {}

impl Batch {
    /// Wraps a single detached task as a one-element batch, e.g. for the
    /// plain `steal-one` discipline whose result still needs to flow
    /// through the same reply-channel path as a multi-task batch.
    pub fn single(task: Box<Task>) -> Batch {
        let ptr = NonNull::from(Box::leak(task));
        Batch { head: ptr, tail: ptr, len: 1 }
    }
}


#[derive(Default)]
pub struct Deque {
    head: Option<TaskRef>,
    tail: Option<TaskRef>,
    len: usize,
    /// Steal attempts serviced against this deque, used by the adaptive
    /// steal-discipline ratio (`spec.md` §4.4).
    pub num_steals: u64,
    freelist: Vec<Box<Task>>,
}

// SAFETY: a `Deque` is only ever accessed from the worker thread that owns
// it; it is moved into that thread's context at startup and never shared.
// This impl only exists so the owning `Worker` struct (which must be `Send`
// to be moved into its spawned thread) can contain one.
unsafe impl Send for Deque {}

impl Deque {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Allocates a task record, preferring a recycled one from the
    /// freelist.
    pub fn task_alloc(&mut self) -> Box<Task> {
        self.freelist.pop().map(|mut t| { *t = Task::zeroed(); t }).unwrap_or_else(|| Box::new(Task::zeroed()))
    }

    /// Returns a finished task record to the freelist for reuse.
    pub fn task_cache(&mut self, task: Box<Task>) {
        self.freelist.push(task);
    }

    /// Pushes a task at the head. O(1).
    pub fn push(&mut self, task: Box<Task>) {
        let ptr = NonNull::from(Box::leak(task));
        // SAFETY: `ptr` was just leaked from a uniquely-owned `Box`; no
        // other reference to it exists yet.
        unsafe {
            (*ptr.as_ptr()).prev = None;
            (*ptr.as_ptr()).next = self.head;
            if let Some(old_head) = self.head {
                (*old_head.as_ptr()).prev = Some(ptr);
            }
        }
        self.head = Some(ptr);
        if self.tail.is_none() {
            self.tail = Some(ptr);
        }
        self.len += 1;
    }

    /// Removes and returns the head task, or `None` if empty. O(1).
    pub fn pop(&mut self) -> Option<Box<Task>> {
        let ptr = self.head?;
        self.unlink(ptr);
        // SAFETY: `ptr` was unlinked from the list above, giving us unique
        // ownership back; it was originally produced by `Box::leak`.
        Some(unsafe { Box::from_raw(ptr.as_ptr()) })
    }

    /// Pops the head task only if it is a child of `parent`; used by
    /// await-while-scheduling so an awaiter preferentially drains its own
    /// direct dependencies instead of advancing into unrelated work.
    pub fn pop_child(&mut self, parent: TaskRef) -> Option<Box<Task>> {
        let ptr = self.head?;
        // SAFETY: `ptr` is a live node owned by this deque.
        let is_child = unsafe { (*ptr.as_ptr()).parent } == Some(parent);
        if !is_child {
            return None;
        }
        self.pop()
    }

    /// Steals one task from the tail. O(1).
    pub fn steal(&mut self) -> Option<Box<Task>> {
        let ptr = self.tail?;
        self.unlink(ptr);
        self.num_steals += 1;
        Some(unsafe { Box::from_raw(ptr.as_ptr()) })
    }

    /// Steals `min(ceil(len/2), max).max(1)` tasks from the tail,
    /// returning the detached batch's head/tail pointers and count.
    /// Ownership of the batch moves to the caller, who installs it into the
    /// thief's own deque via [`Deque::prepend`] or hands it off by channel.
    pub fn steal_many(&mut self, max: usize) -> Option<Batch> {
        if self.len == 0 {
            return None;
        }
        let n = ((self.len + 1) / 2).min(max.max(1)).max(1).min(self.len);
        self.detach_from_tail(n)
    }

    /// Steals up to half the deque (no cap besides `len`).
    pub fn steal_half(&mut self) -> Option<Batch> {
        self.steal_many(usize::MAX)
    }

    /// Splices a previously-detached batch onto the head in one operation.
    pub fn prepend(&mut self, batch: Batch) {
        // SAFETY: `batch.head`/`batch.tail` came from a detached, uniquely
        // owned chain (see `detach_from_tail`/steal APIs on a *different*
        // deque); splicing them into this one's links is exclusive access.
        unsafe {
            (*batch.head.as_ptr()).prev = None;
            (*batch.tail.as_ptr()).next = self.head;
        }
        if let Some(old_head) = self.head {
            unsafe { (*old_head.as_ptr()).prev = Some(batch.tail) };
        }
        self.head = Some(batch.head);
        if self.tail.is_none() {
            self.tail = Some(batch.tail);
        }
        self.len += batch.len;
    }

    /// Detaches the `n` tail-most nodes as a contiguous chain, leaving the
    /// remaining `len - n` nodes as this deque's new contents.
    fn detach_from_tail(&mut self, n: usize) -> Option<Batch> {
        if n == 0 || n > self.len {
            return None;
        }
        let tail = self.tail?;
        // Walk `n - 1` steps toward the head to find the new batch head.
        let mut batch_head = tail;
        for _ in 1..n {
            // SAFETY: nodes between `tail` and `head` are live deque nodes.
            let prev = unsafe { (*batch_head.as_ptr()).prev };
            batch_head = prev.expect("deque shorter than recorded len");
        }
        let new_tail = unsafe { (*batch_head.as_ptr()).prev };
        unsafe {
            (*batch_head.as_ptr()).prev = None;
        }
        match new_tail {
            Some(nt) => unsafe { (*nt.as_ptr()).next = None },
            None => self.head = None,
        }
        self.tail = new_tail;
        self.len -= n;
        self.num_steals += 1;
        Some(Batch { head: batch_head, tail, len: n })
    }

    /// Unlinks a node from the list without taking ownership back.
    fn unlink(&mut self, ptr: TaskRef) {
        // SAFETY: `ptr` is a live node of this deque.
        unsafe {
            let prev = (*ptr.as_ptr()).prev;
            let next = (*ptr.as_ptr()).next;
            match prev {
                Some(p) => (*p.as_ptr()).next = next,
                None => self.head = next,
            }
            match next {
                Some(n) => (*n.as_ptr()).prev = prev,
                None => self.tail = prev,
            }
            (*ptr.as_ptr()).prev = None;
            (*ptr.as_ptr()).next = None;
        }
        self.len -= 1;
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Box<Task> {
        Box::new(Task::zeroed())
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut dq = Deque::new();
        let mut ids = vec![];
        for i in 0..5u32 {
            let mut t = task();
            t.batch = i;
            dq.push(t);
        }
        while let Some(t) = dq.pop() {
            ids.push(t.batch);
        }
        assert_eq!(ids, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn steal_takes_from_tail() {
        let mut dq = Deque::new();
        for i in 0..3u32 {
            let mut t = task();
            t.batch = i;
            dq.push(t);
        }
        // head..tail = [2,1,0]; steal must take 0 (the oldest).
        let stolen = dq.steal().unwrap();
        assert_eq!(stolen.batch, 0);
        assert_eq!(dq.len(), 2);
    }

    #[test]
    fn steal_many_detaches_half_rounded_up() {
        let mut dq = Deque::new();
        for i in 0..5u32 {
            let mut t = task();
            t.batch = i;
            dq.push(t);
        }
        let batch = dq.steal_many(usize::MAX).unwrap();
        assert_eq!(batch.len, 3); // ceil(5/2) = 3
        assert_eq!(dq.len(), 2);
    }

    #[test]
    fn steal_many_respects_max() {
        let mut dq = Deque::new();
        for i in 0..5u32 {
            let mut t = task();
            t.batch = i;
            dq.push(t);
        }
        let batch = dq.steal_many(1).unwrap();
        assert_eq!(batch.len, 1);
        assert_eq!(dq.len(), 4);
    }

    #[test]
    fn prepend_splices_batch_at_head() {
        let mut src = Deque::new();
        for i in 0..4u32 {
            let mut t = task();
            t.batch = i;
            src.push(t);
        }
        let batch = src.steal_many(usize::MAX).unwrap();

        let mut dst = Deque::new();
        let mut t = task();
        t.batch = 99;
        dst.push(t);
        dst.prepend(batch);

        let mut order = vec![];
        while let Some(t) = dst.pop() {
            order.push(t.batch);
        }
        // batch head (freshest of the stolen half) comes out first.
        assert_eq!(order.first(), Some(&1u32));
        assert_eq!(*order.last().unwrap(), 99);
    }

    #[test]
    fn pop_child_only_matches_parent() {
        let mut dq = Deque::new();
        let parent_task = task();
        let parent_ref = TaskRef::from(&*parent_task);

        let mut child = task();
        child.parent = Some(parent_ref);
        dq.push(child);

        let mut stranger = task();
        stranger.parent = None;
        dq.push(stranger);

        // head is `stranger`, which is not a child of `parent_ref`.
        assert!(dq.pop_child(parent_ref).is_none());
        dq.pop().unwrap();
        assert!(dq.pop_child(parent_ref).is_some());
    }

    #[test]
    fn freelist_recycles_task_records() {
        let mut dq = Deque::new();
        let t = dq.task_alloc();
        let ptr = &*t as *const Task;
        dq.task_cache(t);
        let t2 = dq.task_alloc();
        assert_eq!(&*t2 as *const Task, ptr);
    }
}
