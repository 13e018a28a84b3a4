//! Futures and `await` (`spec.md` §3.5/§4.6).
//!
//! Two flavours, selected by the `future-eager`/`future-lazy` Cargo
//! features; both produce a `Future<T>` consumer handle plus a matching
//! producer the spawn path stashes into the new task's payload.
//!
//! - **Eager** ([`EagerFuture`]): a capacity-1 [`SpscChannel`], exactly as
//!   described for the non-lazy path — allocated up front, freed once
//!   after the result is consumed.
//! - **Lazy** ([`LazyFuture`]): a small inline record. If the producing
//!   task runs on its owning worker without ever being stolen, the result
//!   is written straight into an inline slot and the consumer reads it
//!   without ever allocating a channel. If the task *is* stolen, the
//!   thief's handoff path (see `scheduler::handle_steal_request`) upgrades
//!   the record to a real channel before the task runs, exactly as
//!   `original_source/src/runtime.c`'s `convert_lazy_future` does.
//!
//! `await` itself does not block the OS thread: it runs other ready work
//! (preferentially children of the current task) until the result
//! arrives, as specified in `spec.md` §4.6.

use crate::channel::{ChannelCache, SpscChannel};
use crate::scheduler::{self, Worker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capacity used for every future channel; a future is always a one-shot,
/// capacity-1 handoff between exactly one producer and one consumer.
const FUTURE_CAPACITY: usize = 1;

// ---------------------------------------------------------------------
// Eager futures
// ---------------------------------------------------------------------

/// Producer side, stashed into the spawned task's payload.
pub struct EagerProducer<T> {
    chan: Arc<SpscChannel<T>>,
}

/// Consumer side, returned to the spawning call site.
pub struct EagerFuture<T> {
    chan: Arc<SpscChannel<T>>,
}

impl<T: Send + 'static> EagerFuture<T> {
    /// Allocates the channel pair for a brand-new `FUTURE` spawn.
    pub fn pair(channel_cache_limit: usize) -> (EagerProducer<T>, EagerFuture<T>) {
        let chan = ChannelCache::acquire_spsc::<T>(FUTURE_CAPACITY, channel_cache_limit);
        (EagerProducer { chan: chan.clone() }, EagerFuture { chan })
    }

    fn poll(&self) -> Option<T> {
        self.chan.try_receive()
    }
}

impl<T> EagerProducer<T> {
    /// Delivers the result. Exactly one call per producer (`spec.md` §3.5
    /// invariant: result delivered exactly once).
    pub fn set(self, value: T) {
        // A dedicated capacity-1 SPSC channel never has a full buffer when
        // its single producer sends its single item.
        debug_assert!(self.chan.try_send(value).is_ok(), "future channel unexpectedly full");
    }
}

impl<T: Send + 'static> Drop for EagerFuture<T> {
    fn drop(&mut self) {
        ChannelCache::release_spsc(self.chan.clone(), FUTURE_CAPACITY, 0);
    }
}

// ---------------------------------------------------------------------
// Lazy futures
// ---------------------------------------------------------------------

enum LazySlot<T> {
    Unset,
    Inline(T),
    Channel(Arc<SpscChannel<T>>),
}

/// Shared record between a lazy future's producer and consumer halves.
/// Upgraded from `Unset`/`Inline` to `Channel` exactly once, by
/// [`LazyFuture::upgrade`], if the producing task is ever stolen.
pub struct LazyCell<T> {
    slot: std::sync::Mutex<LazySlot<T>>,
    has_channel: AtomicBool,
}

impl<T: Send + 'static> LazyCell<T> {
    fn new() -> Self {
        Self { slot: std::sync::Mutex::new(LazySlot::Unset), has_channel: AtomicBool::new(false) }
    }

    /// Allocates a real channel for this record, moving it out of the
    /// "maybe inline" state. Idempotent: a future already upgraded (e.g. by
    /// a previous steal in the same batch) is left untouched.
    pub fn upgrade(&self, channel_cache_limit: usize) {
        if self.has_channel.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.slot.lock().unwrap();
        if self.has_channel.load(Ordering::Acquire) {
            return;
        }
        let chan = ChannelCache::acquire_spsc::<T>(FUTURE_CAPACITY, channel_cache_limit);
        *slot = LazySlot::Channel(chan);
        self.has_channel.store(true, Ordering::Release);
    }
}

pub struct LazyProducer<T> {
    cell: Arc<LazyCell<T>>,
}

pub struct LazyFuture<T> {
    cell: Arc<LazyCell<T>>,
}

impl<T: Send + 'static> LazyFuture<T> {
    pub fn pair() -> (LazyProducer<T>, LazyFuture<T>) {
        let cell = Arc::new(LazyCell::new());
        (LazyProducer { cell: cell.clone() }, LazyFuture { cell })
    }

    /// Handle the scheduler upgrades when it ships this future's owning
    /// task to a thief (`spec.md` §3.5).
    pub fn cell(&self) -> &Arc<LazyCell<T>> {
        &self.cell
    }

    fn poll(&self) -> Option<T> {
        if self.cell.has_channel.load(Ordering::Acquire) {
            let mut slot = self.cell.slot.lock().unwrap();
            if let LazySlot::Channel(chan) = &*slot {
                return chan.try_receive();
            }
            let _ = &mut slot;
            None
        } else {
            let mut slot = self.cell.slot.lock().unwrap();
            match std::mem::replace(&mut *slot, LazySlot::Unset) {
                LazySlot::Inline(v) => Some(v),
                other => {
                    *slot = other;
                    None
                }
            }
        }
    }
}

impl<T: Send + 'static> LazyProducer<T> {
    /// Accesses the shared record so a steal handoff can upgrade it before
    /// the task runs on the thief (`spec.md` §3.5).
    pub(crate) fn cell(&self) -> &Arc<LazyCell<T>> {
        &self.cell
    }

    pub fn set(self, value: T) {
        if self.cell.has_channel.load(Ordering::Acquire) {
            let slot = self.cell.slot.lock().unwrap();
            if let LazySlot::Channel(chan) = &*slot {
                debug_assert!(chan.try_send(value).is_ok(), "lazy future channel unexpectedly full");
                return;
            }
            unreachable!("has_channel set without a channel installed");
        }
        let mut slot = self.cell.slot.lock().unwrap();
        *slot = LazySlot::Inline(value);
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "future-lazy")] {
        pub type Future<T> = LazyFuture<T>;
        pub type Producer<T> = LazyProducer<T>;

        pub fn future_pair<T: Send + 'static>(_channel_cache_limit: usize) -> (Producer<T>, Future<T>) {
            LazyFuture::pair()
        }
    } else {
        pub type Future<T> = EagerFuture<T>;
        pub type Producer<T> = EagerProducer<T>;

        pub fn future_pair<T: Send + 'static>(channel_cache_limit: usize) -> (Producer<T>, Future<T>) {
            EagerFuture::pair(channel_cache_limit)
        }
    }
}

/// Trait implemented by both future flavours so `await`/`await_all` can be
/// written generically over the compile-time choice.
pub trait Poll<T> {
    fn poll(&self) -> Option<T>;
}

impl<T: Send + 'static> Poll<T> for EagerFuture<T> {
    fn poll(&self) -> Option<T> {
        EagerFuture::poll(self)
    }
}

impl<T: Send + 'static> Poll<T> for LazyFuture<T> {
    fn poll(&self) -> Option<T> {
        LazyFuture::poll(self)
    }
}

/// Blocks (without blocking the OS thread) until `fut` is ready, running
/// other work in the meantime (`spec.md` §4.6, `await`). Must be called
/// from a worker thread.
pub fn await_future<T, F: Poll<T>>(worker: &mut Worker, fut: &F) -> T {
    if let Some(v) = fut.poll() {
        return v;
    }
    scheduler::participate_until(worker, |_w| fut.poll())
}

// ---------------------------------------------------------------------
// Scoped await_all
// ---------------------------------------------------------------------

/// A single pending future collected into an [`AwaitAll`] scope, carrying
/// its own type-erased "force into this destination" routine — the Rust
/// analogue of the original's `struct future_node` + per-type `await_fn`.
struct ScopedForce<'a> {
    force: Box<dyn FnOnce(&mut Worker) + 'a>,
}

/// Collects futures spawned during a lexical region and forces every one
/// of them, in the order they were pushed, when the scope finishes
/// (`spec.md` §4.6, `await_all`). Call [`AwaitAll::finish`] on every path
/// out of the region.
#[derive(Default)]
pub struct AwaitAll<'a> {
    pending: Vec<ScopedForce<'a>>,
}

impl<'a> AwaitAll<'a> {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Registers a future whose result will be written to `*dest` when the
    /// scope is forced.
    pub fn push<T: Send + 'static, F: Poll<T> + 'a>(&mut self, fut: F, dest: &'a mut T) {
        self.pending.push(ScopedForce {
            force: Box::new(move |worker| {
                *dest = await_future(worker, &fut);
            }),
        });
    }

    /// Forces every collected future in FIFO order. [`AwaitAll::finish`]
    /// calls this at the scope's intended exit point; callers may also
    /// invoke it directly to force earlier without ending the scope.
    pub fn force_all(&mut self, worker: &mut Worker) {
        for node in self.pending.drain(..) {
            (node.force)(worker);
        }
    }

    /// Consumes the scope, forcing every pending future now. Prefer this
    /// over a bare `drop(scope)` — a plain `Drop` impl has no `&mut Worker`
    /// to run other work on while waiting, so it would have to block the OS
    /// thread; `finish` is the scope's actual exit point (`spec.md` §4.6
    /// `await_all`, "walked in order at scope exit").
    pub fn finish(mut self, worker: &mut Worker) {
        self.force_all(worker);
    }
}

impl Drop for AwaitAll<'_> {
    /// A scope dropped with futures still pending (e.g. an early return or
    /// an unwinding panic) is a programming error under this runtime's
    /// model: there is no `&mut Worker` available here to keep scheduling
    /// other work while draining them without blocking the OS thread.
    /// Forcing them via a spin-wait here would violate "await never blocks
    /// the OS thread" (`spec.md` §5); callers must call
    /// [`AwaitAll::finish`] on every path out of the scope instead.
    fn drop(&mut self) {
        debug_assert!(self.pending.is_empty(), "AwaitAll scope dropped with pending futures; call finish(worker) on every exit path");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_future_delivers_exactly_once() {
        let (tx, rx) = EagerFuture::<u32>::pair(0);
        tx.set(42);
        assert_eq!(rx.poll(), Some(42));
    }

    #[test]
    fn lazy_future_inline_path_skips_channel() {
        let (tx, rx) = LazyFuture::<u32>::pair();
        tx.set(7);
        assert!(!rx.cell().has_channel.load(Ordering::Acquire));
        assert_eq!(rx.poll(), Some(7));
    }

    #[test]
    fn lazy_future_upgraded_path_uses_channel() {
        let (tx, rx) = LazyFuture::<u32>::pair();
        rx.cell().upgrade(0);
        tx.set(9);
        assert!(rx.cell().has_channel.load(Ordering::Acquire));
        assert_eq!(rx.poll(), Some(9));
    }

    #[test]
    fn lazy_upgrade_is_idempotent() {
        let (_tx, rx) = LazyFuture::<u32>::pair();
        rx.cell().upgrade(0);
        rx.cell().upgrade(0);
    }
}
