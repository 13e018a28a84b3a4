//! Bounded, non-blocking channels (`spec.md` §3.3/§4.2).
//!
//! Three disciplines, selected at construction:
//! - [`SpscChannel`]: lock-free via acquire/release between one producer and
//!   one consumer. Used for steal-request reply channels and future
//!   channels — the two hot paths where avoiding a mutex actually matters.
//! - [`MpscChannel`]: any worker may send, only the owner receives. Used for
//!   per-worker steal-request inboxes.
//! - [`MpmcChannel`]: the general fallback, used where the endpoint set is
//!   not known ahead of time.
//!
//! `send`/`receive` never block: they report success/failure and the caller
//! retries or does other work, per `spec.md` §4.2.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Capacity `0` requests are given one internal slot: an "unbuffered"
/// channel is a one-slot handoff, not a zero-slot one (`spec.md` §3.3).
fn effective_capacity(requested: usize) -> usize {
    requested.max(1)
}

// ---------------------------------------------------------------------
// SPSC
// ---------------------------------------------------------------------

pub struct SpscChannel<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    cap: usize,
    requested_cap: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    closed: AtomicBool,
}

unsafe impl<T: Send> Send for SpscChannel<T> {}
unsafe impl<T: Send> Sync for SpscChannel<T> {}

impl<T> SpscChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let cap = effective_capacity(capacity);
        let buf = (0..cap).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect::<Vec<_>>().into_boxed_slice();
        Self {
            buf,
            cap,
            requested_cap: capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Attempts to enqueue `value`. Returns it back on a full channel.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.cap {
            return Err(value);
        }
        let idx = tail % self.cap;
        // SAFETY: slot `idx` is not readable by the consumer until we
        // publish the new `tail` below (release), and only this producer
        // ever writes to it.
        unsafe {
            (*self.buf[idx].get()).write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Attempts to dequeue one item.
    pub fn try_receive(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head % self.cap;
        // SAFETY: the producer published this slot via the `tail` store
        // (release) observed above (acquire); only this consumer reads it.
        let value = unsafe { (*self.buf[idx].get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peek(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// The capacity this channel was constructed with (`0` meant
    /// unbuffered even though one internal slot backs it).
    pub fn requested_capacity(&self) -> usize {
        self.requested_cap
    }
}

impl<T> Drop for SpscChannel<T> {
    fn drop(&mut self) {
        while self.try_receive().is_some() {}
    }
}

// ---------------------------------------------------------------------
// MPSC / MPMC — share a mutex-guarded ring; the discipline only documents
// who is allowed to call which side, the mutex itself doesn't distinguish.
// ---------------------------------------------------------------------

struct GuardedRing<T> {
    queue: Mutex<VecDeque<T>>,
    cap: usize,
    closed: AtomicBool,
}

impl<T> GuardedRing<T> {
    fn new(capacity: usize) -> Self {
        let cap = effective_capacity(capacity);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking: if the lock is contended, report failure rather than
    /// wait for it (never blocks the caller per `spec.md` §4.2).
    fn try_send(&self, value: T) -> Result<(), T> {
        match self.queue.try_lock() {
            Some(mut q) if q.len() < self.cap => {
                q.push_back(value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    fn try_receive(&self) -> Option<T> {
        self.queue.try_lock().and_then(|mut q| q.pop_front())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peek(&self) -> usize {
        self.queue.try_lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Multi-producer, single-consumer: any worker may send a steal request into
/// another worker's inbox; only the owner drains it.
pub struct MpscChannel<T>(GuardedRing<T>);

impl<T> MpscChannel<T> {
    pub fn new(capacity: usize) -> Self {
        Self(GuardedRing::new(capacity))
    }
    pub fn try_send(&self, value: T) -> Result<(), T> {
        self.0.try_send(value)
    }
    pub fn try_receive(&self) -> Option<T> {
        self.0.try_receive()
    }
    pub fn close(&self) {
        self.0.close()
    }
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
    pub fn peek(&self) -> usize {
        self.0.peek()
    }
}

/// General fallback: an unconstrained set of producers and consumers.
pub struct MpmcChannel<T>(GuardedRing<T>);

impl<T> MpmcChannel<T> {
    pub fn new(capacity: usize) -> Self {
        Self(GuardedRing::new(capacity))
    }
    pub fn try_send(&self, value: T) -> Result<(), T> {
        self.0.try_send(value)
    }
    pub fn try_receive(&self) -> Option<T> {
        self.0.try_receive()
    }
    pub fn close(&self) {
        self.0.close()
    }
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
    pub fn peek(&self) -> usize {
        self.0.peek()
    }
}

// ---------------------------------------------------------------------
// Channel cache (`spec.md` §4.2, "Channel cache")
// ---------------------------------------------------------------------

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static SPSC_CACHE: RefCell<HashMap<(TypeId, usize), Vec<Arc<dyn Any + Send + Sync>>>> = RefCell::new(HashMap::new());
}

/// Thread-local pool of recycled [`SpscChannel`]s, keyed by `(item type,
/// capacity)`. Disabled (and entirely bypassed) when `limit == 0`, matching
/// `spec.md`'s note that under strict memory discipline the cache "can be
/// omitted entirely" — every worker passes its own `RuntimeConfig::channel_cache`
/// as `limit`, so a `0` there means every acquire/release pair degrades to a
/// plain alloc/drop.
pub struct ChannelCache;

impl ChannelCache {
    /// Pops a cached channel of the right type and capacity, or allocates a
    /// fresh one.
    pub fn acquire_spsc<T: Send + 'static>(capacity: usize, limit: usize) -> Arc<SpscChannel<T>> {
        if limit == 0 {
            return Arc::new(SpscChannel::new(capacity));
        }
        let key = (TypeId::of::<T>(), capacity);
        let cached = SPSC_CACHE.with(|c| c.borrow_mut().get_mut(&key).and_then(|slot| slot.pop()));
        match cached.and_then(|any| any.downcast::<SpscChannel<T>>().ok()) {
            Some(chan) => chan,
            None => Arc::new(SpscChannel::new(capacity)),
        }
    }

    /// Returns a channel to the cache if there is room and no other owner
    /// still holds a reference; otherwise it is simply dropped.
    pub fn release_spsc<T: Send + 'static>(chan: Arc<SpscChannel<T>>, capacity: usize, limit: usize) {
        if limit == 0 || Arc::strong_count(&chan) != 1 {
            return;
        }
        let key = (TypeId::of::<T>(), capacity);
        SPSC_CACHE.with(|c| {
            let mut map = c.borrow_mut();
            let slot = map.entry(key).or_default();
            if slot.len() < limit {
                slot.push(chan as Arc<dyn Any + Send + Sync>);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn spsc_respects_capacity() {
        let ch = SpscChannel::new(2);
        assert!(ch.try_send(1).is_ok());
        assert!(ch.try_send(2).is_ok());
        assert!(ch.try_send(3).is_err());
        assert_eq!(ch.try_receive(), Some(1));
        assert!(ch.try_send(3).is_ok());
    }

    #[test]
    fn spsc_unbuffered_holds_at_most_one() {
        let ch = SpscChannel::new(0);
        assert!(ch.try_send(1).is_ok());
        assert!(ch.try_send(2).is_err());
        assert_eq!(ch.try_receive(), Some(1));
        assert_eq!(ch.try_receive(), None);
    }

    #[test]
    fn spsc_fifo_across_threads() {
        let ch = Arc::new(SpscChannel::<u32>::new(16));
        let producer = {
            let ch = ch.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    while ch.try_send(i).is_err() {
                        thread::yield_now();
                    }
                }
            })
        };
        let mut got = vec![];
        while got.len() < 1000 {
            if let Some(v) = ch.try_receive() {
                got.push(v);
            }
        }
        producer.join().unwrap();
        assert_eq!(got, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn mpsc_never_exceeds_capacity() {
        let ch = MpscChannel::new(4);
        for _ in 0..4 {
            assert!(ch.try_send(()).is_ok());
        }
        assert!(ch.try_send(()).is_err());
        assert_eq!(ch.peek(), 4);
    }

    #[test]
    fn close_is_sticky() {
        let ch = MpmcChannel::<u8>::new(1);
        ch.close();
        assert!(ch.is_closed());
        // draining still works after close, per spec.
        let _ = ch.try_send(1);
        assert_eq!(ch.try_receive(), Some(1));
        assert!(ch.is_closed());
    }

    #[test]
    fn disabled_cache_never_recycles() {
        let a = ChannelCache::acquire_spsc::<u32>(4, 0);
        let ptr = Arc::as_ptr(&a);
        ChannelCache::release_spsc(a, 4, 0);
        let b = ChannelCache::acquire_spsc::<u32>(4, 0);
        assert_ne!(Arc::as_ptr(&b), ptr);
    }

    #[test]
    fn enabled_cache_recycles_matching_shape() {
        let a = ChannelCache::acquire_spsc::<u32>(4, 2);
        let ptr = Arc::as_ptr(&a);
        ChannelCache::release_spsc(a, 4, 2);
        let b = ChannelCache::acquire_spsc::<u32>(4, 2);
        assert_eq!(Arc::as_ptr(&b), ptr);
    }

    #[test]
    fn enabled_cache_does_not_recycle_shared_channel() {
        let a = ChannelCache::acquire_spsc::<u32>(4, 2);
        let _also_a = a.clone();
        ChannelCache::release_spsc(a, 4, 2);
        let b = ChannelCache::acquire_spsc::<u32>(4, 2);
        assert_ne!(Arc::as_ptr(&b), Arc::as_ptr(&_also_a));
    }
}
