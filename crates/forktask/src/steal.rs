//! The steal-request message and victim selection (`spec.md` §3.4/§4.4).

use crate::channel::SpscChannel;
use crate::deque::Batch;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StealState {
    Working,
    Idle,
    Failed,
}

/// A request circulating among workers asking for tasks. `victims` is a
/// bitset of worker ids still eligible to be tried (supports up to 64
/// workers, a generous bound for a fixed thread-pool scheduler of this
/// kind — see `DESIGN.md`).
pub struct StealRequest {
    pub requester: usize,
    pub reply: Arc<SpscChannel<Batch>>,
    pub try_count: usize,
    pub victims: u64,
    pub state: StealState,
    pub steal_half: bool,
}

impl StealRequest {
    pub fn new(requester: usize, num_workers: usize, reply: Arc<SpscChannel<Batch>>, state: StealState, steal_half: bool) -> Self {
        Self {
            requester,
            reply,
            try_count: 0,
            victims: all_but_self(requester, num_workers),
            state,
            steal_half,
        }
    }

    pub fn remove_victim(&mut self, id: usize) {
        self.victims &= !(1u64 << id);
    }

    pub fn has_candidates(&self) -> bool {
        self.victims != 0
    }
}

/// Bitset of every worker id in `0..num_workers` except `excl`.
pub fn all_but_self(excl: usize, num_workers: usize) -> u64 {
    let all: u64 = if num_workers >= 64 { u64::MAX } else { (1u64 << num_workers) - 1 };
    all & !(1u64 << excl)
}

/// Picks a victim from the candidate bitset: `last_victim`/`last_thief` are
/// tried first if still eligible, otherwise up to three random draws, then
/// exhaustive enumeration of the remaining set bits. Never returns `self` or
/// a worker outside `0..num_workers` (`spec.md` §8 property 8).
pub fn select_victim(candidates: u64, last_victim: Option<usize>, last_thief: Option<usize>, rng: &mut impl rand::RngCore) -> Option<usize> {
    if candidates == 0 {
        return None;
    }
    for preferred in [last_victim, last_thief].into_iter().flatten() {
        if candidates & (1u64 << preferred) != 0 {
            return Some(preferred);
        }
    }
    let count = candidates.count_ones();
    for _ in 0..3 {
        let k = (rng.next_u32() as u64) % count as u64;
        if let Some(id) = nth_set_bit(candidates, k) {
            return Some(id);
        }
    }
    // Exhaustive fallback: first remaining candidate.
    nth_set_bit(candidates, 0)
}

fn nth_set_bit(mut bits: u64, mut n: u64) -> Option<usize> {
    if bits == 0 {
        return None;
    }
    loop {
        let idx = bits.trailing_zeros();
        if n == 0 {
            return Some(idx as usize);
        }
        bits &= bits - 1;
        if bits == 0 {
            return None;
        }
        n -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn victim_never_self_or_out_of_range() {
        let candidates = all_but_self(2, 8);
        let mut rng = StepRng::new(0, 1);
        for _ in 0..50 {
            let v = select_victim(candidates, None, None, &mut rng).unwrap();
            assert_ne!(v, 2);
            assert!(v < 8);
        }
    }

    #[test]
    fn prefers_last_victim_when_eligible() {
        let candidates = all_but_self(0, 8);
        let mut rng = StepRng::new(0, 1);
        assert_eq!(select_victim(candidates, Some(5), None, &mut rng), Some(5));
    }

    #[test]
    fn empty_candidates_returns_none() {
        let mut rng = StepRng::new(0, 1);
        assert_eq!(select_victim(0, None, None, &mut rng), None);
    }
}
