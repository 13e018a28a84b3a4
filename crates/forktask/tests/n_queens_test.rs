//! N-queens via the await-scoped list form: at each row, every legal
//! placement is forked as a future, the whole row's worth of futures is
//! collected into one [`AwaitAll`] scope, and the scope is forced at its
//! natural exit point before the partial counts are summed — the scenario
//! `spec.md` §8 names explicitly to exercise `await_all`.

use forktask::{await_future, spawn_future, with_current_worker, AwaitAll, Runtime, RuntimeConfig};

/// `cols`/`diag1`/`diag2` are bitmasks of columns already attacked by a
/// queen placed in an earlier row; a solution is complete once every
/// column bit in `cols` is set (one queen per row, `n` rows total).
fn count_solutions(n: u32, cols: u32, diag1: u32, diag2: u32) -> u64 {
    let full = (1u32 << n) - 1;
    if cols == full {
        return 1;
    }
    let mut available = full & !(cols | diag1 | diag2);
    if available == 0 {
        return 0;
    }

    let mut results = vec![0u64; available.count_ones() as usize];
    let mut scope = AwaitAll::new();
    let parent = with_current_worker(|w| w.current_task()).expect("count_solutions recurses only from within a task running on a worker thread");

    let mut dest_iter = results.iter_mut();
    while available != 0 {
        let bit = available & available.wrapping_neg();
        available &= available - 1;
        let new_cols = cols | bit;
        let new_diag1 = (diag1 | bit) << 1;
        let new_diag2 = (diag2 | bit) >> 1;
        let dest = dest_iter.next().expect("one destination slot per set bit in `available`");
        with_current_worker(|worker| {
            let fut = spawn_future(worker, parent, move || count_solutions(n, new_cols, new_diag1, new_diag2));
            scope.push(fut, dest);
        })
        .expect("count_solutions recurses only from within a task running on a worker thread");
    }
    with_current_worker(|worker| scope.finish(worker)).expect("count_solutions recurses only from within a task running on a worker thread");

    results.into_iter().sum()
}

#[test]
fn n_queens_matches_known_solution_counts() {
    for &(n, expected) in &[(8u32, 92u64), (10u32, 724u64)] {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(4).build().unwrap());
        let fut = spawn_future(rt.master(), None, move || count_solutions(n, 0, 0, 0));
        let result = await_future(rt.master(), &fut);
        assert_eq!(result, expected, "n = {n}");
        rt.exit();
    }
}
