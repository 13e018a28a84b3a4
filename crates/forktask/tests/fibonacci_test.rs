//! Recursive-future fibonacci: `fib(n)` forks its `n - 1` branch as a
//! future and computes `n - 2` inline, matching the classic fork/join
//! textbook example. Must agree across worker counts and (at whichever
//! future flavour this build selects) future delivery path.

use forktask::{await_future, spawn_future, with_current_worker, Runtime, RuntimeConfig};

fn fib(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let left = with_current_worker(|worker| {
        let parent = worker.current_task();
        spawn_future(worker, parent, move || fib(n - 1))
    })
    .expect("fib recurses only from within a task running on a worker thread");
    let right = fib(n - 2);
    let left_value =
        with_current_worker(|worker| await_future(worker, &left)).expect("fib recurses only from within a task running on a worker thread");
    left_value + right
}

#[test]
fn fib_20_is_6765_for_every_worker_count() {
    for &workers in &[1usize, 2, 4, 8] {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(workers).build().unwrap());
        let fut = spawn_future(rt.master(), None, || fib(20));
        let result = await_future(rt.master(), &fut);
        assert_eq!(result, 6765, "workers = {workers}");
        rt.exit();
    }
}
