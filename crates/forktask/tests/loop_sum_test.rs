//! A splittable loop task reducing `[0, N+1)` by summation must equal
//! `N(N+1)/2` regardless of how (or whether) it gets split along the way.

use forktask::{spawn_loop_reduce, Runtime, RuntimeConfig};

#[test]
fn loop_sum_matches_closed_form_for_several_n() {
    for &n in &[0i64, 1, 17, 1_000, 10_000] {
        let mut rt = Runtime::init(RuntimeConfig::builder().workers(4).build().unwrap());
        let fut = spawn_loop_reduce(rt.master(), None, 0..(n + 1), 16, 64, 0i64, |i| i, |a, b| a + b);
        let result = fut.reduce(rt.master());
        assert_eq!(result, n * (n + 1) / 2, "n = {n}");
        rt.exit();
    }
}
