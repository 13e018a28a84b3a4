//! After a single-task workload, 1000 back-to-back barriers must each
//! return promptly: no livelock in the quiescence-detection protocol.

use forktask::{spawn, Runtime, RuntimeConfig};

#[test]
fn a_thousand_back_to_back_barriers_all_return() {
    let mut rt = Runtime::init(RuntimeConfig::builder().workers(4).build().unwrap());
    spawn(rt.master(), None, || {});
    rt.barrier();

    for i in 0..1000 {
        rt.barrier();
        assert!(rt.num_workers() == 4, "barrier {i} corrupted runtime state");
    }
    rt.exit();
}
