#![feature(test)]

extern crate test;

use std::time::Duration;

use nexus_io::EventLoop;
use test::Bencher;

#[bench]
fn bench_many_immediate_timeouts(bench: &mut Bencher) {
    const NUM: usize = 1_000;

    bench.iter(|| {
        let mut event_loop = EventLoop::new().unwrap();
        for _ in 0..NUM {
            event_loop.add_timeout(Duration::from_nanos(0), |_| {}).unwrap();
        }
        event_loop.run().unwrap();
    })
}

#[bench]
fn bench_cross_thread_wake_round_trip(bench: &mut Bencher) {
    bench.iter(|| {
        let mut event_loop = EventLoop::new().unwrap();
        let waker = event_loop.wake_handle();
        waker.wake().unwrap();
        event_loop.run_once(Some(Duration::from_secs(1))).unwrap();
    })
}
