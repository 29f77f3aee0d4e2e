#![feature(test)]

extern crate test;

use nexus_io::BufferPool;
use test::Bencher;

#[bench]
fn bench_acquire_release_cycle(bench: &mut Bencher) {
    let pool = BufferPool::new(4096, 64);

    bench.iter(|| {
        let view = pool.acquire().unwrap();
        view.with_bytes_mut(|buf| buf.extend_from_slice(&[0u8; 4096]));
        drop(view);
    })
}

#[bench]
fn bench_child_view_refcounting(bench: &mut Bencher) {
    let pool = BufferPool::new(4096, 64);
    let view = pool.acquire().unwrap();
    view.with_bytes_mut(|buf| buf.extend_from_slice(&[0u8; 4096]));

    bench.iter(|| {
        let children: Vec<_> = (0..8).map(|i| view.child(i * 512, 512)).collect();
        drop(children);
    })
}
