use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use outpost::control_block::ControlBlock;
use outpost::MESSAGE_SIZE;
use std::alloc::Layout;

fn bench_ring_throughput(c: &mut Criterion) {
    let ring_size: u32 = 64 * 1024;
    let ring_offset: u32 = 4096;
    let layout = Layout::from_size_align(ring_offset as usize + ring_size as usize, 64).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) } as *mut ControlBlock;
    unsafe {
        ControlBlock::init(ptr, ring_size, ring_offset);
    }

    let message = [0x5au8; MESSAGE_SIZE];
    let mut out = [0u8; MESSAGE_SIZE];

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(ring_size as u64));
    group.bench_function("fill_drain_64k", |b| {
        b.iter(|| {
            let mut guard = unsafe { ControlBlock::lock_ring(ptr) };
            while guard.write(&message) {}
            while guard.read(&mut out) {}
        });
    });
    group.finish();

    unsafe {
        std::alloc::dealloc(ptr as *mut u8, layout);
    }
}

criterion_group!(benches, bench_ring_throughput);
criterion_main!(benches);
