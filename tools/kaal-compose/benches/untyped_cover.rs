//! Untyped covering of a few thousand objects over a 1GB memory region

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use kaal_compose::untyped::UntypedAllocator;
use kaal_compose::{Arch, Object, ObjectSizes, ObjectSpace};

fn object_space() -> ObjectSpace {
    let mut objects = ObjectSpace::new(Arch::Aarch64);
    for i in 0..4096 {
        let object = match i % 4 {
            0 => Object::frame(12),
            1 => Object::frame(16),
            2 => Object::Endpoint,
            _ => Object::Notification,
        };
        objects
            .alloc(format!("obj_{}", i), None, object)
            .expect("unique names");
    }
    objects
}

fn cover_bench(c: &mut Criterion) {
    let sizes = ObjectSizes::for_arch(Arch::Aarch64);
    let mut allocator = UntypedAllocator::new(64);
    allocator.add_region(0x4000_0000, 0x8000_0000, false);
    allocator.add_region(0x0900_0000, 0x0a00_0000, true);

    c.bench_function("cover-4096", |b| {
        b.iter_batched(
            object_space,
            |mut objects| allocator.allocate(&mut objects, &sizes, true).expect("fits"),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, cover_bench);
criterion_main!(benches);
