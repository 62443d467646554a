use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use noomr::{
  Config, Sequential, SharedHeap,
  size_class::{NUM_CLASSES, class_to_size},
};
use std::hint::black_box;

const ROUNDS: usize = 100_000;

/// Cycles through every size class holding all blocks, then releases them. The first iteration
/// grows the segment, later ones run entirely off the free lists.
fn benchmark_class_sweep(c: &mut Criterion) {
  let root = tempfile::tempdir().expect("backing root");
  let heap = SharedHeap::create(Config::default().with_backing_root(root.path())).expect("shared heap");
  let task = heap.task(Sequential);
  let mut held = Vec::with_capacity(ROUNDS);

  let mut group = c.benchmark_group("class_sweep");
  group.sample_size(20);
  group.throughput(Throughput::Elements(ROUNDS as u64));

  group.bench_function("allocate_then_release", |b| {
    b.iter(|| {
      for round in 0..ROUNDS {
        held.push(task.allocate(class_to_size(round % NUM_CLASSES)));
      }
      for block in held.drain(..) {
        unsafe { task.release(black_box(block)) };
      }
    })
  });

  group.finish();
  println!("{}", heap.stats());
}

criterion_group!(benches, benchmark_class_sweep);
criterion_main!(benches);
