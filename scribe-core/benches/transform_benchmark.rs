use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use scribe_core::operation::{apply, Edit};
use scribe_core::transform::transform_edits;
use scribe_core::version::digest;
use std::hint::black_box;
use uuid::Uuid;

fn typing_run(start: usize, n: usize) -> Vec<Edit> {
    (0..n).map(|i| Edit::insert(start + i, "x")).collect()
}

fn bench_transform_single(c: &mut Criterion) {
    let a = [Edit::insert(10, "hello")];
    let b = [Edit::delete(4, 12)];
    let (ua, ub) = (Uuid::new_v4(), Uuid::new_v4());

    c.bench_function("transform_insert_vs_delete", |bench| {
        bench.iter(|| black_box(transform_edits(black_box(&a), ua, black_box(&b), ub)))
    });
}

fn bench_transform_batches(c: &mut Criterion) {
    let (ua, ub) = (Uuid::new_v4(), Uuid::new_v4());
    let mut group = c.benchmark_group("transform_batch");
    for n in [4usize, 16, 64] {
        let a = typing_run(0, n);
        let b = typing_run(50, n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, _| {
            bench.iter(|| black_box(transform_edits(&a, ua, &b, ub)))
        });
    }
    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let text = "lorem ipsum dolor sit amet ".repeat(400);
    let edits = vec![Edit::insert(5000, "## heading\n"), Edit::delete(120, 40)];

    c.bench_function("apply_10KB", |bench| {
        bench.iter(|| black_box(apply(black_box(&text), black_box(&edits))))
    });
}

fn bench_digest(c: &mut Criterion) {
    let text = "# Title\n\nsome markdown body\n".repeat(1000);

    c.bench_function("digest_28KB", |bench| {
        bench.iter(|| black_box(digest(black_box(&text))))
    });
}

criterion_group!(
    benches,
    bench_transform_single,
    bench_transform_batches,
    bench_apply,
    bench_digest,
);
criterion_main!(benches);
