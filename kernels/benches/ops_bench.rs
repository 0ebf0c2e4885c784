use criterion::{Criterion, criterion_group, criterion_main};
use meshtrain_kernels::{cpu_extract_block, cpu_matmul};
use std::hint::black_box;

fn benchmark_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("matmul");
    for &size in &[64, 128, 256] {
        let lhs = vec![1.0f32; size * size];
        let rhs = vec![1.0f32; size * size];
        group.bench_function(format!("{size}x{size}"), |b| {
            b.iter(|| cpu_matmul(black_box(&lhs), black_box(&rhs), &[size, size], &[size, size]))
        });
    }
    group.finish();
}

fn benchmark_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_block");
    let shape = [512, 512];
    let data = vec![0.5f32; 512 * 512];

    group.bench_function("rows_half", |b| {
        b.iter(|| cpu_extract_block(black_box(&data), &shape, &[0..256, 0..512]))
    });
    group.bench_function("columns_half", |b| {
        b.iter(|| cpu_extract_block(black_box(&data), &shape, &[0..512, 256..512]))
    });
    group.finish();
}

criterion_group!(benches, benchmark_matmul, benchmark_block);
criterion_main!(benches);
