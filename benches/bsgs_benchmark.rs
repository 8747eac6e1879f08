//! Benchmark: core arithmetic and solver throughput using Criterion
//!
//! Run with: cargo bench
//!
//! Covers the layers that dominate sweep time: field multiplication,
//! point operations, bloom probing, table build, and a small end-to-end
//! solve.

use bsgs::{
    BloomConfig, BloomFilter, BsgsEngine, BsgsParams, BabyStepTable, Fe, JacobianPoint, KeyRange,
    Target, ThreadPool, U256,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_field_mul(c: &mut Criterion) {
    let a = Fe::from_u256(U256::from_hex("deadbeefcafebabe0123456789abcdef").unwrap());
    let b = Fe::from_u256(U256::from_hex("fedcba9876543210ffeeddccbbaa9988").unwrap());
    c.bench_function("field_mul", |bencher| {
        bencher.iter(|| std::hint::black_box(a.mul(&b)))
    });
    c.bench_function("field_inv", |bencher| {
        bencher.iter(|| std::hint::black_box(a.inv()))
    });
}

fn bench_point_ops(c: &mut Criterion) {
    let p = JacobianPoint::mul_generator(&U256::from_u64(0x1234_5678));
    let q_affine = JacobianPoint::mul_generator(&U256::from_u64(0x9ABC)).to_affine();
    let k = U256::from_hex("2832ed74f2b5e35ee").unwrap();

    c.bench_function("point_add_mixed", |bencher| {
        bencher.iter(|| std::hint::black_box(p.add_affine(&q_affine)))
    });
    c.bench_function("point_double", |bencher| {
        bencher.iter(|| std::hint::black_box(p.double()))
    });
    c.bench_function("scalar_mul", |bencher| {
        bencher.iter(|| std::hint::black_box(JacobianPoint::mul_generator(&k)))
    });
}

fn bench_bloom(c: &mut Criterion) {
    let mut filter = BloomFilter::with_capacity(1 << 20, 0.001);
    for i in 0..(1u64 << 20) {
        filter.add(i.wrapping_mul(0x9E3779B97F4A7C15));
    }
    c.bench_function("bloom_probe_hit", |bencher| {
        bencher.iter(|| std::hint::black_box(filter.test(42u64.wrapping_mul(0x9E3779B97F4A7C15))))
    });
    c.bench_function("bloom_probe_miss", |bencher| {
        bencher.iter(|| std::hint::black_box(filter.test(0xDEAD_BEEF_DEAD_BEEF)))
    });
}

fn bench_table_build(c: &mut Criterion) {
    let pool = ThreadPool::new(0);
    let mut group = c.benchmark_group("table_build");
    group.sample_size(10);
    for m in [1u64 << 12, 1 << 14] {
        group.throughput(Throughput::Elements(m));
        group.bench_with_input(BenchmarkId::from_parameter(m), &m, |bencher, &m| {
            bencher.iter(|| {
                std::hint::black_box(
                    BabyStepTable::build(m, &BloomConfig::default(), &pool).unwrap(),
                )
            })
        });
    }
    group.finish();
}

fn bench_small_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("solve");
    group.sample_size(10);

    // 20-bit range; key in the upper half so the sweep does real work
    let key = U256::from_hex("c5a3d").unwrap();
    let target = Target::PubKey(JacobianPoint::mul_generator(&key).to_affine());

    group.bench_function("20bit_range", |bencher| {
        bencher.iter(|| {
            let range =
                KeyRange::new(U256::ONE, U256::from_hex("fffff").unwrap()).unwrap();
            let mut params = BsgsParams::new(range);
            params.m = Some(1024);
            params.num_threads = 0;
            let mut engine = BsgsEngine::new(params);
            engine.initialize(vec![target.clone()]).unwrap();
            let results = engine.run().unwrap();
            assert_eq!(results.len(), 1);
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_field_mul,
    bench_point_ops,
    bench_bloom,
    bench_small_solve,
    bench_table_build
);
criterion_main!(benches);
