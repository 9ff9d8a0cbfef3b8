//! Benchmarks for VexDB insert and search paths.
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vexdb::{Algorithm, Config, Vector, VexDB};

const DIMENSION: usize = 64;

fn random_vectors(count: usize, seed: u64) -> Vec<Vector> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            Vector::from(
                (0..DIMENSION)
                    .map(|_| rng.random::<f32>())
                    .collect::<Vec<_>>(),
            )
        })
        .collect()
}

fn populated_db(algorithm: Algorithm, vectors: &[Vector]) -> VexDB {
    // Cache off so the search benches measure the index, not the LRU.
    let config = Config {
        algorithm,
        index_seed: Some(42),
        query_cache_capacity: 0,
        ..Config::in_memory(DIMENSION)
    };
    let db = VexDB::open(config).unwrap();
    for (i, vector) in vectors.iter().enumerate() {
        db.insert(&format!("v{i}"), vector.clone(), None).unwrap();
    }
    db
}

/// Benchmark single inserts into an in-memory database.
fn bench_insert(c: &mut Criterion) {
    let vectors = random_vectors(10_000, 1);

    let mut group = c.benchmark_group("insert");
    for algorithm in [Algorithm::Exact, Algorithm::Lsh, Algorithm::Hnsw] {
        group.bench_with_input(
            BenchmarkId::from_parameter(algorithm),
            &algorithm,
            |b, &algorithm| {
                b.iter_custom(|iters| {
                    let mut total = std::time::Duration::ZERO;
                    let config = Config {
                        algorithm,
                        index_seed: Some(42),
                        ..Config::in_memory(DIMENSION)
                    };
                    let db = VexDB::open(config).unwrap();

                    for i in 0..iters {
                        let vector = vectors[(i as usize) % vectors.len()].clone();
                        let key = format!("bench-{i}");
                        let start = std::time::Instant::now();
                        db.insert(&key, vector, None).unwrap();
                        total += start.elapsed();
                    }
                    total
                });
            },
        );
    }
    group.finish();
}

/// Benchmark top-10 search over 10K vectors per algorithm.
fn bench_search(c: &mut Criterion) {
    let vectors = random_vectors(10_000, 2);
    let queries = random_vectors(64, 3);

    let mut group = c.benchmark_group("search_10k_top10");
    group.sample_size(20);
    for algorithm in [Algorithm::Exact, Algorithm::Lsh, Algorithm::Hnsw] {
        let db = populated_db(algorithm, &vectors);
        let mut next_query = 0usize;
        group.bench_with_input(
            BenchmarkId::from_parameter(algorithm),
            &algorithm,
            |b, _| {
                b.iter(|| {
                    // Rotate queries so the result cache never answers.
                    let query = &queries[next_query % queries.len()];
                    next_query += 1;
                    db.similarity_search(query, 10).unwrap()
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a cache hit: the same query repeated.
fn bench_cached_search(c: &mut Criterion) {
    let vectors = random_vectors(10_000, 4);
    let config = Config {
        index_seed: Some(42),
        ..Config::in_memory(DIMENSION)
    };
    let db = VexDB::open(config).unwrap();
    for (i, vector) in vectors.iter().enumerate() {
        db.insert(&format!("v{i}"), vector.clone(), None).unwrap();
    }
    let query = vectors[0].clone();

    c.bench_function("search_cached", |b| {
        b.iter(|| db.similarity_search(&query, 10).unwrap());
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_cached_search);
criterion_main!(benches);
