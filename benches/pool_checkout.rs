//! Criterion benchmark for checkout contention and transaction bookkeeping.
//!
//! Runs against the in-process memory driver so the numbers reflect the coordination layer
//! (slot accounting, waiter hand-off, frame stack, callback dispatch) and not a database.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sql_coordinator::memory::MemoryFactory;
use sql_coordinator::prelude::*;
use std::hint::black_box;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::task::JoinSet;

static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));
static BENCH_CONCURRENCY: LazyLock<usize> = LazyLock::new(|| concurrency_to_run().max(1));

/// Resolve how many worker tasks to run in parallel.
fn concurrency_to_run() -> usize {
    std::env::var("BENCH_CONCURRENCY")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8)
}

fn memory_pool(size: usize) -> ConnectionPool {
    let config = PoolConfig::builder()
        .max_size(size)
        .checkout_timeout(Duration::from_secs(30))
        .build()
        .expect("valid benchmark pool config");
    ConnectionPool::new(config, Arc::new(MemoryFactory::new())).expect("memory pool")
}

async fn parallel_checkout(
    pool: &ConnectionPool,
    concurrency: usize,
    rounds: usize,
) -> Result<(), SqlCoordinatorError> {
    let mut join_set = JoinSet::new();
    for _ in 0..concurrency {
        let pool = pool.clone();
        join_set.spawn(async move {
            for _ in 0..rounds {
                let conn = pool.checkout().await?;
                black_box(conn.id());
            }
            Ok::<(), SqlCoordinatorError>(())
        });
    }

    while let Some(outcome) = join_set.join_next().await {
        let result = outcome.expect("checkout worker panicked");
        result?;
    }
    Ok(())
}

async fn nested_transaction(
    conn: &mut Connection,
    callbacks: Arc<TransactionCallbacks>,
) -> Result<(), SqlCoordinatorError> {
    conn.transaction(TransactionOptions::new(), move |tx| {
        Box::pin(async move {
            tx.register_participant("outer#1", ActionKind::Update, Arc::clone(&callbacks))?;
            tx.transaction(TransactionOptions::new().requiring_new(), move |sp| {
                Box::pin(async move {
                    sp.register_participant("inner#1", ActionKind::Create, callbacks)?;
                    Ok::<_, SqlCoordinatorError>(TxControl::<()>::Rollback)
                })
            })
            .await?;
            Ok::<_, SqlCoordinatorError>(TxControl::Commit(()))
        })
    })
    .await?;
    Ok(())
}

fn benchmark_contended_checkout(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let runtime = &*TOKIO_RUNTIME;
    let concurrency = *BENCH_CONCURRENCY;

    let mut sizes = vec![1, (concurrency / 2).max(1), concurrency];
    sizes.dedup();
    for pool_size in sizes {
        group.bench_function(BenchmarkId::new("checkout_pool_size", pool_size), |b| {
            let pool = memory_pool(pool_size);
            b.to_async(runtime).iter_custom(move |iters| {
                let pool = pool.clone();
                async move {
                    let mut total = Duration::default();
                    for _ in 0..iters {
                        let start = Instant::now();
                        parallel_checkout(&pool, concurrency, 16)
                            .await
                            .expect("parallel checkout");
                        total += start.elapsed();
                    }
                    total
                }
            });
        });
    }
}

fn benchmark_nested_transactions(
    group: &mut criterion::BenchmarkGroup<'_, criterion::measurement::WallTime>,
) {
    let runtime = &*TOKIO_RUNTIME;
    let callbacks = Arc::new(
        TransactionCallbacks::new()
            .after_commit(|n| {
                black_box(n.participant);
                Ok(())
            })
            .after_rollback(|n| {
                black_box(n.participant);
                Ok(())
            }),
    );

    group.bench_function("nested_savepoint_with_callbacks", |b| {
        let pool = memory_pool(1);
        let callbacks = Arc::clone(&callbacks);
        b.to_async(runtime).iter_custom(move |iters| {
            let pool = pool.clone();
            let callbacks = Arc::clone(&callbacks);
            async move {
                let mut conn = pool.checkout().await.expect("checkout");
                let start = Instant::now();
                for _ in 0..iters {
                    nested_transaction(&mut conn, Arc::clone(&callbacks))
                        .await
                        .expect("nested transaction");
                }
                start.elapsed()
            }
        });
    });
}

fn pool_checkout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_checkout");
    group.throughput(Throughput::Elements((*BENCH_CONCURRENCY * 16) as u64));
    benchmark_contended_checkout(&mut group);
    group.finish();

    let mut group = c.benchmark_group("transactions");
    group.throughput(Throughput::Elements(1));
    benchmark_nested_transactions(&mut group);
    group.finish();
}

criterion_group!(benches, pool_checkout);
criterion_main!(benches);
