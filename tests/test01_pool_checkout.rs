mod common;

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use sql_coordinator::prelude::*;

use common::memory_pool;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_checkouts_up_to_pool_size_all_succeed() -> Result<(), SqlCoordinatorError> {
    for size in 1..=5 {
        let (pool, _) = memory_pool(size, Duration::from_secs(1));
        let tasks = (0..size).map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.checkout().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, SqlCoordinatorError>(conn.id())
            })
        });
        for joined in join_all(tasks).await {
            joined.expect("task panicked")?;
        }
        assert_eq!(pool.stats().idle, pool.stats().size);
        assert!(pool.stats().size <= size);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_tasks_share_a_single_connection() -> Result<(), SqlCoordinatorError> {
    let (pool, factory) = memory_pool(1, Duration::from_secs(5));
    let tasks = (0..2).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.checkout().await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            pool.checkin(conn);
            Ok::<_, SqlCoordinatorError>(())
        })
    });
    for joined in join_all(tasks).await {
        joined.expect("task panicked")?;
    }

    let stats = pool.stats();
    assert_eq!((stats.size, stats.idle, stats.leased), (1, 1, 0));
    assert_eq!(factory.connections_opened(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_time_out_against_their_own_deadline() -> Result<(), SqlCoordinatorError> {
    let (pool, _) = memory_pool(1, Duration::from_millis(500));
    let held = pool.checkout().await?;

    let waiters = (0..2).map(|_| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = pool.checkout().await.map(drop);
            (result, started.elapsed())
        })
    });
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        drop(held);
    });

    for joined in join_all(waiters).await {
        let (result, elapsed) = joined.expect("task panicked");
        let err = result.expect_err("checkout should time out");
        assert!(err.is_retryable());
        assert!(matches!(err, SqlCoordinatorError::ConnectionTimeout { pool_size: 1, .. }));
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1200), "{elapsed:?}");
    }
    holder.await.expect("holder panicked");
    assert_eq!(pool.stats().idle, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiters_are_served_in_arrival_order() -> Result<(), SqlCoordinatorError> {
    let (pool, _) = memory_pool(1, Duration::from_secs(5));
    let held = pool.checkout().await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let mut tasks = Vec::new();
    for label in 0..3 {
        let pool = pool.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.checkout().await?;
            tx.send(label).expect("receiver alive");
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(conn);
            Ok::<_, SqlCoordinatorError>(())
        }));
        // park each waiter before the next one arrives
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(pool.stats().waiting, 3);
    drop(held);
    for joined in join_all(tasks).await {
        joined.expect("task panicked")?;
    }
    drop(tx);

    let mut order = Vec::new();
    while let Some(label) = rx.recv().await {
        order.push(label);
    }
    assert_eq!(order, vec![0, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn with_connection_checks_in_on_error() -> Result<(), SqlCoordinatorError> {
    let (pool, factory) = memory_pool(1, Duration::from_millis(200));
    factory.faults().fail_sql("broken");

    let result: Result<(), SqlCoordinatorError> = pool
        .with_connection(|conn| {
            Box::pin(async move {
                conn.execute("SELECT broken", &[]).await?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(
        result,
        Err(SqlCoordinatorError::StatementInvalid { .. })
    ));

    let rows = pool
        .with_connection(|conn| {
            Box::pin(async move {
                let rs = conn.execute("SELECT 1", &[]).await?;
                Ok::<_, SqlCoordinatorError>(rs.results.len())
            })
        })
        .await?;
    assert_eq!(rows, 1);
    assert_eq!(pool.stats().idle, 1);
    Ok(())
}

#[tokio::test]
async fn dead_connections_are_replaced_silently() -> Result<(), SqlCoordinatorError> {
    let (pool, factory) = memory_pool(2, Duration::from_millis(200));
    {
        let _a = pool.checkout().await?;
        let _b = pool.checkout().await?;
    }
    factory.faults().kill_all();

    let a = pool.checkout().await?;
    let b = pool.checkout().await?;
    assert!(!a.is_dead() && !b.is_dead());
    assert_eq!(pool.stats().size, 2);
    assert_eq!(factory.connections_opened(), 4);
    Ok(())
}

#[tokio::test]
async fn connection_dying_while_leased_is_discarded_at_checkin() -> Result<(), SqlCoordinatorError> {
    let (pool, factory) = memory_pool(1, Duration::from_millis(200));
    let mut conn = pool.checkout().await?;
    factory.faults().kill_all();
    assert!(!conn.verify().await);
    drop(conn);

    let stats = pool.stats();
    assert_eq!((stats.size, stats.idle), (0, 0));
    assert!(!pool.is_connected());
    pool.checkout().await?;
    Ok(())
}

#[tokio::test]
async fn lease_records_the_owner() -> Result<(), SqlCoordinatorError> {
    let (pool, _) = memory_pool(1, Duration::from_millis(200));
    let conn = pool.checkout().await?;
    assert_eq!(conn.state(), sql_coordinator::HandleState::Leased);
    assert!(conn.owner().is_some());
    Ok(())
}

#[test]
fn invalid_pool_config_is_rejected() {
    assert!(matches!(
        PoolConfig::from_json(r#"{ "pool": 0 }"#),
        Err(SqlCoordinatorError::ConfigError(_))
    ));
    assert!(PoolConfig::from_json(r#"{ "checkout_timeout": -1.0 }"#).is_err());
    let cfg = PoolConfig::from_json("{}").unwrap();
    assert_eq!(cfg, PoolConfig::default());
}
