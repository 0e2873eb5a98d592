#![cfg(feature = "sqlite")]

mod common;

use std::time::Duration;

use sql_coordinator::prelude::*;
use tempfile::TempDir;

use common::Recorder;

async fn sqlite_pool(dir: &TempDir, size: usize) -> Result<ConnectionPool, SqlCoordinatorError> {
    let path = dir.path().join("coordinator.db");
    let pool = SqliteFactory::builder(path.to_string_lossy().into_owned())
        .busy_timeout(Duration::from_secs(2))
        .build(
            PoolConfig::builder()
                .max_size(size)
                .checkout_timeout(Duration::from_secs(2))
                .build()?,
        )
        .await?;
    let mut conn = pool.checkout().await?;
    conn.execute(
        "CREATE TABLE topics (id INTEGER PRIMARY KEY, title TEXT NOT NULL)",
        &[],
    )
    .await?;
    Ok(pool)
}

async fn count_topics(conn: &mut Connection) -> Result<i64, SqlCoordinatorError> {
    let rs = conn.select_all("SELECT count(*) AS n FROM topics", &[]).await?;
    Ok(rs.results[0]
        .get("n")
        .and_then(RowValues::as_int)
        .copied()
        .unwrap_or_default())
}

#[tokio::test]
async fn savepoint_rollback_reverts_only_inner_writes() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 1).await?;
    let mut conn = pool.checkout().await?;
    let recorder = Recorder::new();
    let (outer_cb, inner_cb) = (recorder.callbacks(), recorder.callbacks());

    conn.transaction(TransactionOptions::new(), move |tx| {
        Box::pin(async move {
            tx.execute(
                "INSERT INTO topics (id, title) VALUES (?, ?)",
                &[RowValues::Int(1), RowValues::Text("kept".into())],
            )
            .await?;
            tx.register_participant("topic#1", ActionKind::Create, outer_cb)?;

            tx.transaction(TransactionOptions::new().requiring_new(), move |sp| {
                Box::pin(async move {
                    sp.execute(
                        "INSERT INTO topics (id, title) VALUES (?, ?)",
                        &[RowValues::Int(2), RowValues::Text("dropped".into())],
                    )
                    .await?;
                    sp.register_participant("topic#2", ActionKind::Create, inner_cb)?;
                    Ok::<_, SqlCoordinatorError>(TxControl::<()>::Rollback)
                })
            })
            .await?;
            Ok::<_, SqlCoordinatorError>(TxControl::Commit(()))
        })
    })
    .await?;

    assert_eq!(count_topics(&mut conn).await?, 1);
    assert_eq!(
        recorder.events(),
        vec!["rollback topic#2", "commit topic#1"]
    );
    Ok(())
}

#[tokio::test]
async fn body_error_rolls_back_written_rows() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 1).await?;
    let mut conn = pool.checkout().await?;

    let result = conn
        .transaction(TransactionOptions::new(), |tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO topics (id, title) VALUES (?, ?)",
                    &[RowValues::Int(1), RowValues::Text("first".into())],
                )
                .await?;
                // duplicate primary key
                tx.execute(
                    "INSERT INTO topics (id, title) VALUES (?, ?)",
                    &[RowValues::Int(1), RowValues::Text("again".into())],
                )
                .await?;
                Ok::<_, SqlCoordinatorError>(TxControl::Commit(()))
            })
        })
        .await;

    assert!(matches!(
        result,
        Err(SqlCoordinatorError::StatementInvalid { .. })
    ));
    assert_eq!(conn.open_transactions(), 0);
    assert_eq!(count_topics(&mut conn).await?, 0);
    Ok(())
}

#[tokio::test]
async fn bound_statements_reuse_the_statement_cache() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 1).await?;
    let mut conn = pool.checkout().await?;

    for id in 1..=5 {
        conn.execute(
            "INSERT INTO topics (id, title) VALUES (?, ?)",
            &[RowValues::Int(id), RowValues::Text(format!("topic {id}"))],
        )
        .await?;
    }
    let rs = conn
        .select_all(
            "SELECT title FROM topics WHERE id = ?",
            &[RowValues::Int(3)],
        )
        .await?;

    assert_eq!(conn.statement_cache().len(), 2);
    assert_eq!(
        rs.results[0].get("title").and_then(RowValues::as_text),
        Some("topic 3")
    );
    assert_eq!(count_topics(&mut conn).await?, 5);
    Ok(())
}

#[tokio::test]
async fn isolation_levels_are_rejected_up_front() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 1).await?;
    let mut conn = pool.checkout().await?;

    let err = conn
        .begin_transaction(&TransactionOptions::new().with_isolation(IsolationLevel::Serializable))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlCoordinatorError::TransactionIsolation(_)));
    assert_eq!(conn.open_transactions(), 0);
    Ok(())
}

#[tokio::test]
async fn explain_returns_a_plan() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 1).await?;
    let mut conn = pool.checkout().await?;

    let plan = conn.explain("SELECT * FROM topics").await?;
    assert!(!plan.results.is_empty());
    Ok(())
}

#[tokio::test]
async fn collected_reads_are_explained_with_binds() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 1).await?;
    let mut conn = pool.checkout().await?;

    conn.collect_explain(true)?;
    conn.select_all("SELECT title FROM topics WHERE id = ?", &[RowValues::Int(3)])
        .await?;
    conn.exec_query("SCHEMA", "SELECT name FROM sqlite_master", &[])
        .await?;

    let plans = conn.explain_collected().await?;
    assert_eq!(plans.len(), 1);
    let (query, plan) = &plans[0];
    assert_eq!(query.sql, "SELECT title FROM topics WHERE id = ?");
    assert_eq!(query.binds, vec![RowValues::Int(3)]);
    assert!(!plan.results.is_empty());
    Ok(())
}

#[tokio::test]
async fn committed_rows_are_visible_from_another_connection() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 2).await?;
    let mut writer = pool.checkout().await?;
    let mut reader = pool.checkout().await?;
    assert_ne!(writer.id(), reader.id());

    let scope = writer.begin_transaction(&TransactionOptions::new()).await?;
    writer
        .execute(
            "INSERT INTO topics (id, title) VALUES (?, ?)",
            &[RowValues::Int(1), RowValues::Text("pending".into())],
        )
        .await?;
    assert_eq!(count_topics(&mut reader).await?, 0);

    writer.close(scope, Outcome::Commit).await?;
    assert_eq!(count_topics(&mut reader).await?, 1);
    Ok(())
}

#[tokio::test]
async fn disconnect_all_closes_idle_sessions() -> Result<(), SqlCoordinatorError> {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, 2).await?;
    assert!(pool.is_connected());

    pool.disconnect_all().await;
    assert!(!pool.is_connected());

    let mut conn = pool.checkout().await?;
    assert_eq!(count_topics(&mut conn).await?, 0);
    Ok(())
}
