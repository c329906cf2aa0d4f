//! Integration tests for the embedded migrations and connection pooling.
//!
//! Each test gets a fresh database from `printrun-test-utils`.

use sqlx::Row;

use printrun_db::pool;
use printrun_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename NOT LIKE '_sqlx%' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let mut expected: Vec<&str> = pool::TABLES.to_vec();
    expected.sort_unstable();
    let actual: Vec<&str> = rows.iter().map(|(name,)| name.as_str()).collect();
    assert_eq!(actual, expected);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    pool::run_migrations(&pool)
        .await
        .expect("second migration run should be a no-op");

    for table in pool::TABLES {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        let count: i64 = row.get("cnt");
        assert_eq!(count, 0, "table {table} should be empty after migrations");
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn table_counts_cover_every_table() {
    let (pool, db_name) = create_test_db().await;

    let counts = pool::table_counts(&pool).await.expect("table_counts should succeed");
    let names: Vec<&str> = counts.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, pool::TABLES);
    assert!(counts.iter().all(|(_, count)| *count == 0));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn item_outcome_check_constraint_holds() {
    let (pool, db_name) = create_test_db().await;

    let run_id: uuid::Uuid = sqlx::query_scalar(
        "INSERT INTO production_runs (run_number) VALUES ('RUN-TEST-0001') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    let result = sqlx::query(
        "INSERT INTO production_run_items (run_id, model_id, quantity, successful_quantity, failed_quantity) \
         VALUES ($1, gen_random_uuid(), 10, 8, 3)",
    )
    .bind(run_id)
    .execute(&pool)
    .await;
    assert!(result.is_err(), "8 + 3 > 10 must violate the check constraint");

    pool.close().await;
    drop_test_db(&db_name).await;
}
