//! Database query functions for the `spools` table.
//!
//! Weight changes go through [`set_spool_weight`], which only the inventory
//! ledger in `printrun-core` calls, always after [`lock_spools`].

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use crate::models::Spool;

/// Fields for registering a spool.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSpool {
    pub label: String,
    pub material_type: String,
    pub color: Option<String>,
    pub current_weight_grams: f64,
    pub cost_per_gram: f64,
}

/// Insert a spool and return it with server defaults.
pub async fn insert_spool<'e>(exec: impl PgExecutor<'e>, spool: &NewSpool) -> Result<Spool> {
    let row = sqlx::query_as::<_, Spool>(
        "INSERT INTO spools (label, material_type, color, current_weight_grams, cost_per_gram) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&spool.label)
    .bind(&spool.material_type)
    .bind(&spool.color)
    .bind(spool.current_weight_grams)
    .bind(spool.cost_per_gram)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert spool {:?}", spool.label))?;

    Ok(row)
}

/// Fetch a spool by ID.
pub async fn get_spool<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<Option<Spool>> {
    let row = sqlx::query_as::<_, Spool>("SELECT * FROM spools WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch spool")?;

    Ok(row)
}

/// List all spools, ordered by label.
pub async fn list_spools<'e>(exec: impl PgExecutor<'e>) -> Result<Vec<Spool>> {
    let rows = sqlx::query_as::<_, Spool>("SELECT * FROM spools ORDER BY label ASC, id ASC")
        .fetch_all(exec)
        .await
        .context("failed to list spools")?;

    Ok(rows)
}

/// Lock the given spools for the rest of the transaction.
///
/// Rows are locked in ascending id order so two transactions deducting from
/// overlapping spool sets cannot deadlock. Missing ids are simply absent from
/// the result.
pub async fn lock_spools(conn: &mut PgConnection, ids: &[Uuid]) -> Result<Vec<Spool>> {
    let rows = sqlx::query_as::<_, Spool>(
        "SELECT * FROM spools WHERE id = ANY($1) ORDER BY id ASC FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(conn)
    .await
    .context("failed to lock spools")?;

    Ok(rows)
}

/// Overwrite a spool's remaining weight. Returns rows affected.
pub async fn set_spool_weight<'e>(
    exec: impl PgExecutor<'e>,
    id: Uuid,
    weight_grams: f64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE spools SET current_weight_grams = $1, updated_at = now() WHERE id = $2",
    )
    .bind(weight_grams)
    .bind(id)
    .execute(exec)
    .await
    .context("failed to update spool weight")?;

    Ok(result.rows_affected())
}
