//! Database query functions for the `production_run_items` table.

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::ProductionRunItem;

/// A planned item supplied when creating a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewItem {
    pub model_id: Uuid,
    pub model_name: Option<String>,
    pub quantity: i32,
    pub bed_position: Option<String>,
    pub model_weight_grams: Option<f64>,
    pub estimated_cost_per_unit: Option<f64>,
}

/// Insert an item for a run.
pub async fn insert_item<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    item: &NewItem,
) -> Result<ProductionRunItem> {
    let row = sqlx::query_as::<_, ProductionRunItem>(
        "INSERT INTO production_run_items \
             (run_id, model_id, model_name, quantity, bed_position, model_weight_grams, \
              estimated_cost_per_unit) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(run_id)
    .bind(item.model_id)
    .bind(&item.model_name)
    .bind(item.quantity)
    .bind(&item.bed_position)
    .bind(item.model_weight_grams)
    .bind(item.estimated_cost_per_unit)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert item for model {}", item.model_id))?;

    Ok(row)
}

/// List a run's items in insertion order.
pub async fn list_items_for_run<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
) -> Result<Vec<ProductionRunItem>> {
    let rows = sqlx::query_as::<_, ProductionRunItem>(
        "SELECT * FROM production_run_items WHERE run_id = $1 ORDER BY insert_seq ASC",
    )
    .bind(run_id)
    .fetch_all(exec)
    .await
    .context("failed to list run items")?;

    Ok(rows)
}

/// Fetch an item, scoped to its run.
pub async fn get_item<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    item_id: Uuid,
) -> Result<Option<ProductionRunItem>> {
    let row = sqlx::query_as::<_, ProductionRunItem>(
        "SELECT * FROM production_run_items WHERE id = $1 AND run_id = $2",
    )
    .bind(item_id)
    .bind(run_id)
    .fetch_optional(exec)
    .await
    .context("failed to fetch run item")?;

    Ok(row)
}

/// Fetch the item that tracks a model within a run.
pub async fn find_item_for_model<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    model_id: Uuid,
) -> Result<Option<ProductionRunItem>> {
    let row = sqlx::query_as::<_, ProductionRunItem>(
        "SELECT * FROM production_run_items WHERE run_id = $1 AND model_id = $2",
    )
    .bind(run_id)
    .bind(model_id)
    .fetch_optional(exec)
    .await
    .context("failed to look up run item by model")?;

    Ok(row)
}

/// Overwrite an item's outcome counts.
pub async fn set_item_outcome<'e>(
    exec: impl PgExecutor<'e>,
    item_id: Uuid,
    successful_quantity: i32,
    failed_quantity: i32,
) -> Result<Option<ProductionRunItem>> {
    let row = sqlx::query_as::<_, ProductionRunItem>(
        "UPDATE production_run_items \
         SET successful_quantity = $1, failed_quantity = $2 \
         WHERE id = $3 \
         RETURNING *",
    )
    .bind(successful_quantity)
    .bind(failed_quantity)
    .bind(item_id)
    .fetch_optional(exec)
    .await
    .context("failed to update item outcome")?;

    Ok(row)
}

/// Add plate results to an item's counts.
///
/// Guarded so the sum never exceeds `quantity`: returns rows affected, and 0
/// means the increment would have overflowed the plan.
pub async fn increment_item_outcome<'e>(
    exec: impl PgExecutor<'e>,
    item_id: Uuid,
    successful_delta: i32,
    failed_delta: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE production_run_items \
         SET successful_quantity = successful_quantity + $1, \
             failed_quantity = failed_quantity + $2 \
         WHERE id = $3 \
           AND successful_quantity::bigint + failed_quantity + $1 + $2 <= quantity",
    )
    .bind(successful_delta)
    .bind(failed_delta)
    .bind(item_id)
    .execute(exec)
    .await
    .context("failed to roll plate results into item")?;

    Ok(result.rows_affected())
}

/// Record the per-unit actual cost computed at completion.
pub async fn set_actual_cost_per_unit<'e>(
    exec: impl PgExecutor<'e>,
    item_id: Uuid,
    actual_cost_per_unit: Option<f64>,
) -> Result<()> {
    sqlx::query("UPDATE production_run_items SET actual_cost_per_unit = $1 WHERE id = $2")
        .bind(actual_cost_per_unit)
        .bind(item_id)
        .execute(exec)
        .await
        .context("failed to set item actual cost")?;

    Ok(())
}
