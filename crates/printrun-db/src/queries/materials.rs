//! Database query functions for the `production_run_materials` table.
//!
//! Derived columns (`estimated_total_weight`, costs, variance) are computed
//! by the reconciliation engine in `printrun-core` and passed in here.

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{ActualEntryMode, MaterialWithSpool, ProductionRunMaterial};

/// A material line supplied when creating a run or attaching a spool.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewMaterial {
    pub spool_id: Uuid,
    #[serde(default)]
    pub estimated_model_weight_grams: f64,
    pub estimated_flushed_grams: Option<f64>,
    pub estimated_tower_grams: Option<f64>,
}

/// Finalized figures written when a run reaches a terminal state.
#[derive(Debug, Clone, Copy)]
pub struct MaterialFinalization {
    pub estimated_cost: f64,
    pub total_cost: Option<f64>,
    pub variance_percentage: Option<f64>,
    pub cost_per_gram: f64,
}

const SELECT_WITH_SPOOL: &str = "SELECT m.*, s.label AS spool_label, s.cost_per_gram AS spool_cost_per_gram \
     FROM production_run_materials m \
     JOIN spools s ON s.id = m.spool_id";

/// Insert a material line with its precomputed estimated total.
pub async fn insert_material<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    material: &NewMaterial,
    estimated_total_weight: f64,
) -> Result<ProductionRunMaterial> {
    let row = sqlx::query_as::<_, ProductionRunMaterial>(
        "INSERT INTO production_run_materials \
             (run_id, spool_id, estimated_model_weight_grams, estimated_flushed_grams, \
              estimated_tower_grams, estimated_total_weight) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(run_id)
    .bind(material.spool_id)
    .bind(material.estimated_model_weight_grams)
    .bind(material.estimated_flushed_grams)
    .bind(material.estimated_tower_grams)
    .bind(estimated_total_weight)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert material for spool {}", material.spool_id))?;

    Ok(row)
}

/// List a run's materials joined with spool label and price.
pub async fn list_materials_for_run<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
) -> Result<Vec<MaterialWithSpool>> {
    let query = format!("{SELECT_WITH_SPOOL} WHERE m.run_id = $1 ORDER BY m.insert_seq ASC");
    let rows = sqlx::query_as::<_, MaterialWithSpool>(&query)
        .bind(run_id)
        .fetch_all(exec)
        .await
        .context("failed to list run materials")?;

    Ok(rows)
}

/// Fetch a material, scoped to its run.
pub async fn get_material<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    material_id: Uuid,
) -> Result<Option<MaterialWithSpool>> {
    let query = format!("{SELECT_WITH_SPOOL} WHERE m.id = $1 AND m.run_id = $2");
    let row = sqlx::query_as::<_, MaterialWithSpool>(&query)
        .bind(material_id)
        .bind(run_id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch run material")?;

    Ok(row)
}

/// Record an actual weight. `before`/`after` are only set in weighing mode.
pub async fn set_actual_weight<'e>(
    exec: impl PgExecutor<'e>,
    material_id: Uuid,
    mode: ActualEntryMode,
    actual_total_weight: f64,
    weight_before: Option<f64>,
    weight_after: Option<f64>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE production_run_materials \
         SET actual_total_weight = $1, \
             actual_entry_mode = $2, \
             spool_weight_before_grams = $3, \
             spool_weight_after_grams = $4, \
             updated_at = now() \
         WHERE id = $5",
    )
    .bind(actual_total_weight)
    .bind(mode)
    .bind(weight_before)
    .bind(weight_after)
    .bind(material_id)
    .execute(exec)
    .await
    .context("failed to record actual material weight")?;

    Ok(result.rows_affected())
}

/// Set every material's actual weight to its estimate (manual mode).
/// Returns rows affected.
pub async fn reset_actuals_to_estimated<'e>(exec: impl PgExecutor<'e>, run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE production_run_materials \
         SET actual_total_weight = estimated_total_weight, \
             actual_entry_mode = 'manual', \
             spool_weight_before_grams = NULL, \
             spool_weight_after_grams = NULL, \
             updated_at = now() \
         WHERE run_id = $1",
    )
    .bind(run_id)
    .execute(exec)
    .await
    .context("failed to reset material actuals")?;

    Ok(result.rows_affected())
}

/// Persist the derived cost and variance figures for a material.
pub async fn finalize_material<'e>(
    exec: impl PgExecutor<'e>,
    material_id: Uuid,
    figures: &MaterialFinalization,
) -> Result<()> {
    sqlx::query(
        "UPDATE production_run_materials \
         SET estimated_cost = $1, \
             total_cost = $2, \
             variance_percentage = $3, \
             cost_per_gram = $4, \
             updated_at = now() \
         WHERE id = $5",
    )
    .bind(figures.estimated_cost)
    .bind(figures.total_cost)
    .bind(figures.variance_percentage)
    .bind(figures.cost_per_gram)
    .bind(material_id)
    .execute(exec)
    .await
    .context("failed to finalize material")?;

    Ok(())
}

/// Remove a material line from a run. Returns rows affected.
pub async fn delete_material<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    material_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM production_run_materials WHERE id = $1 AND run_id = $2")
        .bind(material_id)
        .bind(run_id)
        .execute(exec)
        .await
        .context("failed to delete material")?;

    Ok(result.rows_affected())
}
