//! Database query functions for the `inventory_deductions` journal.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{DeductionReason, InventoryDeduction, RunStatus};

/// A deduction about to be journaled.
#[derive(Debug, Clone)]
pub struct NewDeduction {
    pub run_id: Uuid,
    pub spool_id: Uuid,
    pub target_status: RunStatus,
    pub reason: DeductionReason,
    pub grams: f64,
    pub weight_before_grams: f64,
    pub weight_after_grams: f64,
}

/// Journal a deduction.
///
/// Uses `ON CONFLICT DO NOTHING` on `(run_id, target_status, spool_id)`:
/// returns `None` when that deduction was already recorded.
pub async fn insert_deduction<'e>(
    exec: impl PgExecutor<'e>,
    deduction: &NewDeduction,
) -> Result<Option<InventoryDeduction>> {
    let row = sqlx::query_as::<_, InventoryDeduction>(
        "INSERT INTO inventory_deductions \
             (run_id, spool_id, target_status, reason, grams, weight_before_grams, weight_after_grams) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (run_id, target_status, spool_id) DO NOTHING \
         RETURNING *",
    )
    .bind(deduction.run_id)
    .bind(deduction.spool_id)
    .bind(deduction.target_status)
    .bind(deduction.reason)
    .bind(deduction.grams)
    .bind(deduction.weight_before_grams)
    .bind(deduction.weight_after_grams)
    .fetch_optional(exec)
    .await
    .context("failed to insert inventory deduction")?;

    Ok(row)
}

/// Whether a deduction for this run, terminal status and spool exists.
pub async fn deduction_exists<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    target_status: RunStatus,
    spool_id: Uuid,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS( \
             SELECT 1 FROM inventory_deductions \
             WHERE run_id = $1 AND target_status = $2 AND spool_id = $3 \
         )",
    )
    .bind(run_id)
    .bind(target_status)
    .bind(spool_id)
    .fetch_one(exec)
    .await
    .context("failed to check inventory deduction")?;

    Ok(exists)
}

/// All deductions recorded against a run, oldest first.
pub async fn list_deductions_for_run<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
) -> Result<Vec<InventoryDeduction>> {
    let rows = sqlx::query_as::<_, InventoryDeduction>(
        "SELECT * FROM inventory_deductions WHERE run_id = $1 ORDER BY id ASC",
    )
    .bind(run_id)
    .fetch_all(exec)
    .await
    .context("failed to list inventory deductions")?;

    Ok(rows)
}

/// Total grams deducted from a spool across all runs.
pub async fn total_deducted_for_spool<'e>(exec: impl PgExecutor<'e>, spool_id: Uuid) -> Result<f64> {
    let total: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(grams), 0)::DOUBLE PRECISION \
         FROM inventory_deductions WHERE spool_id = $1",
    )
    .bind(spool_id)
    .fetch_one(exec)
    .await
    .context("failed to sum spool deductions")?;

    Ok(total)
}
