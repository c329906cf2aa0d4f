//! Database query functions for the `production_run_plates` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{PlateStatus, ProductionRunPlate};

/// Fields for a new plate. `plate_number` is assigned when omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPlate {
    pub model_id: Uuid,
    pub printer_id: Option<Uuid>,
    pub plate_number: Option<i32>,
    pub plate_name: Option<String>,
    #[serde(default = "default_prints_per_plate")]
    pub prints_per_plate: i32,
    pub print_time_minutes: Option<i32>,
    pub estimated_material_weight_grams: Option<f64>,
    pub notes: Option<String>,
}

fn default_prints_per_plate() -> i32 {
    1
}

/// Editable plate details. `prints_per_plate` is deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatePatch {
    pub plate_name: Option<String>,
    pub printer_id: Option<Uuid>,
    pub print_time_minutes: Option<i32>,
    pub estimated_material_weight_grams: Option<f64>,
    pub notes: Option<String>,
}

/// Column values written by a plate status change.
#[derive(Debug, Clone, Default)]
pub struct PlateTransition {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub successful_prints: Option<i32>,
    pub failed_prints: Option<i32>,
    pub actual_print_time_minutes: Option<i32>,
    pub actual_material_weight_grams: Option<f64>,
    pub notes: Option<String>,
}

/// Insert a plate with a resolved number and name.
pub async fn insert_plate<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    plate: &NewPlate,
    plate_number: i32,
    plate_name: &str,
) -> Result<ProductionRunPlate> {
    let row = sqlx::query_as::<_, ProductionRunPlate>(
        "INSERT INTO production_run_plates \
             (run_id, model_id, printer_id, plate_number, plate_name, prints_per_plate, \
              print_time_minutes, estimated_material_weight_grams, notes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(run_id)
    .bind(plate.model_id)
    .bind(plate.printer_id)
    .bind(plate_number)
    .bind(plate_name)
    .bind(plate.prints_per_plate)
    .bind(plate.print_time_minutes)
    .bind(plate.estimated_material_weight_grams)
    .bind(&plate.notes)
    .fetch_one(exec)
    .await
    .with_context(|| format!("failed to insert plate {plate_number}"))?;

    Ok(row)
}

/// List a run's plates ordered by plate number.
pub async fn list_plates_for_run<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
) -> Result<Vec<ProductionRunPlate>> {
    let rows = sqlx::query_as::<_, ProductionRunPlate>(
        "SELECT * FROM production_run_plates WHERE run_id = $1 ORDER BY plate_number ASC",
    )
    .bind(run_id)
    .fetch_all(exec)
    .await
    .context("failed to list plates")?;

    Ok(rows)
}

/// Fetch a plate, scoped to its run.
pub async fn get_plate<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    plate_id: Uuid,
) -> Result<Option<ProductionRunPlate>> {
    let row = sqlx::query_as::<_, ProductionRunPlate>(
        "SELECT * FROM production_run_plates WHERE id = $1 AND run_id = $2",
    )
    .bind(plate_id)
    .bind(run_id)
    .fetch_optional(exec)
    .await
    .context("failed to fetch plate")?;

    Ok(row)
}

/// Whether a plate number is already taken within a run.
pub async fn plate_number_taken<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    plate_number: i32,
) -> Result<bool> {
    let taken: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM production_run_plates WHERE run_id = $1 AND plate_number = $2)",
    )
    .bind(run_id)
    .bind(plate_number)
    .fetch_one(exec)
    .await
    .context("failed to check plate number")?;

    Ok(taken)
}

/// Next free plate number: highest existing number plus one.
pub async fn next_plate_number<'e>(exec: impl PgExecutor<'e>, run_id: Uuid) -> Result<i32> {
    let next: i32 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(plate_number), 0) + 1 FROM production_run_plates WHERE run_id = $1",
    )
    .bind(run_id)
    .fetch_one(exec)
    .await
    .context("failed to compute next plate number")?;

    Ok(next)
}

/// Apply a details patch to a pending or printing plate.
pub async fn update_plate_details<'e>(
    exec: impl PgExecutor<'e>,
    plate_id: Uuid,
    patch: &PlatePatch,
) -> Result<Option<ProductionRunPlate>> {
    let row = sqlx::query_as::<_, ProductionRunPlate>(
        "UPDATE production_run_plates \
         SET plate_name = COALESCE($1, plate_name), \
             printer_id = COALESCE($2, printer_id), \
             print_time_minutes = COALESCE($3, print_time_minutes), \
             estimated_material_weight_grams = COALESCE($4, estimated_material_weight_grams), \
             notes = COALESCE($5, notes), \
             updated_at = now() \
         WHERE id = $6 AND status IN ('pending', 'printing') \
         RETURNING *",
    )
    .bind(&patch.plate_name)
    .bind(patch.printer_id)
    .bind(patch.print_time_minutes)
    .bind(patch.estimated_material_weight_grams)
    .bind(&patch.notes)
    .bind(plate_id)
    .fetch_optional(exec)
    .await
    .context("failed to update plate")?;

    Ok(row)
}

/// Transition a plate with optimistic locking on its current status.
///
/// Returns the updated plate, or `None` when the status no longer matched.
pub async fn transition_plate_status<'e>(
    exec: impl PgExecutor<'e>,
    plate_id: Uuid,
    from: PlateStatus,
    to: PlateStatus,
    fields: &PlateTransition,
) -> Result<Option<ProductionRunPlate>> {
    let row = sqlx::query_as::<_, ProductionRunPlate>(
        "UPDATE production_run_plates \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             successful_prints = COALESCE($4, successful_prints), \
             failed_prints = COALESCE($5, failed_prints), \
             actual_print_time_minutes = COALESCE($6, actual_print_time_minutes), \
             actual_material_weight_grams = COALESCE($7, actual_material_weight_grams), \
             notes = COALESCE($8, notes), \
             updated_at = now() \
         WHERE id = $9 AND status = $10 \
         RETURNING *",
    )
    .bind(to)
    .bind(fields.started_at)
    .bind(fields.completed_at)
    .bind(fields.successful_prints)
    .bind(fields.failed_prints)
    .bind(fields.actual_print_time_minutes)
    .bind(fields.actual_material_weight_grams)
    .bind(&fields.notes)
    .bind(plate_id)
    .bind(from)
    .fetch_optional(exec)
    .await
    .context("failed to transition plate status")?;

    Ok(row)
}

/// Cancel every plate of a run that is still pending or printing.
///
/// Used when the run itself reaches a terminal state. Returns rows affected.
pub async fn cancel_open_plates<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    completed_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE production_run_plates \
         SET status = 'cancelled', completed_at = $1, updated_at = now() \
         WHERE run_id = $2 AND status IN ('pending', 'printing')",
    )
    .bind(completed_at)
    .bind(run_id)
    .execute(exec)
    .await
    .context("failed to cancel open plates")?;

    Ok(result.rows_affected())
}

/// Delete a plate only while it is still pending. Returns rows affected.
pub async fn delete_pending_plate<'e>(
    exec: impl PgExecutor<'e>,
    run_id: Uuid,
    plate_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM production_run_plates \
         WHERE id = $1 AND run_id = $2 AND status = 'pending'",
    )
    .bind(plate_id)
    .bind(run_id)
    .execute(exec)
    .await
    .context("failed to delete plate")?;

    Ok(result.rows_affected())
}
