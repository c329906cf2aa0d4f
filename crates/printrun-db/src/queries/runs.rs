//! Database query functions for the `production_runs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use crate::models::{CancelMode, ProductionRun, RunStatus};

/// Run-level fields supplied at creation. Status always starts `in_progress`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewRun {
    /// Defaults to the insert time.
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_print_time_hours: f64,
    pub printer_name: Option<String>,
    pub slicer_software: Option<String>,
    pub bed_temperature: Option<i32>,
    pub nozzle_temperature: Option<i32>,
    pub notes: Option<String>,
}

/// Editable run metadata. `None` leaves a column unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPatch {
    pub duration_hours: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_print_time_hours: Option<f64>,
    pub printer_name: Option<String>,
    pub slicer_software: Option<String>,
    pub bed_temperature: Option<i32>,
    pub nozzle_temperature: Option<i32>,
    pub notes: Option<String>,
}

impl RunPatch {
    /// True when the patch edits nothing but `notes`.
    pub fn is_notes_only(&self) -> bool {
        self.duration_hours.is_none()
            && self.started_at.is_none()
            && self.estimated_print_time_hours.is_none()
            && self.printer_name.is_none()
            && self.slicer_software.is_none()
            && self.bed_temperature.is_none()
            && self.nozzle_temperature.is_none()
    }
}

/// Column values written by a terminal transition.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub to: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_hours: Option<f64>,
    pub waste_reason: Option<String>,
    pub waste_filament_grams: Option<f64>,
    pub cancel_mode: Option<CancelMode>,
    pub notes: Option<String>,
}

/// Insert a run in `in_progress`, assigning the next `RUN-YYYYMMDD-NNNN`
/// number from `production_run_number_seq`. The counter is zero-padded to
/// four digits and grows wider past 9999.
pub async fn insert_run<'e>(exec: impl PgExecutor<'e>, run: &NewRun) -> Result<ProductionRun> {
    let row = sqlx::query_as::<_, ProductionRun>(
        "INSERT INTO production_runs \
             (run_number, started_at, estimated_print_time_hours, printer_name, slicer_software, \
              bed_temperature, nozzle_temperature, notes) \
         VALUES ( \
             (SELECT 'RUN-' || to_char(now(), 'YYYYMMDD') || '-' \
                      || lpad(seq.n::text, greatest(4, length(seq.n::text)), '0') \
                FROM nextval('production_run_number_seq') AS seq(n)), \
             COALESCE($1, now()), $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(run.started_at)
    .bind(run.estimated_print_time_hours)
    .bind(&run.printer_name)
    .bind(&run.slicer_software)
    .bind(run.bed_temperature)
    .bind(run.nozzle_temperature)
    .bind(&run.notes)
    .fetch_one(exec)
    .await
    .context("failed to insert production run")?;

    Ok(row)
}

/// Fetch a run by ID.
pub async fn get_run<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<Option<ProductionRun>> {
    let row = sqlx::query_as::<_, ProductionRun>("SELECT * FROM production_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(exec)
        .await
        .context("failed to fetch production run")?;

    Ok(row)
}

/// Fetch a run and hold its row lock until the transaction ends.
///
/// Every mutation of a run or its children starts here, which serializes
/// writers per run.
pub async fn lock_run(conn: &mut PgConnection, id: Uuid) -> Result<Option<ProductionRun>> {
    let row = sqlx::query_as::<_, ProductionRun>(
        "SELECT * FROM production_runs WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .context("failed to lock production run")?;

    Ok(row)
}

/// List runs, newest first, optionally filtered by status.
pub async fn list_runs<'e>(
    exec: impl PgExecutor<'e>,
    status: Option<RunStatus>,
) -> Result<Vec<ProductionRun>> {
    let rows = sqlx::query_as::<_, ProductionRun>(
        "SELECT * FROM production_runs \
         WHERE ($1::text IS NULL OR status = $1) \
         ORDER BY started_at DESC, run_number DESC",
    )
    .bind(status)
    .fetch_all(exec)
    .await
    .context("failed to list production runs")?;

    Ok(rows)
}

/// Apply a metadata patch. Returns the updated run, or `None` if it is gone.
pub async fn update_run_details<'e>(
    exec: impl PgExecutor<'e>,
    id: Uuid,
    patch: &RunPatch,
) -> Result<Option<ProductionRun>> {
    let row = sqlx::query_as::<_, ProductionRun>(
        "UPDATE production_runs \
         SET duration_hours = COALESCE($1, duration_hours), \
             started_at = COALESCE($2, started_at), \
             estimated_print_time_hours = COALESCE($3, estimated_print_time_hours), \
             printer_name = COALESCE($4, printer_name), \
             slicer_software = COALESCE($5, slicer_software), \
             bed_temperature = COALESCE($6, bed_temperature), \
             nozzle_temperature = COALESCE($7, nozzle_temperature), \
             notes = COALESCE($8, notes), \
             updated_at = now() \
         WHERE id = $9 \
         RETURNING *",
    )
    .bind(patch.duration_hours)
    .bind(patch.started_at)
    .bind(patch.estimated_print_time_hours)
    .bind(&patch.printer_name)
    .bind(&patch.slicer_software)
    .bind(patch.bed_temperature)
    .bind(patch.nozzle_temperature)
    .bind(&patch.notes)
    .bind(id)
    .fetch_optional(exec)
    .await
    .context("failed to update production run")?;

    Ok(row)
}

/// Move a run from `from` to a terminal status with optimistic locking.
///
/// The WHERE clause includes `status = $from`, so the row only changes if
/// nobody else transitioned it first. Returns rows affected (0 means the
/// status no longer matched or the run is gone).
pub async fn transition_run_status<'e>(
    exec: impl PgExecutor<'e>,
    id: Uuid,
    from: RunStatus,
    update: &TerminalUpdate,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE production_runs \
         SET status = $1, \
             completed_at = $2, \
             duration_hours = COALESCE($3, duration_hours), \
             waste_reason = COALESCE($4, waste_reason), \
             waste_filament_grams = COALESCE($5, waste_filament_grams), \
             cancel_mode = COALESCE($6, cancel_mode), \
             notes = COALESCE($7, notes), \
             updated_at = now() \
         WHERE id = $8 AND status = $9",
    )
    .bind(update.to)
    .bind(update.completed_at)
    .bind(update.duration_hours)
    .bind(&update.waste_reason)
    .bind(update.waste_filament_grams)
    .bind(update.cancel_mode)
    .bind(&update.notes)
    .bind(id)
    .bind(from)
    .execute(exec)
    .await
    .context("failed to transition production run status")?;

    Ok(result.rows_affected())
}

/// Touch `updated_at` so readers can see a child row changed.
pub async fn touch_run<'e>(exec: impl PgExecutor<'e>, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE production_runs SET updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(exec)
        .await
        .context("failed to touch production run")?;

    Ok(())
}
