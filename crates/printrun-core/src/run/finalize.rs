//! Terminal transitions: complete, cancel and fail.
//!
//! Each transition is one transaction: lock the run, validate, freeze material
//! figures, deduct inventory, close open plates, then flip the status with a
//! guarded `UPDATE`. Any error rolls the whole thing back.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use printrun_db::models::{
    CancelMode, DeductionReason, MaterialWithSpool, ProductionRun, RunStatus,
};
use printrun_db::queries::materials::{self, MaterialFinalization};
use printrun_db::queries::runs::{self as db, TerminalUpdate};
use printrun_db::queries::{items, plates};

use super::snapshot::{RunSnapshot, load_snapshot};
use super::{RunStateMachine, lock_run, validate_outcome};
use crate::catalog::FailureReasonCatalog;
use crate::error::{Entity, FieldError, RunError, RunResult, check_fields};
use crate::ledger::{self, SpoolUsage, positive_usage};
use crate::metrics::RunMetrics;
use crate::reconcile::{MaterialReconciliation, measurement_problem, reconcile};

/// Complete a run: reconcile materials, price items and deduct the measured
/// consumption from each spool.
pub async fn complete_run(pool: &PgPool, run_id: Uuid) -> RunResult<RunSnapshot> {
    let mut tx = pool.begin().await?;
    let run = lock_run(&mut tx, run_id).await?;
    RunStateMachine::ensure_transition(&run, RunStatus::Completed, "complete")?;

    let run_items = items::list_items_for_run(&mut *tx, run_id).await?;
    let run_materials = materials::list_materials_for_run(&mut *tx, run_id).await?;

    let mut errors = Vec::new();
    for line in &run_materials {
        if let Some(problem) = measurement_problem(&line.material) {
            errors.push(FieldError::new(
                format!("materials.{}.actual_total_weight", line.material.id),
                format!("{} ({})", problem, line.spool_label),
            ));
        }
    }
    for item in &run_items {
        errors.extend(validate_outcome(
            &format!("items.{}.", item.id),
            item.quantity,
            item.successful_quantity,
            item.failed_quantity,
        ));
    }
    if !errors.is_empty() {
        warn!(run_id = %run_id, problems = errors.len(), "run not ready to complete");
    }
    check_fields(errors)?;

    let completed_at = Utc::now();
    let duration_hours = run
        .duration_hours
        .unwrap_or_else(|| elapsed_hours(run.started_at, completed_at));

    let recs = finalize_materials(&mut tx, &run_materials).await?;
    let metrics = RunMetrics::compute(
        &run_items,
        &recs,
        Some(duration_hours),
        run.estimated_print_time_hours,
    );
    for item in &run_items {
        items::set_actual_cost_per_unit(&mut *tx, item.id, metrics.actual_cost_per_unit(item))
            .await?;
    }

    let consumed: Vec<SpoolUsage> = run_materials
        .iter()
        .filter_map(|line| {
            line.material.actual_total_weight.map(|grams| SpoolUsage {
                spool_id: line.material.spool_id,
                grams,
            })
        })
        .collect();
    ledger::apply_deductions(
        &mut tx,
        run_id,
        RunStatus::Completed,
        DeductionReason::Consumption,
        &positive_usage(&consumed),
    )
    .await?;

    let update = TerminalUpdate {
        to: RunStatus::Completed,
        completed_at,
        duration_hours: Some(duration_hours),
        waste_reason: None,
        waste_filament_grams: None,
        cancel_mode: None,
        notes: None,
    };
    let snapshot = close_run(&mut tx, &run, &update).await?;
    tx.commit().await?;

    info!(
        run_id = %run_id,
        run_number = %run.run_number,
        material_cost = metrics.total_material_cost,
        success_rate = ?metrics.overall_success_rate,
        "run completed"
    );
    Ok(snapshot)
}

/// Body of a cancel request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelRequest {
    pub cancel_mode: CancelMode,
    #[serde(default)]
    pub partial_usage: Vec<SpoolUsage>,
    pub notes: Option<String>,
}

/// Cancel a run, optionally deducting the filament already used.
pub async fn cancel_run(pool: &PgPool, run_id: Uuid, request: &CancelRequest) -> RunResult<RunSnapshot> {
    let usage = match request.cancel_mode {
        CancelMode::FullReversal => Default::default(),
        CancelMode::RecordPartial => {
            let usage = positive_usage(&request.partial_usage);
            if usage.is_empty() {
                return Err(RunError::invalid(
                    "partial_usage",
                    "record_partial needs at least one spool with grams > 0",
                ));
            }
            usage
        }
    };

    let mut tx = pool.begin().await?;
    let run = lock_run(&mut tx, run_id).await?;
    RunStateMachine::ensure_transition(&run, RunStatus::Cancelled, "cancel")?;

    let run_materials = materials::list_materials_for_run(&mut *tx, run_id).await?;
    finalize_materials(&mut tx, &run_materials).await?;

    ledger::apply_deductions(
        &mut tx,
        run_id,
        RunStatus::Cancelled,
        DeductionReason::PartialUsage,
        &usage,
    )
    .await?;

    let update = TerminalUpdate {
        to: RunStatus::Cancelled,
        completed_at: Utc::now(),
        duration_hours: None,
        waste_reason: None,
        waste_filament_grams: None,
        cancel_mode: Some(request.cancel_mode),
        notes: merge_notes(run.notes.as_deref(), request.notes.as_deref()),
    };
    let snapshot = close_run(&mut tx, &run, &update).await?;
    tx.commit().await?;

    info!(
        run_id = %run_id,
        mode = %request.cancel_mode,
        spools = usage.len(),
        "run cancelled"
    );
    Ok(snapshot)
}

/// Body of a fail request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailRequest {
    pub failure_reason: String,
    #[serde(default)]
    pub waste_materials: Vec<SpoolUsage>,
    pub notes: Option<String>,
}

/// Fail a run, deducting the filament it wasted.
pub async fn fail_run(
    pool: &PgPool,
    catalog: &FailureReasonCatalog,
    run_id: Uuid,
    request: &FailRequest,
) -> RunResult<RunSnapshot> {
    let mut errors = Vec::new();
    if !catalog.contains(&request.failure_reason) {
        errors.push(FieldError::new(
            "failure_reason",
            format!("unknown failure reason {:?}", request.failure_reason),
        ));
    }
    let usage = positive_usage(&request.waste_materials);
    if usage.is_empty() {
        errors.push(FieldError::new(
            "waste_materials",
            "at least one spool with grams > 0 is required",
        ));
    }
    check_fields(errors)?;
    let waste_total: f64 = usage.values().sum();

    let mut tx = pool.begin().await?;
    let run = lock_run(&mut tx, run_id).await?;
    RunStateMachine::ensure_transition(&run, RunStatus::Failed, "fail")?;

    let run_materials = materials::list_materials_for_run(&mut *tx, run_id).await?;
    finalize_materials(&mut tx, &run_materials).await?;

    ledger::apply_deductions(
        &mut tx,
        run_id,
        RunStatus::Failed,
        DeductionReason::Waste,
        &usage,
    )
    .await?;

    let update = TerminalUpdate {
        to: RunStatus::Failed,
        completed_at: Utc::now(),
        duration_hours: None,
        waste_reason: Some(request.failure_reason.clone()),
        waste_filament_grams: Some(waste_total),
        cancel_mode: None,
        notes: merge_notes(run.notes.as_deref(), request.notes.as_deref()),
    };
    let snapshot = close_run(&mut tx, &run, &update).await?;
    tx.commit().await?;

    info!(
        run_id = %run_id,
        reason = %request.failure_reason,
        waste_grams = waste_total,
        "run failed"
    );
    Ok(snapshot)
}

// ---------------------------------------------------------------------------
// Shared steps
// ---------------------------------------------------------------------------

/// Freeze cost and variance for every material at the spool's current price.
async fn finalize_materials(
    conn: &mut PgConnection,
    lines: &[MaterialWithSpool],
) -> RunResult<Vec<MaterialReconciliation>> {
    let mut recs = Vec::with_capacity(lines.len());
    for line in lines {
        let rec = reconcile(&line.material, line.spool_cost_per_gram);
        let figures = MaterialFinalization {
            estimated_cost: rec.estimated_cost,
            total_cost: rec.total_cost,
            variance_percentage: rec.variance_percentage,
            cost_per_gram: rec.cost_per_gram,
        };
        materials::finalize_material(&mut *conn, line.material.id, &figures).await?;
        recs.push(rec);
    }
    Ok(recs)
}

/// Cancel open plates, write the terminal status and reload the snapshot.
async fn close_run(
    conn: &mut PgConnection,
    run: &ProductionRun,
    update: &TerminalUpdate,
) -> RunResult<RunSnapshot> {
    let closed = plates::cancel_open_plates(&mut *conn, run.id, update.completed_at).await?;
    if closed > 0 {
        info!(run_id = %run.id, plates = closed, "open plates cancelled with run");
    }

    let rows = db::transition_run_status(&mut *conn, run.id, run.status, update).await?;
    if rows == 0 {
        let actual = db::get_run(&mut *conn, run.id)
            .await?
            .ok_or(RunError::not_found(Entity::Run, run.id))?;
        return Err(RunError::ConcurrentModification {
            entity: Entity::Run,
            id: run.id,
            expected: run.status.to_string(),
            actual: actual.status.to_string(),
        });
    }

    load_snapshot(conn, run.id).await
}

fn elapsed_hours(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> f64 {
    let seconds = (completed_at - started_at).num_seconds().max(0);
    seconds as f64 / 3600.0
}

/// Append operator notes to the run's existing notes.
///
/// Returns `None` when there is nothing to add, which leaves the column as is.
fn merge_notes(existing: Option<&str>, addition: Option<&str>) -> Option<String> {
    let addition = addition.map(str::trim).filter(|s| !s.is_empty())?;
    match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => Some(format!("{existing}\n\n{addition}")),
        None => Some(addition.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn notes_are_appended() {
        assert_eq!(
            merge_notes(Some("first layer fine"), Some("clogged at 40%")),
            Some("first layer fine\n\nclogged at 40%".to_string())
        );
        assert_eq!(merge_notes(None, Some("power cut")), Some("power cut".into()));
        assert_eq!(merge_notes(Some("kept"), Some("   ")), None);
        assert_eq!(merge_notes(Some("kept"), None), None);
    }

    #[test]
    fn elapsed_hours_from_timestamps() {
        let start = Utc::now();
        let end = start + Duration::minutes(90);
        assert!((elapsed_hours(start, end) - 1.5).abs() < 1e-9);
        assert_eq!(elapsed_hours(end, start), 0.0);
    }

    #[test]
    fn cancel_request_parses() {
        let json = r#"{"cancel_mode": "record_partial",
                       "partial_usage": [{"spool_id": "00000000-0000-0000-0000-000000000001", "grams": 50}]}"#;
        let request: CancelRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.cancel_mode, CancelMode::RecordPartial);
        assert_eq!(request.partial_usage.len(), 1);
    }

    #[test]
    fn fail_request_requires_reason() {
        assert!(serde_json::from_str::<FailRequest>(r#"{"waste_materials": []}"#).is_err());
    }
}
