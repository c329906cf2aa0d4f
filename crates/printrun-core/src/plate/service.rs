//! Plate operations. All of them require the owning run to be in progress.

use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use printrun_db::models::{PlateStatus, ProductionRunItem, ProductionRunPlate};
use printrun_db::queries::plates::{self as db, NewPlate, PlatePatch, PlateTransition};
use printrun_db::queries::{items, runs};

use super::{PlateStateMachine, Rollup, rollup_for, validate_print_counts};
use crate::error::{Entity, FieldError, RunError, RunResult, check_fields};
use crate::run::{RunStateMachine, lock_mutable_run, lock_run, validate_outcome};

/// Body of a complete-plate request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletePlateRequest {
    pub successful_prints: i32,
    #[serde(default)]
    pub failed_prints: i32,
    pub actual_print_time_minutes: Option<i32>,
    pub actual_material_weight_grams: Option<f64>,
    pub notes: Option<String>,
}

/// Optional notes for fail and cancel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlateNotes {
    pub notes: Option<String>,
}

fn validate_details(
    print_time_minutes: Option<i32>,
    estimated_material_weight_grams: Option<f64>,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if print_time_minutes.is_some_and(|m| m < 0) {
        errors.push(FieldError::new("print_time_minutes", "must be >= 0"));
    }
    if estimated_material_weight_grams.is_some_and(|w| !w.is_finite() || w < 0.0) {
        errors.push(FieldError::new("estimated_material_weight_grams", "must be >= 0"));
    }
    errors
}

pub async fn create_plate(
    pool: &PgPool,
    run_id: Uuid,
    plate: &NewPlate,
) -> RunResult<ProductionRunPlate> {
    let mut errors = validate_details(plate.print_time_minutes, plate.estimated_material_weight_grams);
    if plate.prints_per_plate < 1 {
        errors.push(FieldError::new("prints_per_plate", "must be >= 1"));
    }
    if plate.plate_number.is_some_and(|n| n < 1) {
        errors.push(FieldError::new("plate_number", "must be >= 1"));
    }
    check_fields(errors)?;

    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "add plate to").await?;

    let Some(item) = items::find_item_for_model(&mut *tx, run_id, plate.model_id).await? else {
        return Err(RunError::invalid(
            "model_id",
            format!("model {} is not planned in this run", plate.model_id),
        ));
    };
    if plate.prints_per_plate > item.quantity {
        return Err(RunError::invalid(
            "prints_per_plate",
            format!(
                "plate holds {} prints but the item plans only {}",
                plate.prints_per_plate, item.quantity
            ),
        ));
    }

    let number = match plate.plate_number {
        Some(n) => {
            if db::plate_number_taken(&mut *tx, run_id, n).await? {
                return Err(RunError::invalid(
                    "plate_number",
                    format!("plate {n} already exists in this run"),
                ));
            }
            n
        }
        None => db::next_plate_number(&mut *tx, run_id).await?,
    };
    let name = plate
        .plate_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Plate {number}"));

    let created = db::insert_plate(&mut *tx, run_id, plate, number, &name).await?;
    runs::touch_run(&mut *tx, run_id).await?;
    tx.commit().await?;

    info!(run_id = %run_id, plate_id = %created.id, plate_number = number, "plate created");
    Ok(created)
}

pub async fn update_plate(
    pool: &PgPool,
    run_id: Uuid,
    plate_id: Uuid,
    patch: &PlatePatch,
) -> RunResult<ProductionRunPlate> {
    check_fields(validate_details(patch.print_time_minutes, patch.estimated_material_weight_grams))?;

    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "edit plates of").await?;
    let plate = fetch_plate(&mut tx, run_id, plate_id).await?;
    PlateStateMachine::ensure_editable(&plate, "edit")?;

    let updated = db::update_plate_details(&mut *tx, plate_id, patch)
        .await?
        .ok_or_else(|| concurrent(&plate, "pending or printing"))?;
    runs::touch_run(&mut *tx, run_id).await?;
    tx.commit().await?;

    Ok(updated)
}

pub async fn start_plate(pool: &PgPool, run_id: Uuid, plate_id: Uuid) -> RunResult<ProductionRunPlate> {
    let fields = PlateTransition {
        started_at: Some(Utc::now()),
        ..Default::default()
    };
    apply_transition(pool, run_id, plate_id, PlateStatus::Printing, "start", fields).await
}

pub async fn complete_plate(
    pool: &PgPool,
    run_id: Uuid,
    plate_id: Uuid,
    request: &CompletePlateRequest,
) -> RunResult<ProductionRunPlate> {
    let mut errors = Vec::new();
    if request.actual_print_time_minutes.is_some_and(|m| m < 0) {
        errors.push(FieldError::new("actual_print_time_minutes", "must be >= 0"));
    }
    if request
        .actual_material_weight_grams
        .is_some_and(|w| !w.is_finite() || w < 0.0)
    {
        errors.push(FieldError::new("actual_material_weight_grams", "must be >= 0"));
    }
    check_fields(errors)?;

    let fields = PlateTransition {
        completed_at: Some(Utc::now()),
        successful_prints: Some(request.successful_prints),
        failed_prints: Some(request.failed_prints),
        actual_print_time_minutes: request.actual_print_time_minutes,
        actual_material_weight_grams: request.actual_material_weight_grams,
        notes: request.notes.clone(),
        ..Default::default()
    };
    apply_transition(pool, run_id, plate_id, PlateStatus::Completed, "complete", fields).await
}

pub async fn fail_plate(
    pool: &PgPool,
    run_id: Uuid,
    plate_id: Uuid,
    request: &PlateNotes,
) -> RunResult<ProductionRunPlate> {
    let fields = PlateTransition {
        completed_at: Some(Utc::now()),
        notes: request.notes.clone(),
        ..Default::default()
    };
    apply_transition(pool, run_id, plate_id, PlateStatus::Failed, "fail", fields).await
}

pub async fn cancel_plate(
    pool: &PgPool,
    run_id: Uuid,
    plate_id: Uuid,
    request: &PlateNotes,
) -> RunResult<ProductionRunPlate> {
    let fields = PlateTransition {
        completed_at: Some(Utc::now()),
        notes: request.notes.clone(),
        ..Default::default()
    };
    apply_transition(pool, run_id, plate_id, PlateStatus::Cancelled, "cancel", fields).await
}

pub async fn delete_plate(pool: &PgPool, run_id: Uuid, plate_id: Uuid) -> RunResult<()> {
    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "delete plates of").await?;
    let plate = fetch_plate(&mut tx, run_id, plate_id).await?;
    PlateStateMachine::ensure_deletable(&plate)?;

    if db::delete_pending_plate(&mut *tx, run_id, plate_id).await? == 0 {
        return Err(concurrent(&plate, "pending"));
    }
    runs::touch_run(&mut *tx, run_id).await?;
    tx.commit().await?;

    info!(run_id = %run_id, plate_id = %plate_id, "plate deleted");
    Ok(())
}

pub async fn list_plates(pool: &PgPool, run_id: Uuid) -> RunResult<Vec<ProductionRunPlate>> {
    if runs::get_run(pool, run_id).await?.is_none() {
        return Err(RunError::not_found(Entity::Run, run_id));
    }
    Ok(db::list_plates_for_run(pool, run_id).await?)
}

// ---------------------------------------------------------------------------
// Shared steps
// ---------------------------------------------------------------------------

async fn fetch_plate(
    conn: &mut sqlx::PgConnection,
    run_id: Uuid,
    plate_id: Uuid,
) -> RunResult<ProductionRunPlate> {
    db::get_plate(conn, run_id, plate_id)
        .await?
        .ok_or(RunError::not_found(Entity::Plate, plate_id))
}

fn concurrent(plate: &ProductionRunPlate, expected: &str) -> RunError {
    RunError::ConcurrentModification {
        entity: Entity::Plate,
        id: plate.id,
        expected: expected.to_string(),
        actual: plate.status.to_string(),
    }
}

/// Field errors for adding `rollup` to the item's recorded outcome.
fn item_outcome_problems(item: &ProductionRunItem, rollup: Rollup) -> Vec<FieldError> {
    let successful = i64::from(item.successful_quantity) + i64::from(rollup.successful);
    let failed = i64::from(item.failed_quantity) + i64::from(rollup.failed);
    match (i32::try_from(successful), i32::try_from(failed)) {
        (Ok(successful), Ok(failed)) => validate_outcome("item.", item.quantity, successful, failed),
        _ => vec![FieldError::new(
            "item.successful_quantity",
            format!(
                "successful ({successful}) + failed ({failed}) exceeds planned quantity ({})",
                item.quantity
            ),
        )],
    }
}

/// Move a plate to `to`, rolling its results into the matching item.
async fn apply_transition(
    pool: &PgPool,
    run_id: Uuid,
    plate_id: Uuid,
    to: PlateStatus,
    action: &str,
    mut fields: PlateTransition,
) -> RunResult<ProductionRunPlate> {
    let mut tx = pool.begin().await?;
    let run = lock_run(&mut tx, run_id).await?;
    RunStateMachine::ensure_mutable(&run, &format!("{action} plate in"))?;

    let plate = fetch_plate(&mut tx, run_id, plate_id).await?;
    PlateStateMachine::ensure_transition(&plate, to, action)?;

    let successful = fields.successful_prints.unwrap_or(0);
    let failed = fields.failed_prints.unwrap_or(0);
    if to == PlateStatus::Completed {
        check_fields(validate_print_counts(plate.prints_per_plate, successful, failed))?;
    }

    let mut rollup = rollup_for(to, plate.prints_per_plate, successful, failed);
    if to == PlateStatus::Failed {
        fields.successful_prints = Some(0);
        fields.failed_prints = Some(plate.prints_per_plate);
    }

    if !rollup.is_empty() {
        let item = items::find_item_for_model(&mut *tx, run_id, plate.model_id)
            .await?
            .ok_or_else(|| {
                RunError::invalid(
                    "model_id",
                    format!("run has no item for model {}", plate.model_id),
                )
            })?;
        if to == PlateStatus::Failed {
            let open_units = i64::from(item.quantity)
                - i64::from(item.successful_quantity)
                - i64::from(item.failed_quantity);
            rollup = rollup.cap_failed(open_units);
        }
        let problems = item_outcome_problems(&item, rollup);
        if !problems.is_empty() {
            warn!(
                run_id = %run_id,
                plate_id = %plate_id,
                item_id = %item.id,
                "plate results would exceed item quantity"
            );
            return Err(RunError::Validation(problems));
        }
        if !rollup.is_empty()
            && items::increment_item_outcome(&mut *tx, item.id, rollup.successful, rollup.failed).await? == 0
        {
            return Err(RunError::invalid(
                "item.successful_quantity",
                "plate results would exceed item quantity",
            ));
        }
    }

    let Some(updated) =
        db::transition_plate_status(&mut *tx, plate_id, plate.status, to, &fields).await?
    else {
        let current = fetch_plate(&mut tx, run_id, plate_id).await?;
        return Err(concurrent(&current, &plate.status.to_string()));
    };
    runs::touch_run(&mut *tx, run_id).await?;
    tx.commit().await?;

    info!(
        run_id = %run_id,
        plate_id = %plate_id,
        from = %plate.status,
        to = %to,
        successful = rollup.successful,
        failed = rollup.failed,
        "plate transitioned"
    );
    Ok(updated)
}
