//! Material operations on an in-progress run.

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use printrun_db::queries::materials::{self as db, NewMaterial};
use printrun_db::queries::{runs, spools};

use super::{ActualEntry, MaterialLine, estimated_total_weight, validate_new_material};
use crate::error::{Entity, RunError, RunResult, check_fields};
use crate::run::lock_mutable_run;

/// Record a manual or weighed actual weight for one material line.
pub async fn record_actual(
    pool: &PgPool,
    run_id: Uuid,
    material_id: Uuid,
    entry: ActualEntry,
) -> RunResult<MaterialLine> {
    let resolved = entry.resolve()?;

    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "record material weight on").await?;

    if db::get_material(&mut *tx, run_id, material_id).await?.is_none() {
        return Err(RunError::not_found(Entity::Material, material_id));
    }

    db::set_actual_weight(
        &mut *tx,
        material_id,
        resolved.mode,
        resolved.actual_total_weight,
        resolved.weight_before,
        resolved.weight_after,
    )
    .await?;
    runs::touch_run(&mut *tx, run_id).await?;

    let line = db::get_material(&mut *tx, run_id, material_id)
        .await?
        .map(MaterialLine::from)
        .ok_or(RunError::not_found(Entity::Material, material_id))?;
    tx.commit().await?;

    info!(
        run_id = %run_id,
        material_id = %material_id,
        mode = %resolved.mode,
        grams = resolved.actual_total_weight,
        "actual weight recorded"
    );
    Ok(line)
}

/// Copy every material's estimate into its actual weight.
pub async fn reset_to_estimated(pool: &PgPool, run_id: Uuid) -> RunResult<Vec<MaterialLine>> {
    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "reset materials of").await?;

    let updated = db::reset_actuals_to_estimated(&mut *tx, run_id).await?;
    runs::touch_run(&mut *tx, run_id).await?;
    let lines = db::list_materials_for_run(&mut *tx, run_id)
        .await?
        .into_iter()
        .map(MaterialLine::from)
        .collect();
    tx.commit().await?;

    info!(run_id = %run_id, materials = updated, "material actuals reset to estimates");
    Ok(lines)
}

/// Attach a spool to an in-progress run.
pub async fn add_material(
    pool: &PgPool,
    run_id: Uuid,
    material: &NewMaterial,
) -> RunResult<MaterialLine> {
    check_fields(validate_new_material("", material))?;

    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "add material to").await?;

    if spools::get_spool(&mut *tx, material.spool_id).await?.is_none() {
        return Err(RunError::not_found(Entity::Spool, material.spool_id));
    }
    let existing = db::list_materials_for_run(&mut *tx, run_id).await?;
    if existing.iter().any(|m| m.material.spool_id == material.spool_id) {
        return Err(RunError::invalid(
            "spool_id",
            format!("spool {} is already used by this run", material.spool_id),
        ));
    }

    let total = estimated_total_weight(
        material.estimated_model_weight_grams,
        material.estimated_flushed_grams,
        material.estimated_tower_grams,
    );
    let row = db::insert_material(&mut *tx, run_id, material, total).await?;
    runs::touch_run(&mut *tx, run_id).await?;
    let line = db::get_material(&mut *tx, run_id, row.id)
        .await?
        .map(MaterialLine::from)
        .ok_or(RunError::not_found(Entity::Material, row.id))?;
    tx.commit().await?;

    info!(run_id = %run_id, spool_id = %material.spool_id, grams = total, "material added");
    Ok(line)
}

/// Detach a material line from an in-progress run.
pub async fn remove_material(pool: &PgPool, run_id: Uuid, material_id: Uuid) -> RunResult<()> {
    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "remove material from").await?;

    if db::delete_material(&mut *tx, run_id, material_id).await? == 0 {
        return Err(RunError::not_found(Entity::Material, material_id));
    }
    runs::touch_run(&mut *tx, run_id).await?;
    tx.commit().await?;

    info!(run_id = %run_id, material_id = %material_id, "material removed");
    Ok(())
}
