//! Run creation, metadata edits and item outcomes.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use printrun_db::models::{ProductionRun, ProductionRunItem, RunStatus};
use printrun_db::queries::items::{self, NewItem};
use printrun_db::queries::materials::{self, NewMaterial};
use printrun_db::queries::runs::{self as db, NewRun, RunPatch};
use printrun_db::queries::spools;

use super::snapshot::{RunSnapshot, load_snapshot};
use super::{RunStateMachine, lock_mutable_run, lock_run, validate_outcome};
use crate::error::{Entity, FieldError, RunError, RunResult, check_fields};
use crate::reconcile::{estimated_total_weight, validate_new_material};

/// Body of a run creation request: run metadata plus its planned items and
/// estimated materials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewRunRequest {
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_print_time_hours: f64,
    pub printer_name: Option<String>,
    pub slicer_software: Option<String>,
    pub bed_temperature: Option<i32>,
    pub nozzle_temperature: Option<i32>,
    pub notes: Option<String>,
    #[serde(default)]
    pub items: Vec<NewItem>,
    #[serde(default)]
    pub materials: Vec<NewMaterial>,
}

impl NewRunRequest {
    fn split(self) -> (NewRun, Vec<NewItem>, Vec<NewMaterial>) {
        let run = NewRun {
            started_at: self.started_at,
            estimated_print_time_hours: self.estimated_print_time_hours,
            printer_name: self.printer_name,
            slicer_software: self.slicer_software,
            bed_temperature: self.bed_temperature,
            nozzle_temperature: self.nozzle_temperature,
            notes: self.notes,
        };
        (run, self.items, self.materials)
    }

    /// Field errors that need no database access.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if !self.estimated_print_time_hours.is_finite() || self.estimated_print_time_hours < 0.0 {
            errors.push(FieldError::new("estimated_print_time_hours", "must be >= 0"));
        }

        if self.items.is_empty() {
            errors.push(FieldError::new("items", "at least one item is required"));
        }
        let mut models = HashSet::new();
        for (i, item) in self.items.iter().enumerate() {
            if item.quantity < 1 {
                errors.push(FieldError::new(format!("items[{i}].quantity"), "must be >= 1"));
            }
            if item.model_weight_grams.is_some_and(|w| !w.is_finite() || w < 0.0) {
                errors.push(FieldError::new(
                    format!("items[{i}].model_weight_grams"),
                    "must be >= 0",
                ));
            }
            if !models.insert(item.model_id) {
                errors.push(FieldError::new(
                    format!("items[{i}].model_id"),
                    "model appears more than once",
                ));
            }
        }

        let mut seen = HashSet::new();
        for (i, material) in self.materials.iter().enumerate() {
            errors.extend(validate_new_material(&format!("materials[{i}]."), material));
            if !seen.insert(material.spool_id) {
                errors.push(FieldError::new(
                    format!("materials[{i}].spool_id"),
                    "spool appears more than once",
                ));
            }
        }

        errors
    }
}

/// Create a run in `in_progress` together with its items and materials.
pub async fn create_run(pool: &PgPool, request: NewRunRequest) -> RunResult<RunSnapshot> {
    check_fields(request.validate())?;
    let (new_run, new_items, new_materials) = request.split();

    let mut tx = pool.begin().await?;
    for material in &new_materials {
        if spools::get_spool(&mut *tx, material.spool_id).await?.is_none() {
            return Err(RunError::not_found(Entity::Spool, material.spool_id));
        }
    }

    let run = db::insert_run(&mut *tx, &new_run).await?;
    for item in &new_items {
        items::insert_item(&mut *tx, run.id, item).await?;
    }
    for material in &new_materials {
        let total = estimated_total_weight(
            material.estimated_model_weight_grams,
            material.estimated_flushed_grams,
            material.estimated_tower_grams,
        );
        materials::insert_material(&mut *tx, run.id, material, total).await?;
    }

    let snapshot = load_snapshot(&mut tx, run.id).await?;
    tx.commit().await?;

    info!(
        run_id = %run.id,
        run_number = %run.run_number,
        items = new_items.len(),
        materials = new_materials.len(),
        "production run created"
    );
    Ok(snapshot)
}

/// Apply a metadata patch.
///
/// Finished runs only accept `notes`.
pub async fn update_run(pool: &PgPool, run_id: Uuid, patch: &RunPatch) -> RunResult<ProductionRun> {
    let mut errors = Vec::new();
    for (field, value) in [
        ("duration_hours", patch.duration_hours),
        ("estimated_print_time_hours", patch.estimated_print_time_hours),
    ] {
        if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
            errors.push(FieldError::new(field, "must be >= 0"));
        }
    }
    check_fields(errors)?;

    let mut tx = pool.begin().await?;
    let run = lock_run(&mut tx, run_id).await?;
    if !patch.is_notes_only() {
        RunStateMachine::ensure_mutable(&run, "edit")?;
    }

    let updated = db::update_run_details(&mut *tx, run_id, patch)
        .await?
        .ok_or(RunError::not_found(Entity::Run, run_id))?;
    tx.commit().await?;

    info!(run_id = %run_id, notes_only = patch.is_notes_only(), "run updated");
    Ok(updated)
}

/// New outcome counts for an item.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemOutcome {
    pub successful_quantity: i32,
    pub failed_quantity: i32,
}

/// Overwrite an item's successful/failed counts.
pub async fn update_item_outcome(
    pool: &PgPool,
    run_id: Uuid,
    item_id: Uuid,
    outcome: ItemOutcome,
) -> RunResult<ProductionRunItem> {
    let mut tx = pool.begin().await?;
    lock_mutable_run(&mut tx, run_id, "edit items of").await?;

    let item = items::get_item(&mut *tx, run_id, item_id)
        .await?
        .ok_or(RunError::not_found(Entity::Item, item_id))?;
    check_fields(validate_outcome(
        "",
        item.quantity,
        outcome.successful_quantity,
        outcome.failed_quantity,
    ))?;

    let updated = items::set_item_outcome(
        &mut *tx,
        item_id,
        outcome.successful_quantity,
        outcome.failed_quantity,
    )
    .await?
    .ok_or(RunError::not_found(Entity::Item, item_id))?;
    db::touch_run(&mut *tx, run_id).await?;
    tx.commit().await?;

    info!(
        run_id = %run_id,
        item_id = %item_id,
        successful = outcome.successful_quantity,
        failed = outcome.failed_quantity,
        "item outcome updated"
    );
    Ok(updated)
}

pub async fn list_runs(pool: &PgPool, status: Option<RunStatus>) -> RunResult<Vec<ProductionRun>> {
    Ok(db::list_runs(pool, status).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: i32) -> NewItem {
        NewItem {
            model_id: Uuid::new_v4(),
            model_name: None,
            quantity,
            bed_position: None,
            model_weight_grams: None,
            estimated_cost_per_unit: None,
        }
    }

    #[test]
    fn request_needs_items() {
        let errors = NewRunRequest::default().validate();
        assert_eq!(errors[0].field, "items");
    }

    #[test]
    fn zero_quantity_item_is_rejected() {
        let request = NewRunRequest {
            items: vec![item(2), item(0)],
            ..Default::default()
        };
        let fields: Vec<String> = request.validate().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["items[1].quantity"]);
    }

    #[test]
    fn duplicate_spools_are_rejected() {
        let spool_id = Uuid::new_v4();
        let material = NewMaterial {
            spool_id,
            estimated_model_weight_grams: 10.0,
            estimated_flushed_grams: None,
            estimated_tower_grams: None,
        };
        let request = NewRunRequest {
            items: vec![item(1)],
            materials: vec![material.clone(), material],
            ..Default::default()
        };
        let errors = request.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "materials[1].spool_id");
    }

    #[test]
    fn request_parses_flat_json() {
        let model = Uuid::new_v4();
        let spool = Uuid::new_v4();
        let json = format!(
            r#"{{
                "estimated_print_time_hours": 4.5,
                "printer_name": "Bambu X1C",
                "items": [{{"model_id": "{model}", "quantity": 6, "model_weight_grams": 21.0}}],
                "materials": [{{"spool_id": "{spool}", "estimated_model_weight_grams": 126.0,
                                "estimated_flushed_grams": 30.0}}]
            }}"#
        );
        let request: NewRunRequest = serde_json::from_str(&json).unwrap();
        assert!(request.validate().is_empty());
        let (run, items, materials) = request.split();
        assert_eq!(run.printer_name.as_deref(), Some("Bambu X1C"));
        assert_eq!(items[0].quantity, 6);
        assert_eq!(materials[0].estimated_flushed_grams, Some(30.0));
    }

    #[test]
    fn request_rejects_status_field() {
        let json = r#"{"status": "completed", "items": []}"#;
        assert!(serde_json::from_str::<NewRunRequest>(json).is_err());
    }
}
