//! Read model for a run with everything it owns.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use printrun_db::models::{PlateStatus, ProductionRun, ProductionRunItem, ProductionRunPlate};
use printrun_db::queries::{items, materials, plates, runs};

use crate::error::{Entity, RunError, RunResult};
use crate::metrics::{ItemTotals, RunMetrics};
use crate::reconcile::{MaterialLine, MaterialReconciliation};

/// Plate counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlateCounts {
    pub pending: u32,
    pub printing: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl PlateCounts {
    pub fn from_plates(plates: &[ProductionRunPlate]) -> Self {
        let mut counts = Self::default();
        for plate in plates {
            let slot = match plate.status {
                PlateStatus::Pending => &mut counts.pending,
                PlateStatus::Printing => &mut counts.printing,
                PlateStatus::Completed => &mut counts.completed,
                PlateStatus::Failed => &mut counts.failed,
                PlateStatus::Cancelled => &mut counts.cancelled,
            };
            *slot += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub run: ProductionRun,
    pub items: Vec<ProductionRunItem>,
    pub materials: Vec<MaterialLine>,
    pub plates: Vec<ProductionRunPlate>,
    pub totals: ItemTotals,
    pub plate_counts: PlateCounts,
    pub metrics: RunMetrics,
}

impl RunSnapshot {
    pub fn assemble(
        run: ProductionRun,
        items: Vec<ProductionRunItem>,
        materials: Vec<MaterialLine>,
        plates: Vec<ProductionRunPlate>,
    ) -> Self {
        let recs: Vec<MaterialReconciliation> =
            materials.iter().map(|m| m.reconciliation).collect();
        let metrics = RunMetrics::compute(
            &items,
            &recs,
            run.duration_hours,
            run.estimated_print_time_hours,
        );
        Self {
            totals: ItemTotals::from_items(&items),
            plate_counts: PlateCounts::from_plates(&plates),
            metrics,
            run,
            items,
            materials,
            plates,
        }
    }
}

/// Load a snapshot on an existing connection (typically inside the
/// transaction that just changed the run).
pub(crate) async fn load_snapshot(conn: &mut PgConnection, run_id: Uuid) -> RunResult<RunSnapshot> {
    let run = runs::get_run(&mut *conn, run_id)
        .await?
        .ok_or(RunError::not_found(Entity::Run, run_id))?;
    let items = items::list_items_for_run(&mut *conn, run_id).await?;
    let lines = materials::list_materials_for_run(&mut *conn, run_id)
        .await?
        .into_iter()
        .map(MaterialLine::from)
        .collect();
    let plates = plates::list_plates_for_run(&mut *conn, run_id).await?;

    Ok(RunSnapshot::assemble(run, items, lines, plates))
}

/// Fetch a run with its items, materials, plates and derived metrics.
pub async fn get_run_snapshot(pool: &PgPool, run_id: Uuid) -> RunResult<RunSnapshot> {
    let mut conn = pool.acquire().await?;
    load_snapshot(&mut conn, run_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn plate(status: PlateStatus) -> ProductionRunPlate {
        ProductionRunPlate {
            id: Uuid::new_v4(),
            run_id: Uuid::nil(),
            model_id: Uuid::nil(),
            printer_id: None,
            plate_number: 1,
            plate_name: "Plate 1".into(),
            prints_per_plate: 1,
            status,
            successful_prints: 0,
            failed_prints: 0,
            print_time_minutes: None,
            actual_print_time_minutes: None,
            estimated_material_weight_grams: None,
            actual_material_weight_grams: None,
            notes: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn counts_plates_by_status() {
        let counts = PlateCounts::from_plates(&[
            plate(PlateStatus::Pending),
            plate(PlateStatus::Completed),
            plate(PlateStatus::Completed),
            plate(PlateStatus::Failed),
        ]);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.printing, 0);
    }
}
