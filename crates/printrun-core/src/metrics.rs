//! Run-level cost, yield and time aggregates.

use serde::Serialize;

use printrun_db::models::ProductionRunItem;

use crate::reconcile::MaterialReconciliation;

/// Planned and outcome counts summed over a run's items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemTotals {
    pub planned: i64,
    pub successful: i64,
    pub failed: i64,
}

impl ItemTotals {
    pub fn from_items(items: &[ProductionRunItem]) -> Self {
        items.iter().fold(Self::default(), |acc, item| Self {
            planned: acc.planned + i64::from(item.quantity),
            successful: acc.successful + i64::from(item.successful_quantity),
            failed: acc.failed + i64::from(item.failed_quantity),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunMetrics {
    pub total_estimated_cost: f64,
    pub total_material_cost: f64,
    pub cost_variance: f64,
    pub successful_weight_grams: f64,
    pub cost_per_gram_actual: Option<f64>,
    pub overall_success_rate: Option<f64>,
    pub time_variance_percentage: Option<f64>,
}

impl RunMetrics {
    /// Aggregate item and material figures. Unmeasured materials contribute
    /// nothing to the actual cost.
    pub fn compute(
        items: &[ProductionRunItem],
        materials: &[MaterialReconciliation],
        duration_hours: Option<f64>,
        estimated_print_time_hours: f64,
    ) -> Self {
        let total_estimated_cost: f64 = materials.iter().map(|m| m.estimated_cost).sum();
        let total_material_cost: f64 = materials.iter().filter_map(|m| m.total_cost).sum();

        let successful_weight_grams: f64 = items
            .iter()
            .map(|i| i.model_weight_grams.unwrap_or(0.0) * f64::from(i.successful_quantity))
            .sum();

        let cost_per_gram_actual =
            (successful_weight_grams > 0.0).then(|| total_material_cost / successful_weight_grams);

        let totals = ItemTotals::from_items(items);
        let overall_success_rate = (totals.planned > 0)
            .then(|| totals.successful as f64 / totals.planned as f64 * 100.0);

        let time_variance_percentage = match duration_hours {
            Some(actual) if estimated_print_time_hours > 0.0 => Some(
                (actual - estimated_print_time_hours) / estimated_print_time_hours * 100.0,
            ),
            _ => None,
        };

        Self {
            total_estimated_cost,
            total_material_cost,
            cost_variance: total_material_cost - total_estimated_cost,
            successful_weight_grams,
            cost_per_gram_actual,
            overall_success_rate,
            time_variance_percentage,
        }
    }

    /// Actual material cost attributable to one unit of an item.
    pub fn actual_cost_per_unit(&self, item: &ProductionRunItem) -> Option<f64> {
        match (item.model_weight_grams, self.cost_per_gram_actual) {
            (Some(weight), Some(rate)) => Some(weight * rate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
