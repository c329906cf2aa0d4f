//! Material reconciliation engine.
//!
//! Turns estimated weights and raw measurements into actual weights, costs
//! and variance for each material line. Everything in this module is pure;
//! the database-backed operations live in [`service`].

pub mod service;

use serde::{Deserialize, Serialize};

use printrun_db::models::{ActualEntryMode, MaterialWithSpool, ProductionRunMaterial};
use printrun_db::queries::materials::NewMaterial;

use crate::error::{FieldError, RunError, RunResult};

/// Sum of the model weight and the optional purge/tower waste components.
pub fn estimated_total_weight(model_grams: f64, flushed: Option<f64>, tower: Option<f64>) -> f64 {
    model_grams + flushed.unwrap_or(0.0) + tower.unwrap_or(0.0)
}

/// Weight consumed between two spool weighings.
///
/// Fails when the spool got heavier, which means the readings were swapped or
/// the wrong spool was weighed.
pub fn weight_from_weighing(before: f64, after: f64) -> RunResult<f64> {
    if before < after {
        return Err(RunError::Validation(vec![FieldError::new(
            "spool_weight_after_grams",
            format!("spool weighed {after} g after the run but only {before} g before"),
        )]));
    }
    Ok((before - after).max(0.0))
}

/// Percentage deviation of `actual` from `estimated`, or `None` when there is
/// no estimate to compare against.
pub fn variance_percentage(estimated: f64, actual: f64) -> Option<f64> {
    if estimated == 0.0 {
        None
    } else {
        Some((actual - estimated) / estimated * 100.0)
    }
}

// ---------------------------------------------------------------------------
// Actual-weight entry
// ---------------------------------------------------------------------------

/// A validated actual-weight measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActualEntry {
    Manual { grams: f64 },
    Weighing { before: f64, after: f64 },
}

/// Resolved column values for an [`ActualEntry`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedActual {
    pub mode: ActualEntryMode,
    pub actual_total_weight: f64,
    pub weight_before: Option<f64>,
    pub weight_after: Option<f64>,
}

impl ActualEntry {
    pub fn resolve(self) -> RunResult<ResolvedActual> {
        match self {
            Self::Manual { grams } => {
                if !grams.is_finite() || grams < 0.0 {
                    return Err(RunError::invalid(
                        "actual_model_weight_grams",
                        "must be a non-negative number",
                    ));
                }
                Ok(ResolvedActual {
                    mode: ActualEntryMode::Manual,
                    actual_total_weight: grams,
                    weight_before: None,
                    weight_after: None,
                })
            }
            Self::Weighing { before, after } => {
                let mut errors = Vec::new();
                for (field, value) in [
                    ("spool_weight_before_grams", before),
                    ("spool_weight_after_grams", after),
                ] {
                    if !value.is_finite() || value < 0.0 {
                        errors.push(FieldError::new(field, "must be a non-negative number"));
                    }
                }
                crate::error::check_fields(errors)?;
                let actual = weight_from_weighing(before, after)?;
                Ok(ResolvedActual {
                    mode: ActualEntryMode::Weighing,
                    actual_total_weight: actual,
                    weight_before: Some(before),
                    weight_after: Some(after),
                })
            }
        }
    }
}

/// Request body for recording an actual weight: either the manual weight or
/// the before/after weighing pair.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActualWeightRequest {
    pub actual_model_weight_grams: Option<f64>,
    pub spool_weight_before_grams: Option<f64>,
    pub spool_weight_after_grams: Option<f64>,
}

impl ActualWeightRequest {
    pub fn into_entry(self) -> RunResult<ActualEntry> {
        match (
            self.actual_model_weight_grams,
            self.spool_weight_before_grams,
            self.spool_weight_after_grams,
        ) {
            (Some(grams), None, None) => Ok(ActualEntry::Manual { grams }),
            (None, Some(before), Some(after)) => Ok(ActualEntry::Weighing { before, after }),
            (None, Some(_), None) => Err(RunError::invalid(
                "spool_weight_after_grams",
                "required when spool_weight_before_grams is given",
            )),
            (None, None, Some(_)) => Err(RunError::invalid(
                "spool_weight_before_grams",
                "required when spool_weight_after_grams is given",
            )),
            (None, None, None) => Err(RunError::invalid(
                "actual_model_weight_grams",
                "supply a manual weight or a before/after weighing pair",
            )),
            (Some(_), _, _) => Err(RunError::invalid(
                "actual_model_weight_grams",
                "cannot be combined with a weighing pair",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived figures
// ---------------------------------------------------------------------------

/// Cost and variance figures derived for one material line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaterialReconciliation {
    pub estimated_total_weight: f64,
    pub estimated_cost: f64,
    pub actual_total_weight: Option<f64>,
    pub total_cost: Option<f64>,
    pub variance_percentage: Option<f64>,
    pub cost_per_gram: f64,
}

/// Derive cost and variance for a material at the given price.
pub fn reconcile(material: &ProductionRunMaterial, cost_per_gram: f64) -> MaterialReconciliation {
    let estimated = material.estimated_total_weight;
    let actual = material.actual_total_weight;
    MaterialReconciliation {
        estimated_total_weight: estimated,
        estimated_cost: estimated * cost_per_gram,
        actual_total_weight: actual,
        total_cost: actual.map(|a| a * cost_per_gram),
        variance_percentage: actual.and_then(|a| variance_percentage(estimated, a)),
        cost_per_gram,
    }
}

/// Why a material cannot be finalized, if it cannot.
///
/// A line is determinable when it has a manual weight above zero, or a
/// weighing pair with `before >= after`.
pub fn measurement_problem(material: &ProductionRunMaterial) -> Option<String> {
    let Some(actual) = material.actual_total_weight else {
        return Some("no actual weight recorded".to_string());
    };
    match material.actual_entry_mode {
        Some(ActualEntryMode::Weighing) => {
            match (material.spool_weight_before_grams, material.spool_weight_after_grams) {
                (Some(before), Some(after)) if before >= after => None,
                (Some(_), Some(_)) => Some("spool weighed more after the run than before".into()),
                _ => Some("weighing pair is incomplete".into()),
            }
        }
        _ if actual > 0.0 => None,
        _ => Some("manual actual weight must be greater than zero".into()),
    }
}

/// A material line as returned to callers: stored row, spool label and the
/// live (or, for finished runs, frozen) reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct MaterialLine {
    #[serde(flatten)]
    pub material: ProductionRunMaterial,
    pub spool_label: String,
    pub reconciliation: MaterialReconciliation,
}

impl From<MaterialWithSpool> for MaterialLine {
    fn from(row: MaterialWithSpool) -> Self {
        // Finished runs carry a price snapshot; open runs follow the spool.
        let cost_per_gram = row.material.cost_per_gram.unwrap_or(row.spool_cost_per_gram);
        let reconciliation = reconcile(&row.material, cost_per_gram);
        Self {
            material: row.material,
            spool_label: row.spool_label,
            reconciliation,
        }
    }
}

/// Field errors for a material line supplied at creation or attach time.
pub fn validate_new_material(prefix: &str, material: &NewMaterial) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let components = [
        ("estimated_model_weight_grams", Some(material.estimated_model_weight_grams)),
        ("estimated_flushed_grams", material.estimated_flushed_grams),
        ("estimated_tower_grams", material.estimated_tower_grams),
    ];
    for (field, value) in components {
        if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
            errors.push(FieldError::new(format!("{prefix}{field}"), "must be >= 0"));
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn material(estimated: f64, actual: Option<f64>) -> ProductionRunMaterial {
        ProductionRunMaterial {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            spool_id: Uuid::new_v4(),
            estimated_model_weight_grams: estimated,
            estimated_flushed_grams: None,
            estimated_tower_grams: None,
            estimated_total_weight: estimated,
            estimated_cost: None,
            actual_total_weight: actual,
            actual_entry_mode: actual.map(|_| ActualEntryMode::Manual),
            spool_weight_before_grams: None,
            spool_weight_after_grams: None,
            variance_percentage: None,
            total_cost: None,
            cost_per_gram: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn estimated_total_adds_waste_components() {
        assert!(close(estimated_total_weight(120.0, Some(15.5), Some(4.5)), 140.0));
        assert!(close(estimated_total_weight(120.0, None, None), 120.0));
    }

    #[test]
    fn overrun_at_two_pence_per_gram() {
        let rec = reconcile(&material(500.0, Some(550.0)), 0.02);
        assert!(close(rec.variance_percentage.unwrap(), 10.0));
        assert!(close(rec.estimated_cost, 10.0));
        assert!(close(rec.total_cost.unwrap(), 11.0));
    }

    #[test]
    fn variance_is_null_only_without_estimate() {
        assert_eq!(variance_percentage(0.0, 25.0), None);
        assert_eq!(variance_percentage(0.0, 0.0), None);
        assert!(close(variance_percentage(200.0, 150.0).unwrap(), -25.0));
        assert!(close(variance_percentage(80.0, 80.0).unwrap(), 0.0));
    }

    #[test]
    fn unmeasured_line_has_no_actual_figures() {
        let rec = reconcile(&material(100.0, None), 0.03);
        assert_eq!(rec.actual_total_weight, None);
        assert_eq!(rec.total_cost, None);
        assert_eq!(rec.variance_percentage, None);
        assert!(close(rec.estimated_cost, 3.0));
    }

    #[test]
    fn weighing_gain_is_rejected() {
        let err = ActualEntry::Weighing {
            before: 200.0,
            after: 250.0,
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, RunError::Validation(_)));
        assert_eq!(err.field_errors()[0].field, "spool_weight_after_grams");
    }

    #[test]
    fn weighing_computes_consumption() {
        let resolved = ActualEntry::Weighing {
            before: 980.0,
            after: 742.5,
        }
        .resolve()
        .unwrap();
        assert_eq!(resolved.mode, ActualEntryMode::Weighing);
        assert!(close(resolved.actual_total_weight, 237.5));
        assert_eq!(resolved.weight_before, Some(980.0));
    }

    #[test]
    fn negative_manual_weight_is_rejected() {
        let err = ActualEntry::Manual { grams: -1.0 }.resolve().unwrap_err();
        assert_eq!(err.field_errors()[0].field, "actual_model_weight_grams");
    }

    #[test]
    fn request_requires_exactly_one_form() {
        let manual = ActualWeightRequest {
            actual_model_weight_grams: Some(42.0),
            ..Default::default()
        };
        assert_eq!(manual.into_entry().unwrap(), ActualEntry::Manual { grams: 42.0 });

        let half_pair = ActualWeightRequest {
            spool_weight_before_grams: Some(500.0),
            ..Default::default()
        };
        assert!(half_pair.into_entry().is_err());

        let both = ActualWeightRequest {
            actual_model_weight_grams: Some(10.0),
            spool_weight_before_grams: Some(500.0),
            spool_weight_after_grams: Some(490.0),
        };
        assert!(both.into_entry().is_err());
        assert!(ActualWeightRequest::default().into_entry().is_err());
    }

    #[test]
    fn measurement_rules() {
        assert!(measurement_problem(&material(100.0, None)).is_some());
        assert!(measurement_problem(&material(100.0, Some(0.0))).is_some());
        assert!(measurement_problem(&material(100.0, Some(90.0))).is_none());

        let mut weighed = material(100.0, Some(0.0));
        weighed.actual_entry_mode = Some(ActualEntryMode::Weighing);
        weighed.spool_weight_before_grams = Some(300.0);
        weighed.spool_weight_after_grams = Some(300.0);
        assert!(measurement_problem(&weighed).is_none());
    }

    #[test]
    fn line_prefers_price_snapshot() {
        let mut m = material(100.0, Some(100.0));
        m.cost_per_gram = Some(0.05);
        let line = MaterialLine::from(MaterialWithSpool {
            material: m,
            spool_label: "PLA Black".into(),
            spool_cost_per_gram: 0.01,
        });
        assert!(close(line.reconciliation.total_cost.unwrap(), 5.0));
    }

    #[test]
    fn negative_estimates_are_flagged() {
        let m = NewMaterial {
            spool_id: Uuid::new_v4(),
            estimated_model_weight_grams: -3.0,
            estimated_flushed_grams: Some(2.0),
            estimated_tower_grams: Some(-1.0),
        };
        let errors = validate_new_material("materials[0].", &m);
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "materials[0].estimated_model_weight_grams",
                "materials[0].estimated_tower_grams"
            ]
        );
    }
}
