//! Plate lifecycle: the print-bed jobs inside a run.
//!
//! Plate results roll up into the run item that tracks the plate's model, in
//! the same transaction as the plate status change.

pub mod service;

use printrun_db::models::{PlateStatus, ProductionRunPlate};

use crate::error::{Entity, FieldError, RunError, RunResult};

/// The plate state machine.
///
/// ```text
/// pending  -> printing
/// pending  -> completed | failed | cancelled
/// printing -> completed | failed | cancelled
/// ```
pub struct PlateStateMachine;

impl PlateStateMachine {
    pub fn is_valid_transition(from: PlateStatus, to: PlateStatus) -> bool {
        matches!(
            (from, to),
            (PlateStatus::Pending, PlateStatus::Printing)
                | (
                    PlateStatus::Pending | PlateStatus::Printing,
                    PlateStatus::Completed | PlateStatus::Failed | PlateStatus::Cancelled
                )
        )
    }

    pub fn ensure_transition(plate: &ProductionRunPlate, to: PlateStatus, action: &str) -> RunResult<()> {
        if !Self::is_valid_transition(plate.status, to) {
            return Err(illegal(plate, action));
        }
        Ok(())
    }

    /// Details can be edited until the plate finishes.
    pub fn ensure_editable(plate: &ProductionRunPlate, action: &str) -> RunResult<()> {
        if plate.status.is_terminal() {
            return Err(illegal(plate, action));
        }
        Ok(())
    }

    /// Only plates that never started may be deleted.
    pub fn ensure_deletable(plate: &ProductionRunPlate) -> RunResult<()> {
        if plate.status != PlateStatus::Pending {
            return Err(illegal(plate, "delete"));
        }
        Ok(())
    }
}

fn illegal(plate: &ProductionRunPlate, action: &str) -> RunError {
    RunError::IllegalTransition {
        entity: Entity::Plate,
        id: plate.id,
        current: plate.status.to_string(),
        action: action.to_string(),
    }
}

/// Counts a plate transition adds to its item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollup {
    pub successful: i32,
    pub failed: i32,
}

impl Rollup {
    pub fn is_empty(self) -> bool {
        self.successful == 0 && self.failed == 0
    }

    /// Limit the failed count to the units the item still has open.
    pub fn cap_failed(self, open_units: i64) -> Rollup {
        let cap = i32::try_from(open_units.max(0)).unwrap_or(i32::MAX);
        Rollup {
            successful: self.successful,
            failed: self.failed.min(cap),
        }
    }
}

/// What a transition to `to` contributes to the item.
///
/// A completed plate reports its own counts, a failed plate loses the whole
/// bed, and a cancelled plate counts for nothing. The failed-bed count is
/// capped against the item by [`Rollup::cap_failed`] before it is applied.
pub fn rollup_for(to: PlateStatus, prints_per_plate: i32, successful: i32, failed: i32) -> Rollup {
    match to {
        PlateStatus::Completed => Rollup { successful, failed },
        PlateStatus::Failed => Rollup {
            successful: 0,
            failed: prints_per_plate,
        },
        _ => Rollup::default(),
    }
}

/// Field errors for reported print counts.
pub fn validate_print_counts(prints_per_plate: i32, successful: i32, failed: i32) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if successful < 0 {
        errors.push(FieldError::new("successful_prints", "must be >= 0"));
    }
    if failed < 0 {
        errors.push(FieldError::new("failed_prints", "must be >= 0"));
    }
    if i64::from(successful) + i64::from(failed) > i64::from(prints_per_plate) {
        errors.push(FieldError::new(
            "successful_prints",
            format!(
                "successful ({successful}) + failed ({failed}) exceeds prints per plate ({prints_per_plate})"
            ),
        ));
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
