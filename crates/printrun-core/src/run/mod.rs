//! Production run state machine.
//!
//! A run is created `in_progress` and reaches exactly one terminal status.
//! Every mutation of a run or of its items, materials and plates opens a
//! transaction, takes the run's row lock through [`lock_mutable_run`] and
//! only then touches child rows.

pub mod finalize;
pub mod service;
pub mod snapshot;

use sqlx::PgConnection;
use uuid::Uuid;

use printrun_db::models::{ProductionRun, RunStatus};
use printrun_db::queries::runs as db;

use crate::error::{Entity, FieldError, RunError, RunResult};

/// The run state machine.
///
/// ```text
/// in_progress -> completed
/// in_progress -> failed
/// in_progress -> cancelled
/// ```
pub struct RunStateMachine;

impl RunStateMachine {
    pub fn is_valid_transition(from: RunStatus, to: RunStatus) -> bool {
        matches!(
            (from, to),
            (RunStatus::InProgress, RunStatus::Completed)
                | (RunStatus::InProgress, RunStatus::Failed)
                | (RunStatus::InProgress, RunStatus::Cancelled)
        )
    }

    /// Reject `action` unless the run still accepts changes.
    pub fn ensure_mutable(run: &ProductionRun, action: &str) -> RunResult<()> {
        if run.status.is_terminal() {
            return Err(RunError::IllegalTransition {
                entity: Entity::Run,
                id: run.id,
                current: run.status.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }

    /// Reject a terminal transition the table does not allow.
    pub fn ensure_transition(run: &ProductionRun, to: RunStatus, action: &str) -> RunResult<()> {
        if !Self::is_valid_transition(run.status, to) {
            return Err(RunError::IllegalTransition {
                entity: Entity::Run,
                id: run.id,
                current: run.status.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }
}

/// Lock a run row for the rest of the transaction.
pub(crate) async fn lock_run(conn: &mut PgConnection, run_id: Uuid) -> RunResult<ProductionRun> {
    db::lock_run(conn, run_id)
        .await?
        .ok_or(RunError::NotFound {
            entity: Entity::Run,
            id: run_id,
        })
}

/// Lock a run and require it to be `in_progress`.
pub(crate) async fn lock_mutable_run(
    conn: &mut PgConnection,
    run_id: Uuid,
    action: &str,
) -> RunResult<ProductionRun> {
    let run = lock_run(conn, run_id).await?;
    RunStateMachine::ensure_mutable(&run, action)?;
    Ok(run)
}

/// Field errors for an item outcome against its planned quantity.
pub fn validate_outcome(
    prefix: &str,
    quantity: i32,
    successful: i32,
    failed: i32,
) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if successful < 0 {
        errors.push(FieldError::new(format!("{prefix}successful_quantity"), "must be >= 0"));
    }
    if failed < 0 {
        errors.push(FieldError::new(format!("{prefix}failed_quantity"), "must be >= 0"));
    }
    if i64::from(successful) + i64::from(failed) > i64::from(quantity) {
        errors.push(FieldError::new(
            format!("{prefix}successful_quantity"),
            format!(
                "successful ({successful}) + failed ({failed}) exceeds planned quantity ({quantity})"
            ),
        ));
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
