//! Inventory ledger adapter.
//!
//! The only code path that changes spool weights. Every deduction is journaled
//! in `inventory_deductions` under `(run_id, target_status, spool_id)`, so a
//! given terminal transition can deduct from a spool at most once.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use printrun_db::models::{DeductionReason, InventoryDeduction, RunStatus, Spool};
use printrun_db::queries::deductions::{self, NewDeduction};
use printrun_db::queries::{runs, spools};

use crate::error::{Entity, RunError, RunResult};

/// Grams taken from one spool, as reported by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpoolUsage {
    pub spool_id: Uuid,
    pub grams: f64,
}

/// Keep the positive entries and sum them per spool.
///
/// Zero, negative and non-finite amounts are dropped. The map is ordered by
/// spool id, which is also the lock order.
pub fn positive_usage(entries: &[SpoolUsage]) -> BTreeMap<Uuid, f64> {
    let mut usage = BTreeMap::new();
    for entry in entries {
        if entry.grams.is_finite() && entry.grams > 0.0 {
            *usage.entry(entry.spool_id).or_insert(0.0) += entry.grams;
        }
    }
    usage
}

/// Deduct `usage` from spools inside the caller's transaction.
///
/// Locks every affected spool up front (ascending id), then journals and
/// applies each deduction. Spools already journaled for this run and
/// `target` are left alone. Returns the newly written journal rows.
pub async fn apply_deductions(
    conn: &mut PgConnection,
    run_id: Uuid,
    target: RunStatus,
    reason: DeductionReason,
    usage: &BTreeMap<Uuid, f64>,
) -> RunResult<Vec<InventoryDeduction>> {
    if usage.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = usage.keys().copied().collect();
    let locked: HashMap<Uuid, f64> = spools::lock_spools(&mut *conn, &ids)
        .await?
        .into_iter()
        .map(|s| (s.id, s.current_weight_grams))
        .collect();

    let mut applied = Vec::with_capacity(usage.len());
    for (&spool_id, &grams) in usage {
        let Some(&available) = locked.get(&spool_id) else {
            return Err(RunError::not_found(Entity::Spool, spool_id));
        };

        if deductions::deduction_exists(&mut *conn, run_id, target, spool_id).await? {
            debug!(run_id = %run_id, spool_id = %spool_id, "deduction already journaled, skipping");
            continue;
        }

        if grams > available {
            warn!(
                run_id = %run_id,
                spool_id = %spool_id,
                requested = grams,
                available,
                "rejecting deduction beyond spool stock"
            );
            return Err(RunError::InsufficientStock {
                spool_id,
                requested: grams,
                available,
            });
        }

        let after = available - grams;
        let entry = NewDeduction {
            run_id,
            spool_id,
            target_status: target,
            reason,
            grams,
            weight_before_grams: available,
            weight_after_grams: after,
        };
        let Some(row) = deductions::insert_deduction(&mut *conn, &entry).await? else {
            continue;
        };
        spools::set_spool_weight(&mut *conn, spool_id, after).await?;

        info!(
            run_id = %run_id,
            spool_id = %spool_id,
            grams,
            remaining = after,
            reason = %reason,
            "spool deducted"
        );
        applied.push(row);
    }

    Ok(applied)
}

/// The deduction journal for a run.
pub async fn deductions_for_run(pool: &PgPool, run_id: Uuid) -> RunResult<Vec<InventoryDeduction>> {
    if runs::get_run(pool, run_id).await?.is_none() {
        return Err(RunError::not_found(Entity::Run, run_id));
    }
    Ok(deductions::list_deductions_for_run(pool, run_id).await?)
}

/// A spool together with everything the ledger has taken from it.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolBalance {
    #[serde(flatten)]
    pub spool: Spool,
    pub deducted_grams: f64,
}

/// Every spool with its lifetime deducted total.
pub async fn spool_balances(pool: &PgPool) -> RunResult<Vec<SpoolBalance>> {
    let all = spools::list_spools(pool).await?;
    let mut balances = Vec::with_capacity(all.len());
    for spool in all {
        let deducted_grams = deductions::total_deducted_for_spool(pool, spool.id).await?;
        balances.push(SpoolBalance {
            spool,
            deducted_grams,
        });
    }
    Ok(balances)
}
