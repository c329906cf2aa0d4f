//! CLI handlers for run inspection and terminal transitions.
//!
//! Implements:
//! - `printrun runs [run-id]`   -- list runs or show one run's snapshot
//! - `printrun complete <id>`   -- complete a run and deduct measured filament
//! - `printrun cancel <id>`     -- cancel with full reversal or partial usage
//! - `printrun fail <id>`       -- fail with a catalog reason and waste

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use printrun_core::catalog::FailureReasonCatalog;
use printrun_core::ledger::SpoolUsage;
use printrun_core::run::finalize::{self, CancelRequest, FailRequest};
use printrun_core::run::service::list_runs;
use printrun_core::run::snapshot::{RunSnapshot, get_run_snapshot};
use printrun_db::models::{CancelMode, RunStatus};

// -----------------------------------------------------------------------
// Argument parsing
// -----------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UsageArgError {
    #[error("expected SPOOL_ID=GRAMS, got {0:?}")]
    MissingSeparator(String),
    #[error("invalid spool id {0:?}")]
    SpoolId(String),
    #[error("invalid gram amount {0:?}")]
    Grams(String),
}

/// Parse a `SPOOL_ID=GRAMS` argument.
///
/// Negative and zero amounts are accepted here; the ledger skips them.
pub fn parse_usage(arg: &str) -> Result<SpoolUsage, UsageArgError> {
    let (spool, grams) = arg
        .split_once('=')
        .ok_or_else(|| UsageArgError::MissingSeparator(arg.to_string()))?;
    let spool_id =
        Uuid::parse_str(spool.trim()).map_err(|_| UsageArgError::SpoolId(spool.to_string()))?;
    let grams: f64 = grams
        .trim()
        .parse()
        .map_err(|_| UsageArgError::Grams(grams.to_string()))?;
    Ok(SpoolUsage { spool_id, grams })
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid run ID: {raw}"))
}

// -----------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------

/// List runs, or show a single run when `run_id` is given.
pub async fn run_runs(pool: &PgPool, run_id: Option<&str>, status: Option<RunStatus>) -> Result<()> {
    if let Some(raw) = run_id {
        let snapshot = get_run_snapshot(pool, parse_run_id(raw)?).await?;
        print_snapshot(&snapshot);
        return Ok(());
    }

    let runs = list_runs(pool, status).await?;
    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<17} {:<20}",
        "ID", "RUN", "STATUS", "STARTED", "PRINTER"
    );
    println!("{}", "-".repeat(110));
    for run in &runs {
        println!(
            "{:<38} {:<20} {:<12} {:<17} {:<20}",
            run.id,
            run.run_number,
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.printer_name.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

pub async fn run_complete(pool: &PgPool, run_id: &str) -> Result<()> {
    let snapshot = finalize::complete_run(pool, parse_run_id(run_id)?).await?;
    println!("Run {} completed.", snapshot.run.run_number);
    print_snapshot(&snapshot);
    Ok(())
}

pub async fn run_cancel(
    pool: &PgPool,
    run_id: &str,
    mode: CancelMode,
    usage: Vec<SpoolUsage>,
    notes: Option<String>,
) -> Result<()> {
    if mode == CancelMode::FullReversal && !usage.is_empty() {
        println!("Note: --usage is ignored for full_reversal.");
    }
    let request = CancelRequest {
        cancel_mode: mode,
        partial_usage: usage,
        notes,
    };
    let snapshot = finalize::cancel_run(pool, parse_run_id(run_id)?, &request).await?;
    println!("Run {} cancelled ({mode}).", snapshot.run.run_number);
    print_snapshot(&snapshot);
    Ok(())
}

pub async fn run_fail(
    pool: &PgPool,
    catalog: &FailureReasonCatalog,
    run_id: &str,
    reason: String,
    waste: Vec<SpoolUsage>,
    notes: Option<String>,
) -> Result<()> {
    let request = FailRequest {
        failure_reason: reason,
        waste_materials: waste,
        notes,
    };
    let snapshot = finalize::fail_run(pool, catalog, parse_run_id(run_id)?, &request).await?;
    println!("Run {} marked failed.", snapshot.run.run_number);
    print_snapshot(&snapshot);
    Ok(())
}

// -----------------------------------------------------------------------
// Output
// -----------------------------------------------------------------------

fn print_snapshot(snapshot: &RunSnapshot) {
    let run = &snapshot.run;
    println!("Run: {} ({})", run.run_number, run.id);
    println!("Status: {}", run.status);
    println!("Started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(completed_at) = run.completed_at {
        println!("Finished: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(hours) = run.duration_hours {
        println!(
            "Duration: {hours:.2} h (estimated {:.2} h)",
            run.estimated_print_time_hours
        );
    }
    if let Some(reason) = &run.waste_reason {
        println!("Failure reason: {reason}");
    }
    if let Some(notes) = &run.notes {
        println!("Notes: {notes}");
    }
    println!();

    println!(
        "Items: {} planned, {} successful, {} failed",
        snapshot.totals.planned, snapshot.totals.successful, snapshot.totals.failed
    );
    for item in &snapshot.items {
        println!(
            "  {} x{} ({} ok, {} failed)",
            item.model_name.as_deref().unwrap_or("unnamed model"),
            item.quantity,
            item.successful_quantity,
            item.failed_quantity,
        );
    }
    println!();

    if !snapshot.materials.is_empty() {
        println!("Materials:");
        for line in &snapshot.materials {
            let actual = line
                .material
                .actual_total_weight
                .map_or_else(|| "-".to_string(), |g| format!("{g:.1} g"));
            let variance = line
                .reconciliation
                .variance_percentage
                .map_or_else(|| "n/a".to_string(), |v| format!("{v:+.1}%"));
            println!(
                "  {:<24} est {:>8.1} g  actual {:>10}  variance {:>7}",
                line.spool_label, line.material.estimated_total_weight, actual, variance,
            );
        }
        println!();
    }

    let plates = &snapshot.plate_counts;
    if !snapshot.plates.is_empty() {
        println!(
            "Plates: pending={} printing={} completed={} failed={} cancelled={}",
            plates.pending, plates.printing, plates.completed, plates.failed, plates.cancelled
        );
    }

    let metrics = &snapshot.metrics;
    println!(
        "Cost: estimated {:.2}, material {:.2}, variance {:+.2}",
        metrics.total_estimated_cost, metrics.total_material_cost, metrics.cost_variance
    );
    if let Some(rate) = metrics.overall_success_rate {
        println!("Success rate: {rate:.1}%");
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
