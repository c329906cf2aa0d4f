//! `printrun reasons` and `printrun spools`: read-only reference listings.

use anyhow::Result;
use sqlx::PgPool;

use printrun_core::catalog::FailureReasonCatalog;
use printrun_core::ledger::spool_balances;

/// Print the failure reasons accepted by `printrun fail`.
pub fn run_reasons(catalog: &FailureReasonCatalog) {
    let width = catalog
        .reasons()
        .iter()
        .map(|r| r.value.len())
        .max()
        .unwrap_or(0);
    for reason in catalog.reasons() {
        if reason.description.is_empty() {
            println!("{:<width$}  {}", reason.value, reason.label);
        } else {
            println!(
                "{:<width$}  {} -- {}",
                reason.value, reason.label, reason.description
            );
        }
    }
}

/// Print every spool with its remaining weight, lifetime deductions and price.
pub async fn run_spools(pool: &PgPool) -> Result<()> {
    let balances = spool_balances(pool).await?;

    if balances.is_empty() {
        println!("No spools registered.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<8} {:>12} {:>12} {:>10}",
        "ID", "LABEL", "TYPE", "REMAINING", "DEDUCTED", "PER GRAM"
    );
    println!("{}", "-".repeat(109));
    for balance in &balances {
        let spool = &balance.spool;
        let label = if spool.label.chars().count() > 22 {
            format!("{}...", spool.label.chars().take(19).collect::<String>())
        } else {
            spool.label.clone()
        };
        println!(
            "{:<38} {:<24} {:<8} {:>10.1} g {:>10.1} g {:>10.4}",
            spool.id,
            label,
            spool.material_type,
            spool.current_weight_grams,
            balance.deducted_grams,
            spool.cost_per_gram
        );
    }

    Ok(())
}
