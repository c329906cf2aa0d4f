//! Query functions, one module per table.
//!
//! Single-statement helpers take any [`sqlx::PgExecutor`], so callers can pass
//! either the pool or an open transaction (`&mut *tx`).

pub mod deductions;
pub mod items;
pub mod materials;
pub mod plates;
pub mod runs;
pub mod spools;
