//! Persistence layer for production runs, their items, materials and plates,
//! the spool inventory, and the deduction journal.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
