use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a production run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = RunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(RunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunStatus`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid run status: {0:?}")]
pub struct RunStatusParseError(pub String);

// ---------------------------------------------------------------------------

/// Status of a single plate (one print-bed job) inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlateStatus {
    Pending,
    Printing,
    Completed,
    Failed,
    Cancelled,
}

impl PlateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for PlateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Printing => "printing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for PlateStatus {
    type Err = PlateStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "printing" => Ok(Self::Printing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PlateStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlateStatus`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid plate status: {0:?}")]
pub struct PlateStatusParseError(pub String);

// ---------------------------------------------------------------------------

/// How a cancelled run treats the filament it already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Nothing was consumed; spools stay untouched.
    FullReversal,
    /// Deduct the usage the operator reports per spool.
    RecordPartial,
}

impl fmt::Display for CancelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullReversal => "full_reversal",
            Self::RecordPartial => "record_partial",
        };
        f.write_str(s)
    }
}

impl FromStr for CancelMode {
    type Err = CancelModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_reversal" => Ok(Self::FullReversal),
            "record_partial" => Ok(Self::RecordPartial),
            other => Err(CancelModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CancelMode`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid cancel mode: {0:?} (expected full_reversal or record_partial)")]
pub struct CancelModeParseError(pub String);

// ---------------------------------------------------------------------------

/// How the actual weight of a material line was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActualEntryMode {
    Manual,
    Weighing,
}

impl fmt::Display for ActualEntryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Weighing => "weighing",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Why filament left a spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeductionReason {
    /// Measured consumption of a completed run.
    Consumption,
    /// Usage reported when cancelling a run in `record_partial` mode.
    PartialUsage,
    /// Filament lost to a failed run.
    Waste,
}

impl fmt::Display for DeductionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Consumption => "consumption",
            Self::PartialUsage => "partial_usage",
            Self::Waste => "waste",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A filament spool tracked as inventory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Spool {
    pub id: Uuid,
    pub label: String,
    pub material_type: String,
    pub color: Option<String>,
    pub current_weight_grams: f64,
    pub cost_per_gram: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A production run -- the top-level unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductionRun {
    pub id: Uuid,
    pub run_number: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_hours: Option<f64>,
    pub estimated_print_time_hours: f64,
    pub printer_name: Option<String>,
    pub slicer_software: Option<String>,
    pub bed_temperature: Option<i32>,
    pub nozzle_temperature: Option<i32>,
    pub notes: Option<String>,
    pub waste_reason: Option<String>,
    pub waste_filament_grams: Option<f64>,
    pub cancel_mode: Option<CancelMode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A planned model within a run and its outcome counts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductionRunItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub model_id: Uuid,
    pub model_name: Option<String>,
    pub quantity: i32,
    pub successful_quantity: i32,
    pub failed_quantity: i32,
    pub bed_position: Option<String>,
    pub model_weight_grams: Option<f64>,
    pub estimated_cost_per_unit: Option<f64>,
    pub actual_cost_per_unit: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// One spool's estimated and measured usage within a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductionRunMaterial {
    pub id: Uuid,
    pub run_id: Uuid,
    pub spool_id: Uuid,
    pub estimated_model_weight_grams: f64,
    pub estimated_flushed_grams: Option<f64>,
    pub estimated_tower_grams: Option<f64>,
    pub estimated_total_weight: f64,
    pub estimated_cost: Option<f64>,
    pub actual_total_weight: Option<f64>,
    pub actual_entry_mode: Option<ActualEntryMode>,
    pub spool_weight_before_grams: Option<f64>,
    pub spool_weight_after_grams: Option<f64>,
    pub variance_percentage: Option<f64>,
    pub total_cost: Option<f64>,
    /// Price snapshot written when the run reaches a terminal state.
    pub cost_per_gram: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A material row joined with the spool fields needed for costing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MaterialWithSpool {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub material: ProductionRunMaterial,
    pub spool_label: String,
    pub spool_cost_per_gram: f64,
}

/// A single print-bed job within a run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductionRunPlate {
    pub id: Uuid,
    pub run_id: Uuid,
    pub model_id: Uuid,
    pub printer_id: Option<Uuid>,
    pub plate_number: i32,
    pub plate_name: String,
    pub prints_per_plate: i32,
    pub status: PlateStatus,
    pub successful_prints: i32,
    pub failed_prints: i32,
    pub print_time_minutes: Option<i32>,
    pub actual_print_time_minutes: Option<i32>,
    pub estimated_material_weight_grams: Option<f64>,
    pub actual_material_weight_grams: Option<f64>,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A journal entry for one applied spool deduction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InventoryDeduction {
    pub id: i64,
    pub run_id: Uuid,
    pub spool_id: Uuid,
    pub target_status: RunStatus,
    pub reason: DeductionReason,
    pub grams: f64,
    pub weight_before_grams: f64,
    pub weight_after_grams: f64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
