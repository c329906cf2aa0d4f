//! Error taxonomy for run, plate, material and inventory operations.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Result alias used across the domain services.
pub type RunResult<T> = std::result::Result<T, RunError>;

/// The kind of record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Run,
    Item,
    Material,
    Plate,
    Spool,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Run => "run",
            Self::Item => "item",
            Self::Material => "material",
            Self::Plate => "plate",
            Self::Spool => "spool",
        };
        f.write_str(s)
    }
}

/// One rejected field in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("cannot {action} {entity} {id}: current status is {current}")]
    IllegalTransition {
        entity: Entity,
        id: Uuid,
        current: String,
        action: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: Uuid },

    #[error(
        "insufficient stock on spool {spool_id}: requested {requested:.2} g, available {available:.2} g"
    )]
    InsufficientStock {
        spool_id: Uuid,
        requested: f64,
        available: f64,
    },

    #[error("{entity} {id} was modified concurrently: expected status {expected}, found {actual}")]
    ConcurrentModification {
        entity: Entity,
        id: Uuid,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl RunError {
    /// A validation error for a single field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(entity: Entity, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Field-level detail, empty for non-validation errors.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Self::Validation(fields) => fields,
            _ => &[],
        }
    }
}

impl From<sqlx::Error> for RunError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(anyhow::Error::new(err).context("database error"))
    }
}

/// Turn collected field errors into a result.
pub(crate) fn check_fields(errors: Vec<FieldError>) -> RunResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RunError::Validation(errors))
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
