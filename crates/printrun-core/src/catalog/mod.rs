//! Failure-reason catalog.
//!
//! The built-in catalog is defined in `failure_reasons.toml` and embedded in
//! the binary at compile time. Deployments may replace it with their own file
//! (see `catalog_path` in the CLI config).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One selectable failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Stable identifier stored on the run (e.g. `nozzle_clog`).
    pub value: String,
    /// Short display name.
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    reasons: Vec<FailureReason>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid catalog TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("catalog defines no failure reasons")]
    Empty,

    #[error("duplicate failure reason value: {0:?}")]
    Duplicate(String),
}

static BUILTIN_TOML: &str = include_str!("failure_reasons.toml");

/// Ordered, de-duplicated set of failure reasons.
#[derive(Debug, Clone)]
pub struct FailureReasonCatalog {
    reasons: Vec<FailureReason>,
}

impl FailureReasonCatalog {
    /// The catalog embedded at build time.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_TOML)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(s)?;
        if file.reasons.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = std::collections::HashSet::new();
        for reason in &file.reasons {
            if !seen.insert(reason.value.as_str()) {
                return Err(CatalogError::Duplicate(reason.value.clone()));
            }
        }
        Ok(Self {
            reasons: file.reasons,
        })
    }

    /// Load a catalog from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn reasons(&self) -> &[FailureReason] {
        &self.reasons
    }

    pub fn get(&self, value: &str) -> Option<&FailureReason> {
        self.reasons.iter().find(|r| r.value == value)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.get(value).is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = FailureReasonCatalog::builtin().expect("embedded catalog should parse");
        assert!(catalog.reasons().len() >= 10);
        assert!(catalog.contains("nozzle_clog"));
        assert!(catalog.contains("other"));
        assert!(!catalog.contains("gremlins"));
    }

    #[test]
    fn builtin_values_are_snake_case() {
        let catalog = FailureReasonCatalog::builtin().unwrap();
        for reason in catalog.reasons() {
            assert!(
                reason
                    .value
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c == '_'),
                "unexpected value {:?}",
                reason.value
            );
            assert!(!reason.label.is_empty());
        }
    }

    #[test]
    fn get_returns_label() {
        let catalog = FailureReasonCatalog::builtin().unwrap();
        assert_eq!(catalog.get("warping").unwrap().label, "Warping");
    }

    #[test]
    fn rejects_duplicates() {
        let toml = r#"
            [[reasons]]
            value = "jam"
            label = "Jam"

            [[reasons]]
            value = "jam"
            label = "Jam again"
        "#;
        let err = FailureReasonCatalog::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(v) if v == "jam"));
    }

    #[test]
    fn rejects_empty() {
        let err = FailureReasonCatalog::from_toml_str("reasons = []").unwrap_err();
        assert!(matches!(err, CatalogError::Empty));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[reasons]]\nvalue = \"resin_spill\"\nlabel = \"Resin spill\"\ndescription = \"Vat leaked\""
        )
        .unwrap();

        let catalog = FailureReasonCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.reasons().len(), 1);
        assert!(catalog.contains("resin_spill"));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = FailureReasonCatalog::load(Path::new("/nonexistent/reasons.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/reasons.toml"));
    }
}
