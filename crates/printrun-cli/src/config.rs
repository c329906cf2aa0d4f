//! Configuration file management for printrun.
//!
//! Provides a TOML-based config file at `~/.config/printrun/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use printrun_core::catalog::FailureReasonCatalog;
use printrun_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub server: ServerSection,
    /// Optional replacement for the built-in failure reason list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the printrun config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/printrun` or `~/.config/printrun`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("printrun");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("printrun")
}

/// Return the path to the printrun config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // The database URL may carry a password.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct PrintrunConfig {
    pub db_config: DbConfig,
    pub bind: String,
    pub port: u16,
    pub catalog_path: Option<PathBuf>,
}

impl PrintrunConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - DB URL: `cli_db_url` > `PRINTRUN_DATABASE_URL` > `database.url` > `DbConfig::DEFAULT_URL`
    /// - Bind address: `PRINTRUN_BIND` > `server.bind` > `127.0.0.1`
    /// - Port: `PRINTRUN_PORT` > `server.port` > `3000`
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("PRINTRUN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let mut db_config = DbConfig::from_env();
        db_config.database_url = db_url;

        let bind = if let Ok(bind) = std::env::var("PRINTRUN_BIND") {
            bind
        } else if let Some(ref cfg) = file_config {
            cfg.server.bind.clone()
        } else {
            DEFAULT_BIND.to_string()
        };

        let port = if let Ok(raw) = std::env::var("PRINTRUN_PORT") {
            raw.parse()
                .with_context(|| format!("PRINTRUN_PORT is not a valid port: {raw:?}"))?
        } else if let Some(ref cfg) = file_config {
            cfg.server.port
        } else {
            DEFAULT_PORT
        };

        Ok(Self {
            db_config,
            bind,
            port,
            catalog_path: file_config.and_then(|cfg| cfg.catalog_path),
        })
    }

    /// Load the configured failure reason catalog, or the built-in one.
    pub fn failure_catalog(&self) -> Result<FailureReasonCatalog> {
        let catalog = match &self.catalog_path {
            Some(path) => FailureReasonCatalog::load(path)?,
            None => FailureReasonCatalog::builtin()?,
        };
        Ok(catalog)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    /// Point config lookups at an empty temp dir and clear the printrun env vars.
    struct IsolatedEnv {
        _tmp: tempfile::TempDir,
        orig_xdg: Option<String>,
    }

    impl IsolatedEnv {
        fn new() -> Self {
            let tmp = tempfile::TempDir::new().unwrap();
            let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
            unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
            for key in ["PRINTRUN_DATABASE_URL", "PRINTRUN_BIND", "PRINTRUN_PORT"] {
                unsafe { std::env::remove_var(key) };
            }
            Self {
                _tmp: tmp,
                orig_xdg,
            }
        }
    }

    impl Drop for IsolatedEnv {
        fn drop(&mut self) {
            match self.orig_xdg.take() {
                Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
                None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
            }
            for key in ["PRINTRUN_DATABASE_URL", "PRINTRUN_BIND", "PRINTRUN_PORT"] {
                unsafe { std::env::remove_var(key) };
            }
        }
    }

    fn sample_config() -> ConfigFile {
        ConfigFile {
            database: DatabaseSection {
                url: "postgresql://filehost:5432/filedb".to_string(),
            },
            server: ServerSection {
                bind: "0.0.0.0".to_string(),
                port: 8088,
            },
            catalog_path: None,
        }
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        save_config(&sample_config()).unwrap();
        let loaded = load_config().unwrap();

        assert_eq!(loaded.database.url, "postgresql://filehost:5432/filedb");
        assert_eq!(loaded.server.bind, "0.0.0.0");
        assert_eq!(loaded.server.port, 8088);
        assert!(loaded.catalog_path.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        save_config(&sample_config()).unwrap();

        let meta = std::fs::metadata(config_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn server_section_is_optional() {
        let parsed: ConfigFile =
            toml::from_str("[database]\nurl = \"postgresql://h:5432/db\"\n").unwrap();
        assert_eq!(parsed.server.bind, DEFAULT_BIND);
        assert_eq!(parsed.server.port, DEFAULT_PORT);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        save_config(&sample_config()).unwrap();
        unsafe { std::env::set_var("PRINTRUN_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = PrintrunConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        save_config(&sample_config()).unwrap();
        unsafe { std::env::set_var("PRINTRUN_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("PRINTRUN_PORT", "9123") };

        let config = PrintrunConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");
        assert_eq!(config.port, 9123);
        assert_eq!(config.bind, "0.0.0.0");
    }

    #[test]
    fn resolve_falls_back_to_config_file() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        save_config(&sample_config()).unwrap();

        let config = PrintrunConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://filehost:5432/filedb");
        assert_eq!(config.port, 8088);
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        let config = PrintrunConfig::resolve(None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.failure_catalog().unwrap().reasons().len(), 12);
    }

    #[test]
    fn resolve_rejects_bad_port() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();
        unsafe { std::env::set_var("PRINTRUN_PORT", "not-a-port") };

        let err = PrintrunConfig::resolve(None).unwrap_err();
        assert!(
            err.to_string().contains("PRINTRUN_PORT"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn custom_catalog_path_is_loaded() {
        let _lock = lock_env();
        let _env = IsolatedEnv::new();

        let dir = config_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let catalog = dir.join("reasons.toml");
        std::fs::write(
            &catalog,
            "[[reasons]]\nvalue = \"resin_spill\"\nlabel = \"Resin spill\"\n",
        )
        .unwrap();
        let mut cfg = sample_config();
        cfg.catalog_path = Some(catalog);
        save_config(&cfg).unwrap();

        let config = PrintrunConfig::resolve(None).unwrap();
        let loaded = config.failure_catalog().unwrap();
        assert!(loaded.contains("resin_spill"));
        assert!(!loaded.contains("spaghetti"));
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("printrun/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
