mod config;
mod inventory_cmds;
mod run_cmds;
mod serve_cmd;

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};

use printrun_core::ledger::SpoolUsage;
use printrun_db::models::{CancelMode, RunStatus};
use printrun_db::pool;

use config::PrintrunConfig;

#[derive(Parser)]
#[command(
    name = "printrun",
    about = "Production run lifecycle and filament reconciliation"
)]
struct Cli {
    /// Database URL (overrides PRINTRUN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a printrun config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/printrun")]
        db_url: String,
        /// Address the HTTP server binds to
        #[arg(long, default_value = config::DEFAULT_BIND)]
        bind: String,
        /// Port the HTTP server listens on
        #[arg(long, default_value_t = config::DEFAULT_PORT)]
        port: u16,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the printrun database (requires config file or env vars)
    DbInit,
    /// Serve the JSON API
    Serve {
        /// Bind address (overrides PRINTRUN_BIND and the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Port (overrides PRINTRUN_PORT and the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// List runs, or show one run in detail
    Runs {
        /// Run ID to show
        run_id: Option<String>,
        /// Only list runs in this status
        #[arg(long)]
        status: Option<RunStatus>,
    },
    /// Complete a run and deduct the measured filament
    Complete {
        /// Run ID
        run_id: String,
    },
    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: String,
        /// full_reversal or record_partial
        #[arg(long)]
        mode: CancelMode,
        /// Filament already used, as SPOOL_ID=GRAMS (repeatable)
        #[arg(long = "usage", value_parser = run_cmds::parse_usage)]
        usage: Vec<SpoolUsage>,
        /// Notes appended to the run
        #[arg(long)]
        notes: Option<String>,
    },
    /// Mark a run failed
    Fail {
        /// Run ID
        run_id: String,
        /// Failure reason (see `printrun reasons`)
        #[arg(long)]
        reason: String,
        /// Wasted filament, as SPOOL_ID=GRAMS (repeatable)
        #[arg(long = "waste", value_parser = run_cmds::parse_usage)]
        waste: Vec<SpoolUsage>,
        /// Notes appended to the run
        #[arg(long)]
        notes: Option<String>,
    },
    /// List the accepted failure reasons
    Reasons,
    /// List spools and their remaining weight
    Spools,
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

/// Execute the `printrun init` command: write config file.
fn cmd_init(db_url: &str, bind: &str, port: u16, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        server: config::ServerSection {
            bind: bind.to_string(),
            port,
        },
        catalog_path: None,
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  server = {bind}:{port}");
    println!();
    println!("Next: run `printrun db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `printrun db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = PrintrunConfig::resolve(cli_db_url)?;

    println!("Initializing printrun database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("printrun db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            db_url,
            bind,
            port,
            force,
        } => {
            cmd_init(&db_url, &bind, port, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            let catalog = resolved.failure_catalog()?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let state = serve_cmd::AppState {
                pool: db_pool.clone(),
                catalog: Arc::new(catalog),
            };
            let bind = bind.unwrap_or(resolved.bind);
            let port = port.unwrap_or(resolved.port);
            let result = serve_cmd::run_serve(state, &bind, port).await;
            db_pool.close().await;
            result?;
        }
        Commands::Runs { run_id, status } => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmds::run_runs(&db_pool, run_id.as_deref(), status).await;
            db_pool.close().await;
            result?;
        }
        Commands::Complete { run_id } => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmds::run_complete(&db_pool, &run_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Cancel {
            run_id,
            mode,
            usage,
            notes,
        } => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmds::run_cancel(&db_pool, &run_id, mode, usage, notes).await;
            db_pool.close().await;
            result?;
        }
        Commands::Fail {
            run_id,
            reason,
            waste,
            notes,
        } => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            let catalog = resolved.failure_catalog()?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                run_cmds::run_fail(&db_pool, &catalog, &run_id, reason, waste, notes).await;
            db_pool.close().await;
            result?;
        }
        Commands::Reasons => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            inventory_cmds::run_reasons(&resolved.failure_catalog()?);
        }
        Commands::Spools => {
            let resolved = PrintrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = inventory_cmds::run_spools(&db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "printrun", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
