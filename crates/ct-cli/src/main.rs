use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ct_cli::commands::{calculate, import, observe, status};
use ct_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(ct_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = ct_db::Database::open(&config.database_path).with_context(|| {
        format!("failed to open database {}", config.database_path.display())
    })?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr so JSON output stays parseable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();
    match &cli.command {
        Some(Commands::Calculate { period, json }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            calculate::run(&mut stdout, &mut db, &config, (*period).into(), *json)?;
        }
        Some(Commands::Status { json }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &mut db, &config, *json)?;
        }
        Some(Commands::Observe(args)) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            observe::run(&mut stdout, &mut db, args, chrono::Utc::now())?;
        }
        Some(Commands::Import { file }) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            import::run(&mut stdout, &mut db, file)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
