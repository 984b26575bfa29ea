use anyhow::{Context, Result};
use std::path::Path;
use tidemark_core::Config;
use tidemark_migrate::{
    close_pool, connect_with_retry, load_migrations, CancellationToken, MigrationSet,
    MigrationStatus, Migrator, PostgresPool, RetryPolicy,
};
use tracing::info;

/// Read the config file, apply environment overrides and validate
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = Config::from_file(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Load definitions before any connection is attempted, so a malformed
/// file aborts the run without touching the database.
fn load_definitions(config: &Config) -> Result<MigrationSet> {
    let definitions = load_migrations(&config.migrate.dir)?;
    info!(
        dir = %config.migrate.dir.display(),
        count = definitions.len(),
        "Loaded migration files"
    );
    Ok(definitions)
}

async fn connect(config: &Config, cancel: &CancellationToken) -> Result<PostgresPool> {
    let policy = RetryPolicy::from_config(&config.connection);
    let pool = connect_with_retry(&config.database, &policy, cancel)
        .await
        .with_context(|| format!("Cannot connect to {}", config.database.display_target()))?;
    Ok(pool)
}

pub async fn run(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let definitions = load_definitions(config)?;
    let pool = connect(config, cancel).await?;

    let outcome = Migrator::new(definitions, &pool, &config.migrate.table_name)?
        .migrate(cancel)
        .await;
    close_pool(&pool, cancel).await;
    let result = outcome?;

    if result.applied.is_empty() {
        println!(
            "Database is up to date ({} migration(s) already applied)",
            result.skipped_count()
        );
    } else {
        println!("Applied {} migration(s):", result.applied_count());
        for id in &result.applied {
            println!("  {}", id);
        }
    }
    Ok(())
}

pub async fn rollback(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let definitions = load_definitions(config)?;
    let pool = connect(config, cancel).await?;

    let outcome = Migrator::new(definitions, &pool, &config.migrate.table_name)?
        .rollback(cancel)
        .await;
    close_pool(&pool, cancel).await;

    match outcome?.reverted {
        Some(id) => println!("Rolled back migration: {}", id),
        None => println!("Nothing to roll back"),
    }
    Ok(())
}

pub async fn status(config: &Config, json: bool, cancel: &CancellationToken) -> Result<()> {
    let definitions = load_definitions(config)?;
    let pool = connect(config, cancel).await?;

    let outcome = Migrator::new(definitions, &pool, &config.migrate.table_name)?
        .status(cancel)
        .await;
    close_pool(&pool, cancel).await;
    let statuses = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("Migration Status:");
    println!("================");
    for status in &statuses {
        println!("{}", format_status(status));
    }

    let pending = statuses.iter().filter(|status| status.is_pending()).count();
    println!();
    println!("{} migration(s), {} pending", statuses.len(), pending);
    Ok(())
}

fn format_status(status: &MigrationStatus) -> String {
    match status {
        MigrationStatus::Pending { id } => format!("  [pending]  {}", id),
        MigrationStatus::Applied { id, applied_at } => {
            let applied_at = applied_at.format("%Y-%m-%d %H:%M:%S UTC");
            format!("  [applied]  {}  ({})", id, applied_at)
        }
        MigrationStatus::Orphaned { id, applied_at } => format!(
            "  [orphaned] {}  ({}, no migration file)",
            id,
            applied_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
    }
}
