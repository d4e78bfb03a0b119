use std::time::Duration;

use clap::Parser;
use hookline_core::HooklineConfig;
use hookline_scheduler::MessageStore;
use tracing::info;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "hookline_gateway=info,hookline_scheduler=info,hookline_discord=info".into()
            }),
        )
        .init();

    let cli = cli::Cli::parse();

    // load config: --config > HOOKLINE_CONFIG env > ~/.hookline/hookline.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("HOOKLINE_CONFIG").ok());
    let config = HooklineConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        HooklineConfig::default()
    });

    let store = open_store(&config.database.path)?;
    let command = cli.command.unwrap_or(cli::Command::Run);
    commands::dispatch(command, store, &config).await
}

/// Open the SQLite database, creating the file and schema on first use.
fn open_store(db_path: &str) -> anyhow::Result<MessageStore> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    // several `hookline run` processes may share the file
    db.busy_timeout(Duration::from_secs(5))?;
    Ok(MessageStore::new(db)?)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
