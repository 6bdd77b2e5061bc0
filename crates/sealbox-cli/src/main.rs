mod cli;
mod config;
mod storage;

use std::{fmt::Display, str::FromStr};

use crate::cli::{Command, ConfigCommand, ValueKind};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use sealbox_core::{
    codec::Structured,
    storage::{BackingStore, SecureKeyStore},
};
use sealbox_storage::SecureStorage;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_PROBE_KEY: &str = "health/probe";

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Get {
            key,
            kind,
            encrypted,
            default,
        } => {
            let storage = storage::storage_from_config(&config)?;
            let value = run_get(&storage, &key, kind, encrypted, default.as_deref()).await?;
            println!("{value}");
        }
        Command::Put {
            key,
            value,
            kind,
            encrypted,
        } => {
            let storage = storage::storage_from_config(&config)?;
            run_put(&storage, &key, &value, kind, encrypted).await?;
        }
        Command::Delete { key } => {
            let storage = storage::storage_from_config(&config)?;
            storage.delete(&key).await?;
        }
        Command::Clear => {
            let storage = storage::storage_from_config(&config)?;
            storage.clear_all().await?;
            info!("cleared all entries");
        }
        Command::Health => run_health_check(&config).await?,
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("sealbox {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

/// Runs a quick health check of the encrypted storage path.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let storage = storage::storage_from_config(config)?;
    run_store_health(&storage).await?;
    println!("Storage: ok");
    Ok(())
}

async fn run_store_health<B, S>(storage: &SecureStorage<B, S>) -> Result<()>
where
    B: BackingStore + 'static,
    S: SecureKeyStore + 'static,
{
    let payload = "ok".to_string();
    storage.put(HEALTH_PROBE_KEY, &payload, true).await?;
    let round_trip = storage.get(HEALTH_PROBE_KEY, String::new(), true).await;
    storage.delete(HEALTH_PROBE_KEY).await?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

async fn run_get<B, S>(
    storage: &SecureStorage<B, S>,
    key: &str,
    kind: ValueKind,
    encrypted: bool,
    default: Option<&str>,
) -> Result<String>
where
    B: BackingStore + 'static,
    S: SecureKeyStore + 'static,
{
    let rendered = match kind {
        ValueKind::Bool => render(storage.get(key, parse_or(default, false)?, encrypted).await),
        ValueKind::I32 => render(storage.get(key, parse_or(default, 0i32)?, encrypted).await),
        ValueKind::I64 => render(storage.get(key, parse_or(default, 0i64)?, encrypted).await),
        ValueKind::F32 => render(storage.get(key, parse_or(default, 0f32)?, encrypted).await),
        ValueKind::F64 => render(storage.get(key, parse_or(default, 0f64)?, encrypted).await),
        ValueKind::String => {
            let fallback = default.unwrap_or_default().to_string();
            storage.get(key, fallback, encrypted).await
        }
        ValueKind::Json => {
            let fallback = match default {
                Some(raw) => serde_json::from_str(raw)?,
                None => Value::Null,
            };
            let value = storage.get(key, Structured(fallback), encrypted).await;
            render(value.into_inner())
        }
    };
    Ok(rendered)
}

async fn run_put<B, S>(
    storage: &SecureStorage<B, S>,
    key: &str,
    raw: &str,
    kind: ValueKind,
    encrypted: bool,
) -> Result<()>
where
    B: BackingStore + 'static,
    S: SecureKeyStore + 'static,
{
    match kind {
        ValueKind::Bool => storage.put(key, &parse::<bool>(raw)?, encrypted).await?,
        ValueKind::I32 => storage.put(key, &parse::<i32>(raw)?, encrypted).await?,
        ValueKind::I64 => storage.put(key, &parse::<i64>(raw)?, encrypted).await?,
        ValueKind::F32 => storage.put(key, &parse::<f32>(raw)?, encrypted).await?,
        ValueKind::F64 => storage.put(key, &parse::<f64>(raw)?, encrypted).await?,
        ValueKind::String => storage.put(key, &raw.to_string(), encrypted).await?,
        ValueKind::Json => {
            let value: Value = serde_json::from_str(raw)?;
            storage.put(key, &Structured(value), encrypted).await?
        }
    }
    Ok(())
}

fn parse<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| eyre!("invalid value {raw:?}: {e}"))
}

fn parse_or<T>(raw: Option<&str>, fallback: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.map_or(Ok(fallback), parse)
}

fn render<T: Display>(value: T) -> String {
    value.to_string()
}
