use std::{process, time::Duration};

use gateway_cache::{
    cache::{CacheConfig, CacheStore, GlobPattern},
    config::{self, Command, FlushArgs, GetArgs, RemoveArgs, SetArgs},
    infra::{error::InfraError, telemetry},
};
use serde_json::Value;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    telemetry::init(&settings.logging)?;

    let cache_config = CacheConfig::from(&settings.cache);
    let store = CacheStore::connect(&cache_config).await?;
    info!(
        cache = store.backend_name(),
        namespace = store.namespace(),
        "Cache store ready"
    );

    match cli_args.command {
        Command::Ping(_) => run_ping(&store).await,
        Command::Get(args) => run_get(&store, args).await,
        Command::Set(args) => run_set(&store, args).await,
        Command::Remove(args) => run_remove(&store, args).await,
        Command::Flush(args) => run_flush(&store, args).await,
    }
}

async fn run_ping(store: &CacheStore) -> Result<(), InfraError> {
    store.ping().await?;
    println!("PONG");
    Ok(())
}

async fn run_get(store: &CacheStore, args: GetArgs) -> Result<(), InfraError> {
    match store.get::<Value>(&args.key).await? {
        Some(value) => println!("{value:#}"),
        None => info!(key = %args.key, "Key not found"),
    }
    Ok(())
}

async fn run_set(store: &CacheStore, args: SetArgs) -> Result<(), InfraError> {
    let value: Value = serde_json::from_str(&args.value)
        .map_err(|err| InfraError::input(format!("value is not valid JSON: {err}")))?;
    let ttl = args.ttl_seconds.map(Duration::from_secs);

    store.set(&args.key, &value, ttl).await?;
    info!(key = %args.key, ttl_seconds = ?args.ttl_seconds, "Stored value");
    Ok(())
}

async fn run_remove(store: &CacheStore, args: RemoveArgs) -> Result<(), InfraError> {
    store.remove(&args.key).await?;
    info!(key = %args.key, "Removed key");
    Ok(())
}

async fn run_flush(store: &CacheStore, args: FlushArgs) -> Result<(), InfraError> {
    let pattern = GlobPattern::new(args.pattern);
    let removed = store.flush(&pattern).await?;
    println!("{removed}");
    info!(pattern = %pattern, removed, "Flushed keys");
    Ok(())
}
