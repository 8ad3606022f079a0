//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::{NonZeroU16, NonZeroU64, NonZeroUsize},
    str::FromStr,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheBackendKind, CacheConfig, MiddlewareConfig};

pub use cli::{
    CacheOverrides, CliArgs, Command, FlushArgs, GetArgs, PingArgs, RemoveArgs, SetArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "gateway-cache";
const ENV_PREFIX: &str = "GATEWAY_CACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub loader: LoaderSettings,
    pub middleware: MiddlewareSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackendKind,
    pub host: String,
    pub port: NonZeroU16,
    pub database: i64,
    /// Zero stores entries without expiry.
    pub default_ttl_seconds: u64,
    pub pool_size: NonZeroUsize,
    pub scan_count: NonZeroUsize,
    pub operation_timeout_ms: NonZeroU64,
    pub namespace: String,
    pub capacity: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub max_batch_size: Option<NonZeroUsize>,
}

#[derive(Debug, Clone)]
pub struct MiddlewareSettings {
    pub enabled: bool,
    pub read_ttl_seconds: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli.command.overrides());

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    loader: RawLoaderSettings,
    middleware: RawMiddlewareSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(host) = overrides.cache_host.as_ref() {
            self.cache.host = Some(host.clone());
        }
        if let Some(port) = overrides.cache_port {
            self.cache.port = Some(port);
        }
        if let Some(database) = overrides.cache_database {
            self.cache.database = Some(database);
        }
        if let Some(namespace) = overrides.cache_namespace.as_ref() {
            self.cache.namespace = Some(namespace.clone());
        }
        if let Some(timeout) = overrides.cache_operation_timeout_ms {
            self.cache.operation_timeout_ms = Some(timeout);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            loader,
            middleware,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            loader: build_loader_settings(loader)?,
            middleware: build_middleware_settings(middleware),
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let backend = match cache.backend.as_deref().map(str::trim) {
        None => defaults.backend,
        Some(value) if value.eq_ignore_ascii_case("redis") => CacheBackendKind::Redis,
        Some(value) if value.eq_ignore_ascii_case("memory") => CacheBackendKind::Memory,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}` (expected `redis` or `memory`)"),
            ));
        }
    };

    let host = cache
        .host
        .map(|value| value.trim().to_string())
        .unwrap_or(defaults.host);
    if host.is_empty() {
        return Err(LoadError::invalid("cache.host", "host must not be empty"));
    }

    let port = NonZeroU16::new(cache.port.unwrap_or(defaults.port))
        .ok_or_else(|| LoadError::invalid("cache.port", "port must be greater than zero"))?;

    let database = cache.database.unwrap_or(defaults.database);
    if database < 0 {
        return Err(LoadError::invalid(
            "cache.database",
            "database index must not be negative",
        ));
    }

    let pool_size = non_zero_usize(
        cache.pool_size.unwrap_or(defaults.pool_size as u64),
        "cache.pool_size",
    )?;
    let scan_count = non_zero_usize(
        cache.scan_count.unwrap_or(defaults.scan_count as u64),
        "cache.scan_count",
    )?;
    let capacity = non_zero_usize(
        cache.capacity.unwrap_or(defaults.capacity as u64),
        "cache.capacity",
    )?;
    let operation_timeout_ms = NonZeroU64::new(
        cache
            .operation_timeout_ms
            .unwrap_or(defaults.operation_timeout_ms),
    )
    .ok_or_else(|| LoadError::invalid("cache.operation_timeout_ms", "must be greater than zero"))?;

    Ok(CacheSettings {
        backend,
        host,
        port,
        database,
        default_ttl_seconds: cache
            .default_ttl_seconds
            .unwrap_or(defaults.default_ttl_seconds),
        pool_size,
        scan_count,
        operation_timeout_ms,
        namespace: cache.namespace.unwrap_or(defaults.namespace),
        capacity,
    })
}

fn build_loader_settings(loader: RawLoaderSettings) -> Result<LoaderSettings, LoadError> {
    let max_batch_size = match loader.max_batch_size {
        None | Some(0) => None,
        Some(value) => Some(non_zero_usize(value, "loader.max_batch_size")?),
    };
    Ok(LoaderSettings { max_batch_size })
}

fn build_middleware_settings(middleware: RawMiddlewareSettings) -> MiddlewareSettings {
    let defaults = MiddlewareConfig::default();
    MiddlewareSettings {
        enabled: middleware.enabled.unwrap_or(defaults.enabled),
        read_ttl_seconds: middleware
            .read_ttl_seconds
            .unwrap_or(defaults.read_ttl_seconds),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    database: Option<i64>,
    default_ttl_seconds: Option<u64>,
    pool_size: Option<u64>,
    scan_count: Option<u64>,
    operation_timeout_ms: Option<u64>,
    namespace: Option<String>,
    capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoaderSettings {
    max_batch_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMiddlewareSettings {
    enabled: Option<bool>,
    read_ttl_seconds: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
