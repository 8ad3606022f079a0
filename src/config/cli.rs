use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the gateway-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "gateway-cache",
    version,
    about = "Inspect and maintain the gateway response cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "GATEWAY_CACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Check that the cache backend answers.
    Ping(PingArgs),
    /// Print the JSON value stored under a key.
    Get(GetArgs),
    /// Store a JSON value under a key.
    Set(SetArgs),
    /// Delete a single key.
    Remove(RemoveArgs),
    /// Delete every key matching a glob pattern (`*` matches anything).
    Flush(FlushArgs),
}

impl Command {
    pub fn overrides(&self) -> &CacheOverrides {
        match self {
            Self::Ping(args) => &args.overrides,
            Self::Get(args) => &args.overrides,
            Self::Set(args) => &args.overrides,
            Self::Remove(args) => &args.overrides,
            Self::Flush(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the cache host.
    #[arg(long = "cache-host", value_name = "HOST")]
    pub cache_host: Option<String>,

    /// Override the cache port.
    #[arg(long = "cache-port", value_name = "PORT")]
    pub cache_port: Option<u16>,

    /// Override the cache database index.
    #[arg(long = "cache-database", value_name = "INDEX")]
    pub cache_database: Option<i64>,

    /// Override the key namespace.
    #[arg(long = "cache-namespace", value_name = "PREFIX")]
    pub cache_namespace: Option<String>,

    /// Override the per-operation timeout.
    #[arg(long = "cache-operation-timeout-ms", value_name = "MILLIS")]
    pub cache_operation_timeout_ms: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PingArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Key to read (without namespace).
    #[arg(value_name = "KEY")]
    pub key: String,
}

#[derive(Debug, Args, Clone)]
pub struct SetArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Key to write (without namespace).
    #[arg(value_name = "KEY")]
    pub key: String,

    /// JSON document to store.
    #[arg(value_name = "JSON")]
    pub value: String,

    /// Expire the entry after this many seconds instead of the default TTL.
    #[arg(long = "ttl-seconds", value_name = "SECONDS")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct RemoveArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Key to delete (without namespace).
    #[arg(value_name = "KEY")]
    pub key: String,
}

#[derive(Debug, Args, Clone)]
pub struct FlushArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Glob pattern over keys (without namespace).
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}
