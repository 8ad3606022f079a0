use super::*;

fn parse(args: &[&str]) -> CliArgs {
    CliArgs::parse_from(args)
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.backend, CacheBackendKind::Redis);
    assert_eq!(settings.cache.host, "127.0.0.1");
    assert_eq!(settings.cache.port.get(), 6379);
    assert_eq!(settings.cache.default_ttl_seconds, 300);
    assert_eq!(settings.cache.pool_size.get(), 4);
    assert_eq!(settings.cache.scan_count.get(), 100);
    assert!(settings.cache.namespace.is_empty());
    assert!(settings.loader.max_batch_size.is_none());
    assert!(settings.middleware.enabled);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.port = Some(6380);
    raw.logging.level = Some("info".to_string());

    let overrides = CacheOverrides {
        cache_port: Some(7000),
        cache_namespace: Some("gw:".to_string()),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.port.get(), 7000);
    assert_eq!(settings.cache.namespace, "gw:");
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = CacheOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_values_are_rejected() {
    let cases: [(&str, fn(&mut RawCacheSettings)); 5] = [
        ("cache.port", |cache| cache.port = Some(0)),
        ("cache.pool_size", |cache| cache.pool_size = Some(0)),
        ("cache.scan_count", |cache| cache.scan_count = Some(0)),
        ("cache.operation_timeout_ms", |cache| {
            cache.operation_timeout_ms = Some(0)
        }),
        ("cache.capacity", |cache| cache.capacity = Some(0)),
    ];

    for (expected, mutate) in cases {
        let mut raw = RawSettings::default();
        mutate(&mut raw.cache);
        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected),
            other => panic!("expected invalid {expected}, got {other:?}"),
        }
    }
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("memcached".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.backend",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.cache.backend = Some("Memory".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.backend, CacheBackendKind::Memory);
}

#[test]
fn negative_database_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.database = Some(-1);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.database",
            ..
        })
    ));
}

#[test]
fn zero_batch_size_means_unbounded() {
    let mut raw = RawSettings::default();
    raw.loader.max_batch_size = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.loader.max_batch_size.is_none());

    let mut raw = RawSettings::default();
    raw.loader.max_batch_size = Some(50);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.loader.max_batch_size.map(NonZeroUsize::get), Some(50));
}

#[test]
fn cache_config_mirrors_settings() {
    let mut raw = RawSettings::default();
    raw.cache.host = Some("cache.internal".to_string());
    raw.cache.default_ttl_seconds = Some(0);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = CacheConfig::from(&settings.cache);
    assert_eq!(config.host, "cache.internal");
    assert_eq!(config.default_ttl(), None);
    assert_eq!(config.redis_url(), "redis://cache.internal:6379/0");
}

#[test]
fn parse_set_arguments() {
    let args = parse(&[
        "gateway-cache",
        "set",
        "--ttl-seconds",
        "60",
        "--cache-namespace",
        "gw:",
        "user:1",
        r#"{"id":1}"#,
    ]);

    match args.command {
        Command::Set(set) => {
            assert_eq!(set.key, "user:1");
            assert_eq!(set.value, r#"{"id":1}"#);
            assert_eq!(set.ttl_seconds, Some(60));
            assert_eq!(set.overrides.cache_namespace.as_deref(), Some("gw:"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_flush_arguments() {
    let args = parse(&[
        "gateway-cache",
        "--config-file",
        "/etc/gateway-cache.toml",
        "flush",
        "test*",
    ]);

    assert_eq!(
        args.config_file.as_deref(),
        Some(std::path::Path::new("/etc/gateway-cache.toml"))
    );
    match args.command {
        Command::Flush(flush) => assert_eq!(flush.pattern, "test*"),
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn overrides_are_reachable_from_every_command() {
    let args = parse(&["gateway-cache", "ping", "--cache-host", "10.0.0.5"]);
    assert_eq!(args.command.overrides().cache_host.as_deref(), Some("10.0.0.5"));
}
