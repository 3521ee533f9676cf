use std::io::Write;

use super::*;

fn defaults() -> Settings {
    Settings::from_raw(RawSettings::default()).expect("valid settings")
}

#[test]
fn defaults_are_valid() {
    let settings = defaults();

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.prefix, "studio");
    assert_eq!(settings.cache.lock_ttl, Duration::from_secs(10));
    assert_eq!(settings.cache.background_lock_ttl, Duration::from_secs(30));
    assert_eq!(settings.cache.lock_retry_delay, Duration::from_millis(200));
    assert_eq!(settings.cache.lock_retry_attempts.get(), 50);
    assert!(settings.redis.url.is_none());
    assert_eq!(settings.redis.pool_size.get(), 16);
}

#[test]
fn json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    raw.logging.json = Some(true);
    raw.logging.level = Some("debug".to_string());

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn prefix_with_glob_metacharacters_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.prefix = Some("studio*".to_string());

    let err = Settings::from_raw(raw).expect_err("glob in prefix");
    assert!(matches!(err, LoadError::Invalid { key: "cache.prefix", .. }));
}

#[test]
fn jitter_ratio_must_stay_below_one() {
    let mut raw = RawSettings::default();
    raw.cache.jitter_ratio = Some(1.0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.jitter_ratio", .. })
    ));

    let mut raw = RawSettings::default();
    raw.cache.jitter_ratio = Some(0.0);
    assert!(Settings::from_raw(raw).is_ok());
}

#[test]
fn zero_lock_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.lock_ttl_seconds = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.lock_ttl_seconds", .. })
    ));

    let mut raw = RawSettings::default();
    raw.cache.lock_retry_attempts = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.lock_retry_attempts", .. })
    ));
}

#[test]
fn redis_url_requires_redis_scheme() {
    let mut raw = RawSettings::default();
    raw.redis.url = Some("http://localhost:6379".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "redis.url", .. })
    ));

    let mut raw = RawSettings::default();
    raw.redis.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("blank url means memory store");
    assert!(settings.redis.url.is_none());
}

#[test]
fn cache_settings_convert_to_engine_config() {
    let mut raw = RawSettings::default();
    raw.cache.prefix = Some("dir".to_string());
    raw.cache.lock_retry_delay_ms = Some(50);
    let settings = Settings::from_raw(raw).expect("valid settings");

    let config = crate::cache::CacheConfig::from(&settings.cache);
    assert_eq!(config.prefix, "dir");
    assert_eq!(config.lock_retry_delay_ms, 50);
    assert_eq!(config.lock_ttl_seconds, 10);
}

#[test]
fn settings_defaults_match_engine_defaults() {
    let settings = defaults();
    let from_settings = crate::cache::CacheConfig::from(&settings.cache);
    let engine = crate::cache::CacheConfig::default();

    assert_eq!(from_settings.prefix, engine.prefix);
    assert_eq!(from_settings.lock_ttl_seconds, engine.lock_ttl_seconds);
    assert_eq!(
        from_settings.background_lock_ttl_seconds,
        engine.background_lock_ttl_seconds
    );
    assert_eq!(from_settings.lock_retry_delay_ms, engine.lock_retry_delay_ms);
    assert_eq!(from_settings.lock_retry_attempts, engine.lock_retry_attempts);
    assert_eq!(from_settings.jitter_ratio, engine.jitter_ratio);
}

#[test]
fn explicit_file_is_loaded() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        r#"
[logging]
level = "warn"

[cache]
prefix = "directory"
lock_retry_attempts = 5

[redis]
url = "redis://cache.internal:6379/2"
pool_size = 4
"#
    )
    .expect("write config");

    let settings = load(Some(file.path())).expect("settings load");
    assert_eq!(settings.logging.level, LevelFilter::WARN);
    assert_eq!(settings.cache.prefix, "directory");
    assert_eq!(settings.cache.lock_retry_attempts.get(), 5);
    assert_eq!(
        settings.redis.url.as_deref(),
        Some("redis://cache.internal:6379/2")
    );
    assert_eq!(settings.redis.pool_size.get(), 4);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let err = load(Some(Path::new("/definitely/not/here.toml"))).expect_err("missing file");
    assert!(matches!(err, LoadError::Build(_)));
}
