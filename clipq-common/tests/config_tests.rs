//! Unit tests for configuration loading and resolution
//!
//! Tests that manipulate CLIPQ_* environment variables are marked #[serial]
//! so they never observe each other's values.

use clipq_common::config::{
    load_toml_config, resolve_database_path, resolve_provider_api_key, write_toml_config,
    ConfigResolver, ConfigSource, ProviderKind, StoreBackend, TomlConfig, ENV_CONFIG,
    ENV_DATABASE, ENV_PROVIDER_API_KEY,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;

#[test]
fn test_defaults_are_usable() {
    let config = TomlConfig::default();
    assert_eq!(config.logging.level, "info");
    assert_eq!(config.sequencer.store, StoreBackend::Sqlite);
    assert_eq!(config.provider.kind, ProviderKind::Echo);
    assert!(config.sequencer.workers > 0);
    assert!(config.queues.max_deliveries > 0);
    assert!(config.retry.max_attempts > 0);
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let config: TomlConfig = toml::from_str(
        r#"
        database_path = "/var/lib/clipq/test.db"

        [sequencer]
        workers = 9

        [provider]
        kind = "openai"
        assistant_id = "asst_123"
        "#,
    )
    .unwrap();

    assert_eq!(config.database_path, Some(PathBuf::from("/var/lib/clipq/test.db")));
    assert_eq!(config.sequencer.workers, 9);
    assert_eq!(config.sequencer.claim_ttl_secs, 900);
    assert_eq!(config.provider.kind, ProviderKind::Openai);
    assert_eq!(config.provider.assistant_id.as_deref(), Some("asst_123"));
    assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
    assert_eq!(config.queues.segments, "segments");
}

#[test]
fn test_unknown_store_backend_rejected() {
    let result: Result<TomlConfig, _> = toml::from_str("[sequencer]\nstore = \"redis\"\n");
    assert!(result.is_err());
}

#[test]
fn test_write_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("clipq.toml");

    let mut config = TomlConfig::default();
    config.sequencer.workers = 2;
    config.queues.uploads = "incoming".to_string();
    write_toml_config(&config, &path).unwrap();

    assert_eq!(load_toml_config(&path).unwrap(), config);
}

#[test]
fn test_load_reports_parse_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[sequencer\nworkers = ").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("Failed to parse"));
}

#[test]
#[serial]
fn test_cli_config_path_wins_over_env() {
    env::set_var(ENV_CONFIG, "/tmp/from-env.toml");
    let resolver = ConfigResolver::new(Some(PathBuf::from("/tmp/from-cli.toml")));
    assert_eq!(
        resolver.resolve(),
        ConfigSource::Explicit(PathBuf::from("/tmp/from-cli.toml"))
    );
    env::remove_var(ENV_CONFIG);
}

#[test]
#[serial]
fn test_explicit_missing_config_is_an_error() {
    env::remove_var(ENV_CONFIG);
    let resolver = ConfigResolver::new(Some(PathBuf::from("/nonexistent/clipq.toml")));
    assert!(resolver.load().is_err());
}

#[test]
#[serial]
fn test_env_config_path_used() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("env.toml");
    std::fs::write(&path, "[http]\nenabled = false\n").unwrap();
    env::set_var(ENV_CONFIG, &path);

    let config = ConfigResolver::new(None).load().unwrap();
    assert!(!config.http.enabled);

    env::remove_var(ENV_CONFIG);
}

#[test]
#[serial]
fn test_database_path_priority() {
    let mut config = TomlConfig::default();
    config.database_path = Some(PathBuf::from("/from/toml.db"));

    env::set_var(ENV_DATABASE, "/from/env.db");
    assert_eq!(
        resolve_database_path(Some(PathBuf::from("/from/cli.db").as_path()), &config),
        PathBuf::from("/from/cli.db")
    );
    assert_eq!(resolve_database_path(None, &config), PathBuf::from("/from/env.db"));

    env::remove_var(ENV_DATABASE);
    assert_eq!(resolve_database_path(None, &config), PathBuf::from("/from/toml.db"));

    config.database_path = None;
    let fallback = resolve_database_path(None, &config);
    assert!(fallback.ends_with("clipq.db"));
}

#[test]
#[serial]
fn test_provider_key_env_beats_toml() {
    let mut config = TomlConfig::default();
    config.provider.api_key = Some("toml-key".to_string());

    env::set_var(ENV_PROVIDER_API_KEY, "env-key");
    assert_eq!(resolve_provider_api_key(&config).as_deref(), Some("env-key"));

    env::set_var(ENV_PROVIDER_API_KEY, "   ");
    assert_eq!(resolve_provider_api_key(&config).as_deref(), Some("toml-key"));

    env::remove_var(ENV_PROVIDER_API_KEY);
    config.provider.api_key = None;
    assert_eq!(resolve_provider_api_key(&config), None);
}
