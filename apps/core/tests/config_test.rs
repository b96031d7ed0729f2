use searchy_core::config::{self, Config, ConfigError, EmptyQueryPolicy};

#[test]
fn accepts_default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.backend.base_port, 7860);
    assert_eq!(cfg.search.debounce_ms, 400);
    assert!(cfg.config_path.to_string_lossy().contains("searchy"));
    assert!(config::validate(&cfg).is_ok());
}

#[test]
fn rejects_zero_health_attempts() {
    let mut cfg = Config::default();
    cfg.health.max_attempts = 0;
    assert!(config::validate(&cfg).is_err());
}

#[test]
fn rejects_port_range_past_u16() {
    let mut cfg = Config::default();
    cfg.backend.base_port = 65_530;
    cfg.backend.port_retries = 10;
    assert!(config::validate(&cfg).is_err());
}

#[test]
fn rejects_non_loopback_backend_host() {
    let mut cfg = Config::default();
    cfg.backend.host = "192.168.1.20".to_string();
    let error = config::validate(&cfg).unwrap_err();
    assert!(error.contains("backend.host"));

    cfg.backend.host = "search.example.net".to_string();
    assert!(config::validate(&cfg).is_err());

    cfg.backend.host = "localhost".to_string();
    assert!(config::validate(&cfg).is_ok());
}

#[test]
fn rejects_reserved_hotkey() {
    let cfg = Config {
        hotkey: "Alt+F4".to_string(),
        ..Default::default()
    };
    let error = config::validate(&cfg).unwrap_err();
    assert!(error.contains("hotkey"));
}

#[test]
fn missing_file_loads_defaults_with_that_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let cfg = config::load(Some(&path)).unwrap();

    assert_eq!(cfg.config_path, path);
    assert_eq!(cfg.backend, Config::default().backend);
}

#[test]
fn partial_file_fills_remaining_fields_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "hotkey = \"ctrl+alt+k\"\n[search]\nempty_query = \"clear\"\ndebounce_ms = 150\n",
    )
    .unwrap();

    let cfg = config::load(Some(&path)).unwrap();

    assert_eq!(cfg.hotkey, "ctrl+alt+k");
    assert_eq!(cfg.search.empty_query, EmptyQueryPolicy::Clear);
    assert_eq!(cfg.search.debounce_ms, 150);
    assert_eq!(cfg.search.default_limit, 40);
}

#[test]
fn invalid_file_is_reported_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[cache]\nmax_bytes = 0\n").unwrap();

    assert!(matches!(
        config::load(Some(&path)),
        Err(ConfigError::Invalid(_))
    ));

    std::fs::write(&path, "hotkey = [").unwrap();
    assert!(matches!(config::load(Some(&path)), Err(ConfigError::Parse(_))));
}

#[test]
fn save_then_load_preserves_changes() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = Config {
        config_path: dir.path().join("nested").join("config.toml"),
        ..Default::default()
    };
    cfg.backend.program = "/opt/searchy/backend".to_string();
    cfg.cache.max_bytes = 8 * 1024 * 1024;

    config::save(&cfg).unwrap();
    let loaded = config::load(Some(&cfg.config_path)).unwrap();

    assert_eq!(loaded, cfg);
}
