use run_engine::config::{AppConfig, LogFormat, PersistenceProvider};
use serial_test::serial;
use std::env;
use std::fs;
use std::time::Duration;

// Environment that would leak into the layered config
fn clear_env_vars() {
    unsafe {
        for key in [
            "RUN_ENGINE_SERVER__PORT",
            "RUN_ENGINE_ENGINE__WORKERS",
            "RUN_ENGINE_STREAM__RESUMABLE_BY_DEFAULT",
            "RUN_ENGINE_TELEMETRY__LOG_FORMAT",
            "CONFIG_FILE",
            "PORT",
            "N_JOBS_PER_WORKER",
            "BG_JOB_MAX_RETRIES",
            "BG_JOB_TIMEOUT_SECS",
            "PERSISTENCE_PROVIDER",
            "DATABASE_URL",
        ] {
            env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_default_config() {
    clear_env_vars();

    let config = AppConfig::load_from_args(["run-engine"]).expect("defaults should load");
    assert_eq!(config.server.port, 8123);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.engine.workers, 10);
    assert_eq!(config.engine.max_attempts, 3);
    assert_eq!(config.engine.job_timeout_secs, 3600);
    assert!(!config.stream.resumable_by_default);
    assert_eq!(config.persistence.provider, PersistenceProvider::Memory);
    assert!(config.persistence.database_url.is_none());
    assert_eq!(config.webhook.timeout_secs, 20);
    assert_eq!(config.telemetry.log_format, LogFormat::Compact);
    assert!(config.telemetry.metrics_port.is_none());

    let settings = config.engine_settings();
    assert_eq!(settings.queue.poll_interval, Duration::from_millis(100));
    assert_eq!(settings.queue.shutdown_grace, Duration::from_secs(180));
}

#[test]
#[serial]
fn test_env_override() {
    clear_env_vars();
    unsafe {
        env::set_var("RUN_ENGINE_SERVER__PORT", "9090");
        env::set_var("RUN_ENGINE_ENGINE__WORKERS", "2");
        env::set_var("RUN_ENGINE_STREAM__RESUMABLE_BY_DEFAULT", "true");
        env::set_var("RUN_ENGINE_TELEMETRY__LOG_FORMAT", "json");
    }

    let config = AppConfig::load_from_args(["run-engine"]).expect("Failed to load config");
    assert_eq!(config.server.port, 9090);
    assert_eq!(config.engine.workers, 2);
    assert!(config.stream.resumable_by_default);
    assert_eq!(config.telemetry.log_format, LogFormat::Json);

    clear_env_vars();
}

#[test]
#[serial]
fn test_file_load() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("tempdir");
    let file_path = dir.path().join("engine.yaml");
    fs::write(
        &file_path,
        r#"
server:
  port: 7070
engine:
  max_attempts: 5
persistence:
  provider: postgres
  database_url: postgres://localhost/runs
"#,
    )
    .expect("Failed to write temp config");

    let path = file_path.to_string_lossy().to_string();
    let config = AppConfig::load_from_args(["run-engine", "--config", path.as_str()])
        .expect("Failed to load config from file");
    assert_eq!(config.server.port, 7070);
    assert_eq!(config.engine.max_attempts, 5);
    assert_eq!(config.persistence.provider, PersistenceProvider::Postgres);
    assert_eq!(
        config.persistence.database_url.as_deref(),
        Some("postgres://localhost/runs")
    );
}

#[test]
#[serial]
fn test_cli_wins_over_env_and_file() {
    clear_env_vars();

    let dir = tempfile::tempdir().expect("tempdir");
    let file_path = dir.path().join("engine.yaml");
    fs::write(&file_path, "server:\n  port: 7070\n").expect("Failed to write temp config");
    unsafe {
        env::set_var("CONFIG_FILE", &file_path);
        env::set_var("RUN_ENGINE_SERVER__PORT", "9090");
    }

    let config = AppConfig::load_from_args(["run-engine", "--port", "6060", "--workers", "3"])
        .expect("Failed to load config");
    assert_eq!(config.server.port, 6060);
    assert_eq!(config.engine.workers, 3);

    clear_env_vars();
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    clear_env_vars();

    let result = AppConfig::load_from_args(["run-engine", "--config", "/nonexistent/engine.yaml"]);
    assert!(result.is_err());
}
