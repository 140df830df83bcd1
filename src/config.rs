use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::runtime::{EngineSettings, QueueConfig, WorkerSettings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Runs executed concurrently by this process
    #[arg(long, env = "N_JOBS_PER_WORKER")]
    pub workers: Option<u64>,

    /// Attempts per run before it is marked as failed
    #[arg(long, env = "BG_JOB_MAX_RETRIES")]
    pub max_attempts: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long, env = "BG_JOB_TIMEOUT_SECS")]
    pub job_timeout_secs: Option<u64>,

    /// Checkpoint persistence provider (memory | postgres)
    #[arg(long, env = "PERSISTENCE_PROVIDER")]
    pub persistence_provider: Option<String>,

    /// Postgres connection string for the postgres provider
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub stream: StreamConfig,
    pub persistence: PersistenceConfig,
    pub webhook: WebhookConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub job_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    pub resumable_by_default: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceProvider {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    pub provider: PersistenceProvider,
    #[serde(default)]
    pub database_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    /// Base URL that `/path` webhooks are resolved against.
    #[serde(default)]
    pub loopback_base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,
    /// Serve Prometheus metrics on this port when set.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // 1. Defaults
        let mut builder = Config::builder()
            .set_default("server.port", 8123)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("engine.workers", 10)?
            .set_default("engine.max_attempts", 3)?
            .set_default("engine.job_timeout_secs", 3600)?
            .set_default("engine.poll_interval_ms", 100)?
            .set_default("engine.shutdown_grace_secs", 180)?
            .set_default("stream.resumable_by_default", false)?
            .set_default("persistence.provider", "memory")?
            .set_default("persistence.max_connections", 5)?
            .set_default("webhook.timeout_secs", 20)?
            .set_default("telemetry.log_format", "compact")?;

        // 2. Config file: explicit path, or ./config.{yaml,toml,json} when present
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // 3. Environment variables, e.g. RUN_ENGINE_ENGINE__WORKERS=4
        builder = builder.add_source(
            Environment::with_prefix("RUN_ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI flags (and the env vars clap maps onto them) win over everything
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(workers) = cli.workers {
            builder = builder.set_override("engine.workers", workers)?;
        }
        if let Some(max_attempts) = cli.max_attempts {
            builder = builder.set_override("engine.max_attempts", max_attempts)?;
        }
        if let Some(timeout) = cli.job_timeout_secs {
            builder = builder.set_override("engine.job_timeout_secs", timeout)?;
        }
        if let Some(provider) = cli.persistence_provider {
            builder = builder.set_override("persistence.provider", provider)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            queue: QueueConfig {
                workers: self.engine.workers.max(1),
                poll_interval: Duration::from_millis(self.engine.poll_interval_ms.max(1)),
                shutdown_grace: Duration::from_secs(self.engine.shutdown_grace_secs),
            },
            worker: WorkerSettings {
                max_attempts: self.engine.max_attempts.max(1),
                job_timeout: Duration::from_secs(self.engine.job_timeout_secs),
            },
            resumable_by_default: self.stream.resumable_by_default,
        }
    }
}
