use std::str::FromStr;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAME: &str = "cronkeeper";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 16;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;
pub const DEFAULT_AI_MODEL: &str = "gpt-4o";

/// Top-level config (cronkeeper.toml + CRONKEEPER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronkeeperConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ai: AiConfig,
}

/// How RPC callers reach the task management surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Newline-delimited JSON frames over stdin/stdout.
    #[default]
    Stdio,
    /// `POST /rpc` on the configured bind address.
    Http,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(Transport::Stdio),
            "http" | "sse" => Ok(Transport::Http),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stdio => write!(f, "stdio"),
            Transport::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            bind: default_bind(),
            port: DEFAULT_PORT,
            transport: Transport::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional file that receives a copy of every log line.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Scheduler loop and executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two due-task scans.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Hard deadline for a single dispatch, in seconds.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// Upper bound on dispatches started by the loop that may be in flight.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Captured command output / API body is truncated past this many chars.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution_timeout_secs.max(1))
    }
}

/// Generation provider used by `ai` tasks (OpenAI-compatible endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Falls back to `OPENAI_API_KEY` when unset. AI tasks fail without it.
    pub api_key: Option<String>,
    #[serde(default = "default_ai_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_ai_model(),
            base_url: default_openai_base_url(),
        }
    }
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}
fn default_execution_timeout() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}
fn default_max_concurrent_runs() -> usize {
    DEFAULT_MAX_CONCURRENT_RUNS
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_ai_model() -> String {
    DEFAULT_AI_MODEL.to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronkeeper/cronkeeper.db", home)
}

impl CronkeeperConfig {
    /// Load config from a TOML file with env var overrides.
    ///
    /// Layers, lowest priority first:
    ///   1. compiled defaults
    ///   2. the TOML file (explicit path, else ~/.cronkeeper/cronkeeper.toml)
    ///   3. `OPENAI_API_KEY` as `ai.api_key`
    ///   4. `CRONKEEPER_*` variables, `__` separating sections
    ///      (`CRONKEEPER_SCHEDULER__CHECK_INTERVAL_SECS=2`)
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading configuration");

        let config: CronkeeperConfig = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&path))
            .merge(
                Env::raw()
                    .only(&["OPENAI_API_KEY"])
                    .map(|_| "ai.api_key".into()),
            )
            .merge(Env::prefixed("CRONKEEPER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronkeeper/cronkeeper.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_file() {
        Jail::expect_with(|_jail| {
            let config = CronkeeperConfig::load(Some("missing.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, DEFAULT_PORT);
            assert_eq!(config.server.transport, Transport::Stdio);
            assert_eq!(config.scheduler.check_interval_secs, 5);
            assert_eq!(config.scheduler.execution_timeout_secs, 300);
            assert_eq!(config.ai.model, "gpt-4o");
            assert!(config.ai.api_key.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cronkeeper.toml",
                r#"
                [server]
                transport = "http"
                port = 9000

                [scheduler]
                check_interval_secs = 1
                "#,
            )?;
            let config =
                CronkeeperConfig::load(Some("cronkeeper.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.server.transport, Transport::Http);
            assert_eq!(config.server.port, 9000);
            assert_eq!(config.scheduler.check_interval_secs, 1);
            // untouched keys keep their defaults
            assert_eq!(config.scheduler.max_concurrent_runs, DEFAULT_MAX_CONCURRENT_RUNS);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file_and_openai_key_is_picked_up() {
        Jail::expect_with(|jail| {
            jail.create_file("cronkeeper.toml", "[ai]\nmodel = \"gpt-4o-mini\"\n")?;
            jail.set_env("OPENAI_API_KEY", "sk-test");
            jail.set_env("CRONKEEPER_SCHEDULER__EXECUTION_TIMEOUT_SECS", "42");
            jail.set_env("CRONKEEPER_AI__MODEL", "gpt-4.1");
            let config =
                CronkeeperConfig::load(Some("cronkeeper.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.ai.api_key.as_deref(), Some("sk-test"));
            assert_eq!(config.ai.model, "gpt-4.1");
            assert_eq!(config.scheduler.execution_timeout_secs, 42);
            Ok(())
        });
    }

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("HTTP".parse::<Transport>(), Ok(Transport::Http));
        assert_eq!("stdio".parse::<Transport>(), Ok(Transport::Stdio));
        assert!("carrier-pigeon".parse::<Transport>().is_err());
    }
}
