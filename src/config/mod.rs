//! Configuration management for Hydra Pool
//! Hydra Pool 的配置管理
//!
//! Layered configuration with the following precedence (highest first):
//! 分层配置，优先级从高到低：
//! 1. Command line arguments / 命令行参数
//! 2. Environment variables (`HYDRA_`, `__` separates nested keys) / 环境变量
//! 3. Configuration file (TOML) / 配置文件（TOML）
//! 4. Default values / 默认值

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Base configuration shared by all applications / 所有应用程序共享的基础配置
pub mod base;
pub mod cli;
pub use base::*;
pub use cli::{CliArgs, CliOverrides};

use crate::pool::{CommandBackendConfig, PoolConfig};

/// Config file looked up when no path is given / 未指定路径时查找的配置文件
pub const DEFAULT_CONFIG_FILE: &str = "hydra.toml";

/// Environment variable prefix / 环境变量前缀
pub const ENV_PREFIX: &str = "HYDRA_";

/// Base configuration trait / 基础配置特征
pub trait AppConfig: for<'de> Deserialize<'de> + Serialize + Clone + std::fmt::Debug {
    /// Get default configuration values / 获取默认配置值
    fn default_config() -> Self;

    /// Defaults, file and environment layers / 默认值、文件与环境变量层
    fn figment(path: Option<&Path>) -> Figment {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Figment::new()
            .merge(Serialized::defaults(Self::default_config()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load without CLI overrides / 加载配置（不含命令行覆盖）
    fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_overrides(path, &CliOverrides::default())
    }

    /// Load and apply CLI overrides on top / 加载并应用命令行覆盖
    fn load_with_overrides<T: Serialize>(path: Option<&Path>, overrides: &T) -> Result<Self> {
        if let Some(path) = path {
            if !path.exists() {
                bail!("configuration file not found: {}", path.display());
            }
        }

        let config: Self = Self::figment(path)
            .merge(Serialized::defaults(overrides))
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration / 验证配置
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Top-level configuration / 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HydraConfig {
    pub pool: PoolConfig,
    pub backend: CommandBackendConfig,
    pub logging: LogConfig,
}

impl AppConfig for HydraConfig {
    fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        self.pool
            .validate()
            .map_err(|message| anyhow::anyhow!("invalid pool configuration: {}", message))?;
        if self.backend.program.trim().is_empty() {
            bail!("invalid backend configuration: program must not be empty");
        }
        Ok(())
    }
}

/// Resolved logging settings used by [`init_tracing`] / init_tracing 使用的日志设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) / 日志级别
    pub level: String,
    /// Log format (json, compact, pretty) / 日志格式
    pub format: String,
    /// Enable file logging / 启用文件日志
    pub file_enabled: bool,
    /// Log file path / 日志文件路径
    pub file_path: Option<PathBuf>,
}

static FILE_LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_enabled: false,
            file_path: None,
        }
    }
}

type FilteredRegistry = tracing_subscriber::layer::Layered<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;
type BoxedLayer = Box<dyn tracing_subscriber::Layer<FilteredRegistry> + Send + Sync>;

fn fmt_layer<W>(format: &str, writer: W) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    use tracing_subscriber::fmt::time::uptime;
    use tracing_subscriber::Layer;

    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(uptime())
        .with_writer(writer);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.pretty().boxed(),
    }
}

/// Initialize tracing based on logging configuration
/// 基于日志配置初始化跟踪
///
/// `RUST_LOG` overrides the configured level. File output is non-blocking
/// and uses `compact` unless `json` is configured.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.level.trim().is_empty() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new(config.level.clone())
        }
    });

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(&config.format, std::io::stdout)];

    if let (true, Some(path)) = (config.file_enabled, config.file_path.as_ref()) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir: {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file: {}", path.display()))?;
        let (file_writer, guard) = tracing_appender::non_blocking(file);
        let _ = FILE_LOG_GUARD.set(guard);

        let file_format = if config.format == "json" { "json" } else { "compact" };
        layers.push(fmt_layer(file_format, file_writer));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with(ENV_PREFIX) {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(HydraConfig::load(Some(&missing)).is_err());

        let config = HydraConfig::figment(None).extract::<HydraConfig>().unwrap();
        assert_eq!(config.pool.min_instances, PoolConfig::default().min_instances);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_file_env_and_cli_precedence() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pool]\nmin_instances = 2\nmax_instances = 6\nstrategy = \"round_robin\"\n\n[logging]\nlevel = \"debug\"\n"
        )
        .unwrap();

        std::env::set_var("HYDRA_POOL__MAX_INSTANCES", "8");
        let config = HydraConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pool.min_instances, 2);
        assert_eq!(config.pool.max_instances, 8);
        assert_eq!(config.pool.strategy, crate::pool::LoadBalancingStrategy::RoundRobin);
        assert_eq!(config.logging.level, "debug");

        let mut overrides = CliOverrides::default();
        overrides.pool.max_instances = Some(3);
        let config = HydraConfig::load_with_overrides(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.pool.max_instances, 3);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_bounds_rejected() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nmin_instances = 4\nmax_instances = 2\n").unwrap();
        let err = HydraConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("invalid pool configuration"));
    }

    #[test]
    fn test_log_config_conversion() {
        let log = LogConfig {
            level: "warn".to_string(),
            format: "compact".to_string(),
            file: Some("logs/hydra.log".to_string()),
        };
        let resolved = log.to_logging_config();
        assert!(resolved.file_enabled);
        assert_eq!(resolved.file_path, Some(PathBuf::from("logs/hydra.log")));
    }
}
