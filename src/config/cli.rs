//! Command line arguments
//! 命令行参数

use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "hydra-pool",
    version,
    about = "Hydra Pool - elastic pool of AI backend instances\nHydra Pool - 弹性 AI 后端实例池"
)]
pub struct CliArgs {
    /// Configuration file path / 配置文件路径
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Minimum instances / 最小实例数
    #[arg(long, value_name = "N")]
    pub min_instances: Option<usize>,

    /// Maximum instances / 最大实例数
    #[arg(long, value_name = "N")]
    pub max_instances: Option<usize>,

    #[arg(
        long,
        value_name = "STRATEGY",
        help = "Load balancing strategy (least_loaded, round_robin, agent_affinity) / 负载均衡策略"
    )]
    pub strategy: Option<String>,

    /// Enable hedged execution / 启用对冲执行
    #[arg(long)]
    pub hedging: Option<bool>,

    /// Default model / 默认模型
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Backend executable / 后端可执行文件
    #[arg(long, value_name = "PROGRAM")]
    pub program: Option<String>,

    #[arg(long, value_name = "LEVEL", help = "Log level (trace, debug, info, warn, error) / 日志级别")]
    pub log_level: Option<String>,

    #[arg(long, value_name = "FORMAT", help = "Log format (json, compact, pretty) / 日志格式")]
    pub log_format: Option<String>,

    /// Agent tag attached to every prompt / 附加到每个提示词的代理标签
    #[arg(long, value_name = "AGENT")]
    pub agent: Option<String>,

    /// Read additional prompts from stdin, one per line / 从标准输入逐行读取提示词
    #[arg(long)]
    pub stdin: bool,

    /// Prompts to run / 要执行的提示词
    #[arg(value_name = "PROMPT")]
    pub prompts: Vec<String>,
}

/// Pool overrides / 池参数覆盖
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_instances: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hedging_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// Sparse CLI layer merged last / 最后合并的命令行覆盖层
#[derive(Debug, Clone, Default, Serialize)]
pub struct CliOverrides {
    pub pool: PoolOverrides,
    pub backend: BackendOverrides,
    pub logging: LogOverrides,
}

impl CliArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            pool: PoolOverrides {
                min_instances: self.min_instances,
                max_instances: self.max_instances,
                strategy: self.strategy.clone(),
                hedging_enabled: self.hedging,
                default_model: self.model.clone(),
            },
            backend: BackendOverrides {
                program: self.program.clone(),
            },
            logging: LogOverrides {
                level: self.log_level.clone(),
                format: self.log_format.clone(),
            },
        }
    }
}
