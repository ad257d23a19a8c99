//! Backend boundary
//! 后端边界
//!
//! The pool never runs prompts itself. It drives an injected
//! [`ExecutionBackend`], translates logical model names through a
//! [`ModelResolver`] and annotates failures through an [`ErrorDiagnoser`].
//! 池本身不执行提示词，而是驱动注入的后端、解析模型名并诊断错误。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// One backend call / 一次后端调用
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub prompt: String,
    /// Concrete model identifier / 具体模型标识
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    pub agent: Option<String>,
    pub correlation_id: String,
    /// Fires when the task is cancelled, timed out or reaped / 任务被取消、超时或回收时触发
    pub cancel: CancellationToken,
}

/// Terminal message produced by a completed backend call / 后端调用完成时的结果消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl ResultMessage {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            kind: "result".to_string(),
            subtype: Some("success".to_string()),
            result: Some(result.into()),
            cost_usd: None,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// A result whose subtype names an error (e.g. `error_max_turns`) / 子类型表示错误的结果
    pub fn is_error(&self) -> bool {
        self.subtype
            .as_deref()
            .map(|s| s.starts_with("error"))
            .unwrap_or(false)
    }
}

/// Raw outcome of a backend call that did not throw / 未抛出异常的后端调用原始结果
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    /// The backend reported an error / 后端报告的错误
    Error {
        message: String,
        stderr_output: Option<String>,
    },
    Completed {
        result_message: ResultMessage,
        backend_version: Option<String>,
    },
}

impl RawResult {
    pub fn completed(result_message: ResultMessage) -> Self {
        RawResult::Completed {
            result_message,
            backend_version: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RawResult::Error {
            message: message.into(),
            stderr_output: None,
        }
    }
}

/// A thrown backend failure / 后端抛出的失败
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub stderr: Option<String>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stderr: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }
}

/// Executes one prompt against the external backend / 针对外部后端执行一个提示词
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name for logs / 用于日志的后端名称
    fn name(&self) -> &str {
        "backend"
    }

    /// Readiness probe run while an instance spawns / 实例启动时执行的就绪探测
    async fn probe(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn execute(&self, request: BackendRequest) -> Result<RawResult, BackendError>;
}

/// Translates a logical model alias to a concrete identifier / 将逻辑模型别名转换为具体标识
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, logical_name: &str) -> String;
}

/// Alias table; unknown names pass through unchanged / 别名表，未知名称原样返回
#[derive(Debug, Clone, Default)]
pub struct StaticModelResolver {
    aliases: HashMap<String, String>,
}

impl StaticModelResolver {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }
}

impl ModelResolver for StaticModelResolver {
    fn resolve(&self, logical_name: &str) -> String {
        self.aliases
            .get(logical_name)
            .cloned()
            .unwrap_or_else(|| logical_name.to_string())
    }
}

/// Human-readable diagnosis of a failure / 失败的可读诊断
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub error_type: String,
    pub suggestions: Vec<String>,
}

/// Classifies backend errors. Advisory only, never affects control flow.
/// 对后端错误分类，仅用于提示，不影响控制流。
pub trait ErrorDiagnoser: Send + Sync {
    fn diagnose(&self, message: &str, stderr: Option<&str>) -> Diagnosis;
}

/// Keyword-based diagnoser / 基于关键字的诊断器
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternDiagnoser;

const PATTERNS: &[(&str, &[&str], &[&str])] = &[
    (
        "rate_limit",
        &["rate limit", "429", "too many requests", "overloaded"],
        &["Reduce request rate or enable the pool rate limiter", "Retry after a short delay"],
    ),
    (
        "auth",
        &["unauthorized", "401", "403", "api key", "authentication", "forbidden"],
        &["Check backend credentials", "Verify the API key is exported to the backend process"],
    ),
    (
        "timeout",
        &["timeout", "timed out", "deadline"],
        &["Increase the task timeout", "Split the prompt into smaller tasks"],
    ),
    (
        "network",
        &["connection refused", "connection reset", "network", "dns", "econnrefused"],
        &["Check network connectivity to the backend", "Retry once connectivity is restored"],
    ),
    (
        "model_not_found",
        &["model not found", "unknown model", "invalid model"],
        &["Check the model alias table", "Use a model the backend supports"],
    ),
    (
        "spawn",
        &["no such file", "not found in path", "permission denied", "failed to spawn"],
        &["Check that the backend executable is installed and on PATH"],
    ),
];

impl ErrorDiagnoser for PatternDiagnoser {
    fn diagnose(&self, message: &str, stderr: Option<&str>) -> Diagnosis {
        let haystack = format!("{} {}", message, stderr.unwrap_or_default()).to_lowercase();
        for (error_type, needles, suggestions) in PATTERNS {
            if needles.iter().any(|n| haystack.contains(n)) {
                return Diagnosis {
                    error_type: error_type.to_string(),
                    suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
                };
            }
        }
        Diagnosis {
            error_type: "unknown".to_string(),
            suggestions: vec!["Inspect backend stderr output for details".to_string()],
        }
    }
}
