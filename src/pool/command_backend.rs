//! Command backend
//! 命令行后端
//!
//! Spawns one CLI process per task. The prompt and the per-task options are
//! passed as arguments; the process's stdout is parsed as a JSON result line
//! when it has one, otherwise taken verbatim.
//! 每个任务启动一个 CLI 进程，解析标准输出中的 JSON 结果行或原样使用输出。

use super::backend::{BackendError, BackendRequest, ExecutionBackend, RawResult, ResultMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Command backend configuration / 命令行后端配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandBackendConfig {
    /// Executable name or path / 可执行文件
    pub program: String,
    /// Arguments placed before the per-task flags / 位于任务参数之前的固定参数
    pub args: Vec<String>,
    pub model_flag: Option<String>,
    pub system_prompt_flag: Option<String>,
    pub max_turns_flag: Option<String>,
    /// Arguments for the readiness probe; `None` skips probing / 就绪探测参数
    pub probe_args: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
}

impl Default for CommandBackendConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            model_flag: Some("--model".to_string()),
            system_prompt_flag: Some("--system-prompt".to_string()),
            max_turns_flag: Some("--max-turns".to_string()),
            probe_args: Some(vec!["--version".to_string()]),
            working_directory: None,
            environment: HashMap::new(),
        }
    }
}

/// Per-task process backend / 每任务进程后端
#[derive(Debug, Clone)]
pub struct CommandBackend {
    config: CommandBackendConfig,
}

impl CommandBackend {
    pub fn new(config: CommandBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandBackendConfig {
        &self.config
    }

    /// Build the task command / 构建任务命令
    fn build_command(&self, request: &BackendRequest) -> Command {
        let mut command = self.base_command();
        command.args(&self.config.args);

        if let Some(flag) = &self.config.model_flag {
            command.arg(flag).arg(&request.model);
        }
        if let (Some(flag), Some(system_prompt)) = (&self.config.system_prompt_flag, &request.system_prompt) {
            command.arg(flag).arg(system_prompt);
        }
        if let (Some(flag), Some(max_turns)) = (&self.config.max_turns_flag, request.max_turns) {
            command.arg(flag).arg(max_turns.to_string());
        }
        command.arg(&request.prompt);
        command
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.config.program);
        if let Some(dir) = &self.config.working_directory {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.environment {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        command
    }
}

/// Parse process stdout into a result message / 将进程输出解析为结果消息
///
/// Scans lines from the end for a `{"type":"result",...}` object; falls back
/// to the trimmed stdout as a successful result.
pub fn parse_output(stdout: &str) -> ResultMessage {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| {
            serde_json::from_str::<ResultMessage>(line)
                .ok()
                .filter(|message| message.kind == "result")
        })
        .unwrap_or_else(|| ResultMessage::success(stdout.trim()))
}

#[async_trait]
impl ExecutionBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let Some(probe_args) = &self.config.probe_args else {
            return Ok(());
        };
        let output = self
            .base_command()
            .args(probe_args)
            .output()
            .await
            .map_err(|e| BackendError::new(format!("failed to start {}: {}", self.config.program, e)))?;

        if output.status.success() {
            debug!(
                program = %self.config.program,
                version = %String::from_utf8_lossy(&output.stdout).trim(),
                "Backend probe succeeded"
            );
            Ok(())
        } else {
            Err(BackendError::new(format!("probe exited with {}", output.status))
                .with_stderr(String::from_utf8_lossy(&output.stderr).trim()))
        }
    }

    async fn execute(&self, request: BackendRequest) -> Result<RawResult, BackendError> {
        let child = self
            .build_command(&request)
            .spawn()
            .map_err(|e| BackendError::new(format!("failed to start {}: {}", self.config.program, e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| BackendError::new(format!("failed to collect output: {}", e)))?,
            _ = request.cancel.cancelled() => {
                debug!(correlation_id = %request.correlation_id, "Task cancelled, killing process");
                return Err(BackendError::new("task cancelled"));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            warn!(
                correlation_id = %request.correlation_id,
                status = %output.status,
                "Backend process exited with failure"
            );
            return Ok(RawResult::Error {
                message: format!("{} exited with {}", self.config.program, output.status),
                stderr_output: (!stderr.is_empty()).then_some(stderr),
            });
        }

        Ok(RawResult::Completed {
            result_message: parse_output(&stdout),
            backend_version: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn request(prompt: &str) -> BackendRequest {
        BackendRequest {
            prompt: prompt.to_string(),
            model: "test-model".to_string(),
            system_prompt: None,
            max_turns: Some(2),
            agent: None,
            correlation_id: "corr-1".to_string(),
            cancel: CancellationToken::new(),
        }
    }

    fn shell(script: &str) -> CommandBackend {
        CommandBackend::new(CommandBackendConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            model_flag: None,
            system_prompt_flag: None,
            max_turns_flag: None,
            probe_args: None,
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_json_result_line() {
        let stdout = "progress...\n{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\",\"cost_usd\":0.25}\n";
        let message = parse_output(stdout);
        assert_eq!(message.result.as_deref(), Some("done"));
        assert_eq!(message.cost_usd, Some(0.25));
        assert!(!message.is_error());
    }

    #[test]
    fn test_parse_plain_output() {
        let message = parse_output("  plain answer \n");
        assert_eq!(message.result.as_deref(), Some("plain answer"));
        assert_eq!(message.kind, "result");
    }

    #[test]
    fn test_parse_ignores_non_result_json() {
        let message = parse_output("{\"type\":\"progress\"}");
        assert_eq!(message.result.as_deref(), Some("{\"type\":\"progress\"}"));
    }

    #[test]
    fn test_command_arguments() {
        let backend = CommandBackend::new(CommandBackendConfig::default());
        let mut req = request("hello");
        req.system_prompt = Some("be brief".to_string());
        let command = backend.build_command(&req);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--print",
                "--output-format",
                "json",
                "--model",
                "test-model",
                "--system-prompt",
                "be brief",
                "--max-turns",
                "2",
                "hello"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_echoes_prompt() {
        let backend = shell("echo \"$1\"");
        match backend.execute(request("ping")).await.unwrap() {
            RawResult::Completed { result_message, .. } => {
                assert_eq!(result_message.result.as_deref(), Some("ping"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_reported_error() {
        let backend = shell("echo boom >&2; exit 3");
        match backend.execute(request("x")).await.unwrap() {
            RawResult::Error { stderr_output, .. } => assert_eq!(stderr_output.as_deref(), Some("boom")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let backend = shell("sleep 30");
        let req = request("x");
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        assert!(backend.execute(req).await.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_missing_program_fails() {
        let backend = CommandBackend::new(CommandBackendConfig {
            program: "hydra-pool-definitely-missing-binary".to_string(),
            ..Default::default()
        });
        assert!(backend.probe().await.is_err());
    }
}
