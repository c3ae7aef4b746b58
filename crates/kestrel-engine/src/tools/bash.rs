use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use kestrel_core::errors::{SandboxError, ToolError};
use kestrel_core::sandbox::ExecOptions;
use kestrel_core::tools::{ExecutionMode, Tool, ToolContext, ToolMetadata};

const MAX_TIMEOUT_MS: u64 = 600_000;
const MAX_OUTPUT_BYTES: usize = 1_000_000;

/// Runs a shell command in the sandbox, in the foreground or as a background shell.
pub struct BashRunTool;

#[async_trait]
impl Tool for BashRunTool {
    fn name(&self) -> &str {
        "bash_run"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the sandbox. Set background to true for long-running \
         processes and poll them with bash_logs."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["cmd"],
            "properties": {
                "cmd": { "type": "string", "description": "Command to execute" },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (default 120000, max 600000)"
                },
                "background": {
                    "type": "boolean",
                    "description": "Run in background and return a shell_id"
                }
            }
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::mutating("execute")
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    fn permission_details(&self, args: &Value) -> Option<Value> {
        args["cmd"].as_str().map(|cmd| json!({ "cmd": cmd }))
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let cmd = args["cmd"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("cmd is required".into()))?;

        if args["background"].as_bool().unwrap_or(false) {
            let shell_id = ctx.sandbox.spawn(cmd).await?;
            return Ok(json!({
                "background": true,
                "shell_id": shell_id,
                "message": format!("Background shell started: {shell_id}"),
            }));
        }

        let timeout = args["timeout_ms"]
            .as_u64()
            .map(|ms| Duration::from_millis(ms.min(MAX_TIMEOUT_MS)));
        let result = ctx.sandbox.exec(cmd, ExecOptions { timeout }).await?;
        let output = [result.stdout.trim_end(), result.stderr.trim_end()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let output = if output.is_empty() {
            "(no output)".to_string()
        } else {
            truncate(&output)
        };
        Ok(json!({
            "background": false,
            "code": result.code,
            "output": output,
        }))
    }
}

/// Reports status and captured output of a background shell.
pub struct BashLogsTool;

#[async_trait]
impl Tool for BashLogsTool {
    fn name(&self) -> &str {
        "bash_logs"
    }

    fn description(&self) -> &str {
        "Get output from a background shell started with bash_run"
    }

    fn input_schema(&self) -> Value {
        shell_id_schema()
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::read_only()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let shell_id = shell_id(&args)?;
        let info = ctx
            .sandbox
            .process(shell_id)
            .ok_or_else(|| ToolError::ExecutionFailed(format!("Shell not found: {shell_id}")))?;
        Ok(json!({
            "shell_id": shell_id,
            "status": if info.running { "running" } else { "completed" },
            "code": info.code,
            "stdout": truncate(&info.stdout),
            "stderr": truncate(&info.stderr),
        }))
    }
}

/// Stops a background shell.
pub struct BashKillTool;

#[async_trait]
impl Tool for BashKillTool {
    fn name(&self) -> &str {
        "bash_kill"
    }

    fn description(&self) -> &str {
        "Kill a background shell started with bash_run"
    }

    fn input_schema(&self) -> Value {
        shell_id_schema()
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::mutating("execute")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let shell_id = shell_id(&args)?;
        match ctx.sandbox.kill(shell_id).await {
            Ok(()) => Ok(json!({ "shell_id": shell_id, "status": "killed" })),
            Err(SandboxError::ProcessNotFound(_)) => {
                Err(ToolError::ExecutionFailed(format!("Shell not found: {shell_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn shell_id_schema() -> Value {
    json!({
        "type": "object",
        "required": ["shell_id"],
        "properties": {
            "shell_id": { "type": "string", "description": "Shell id returned by bash_run" }
        }
    })
}

fn shell_id(args: &Value) -> Result<&str, ToolError> {
    args["shell_id"]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments("shell_id is required".into()))
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.to_string();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n[truncated: {} bytes total]", &text[..end], text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kestrel_core::ids::SessionId;
    use kestrel_core::tools::DetachedCapabilities;
    use tokio_util::sync::CancellationToken;

    use crate::sandbox::{LocalSandbox, LocalSandboxOptions};

    fn ctx(dir: &std::path::Path) -> ToolContext {
        let sandbox = LocalSandbox::new(LocalSandboxOptions::new(dir));
        ToolContext::new(
            SessionId::new(),
            "call-1",
            Arc::new(sandbox),
            CancellationToken::new(),
            Arc::new(DetachedCapabilities),
        )
    }

    #[tokio::test]
    async fn foreground_run_joins_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = BashRunTool
            .execute(json!({"cmd": "echo out; echo err >&2; exit 3"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result["background"], false);
        assert_eq!(result["code"], 3);
        assert_eq!(result["output"], "out\nerr");
    }

    #[tokio::test]
    async fn empty_output_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let result = BashRunTool
            .execute(json!({"cmd": "true"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result["output"], "(no output)");
    }

    #[tokio::test]
    async fn dangerous_command_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let result = BashRunTool
            .execute(json!({"cmd": "sudo ls"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(result["code"], 1);
        assert!(result["output"]
            .as_str()
            .unwrap()
            .starts_with("Dangerous command blocked for security"));
    }

    #[tokio::test]
    async fn background_shell_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let started = BashRunTool
            .execute(json!({"cmd": "sleep 30", "background": true}), &ctx)
            .await
            .unwrap();
        let shell_id = started["shell_id"].as_str().unwrap().to_string();
        assert!(shell_id.starts_with("shell-"));

        let logs = BashLogsTool.execute(json!({"shell_id": shell_id}), &ctx).await.unwrap();
        assert_eq!(logs["status"], "running");

        let killed = BashKillTool.execute(json!({"shell_id": shell_id}), &ctx).await.unwrap();
        assert_eq!(killed["status"], "killed");
        let logs = BashLogsTool.execute(json!({"shell_id": shell_id}), &ctx).await.unwrap();
        assert_eq!(logs["status"], "completed");
    }

    #[tokio::test]
    async fn unknown_shell_and_missing_args() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let err = BashLogsTool.execute(json!({"shell_id": "nope"}), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("Shell not found: nope"));
        let err = BashKillTool.execute(json!({"shell_id": "nope"}), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("Shell not found: nope"));
        assert!(matches!(
            BashRunTool.execute(json!({}), &ctx).await,
            Err(ToolError::InvalidArguments(_))
        ));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(MAX_OUTPUT_BYTES);
        let out = truncate(&text);
        assert!(out.contains("[truncated:"));
        assert_eq!(truncate("short"), "short");
    }
}
