//! Shell execution tool. Intentionally unsandboxed; the daemon refuses to
//! start as root unless the `unsafe` flag is set (checked at startup, not
//! here).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::tools::{tool_err, tool_ok, Tool};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 600;
const MAX_OUTPUT_BYTES: usize = 100_000;

pub struct BashTool {
    working_dir: String,
    background: Mutex<HashMap<u32, tokio::process::Child>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BashArgs {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    working_dir: Option<String>,
}

impl BashTool {
    pub fn new(working_dir: Option<String>) -> Self {
        Self {
            working_dir: working_dir.unwrap_or_else(|| ".".to_string()),
            background: Mutex::new(HashMap::new()),
        }
    }

    async fn run_foreground(&self, command: &str, cwd: &str, timeout_secs: u64) -> Value {
        info!("bash: {} (cwd: {}, timeout: {}s)", command, cwd, timeout_secs);
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(command)
                .current_dir(cwd)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let stdout = truncate_output(&output.stdout);
                let stderr = truncate_output(&output.stderr);
                let exit_code = output.status.code().unwrap_or(-1);
                json!({
                    "success": exit_code == 0,
                    "exit_code": exit_code,
                    "stdout": stdout,
                    "stderr": stderr,
                })
            }
            Ok(Err(e)) => tool_err(format!("Failed to execute command: {e}")),
            Err(_) => tool_err(format!("Command timed out after {timeout_secs} seconds")),
        }
    }

    fn spawn_background(&self, command: &str, cwd: &str) -> Value {
        let spawned = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                let Some(pid) = child.id() else {
                    return tool_err("Background process exited before it could be tracked");
                };
                info!("bash background: {} (pid {})", command, pid);
                self.background.lock().unwrap().insert(pid, child);
                tool_ok(json!({ "pid": pid }))
            }
            Err(e) => tool_err(format!("Failed to spawn: {e}")),
        }
    }

    fn kill_background(&self, pid: u32) -> Value {
        let mut jobs = self.background.lock().unwrap();
        match jobs.get_mut(&pid) {
            Some(child) => match child.start_kill() {
                Ok(()) => {
                    jobs.remove(&pid);
                    tool_ok(json!({ "killed": pid }))
                }
                Err(e) => tool_err(format!("Failed to kill pid {pid}: {e}")),
            },
            None => tool_err(format!("No background job with pid {pid}")),
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn capability(&self) -> String {
        "bash(command, timeout_secs?, working_dir?) -> {success, exit_code, stdout, stderr}\n\
         bash(op: \"background\", command) -> {success, pid}\n\
         bash(op: \"kill\", pid) -> {success, killed}\n\
         Runs a shell command via /bin/sh -c. No sandbox; full host access. \
         success is false when the command exits non-zero."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["command"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let args: BashArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return Ok(tool_err(format!("Invalid arguments: {e}"))),
        };
        let cwd = args.working_dir.as_deref().unwrap_or(&self.working_dir);

        match args.op.as_deref().unwrap_or("run") {
            "run" => {
                let Some(command) = args.command.as_deref() else {
                    return Ok(tool_err("Missing required 'command'"));
                };
                let timeout = args
                    .timeout_secs
                    .unwrap_or(DEFAULT_TIMEOUT_SECS)
                    .min(MAX_TIMEOUT_SECS);
                Ok(self.run_foreground(command, cwd, timeout).await)
            }
            "background" => {
                let Some(command) = args.command.as_deref() else {
                    return Ok(tool_err("Missing required 'command'"));
                };
                Ok(self.spawn_background(command, cwd))
            }
            "kill" => {
                let Some(pid) = args.pid else {
                    return Ok(tool_err("Missing required 'pid'"));
                };
                Ok(self.kill_background(pid))
            }
            other => Ok(tool_err(format!(
                "Unknown op '{other}'; expected run, background, or kill"
            ))),
        }
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).to_string();
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::is_failure;

    #[tokio::test]
    async fn test_run_success() {
        let tool = BashTool::new(Some("/tmp".to_string()));
        let result = tool.run(json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["exit_code"], json!(0));
        assert!(result["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let tool = BashTool::new(None);
        let result = tool.run(json!({"command": "exit 3"})).await.unwrap();
        assert!(is_failure(&result));
        assert_eq!(result["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let tool = BashTool::new(None);
        let result = tool.run(json!({})).await.unwrap();
        assert!(is_failure(&result));
    }

    #[tokio::test]
    async fn test_timeout() {
        let tool = BashTool::new(None);
        let result = tool
            .run(json!({"command": "sleep 5", "timeout_secs": 1}))
            .await
            .unwrap();
        assert!(is_failure(&result));
        assert!(result["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_background_and_kill() {
        let tool = BashTool::new(None);
        let result = tool
            .run(json!({"op": "background", "command": "sleep 30"}))
            .await
            .unwrap();
        assert_eq!(result["success"], json!(true));
        let pid = result["pid"].as_u64().unwrap() as u32;

        let killed = tool.run(json!({"op": "kill", "pid": pid})).await.unwrap();
        assert_eq!(killed["killed"], json!(pid));

        let again = tool.run(json!({"op": "kill", "pid": pid})).await.unwrap();
        assert!(is_failure(&again));
    }

    #[tokio::test]
    async fn test_positional_command() {
        // The registry maps ["echo hi"] onto the command key before run();
        // verify the scalar path works end to end through normalize.
        let tool = BashTool::new(None);
        let args = crate::tools::args::normalize(&json!(["echo hi"]), tool.positional_keys());
        let result = tool.run(args).await.unwrap();
        assert!(result["stdout"].as_str().unwrap().contains("hi"));
    }
}
