//! Python code execution in the artifact directory.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{Tool, ToolContext};

const MAX_OUTPUT_CHARS: usize = 10_000;

/// Scripts are kept here, inside the artifact dir, for later inspection.
const SCRIPT_DIR: &str = ".scripts";

/// Sanitize process output to be safe for LLM consumption.
/// Removes binary garbage while preserving valid text.
fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable_count = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    // More than 10% non-printable (excluding newlines/tabs) is likely binary
    if bytes.len() > 100 && non_printable_count > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable. \
            Write binary results to a file instead of printing them.]",
            bytes.len(),
            non_printable_count * 100 / bytes.len()
        );
    }

    let text = String::from_utf8_lossy(bytes);

    // Keep: newlines, tabs, carriage returns
    text.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || (c >= ' ' && c != '\u{FFFD}'))
        .collect()
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(idx);
        text.push_str("\n... [output truncated]");
    }
}

async fn run_script(
    python_bin: &str,
    script: &Path,
    cwd: &Path,
    timeout: Duration,
) -> anyhow::Result<Output> {
    let mut cmd = Command::new(python_bin);
    cmd.arg(script)
        .current_dir(cwd)
        .env("ARTIFACT_DIR", cwd)
        // Charts must be written to files; there is no display to show them on.
        .env("MPLBACKEND", "Agg")
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to start {}: {}", python_bin, e))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(anyhow::anyhow!("Failed to run script: {}", e)),
        Err(_) => Err(anyhow::anyhow!(
            "Code execution timed out after {} seconds. Split the work into smaller steps or save partial results to files.",
            timeout.as_secs_f64()
        )),
    }
}

fn format_output(output: &Output) -> String {
    let stdout = sanitize_output(&output.stdout);
    let stderr = sanitize_output(&output.stderr);
    let exit_code = output.status.code().unwrap_or(-1);

    let mut result = format!("Exit code: {}\n", exit_code);

    if exit_code != 0 && !stdout.is_empty() {
        result.push_str("Note: Non-zero exit code but output was produced. Verify that expected output files exist.\n");
    }
    if stdout.is_empty() && stderr.is_empty() {
        result.push_str("(no output)\n");
    }
    if !stdout.is_empty() {
        result.push_str("\n--- stdout ---\n");
        result.push_str(&stdout);
    }
    if !stderr.is_empty() {
        result.push_str("\n--- stderr ---\n");
        result.push_str(&stderr);
    }

    truncate_chars(&mut result, MAX_OUTPUT_CHARS);
    result
}

/// Run a Python program with the artifact directory as working directory.
pub struct ExecutePythonCode {
    python_bin: String,
    timeout: Duration,
}

impl ExecutePythonCode {
    pub fn new(python_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Tool for ExecutePythonCode {
    fn name(&self) -> &str {
        "execute_python_code"
    }

    fn description(&self) -> &str {
        "Execute a complete Python program. The working directory is the artifact directory, so relative paths land there. Print what you need to see; save data and charts to files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Full Python source to run."
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let code = args["code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'code' argument"))?;

        // The child runs with the artifact dir as cwd, so pass absolute paths.
        let artifact_dir = if ctx.artifact_dir.is_absolute() {
            ctx.artifact_dir.clone()
        } else {
            std::env::current_dir()?.join(&ctx.artifact_dir)
        };
        let script_dir = artifact_dir.join(SCRIPT_DIR);
        tokio::fs::create_dir_all(&script_dir).await?;
        let script = script_dir.join(format!("{}.py", uuid::Uuid::new_v4()));
        tokio::fs::write(&script, code).await?;

        tracing::info!(
            thread = %ctx.thread_id,
            "Executing Python script {} ({} bytes)",
            script.display(),
            code.len()
        );

        let output = run_script(&self.python_bin, &script, &artifact_dir, self.timeout).await?;

        tracing::debug!(
            "Script completed: exit={:?}, stdout_len={}, stderr_len={}",
            output.status.code(),
            output.stdout.len(),
            output.stderr.len()
        );

        Ok(format_output(&output))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::threads::ThreadId;

    // `sh` stands in for the interpreter: it runs the script file the same way.
    fn tool(timeout: Duration) -> ExecutePythonCode {
        ExecutePythonCode::new("sh", timeout)
    }

    #[tokio::test]
    async fn test_runs_in_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), ThreadId::new("t"));
        let out = tool(Duration::from_secs(10))
            .execute(json!({"code": "echo rows > data.csv; echo saved"}), &ctx)
            .await
            .unwrap();

        assert!(out.starts_with("Exit code: 0"));
        assert!(out.contains("--- stdout ---\nsaved"));
        assert!(dir.path().join("data.csv").exists());
        assert!(dir.path().join(SCRIPT_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_reports_failure_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), ThreadId::new("t"));
        let out = tool(Duration::from_secs(10))
            .execute(json!({"code": "echo broken >&2; exit 3"}), &ctx)
            .await
            .unwrap();
        assert!(out.starts_with("Exit code: 3"));
        assert!(out.contains("--- stderr ---\nbroken"));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path(), ThreadId::new("t"));
        let err = tool(Duration::from_millis(200))
            .execute(json!({"code": "sleep 5"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_sanitize_and_truncate() {
        assert_eq!(sanitize_output(b"ok\x00\n"), "ok\n");
        let binary = vec![0u8; 200];
        assert!(sanitize_output(&binary).starts_with("[Binary output detected"));

        let mut long = "é".repeat(20);
        truncate_chars(&mut long, 5);
        assert!(long.starts_with("ééééé\n... [output truncated]"));
    }
}
