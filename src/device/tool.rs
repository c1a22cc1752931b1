//! Runner abstraction over the vendor management tool (nvidia-smi).
//!
//! The tool's text output is treated as an unstable format. A nonzero exit
//! is returned as a [`ToolOutput`] rather than an error so callers can look
//! for "nothing to report" sentinels before deciding it failed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Default tool location inside the plugin container.
pub const DEFAULT_SMI_PATH: &str = "/host-driver/nvidia-smi";

/// Host driver libraries mounted into the plugin container.
pub const HOST_LIB_DIR: &str = "/host-lib";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {output}")]
    Failed { command: String, output: String },
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,

    /// Combined stdout and stderr.
    pub text: String,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
        }
    }

    pub fn trimmed(&self) -> &str {
        self.text.trim()
    }

    /// True if the output contains any of the given phrases.
    pub fn mentions_any(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| self.text.contains(p))
    }

    /// Convert a nonzero exit into an error.
    pub fn into_success(self, args: &[&str]) -> Result<String, ToolError> {
        if self.success {
            Ok(self.text)
        } else {
            Err(ToolError::Failed {
                command: args.join(" "),
                output: self.text.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<ToolOutput, ToolError>;
}

/// Executes nvidia-smi as a child process.
#[derive(Debug, Clone)]
pub struct SmiRunner {
    path: PathBuf,
}

impl SmiRunner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ToolRunner for SmiRunner {
    async fn run(&self, args: &[&str]) -> Result<ToolOutput, ToolError> {
        info!(tool = %self.path.display(), args = ?args, "Executing management tool");

        let library_path = match std::env::var("LD_LIBRARY_PATH") {
            Ok(existing) if !existing.is_empty() => {
                format!("/usr/lib/x86_64-linux-gnu:{HOST_LIB_DIR}:{existing}")
            }
            _ => format!("/usr/lib/x86_64-linux-gnu:{HOST_LIB_DIR}"),
        };

        let output = Command::new(&self.path)
            .args(args)
            .env("LD_LIBRARY_PATH", library_path)
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ToolError::Launch {
                path: self.path.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        debug!(
            status = %output.status,
            bytes = text.len(),
            "Management tool finished"
        );

        Ok(ToolOutput {
            success: output.status.success(),
            text,
        })
    }
}

/// A canned-response runner for exercising parsers and orchestration
/// without hardware.
///
/// Responses are keyed by the space-joined argument list. Unscripted
/// invocations fail with a "command not scripted" output.
#[derive(Debug, Default)]
pub struct ScriptedTool {
    responses: Mutex<HashMap<String, ToolOutput>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the output for an invocation.
    pub fn respond(&self, args: &[&str], output: ToolOutput) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(args.join(" "), output);
        self
    }

    /// Every invocation so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of invocations whose arguments start with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl ToolRunner for ScriptedTool {
    async fn run(&self, args: &[&str]) -> Result<ToolOutput, ToolError> {
        let key = args.join(" ");
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        let response = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();

        Ok(response.unwrap_or_else(|| ToolOutput::failed(format!("command not scripted: {key}"))))
    }
}
