//! # Command Worker
//!
//! Runs one external program per worker kind. Arguments may contain the
//! placeholders `{input}`, `{output}` and `{timeout}`; the program writes
//! its artifact to `{output}`. The expected artifact JSON schema is passed
//! in `FOUNDRY_ARTIFACT_SCHEMA`.
//!
//! The child is killed if the timeout elapses first.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{Worker, WorkerKind, WorkerReply};

/// Program and argument template for one worker kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        }
    }
}

/// [`Worker`] backed by external processes
#[derive(Debug, Clone)]
pub struct CommandWorker {
    commands: HashMap<WorkerKind, CommandSpec>,
    output_dir: PathBuf,
}

impl CommandWorker {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands: HashMap::new(),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_command(mut self, kind: WorkerKind, spec: CommandSpec) -> Self {
        self.commands.insert(kind, spec);
        self
    }

    fn render_args(spec: &CommandSpec, input: &str, output: &str, timeout: Duration) -> Vec<String> {
        spec.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", input)
                    .replace("{output}", output)
                    .replace("{timeout}", &timeout.as_secs().to_string())
            })
            .collect()
    }

    async fn run(
        &self,
        kind: WorkerKind,
        spec: &CommandSpec,
        input_ref: &str,
        timeout: Duration,
    ) -> Result<WorkerReply> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create worker output dir {:?}", self.output_dir))?;

        let output_path = self
            .output_dir
            .join(format!("{}-{}.json", kind.as_str(), uuid::Uuid::new_v4()));
        let output_str = output_path.to_string_lossy().to_string();
        let schema = serde_json::to_string(&kind.expected_schema().json_schema())?;

        let mut command = Command::new(&spec.program);
        command
            .args(Self::render_args(spec, input_ref, &output_str, timeout))
            .envs(&spec.env)
            .env("FOUNDRY_ARTIFACT_SCHEMA", schema)
            .env("FOUNDRY_WORKER_KIND", kind.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {} worker '{}'", kind, spec.program))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("{} worker did not exit cleanly", kind))?,
            Err(_) => {
                tracing::warn!("{} worker exceeded {:?}, killed", kind, timeout);
                return Ok(WorkerReply::timed_out());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Ok(WorkerReply::failed(format!(
                "exit status {}: {}",
                output.status,
                tail.join(" | ")
            )));
        }

        if !output_path.exists() {
            return Ok(WorkerReply::failed(format!(
                "worker exited successfully but wrote no artifact to {}",
                output_str
            )));
        }

        Ok(WorkerReply::succeeded(output_str))
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn invoke(
        &self,
        kind: WorkerKind,
        input_ref: &str,
        timeout: Duration,
    ) -> Result<WorkerReply> {
        let spec = match self.commands.get(&kind) {
            Some(spec) => spec,
            None => {
                return Ok(WorkerReply::failed(format!(
                    "no command configured for {} worker",
                    kind
                )))
            }
        };
        tracing::debug!("Invoking {} worker: {} ({})", kind, spec.program, input_ref);
        self.run(kind, spec, input_ref, timeout).await
    }
}
