//! Analysis executors: the external computation a worker runs per job.
//!
//! The contract is `(input_path, subject_name, output_dir) -> Result<()>`:
//! populate `output_dir` with report files, or fail with an opaque error
//! whose text is recorded on the job verbatim.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinError;
use tracing::debug;

/// Maximum stderr kept in a failure message (in characters, from the end).
const MAX_STDERR_TAIL: usize = 2000;

/// Runs the analysis for one job.
///
/// Calls are treated as blocking and unbounded; no timeout is applied.
#[async_trait]
pub trait AnalysisExecutor: Send + Sync {
    async fn run(
        &self,
        input: &Path,
        subject_name: Option<&str>,
        output_dir: &Path,
    ) -> anyhow::Result<()>;
}

/// Adapts a blocking closure into an executor, run on the blocking pool.
pub struct FnExecutor<F> {
    f: Arc<F>,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Path, Option<&str>, &Path) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

#[async_trait]
impl<F> AnalysisExecutor for FnExecutor<F>
where
    F: Fn(&Path, Option<&str>, &Path) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn run(
        &self,
        input: &Path,
        subject_name: Option<&str>,
        output_dir: &Path,
    ) -> anyhow::Result<()> {
        let f = Arc::clone(&self.f);
        let input = input.to_path_buf();
        let subject_name = subject_name.map(str::to_string);
        let output_dir = output_dir.to_path_buf();

        tokio::task::spawn_blocking(move || f(&input, subject_name.as_deref(), &output_dir))
            .await
            .map_err(|e| anyhow!(join_error_message(e)))?
    }
}

/// Runs an external analyzer: `program [args…] <input> <output_dir> [<subject_name>]`.
///
/// A non-zero exit status is a failure carrying the tail of stderr.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a configured command line into program and fixed arguments.
    pub fn from_command_line(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl AnalysisExecutor for CommandExecutor {
    async fn run(
        &self,
        input: &Path,
        subject_name: Option<&str>,
        output_dir: &Path,
    ) -> anyhow::Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(input)
            .arg(output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(subject) = subject_name {
            command.arg(subject);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("failed to spawn analyzer {}", self.program))?;

        debug!(
            program = %self.program,
            status = %output.status,
            stdout_bytes = output.stdout.len(),
            "Analyzer exited"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "analyzer {} exited with {}: {}",
                self.program,
                output.status,
                tail(stderr.trim(), MAX_STDERR_TAIL)
            );
        }
        Ok(())
    }
}

/// Describe a failed blocking/async task, including the panic payload if any.
pub(crate) fn join_error_message(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("analysis task did not finish: {e}");
    }
    let payload = e.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("analysis panicked: {detail}")
}

fn tail(s: &str, max_chars: usize) -> &str {
    match s.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) if idx > 0 => &s[idx..],
        _ => s,
    }
}
