//! Subprocess-backed toolchain.
//!
//! This module provides [`ProcessToolchain`], which writes each module to its
//! own temporary directory and runs the toolchain binaries with
//! `tokio::process`. Children are spawned with `kill_on_drop`, so a timeout
//! or a cancellation never leaves a toolchain process behind.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    merge_flags, RunRequest, Stage, StageRecord, Toolchain, ToolchainError, ToolchainPaths,
    ToolchainResult,
};

/// File name of the module inside the scratch directory.
const MODULE_FILE_NAME: &str = "module.x";

/// Runs the DSLX binaries as local subprocesses.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use std::time::Duration;
/// use dslx_eval_toolchain::{ModuleSource, ProcessToolchain, RunRequest, Toolchain, ToolchainPaths};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), dslx_eval_toolchain::ToolchainError> {
/// let paths = ToolchainPaths::from_tools_dir(Path::new("/opt/xlsynth"), None);
/// let toolchain = ProcessToolchain::new(paths).with_interpreter_flags(vec!["--compare=jit".into()]);
///
/// let module = ModuleSource::new("fn id(x: u32) -> u32 { x }\n#[test]\nfn t() { assert_eq(id(u32:1), u32:1) }\n");
/// let request = RunRequest::new(module, Duration::from_secs(60));
/// let result = toolchain.run(&request, &CancellationToken::new()).await?;
/// println!("{}", result.outcome);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    paths: ToolchainPaths,
    typecheck_flags: Vec<String>,
    interpreter_flags: Vec<String>,
}

impl ProcessToolchain {
    /// Creates a toolchain with no extra flags.
    #[must_use]
    pub const fn new(paths: ToolchainPaths) -> Self {
        Self {
            paths,
            typecheck_flags: Vec::new(),
            interpreter_flags: Vec::new(),
        }
    }

    /// Sets flags passed to every type checker invocation.
    #[must_use]
    pub fn with_typecheck_flags(mut self, flags: Vec<String>) -> Self {
        self.typecheck_flags = flags;
        self
    }

    /// Sets flags passed to every interpreter invocation, before any
    /// sample-declared flags.
    #[must_use]
    pub fn with_interpreter_flags(mut self, flags: Vec<String>) -> Self {
        self.interpreter_flags = flags;
        self
    }

    /// Returns the configured paths.
    #[must_use]
    pub const fn paths(&self) -> &ToolchainPaths {
        &self.paths
    }

    /// Runs one binary against the module and captures its output.
    #[instrument(skip(self, binary, flags, module, cancel), fields(binary = %binary.display()))]
    async fn run_stage(
        &self,
        stage: Stage,
        binary: &Path,
        flags: &[String],
        module: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StageRecord, ToolchainError> {
        let mut argv = vec![
            binary.display().to_string(),
            module.display().to_string(),
            "--dslx_stdlib_path".to_string(),
            self.paths.stdlib.display().to_string(),
        ];
        argv.extend(flags.iter().cloned());
        let command_line = shell_words::join(&argv);

        let mut command = Command::new(binary);
        command
            .args(&argv[1..])
            .current_dir(module.parent().unwrap_or_else(|| Path::new(".")))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %command_line, "Spawning toolchain stage");
        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| ToolchainError::spawn(binary, e))?;

        let waited = tokio::select! {
            () = cancel.cancelled() => {
                info!(%stage, "Toolchain stage cancelled");
                return Err(ToolchainError::Cancelled);
            }
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => waited,
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let record = match waited {
            Ok(output) => {
                let output = output?;
                StageRecord {
                    stage,
                    command: command_line,
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration_ms,
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(%stage, timeout_secs = timeout.as_secs(), "Toolchain stage timed out");
                StageRecord {
                    stage,
                    command: command_line,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("{stage} timed out after {}ms", timeout.as_millis()),
                    duration_ms,
                    timed_out: true,
                }
            }
        };

        debug!(
            %stage,
            exit_code = ?record.exit_code,
            duration_ms = record.duration_ms,
            "Toolchain stage finished"
        );
        Ok(record)
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolchainResult, ToolchainError> {
        let started_at = Utc::now();

        // Removed when dropped, including on every early return below.
        let scratch = tempfile::Builder::new().prefix("dslx-eval-").tempdir()?;
        let module_path = scratch.path().join(MODULE_FILE_NAME);
        tokio::fs::write(&module_path, request.module.as_str()).await?;

        let typecheck = self
            .run_stage(
                Stage::Typecheck,
                &self.paths.typecheck,
                &self.typecheck_flags,
                &module_path,
                request.timeout,
                cancel,
            )
            .await?;

        let interpreter = if typecheck.succeeded() && !request.typecheck_only {
            let flags = merge_flags(&self.interpreter_flags, &request.interpreter_flags);
            Some(
                self.run_stage(
                    Stage::Interpreter,
                    &self.paths.interpreter,
                    &flags,
                    &module_path,
                    request.timeout,
                    cancel,
                )
                .await?,
            )
        } else {
            None
        };

        let result = ToolchainResult::from_stages(typecheck, interpreter, started_at);
        info!(outcome = %result.outcome, "Toolchain run finished");

        scratch.close()?;
        Ok(result)
    }
}
