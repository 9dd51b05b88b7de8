//! On-disk record of every attempt.
//!
//! With `artifactsDir` set, each pair gets a directory
//! `<artifactsDir>/<model>/<sample>/` holding, per attempt N:
//!
//! - `attempt-N.reply.md`: the raw model reply
//! - `attempt-N.x`: the assembled module, when code was found
//! - `attempt-N.<stage>.stdout` / `.stderr`: output of each toolchain stage
//! - `attempt-N.json`: outcome and exit codes
//!
//! plus `conversation.json` with the final transcript.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{EvalError, Result};
use crate::retry::{Attempt, SampleRun};

/// Summary written next to each attempt.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttemptSummary<'a> {
    index: u32,
    outcome: String,
    stages: Vec<StageSummary<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageSummary<'a> {
    stage: String,
    command: &'a str,
    exit_code: Option<i32>,
    timed_out: bool,
    duration_ms: u64,
}

/// Writes per-attempt files under a root directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    /// Creates a writer rooted at `root`. Nothing is created until a write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the directory used for a pair.
    #[must_use]
    pub fn pair_dir(&self, model_id: &str, sample_id: &str) -> PathBuf {
        self.root
            .join(path_component(model_id))
            .join(path_component(sample_id))
    }

    /// Writes every attempt of a finished pair.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::ReportWriteError` if a directory or file cannot be
    /// written.
    pub async fn write_run(&self, run: &SampleRun) -> Result<PathBuf> {
        let dir = self.pair_dir(&run.model_id, &run.sample_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EvalError::report_write(&dir, e.to_string()))?;

        for attempt in &run.attempts {
            write_attempt(&dir, attempt).await?;
        }

        let conversation = serde_json::to_string_pretty(&run.conversation)?;
        write_file(&dir.join("conversation.json"), conversation).await?;

        debug!(dir = %dir.display(), attempts = run.attempts.len(), "Artifacts written");
        Ok(dir)
    }
}

async fn write_attempt(dir: &Path, attempt: &Attempt) -> Result<()> {
    let prefix = format!("attempt-{}", attempt.index);

    write_file(&dir.join(format!("{prefix}.reply.md")), attempt.candidate.clone()).await?;
    if let Some(module) = &attempt.module {
        write_file(&dir.join(format!("{prefix}.x")), module.as_str().to_string()).await?;
    }

    let stages: Vec<_> = attempt
        .result
        .toolchain()
        .map(|result| {
            std::iter::once(&result.typecheck)
                .chain(result.interpreter.as_ref())
                .collect()
        })
        .unwrap_or_default();

    for stage in &stages {
        let name = stage.stage.to_string();
        write_file(&dir.join(format!("{prefix}.{name}.stdout")), stage.stdout.clone()).await?;
        write_file(&dir.join(format!("{prefix}.{name}.stderr")), stage.stderr.clone()).await?;
    }

    let summary = AttemptSummary {
        index: attempt.index,
        outcome: attempt.result.outcome().to_string(),
        stages: stages
            .iter()
            .map(|s| StageSummary {
                stage: s.stage.to_string(),
                command: &s.command,
                exit_code: s.exit_code,
                timed_out: s.timed_out,
                duration_ms: s.duration_ms,
            })
            .collect(),
    };
    write_file(
        &dir.join(format!("{prefix}.json")),
        serde_json::to_string_pretty(&summary)?,
    )
    .await
}

async fn write_file(path: &Path, contents: String) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| EvalError::report_write(path, e.to_string()))
}

/// Makes an id safe to use as a single path component.
fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
