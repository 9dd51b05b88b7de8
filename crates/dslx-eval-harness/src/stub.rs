//! Sample self-check with stub implementations.
//!
//! Before spending model calls on a sample it is worth knowing the sample
//! itself is sound. Each signature gets a body that fails at run time but
//! type-checks:
//!
//! ```text
//! fn popcount(x: u32) -> u32 { fail!("unimplemented", zero!<u32>()) }
//! ```
//!
//! and the prologue, stubs and tests are put through the type checker only.

use std::time::Duration;

use dslx_eval_toolchain::{ModuleSource, RunRequest, Toolchain, ToolchainError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{EvalError, Result};
use crate::prompt;
use crate::sample::{Sample, SampleRepository};

/// Result of checking one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StubStatus {
    /// The stubbed module type-checks.
    Ok,
    /// The type checker rejected the stubbed module.
    Failed {
        /// Condensed type checker output.
        diagnostics: String,
    },
    /// The sample document could not be parsed or stubbed.
    Malformed {
        /// What is wrong with the sample.
        message: String,
    },
}

/// Check result for one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StubCheck {
    /// Sample id.
    pub sample_id: String,
    /// What happened.
    #[serde(flatten)]
    pub status: StubStatus,
}

impl StubCheck {
    /// Returns `true` if the sample type-checked.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.status, StubStatus::Ok)
    }
}

/// Builds the stub for one signature line.
///
/// A trailing `{` or `;` on the line is ignored. Functions without a return
/// type get a unit-valued `fail!`.
#[must_use]
pub fn stub_for(signature: &str) -> String {
    let signature = signature
        .trim()
        .trim_end_matches(|c: char| c == '{' || c == ';' || c.is_whitespace());

    match signature.split_once("->") {
        Some((_, return_type)) => format!(
            "{signature} {{ fail!(\"unimplemented\", zero!<{}>()) }}",
            return_type.trim()
        ),
        None => format!("{signature} {{ fail!(\"unimplemented\", ()) }}"),
    }
}

/// Builds the stubbed module for a sample.
#[must_use]
pub fn stub_module(sample: &Sample) -> ModuleSource {
    let prologue = sample.prologue.as_deref().unwrap_or("").trim();
    let stubs = sample
        .signatures
        .iter()
        .map(|s| stub_for(s))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut text = String::new();
    if !prologue.lines().any(|line| line.trim() == "import std;") {
        text.push_str("import std;\n\n");
    }
    if !prologue.is_empty() {
        text.push_str(prologue);
        text.push_str("\n\n");
    }
    text.push_str(&stubs);
    text.push_str("\n\n");
    text.push_str(sample.tests.trim_end());
    text.push('\n');
    ModuleSource::new(text)
}

/// Type-checks stubbed samples.
pub struct StubChecker<'a> {
    repository: &'a SampleRepository,
    toolchain: &'a dyn Toolchain,
    timeout: Duration,
    feedback_max_chars: usize,
}

impl<'a> StubChecker<'a> {
    /// Creates a checker.
    #[must_use]
    pub fn new(
        repository: &'a SampleRepository,
        toolchain: &'a dyn Toolchain,
        timeout: Duration,
        feedback_max_chars: usize,
    ) -> Self {
        Self {
            repository,
            toolchain,
            timeout,
            feedback_max_chars,
        }
    }

    /// Checks each sample in `ids`, in order.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Toolchain` if the toolchain cannot be started and
    /// `EvalError::Cancelled` if `cancel` fires. Sample problems are reported
    /// per sample instead.
    #[instrument(skip_all, fields(samples = ids.len()))]
    pub async fn check(&self, ids: &[String], cancel: &CancellationToken) -> Result<Vec<StubCheck>> {
        let mut checks = Vec::with_capacity(ids.len());

        for id in ids {
            let status = match self.repository.load(id) {
                Ok(sample) => self.check_sample(&sample, cancel).await?,
                Err(e) if e.is_sample_error() => {
                    warn!(sample = %id, error = %e, "Malformed sample");
                    StubStatus::Malformed {
                        message: e.to_string(),
                    }
                }
                Err(e) => return Err(e),
            };
            info!(sample = %id, ok = matches!(status, StubStatus::Ok), "Sample checked");
            checks.push(StubCheck {
                sample_id: id.clone(),
                status,
            });
        }

        Ok(checks)
    }

    async fn check_sample(&self, sample: &Sample, cancel: &CancellationToken) -> Result<StubStatus> {
        let request = RunRequest::new(stub_module(sample), self.timeout).typecheck_only();
        let result = match self.toolchain.run(&request, cancel).await {
            Ok(result) => result,
            Err(ToolchainError::Cancelled) => return Err(EvalError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        if result.outcome.is_success() {
            Ok(StubStatus::Ok)
        } else {
            Ok(StubStatus::Failed {
                diagnostics: prompt::toolchain_feedback(&result, self.feedback_max_chars),
            })
        }
    }
}
