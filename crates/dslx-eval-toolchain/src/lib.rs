//! dslx-eval Toolchain Runner
//!
//! Runs the external DSLX type checker and interpreter against an assembled
//! module. Every run writes the module into a fresh temporary directory and
//! invokes each binary as its own subprocess, so repeated runs of the same
//! module are independent and reproducible.
//!
//! The type checker always runs first. The interpreter only runs when the
//! type checker exits with status 0.

mod flags;
mod runner;

pub use flags::{merge_flags, parse_run_flags};
pub use runner::ProcessToolchain;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that prevent a toolchain run from producing a result.
///
/// A module that fails to type-check or whose tests fail is not an error;
/// it is reported through [`ToolchainResult::outcome`].
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// A configured binary does not exist.
    #[error("toolchain binary not found: '{path}'\n\nSuggestion: Set XLSYNTH_TOOLS to the directory containing typecheck_main and dslx_interpreter_main")]
    BinaryNotFound {
        /// Path that was checked.
        path: PathBuf,
    },

    /// The standard library directory does not exist.
    #[error("DSLX standard library not found: '{path}'\n\nSuggestion: Set DSLX_STDLIB_PATH or check that XLSYNTH_TOOLS contains xls/dslx/stdlib")]
    StdlibNotFound {
        /// Path that was checked.
        path: PathBuf,
    },

    /// A binary could not be started.
    #[error("failed to start '{binary}': {source}")]
    Spawn {
        /// Binary that failed to start.
        binary: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the module or creating the scratch directory failed.
    #[error("toolchain I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was cancelled before it finished.
    #[error("toolchain run cancelled")]
    Cancelled,

    /// A `dslx_run_flags` directive could not be parsed.
    #[error("invalid run-flags directive '{line}': {message}")]
    InvalidDirective {
        /// The offending source line.
        line: String,
        /// Why it was rejected.
        message: String,
    },
}

impl ToolchainError {
    /// Creates a new `Spawn` error.
    #[must_use]
    pub fn spawn(binary: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Spawn {
            binary: binary.into(),
            source,
        }
    }

    /// Creates a new `InvalidDirective` error.
    #[must_use]
    pub fn invalid_directive(line: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDirective {
            line: line.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the toolchain itself is unusable, as opposed to a
    /// cancelled or interrupted run.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::BinaryNotFound { .. } | Self::StdlibNotFound { .. } | Self::Spawn { .. }
        )
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Locations of the toolchain binaries and the standard library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainPaths {
    /// Type checker binary.
    pub typecheck: PathBuf,
    /// Interpreter and test runner binary.
    pub interpreter: PathBuf,
    /// Standard library search path passed as `--dslx_stdlib_path`.
    pub stdlib: PathBuf,
}

impl ToolchainPaths {
    /// File name of the type checker inside the tools directory.
    pub const TYPECHECK_BINARY: &'static str = "typecheck_main";
    /// File name of the interpreter inside the tools directory.
    pub const INTERPRETER_BINARY: &'static str = "dslx_interpreter_main";
    /// Standard library location relative to the tools directory.
    pub const STDLIB_SUBDIR: &'static str = "xls/dslx/stdlib";

    /// Resolves paths inside an installed tools directory.
    ///
    /// `stdlib_override` replaces the default `xls/dslx/stdlib` location.
    #[must_use]
    pub fn from_tools_dir(tools_dir: &Path, stdlib_override: Option<PathBuf>) -> Self {
        Self {
            typecheck: tools_dir.join(Self::TYPECHECK_BINARY),
            interpreter: tools_dir.join(Self::INTERPRETER_BINARY),
            stdlib: stdlib_override.unwrap_or_else(|| tools_dir.join(Self::STDLIB_SUBDIR)),
        }
    }

    /// Checks that both binaries and the standard library exist.
    pub fn validate(&self) -> Result<(), ToolchainError> {
        for binary in [&self.typecheck, &self.interpreter] {
            if !binary.is_file() {
                return Err(ToolchainError::BinaryNotFound {
                    path: binary.clone(),
                });
            }
        }
        if !self.stdlib.is_dir() {
            return Err(ToolchainError::StdlibNotFound {
                path: self.stdlib.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Module source and requests
// ============================================================================

/// A complete DSLX module ready to be written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSource(String);

impl ModuleSource {
    /// Wraps module text.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the module text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single request to check a module.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// The module to check.
    pub module: ModuleSource,
    /// Time limit applied to each subprocess separately.
    pub timeout: Duration,
    /// Extra interpreter flags declared by the sample.
    pub interpreter_flags: Vec<String>,
    /// Stop after the type checker.
    pub typecheck_only: bool,
}

impl RunRequest {
    /// Creates a request that type-checks and then interprets the module.
    #[must_use]
    pub const fn new(module: ModuleSource, timeout: Duration) -> Self {
        Self {
            module,
            timeout,
            interpreter_flags: Vec::new(),
            typecheck_only: false,
        }
    }

    /// Adds sample-declared interpreter flags.
    #[must_use]
    pub fn with_interpreter_flags(mut self, flags: Vec<String>) -> Self {
        self.interpreter_flags = flags;
        self
    }

    /// Restricts the run to the type checker.
    #[must_use]
    pub const fn typecheck_only(mut self) -> Self {
        self.typecheck_only = true;
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// Which binary a stage record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The type checker.
    Typecheck,
    /// The interpreter and test runner.
    Interpreter,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Typecheck => write!(f, "typecheck"),
            Self::Interpreter => write!(f, "interpreter"),
        }
    }
}

/// Captured execution of one binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Which stage ran.
    pub stage: Stage,
    /// Program and arguments, shell-quoted.
    pub command: String,
    /// Exit code, absent when the process timed out or was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the time limit was hit.
    pub timed_out: bool,
}

impl StageRecord {
    /// Returns `true` if the stage finished in time with exit code 0.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Derived outcome of a toolchain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Type check and interpretation both succeeded.
    Passed,
    /// The type checker rejected the module.
    TypeError,
    /// The interpreter exited non-zero.
    RuntimeFailure,
    /// A stage exceeded its time limit.
    Timeout,
}

impl OutcomeKind {
    /// Returns `true` for [`OutcomeKind::Passed`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::TypeError => write!(f, "type_error"),
            Self::RuntimeFailure => write!(f, "runtime_failure"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Structured result of checking one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainResult {
    /// Type checker execution.
    pub typecheck: StageRecord,
    /// Interpreter execution, absent when the type checker failed or the
    /// request was typecheck-only.
    pub interpreter: Option<StageRecord>,
    /// Derived outcome.
    pub outcome: OutcomeKind,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl ToolchainResult {
    /// Derives the outcome from the executed stages.
    #[must_use]
    pub fn from_stages(
        typecheck: StageRecord,
        interpreter: Option<StageRecord>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let outcome = if typecheck.timed_out {
            OutcomeKind::Timeout
        } else if !typecheck.succeeded() {
            OutcomeKind::TypeError
        } else {
            match &interpreter {
                Some(record) if record.timed_out => OutcomeKind::Timeout,
                Some(record) if !record.succeeded() => OutcomeKind::RuntimeFailure,
                _ => OutcomeKind::Passed,
            }
        };

        Self {
            typecheck,
            interpreter,
            outcome,
            started_at,
        }
    }

    /// Returns the record of the stage that decided a non-passing outcome.
    #[must_use]
    pub fn failing_stage(&self) -> Option<&StageRecord> {
        match self.outcome {
            OutcomeKind::Passed => None,
            OutcomeKind::TypeError => Some(&self.typecheck),
            OutcomeKind::RuntimeFailure | OutcomeKind::Timeout => {
                self.interpreter.as_ref().filter(|r| !r.succeeded()).or(Some(&self.typecheck))
            }
        }
    }
}

// ============================================================================
// Toolchain trait
// ============================================================================

/// Checks assembled modules.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Type-checks and (unless the request says otherwise) interprets the module.
    ///
    /// Cancelling `cancel` kills any running subprocess and returns
    /// [`ToolchainError::Cancelled`].
    async fn run(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<ToolchainResult, ToolchainError>;
}
