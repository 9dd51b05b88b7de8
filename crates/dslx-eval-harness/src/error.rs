//! Error types for the dslx-eval harness.
//!
//! This module defines the error hierarchy for harness operations: loading
//! configuration, tutorials and samples, talking to models, extracting code
//! and driving the toolchain.

use std::path::PathBuf;

use dslx_eval_report::ReportError;
use dslx_eval_toolchain::ToolchainError;

/// A specialized `Result` type for harness operations.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Errors that can occur while evaluating samples.
///
/// Error variants are organized by subsystem and include actionable suggestions
/// where possible to help users resolve issues.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your dslx-eval.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// A required environment variable is not set.
    #[error("Environment variable {name} is not set\n\nSuggestion: {suggestion}")]
    MissingEnvironment {
        /// Name of the variable.
        name: &'static str,
        /// Actionable suggestion for the user.
        suggestion: &'static str,
    },

    // ========================================================================
    // Tutorial Loading Errors
    // ========================================================================
    /// Tutorial file was not found at the specified path.
    #[error("Tutorial not found: '{path}'\n\nSuggestion: Check the 'tutorial' field in dslx-eval.json or create the file")]
    TutorialNotFound {
        /// Path where the tutorial was expected.
        path: PathBuf,
    },

    /// Tutorial file exceeds the 100KB size limit.
    #[error("Tutorial exceeds size limit (100KB): '{path}' is {size_kb}KB\n\nSuggestion: Trim the tutorial; it is sent with every generation request")]
    TutorialTooLarge {
        /// Path to the oversized tutorial.
        path: PathBuf,
        /// Actual size in kilobytes.
        size_kb: u64,
    },

    /// Tutorial file contains non-UTF-8 content.
    #[error(
        "Tutorial has invalid encoding: '{path}'\n\nSuggestion: Convert the file to UTF-8 encoding"
    )]
    TutorialEncodingError {
        /// Path to the tutorial with encoding issues.
        path: PathBuf,
    },

    // ========================================================================
    // Sample Errors
    // ========================================================================
    /// No sample document exists for the requested id.
    #[error("Sample not found: '{id}' (looked in '{dir}')\n\nSuggestion: Run 'dslx-eval list-samples' to see available samples")]
    SampleNotFound {
        /// Requested sample id.
        id: String,
        /// Directory that was searched.
        dir: PathBuf,
    },

    /// A sample document is missing required content or is inconsistent.
    #[error("Malformed sample '{path}': {message}\n\nSuggestion: Samples need '## Prompt', '## Signature' and '## Tests' sections")]
    MalformedSample {
        /// Path to the sample document.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// A requirement id is not a bare identifier token.
    #[error("Invalid requirement id '{id}' in '{path}'\n\nSuggestion: Use letters, digits and underscores only, starting with a letter or underscore")]
    InvalidRequirementId {
        /// Path to the sample document.
        path: PathBuf,
        /// The rejected id.
        id: String,
    },

    // ========================================================================
    // Generation Errors
    // ========================================================================
    /// The model response contained no fenced block with a target language tag.
    #[error("No code block tagged {tags:?} found in model response")]
    NoCodeBlock {
        /// Language tags that were accepted.
        tags: Vec<String>,
    },

    /// Model API returned an error (authentication, rate limiting, etc.).
    #[error("LLM API error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    LlmApiError {
        /// The kind of API error.
        kind: LlmErrorKind,
        /// Detailed error message from the API.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Toolchain and Report Errors
    // ========================================================================
    /// The toolchain could not run.
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    /// Recording or rendering the scorecard failed.
    #[error(transparent)]
    Report(#[from] ReportError),

    /// Failed to write the report to disk.
    #[error("Failed to write report to '{path}': {message}\n\nSuggestion: Check write permissions and available disk space")]
    ReportWriteError {
        /// Path where the report was to be written.
        path: PathBuf,
        /// Description of the write failure.
        message: String,
    },

    // ========================================================================
    // General Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },

    /// The run was cancelled by deadline or interrupt.
    #[error("Evaluation cancelled")]
    Cancelled,
}

/// Categories of model API errors for structured error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Authentication failure (invalid API key, expired credentials).
    Authentication,
    /// Rate limit exceeded.
    RateLimit,
    /// Server error (5xx responses).
    Server,
    /// The request or response exceeded its time limit.
    Timeout,
    /// Network connectivity issues.
    Network,
    /// The request was rejected as invalid (unknown model, bad parameters).
    InvalidRequest,
    /// The response body could not be interpreted.
    MalformedResponse,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Server => write!(f, "server"),
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::MalformedResponse => write!(f, "malformed_response"),
        }
    }
}

impl LlmErrorKind {
    /// Returns a suggestion message for this error kind.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::Authentication => "Check OPENAI_API_KEY",
            Self::RateLimit => "Wait and retry, or lower 'concurrency' in dslx-eval.json",
            Self::Server => "Retry later; the model service may be experiencing issues",
            Self::Timeout => "Raise model.timeoutSeconds in dslx-eval.json",
            Self::Network => "Check your network connection and model.endpoint",
            Self::InvalidRequest => "Check the model name and model.reasoningEffort",
            Self::MalformedResponse => "Check that model.endpoint speaks the chat completions protocol",
        }
    }

    /// Returns `true` if a request failing this way may succeed when repeated.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Server | Self::Timeout | Self::Network | Self::MalformedResponse
        )
    }
}

impl EvalError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `TutorialNotFound` error.
    #[must_use]
    pub fn tutorial_not_found(path: impl Into<PathBuf>) -> Self {
        Self::TutorialNotFound { path: path.into() }
    }

    /// Creates a new `TutorialTooLarge` error.
    #[must_use]
    pub fn tutorial_too_large(path: impl Into<PathBuf>, size_kb: u64) -> Self {
        Self::TutorialTooLarge {
            path: path.into(),
            size_kb,
        }
    }

    /// Creates a new `TutorialEncodingError`.
    #[must_use]
    pub fn tutorial_encoding(path: impl Into<PathBuf>) -> Self {
        Self::TutorialEncodingError { path: path.into() }
    }

    /// Creates a new `SampleNotFound` error.
    #[must_use]
    pub fn sample_not_found(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self::SampleNotFound {
            id: id.into(),
            dir: dir.into(),
        }
    }

    /// Creates a new `MalformedSample` error.
    #[must_use]
    pub fn malformed_sample(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedSample {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRequirementId` error.
    #[must_use]
    pub fn invalid_requirement_id(path: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self::InvalidRequirementId {
            path: path.into(),
            id: id.into(),
        }
    }

    /// Creates a new `LlmApiError` with automatic suggestion based on error kind.
    #[must_use]
    pub fn llm_api_error(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        let suggestion = kind.suggestion().to_string();
        Self::LlmApiError {
            kind,
            message: message.into(),
            suggestion,
        }
    }

    /// Creates a new `ReportWriteError`.
    #[must_use]
    pub fn report_write(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ReportWriteError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns `true` if this error is transient and may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::LlmApiError { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if this error comes from sample parsing.
    #[must_use]
    pub const fn is_sample_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedSample { .. } | Self::InvalidRequirementId { .. }
        )
    }
}
