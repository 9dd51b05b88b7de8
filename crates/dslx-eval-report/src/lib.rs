//! dslx-eval Report Generation
//!
//! This crate provides the scorecard that collects per-sample, per-model
//! evaluation outcomes and the reports summarized from it. Reports can be
//! serialized to JSON for programmatic access or rendered to Markdown for
//! human consumption.
//!
//! # Types
//!
//! - [`Scorecard`] - Append-only collection of [`ScorecardEntry`] values for one run
//! - [`Report`] - The summary produced by [`Scorecard::summarize`]
//! - [`ModelSummary`] - Pass rates and attempt statistics for one model
//! - [`RequirementSummary`] - Critic verdict aggregate for one requirement id
//! - [`AuditLlmCall`] - Token and latency record of a single model call
//!
//! # Generators
//!
//! - [`json::JsonGenerator`] - Generate JSON reports with compact or pretty formatting
//! - [`MarkdownGenerator`] - Generate human-readable Markdown reports
//!
//! # Example
//!
//! ```rust
//! use dslx_eval_report::{AttemptOutcome, FinalOutcome, Scorecard, ScorecardEntry};
//! use dslx_eval_report::json::JsonGenerator;
//!
//! let mut scorecard = Scorecard::new();
//! let entry = ScorecardEntry::builder()
//!     .sample_id("adder")
//!     .model_id("gpt-4o")
//!     .attempt(AttemptOutcome::TypeError)
//!     .attempt(AttemptOutcome::Passed)
//!     .final_outcome(FinalOutcome::Passed)
//!     .build()
//!     .unwrap();
//! scorecard.record(entry).unwrap();
//!
//! let report = scorecard.summarize();
//! assert_eq!(report.models[0].passed, 1);
//!
//! let json = JsonGenerator::new(&report).generate_pretty().unwrap();
//! assert!(json.contains("adder"));
//! ```

pub mod json;
mod markdown;
mod scorecard;

pub use markdown::MarkdownGenerator;
pub use scorecard::Scorecard;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while recording results or generating reports.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Failed to serialize the report to JSON.
    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to read or write report files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid report data.
    #[error("invalid report data: {0}")]
    InvalidData(String),

    /// A (sample, model) pair was recorded twice.
    #[error("sample '{sample_id}' was already recorded for model '{model_id}'")]
    DuplicateEntry {
        /// Sample identifier of the rejected entry.
        sample_id: String,
        /// Model identifier of the rejected entry.
        model_id: String,
    },
}

/// Result type for report operations.
pub type Result<T> = std::result::Result<T, ReportError>;

// ============================================================================
// FinalOutcome
// ============================================================================

/// Final outcome of evaluating one sample against one model.
///
/// `Passed` is the only success. `Exhausted`, `TransientExhausted` and
/// `Cancelled` all mean the pair ran out of budget, each with its own reason
/// code. The remaining kinds abort the pair before the budget was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    /// The toolchain accepted a candidate and all tests passed.
    Passed,
    /// Every attempt failed to type-check, pass its tests, or produce code.
    #[default]
    Exhausted,
    /// Transient model API failures exceeded the in-place retry limit.
    TransientExhausted,
    /// The run deadline or an interrupt stopped the pair.
    Cancelled,
    /// The model API rejected the request permanently.
    FatalApi,
    /// The sample document could not be parsed.
    MalformedSample,
    /// A toolchain binary could not be started.
    ToolchainUnavailable,
}

impl FinalOutcome {
    /// All outcome kinds in display order.
    pub const ALL: [Self; 7] = [
        Self::Passed,
        Self::Exhausted,
        Self::TransientExhausted,
        Self::Cancelled,
        Self::FatalApi,
        Self::MalformedSample,
        Self::ToolchainUnavailable,
    ];

    /// Returns `true` if the pair passed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Returns `true` if the pair ended by spending a retry budget.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::Exhausted | Self::TransientExhausted | Self::Cancelled
        )
    }

    /// Stable machine-readable reason code.
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Exhausted => "exhausted",
            Self::TransientExhausted => "transient_exhausted",
            Self::Cancelled => "cancelled",
            Self::FatalApi => "fatal_api",
            Self::MalformedSample => "malformed_sample",
            Self::ToolchainUnavailable => "toolchain_unavailable",
        }
    }

    /// Returns a human-readable description of the outcome.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Passed => "Passed",
            Self::Exhausted => "Retry budget exhausted",
            Self::TransientExhausted => "Model API kept failing transiently",
            Self::Cancelled => "Cancelled before completion",
            Self::FatalApi => "Model API rejected the request",
            Self::MalformedSample => "Malformed sample",
            Self::ToolchainUnavailable => "Toolchain unavailable",
        }
    }
}

impl std::fmt::Display for FinalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason_code())
    }
}

// ============================================================================
// AttemptOutcome (local copy to avoid cross-crate dependency)
// ============================================================================

/// Outcome of a single generation attempt.
///
/// Mirrors the toolchain outcome kinds plus the extraction failure, so the
/// report crate does not depend on the toolchain crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Type check and tests succeeded.
    Passed,
    /// The type checker rejected the module.
    TypeError,
    /// The interpreter reported a failing test or explicit failure.
    RuntimeFailure,
    /// A toolchain stage exceeded its time limit.
    Timeout,
    /// The response contained no usable code block.
    NoCodeBlock,
}

impl AttemptOutcome {
    /// Short label used in tables.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::TypeError => "type_error",
            Self::RuntimeFailure => "runtime_failure",
            Self::Timeout => "timeout",
            Self::NoCodeBlock => "no_code_block",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Requirement verdicts
// ============================================================================

/// Tri-state critic verdict for a structural requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The critic judged the requirement satisfied.
    Pass,
    /// The critic judged the requirement violated.
    Fail,
    /// No reliable judgement could be obtained.
    Uncertain,
}

impl Verdict {
    /// Parses a verdict string, case-insensitively.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "uncertain" => Some(Self::Uncertain),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Uncertain => write!(f, "uncertain"),
        }
    }
}

/// Critic verdict for one requirement of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementVerdict {
    /// Identifier of the requirement.
    pub requirement_id: String,

    /// The verdict.
    pub verdict: Verdict,

    /// Confidence reported by the critic, when it reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Rationale from the critic, or the reason no verdict was obtained.
    pub rationale: String,
}

impl RequirementVerdict {
    /// Creates a verdict without a confidence value.
    #[must_use]
    pub fn new(requirement_id: impl Into<String>, verdict: Verdict, rationale: impl Into<String>) -> Self {
        Self {
            requirement_id: requirement_id.into(),
            verdict,
            confidence: None,
            rationale: rationale.into(),
        }
    }

    /// Creates an `uncertain` verdict carrying the given reason.
    #[must_use]
    pub fn uncertain(requirement_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(requirement_id, Verdict::Uncertain, reason)
    }

    /// Sets the confidence value.
    #[must_use]
    pub const fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

// ============================================================================
// AuditLlmCall
// ============================================================================

/// Which stage issued a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmCallPurpose {
    /// Candidate code generation.
    Generation,
    /// Structural requirement judgement.
    Critic,
}

impl std::fmt::Display for LlmCallPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generation => write!(f, "generation"),
            Self::Critic => write!(f, "critic"),
        }
    }
}

/// Record of a model API call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLlmCall {
    /// Model that served the call.
    pub model: String,

    /// Stage that issued the call.
    pub purpose: LlmCallPurpose,

    /// Number of prompt tokens.
    pub prompt_tokens: u32,

    /// Number of completion tokens.
    pub completion_tokens: u32,

    /// Duration of the call in milliseconds.
    pub duration_ms: u64,

    /// When the call was made.
    pub timestamp: DateTime<Utc>,
}

impl AuditLlmCall {
    /// Creates a new audit record with the current timestamp.
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        purpose: LlmCallPurpose,
        prompt_tokens: u32,
        completion_tokens: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            model: model.into(),
            purpose,
            prompt_tokens,
            completion_tokens,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    /// Returns the total token count.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

// ============================================================================
// ScorecardEntry
// ============================================================================

/// Terminal record of one (sample, model) evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorecardEntry {
    /// Sample identifier.
    pub sample_id: String,

    /// Model identifier.
    pub model_id: String,

    /// How the pair ended.
    pub final_outcome: FinalOutcome,

    /// Number of generation attempts that consumed budget.
    pub attempts_consumed: u32,

    /// Outcome of each attempt, in order.
    pub attempt_outcomes: Vec<AttemptOutcome>,

    /// Requirement ids the sample declares, in document order.
    #[serde(default)]
    pub requirement_ids: Vec<String>,

    /// Critic verdicts, present only for passing pairs.
    #[serde(default)]
    pub verdicts: Vec<RequirementVerdict>,

    /// Model calls made while evaluating the pair.
    #[serde(default)]
    pub llm_calls: Vec<AuditLlmCall>,

    /// Human-readable reason for non-passing outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ScorecardEntry {
    /// Creates a new entry builder.
    #[must_use]
    pub fn builder() -> ScorecardEntryBuilder {
        ScorecardEntryBuilder::default()
    }

    /// Returns `true` if the pair passed on its first attempt.
    #[must_use]
    pub fn passed_first_attempt(&self) -> bool {
        self.final_outcome.is_success() && self.attempts_consumed == 1
    }

    /// Returns `true` if every critic verdict is `pass`.
    #[must_use]
    pub fn all_requirements_pass(&self) -> bool {
        self.verdicts.iter().all(|v| v.verdict == Verdict::Pass)
            && self.verdicts.len() == self.requirement_ids.len()
    }
}

/// Builder for [`ScorecardEntry`].
#[derive(Debug, Clone, Default)]
pub struct ScorecardEntryBuilder {
    sample_id: Option<String>,
    model_id: Option<String>,
    final_outcome: Option<FinalOutcome>,
    attempt_outcomes: Vec<AttemptOutcome>,
    requirement_ids: Vec<String>,
    verdicts: Vec<RequirementVerdict>,
    llm_calls: Vec<AuditLlmCall>,
    detail: Option<String>,
}

impl ScorecardEntryBuilder {
    /// Sets the sample id.
    #[must_use]
    pub fn sample_id(mut self, id: impl Into<String>) -> Self {
        self.sample_id = Some(id.into());
        self
    }

    /// Sets the model id.
    #[must_use]
    pub fn model_id(mut self, id: impl Into<String>) -> Self {
        self.model_id = Some(id.into());
        self
    }

    /// Sets the final outcome.
    #[must_use]
    pub const fn final_outcome(mut self, outcome: FinalOutcome) -> Self {
        self.final_outcome = Some(outcome);
        self
    }

    /// Appends one attempt outcome.
    #[must_use]
    pub fn attempt(mut self, outcome: AttemptOutcome) -> Self {
        self.attempt_outcomes.push(outcome);
        self
    }

    /// Sets all attempt outcomes.
    #[must_use]
    pub fn attempts(mut self, outcomes: Vec<AttemptOutcome>) -> Self {
        self.attempt_outcomes = outcomes;
        self
    }

    /// Sets the declared requirement ids.
    #[must_use]
    pub fn requirement_ids(mut self, ids: Vec<String>) -> Self {
        self.requirement_ids = ids;
        self
    }

    /// Sets the critic verdicts.
    #[must_use]
    pub fn verdicts(mut self, verdicts: Vec<RequirementVerdict>) -> Self {
        self.verdicts = verdicts;
        self
    }

    /// Sets the model call audit records.
    #[must_use]
    pub fn llm_calls(mut self, calls: Vec<AuditLlmCall>) -> Self {
        self.llm_calls = calls;
        self
    }

    /// Sets the detail message.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Builds the entry.
    ///
    /// # Errors
    ///
    /// Returns [`ReportError::InvalidData`] if the sample id, model id or
    /// final outcome is missing, if a `passed` entry does not end with a
    /// passing attempt, or if verdicts exist for a non-passing entry.
    pub fn build(self) -> Result<ScorecardEntry> {
        let sample_id = self
            .sample_id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ReportError::InvalidData("entry sample_id is required".to_string()))?;
        let model_id = self
            .model_id
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ReportError::InvalidData("entry model_id is required".to_string()))?;
        let final_outcome = self
            .final_outcome
            .ok_or_else(|| ReportError::InvalidData("entry final_outcome is required".to_string()))?;

        if final_outcome.is_success() && self.attempt_outcomes.last() != Some(&AttemptOutcome::Passed) {
            return Err(ReportError::InvalidData(format!(
                "entry '{sample_id}' is passed but its last attempt did not pass"
            )));
        }
        if !final_outcome.is_success() && !self.verdicts.is_empty() {
            return Err(ReportError::InvalidData(format!(
                "entry '{sample_id}' has critic verdicts but did not pass"
            )));
        }

        let attempts_consumed = u32::try_from(self.attempt_outcomes.len())
            .map_err(|_| ReportError::InvalidData("too many attempts".to_string()))?;

        Ok(ScorecardEntry {
            sample_id,
            model_id,
            final_outcome,
            attempts_consumed,
            attempt_outcomes: self.attempt_outcomes,
            requirement_ids: self.requirement_ids,
            verdicts: self.verdicts,
            llm_calls: self.llm_calls,
            detail: self.detail,
        })
    }
}

// ============================================================================
// Report
// ============================================================================

/// Run-level metadata carried into the report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    /// Attempt cap per pair.
    pub max_retries: u32,

    /// Critic model, if requirements were judged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critic_model: Option<String>,

    /// Wall-clock duration of the run in seconds.
    pub duration_seconds: u64,
}

/// Count of pairs per final outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Pairs that passed.
    pub passed: usize,
    /// Pairs that spent the attempt budget.
    pub exhausted: usize,
    /// Pairs stopped by repeated transient API failures.
    pub transient_exhausted: usize,
    /// Pairs stopped by cancellation.
    pub cancelled: usize,
    /// Pairs aborted by a fatal API error.
    pub fatal_api: usize,
    /// Pairs whose sample could not be parsed.
    pub malformed_sample: usize,
    /// Pairs whose toolchain could not be started.
    pub toolchain_unavailable: usize,
}

impl OutcomeCounts {
    /// Adds one pair with the given outcome.
    pub fn add(&mut self, outcome: FinalOutcome) {
        let slot = match outcome {
            FinalOutcome::Passed => &mut self.passed,
            FinalOutcome::Exhausted => &mut self.exhausted,
            FinalOutcome::TransientExhausted => &mut self.transient_exhausted,
            FinalOutcome::Cancelled => &mut self.cancelled,
            FinalOutcome::FatalApi => &mut self.fatal_api,
            FinalOutcome::MalformedSample => &mut self.malformed_sample,
            FinalOutcome::ToolchainUnavailable => &mut self.toolchain_unavailable,
        };
        *slot += 1;
    }

    /// Returns the count for one outcome.
    #[must_use]
    pub const fn get(&self, outcome: FinalOutcome) -> usize {
        match outcome {
            FinalOutcome::Passed => self.passed,
            FinalOutcome::Exhausted => self.exhausted,
            FinalOutcome::TransientExhausted => self.transient_exhausted,
            FinalOutcome::Cancelled => self.cancelled,
            FinalOutcome::FatalApi => self.fatal_api,
            FinalOutcome::MalformedSample => self.malformed_sample,
            FinalOutcome::ToolchainUnavailable => self.toolchain_unavailable,
        }
    }

    /// Returns the total number of pairs.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.passed
            + self.exhausted
            + self.transient_exhausted
            + self.cancelled
            + self.fatal_api
            + self.malformed_sample
            + self.toolchain_unavailable
    }
}

/// Per-model aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Model identifier.
    pub model_id: String,

    /// Number of samples recorded for the model.
    pub samples: usize,

    /// Number of samples that passed.
    pub passed: usize,

    /// `passed / samples`, or 0 when no samples were recorded.
    pub pass_rate: f64,

    /// Number of samples that passed on their first attempt.
    pub first_attempt_passes: usize,

    /// `first_attempt_passes / samples`.
    pub first_attempt_pass_rate: f64,

    /// Mean attempts consumed among passing samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_attempts_to_pass: Option<f64>,

    /// Final outcome breakdown.
    pub outcomes: OutcomeCounts,

    /// Model calls made for generation and critique.
    pub llm_calls: usize,

    /// Tokens consumed across those calls.
    pub total_tokens: u64,
}

/// Per-requirement-id aggregate across samples that declare it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementSummary {
    /// Requirement identifier.
    pub requirement_id: String,

    /// Number of (sample, model) pairs whose sample declares the requirement.
    pub declared: usize,

    /// Pairs with a `pass` verdict.
    pub passed: usize,

    /// Pairs with a `fail` verdict.
    pub failed: usize,

    /// Pairs with an `uncertain` verdict.
    pub uncertain: usize,

    /// Pairs that never reached the critic because the code did not pass.
    pub unevaluated: usize,

    /// `passed / declared`.
    pub pass_rate: f64,
}

/// Summary of an evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    /// Run-level metadata.
    pub run: RunInfo,

    /// Per-model aggregates, sorted by model id.
    pub models: Vec<ModelSummary>,

    /// Per-requirement aggregates, sorted by requirement id.
    pub requirements: Vec<RequirementSummary>,

    /// All recorded entries, sorted by model id then sample id.
    pub entries: Vec<ScorecardEntry>,
}

impl Report {
    /// Returns `true` if every recorded pair passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.entries.iter().all(|e| e.final_outcome.is_success())
    }

    /// Returns `true` if every recorded pair passed and every declared
    /// requirement received a `pass` verdict.
    #[must_use]
    pub fn all_passed_strict(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.final_outcome.is_success() && e.all_requirements_pass())
    }

    /// Returns the number of recorded pairs.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.entries.len()
    }
}

/// Computes `numerator / denominator`, or 0 when the denominator is 0.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

// ============================================================================
// Tests
// ============================================================================
