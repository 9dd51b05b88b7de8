//! The generate, extract, check cycle for one (sample, model) pair.
//!
//! [`RetryController`] drives a small state machine:
//!
//! ```text
//! Pending -> Generating -> Extracting -> Checking -> Passed
//!                ^             |            |
//!                |             v            v
//!                +-------- Retrying <-------+
//!
//! any non-terminal state -> Exhausted
//! ```
//!
//! Every reply that fails (no code block, type error, failing test, timeout)
//! consumes one attempt and is answered with a feedback turn. Transient model
//! errors are retried in place with backoff and never consume an attempt.

use std::time::Duration;

use dslx_eval_report::{AttemptOutcome, AuditLlmCall, FinalOutcome, LlmCallPurpose};
use dslx_eval_toolchain::{
    ModuleSource, OutcomeKind, RunRequest, Toolchain, ToolchainError, ToolchainResult,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{BackoffConfig, Config};
use crate::error::{EvalError, Result};
use crate::extract::{assemble_module, CodeExtractor, SourceFragment};
use crate::model::{Completion, ModelClient};
use crate::prompt::{self, Conversation};
use crate::sample::Sample;

// ============================================================================
// RetryState
// ============================================================================

/// State of a [`RetryController`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    /// Nothing has happened yet.
    #[default]
    Pending,
    /// Waiting for the model.
    Generating,
    /// Looking for code in the reply.
    Extracting,
    /// Running the toolchain.
    Checking,
    /// Feeding diagnostics back before the next attempt.
    Retrying,
    /// A candidate passed.
    Passed,
    /// The run ended without a passing candidate.
    Exhausted,
}

impl RetryState {
    /// Returns `true` for `Passed` and `Exhausted`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Exhausted)
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    ///
    /// `Extracting -> Retrying` covers replies without a code block.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending | Self::Retrying, Self::Generating)
            | (Self::Generating, Self::Extracting)
            | (Self::Extracting, Self::Checking | Self::Retrying)
            | (Self::Checking, Self::Passed | Self::Retrying) => true,
            (from, Self::Exhausted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Extracting => "extracting",
            Self::Checking => "checking",
            Self::Retrying => "retrying",
            Self::Passed => "passed",
            Self::Exhausted => "exhausted",
        };
        write!(f, "{s}")
    }
}

/// Current state plus the trace of every state visited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTrace {
    states: Vec<RetryState>,
}

impl StateTrace {
    /// Starts in `Pending`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            states: vec![RetryState::Pending],
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn current(&self) -> RetryState {
        self.states.last().copied().unwrap_or_default()
    }

    /// Returns every state visited, in order.
    #[must_use]
    pub fn states(&self) -> &[RetryState] {
        &self.states
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::InvalidStateTransition` if the move is not allowed.
    pub fn transition(&mut self, next: RetryState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(EvalError::invalid_transition(current, next));
        }
        self.states.push(next);
        Ok(())
    }
}

// ============================================================================
// Attempts and runs
// ============================================================================

/// What checking one reply produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttemptResult {
    /// The reply had no accepted code block; the toolchain did not run.
    NoCodeBlock,
    /// The toolchain ran once.
    Toolchain {
        /// The run result.
        result: ToolchainResult,
    },
}

impl AttemptResult {
    /// Maps the result onto the scorecard outcome kind.
    #[must_use]
    pub const fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::NoCodeBlock => AttemptOutcome::NoCodeBlock,
            Self::Toolchain { result } => match result.outcome {
                OutcomeKind::Passed => AttemptOutcome::Passed,
                OutcomeKind::TypeError => AttemptOutcome::TypeError,
                OutcomeKind::RuntimeFailure => AttemptOutcome::RuntimeFailure,
                OutcomeKind::Timeout => AttemptOutcome::Timeout,
            },
        }
    }

    /// Returns the toolchain result, if the toolchain ran.
    #[must_use]
    pub const fn toolchain(&self) -> Option<&ToolchainResult> {
        match self {
            Self::NoCodeBlock => None,
            Self::Toolchain { result } => Some(result),
        }
    }
}

/// One generate, extract, check round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// Sample this attempt belongs to.
    pub sample_id: String,
    /// 1-based attempt number.
    pub index: u32,
    /// Raw model reply.
    pub candidate: String,
    /// Extracted code, absent when no block was found.
    pub fragment: Option<SourceFragment>,
    /// Assembled module, absent when no block was found.
    pub module: Option<ModuleSource>,
    /// What checking produced.
    pub result: AttemptResult,
}

impl Attempt {
    /// Returns `true` if the toolchain accepted the module.
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self.result.outcome(), AttemptOutcome::Passed)
    }
}

/// Everything a finished pair produced.
#[derive(Debug, Clone)]
pub struct SampleRun {
    /// Sample id.
    pub sample_id: String,
    /// Model id.
    pub model_id: String,
    /// How the pair ended.
    pub final_outcome: FinalOutcome,
    /// Attempts in order.
    pub attempts: Vec<Attempt>,
    /// State machine trace.
    pub trace: StateTrace,
    /// Final transcript.
    pub conversation: Conversation,
    /// Generation calls that returned a reply. Failed transient calls are
    /// logged but not audited.
    pub llm_calls: Vec<AuditLlmCall>,
    /// Why the pair ended early, when it did.
    pub detail: Option<String>,
}

impl SampleRun {
    /// Returns `true` if the pair passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.final_outcome.is_success()
    }

    /// Returns the per-attempt outcomes.
    #[must_use]
    pub fn attempt_outcomes(&self) -> Vec<AttemptOutcome> {
        self.attempts.iter().map(|a| a.result.outcome()).collect()
    }

    /// Returns the code of the passing attempt.
    #[must_use]
    pub fn final_fragment(&self) -> Option<&SourceFragment> {
        self.attempts
            .last()
            .filter(|a| a.passed())
            .and_then(|a| a.fragment.as_ref())
    }
}

// ============================================================================
// RetryController
// ============================================================================

/// Knobs for a [`RetryController`].
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Attempt cap.
    pub max_retries: u32,
    /// In-place retries allowed for transient model errors per attempt.
    pub transient_retry_limit: u32,
    /// Delay schedule for transient retries.
    pub backoff: BackoffConfig,
    /// Pause before each retry after a failed attempt.
    pub retry_delay: Duration,
    /// Per-subprocess time limit.
    pub toolchain_timeout: Duration,
    /// Feedback length cap.
    pub feedback_max_chars: usize,
}

impl RetrySettings {
    /// Takes the relevant values from a configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            transient_retry_limit: config.model.transient_retry_limit,
            backoff: config.model.backoff,
            retry_delay: config.retry_delay(),
            toolchain_timeout: config.toolchain_timeout(),
            feedback_max_chars: config.feedback.max_chars,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a generation call gave up.
enum Abort {
    Cancelled,
    Transient(String),
    Fatal(String),
}

/// Runs one (sample, model) pair to completion.
pub struct RetryController<'a> {
    model: &'a dyn ModelClient,
    toolchain: &'a dyn Toolchain,
    extractor: &'a CodeExtractor,
    settings: &'a RetrySettings,
}

impl<'a> RetryController<'a> {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        model: &'a dyn ModelClient,
        toolchain: &'a dyn Toolchain,
        extractor: &'a CodeExtractor,
        settings: &'a RetrySettings,
    ) -> Self {
        Self {
            model,
            toolchain,
            extractor,
            settings,
        }
    }

    /// Runs the pair until it passes, runs out of attempts or is aborted.
    #[instrument(skip_all, fields(sample = %sample.id, model = %self.model.model_id()))]
    pub async fn run(&self, sample: &Sample, preamble: &str, cancel: &CancellationToken) -> SampleRun {
        let mut run = SampleRun {
            sample_id: sample.id.clone(),
            model_id: self.model.model_id().to_string(),
            final_outcome: FinalOutcome::Exhausted,
            attempts: Vec::new(),
            trace: StateTrace::new(),
            conversation: prompt::assemble(preamble, sample),
            llm_calls: Vec::new(),
            detail: None,
        };

        match self.drive(sample, cancel, &mut run).await {
            Ok((outcome, detail)) => {
                run.final_outcome = outcome;
                run.detail = detail;
            }
            Err(e) => {
                warn!(error = %e, "Retry state machine error");
                run.final_outcome = FinalOutcome::Exhausted;
                run.detail = Some(e.to_string());
            }
        }

        if !run.trace.current().is_terminal() {
            if let Err(e) = run.trace.transition(RetryState::Exhausted) {
                warn!(error = %e, "Retry state machine error");
            }
        }

        info!(
            outcome = %run.final_outcome,
            attempts = run.attempts.len(),
            "Pair finished"
        );
        run
    }

    async fn drive(
        &self,
        sample: &Sample,
        cancel: &CancellationToken,
        run: &mut SampleRun,
    ) -> Result<(FinalOutcome, Option<String>)> {
        for index in 1..=self.settings.max_retries {
            if cancel.is_cancelled() {
                run.trace.transition(RetryState::Exhausted)?;
                return Ok((FinalOutcome::Cancelled, None));
            }

            run.trace.transition(RetryState::Generating)?;
            let completion = match self.generate(&run.conversation, cancel, &mut run.llm_calls).await {
                Ok(completion) => completion,
                Err(abort) => {
                    run.trace.transition(RetryState::Exhausted)?;
                    return Ok(match abort {
                        Abort::Cancelled => (FinalOutcome::Cancelled, None),
                        Abort::Transient(message) => (FinalOutcome::TransientExhausted, Some(message)),
                        Abort::Fatal(message) => (FinalOutcome::FatalApi, Some(message)),
                    });
                }
            };
            run.conversation.push_candidate(completion.text.clone());

            run.trace.transition(RetryState::Extracting)?;
            let feedback = match self.extractor.extract(&completion.text) {
                Err(_) => {
                    debug!(attempt = index, "Reply has no code block");
                    run.attempts.push(Attempt {
                        sample_id: sample.id.clone(),
                        index,
                        candidate: completion.text,
                        fragment: None,
                        module: None,
                        result: AttemptResult::NoCodeBlock,
                    });
                    prompt::no_code_feedback(self.extractor.tags())
                }
                Ok(fragment) => {
                    let module = assemble_module(sample.prologue.as_deref(), &fragment, &sample.tests);
                    run.trace.transition(RetryState::Checking)?;

                    let request = RunRequest::new(module.clone(), self.settings.toolchain_timeout)
                        .with_interpreter_flags(sample.interpreter_flags.clone());
                    let result = match self.toolchain.run(&request, cancel).await {
                        Ok(result) => result,
                        Err(ToolchainError::Cancelled) => {
                            run.trace.transition(RetryState::Exhausted)?;
                            return Ok((FinalOutcome::Cancelled, None));
                        }
                        Err(e) => {
                            warn!(error = %e, "Toolchain unavailable");
                            run.trace.transition(RetryState::Exhausted)?;
                            return Ok((FinalOutcome::ToolchainUnavailable, Some(e.to_string())));
                        }
                    };

                    info!(attempt = index, outcome = %result.outcome, "Attempt checked");
                    let passed = result.outcome.is_success();
                    let feedback = prompt::toolchain_feedback(&result, self.settings.feedback_max_chars);
                    run.attempts.push(Attempt {
                        sample_id: sample.id.clone(),
                        index,
                        candidate: completion.text,
                        fragment: Some(fragment),
                        module: Some(module),
                        result: AttemptResult::Toolchain { result },
                    });

                    if passed {
                        run.trace.transition(RetryState::Passed)?;
                        return Ok((FinalOutcome::Passed, None));
                    }
                    feedback
                }
            };

            if index == self.settings.max_retries {
                break;
            }

            run.trace.transition(RetryState::Retrying)?;
            run.conversation.push_feedback(feedback);

            if !self.settings.retry_delay.is_zero() && !sleep_or_cancel(self.settings.retry_delay, cancel).await {
                run.trace.transition(RetryState::Exhausted)?;
                return Ok((FinalOutcome::Cancelled, None));
            }
        }

        run.trace.transition(RetryState::Exhausted)?;
        Ok((FinalOutcome::Exhausted, None))
    }

    /// Calls the model, retrying transient errors in place.
    async fn generate(
        &self,
        conversation: &Conversation,
        cancel: &CancellationToken,
        calls: &mut Vec<AuditLlmCall>,
    ) -> std::result::Result<Completion, Abort> {
        let mut failures = 0;
        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(Abort::Cancelled),
                result = self.model.generate(conversation) => result,
            };

            match result {
                Ok(completion) => {
                    calls.push(AuditLlmCall::new(
                        self.model.model_id(),
                        LlmCallPurpose::Generation,
                        completion.prompt_tokens,
                        completion.completion_tokens,
                        completion.duration_ms,
                    ));
                    return Ok(completion);
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > self.settings.transient_retry_limit {
                        warn!(error = %e, failures, "Transient retry limit reached");
                        return Err(Abort::Transient(e.to_string()));
                    }
                    let delay = self.settings.backoff.delay_for(failures);
                    warn!(error = %e, failures, delay_ms = delay.as_millis(), "Transient model error, backing off");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(Abort::Cancelled);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Fatal model error");
                    return Err(Abort::Fatal(e.to_string()));
                }
            }
        }
    }
}

/// Sleeps for `delay`. Returns `false` if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
