//! DSLX Evaluation Harness
//!
//! Asks models to implement DSLX functions, checks every candidate with the
//! XLS toolchain, feeds diagnostics back until the candidate passes or the
//! attempt budget runs out, and optionally has a critic model judge
//! structural requirements of the passing code.

pub mod artifacts;
pub mod config;
pub mod critic;
pub mod error;
pub mod extract;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod sample;
pub mod stub;
pub mod tutorial;

#[cfg(test)]
mod test_support;

pub use artifacts::ArtifactWriter;
pub use config::{
    BackoffConfig, BackoffPolicy, Config, CriticConfig, Environment, ModelConfig, ReasoningEffort,
    RequirementPolicy, ToolchainConfig, CONFIG_FILE_NAME,
};
pub use critic::{CriticEvaluator, CriticReport, CriticSettings};
pub use error::{EvalError, LlmErrorKind, Result};
pub use extract::{assemble_module, CodeExtractor, SourceFragment};
pub use model::{Completion, ModelClient, OpenAiClient};
pub use pipeline::Evaluation;
pub use prompt::{Conversation, Role, Turn, TurnKind};
pub use retry::{Attempt, AttemptResult, RetryController, RetrySettings, RetryState, SampleRun};
pub use sample::{RequirementSpec, Sample, SampleRepository};
pub use stub::{StubCheck, StubChecker, StubStatus};
pub use tutorial::{Tutorial, MAX_TUTORIAL_SIZE};
